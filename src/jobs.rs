//! Named background jobs and the in-process runner that executes them.
//!
//! The core only sees [`JobRunner::submit`], which returns as soon as the job
//! is enqueued. [`WorkerPool`] is the runner used by the server: a tokio task
//! fans jobs out to at most `workers` concurrent executions and keeps a status
//! record per job.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};

use crate::error::{CoreError, CoreResult, JobError};
use crate::model::{ChannelId, VideoId};
use crate::reconcile::Reconciler;
use crate::service::ServiceRegistry;
use crate::state::{self, VideoStatus};
use crate::store::RecordStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "job", rename_all = "snake_case")]
pub enum Job {
    GrabVideo { video_id: VideoId, force: bool },
    RefreshChannel { channel_id: ChannelId },
}

impl Job {
    pub fn name(&self) -> &'static str {
        match self {
            Self::GrabVideo { .. } => "grab_video",
            Self::RefreshChannel { .. } => "refresh_channel",
        }
    }
}

pub type JobId = String;

/// Fire-and-forget submission boundary. Execution is at-least-once and in no
/// particular order.
pub trait JobRunner: Send + Sync {
    fn submit(&self, job: Job) -> Result<JobId, JobError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: JobId,
    pub job: Job,
    pub status: JobStatus,
    pub message: String,
}

/// Runs the body of each job against the store and the service adapters.
pub struct JobExecutor {
    store: Arc<RecordStore>,
    services: Arc<ServiceRegistry>,
    reconciler: Reconciler,
    downloads_root: PathBuf,
}

impl JobExecutor {
    pub fn new(
        store: Arc<RecordStore>,
        services: Arc<ServiceRegistry>,
        downloads_root: PathBuf,
    ) -> Self {
        let reconciler = Reconciler::new(store.clone(), services.clone());
        Self {
            store,
            services,
            reconciler,
            downloads_root,
        }
    }

    /// Executes `job` and returns a short human readable outcome.
    pub async fn execute(&self, job: Job) -> CoreResult<String> {
        match job {
            Job::GrabVideo { video_id, force } => self.grab_video(video_id, force).await,
            Job::RefreshChannel { channel_id } => {
                let created = self.reconciler.reconcile_by_id(channel_id).await?;
                Ok(format!("{created} new video(s)"))
            }
        }
    }

    async fn grab_video(&self, video_id: VideoId, force: bool) -> CoreResult<String> {
        let video = self
            .store
            .get_video(video_id)
            .await?
            .ok_or_else(|| CoreError::video_not_found(video_id))?;

        // Anything but `queued` means another delivery of this job already ran
        // or an operator changed the video in the meantime.
        if !state::advance(
            &self.store,
            video_id,
            VideoStatus::Queued,
            VideoStatus::Downloading,
        )
        .await?
        {
            tracing::info!(video_id, status = %video.status, "grab job skipped");
            return Ok(format!("skipped, video was {}", video.status));
        }

        let channel = self
            .store
            .get_channel(video.channel)
            .await?
            .ok_or_else(|| CoreError::channel_not_found(video.channel))?;
        let adapter = match self.services.require(&channel.service) {
            Ok(adapter) => adapter,
            Err(err) => return Err(self.mark_failed(video_id, err).await),
        };

        let dest = self
            .downloads_root
            .join(path_segment(&channel.service))
            .join(path_segment(&channel.chanid));
        match adapter.fetch_video(&video.external_id, &dest, force).await {
            Ok(()) => {
                state::advance(
                    &self.store,
                    video_id,
                    VideoStatus::Downloading,
                    VideoStatus::Grabbed,
                )
                .await?;
                Ok(format!("downloaded into {}", dest.display()))
            }
            Err(err) => Err(self.mark_failed(video_id, err.into()).await),
        }
    }

    async fn mark_failed(&self, video_id: VideoId, err: CoreError) -> CoreError {
        tracing::warn!(video_id, error = %err, "grab failed");
        if let Err(store_err) = state::advance(
            &self.store,
            video_id,
            VideoStatus::Downloading,
            VideoStatus::GrabError,
        )
        .await
        {
            tracing::error!(video_id, error = %store_err, "could not record grab failure");
        }
        err
    }
}

/// Keeps a remote identifier usable as a single directory name.
fn path_segment(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.' | '@') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.chars().all(|ch| ch == '.') {
        cleaned.replace('.', "_")
    } else {
        cleaned
    }
}

#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    jobs: Mutex<HashMap<JobId, JobRecord>>,
    counter: AtomicUsize,
    sender: Mutex<Option<mpsc::UnboundedSender<(JobId, Job)>>>,
}

impl WorkerPool {
    /// Starts the dispatch task. The returned handle resolves once the pool
    /// was closed and every accepted job has finished.
    pub fn start(executor: Arc<JobExecutor>, workers: usize) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let inner = Arc::new(PoolInner {
            jobs: Mutex::new(HashMap::new()),
            counter: AtomicUsize::new(1),
            sender: Mutex::new(Some(sender)),
        });
        let handle = tokio::spawn(run_pool(inner.clone(), executor, receiver, workers.max(1)));
        (Self { inner }, handle)
    }

    pub fn status(&self, job_id: &str) -> Option<JobRecord> {
        self.inner.jobs.lock().get(job_id).cloned()
    }

    /// Stops accepting jobs. Already queued jobs still run.
    pub fn close(&self) {
        self.inner.sender.lock().take();
    }

    fn next_job_id(&self) -> JobId {
        let id = self.inner.counter.fetch_add(1, Ordering::Relaxed);
        format!("job-{id}")
    }
}

impl JobRunner for WorkerPool {
    fn submit(&self, job: Job) -> Result<JobId, JobError> {
        let sender = self.inner.sender.lock().clone().ok_or(JobError::Closed)?;
        let job_id = self.next_job_id();
        self.inner.jobs.lock().insert(
            job_id.clone(),
            JobRecord {
                id: job_id.clone(),
                job,
                status: JobStatus::Queued,
                message: "Queued".to_string(),
            },
        );
        if sender.send((job_id.clone(), job)).is_err() {
            self.inner.jobs.lock().remove(&job_id);
            return Err(JobError::Closed);
        }
        tracing::info!(job = job.name(), %job_id, "job submitted");
        Ok(job_id)
    }
}

async fn run_pool(
    inner: Arc<PoolInner>,
    executor: Arc<JobExecutor>,
    mut receiver: mpsc::UnboundedReceiver<(JobId, Job)>,
    workers: usize,
) {
    let limit = Arc::new(Semaphore::new(workers));
    let mut running = JoinSet::new();
    while let Some((job_id, job)) = receiver.recv().await {
        let Ok(permit) = limit.clone().acquire_owned().await else {
            break;
        };
        let inner = inner.clone();
        let executor = executor.clone();
        running.spawn(async move {
            let _permit = permit;
            run_job(&inner, &executor, job_id, job).await;
        });
        while running.try_join_next().is_some() {}
    }
    while running.join_next().await.is_some() {}
}

async fn run_job(inner: &PoolInner, executor: &JobExecutor, job_id: JobId, job: Job) {
    update_job_status(inner, &job_id, JobStatus::Running, "Running");
    tracing::info!(job = job.name(), %job_id, "job started");
    match executor.execute(job).await {
        Ok(message) => {
            tracing::info!(job = job.name(), %job_id, %message, "job completed");
            update_job_status(inner, &job_id, JobStatus::Completed, &message);
        }
        Err(err) => {
            tracing::warn!(job = job.name(), %job_id, error = %err, "job failed");
            update_job_status(inner, &job_id, JobStatus::Failed, &format!("Failed: {err}"));
        }
    }
}

fn update_job_status(inner: &PoolInner, job_id: &str, status: JobStatus, message: &str) {
    if let Some(record) = inner.jobs.lock().get_mut(job_id) {
        record.status = status;
        record.message = message.to_string();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ServiceError;
    use crate::testing::{FakeAdapter, remote_video, sample_store};
    use std::time::Duration;
    use tempfile::TempDir;

    struct JobTestContext {
        _temp: TempDir,
        store: Arc<RecordStore>,
        adapter: Arc<FakeAdapter>,
        executor: Arc<JobExecutor>,
        channel_id: ChannelId,
        downloads: PathBuf,
    }

    impl JobTestContext {
        async fn new(listing: &[&str]) -> Self {
            let (temp, store, channel) = sample_store().await;
            let store = Arc::new(store);
            let adapter = FakeAdapter::with_listing(listing);
            let mut services = ServiceRegistry::new();
            services.register(adapter.clone());
            let downloads = temp.path().join("downloads");
            let executor = Arc::new(JobExecutor::new(
                store.clone(),
                Arc::new(services),
                downloads.clone(),
            ));
            Self {
                _temp: temp,
                store,
                adapter,
                executor,
                channel_id: channel.id,
                downloads,
            }
        }

        async fn video_with_status(&self, external_id: &str, status: VideoStatus) -> VideoId {
            let video = self
                .store
                .insert_video_if_absent(self.channel_id, &remote_video(external_id))
                .await
                .unwrap()
                .unwrap();
            state::transition(&self.store, video.id, status).await.unwrap();
            video.id
        }

        async fn status_of(&self, video_id: VideoId) -> VideoStatus {
            self.store.get_video(video_id).await.unwrap().unwrap().status
        }
    }

    async fn wait_for_terminal(pool: &WorkerPool, job_id: &str) -> JobRecord {
        for _ in 0..200 {
            if let Some(record) = pool.status(job_id)
                && matches!(record.status, JobStatus::Completed | JobStatus::Failed)
            {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {job_id} did not finish");
    }

    #[test]
    fn job_names_match_runner_contract() {
        assert_eq!(
            Job::GrabVideo {
                video_id: 1,
                force: false
            }
            .name(),
            "grab_video"
        );
        assert_eq!(Job::RefreshChannel { channel_id: 1 }.name(), "refresh_channel");
        let json = serde_json::to_value(Job::GrabVideo {
            video_id: 7,
            force: true,
        })
        .unwrap();
        assert_eq!(json["job"], "grab_video");
        assert_eq!(json["force"], true);
    }

    #[test]
    fn path_segment_neutralizes_separators() {
        assert_eq!(path_segment("UC_abc-123"), "UC_abc-123");
        assert_eq!(path_segment("../etc"), ".._etc");
        assert_eq!(path_segment(".."), "__");
        assert_eq!(path_segment("a/b c"), "a_b_c");
    }

    #[tokio::test]
    async fn grab_job_downloads_and_marks_grabbed() {
        let ctx = JobTestContext::new(&[]).await;
        let video_id = ctx.video_with_status("abc", VideoStatus::Queued).await;

        let message = ctx
            .executor
            .execute(Job::GrabVideo {
                video_id,
                force: true,
            })
            .await
            .unwrap();
        assert!(message.starts_with("downloaded"));
        assert_eq!(ctx.status_of(video_id).await, VideoStatus::Grabbed);

        let fetches = ctx.adapter.fetches();
        assert_eq!(fetches.len(), 1);
        assert_eq!(fetches[0].0, "abc");
        assert_eq!(fetches[0].1, ctx.downloads.join("youtube").join("UCsample"));
        assert!(fetches[0].2);
    }

    #[tokio::test]
    async fn grab_job_failure_marks_grab_error() {
        let ctx = JobTestContext::new(&[]).await;
        let video_id = ctx.video_with_status("abc", VideoStatus::Queued).await;
        ctx.adapter.fail_fetch("abc");

        let err = ctx
            .executor
            .execute(Job::GrabVideo {
                video_id,
                force: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::Service(ServiceError::VideoUnavailable { .. })
        ));
        assert_eq!(ctx.status_of(video_id).await, VideoStatus::GrabError);
    }

    #[tokio::test]
    async fn duplicate_delivery_is_skipped() {
        let ctx = JobTestContext::new(&[]).await;
        let video_id = ctx.video_with_status("abc", VideoStatus::Grabbed).await;

        let message = ctx
            .executor
            .execute(Job::GrabVideo {
                video_id,
                force: false,
            })
            .await
            .unwrap();
        assert!(message.starts_with("skipped"));
        assert_eq!(ctx.status_of(video_id).await, VideoStatus::Grabbed);
        assert!(ctx.adapter.fetches().is_empty());
    }

    #[tokio::test]
    async fn refresh_job_reconciles_channel() {
        let ctx = JobTestContext::new(&["a", "b"]).await;
        let message = ctx
            .executor
            .execute(Job::RefreshChannel {
                channel_id: ctx.channel_id,
            })
            .await
            .unwrap();
        assert_eq!(message, "2 new video(s)");
        assert_eq!(ctx.store.count_videos(ctx.channel_id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn worker_pool_tracks_job_status() {
        let ctx = JobTestContext::new(&["a"]).await;
        let (pool, handle) = WorkerPool::start(ctx.executor.clone(), 2);

        let refresh = pool
            .submit(Job::RefreshChannel {
                channel_id: ctx.channel_id,
            })
            .unwrap();
        let missing = pool
            .submit(Job::RefreshChannel { channel_id: 9999 })
            .unwrap();
        assert_ne!(refresh, missing);

        let done = wait_for_terminal(&pool, &refresh).await;
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.message, "1 new video(s)");
        let failed = wait_for_terminal(&pool, &missing).await;
        assert_eq!(failed.status, JobStatus::Failed);
        assert!(failed.message.contains("not found"));
        assert!(pool.status("job-unknown").is_none());

        pool.close();
        assert_eq!(
            pool.submit(Job::RefreshChannel {
                channel_id: ctx.channel_id
            }),
            Err(JobError::Closed)
        );
        handle.await.unwrap();
    }
}
