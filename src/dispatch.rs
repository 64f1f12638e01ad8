//! Grab dispatcher and the channel operations exposed to the HTTP layer.
//!
//! `request_grab` is a compare-and-swap loop on the video's status: the
//! admissibility decision and the write to `queued` only commit together, so
//! concurrent non-forced requests on one video submit at most one job.

use std::sync::Arc;

use serde::Serialize;

use crate::error::{CoreError, CoreResult};
use crate::jobs::{Job, JobId, JobRunner};
use crate::model::{Channel, ChannelId, Video, VideoId};
use crate::service::ServiceRegistry;
use crate::state::{self, VideoStatus};
use crate::store::RecordStore;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GrabOutcome {
    pub video: Video,
    pub job_id: JobId,
    /// Set when the request carried `force`.
    pub forced: bool,
    pub previous: VideoStatus,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddedChannel {
    pub channel: Channel,
    pub job_id: JobId,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshSummary {
    pub submitted: Vec<(ChannelId, JobId)>,
    pub failed: Vec<(ChannelId, String)>,
}

#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<RecordStore>,
    services: Arc<ServiceRegistry>,
    runner: Arc<dyn JobRunner>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<RecordStore>,
        services: Arc<ServiceRegistry>,
        runner: Arc<dyn JobRunner>,
    ) -> Self {
        Self {
            store,
            services,
            runner,
        }
    }

    /// Queues a download of `video_id`.
    ///
    /// Without `force` only `new` and `grab_error` videos are admissible.
    pub async fn request_grab(&self, video_id: VideoId, force: bool) -> CoreResult<GrabOutcome> {
        loop {
            let video = self
                .store
                .get_video(video_id)
                .await?
                .ok_or_else(|| CoreError::video_not_found(video_id))?;
            let previous = video.status;

            if !previous.can_grab() && !force {
                tracing::debug!(video_id, status = %previous, "grab refused");
                return Err(CoreError::AlreadyGrabbed {
                    video_id,
                    status: previous,
                });
            }

            let Some(revision) = self.store.queue_for_grab(video_id, previous).await? else {
                // Status moved between the read and the swap; decide again.
                continue;
            };

            let job = Job::GrabVideo { video_id, force };
            let job_id = match self.runner.submit(job) {
                Ok(job_id) => job_id,
                Err(source) => {
                    self.restore_status(video_id, revision, previous).await;
                    return Err(CoreError::JobRunner {
                        job: job.name(),
                        source,
                    });
                }
            };

            tracing::info!(video_id, %previous, force, %job_id, "grab queued");
            return Ok(GrabOutcome {
                video: Video {
                    status: VideoStatus::Queued,
                    ..video
                },
                job_id,
                forced: force,
                previous,
            });
        }
    }

    /// Undoes only our own queueing. A grab queued after it, or any other
    /// status write, is kept.
    async fn restore_status(&self, video_id: VideoId, revision: i64, previous: VideoStatus) {
        match self.store.undo_queue(video_id, revision, previous).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(video_id, %previous, "status changed before rollback, left as is");
            }
            Err(err) => {
                tracing::error!(
                    video_id,
                    %previous,
                    error = %err,
                    "rollback of queued status failed"
                );
            }
        }
    }

    pub async fn mark_viewed(&self, video_id: VideoId) -> CoreResult<Video> {
        state::transition(&self.store, video_id, VideoStatus::Grabbed).await
    }

    pub async fn mark_ignored(&self, video_id: VideoId) -> CoreResult<Video> {
        state::transition(&self.store, video_id, VideoStatus::Ignore).await
    }

    /// Creates the channel and submits its first refresh.
    ///
    /// The service name is checked before anything is written. If the refresh
    /// cannot be submitted the channel stays and the error is returned.
    pub async fn add_channel(
        &self,
        chanid: &str,
        service: &str,
        title: Option<&str>,
    ) -> CoreResult<AddedChannel> {
        self.services.require(service)?;

        let channel = self
            .store
            .insert_channel(chanid, service, title)
            .await?
            .ok_or_else(|| CoreError::AlreadyExists {
                chanid: chanid.to_owned(),
                service: service.to_owned(),
            })?;
        tracing::info!(channel_id = channel.id, chanid, service, "channel added");

        let job_id = self.submit_refresh(channel.id)?;
        Ok(AddedChannel { channel, job_id })
    }

    pub async fn refresh_channel(&self, channel_id: ChannelId) -> CoreResult<JobId> {
        self.store
            .get_channel(channel_id)
            .await?
            .ok_or_else(|| CoreError::channel_not_found(channel_id))?;
        self.submit_refresh(channel_id)
    }

    /// Submits one refresh per channel. A refused submission is recorded and
    /// the remaining channels are still submitted.
    pub async fn refresh_all(&self) -> CoreResult<RefreshSummary> {
        let mut summary = RefreshSummary::default();
        for channel in self.store.list_channels().await? {
            match self.submit_refresh(channel.id) {
                Ok(job_id) => summary.submitted.push((channel.id, job_id)),
                Err(err) => summary.failed.push((channel.id, err.to_string())),
            }
        }
        Ok(summary)
    }

    pub async fn delete_channel(&self, channel_id: ChannelId) -> CoreResult<()> {
        if !self.store.delete_channel(channel_id).await? {
            return Err(CoreError::channel_not_found(channel_id));
        }
        tracing::info!(channel_id, "channel deleted");
        Ok(())
    }

    fn submit_refresh(&self, channel_id: ChannelId) -> CoreResult<JobId> {
        let job = Job::RefreshChannel { channel_id };
        let job_id = self
            .runner
            .submit(job)
            .map_err(|source| CoreError::JobRunner {
                job: job.name(),
                source,
            })?;
        tracing::info!(channel_id, %job_id, "refresh submitted");
        Ok(job_id)
    }
}
