//! Shared fixtures for the unit tests.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use tempfile::{TempDir, tempdir};

use crate::error::{JobError, ServiceError};
use crate::jobs::{Job, JobId, JobRunner};
use crate::model::{Channel, RemoteVideo};
use crate::service::{ServiceAdapter, YOUTUBE};
use crate::store::RecordStore;

pub fn remote_video(id: &str) -> RemoteVideo {
    remote_video_at(id, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
}

pub fn remote_video_at(id: &str, publishdate: DateTime<Utc>) -> RemoteVideo {
    RemoteVideo {
        external_id: id.into(),
        title: format!("Video {id}"),
        publishdate,
    }
}

/// Fresh database in a temp directory with one YouTube channel `UCsample`.
pub async fn sample_store() -> (TempDir, RecordStore, Channel) {
    let temp = tempdir().unwrap();
    let store = RecordStore::open(&temp.path().join("ytgrab.db"))
        .await
        .unwrap();
    let channel = store
        .insert_channel("UCsample", YOUTUBE, Some("Sample"))
        .await
        .unwrap()
        .unwrap();
    (temp, store, channel)
}

/// In-memory stand-in for the YouTube adapter.
#[derive(Default)]
pub struct FakeAdapter {
    listing: Mutex<Vec<RemoteVideo>>,
    listing_error: Mutex<Option<ServiceError>>,
    failing_fetches: Mutex<HashSet<String>>,
    fetches: Mutex<Vec<(String, PathBuf, bool)>>,
}

impl FakeAdapter {
    pub fn with_listing(ids: &[&str]) -> Arc<Self> {
        let adapter = Self::default();
        *adapter.listing.lock() = ids.iter().map(|id| remote_video(id)).collect();
        Arc::new(adapter)
    }

    pub fn set_title(&self, id: &str, title: &str) {
        let mut listing = self.listing.lock();
        match listing.iter_mut().find(|video| video.external_id == id) {
            Some(video) => video.title = title.into(),
            None => {
                let mut video = remote_video(id);
                video.title = title.into();
                listing.push(video);
            }
        }
    }

    pub fn fail_listing(&self, err: ServiceError) {
        *self.listing_error.lock() = Some(err);
    }

    pub fn fail_fetch(&self, id: &str) {
        self.failing_fetches.lock().insert(id.into());
    }

    pub fn fetches(&self) -> Vec<(String, PathBuf, bool)> {
        self.fetches.lock().clone()
    }
}

#[async_trait]
impl ServiceAdapter for FakeAdapter {
    fn name(&self) -> &str {
        YOUTUBE
    }

    async fn list_videos(&self, _chanid: &str) -> Result<Vec<RemoteVideo>, ServiceError> {
        if let Some(err) = self.listing_error.lock().clone() {
            return Err(err);
        }
        Ok(self.listing.lock().clone())
    }

    async fn fetch_video(
        &self,
        external_id: &str,
        dest: &Path,
        force: bool,
    ) -> Result<(), ServiceError> {
        self.fetches
            .lock()
            .push((external_id.into(), dest.to_path_buf(), force));
        if self.failing_fetches.lock().contains(external_id) {
            return Err(ServiceError::VideoUnavailable {
                service: YOUTUBE.into(),
                external_id: external_id.into(),
                reason: "stubbed failure".into(),
            });
        }
        Ok(())
    }
}

/// Job runner that only records what was submitted.
#[derive(Default)]
pub struct RecordingRunner {
    submitted: Mutex<Vec<Job>>,
    closed: Mutex<bool>,
}

impl RecordingRunner {
    pub fn jobs(&self) -> Vec<Job> {
        self.submitted.lock().clone()
    }

    pub fn close(&self) {
        *self.closed.lock() = true;
    }

    pub fn count_by_name(&self) -> HashMap<&'static str, usize> {
        let mut counts = HashMap::new();
        for job in self.submitted.lock().iter() {
            *counts.entry(job.name()).or_default() += 1;
        }
        counts
    }
}

impl JobRunner for RecordingRunner {
    fn submit(&self, job: Job) -> Result<JobId, JobError> {
        if *self.closed.lock() {
            return Err(JobError::Closed);
        }
        let mut submitted = self.submitted.lock();
        submitted.push(job);
        Ok(format!("job-{}", submitted.len()))
    }
}
