//! Error taxonomy shared by the core, the adapters and the job runner.

use thiserror::Error;

use crate::model::{ChannelId, VideoId};
use crate::state::VideoStatus;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("video {video_id} already grabbed (status {status})")]
    AlreadyGrabbed {
        video_id: VideoId,
        status: VideoStatus,
    },

    #[error("channel {chanid} already exists for service {service}")]
    AlreadyExists { chanid: String, service: String },

    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    #[error("unknown service {service:?}, expected one of: {}", .known.join(", "))]
    InvalidService { service: String, known: Vec<String> },

    #[error(transparent)]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("could not submit {job}: {source}")]
    JobRunner {
        job: &'static str,
        #[source]
        source: JobError,
    },

    #[error("record store failure: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl CoreError {
    pub fn channel_not_found(id: ChannelId) -> Self {
        Self::NotFound {
            kind: "channel",
            id: id.to_string(),
        }
    }

    pub fn video_not_found(id: VideoId) -> Self {
        Self::NotFound {
            kind: "video",
            id: id.to_string(),
        }
    }
}

/// Failures reported by a service adapter.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    #[error("service {service} unavailable: {reason}")]
    ServiceUnavailable { service: String, reason: String },

    #[error("channel {chanid} not found on {service}")]
    ChannelNotFound { service: String, chanid: String },

    #[error("video {external_id} could not be fetched from {service}: {reason}")]
    VideoUnavailable {
        service: String,
        external_id: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("job runner is shut down")]
    Closed,
}

/// Raised by the validated transition path only. Manual overrides never fail
/// this way.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("illegal transition {from} -> {to}")]
pub struct TransitionError {
    pub from: VideoStatus,
    pub to: VideoStatus,
}
