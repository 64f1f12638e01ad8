//! Video lifecycle.
//!
//! Two separate write paths exist:
//!
//! * [`advance`] applies one of the transitions signalled by the job runner and
//!   refuses anything outside the transition table. The write is a
//!   compare-and-swap on the stored status.
//! * [`transition`] is the manual override used by "mark viewed", "mark
//!   ignored" and forced grabs. It writes the new status whatever the current
//!   one is.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult, TransitionError};
use crate::model::{Video, VideoId};
use crate::store::RecordStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoStatus {
    New,
    Queued,
    Downloading,
    Grabbed,
    GrabError,
    Ignore,
}

impl VideoStatus {
    pub const ALL: [VideoStatus; 6] = [
        Self::New,
        Self::Queued,
        Self::Downloading,
        Self::Grabbed,
        Self::GrabError,
        Self::Ignore,
    ];

    /// Column value used by the record store.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Queued => "queued",
            Self::Downloading => "downloading",
            Self::Grabbed => "grabbed",
            Self::GrabError => "grab_error",
            Self::Ignore => "ignore",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == value)
    }

    /// A grab without `force` is only admissible from these states.
    pub fn can_grab(self) -> bool {
        matches!(self, Self::New | Self::GrabError)
    }

    /// Transition table for the validated path.
    pub fn can_advance_to(self, next: VideoStatus) -> bool {
        matches!(
            (self, next),
            (Self::New, Self::Queued)
                | (Self::GrabError, Self::Queued)
                | (Self::Queued, Self::Downloading)
                | (Self::Downloading, Self::Grabbed)
                | (Self::Downloading, Self::GrabError)
        )
    }
}

impl fmt::Display for VideoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Moves `video_id` from `from` to `to` if the pair is in the transition
/// table and the stored status still equals `from`.
///
/// Returns `Ok(false)` when the stored status had already moved on, which the
/// caller treats as losing a race rather than as a failure.
pub async fn advance(
    store: &RecordStore,
    video_id: VideoId,
    from: VideoStatus,
    to: VideoStatus,
) -> CoreResult<bool> {
    if !from.can_advance_to(to) {
        return Err(TransitionError { from, to }.into());
    }
    let swapped = store.compare_and_set_status(video_id, from, to).await?;
    if swapped {
        tracing::info!(video_id, %from, %to, "video status advanced");
    } else {
        tracing::debug!(video_id, %from, %to, "status changed concurrently, not advanced");
    }
    Ok(swapped)
}

/// Unchecked write of `status`. Used by the manual override paths.
pub async fn transition(
    store: &RecordStore,
    video_id: VideoId,
    status: VideoStatus,
) -> CoreResult<Video> {
    let video = store
        .set_status(video_id, status)
        .await?
        .ok_or_else(|| CoreError::video_not_found(video_id))?;
    tracing::info!(video_id, %status, "video status overridden");
    Ok(video)
}
