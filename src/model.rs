//! Records persisted by the store and exchanged with the adapters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::VideoStatus;

pub type ChannelId = i64;
pub type VideoId = i64;

/// Page size of the per-channel video listing.
pub const VIDEOS_PER_PAGE: u32 = 25;

/// A tracked source of videos on one external service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    pub chanid: String,
    pub service: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Video {
    pub id: VideoId,
    pub channel: ChannelId,
    pub external_id: String,
    pub title: String,
    pub publishdate: DateTime<Utc>,
    pub status: VideoStatus,
}

/// Normalized entry of a remote channel listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteVideo {
    pub external_id: String,
    pub title: String,
    pub publishdate: DateTime<Utc>,
}

/// Filter for the per-channel listing. `page` is 1-based and clamped by the
/// store.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VideoQuery {
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub page: Option<u32>,
}

impl VideoQuery {
    /// Trimmed search term, `None` when blank.
    pub fn search_term(&self) -> Option<&str> {
        self.search
            .as_deref()
            .map(str::trim)
            .filter(|term| !term.is_empty())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoPage {
    pub videos: Vec<Video>,
    pub page: u32,
    pub num_pages: u32,
    pub total: u64,
}

impl VideoPage {
    /// Number of pages needed for `total` rows; an empty listing is one page.
    pub fn page_count(total: u64) -> u32 {
        let pages = total.div_ceil(u64::from(VIDEOS_PER_PAGE)).max(1);
        u32::try_from(pages).unwrap_or(u32::MAX)
    }

    /// Clamps a requested page into `1..=num_pages`.
    pub fn clamp_page(requested: Option<u32>, num_pages: u32) -> u32 {
        requested.unwrap_or(1).clamp(1, num_pages.max(1))
    }
}
