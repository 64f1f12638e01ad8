//! Service adapters: per-service listing of a channel's videos and fetching
//! of a single video. Both shipped adapters drive `yt-dlp`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Deserialize;

use crate::error::{CoreError, CoreResult, ServiceError};
use crate::model::RemoteVideo;

pub const YOUTUBE: &str = "youtube";
pub const VIMEO: &str = "vimeo";

#[async_trait]
pub trait ServiceAdapter: Send + Sync {
    /// Name channels use to refer to this adapter.
    fn name(&self) -> &str;

    /// Every video currently listed for `chanid`.
    async fn list_videos(&self, chanid: &str) -> Result<Vec<RemoteVideo>, ServiceError>;

    /// Downloads one video into `dest`. With `force` set, files that already
    /// exist are overwritten.
    async fn fetch_video(
        &self,
        external_id: &str,
        dest: &Path,
        force: bool,
    ) -> Result<(), ServiceError>;
}

/// Adapters keyed by service name.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    adapters: HashMap<String, Arc<dyn ServiceAdapter>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the YouTube and Vimeo adapters, both running `program`.
    pub fn with_ytdlp(program: &Path) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(YtDlpAdapter::youtube(program)));
        registry.register(Arc::new(YtDlpAdapter::vimeo(program)));
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn ServiceAdapter>) {
        self.adapters.insert(adapter.name().to_owned(), adapter);
    }

    pub fn get(&self, service: &str) -> Option<Arc<dyn ServiceAdapter>> {
        self.adapters.get(service).cloned()
    }

    pub fn require(&self, service: &str) -> CoreResult<Arc<dyn ServiceAdapter>> {
        self.get(service)
            .ok_or_else(|| CoreError::InvalidService {
                service: service.to_owned(),
                known: self.names().into_iter().map(str::to_owned).collect(),
            })
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.adapters.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

pub struct YtDlpAdapter {
    service: &'static str,
    program: PathBuf,
    channel_url: fn(&str) -> String,
    video_url: fn(&str) -> String,
}

impl YtDlpAdapter {
    pub fn youtube(program: &Path) -> Self {
        Self {
            service: YOUTUBE,
            program: program.to_path_buf(),
            channel_url: |chanid| format!("https://www.youtube.com/channel/{chanid}/videos"),
            video_url: |id| format!("https://www.youtube.com/watch?v={id}"),
        }
    }

    pub fn vimeo(program: &Path) -> Self {
        Self {
            service: VIMEO,
            program: program.to_path_buf(),
            channel_url: |chanid| format!("https://vimeo.com/{chanid}/videos"),
            video_url: |id| format!("https://vimeo.com/{id}"),
        }
    }

    fn unavailable(&self, reason: impl Into<String>) -> ServiceError {
        ServiceError::ServiceUnavailable {
            service: self.service.to_owned(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl ServiceAdapter for YtDlpAdapter {
    fn name(&self) -> &str {
        self.service
    }

    async fn list_videos(&self, chanid: &str) -> Result<Vec<RemoteVideo>, ServiceError> {
        let mut command = Command::new(&self.program);
        command
            .arg("--flat-playlist")
            .arg("--dump-json")
            .arg("--ignore-errors")
            .arg((self.channel_url)(chanid));

        let output = tokio::task::spawn_blocking(move || command.output())
            .await
            .map_err(|err| self.unavailable(format!("listing task failed: {err}")))?
            .map_err(|err| {
                self.unavailable(format!("running {}: {err}", self.program.display()))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_listing_failure(
                self.service,
                chanid,
                output.status.code(),
                &stderr,
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_listing(self.service, &stdout, Utc::now()))
    }

    async fn fetch_video(
        &self,
        external_id: &str,
        dest: &Path,
        force: bool,
    ) -> Result<(), ServiceError> {
        tokio::fs::create_dir_all(dest)
            .await
            .map_err(|err| self.unavailable(format!("creating {}: {err}", dest.display())))?;

        let mut command = Command::new(&self.program);
        command
            .arg("--no-progress")
            .arg("--no-playlist")
            .arg(if force {
                "--force-overwrites"
            } else {
                "--no-overwrites"
            })
            .arg("--output")
            .arg(dest.join("%(id)s.%(ext)s"))
            .arg((self.video_url)(external_id));

        let output = tokio::task::spawn_blocking(move || command.output())
            .await
            .map_err(|err| self.unavailable(format!("download task failed: {err}")))?
            .map_err(|err| {
                self.unavailable(format!("running {}: {err}", self.program.display()))
            })?;

        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(ServiceError::VideoUnavailable {
            service: self.service.to_owned(),
            external_id: external_id.to_owned(),
            reason: last_error_line(&stderr)
                .unwrap_or_else(|| format!("exit status {}", output.status)),
        })
    }
}

/// One line of `yt-dlp --flat-playlist --dump-json` output. Only the fields
/// needed for a [`RemoteVideo`] are read.
#[derive(Debug, Deserialize)]
struct FlatEntry {
    id: Option<String>,
    title: Option<String>,
    timestamp: Option<f64>,
    release_timestamp: Option<f64>,
    upload_date: Option<String>,
}

impl FlatEntry {
    fn publishdate(&self) -> Option<DateTime<Utc>> {
        self.timestamp
            .or(self.release_timestamp)
            .and_then(|seconds| DateTime::<Utc>::from_timestamp(seconds as i64, 0))
            .or_else(|| self.upload_date.as_deref().and_then(upload_date_to_utc))
    }
}

fn upload_date_to_utc(value: &str) -> Option<DateTime<Utc>> {
    NaiveDate::parse_from_str(value.trim(), "%Y%m%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|datetime| datetime.and_utc())
}

/// Normalizes listing output into `(external_id, title, publishdate)` rows.
///
/// Lines that are not JSON objects or have no id are skipped. Entries without
/// any date get `discovered_at`.
fn parse_listing(service: &str, stdout: &str, discovered_at: DateTime<Utc>) -> Vec<RemoteVideo> {
    let mut videos = Vec::new();
    for line in stdout.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let entry: FlatEntry = match serde_json::from_str(line) {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!(service, error = %err, "skipping unparsable listing line");
                continue;
            }
        };
        let Some(external_id) = entry
            .id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
        else {
            continue;
        };
        let publishdate = entry.publishdate().unwrap_or(discovered_at);
        let title = entry
            .title
            .as_deref()
            .map(str::trim)
            .filter(|title| !title.is_empty())
            .unwrap_or(external_id);
        videos.push(RemoteVideo {
            external_id: external_id.to_owned(),
            title: title.to_owned(),
            publishdate,
        });
    }
    videos
}

fn classify_listing_failure(
    service: &str,
    chanid: &str,
    code: Option<i32>,
    stderr: &str,
) -> ServiceError {
    let lowered = stderr.to_ascii_lowercase();
    let missing = ["does not exist", "http error 404", "not found", "unable to find"]
        .iter()
        .any(|needle| lowered.contains(needle));
    if missing {
        return ServiceError::ChannelNotFound {
            service: service.to_owned(),
            chanid: chanid.to_owned(),
        };
    }
    ServiceError::ServiceUnavailable {
        service: service.to_owned(),
        reason: last_error_line(stderr).unwrap_or_else(|| match code {
            Some(code) => format!("yt-dlp exited with status {code}"),
            None => "yt-dlp terminated by signal".to_owned(),
        }),
    }
}

fn last_error_line(stderr: &str) -> Option<String> {
    stderr
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .map(str::to_owned)
}
