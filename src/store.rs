//! Record store for channels and videos, backed by a local libsql database.
//!
//! Uniqueness of `(service, chanid)` and `(channel_id, external_id)` is
//! enforced by the schema, and every write that races with another request
//! is a single statement with `RETURNING`, so callers learn atomically whether
//! their insert or status swap took effect.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Builder, Connection, Row, params};

use crate::model::{
    Channel, ChannelId, RemoteVideo, VIDEOS_PER_PAGE, Video, VideoId, VideoPage, VideoQuery,
};
use crate::state::VideoStatus;

const VIDEO_COLUMNS: &str = "id, channel_id, external_id, title, publishdate, status";

async fn configure_connection(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA foreign_keys=ON;
        "#,
    )
    .await?;
    Ok(())
}

async fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS channels (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            chanid TEXT NOT NULL,
            service TEXT NOT NULL,
            title TEXT,
            UNIQUE (service, chanid)
        );

        CREATE TABLE IF NOT EXISTS videos (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            channel_id INTEGER NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
            external_id TEXT NOT NULL,
            title TEXT NOT NULL,
            publishdate TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'new',
            revision INTEGER NOT NULL DEFAULT 0,
            UNIQUE (channel_id, external_id)
        );

        CREATE INDEX IF NOT EXISTS idx_videos_channel_publishdate
            ON videos(channel_id, publishdate);
        "#,
    )
    .await?;
    Ok(())
}

/// Timestamps are stored as second-precision RFC 3339 in UTC so that string
/// order matches chronological order.
fn format_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("parsing stored timestamp {value:?}"))?
        .with_timezone(&Utc))
}

fn escape_like(term: &str) -> String {
    term.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

pub struct RecordStore {
    conn: Connection,
}

impl std::fmt::Debug for RecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStore").finish_non_exhaustive()
    }
}

impl RecordStore {
    /// Opens (and if necessary creates) the database and its schema.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory {}", parent.display()))?;
        }

        let db = Builder::new_local(path)
            .build()
            .await
            .with_context(|| format!("opening database {}", path.display()))?;

        let conn = db.connect()?;
        configure_connection(&conn).await?;
        ensure_schema(&conn).await?;
        Ok(Self { conn })
    }

    /// Inserts a channel unless `(service, chanid)` is already taken.
    ///
    /// Returns `None` when the key exists; the check and the insert are the
    /// same statement.
    pub async fn insert_channel(
        &self,
        chanid: &str,
        service: &str,
        title: Option<&str>,
    ) -> Result<Option<Channel>> {
        let mut rows = self
            .conn
            .query(
                r#"
                INSERT INTO channels (chanid, service, title)
                VALUES (?1, ?2, ?3)
                ON CONFLICT (service, chanid) DO NOTHING
                RETURNING id
                "#,
                params![chanid, service, title],
            )
            .await?;
        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        let id: i64 = row.get(0)?;
        Ok(Some(Channel {
            id,
            chanid: chanid.to_owned(),
            service: service.to_owned(),
            title: title.map(str::to_owned),
        }))
    }

    pub async fn get_channel(&self, id: ChannelId) -> Result<Option<Channel>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, chanid, service, title FROM channels WHERE id = ?1",
                params![id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_channel(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn get_channel_by_chanid(
        &self,
        service: &str,
        chanid: &str,
    ) -> Result<Option<Channel>> {
        let mut rows = self
            .conn
            .query(
                r#"
                SELECT id, chanid, service, title
                FROM channels
                WHERE service = ?1 AND chanid = ?2
                "#,
                params![service, chanid],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_channel(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn list_channels(&self) -> Result<Vec<Channel>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, chanid, service, title FROM channels ORDER BY chanid, service",
                params![],
            )
            .await?;
        let mut channels = Vec::new();
        while let Some(row) = rows.next().await? {
            channels.push(row_to_channel(&row)?);
        }
        Ok(channels)
    }

    /// Deletes the channel; its videos go with it through the foreign key.
    /// Returns `false` when no such channel existed.
    pub async fn delete_channel(&self, id: ChannelId) -> Result<bool> {
        let mut rows = self
            .conn
            .query(
                "DELETE FROM channels WHERE id = ?1 RETURNING id",
                params![id],
            )
            .await?;
        Ok(rows.next().await?.is_some())
    }

    /// Creates a `new` video unless the channel already knows `external_id`.
    pub async fn insert_video_if_absent(
        &self,
        channel: ChannelId,
        remote: &RemoteVideo,
    ) -> Result<Option<Video>> {
        let publishdate = format_timestamp(&remote.publishdate);
        let mut rows = self
            .conn
            .query(
                r#"
                INSERT INTO videos (channel_id, external_id, title, publishdate, status)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT (channel_id, external_id) DO NOTHING
                RETURNING id
                "#,
                params![
                    channel,
                    remote.external_id.as_str(),
                    remote.title.as_str(),
                    publishdate.as_str(),
                    VideoStatus::New.as_str(),
                ],
            )
            .await?;
        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        let id: i64 = row.get(0)?;
        Ok(Some(Video {
            id,
            channel,
            external_id: remote.external_id.clone(),
            title: remote.title.clone(),
            publishdate: parse_timestamp(&publishdate)?,
            status: VideoStatus::New,
        }))
    }

    pub async fn get_video(&self, id: VideoId) -> Result<Option<Video>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {VIDEO_COLUMNS} FROM videos WHERE id = ?1"),
                params![id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_video(&row)?)),
            None => Ok(None),
        }
    }

    /// External ids already recorded for `channel`.
    pub async fn external_ids(&self, channel: ChannelId) -> Result<HashSet<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT external_id FROM videos WHERE channel_id = ?1",
                params![channel],
            )
            .await?;
        let mut ids = HashSet::new();
        while let Some(row) = rows.next().await? {
            ids.insert(row.get::<String>(0)?);
        }
        Ok(ids)
    }

    pub async fn count_videos(&self, channel: ChannelId) -> Result<u64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM videos WHERE channel_id = ?1",
                params![channel],
            )
            .await?;
        let row = rows.next().await?.context("missing count row")?;
        let count: i64 = row.get(0)?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// Newest-first listing of one channel's videos with an optional
    /// case-insensitive title filter.
    pub async fn list_videos(&self, channel: ChannelId, query: &VideoQuery) -> Result<VideoPage> {
        let pattern = query.search_term().map(escape_like);

        let mut rows = self
            .conn
            .query(
                r#"
                SELECT COUNT(*)
                FROM videos
                WHERE channel_id = ?1
                  AND (?2 IS NULL OR title LIKE '%' || ?2 || '%' ESCAPE '\')
                "#,
                params![channel, pattern.clone()],
            )
            .await?;
        let row = rows.next().await?.context("missing count row")?;
        let total = u64::try_from(row.get::<i64>(0)?).unwrap_or_default();
        drop(rows);

        let num_pages = VideoPage::page_count(total);
        let page = VideoPage::clamp_page(query.page, num_pages);
        let offset = i64::from(page - 1) * i64::from(VIDEOS_PER_PAGE);

        let mut rows = self
            .conn
            .query(
                &format!(
                    r#"
                    SELECT {VIDEO_COLUMNS}
                    FROM videos
                    WHERE channel_id = ?1
                      AND (?2 IS NULL OR title LIKE '%' || ?2 || '%' ESCAPE '\')
                    ORDER BY publishdate DESC, id DESC
                    LIMIT ?3 OFFSET ?4
                    "#
                ),
                params![channel, pattern, i64::from(VIDEOS_PER_PAGE), offset],
            )
            .await?;
        let mut videos = Vec::new();
        while let Some(row) = rows.next().await? {
            videos.push(row_to_video(&row)?);
        }

        Ok(VideoPage {
            videos,
            page,
            num_pages,
            total,
        })
    }

    /// Writes `next` only if the stored status still equals `expected`.
    pub async fn compare_and_set_status(
        &self,
        id: VideoId,
        expected: VideoStatus,
        next: VideoStatus,
    ) -> Result<bool> {
        let mut rows = self
            .conn
            .query(
                r#"
                UPDATE videos SET status = ?1, revision = revision + 1
                WHERE id = ?2 AND status = ?3
                RETURNING id
                "#,
                params![next.as_str(), id, expected.as_str()],
            )
            .await?;
        Ok(rows.next().await?.is_some())
    }

    /// Moves the video from `expected` to `queued` and returns the revision
    /// of that write, or `None` if the stored status was not `expected`.
    ///
    /// Every status write bumps the revision, so the returned value names this
    /// particular queueing.
    pub async fn queue_for_grab(
        &self,
        id: VideoId,
        expected: VideoStatus,
    ) -> Result<Option<i64>> {
        let mut rows = self
            .conn
            .query(
                r#"
                UPDATE videos SET status = ?1, revision = revision + 1
                WHERE id = ?2 AND status = ?3
                RETURNING revision
                "#,
                params![VideoStatus::Queued.as_str(), id, expected.as_str()],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    /// Reverts a [`queue_for_grab`](Self::queue_for_grab) to `previous`. Does
    /// nothing once any other status write happened after it, including a
    /// second queueing.
    pub async fn undo_queue(
        &self,
        id: VideoId,
        revision: i64,
        previous: VideoStatus,
    ) -> Result<bool> {
        let mut rows = self
            .conn
            .query(
                r#"
                UPDATE videos SET status = ?1, revision = revision + 1
                WHERE id = ?2 AND status = ?3 AND revision = ?4
                RETURNING id
                "#,
                params![previous.as_str(), id, VideoStatus::Queued.as_str(), revision],
            )
            .await?;
        Ok(rows.next().await?.is_some())
    }

    /// Unconditional status write. Returns the updated row, or `None` for an
    /// unknown id.
    pub async fn set_status(&self, id: VideoId, status: VideoStatus) -> Result<Option<Video>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "UPDATE videos SET status = ?1, revision = revision + 1 \
                     WHERE id = ?2 RETURNING {VIDEO_COLUMNS}"
                ),
                params![status.as_str(), id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_video(&row)?)),
            None => Ok(None),
        }
    }
}

fn row_to_channel(row: &Row) -> Result<Channel> {
    Ok(Channel {
        id: row.get(0)?,
        chanid: row.get(1)?,
        service: row.get(2)?,
        title: row.get::<Option<String>>(3)?,
    })
}

fn row_to_video(row: &Row) -> Result<Video> {
    let publishdate: String = row.get(4)?;
    let status: String = row.get(5)?;
    Ok(Video {
        id: row.get(0)?,
        channel: row.get(1)?,
        external_id: row.get(2)?,
        title: row.get(3)?,
        publishdate: parse_timestamp(&publishdate)?,
        status: VideoStatus::parse(&status)
            .ok_or_else(|| anyhow!("unknown video status {status:?} in database"))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{remote_video, remote_video_at, sample_store};
    use chrono::TimeZone;
    use tempfile::tempdir;

    #[tokio::test]
    async fn opens_store_and_creates_schema() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("nested/ytgrab.db");
        let store = RecordStore::open(&path).await?;
        assert!(path.exists(), "database file should be created");

        for table in ["channels", "videos"] {
            let mut rows = store
                .conn
                .query(
                    "SELECT name FROM sqlite_master WHERE type='table' AND name=?1",
                    [table],
                )
                .await?;
            let exists: Option<String> = rows
                .next()
                .await?
                .map(|row| row.get::<String>(0))
                .transpose()?;
            assert_eq!(exists.as_deref(), Some(table));
        }

        let mut rows = store.conn.query("PRAGMA foreign_keys", params![]).await?;
        let row = rows.next().await?.context("missing foreign_keys row")?;
        let flag: i64 = row.get(0)?;
        assert_eq!(flag, 1);
        Ok(())
    }

    #[tokio::test]
    async fn insert_channel_rejects_duplicate_key() -> Result<()> {
        let (_temp, store, channel) = sample_store().await;
        let again = store
            .insert_channel(&channel.chanid, &channel.service, None)
            .await?;
        assert!(again.is_none());

        let other_service = store
            .insert_channel(&channel.chanid, "vimeo", None)
            .await?;
        assert!(other_service.is_some());
        assert_eq!(store.list_channels().await?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn channel_lookup_by_chanid() -> Result<()> {
        let (_temp, store, channel) = sample_store().await;
        let found = store
            .get_channel_by_chanid(&channel.service, &channel.chanid)
            .await?
            .expect("channel found");
        assert_eq!(found, channel);
        assert!(store.get_channel_by_chanid("vimeo", &channel.chanid).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn insert_video_is_idempotent_per_channel() -> Result<()> {
        let (_temp, store, channel) = sample_store().await;
        let first = store
            .insert_video_if_absent(channel.id, &remote_video("abc"))
            .await?
            .expect("created");
        assert_eq!(first.status, VideoStatus::New);

        let mut renamed = remote_video("abc");
        renamed.title = "Renamed upstream".into();
        assert!(store.insert_video_if_absent(channel.id, &renamed).await?.is_none());

        let stored = store.get_video(first.id).await?.expect("video stored");
        assert_eq!(stored.title, first.title);
        assert_eq!(store.count_videos(channel.id).await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn compare_and_set_only_swaps_expected_status() -> Result<()> {
        let (_temp, store, channel) = sample_store().await;
        let video = store
            .insert_video_if_absent(channel.id, &remote_video("abc"))
            .await?
            .expect("created");

        assert!(
            !store
                .compare_and_set_status(video.id, VideoStatus::GrabError, VideoStatus::Queued)
                .await?
        );
        assert!(
            store
                .compare_and_set_status(video.id, VideoStatus::New, VideoStatus::Queued)
                .await?
        );
        let stored = store.get_video(video.id).await?.expect("video stored");
        assert_eq!(stored.status, VideoStatus::Queued);
        assert!(
            !store
                .compare_and_set_status(4242, VideoStatus::New, VideoStatus::Queued)
                .await?
        );
        Ok(())
    }

    #[tokio::test]
    async fn undo_queue_reverts_its_own_queueing() -> Result<()> {
        let (_temp, store, channel) = sample_store().await;
        let video = store
            .insert_video_if_absent(channel.id, &remote_video("abc"))
            .await?
            .expect("created");

        assert!(store.queue_for_grab(video.id, VideoStatus::GrabError).await?.is_none());
        let revision = store
            .queue_for_grab(video.id, VideoStatus::New)
            .await?
            .expect("queued");
        assert!(store.undo_queue(video.id, revision, VideoStatus::New).await?);
        let stored = store.get_video(video.id).await?.expect("video stored");
        assert_eq!(stored.status, VideoStatus::New);
        Ok(())
    }

    #[tokio::test]
    async fn undo_queue_keeps_a_later_requeue() -> Result<()> {
        let (_temp, store, channel) = sample_store().await;
        let video = store
            .insert_video_if_absent(channel.id, &remote_video("abc"))
            .await?
            .expect("created");

        let first = store
            .queue_for_grab(video.id, VideoStatus::New)
            .await?
            .expect("queued");
        // A forced grab queues the already queued video again.
        let second = store
            .queue_for_grab(video.id, VideoStatus::Queued)
            .await?
            .expect("requeued");
        assert_ne!(first, second);

        assert!(!store.undo_queue(video.id, first, VideoStatus::New).await?);
        let stored = store.get_video(video.id).await?.expect("video stored");
        assert_eq!(stored.status, VideoStatus::Queued);
        assert!(store.undo_queue(video.id, second, VideoStatus::Queued).await?);
        Ok(())
    }

    #[tokio::test]
    async fn delete_channel_cascades_to_videos() -> Result<()> {
        let (_temp, store, channel) = sample_store().await;
        let keep = store
            .insert_channel("keeper", "youtube", None)
            .await?
            .expect("created");
        for id in ["a", "b", "c"] {
            store.insert_video_if_absent(channel.id, &remote_video(id)).await?;
        }
        store.insert_video_if_absent(keep.id, &remote_video("z")).await?;

        assert!(store.delete_channel(channel.id).await?);
        assert!(store.get_channel(channel.id).await?.is_none());

        let mut rows = store
            .conn
            .query(
                "SELECT COUNT(*) FROM videos WHERE channel_id NOT IN (SELECT id FROM channels)",
                params![],
            )
            .await?;
        let orphans: i64 = rows.next().await?.context("missing row")?.get(0)?;
        assert_eq!(orphans, 0);
        assert_eq!(store.count_videos(keep.id).await?, 1);

        assert!(!store.delete_channel(channel.id).await?);
        Ok(())
    }

    #[tokio::test]
    async fn list_videos_sorts_newest_first_and_pages() -> Result<()> {
        let (_temp, store, channel) = sample_store().await;
        for day in 1..=30u32 {
            let published = Utc.with_ymd_and_hms(2024, 1, day, 12, 0, 0).unwrap();
            store
                .insert_video_if_absent(
                    channel.id,
                    &remote_video_at(&format!("v{day:02}"), published),
                )
                .await?;
        }

        let first = store.list_videos(channel.id, &VideoQuery::default()).await?;
        assert_eq!(first.total, 30);
        assert_eq!(first.num_pages, 2);
        assert_eq!(first.page, 1);
        assert_eq!(first.videos.len(), 25);
        assert_eq!(first.videos[0].external_id, "v30");

        let past_end = store
            .list_videos(
                channel.id,
                &VideoQuery {
                    search: None,
                    page: Some(7),
                },
            )
            .await?;
        assert_eq!(past_end.page, 2);
        assert_eq!(past_end.videos.len(), 5);
        assert_eq!(past_end.videos[4].external_id, "v01");
        Ok(())
    }

    #[tokio::test]
    async fn list_videos_filters_by_title_case_insensitively() -> Result<()> {
        let (_temp, store, channel) = sample_store().await;
        let mut talk = remote_video("talk");
        talk.title = "Conference TALK 2024".into();
        store.insert_video_if_absent(channel.id, &talk).await?;
        let mut literal = remote_video("pct");
        literal.title = "100% talk".into();
        store.insert_video_if_absent(channel.id, &literal).await?;
        store.insert_video_if_absent(channel.id, &remote_video("other")).await?;

        let page = store
            .list_videos(
                channel.id,
                &VideoQuery {
                    search: Some("talk".into()),
                    page: None,
                },
            )
            .await?;
        assert_eq!(page.total, 2);

        let page = store
            .list_videos(
                channel.id,
                &VideoQuery {
                    search: Some("0%".into()),
                    page: None,
                },
            )
            .await?;
        assert_eq!(page.total, 1);
        assert_eq!(page.videos[0].external_id, "pct");

        let empty = store
            .list_videos(
                channel.id,
                &VideoQuery {
                    search: Some("missing".into()),
                    page: Some(3),
                },
            )
            .await?;
        assert_eq!(empty.total, 0);
        assert_eq!(empty.page, 1);
        assert_eq!(empty.num_pages, 1);
        Ok(())
    }

    #[test]
    fn timestamps_round_trip_through_text() {
        let when = Utc.with_ymd_and_hms(2023, 7, 4, 9, 30, 15).unwrap();
        let text = format_timestamp(&when);
        assert_eq!(text, "2023-07-04T09:30:15Z");
        assert_eq!(parse_timestamp(&text).unwrap(), when);
    }
}
