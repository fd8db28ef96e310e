//! Files and tracks DML: the probe's canonical form, persisted.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use sqlx::Row;
use uuid::Uuid;
use vpo_model::{AudioInfo, FileInfo, HdrColorInfo, Track, TrackKind, VideoInfo};

use crate::error::{CoreError, Result};

use super::{from_db_time, to_db_time, Store};

/// Lightweight row used by the scanner's change detection.
#[derive(Debug, Clone, PartialEq)]
pub struct FileMeta {
    pub id: Uuid,
    pub size_bytes: u64,
    pub modified_at: Option<chrono::DateTime<Utc>>,
    pub content_hash: Option<String>,
}

impl Store {
    /// Insert or refresh a probed file and its tracks. Returns the file id.
    pub async fn upsert_file(&self, info: &FileInfo, content_hash: Option<&str>) -> Result<Uuid> {
        let id = match self.file_meta(&info.path).await? {
            Some(meta) => meta.id,
            None => Uuid::new_v4(),
        };
        let tags_json = serde_json::to_string(&info.tags)?;
        let now = to_db_time(Utc::now());

        let mut tx = self.writer().begin().await?;
        sqlx::query(
            "INSERT INTO files (id, path, container, size_bytes, modified_at, duration_seconds,
                                tags_json, content_hash, probed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(path) DO UPDATE SET
                container = excluded.container,
                size_bytes = excluded.size_bytes,
                modified_at = excluded.modified_at,
                duration_seconds = excluded.duration_seconds,
                tags_json = excluded.tags_json,
                content_hash = excluded.content_hash,
                probed_at = excluded.probed_at",
        )
        .bind(id.to_string())
        .bind(info.path.to_string_lossy().as_ref())
        .bind(&info.container)
        .bind(info.size_bytes as i64)
        .bind(info.modified_at.map(to_db_time))
        .bind(info.duration_seconds)
        .bind(tags_json)
        .bind(content_hash)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM tracks WHERE file_id = ?1")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        for track in &info.tracks {
            let color_json = track
                .video
                .as_ref()
                .and_then(|v| v.color.as_ref())
                .map(serde_json::to_string)
                .transpose()?;
            sqlx::query(
                "INSERT INTO tracks (file_id, track_index, kind, codec, language, title,
                                     is_default, is_forced, width, height, frame_rate,
                                     channels, channel_layout, color_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            )
            .bind(id.to_string())
            .bind(track.index as i64)
            .bind(track.kind.as_str())
            .bind(&track.codec)
            .bind(&track.language)
            .bind(&track.title)
            .bind(track.is_default)
            .bind(track.is_forced)
            .bind(track.width().map(|w| w as i64))
            .bind(track.height().map(|h| h as i64))
            .bind(track.video.as_ref().and_then(|v| v.frame_rate.clone()))
            .bind(track.channels().map(|c| c as i64))
            .bind(track.audio.as_ref().and_then(|a| a.channel_layout.clone()))
            .bind(color_json)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(id)
    }

    pub async fn file_meta(&self, path: &Path) -> Result<Option<FileMeta>> {
        let row = sqlx::query(
            "SELECT id, size_bytes, modified_at, content_hash FROM files WHERE path = ?1",
        )
        .bind(path.to_string_lossy().as_ref())
        .fetch_optional(self.reader())
        .await?;
        row.map(|row| {
            let id: String = row.try_get("id")?;
            let modified_at: Option<String> = row.try_get("modified_at")?;
            Ok(FileMeta {
                id: parse_uuid(&id)?,
                size_bytes: row.try_get::<i64, _>("size_bytes")? as u64,
                modified_at: modified_at.as_deref().map(from_db_time).transpose()?,
                content_hash: row.try_get("content_hash")?,
            })
        })
        .transpose()
    }

    pub async fn file_by_path(&self, path: &Path) -> Result<Option<(Uuid, FileInfo)>> {
        let Some(meta) = self.file_meta(path).await? else {
            return Ok(None);
        };
        self.file_by_id(meta.id).await
    }

    pub async fn file_by_id(&self, id: Uuid) -> Result<Option<(Uuid, FileInfo)>> {
        let row = sqlx::query(
            "SELECT path, container, size_bytes, modified_at, duration_seconds, tags_json
             FROM files WHERE id = ?1",
        )
        .bind(id.to_string())
        .fetch_optional(self.reader())
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let path: String = row.try_get("path")?;
        let modified_at: Option<String> = row.try_get("modified_at")?;
        let tags_json: String = row.try_get("tags_json")?;
        let tags: BTreeMap<String, String> = serde_json::from_str(&tags_json)?;

        let track_rows = sqlx::query(
            "SELECT track_index, kind, codec, language, title, is_default, is_forced,
                    width, height, frame_rate, channels, channel_layout, color_json
             FROM tracks WHERE file_id = ?1 ORDER BY track_index",
        )
        .bind(id.to_string())
        .fetch_all(self.reader())
        .await?;

        let mut tracks = Vec::with_capacity(track_rows.len());
        for row in track_rows {
            tracks.push(track_from_row(&row)?);
        }

        Ok(Some((
            id,
            FileInfo {
                path: PathBuf::from(path),
                container: row.try_get("container")?,
                size_bytes: row.try_get::<i64, _>("size_bytes")? as u64,
                modified_at: modified_at.as_deref().map(from_db_time).transpose()?,
                duration_seconds: row.try_get("duration_seconds")?,
                tags,
                tracks,
            },
        )))
    }

    /// Paths under a directory prefix, for prune.
    pub async fn paths_under(&self, prefix: &Path) -> Result<Vec<PathBuf>> {
        let like = format!("{}%", prefix.to_string_lossy());
        let rows = sqlx::query("SELECT path FROM files WHERE path LIKE ?1")
            .bind(like)
            .fetch_all(self.reader())
            .await?;
        rows.into_iter()
            .map(|row| Ok(PathBuf::from(row.try_get::<String, _>("path")?)))
            .collect()
    }

    pub async fn delete_file_by_path(&self, path: &Path) -> Result<bool> {
        let result = sqlx::query("DELETE FROM files WHERE path = ?1")
            .bind(path.to_string_lossy().as_ref())
            .execute(self.writer())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn file_count(&self) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM files")
            .fetch_one(self.reader())
            .await?;
        Ok(count as u64)
    }
}

fn track_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Track> {
    let kind_raw: String = row.try_get("kind")?;
    let kind = match kind_raw.as_str() {
        "video" => TrackKind::Video,
        "audio" => TrackKind::Audio,
        "subtitle" => TrackKind::Subtitle,
        "attachment" => TrackKind::Attachment,
        _ => TrackKind::Other,
    };
    let color_json: Option<String> = row.try_get("color_json")?;
    let color: Option<HdrColorInfo> = color_json
        .as_deref()
        .map(serde_json::from_str)
        .transpose()?;

    let video = (kind == TrackKind::Video).then(|| -> Result<VideoInfo> {
        Ok(VideoInfo {
            width: row.try_get::<Option<i64>, _>("width")?.map(|w| w as u32),
            height: row.try_get::<Option<i64>, _>("height")?.map(|h| h as u32),
            frame_rate: row.try_get("frame_rate")?,
            color: color.clone(),
        })
    });
    let audio = (kind == TrackKind::Audio).then(|| -> Result<AudioInfo> {
        Ok(AudioInfo {
            channels: row.try_get::<Option<i64>, _>("channels")?.map(|c| c as u32),
            channel_layout: row.try_get("channel_layout")?,
        })
    });

    Ok(Track {
        index: row.try_get::<i64, _>("track_index")? as usize,
        kind,
        codec: row.try_get("codec")?,
        language: row.try_get("language")?,
        title: row.try_get("title")?,
        is_default: row.try_get("is_default")?,
        is_forced: row.try_get("is_forced")?,
        video: video.transpose()?,
        audio: audio.transpose()?,
    })
}

pub(crate) fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw)
        .map_err(|e| CoreError::DataIntegrity(format!("bad uuid {raw:?}: {e}")))
}
