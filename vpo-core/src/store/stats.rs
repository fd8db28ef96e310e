//! Processing statistics: one append-only row per executed transcode,
//! plus the aggregate queries behind the daemon's stats endpoints.

use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use sqlx::Row;
use uuid::Uuid;
use vpo_model::{EncoderType, ProcessingStats};

use crate::error::Result;

use super::files::parse_uuid;
use super::{from_db_time, to_db_time, Store};

/// Library-wide rollup.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSummary {
    pub runs: u64,
    pub total_input_bytes: u64,
    pub total_output_bytes: u64,
    pub bytes_saved: i64,
    pub mean_wall_seconds: f64,
    pub hardware_runs: u64,
    pub fallback_runs: u64,
}

/// Per-day rollup for trend charts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyStats {
    pub day: String,
    pub runs: u64,
    pub total_input_bytes: u64,
    pub total_output_bytes: u64,
}

impl Store {
    pub async fn insert_processing_stats(&self, stats: &ProcessingStats) -> Result<()> {
        sqlx::query(
            "INSERT INTO processing_stats
                (id, job_id, file_path, input_bytes, output_bytes, wall_seconds,
                 encoder, encoder_type, fallback_occurred, mean_fps, peak_fps,
                 mean_bitrate_kbps, total_frames, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        )
        .bind(stats.id.to_string())
        .bind(stats.job_id.map(|id| id.to_string()))
        .bind(stats.file_path.to_string_lossy().as_ref())
        .bind(stats.input_bytes as i64)
        .bind(stats.output_bytes as i64)
        .bind(stats.wall_seconds)
        .bind(&stats.encoder)
        .bind(stats.encoder_type.as_str())
        .bind(stats.fallback_occurred)
        .bind(stats.mean_fps)
        .bind(stats.peak_fps)
        .bind(stats.mean_bitrate_kbps)
        .bind(stats.total_frames.map(|f| f as i64))
        .bind(to_db_time(stats.created_at))
        .execute(self.writer())
        .await?;
        Ok(())
    }

    pub async fn stats_summary(&self) -> Result<StatsSummary> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS runs,
                    COALESCE(SUM(input_bytes), 0) AS input_bytes,
                    COALESCE(SUM(output_bytes), 0) AS output_bytes,
                    COALESCE(AVG(wall_seconds), 0.0) AS mean_wall,
                    COALESCE(SUM(CASE WHEN encoder_type = 'hardware' THEN 1 ELSE 0 END), 0)
                        AS hardware_runs,
                    COALESCE(SUM(CASE WHEN fallback_occurred THEN 1 ELSE 0 END), 0)
                        AS fallback_runs
             FROM processing_stats",
        )
        .fetch_one(self.reader())
        .await?;

        let input: i64 = row.try_get("input_bytes")?;
        let output: i64 = row.try_get("output_bytes")?;
        Ok(StatsSummary {
            runs: row.try_get::<i64, _>("runs")? as u64,
            total_input_bytes: input as u64,
            total_output_bytes: output as u64,
            bytes_saved: input - output,
            mean_wall_seconds: row.try_get("mean_wall")?,
            hardware_runs: row.try_get::<i64, _>("hardware_runs")? as u64,
            fallback_runs: row.try_get::<i64, _>("fallback_runs")? as u64,
        })
    }

    pub async fn recent_stats(&self, limit: u32) -> Result<Vec<ProcessingStats>> {
        let rows = sqlx::query(
            "SELECT * FROM processing_stats ORDER BY created_at DESC LIMIT ?1",
        )
        .bind(limit as i64)
        .fetch_all(self.reader())
        .await?;
        rows.iter().map(stats_from_row).collect()
    }

    /// Daily aggregates over the trailing window.
    pub async fn stats_trends(&self, days: u32) -> Result<Vec<DailyStats>> {
        let since = to_db_time(Utc::now() - ChronoDuration::days(days as i64));
        let rows = sqlx::query(
            "SELECT substr(created_at, 1, 10) AS day,
                    COUNT(*) AS runs,
                    COALESCE(SUM(input_bytes), 0) AS input_bytes,
                    COALESCE(SUM(output_bytes), 0) AS output_bytes
             FROM processing_stats
             WHERE created_at >= ?1
             GROUP BY day
             ORDER BY day",
        )
        .bind(since)
        .fetch_all(self.reader())
        .await?;
        rows.into_iter()
            .map(|row| {
                Ok(DailyStats {
                    day: row.try_get("day")?,
                    runs: row.try_get::<i64, _>("runs")? as u64,
                    total_input_bytes: row.try_get::<i64, _>("input_bytes")? as u64,
                    total_output_bytes: row.try_get::<i64, _>("output_bytes")? as u64,
                })
            })
            .collect()
    }
}

fn stats_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ProcessingStats> {
    let encoder_type: String = row.try_get("encoder_type")?;
    let job_id: Option<String> = row.try_get("job_id")?;
    Ok(ProcessingStats {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        job_id: job_id.as_deref().map(parse_uuid).transpose()?,
        file_path: std::path::PathBuf::from(row.try_get::<String, _>("file_path")?),
        input_bytes: row.try_get::<i64, _>("input_bytes")? as u64,
        output_bytes: row.try_get::<i64, _>("output_bytes")? as u64,
        wall_seconds: row.try_get("wall_seconds")?,
        encoder: row.try_get("encoder")?,
        encoder_type: EncoderType::parse(&encoder_type),
        fallback_occurred: row.try_get("fallback_occurred")?,
        mean_fps: row.try_get("mean_fps")?,
        peak_fps: row.try_get("peak_fps")?,
        mean_bitrate_kbps: row.try_get("mean_bitrate_kbps")?,
        total_frames: row
            .try_get::<Option<i64>, _>("total_frames")?
            .map(|f| f as u64),
        created_at: from_db_time(&row.try_get::<String, _>("created_at")?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(encoder_type: EncoderType, fallback: bool, input: u64, output: u64) -> ProcessingStats {
        ProcessingStats {
            id: Uuid::new_v4(),
            job_id: None,
            file_path: "/m.mkv".into(),
            input_bytes: input,
            output_bytes: output,
            wall_seconds: 120.0,
            encoder: "libx265".into(),
            encoder_type,
            fallback_occurred: fallback,
            mean_fps: Some(42.0),
            peak_fps: Some(60.0),
            mean_bitrate_kbps: Some(1800.0),
            total_frames: Some(100_000),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn summary_rolls_up() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .insert_processing_stats(&sample(EncoderType::Hardware, false, 1000, 500))
            .await
            .unwrap();
        store
            .insert_processing_stats(&sample(EncoderType::Software, true, 2000, 1000))
            .await
            .unwrap();

        let summary = store.stats_summary().await.unwrap();
        assert_eq!(summary.runs, 2);
        assert_eq!(summary.total_input_bytes, 3000);
        assert_eq!(summary.total_output_bytes, 1500);
        assert_eq!(summary.bytes_saved, 1500);
        assert_eq!(summary.hardware_runs, 1);
        assert_eq!(summary.fallback_runs, 1);
    }

    #[tokio::test]
    async fn recent_is_ordered_and_round_trips() {
        let store = Store::open_in_memory().await.unwrap();
        let row = sample(EncoderType::Software, true, 100, 50);
        store.insert_processing_stats(&row).await.unwrap();

        let recent = store.recent_stats(10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].encoder, "libx265");
        assert_eq!(recent[0].encoder_type, EncoderType::Software);
        assert!(recent[0].fallback_occurred);
        assert_eq!(recent[0].total_frames, Some(100_000));
    }

    #[tokio::test]
    async fn trends_group_by_day() {
        let store = Store::open_in_memory().await.unwrap();
        store
            .insert_processing_stats(&sample(EncoderType::Software, false, 100, 80))
            .await
            .unwrap();
        store
            .insert_processing_stats(&sample(EncoderType::Software, false, 300, 200))
            .await
            .unwrap();
        let trends = store.stats_trends(7).await.unwrap();
        assert_eq!(trends.len(), 1);
        assert_eq!(trends[0].runs, 2);
        assert_eq!(trends[0].total_input_bytes, 400);
    }
}
