//! Analysis artifacts and plugin metadata persistence, and the loader
//! that assembles an [`AnalysisSet`] for the evaluator.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;
use uuid::Uuid;

use crate::analysis::{
    AnalysisSet, LanguageAnalysis, LanguageSegment, TrackCategory, TrackClassification,
};
use crate::error::Result;

use super::{to_db_time, Store};

/// Seam between the evaluator's inputs and wherever analyses live.
#[async_trait]
pub trait AnalysisProvider: Send + Sync {
    async fn analyses_for(&self, file_id: Uuid) -> Result<AnalysisSet>;
}

/// One registered analyzer/metadata plugin.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct PluginEntry {
    pub name: String,
    pub version: Option<String>,
    pub enabled: bool,
    pub acknowledged: bool,
}

impl Store {
    pub async fn upsert_language_analysis(
        &self,
        file_id: Uuid,
        analysis: &LanguageAnalysis,
    ) -> Result<()> {
        let mut tx = self.writer().begin().await?;
        sqlx::query(
            "INSERT INTO language_analysis_results (file_id, track_index, primary_language, confidence)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(file_id, track_index) DO UPDATE SET
                primary_language = excluded.primary_language,
                confidence = excluded.confidence",
        )
        .bind(file_id.to_string())
        .bind(analysis.track_index as i64)
        .bind(&analysis.primary_language)
        .bind(analysis.confidence)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM language_segments WHERE file_id = ?1 AND track_index = ?2")
            .bind(file_id.to_string())
            .bind(analysis.track_index as i64)
            .execute(&mut *tx)
            .await?;
        for (seq, segment) in analysis.segments.iter().enumerate() {
            sqlx::query(
                "INSERT INTO language_segments
                    (file_id, track_index, seq, language, start_seconds, end_seconds)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )
            .bind(file_id.to_string())
            .bind(analysis.track_index as i64)
            .bind(seq as i64)
            .bind(&segment.language)
            .bind(segment.start_seconds)
            .bind(segment.end_seconds)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn upsert_track_classification(
        &self,
        file_id: Uuid,
        classification: &TrackClassification,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO track_classifications
                (file_id, track_index, is_original, confidence, detected_language, category)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(file_id, track_index) DO UPDATE SET
                is_original = excluded.is_original,
                confidence = excluded.confidence,
                detected_language = excluded.detected_language,
                category = excluded.category",
        )
        .bind(file_id.to_string())
        .bind(classification.track_index as i64)
        .bind(classification.is_original)
        .bind(classification.confidence)
        .bind(&classification.detected_language)
        .bind(category_to_str(classification.category))
        .execute(self.writer())
        .await?;
        Ok(())
    }

    pub async fn set_plugin_metadata(
        &self,
        file_id: Uuid,
        plugin: &str,
        payload: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO plugin_metadata (file_id, plugin, payload_json, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(file_id, plugin) DO UPDATE SET
                payload_json = excluded.payload_json,
                updated_at = excluded.updated_at",
        )
        .bind(file_id.to_string())
        .bind(plugin)
        .bind(payload.to_string())
        .bind(to_db_time(Utc::now()))
        .execute(self.writer())
        .await?;
        Ok(())
    }

    /// Assemble the evaluator-facing analysis set for one file.
    pub async fn load_analyses(&self, file_id: Uuid) -> Result<AnalysisSet> {
        let mut set = AnalysisSet::default();

        let language_rows = sqlx::query(
            "SELECT track_index, primary_language, confidence
             FROM language_analysis_results WHERE file_id = ?1",
        )
        .bind(file_id.to_string())
        .fetch_all(self.reader())
        .await?;
        for row in language_rows {
            let track_index = row.try_get::<i64, _>("track_index")? as usize;
            set.language.insert(
                track_index,
                LanguageAnalysis {
                    track_index,
                    primary_language: row.try_get("primary_language")?,
                    confidence: row.try_get("confidence")?,
                    segments: Vec::new(),
                },
            );
        }
        let segment_rows = sqlx::query(
            "SELECT track_index, language, start_seconds, end_seconds
             FROM language_segments WHERE file_id = ?1
             ORDER BY track_index, seq",
        )
        .bind(file_id.to_string())
        .fetch_all(self.reader())
        .await?;
        for row in segment_rows {
            let track_index = row.try_get::<i64, _>("track_index")? as usize;
            if let Some(analysis) = set.language.get_mut(&track_index) {
                analysis.segments.push(LanguageSegment {
                    language: row.try_get("language")?,
                    start_seconds: row.try_get("start_seconds")?,
                    end_seconds: row.try_get("end_seconds")?,
                });
            }
        }

        let classification_rows = sqlx::query(
            "SELECT track_index, is_original, confidence, detected_language, category
             FROM track_classifications WHERE file_id = ?1",
        )
        .bind(file_id.to_string())
        .fetch_all(self.reader())
        .await?;
        for row in classification_rows {
            let track_index = row.try_get::<i64, _>("track_index")? as usize;
            let category: String = row.try_get("category")?;
            set.classification.insert(
                track_index,
                TrackClassification {
                    track_index,
                    is_original: row.try_get("is_original")?,
                    confidence: row.try_get("confidence")?,
                    detected_language: row.try_get("detected_language")?,
                    category: category_from_str(&category),
                },
            );
        }

        let plugin_rows = sqlx::query(
            "SELECT plugin, payload_json FROM plugin_metadata WHERE file_id = ?1",
        )
        .bind(file_id.to_string())
        .fetch_all(self.reader())
        .await?;
        for row in plugin_rows {
            let plugin: String = row.try_get("plugin")?;
            let payload: String = row.try_get("payload_json")?;
            set.plugin_metadata
                .insert(plugin, serde_json::from_str(&payload)?);
        }

        set.content_language = set.resolved_content_language();
        Ok(set)
    }

    pub async fn register_plugin(&self, name: &str, version: Option<&str>) -> Result<()> {
        sqlx::query(
            "INSERT INTO plugin_registry (name, version, enabled, acknowledged, registered_at)
             VALUES (?1, ?2, 1, 0, ?3)
             ON CONFLICT(name) DO UPDATE SET version = excluded.version",
        )
        .bind(name)
        .bind(version)
        .bind(to_db_time(Utc::now()))
        .execute(self.writer())
        .await?;
        Ok(())
    }

    pub async fn set_plugin_enabled(&self, name: &str, enabled: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE plugin_registry SET enabled = ?1 WHERE name = ?2")
            .bind(enabled)
            .bind(name)
            .execute(self.writer())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn acknowledge_plugin(&self, name: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE plugin_registry SET acknowledged = 1 WHERE name = ?1")
            .bind(name)
            .execute(self.writer())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_plugins(&self) -> Result<Vec<PluginEntry>> {
        let rows = sqlx::query("SELECT * FROM plugin_registry ORDER BY name")
            .fetch_all(self.reader())
            .await?;
        rows.into_iter()
            .map(|row| {
                Ok(PluginEntry {
                    name: row.try_get("name")?,
                    version: row.try_get("version")?,
                    enabled: row.try_get("enabled")?,
                    acknowledged: row.try_get("acknowledged")?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl AnalysisProvider for Store {
    async fn analyses_for(&self, file_id: Uuid) -> Result<AnalysisSet> {
        self.load_analyses(file_id).await
    }
}

fn category_to_str(category: TrackCategory) -> &'static str {
    match category {
        TrackCategory::Dialogue => "dialogue",
        TrackCategory::Commentary => "commentary",
        TrackCategory::Music => "music",
        TrackCategory::Sfx => "sfx",
        TrackCategory::NonSpeech => "non_speech",
        TrackCategory::Unknown => "unknown",
    }
}

fn category_from_str(raw: &str) -> TrackCategory {
    match raw {
        "dialogue" => TrackCategory::Dialogue,
        "commentary" => TrackCategory::Commentary,
        "music" => TrackCategory::Music,
        "sfx" => TrackCategory::Sfx,
        "non_speech" => TrackCategory::NonSpeech,
        _ => TrackCategory::Unknown,
    }
}
