//! Side-channel analyses consumed by the evaluator.
//!
//! Analyzer plugins run out-of-process and persist their results into the
//! library store; the evaluator only ever sees the loaded [`AnalysisSet`].
//! Absent analyses are normal: every lookup degrades to "unknown" rather
//! than failing.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// What a classification pass decided a track contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackCategory {
    Dialogue,
    Commentary,
    Music,
    Sfx,
    NonSpeech,
    Unknown,
}

/// Original-vs-dubbed classification for one audio track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackClassification {
    pub track_index: usize,
    /// `Some(true)` = original theatrical audio, `Some(false)` = dubbed.
    pub is_original: Option<bool>,
    pub confidence: f64,
    pub detected_language: Option<String>,
    #[serde(default = "unknown_category")]
    pub category: TrackCategory,
}

fn unknown_category() -> TrackCategory {
    TrackCategory::Unknown
}

/// One contiguous stretch of a single spoken language.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageSegment {
    pub language: String,
    pub start_seconds: f64,
    pub end_seconds: f64,
}

/// Primary-language detection plus per-segment breakdown for one track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageAnalysis {
    pub track_index: usize,
    pub primary_language: Option<String>,
    pub confidence: f64,
    #[serde(default)]
    pub segments: Vec<LanguageSegment>,
}

impl LanguageAnalysis {
    /// Fraction of analyzed time spoken in languages other than the primary.
    pub fn secondary_fraction(&self) -> f64 {
        let Some(primary) = self.primary_language.as_deref() else {
            return 0.0;
        };
        let total: f64 = self
            .segments
            .iter()
            .map(|s| (s.end_seconds - s.start_seconds).max(0.0))
            .sum();
        if total <= 0.0 {
            return 0.0;
        }
        let secondary: f64 = self
            .segments
            .iter()
            .filter(|s| !vpo_model::languages_match(&s.language, primary))
            .map(|s| (s.end_seconds - s.start_seconds).max(0.0))
            .sum();
        secondary / total
    }
}

/// Everything the evaluator may consult besides the probe itself.
///
/// Plugin metadata is keyed by plugin name in a `BTreeMap` so iteration
/// order (and therefore evaluation) is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSet {
    #[serde(default)]
    pub language: BTreeMap<usize, LanguageAnalysis>,
    #[serde(default)]
    pub classification: BTreeMap<usize, TrackClassification>,
    #[serde(default)]
    pub plugin_metadata: BTreeMap<String, serde_json::Value>,
    /// Externally-detected original language of the content, for the
    /// track filter's `content_language` fallback.
    #[serde(default)]
    pub content_language: Option<String>,
}

impl AnalysisSet {
    /// Look up one field of one plugin's metadata blob.
    pub fn plugin_field(&self, plugin: &str, field: &str) -> Option<&serde_json::Value> {
        self.plugin_metadata.get(plugin).and_then(|blob| blob.get(field))
    }

    pub fn classification_for(&self, track_index: usize) -> Option<&TrackClassification> {
        self.classification.get(&track_index)
    }

    pub fn language_for(&self, track_index: usize) -> Option<&LanguageAnalysis> {
        self.language.get(&track_index)
    }

    /// Resolve the content's original language: explicit field first, then
    /// the plugins' `original_language` fields in name order.
    pub fn resolved_content_language(&self) -> Option<String> {
        if let Some(lang) = &self.content_language {
            return Some(lang.clone());
        }
        for blob in self.plugin_metadata.values() {
            if let Some(lang) = blob.get("original_language").and_then(|v| v.as_str()) {
                return Some(lang.to_string());
            }
        }
        None
    }

    /// Resolve a release date (ISO-8601) for the file-timestamp action.
    /// `date_source` narrows the lookup to one plugin.
    pub fn release_date(&self, date_source: Option<&str>) -> Option<String> {
        let fields = ["release_date", "air_date", "digital_release_date"];
        let lookup = |blob: &serde_json::Value| {
            fields
                .iter()
                .find_map(|f| blob.get(*f).and_then(|v| v.as_str()).map(str::to_string))
        };
        match date_source {
            Some(plugin) => self.plugin_metadata.get(plugin).and_then(lookup),
            None => self.plugin_metadata.values().find_map(lookup),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn secondary_fraction_against_primary() {
        let analysis = LanguageAnalysis {
            track_index: 1,
            primary_language: Some("eng".into()),
            confidence: 0.95,
            segments: vec![
                LanguageSegment { language: "eng".into(), start_seconds: 0.0, end_seconds: 90.0 },
                LanguageSegment { language: "jpn".into(), start_seconds: 90.0, end_seconds: 100.0 },
            ],
        };
        assert!((analysis.secondary_fraction() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn secondary_fraction_without_primary_is_zero() {
        let analysis = LanguageAnalysis {
            track_index: 1,
            primary_language: None,
            confidence: 0.0,
            segments: vec![],
        };
        assert_eq!(analysis.secondary_fraction(), 0.0);
    }

    #[test]
    fn plugin_field_lookup() {
        let mut set = AnalysisSet::default();
        set.plugin_metadata.insert(
            "radarr".into(),
            json!({"original_language": "jpn", "release_date": "2019-07-19"}),
        );
        assert_eq!(
            set.plugin_field("radarr", "original_language"),
            Some(&json!("jpn"))
        );
        assert_eq!(set.plugin_field("radarr", "nope"), None);
        assert_eq!(set.plugin_field("sonarr", "anything"), None);
        assert_eq!(set.resolved_content_language().as_deref(), Some("jpn"));
        assert_eq!(set.release_date(None).as_deref(), Some("2019-07-19"));
        assert_eq!(set.release_date(Some("sonarr")), None);
    }

    #[test]
    fn explicit_content_language_wins() {
        let mut set = AnalysisSet::default();
        set.content_language = Some("kor".into());
        set.plugin_metadata
            .insert("radarr".into(), json!({"original_language": "jpn"}));
        assert_eq!(set.resolved_content_language().as_deref(), Some("kor"));
    }
}
