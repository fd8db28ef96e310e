//! The policy document model.
//!
//! A policy is a schema-versioned YAML document whose top level is a list
//! of phases executed strictly in order. Loading validates everything up
//! front (unknown fields, expression syntax, synthesis names, size and
//! duration literals) so a bad policy never reaches the evaluator.

pub mod conditions;
pub mod filters;
pub mod rules;
pub mod synthesis;
pub mod transcode;

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};
use crate::units::{parse_duration_literal, parse_size_literal};

pub use conditions::{CompareOp, Condition, TrackSelector};
pub use filters::{
    AttachmentFilter, AudioFilter, ContainerConfig, ContainerMetadataConfig,
    DefaultFlagsConfig, FileTimestampConfig, IncompatibleCodecBehavior,
    LanguageFallback, SubtitleFilter, TimestampFallback, TimestampMode,
    TrackActionsConfig, TrackFilterConfig,
};
pub use rules::{
    ConditionOrExpr, ConditionalRule, ConditionalRulesConfig, PluginFieldRef,
    RuleAction, RuleMode,
};
pub use synthesis::{AudioSynthesisConfig, SynthesisTrack};
pub use transcode::{
    codec_matches_pattern, codecs_equivalent, normalize_codec, HardwareMode,
    TranscodeConfig,
};

pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Disjunction of concrete predicates; any match skips the phase.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SkipWhen {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_codec: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_codec_exists: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtitle_language_exists: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<Vec<String>>,
    /// Exact resolution label (`1080p`, `2160p`, `4k`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution_under: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size_under: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_size_over: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_under: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_over: Option<String>,
}

impl SkipWhen {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    fn validate(&self) -> std::result::Result<(), String> {
        for (label, value) in [
            ("file_size_under", &self.file_size_under),
            ("file_size_over", &self.file_size_over),
        ] {
            if let Some(raw) = value {
                parse_size_literal(raw)
                    .map_err(|e| format!("skip_when.{label}: {e}"))?;
            }
        }
        for (label, value) in [
            ("duration_under", &self.duration_under),
            ("duration_over", &self.duration_over),
        ] {
            if let Some(raw) = value {
                parse_duration_literal(raw)
                    .map_err(|e| format!("skip_when.{label}: {e}"))?;
            }
        }
        for (label, value) in [
            ("resolution", &self.resolution),
            ("resolution_under", &self.resolution_under),
        ] {
            if let Some(raw) = value {
                resolution_height(raw)
                    .ok_or_else(|| format!("skip_when.{label}: unknown resolution {raw:?}"))?;
            }
        }
        Ok(())
    }
}

/// Standard-definition labels mapped to frame heights.
pub fn resolution_height(label: &str) -> Option<u32> {
    match label.to_ascii_lowercase().as_str() {
        "480p" => Some(480),
        "576p" => Some(576),
        "720p" => Some(720),
        "1080p" => Some(1080),
        "1440p" => Some(1440),
        "2160p" | "4k" => Some(2160),
        "4320p" | "8k" => Some(4320),
        _ => None,
    }
}

/// Phase error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnError {
    Fail,
    Continue,
}

impl Default for OnError {
    fn default() -> Self {
        Self::Fail
    }
}

/// A named ordered unit of operations within a policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Phase {
    pub name: String,
    #[serde(default)]
    pub on_error: OnError,
    #[serde(default, skip_serializing_if = "SkipWhen::is_empty")]
    pub skip_when: SkipWhen,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditional_rules: Option<ConditionalRulesConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub track_filter: Option<TrackFilterConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_actions: Option<TrackActionsConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtitle_actions: Option<TrackActionsConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_flags: Option<DefaultFlagsConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_metadata: Option<ContainerMetadataConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_synthesis: Option<AudioSynthesisConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcode: Option<TranscodeConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_timestamp: Option<FileTimestampConfig>,
}

impl Phase {
    fn validate(&self) -> std::result::Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("phase name cannot be empty".into());
        }
        self.skip_when
            .validate()
            .map_err(|e| format!("phase {:?}: {e}", self.name))?;
        if let Some(rules) = &self.conditional_rules {
            rules
                .validate()
                .map_err(|e| format!("phase {:?}: {e}", self.name))?;
        }
        if let Some(filter) = &self.track_filter {
            if let Some(audio) = &filter.audio {
                audio
                    .validate()
                    .map_err(|e| format!("phase {:?}: {e}", self.name))?;
            }
        }
        if let Some(synthesis) = &self.audio_synthesis {
            synthesis
                .validate()
                .map_err(|e| format!("phase {:?}: {e}", self.name))?;
        }
        Ok(())
    }
}

fn default_schema_version() -> u32 {
    CURRENT_SCHEMA_VERSION
}

/// A loaded, validated policy document. Immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Policy {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub name: String,
    pub phases: Vec<Phase>,
}

impl Policy {
    /// Parse and validate a policy from YAML text.
    pub fn load(yaml: &str) -> Result<Self> {
        let policy: Policy = serde_yaml::from_str(yaml)?;
        policy.validate()?;
        Ok(policy)
    }

    /// Serialize back to YAML. `Policy::load(p.to_yaml()?) == p`.
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.schema_version != CURRENT_SCHEMA_VERSION {
            return Err(ModelError::UnsupportedSchemaVersion(self.schema_version));
        }
        if self.name.trim().is_empty() {
            return Err(ModelError::InvalidPolicy("policy name cannot be empty".into()));
        }
        let mut seen = std::collections::BTreeSet::new();
        for phase in &self.phases {
            phase.validate().map_err(ModelError::InvalidPolicy)?;
            if !seen.insert(phase.name.as_str()) {
                return Err(ModelError::InvalidPolicy(format!(
                    "duplicate phase name: {:?}",
                    phase.name
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL_POLICY: &str = r#"
schema_version: 1
name: movie-cleanup
phases:
  - name: normalize
    conditional_rules:
      mode: all
      rules:
        - name: force_english_subs_for_foreign_audio
          when: "not exists(audio, language==eng)"
          then:
            - set_forced:
                track_kind: subtitle
                language: eng
                value: true
    track_filter:
      audio:
        languages: [eng, und]
        fallback: keep_all
      subtitles:
        languages: [eng]
        preserve_forced: true
    default_flags:
      audio_language_preference: [eng]
  - name: encode
    skip_when:
      video_codec: [hevc, av1]
      file_size_under: 700M
    transcode:
      video:
        target: hevc
        crf: 22
        hardware: auto
      audio:
        preserve: [truehd, dts-hd]
        target: eac3
        bitrate: 640k
    file_timestamp:
      mode: preserve
"#;

    #[test]
    fn full_policy_loads() {
        let policy = Policy::load(FULL_POLICY).unwrap();
        assert_eq!(policy.name, "movie-cleanup");
        assert_eq!(policy.phases.len(), 2);
        assert!(policy.phases[0].conditional_rules.is_some());
        assert!(policy.phases[1].transcode.is_some());
    }

    #[test]
    fn load_serialize_round_trip() {
        let policy = Policy::load(FULL_POLICY).unwrap();
        let yaml = policy.to_yaml().unwrap();
        let reloaded = Policy::load(&yaml).unwrap();
        assert_eq!(reloaded, policy);
    }

    #[test]
    fn zero_phase_policy_is_valid() {
        let policy = Policy::load("name: empty\nphases: []\n").unwrap();
        assert!(policy.phases.is_empty());
    }

    #[test]
    fn unknown_fields_rejected() {
        let err = Policy::load("name: x\nphases: []\nbogus: 1\n");
        assert!(err.is_err());
    }

    #[test]
    fn bad_size_literal_rejected_at_load() {
        let yaml = r#"
name: x
phases:
  - name: p
    skip_when:
      file_size_under: "about a gig"
"#;
        assert!(Policy::load(yaml).is_err());
    }

    #[test]
    fn bad_expression_rejected_at_load() {
        let yaml = r#"
name: x
phases:
  - name: p
    conditional_rules:
      rules:
        - name: broken
          when: "exists(audio,,)"
          then: [skip_track_filter]
"#;
        assert!(Policy::load(yaml).is_err());
    }

    #[test]
    fn unsupported_schema_version_rejected() {
        let err = Policy::load("schema_version: 99\nname: x\nphases: []\n");
        assert!(matches!(err, Err(ModelError::UnsupportedSchemaVersion(99))));
    }

    #[test]
    fn duplicate_phase_names_rejected() {
        let yaml = r#"
name: x
phases:
  - name: p
  - name: p
"#;
        assert!(Policy::load(yaml).is_err());
    }

    #[test]
    fn resolution_labels() {
        assert_eq!(resolution_height("1080p"), Some(1080));
        assert_eq!(resolution_height("4K"), Some(2160));
        assert_eq!(resolution_height("potato"), None);
    }
}
