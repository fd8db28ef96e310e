//! Audio synthesis definitions.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::conditions::StringOrList;
use super::filters::ExistingTrackMatch;
use super::rules::ConditionOrExpr;

/// Codecs a synthesis target may use.
pub const VALID_SYNTHESIS_CODECS: &[&str] = &["aac", "ac3", "eac3", "opus", "flac", "mp3"];

/// Named channel layouts accepted alongside raw counts.
pub const VALID_CHANNEL_CONFIGS: &[(&str, u32)] =
    &[("mono", 1), ("stereo", 2), ("5.1", 6), ("7.1", 8)];

static BITRATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+(\.\d+)?[kKmM]?$").expect("bitrate regex"));

/// Channel target: a named layout or a raw 1-8 count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChannelTarget {
    Named(String),
    Count(u32),
}

impl ChannelTarget {
    pub fn channel_count(&self) -> Option<u32> {
        match self {
            Self::Count(n) => Some(*n),
            Self::Named(name) => VALID_CHANNEL_CONFIGS
                .iter()
                .find(|(label, _)| *label == name.to_ascii_lowercase())
                .map(|(_, count)| *count),
        }
    }
}

/// Channel preference when scoring source tracks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelPreference {
    Max,
    Min,
}

/// One source-selection criterion. At least one key must be set.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PreferenceCriterion {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<StringOrList>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_commentary: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<ChannelPreference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codec: Option<StringOrList>,
}

impl PreferenceCriterion {
    pub fn validate(&self) -> Result<(), String> {
        if self.language.is_none()
            && self.not_commentary.is_none()
            && self.channels.is_none()
            && self.codec.is_none()
        {
            return Err(
                "source.prefer criterion must specify at least one of: \
                 language, not_commentary, channels, codec"
                    .into(),
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourcePreferences {
    pub prefer: Vec<PreferenceCriterion>,
}

fn default_inherit() -> String {
    "inherit".to_string()
}

/// Placement of the synthesized track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PositionSpec {
    Keyword(String),
    Index(usize),
}

fn default_position() -> PositionSpec {
    PositionSpec::Keyword("end".into())
}

/// One synthesized-track definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SynthesisTrack {
    /// Path-safe name; appears in temp-file paths.
    pub name: String,
    pub codec: String,
    pub channels: ChannelTarget,
    pub source: SourcePreferences,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_if: Option<ConditionOrExpr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_if_exists: Option<ExistingTrackMatch>,
    /// `"inherit"` or a literal title.
    #[serde(default = "default_inherit")]
    pub title: String,
    /// `"inherit"` or an ISO 639-2 code.
    #[serde(default = "default_inherit")]
    pub language: String,
    #[serde(default = "default_position")]
    pub position: PositionSpec,
}

impl SynthesisTrack {
    /// Names appear in temp-file paths; reject separators and `..` so a
    /// policy cannot steer writes outside the working directory.
    pub fn validate(&self) -> Result<(), String> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err("synthesis track name cannot be empty".into());
        }
        if name.contains('/') || name.contains('\\') || name.contains("..") {
            return Err(format!(
                "synthesis track name cannot contain path separators or '..': {name:?}"
            ));
        }

        let codec = self.codec.to_ascii_lowercase();
        if !VALID_SYNTHESIS_CODECS.contains(&codec.as_str()) {
            return Err(format!(
                "invalid synthesis codec {:?}; must be one of: {}",
                self.codec,
                VALID_SYNTHESIS_CODECS.join(", ")
            ));
        }

        match &self.channels {
            ChannelTarget::Count(n) if !(1..=8).contains(n) => {
                return Err(format!("channel count must be 1-8, got {n}"));
            }
            ChannelTarget::Named(name) if self.channels.channel_count().is_none() => {
                return Err(format!(
                    "invalid channel config {name:?}; use mono, stereo, 5.1, 7.1 or 1-8"
                ));
            }
            _ => {}
        }

        if let Some(bitrate) = &self.bitrate {
            if !BITRATE_RE.is_match(bitrate) {
                return Err(format!(
                    "invalid bitrate format {bitrate:?}; use forms like 640k or 1.5M"
                ));
            }
        }

        if self.language != "inherit" {
            let lang = self.language.to_ascii_lowercase();
            if !(2..=3).contains(&lang.len()) || !lang.chars().all(|c| c.is_ascii_lowercase()) {
                return Err(format!(
                    "invalid language code {:?}; use ISO 639-2 codes or 'inherit'",
                    self.language
                ));
            }
        }

        if let PositionSpec::Keyword(kw) = &self.position {
            if kw != "after_source" && kw != "end" {
                return Err(format!(
                    "invalid position {kw:?}; use after_source, end, or a 1-based index"
                ));
            }
        }
        if let PositionSpec::Index(i) = &self.position {
            if *i < 1 {
                return Err("position must be >= 1 when given as an index".into());
            }
        }

        for criterion in &self.source.prefer {
            criterion.validate()?;
        }
        if self.source.prefer.is_empty() {
            return Err("source.prefer must have at least one criterion".into());
        }

        if let Some(ConditionOrExpr::Structured(cond)) = &self.create_if {
            cond.validate()?;
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AudioSynthesisConfig {
    pub tracks: Vec<SynthesisTrack>,
}

impl AudioSynthesisConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.tracks.is_empty() {
            return Err("audio_synthesis.tracks must have at least one track".into());
        }
        let mut names = std::collections::BTreeSet::new();
        for track in &self.tracks {
            track.validate()?;
            if !names.insert(track.name.as_str()) {
                return Err(format!("duplicate synthesis track name: {:?}", track.name));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_track() -> SynthesisTrack {
        serde_yaml::from_str(
            r#"
name: stereo
codec: aac
channels: stereo
bitrate: 192k
source:
  prefer:
    - language: eng
    - channels: max
"#,
        )
        .unwrap()
    }

    #[test]
    fn valid_track_passes() {
        assert!(base_track().validate().is_ok());
    }

    #[test]
    fn path_traversal_names_rejected() {
        for bad in ["../evil", "a/b", "a\\b", "x..y", ""] {
            let mut track = base_track();
            track.name = bad.into();
            assert!(track.validate().is_err(), "expected rejection for {bad:?}");
        }
    }

    #[test]
    fn invalid_codec_rejected() {
        let mut track = base_track();
        track.codec = "dts".into();
        assert!(track.validate().is_err());
    }

    #[test]
    fn channel_targets_resolve() {
        assert_eq!(ChannelTarget::Named("stereo".into()).channel_count(), Some(2));
        assert_eq!(ChannelTarget::Named("5.1".into()).channel_count(), Some(6));
        assert_eq!(ChannelTarget::Count(6).channel_count(), Some(6));
        assert_eq!(ChannelTarget::Named("quad".into()).channel_count(), None);
    }

    #[test]
    fn duplicate_names_rejected() {
        let cfg = AudioSynthesisConfig {
            tracks: vec![base_track(), base_track()],
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn bitrate_format_enforced() {
        let mut track = base_track();
        track.bitrate = Some("lots".into());
        assert!(track.validate().is_err());
        track.bitrate = Some("1.5M".into());
        assert!(track.validate().is_ok());
    }
}
