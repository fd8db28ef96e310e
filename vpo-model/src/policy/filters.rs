//! Track filtering, default-flag, container, and timestamp configuration.

use serde::{Deserialize, Serialize};

use super::conditions::StringOrList;

/// What to do when language filtering would leave fewer audio tracks than
/// the configured minimum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LanguageFallback {
    /// Keep tracks matching the externally-detected original language.
    ContentLanguage,
    /// Disable filtering for this file.
    KeepAll,
    /// Keep the first N tracks to meet the minimum.
    KeepFirst,
    /// Fail the evaluation.
    Error,
}

fn default_minimum() -> usize {
    1
}

fn default_true() -> bool {
    true
}

/// Audio track filtering. Tracks whose language is not in `languages` are
/// removed, subject to the minimum/fallback and the classification
/// exemptions (music, sfx, non-speech tracks detected by analysis).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AudioFilter {
    pub languages: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<LanguageFallback>,
    #[serde(default = "default_minimum")]
    pub minimum: usize,
    #[serde(default = "default_true")]
    pub keep_music_tracks: bool,
    #[serde(default = "default_true")]
    pub keep_sfx_tracks: bool,
    #[serde(default = "default_true")]
    pub keep_non_speech_tracks: bool,
}

impl AudioFilter {
    pub fn validate(&self) -> Result<(), String> {
        if self.languages.is_empty() {
            return Err("track_filter.audio.languages cannot be empty".into());
        }
        if self.minimum < 1 {
            return Err("track_filter.audio.minimum must be at least 1".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SubtitleFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub languages: Option<Vec<String>>,
    pub preserve_forced: bool,
    /// Overrides everything else when set.
    pub remove_all: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct AttachmentFilter {
    pub remove_all: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TrackFilterConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<AudioFilter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subtitles: Option<SubtitleFilter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachments: Option<AttachmentFilter>,
}

/// Pre-filter cleanup applied to audio or subtitle tracks before any
/// filtering decisions are made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TrackActionsConfig {
    pub clear_all_forced: bool,
    pub clear_all_default: bool,
    pub clear_all_titles: bool,
}

impl TrackActionsConfig {
    pub fn is_empty(&self) -> bool {
        !(self.clear_all_forced || self.clear_all_default || self.clear_all_titles)
    }
}

/// Desired default/forced flag layout after filtering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DefaultFlagsConfig {
    pub set_first_video_default: bool,
    pub set_preferred_audio_default: bool,
    /// Preference list, first match wins.
    pub audio_language_preference: Vec<String>,
    pub set_preferred_subtitle_default: bool,
    pub subtitle_language_preference: Vec<String>,
    pub clear_other_defaults: bool,
    /// Force-flag the preferred subtitle when the chosen default audio
    /// language differs from the first audio preference.
    pub set_subtitle_forced_when_audio_differs: bool,
}

impl Default for DefaultFlagsConfig {
    fn default() -> Self {
        Self {
            set_first_video_default: true,
            set_preferred_audio_default: true,
            audio_language_preference: Vec::new(),
            set_preferred_subtitle_default: false,
            subtitle_language_preference: Vec::new(),
            clear_other_defaults: true,
            set_subtitle_forced_when_audio_differs: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerTarget {
    Mkv,
    Mp4,
}

impl ContainerTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mkv => "mkv",
            Self::Mp4 => "mp4",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncompatibleCodecBehavior {
    Error,
    Skip,
    Transcode,
}

fn default_incompatible() -> IncompatibleCodecBehavior {
    IncompatibleCodecBehavior::Error
}

/// Lossless remux to a target container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContainerConfig {
    pub target: ContainerTarget,
    #[serde(default = "default_incompatible")]
    pub on_incompatible_codec: IncompatibleCodecBehavior,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampMode {
    Preserve,
    ReleaseDate,
    Now,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampFallback {
    Preserve,
    Now,
    Skip,
}

fn default_ts_mode() -> TimestampMode {
    TimestampMode::Preserve
}

fn default_ts_fallback() -> TimestampFallback {
    TimestampFallback::Preserve
}

/// File-mtime handling after a successful run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileTimestampConfig {
    #[serde(default = "default_ts_mode")]
    pub mode: TimestampMode,
    #[serde(default = "default_ts_fallback")]
    pub fallback: TimestampFallback,
    /// Plugin to read the release date from; None auto-detects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_source: Option<String>,
}

/// Container-level tag edits. An empty value string deletes the tag.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ContainerMetadataConfig {
    pub set: std::collections::BTreeMap<String, String>,
    pub delete: Vec<String>,
}

/// Codecs to stream-copy instead of re-encode, matched with wildcards and
/// alias groups.
pub type PreserveList = Vec<String>;

/// Track selection keys reused by synthesis skip_if_exists.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ExistingTrackMatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codec: Option<StringOrList>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<super::conditions::IntOrCompare>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<StringOrList>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_commentary: Option<bool>,
}
