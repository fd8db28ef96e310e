//! Canonical probe results.
//!
//! A [`FileInfo`] is the canonical description of one file on disk as the
//! probe tool reported it. It is immutable once produced; every successful
//! executor run invalidates it and the file must be re-probed.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Video,
    Audio,
    Subtitle,
    Attachment,
    Other,
}

impl TrackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Audio => "audio",
            Self::Subtitle => "subtitle",
            Self::Attachment => "attachment",
            Self::Other => "other",
        }
    }

    /// Map a probe `codec_type` onto a track kind.
    pub fn from_codec_type(codec_type: &str) -> Self {
        match codec_type.to_ascii_lowercase().as_str() {
            "video" => Self::Video,
            "audio" => Self::Audio,
            "subtitle" => Self::Subtitle,
            "attachment" => Self::Attachment,
            _ => Self::Other,
        }
    }
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HDR color metadata carried on video tracks.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HdrColorInfo {
    pub color_transfer: Option<String>,
    pub color_primaries: Option<String>,
    pub color_space: Option<String>,
    pub color_range: Option<String>,
}

impl HdrColorInfo {
    pub fn is_empty(&self) -> bool {
        self.color_transfer.is_none()
            && self.color_primaries.is_none()
            && self.color_space.is_none()
            && self.color_range.is_none()
    }

    /// PQ and HLG transfers mark HDR content.
    pub fn is_hdr(&self) -> bool {
        matches!(
            self.color_transfer.as_deref(),
            Some("smpte2084") | Some("arib-std-b67")
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoInfo {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<HdrColorInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioInfo {
    pub channels: Option<u32>,
    pub channel_layout: Option<String>,
}

/// One stream inside a probed file, identified by its zero-based index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub index: usize,
    pub kind: TrackKind,
    pub codec: Option<String>,
    /// ISO 639-2/B; `"und"` when the probe reported nothing usable.
    pub language: String,
    pub title: Option<String>,
    pub is_default: bool,
    pub is_forced: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<VideoInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<AudioInfo>,
}

impl Track {
    pub fn codec_lower(&self) -> String {
        self.codec
            .as_deref()
            .unwrap_or_default()
            .to_ascii_lowercase()
    }

    pub fn channels(&self) -> Option<u32> {
        self.audio.as_ref().and_then(|a| a.channels)
    }

    pub fn width(&self) -> Option<u32> {
        self.video.as_ref().and_then(|v| v.width)
    }

    pub fn height(&self) -> Option<u32> {
        self.video.as_ref().and_then(|v| v.height)
    }
}

/// Result of probing one file. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInfo {
    pub path: PathBuf,
    /// Normalized container tag (`mkv`, `mp4`, `avi`, ...).
    pub container: String,
    pub size_bytes: u64,
    pub modified_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    /// Container-level tags with lowercased keys; BTreeMap keeps
    /// serialization deterministic.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    pub tracks: Vec<Track>,
}

/// Container tags that name the same format.
const CONTAINER_ALIASES: &[(&str, &[&str])] = &[
    ("mkv", &["matroska", "webm", "mka", "mks"]),
    ("mp4", &["mov", "m4a", "m4v", "3gp", "3g2", "mj2", "isom"]),
    ("avi", &[]),
    ("mpegts", &["ts", "mts", "m2ts"]),
];

/// Normalize a probe `format_name` (possibly a comma-separated list) to a
/// canonical container tag.
pub fn normalize_container(format_name: &str) -> String {
    let lowered = format_name.to_ascii_lowercase();
    for part in lowered.split(',').map(str::trim) {
        for (canonical, aliases) in CONTAINER_ALIASES {
            if part == *canonical || aliases.contains(&part) {
                return (*canonical).to_string();
            }
        }
    }
    lowered
        .split(',')
        .next()
        .unwrap_or(&lowered)
        .trim()
        .to_string()
}

impl FileInfo {
    /// Container comparison with alias awareness: `matroska` == `mkv`.
    pub fn container_matches(&self, other: &str) -> bool {
        self.container == normalize_container(other)
    }

    pub fn is_matroska(&self) -> bool {
        self.container == "mkv"
    }

    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &Track> {
        self.tracks.iter().filter(move |t| t.kind == kind)
    }

    pub fn first_video_track(&self) -> Option<&Track> {
        self.tracks_of(TrackKind::Video).next()
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn track(index: usize, kind: TrackKind) -> Track {
        Track {
            index,
            kind,
            codec: None,
            language: "und".into(),
            title: None,
            is_default: false,
            is_forced: false,
            video: None,
            audio: None,
        }
    }

    #[test]
    fn container_normalization_treats_matroska_as_mkv() {
        assert_eq!(normalize_container("matroska,webm"), "mkv");
        assert_eq!(normalize_container("Matroska"), "mkv");
        assert_eq!(normalize_container("mov,mp4,m4a,3gp,3g2,mj2"), "mp4");
        assert_eq!(normalize_container("avi"), "avi");
        assert_eq!(normalize_container("flv"), "flv");
    }

    #[test]
    fn container_matches_is_alias_aware() {
        let info = FileInfo {
            path: "/x.mkv".into(),
            container: "mkv".into(),
            size_bytes: 0,
            modified_at: None,
            duration_seconds: None,
            tags: BTreeMap::new(),
            tracks: vec![],
        };
        assert!(info.container_matches("matroska"));
        assert!(info.container_matches("mkv"));
        assert!(!info.container_matches("mp4"));
    }

    #[test]
    fn tracks_of_filters_by_kind() {
        let info = FileInfo {
            path: "/x.mkv".into(),
            container: "mkv".into(),
            size_bytes: 0,
            modified_at: None,
            duration_seconds: None,
            tags: BTreeMap::new(),
            tracks: vec![
                track(0, TrackKind::Video),
                track(1, TrackKind::Audio),
                track(2, TrackKind::Audio),
                track(3, TrackKind::Subtitle),
            ],
        };
        assert_eq!(info.tracks_of(TrackKind::Audio).count(), 2);
        assert_eq!(info.first_video_track().map(|t| t.index), Some(0));
    }

    #[test]
    fn hdr_detection() {
        let hdr = HdrColorInfo {
            color_transfer: Some("smpte2084".into()),
            ..Default::default()
        };
        assert!(hdr.is_hdr());
        let sdr = HdrColorInfo {
            color_transfer: Some("bt709".into()),
            ..Default::default()
        };
        assert!(!sdr.is_hdr());
    }
}
