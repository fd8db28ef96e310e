//! Transcode targets and codec matching.

use serde::{Deserialize, Serialize};

/// Hardware-acceleration preference for video encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HardwareMode {
    Auto,
    Nvenc,
    Qsv,
    Vaapi,
    None,
}

impl Default for HardwareMode {
    fn default() -> Self {
        Self::Auto
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VideoTranscodeConfig {
    /// Target codec name (`hevc`, `h264`, `av1`).
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crf: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preset: Option<String>,
    #[serde(default)]
    pub hardware: HardwareMode,
    #[serde(default = "default_true")]
    pub fallback_to_software: bool,
    /// Overrides the built-in output-size ratio used by the disk-space
    /// preflight for this codec.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_ratio: Option<f64>,
}

/// Extra downmix track derived from the highest-channel source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DownmixConfig {
    /// Target channel count (2 for stereo, 6 for 5.1).
    pub channels: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AudioTranscodeConfig {
    /// Codec patterns to stream-copy; supports wildcards and alias groups.
    #[serde(default)]
    pub preserve: Vec<String>,
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downmix: Option<DownmixConfig>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TranscodeConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video: Option<VideoTranscodeConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<AudioTranscodeConfig>,
}

/// Codec names that refer to the same encoding family.
pub const CODEC_ALIASES: &[(&str, &[&str])] = &[
    ("hevc", &["h265", "x265", "hev1", "hvc1"]),
    ("h264", &["avc", "avc1", "x264"]),
    ("av1", &["libaom-av1", "av01"]),
    ("vp9", &["libvpx-vp9"]),
    ("truehd", &["dolby truehd"]),
    ("dts-hd", &["dts-hd ma", "dtshd", "dts_hd"]),
    ("dts", &["dca"]),
    ("pcm", &["pcm_s16le", "pcm_s24le", "pcm_s32le", "pcm_f32le"]),
    ("aac", &["aac_latm"]),
    ("ac3", &["ac-3", "a52"]),
    ("eac3", &["e-ac-3", "ec3"]),
    ("mp3", &["mp3float"]),
];

/// Normalize a codec name for comparison.
pub fn normalize_codec(codec: &str) -> String {
    let lowered = codec.trim().to_ascii_lowercase();
    for (canonical, aliases) in CODEC_ALIASES {
        if lowered == *canonical || aliases.contains(&lowered.as_str()) {
            return (*canonical).to_string();
        }
    }
    lowered
}

/// Whether two codec names refer to the same codec after alias resolution.
/// `hevc`/`h265` are the same; `h264` is distinct.
pub fn codecs_equivalent(a: &str, b: &str) -> bool {
    normalize_codec(a) == normalize_codec(b)
}

/// Match a probed codec against a preserve pattern. Patterns may be an
/// exact name, an alias-group name, or a wildcard (`pcm_*`).
pub fn codec_matches_pattern(codec: &str, pattern: &str) -> bool {
    let codec_norm = normalize_codec(codec);
    let codec_raw = codec.trim().to_ascii_lowercase();
    let pattern = pattern.trim().to_ascii_lowercase();

    if codec_norm == pattern || codec_raw == pattern {
        return true;
    }

    // Alias-group pattern: "dts" covers every dts variant.
    for (canonical, aliases) in CODEC_ALIASES {
        if pattern == *canonical {
            if codec_norm == *canonical {
                return true;
            }
            if aliases.iter().any(|a| codec_raw == *a || codec_raw.starts_with(canonical)) {
                return true;
            }
        }
    }

    // Wildcard pattern.
    if pattern.contains('*') || pattern.contains('?') {
        return wildcard_match(&codec_raw, &pattern);
    }

    false
}

/// fnmatch-style `*`/`?` matching without pulling in a glob crate.
fn wildcard_match(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    let pat: Vec<char> = pattern.chars().collect();
    // Iterative backtracking over the single-star positions.
    let (mut t, mut p) = (0usize, 0usize);
    let (mut star, mut mark) = (None::<usize>, 0usize);
    while t < text.len() {
        if p < pat.len() && (pat[p] == '?' || pat[p] == text[t]) {
            t += 1;
            p += 1;
        } else if p < pat.len() && pat[p] == '*' {
            star = Some(p);
            mark = t;
            p += 1;
        } else if let Some(s) = star {
            p = s + 1;
            mark += 1;
            t = mark;
        } else {
            return false;
        }
    }
    while p < pat.len() && pat[p] == '*' {
        p += 1;
    }
    p == pat.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hevc_aliases_are_equivalent() {
        assert!(codecs_equivalent("hevc", "h265"));
        assert!(codecs_equivalent("x265", "hevc"));
        assert!(!codecs_equivalent("h264", "hevc"));
    }

    #[test]
    fn alias_group_patterns_match_variants() {
        assert!(codec_matches_pattern("dts-hd ma", "dts-hd"));
        assert!(codec_matches_pattern("dtshd", "dts-hd"));
        assert!(codec_matches_pattern("dca", "dts"));
        assert!(!codec_matches_pattern("ac3", "dts"));
    }

    #[test]
    fn wildcard_patterns() {
        assert!(codec_matches_pattern("pcm_s24le", "pcm_*"));
        assert!(codec_matches_pattern("truehd", "true*"));
        assert!(!codec_matches_pattern("aac", "pcm_*"));
    }

    #[test]
    fn config_defaults() {
        let yaml = r#"
video:
  target: hevc
audio:
  preserve: [truehd, dts-hd]
  target: eac3
  bitrate: 640k
"#;
        let cfg: TranscodeConfig = serde_yaml::from_str(yaml).unwrap();
        let video = cfg.video.unwrap();
        assert_eq!(video.hardware, HardwareMode::Auto);
        assert!(video.fallback_to_software);
        assert_eq!(cfg.audio.unwrap().preserve.len(), 2);
    }
}
