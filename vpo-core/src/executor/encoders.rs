//! Encoder selection with hardware preference and software fallback.

use tracing::{debug, info, warn};
use vpo_model::policy::HardwareMode;
use vpo_model::EncoderType;

use crate::error::{CoreError, Result};
use crate::tools::ToolRegistry;

/// Software encoders by target codec.
const SOFTWARE_ENCODERS: &[(&str, &str)] = &[
    ("hevc", "libx265"),
    ("h265", "libx265"),
    ("h264", "libx264"),
    ("vp9", "libvpx-vp9"),
    ("av1", "libaom-av1"),
];

/// Hardware encoders by (codec, platform).
const HARDWARE_ENCODERS: &[(&str, &str, &str)] = &[
    ("hevc", "nvenc", "hevc_nvenc"),
    ("hevc", "qsv", "hevc_qsv"),
    ("hevc", "vaapi", "hevc_vaapi"),
    ("h264", "nvenc", "h264_nvenc"),
    ("h264", "qsv", "h264_qsv"),
    ("h264", "vaapi", "h264_vaapi"),
    ("av1", "nvenc", "av1_nvenc"),
    ("av1", "qsv", "av1_qsv"),
];

/// `auto` tries platforms in this order.
const AUTO_PLATFORM_ORDER: [&str; 3] = ["nvenc", "qsv", "vaapi"];

/// Stderr fragments that point at a hardware-encoder failure rather than
/// bad input; seeing one makes the run eligible for a software retry.
const HW_ERROR_PATTERNS: [&str; 9] = [
    "cannot load",
    "not found",
    "cuda",
    "nvenc",
    "device",
    "memory",
    "initialization failed",
    "could not open",
    "resource",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncoderSelection {
    pub encoder: String,
    pub encoder_type: EncoderType,
    pub hw_platform: Option<String>,
    pub fallback_occurred: bool,
}

pub fn software_encoder(codec: &str) -> String {
    let codec = vpo_model::policy::normalize_codec(codec);
    SOFTWARE_ENCODERS
        .iter()
        .find(|(c, _)| *c == codec)
        .map(|(_, enc)| (*enc).to_string())
        .unwrap_or_else(|| "libx265".to_string())
}

fn hardware_encoder(codec: &str, platform: &str) -> Option<&'static str> {
    let codec = vpo_model::policy::normalize_codec(codec);
    HARDWARE_ENCODERS
        .iter()
        .find(|(c, p, _)| *c == codec && *p == platform)
        .map(|(_, _, enc)| *enc)
}

/// Pick an encoder for a target codec.
///
/// `auto` walks the platform priority order and takes the first encoder
/// that is both listed by the ffmpeg build and passes a runtime probe.
/// An explicit platform either works or falls back to software (when the
/// policy allows) or fails typed.
pub async fn select_encoder(
    registry: &ToolRegistry,
    codec: &str,
    mode: HardwareMode,
    fallback_to_software: bool,
) -> Result<EncoderSelection> {
    match mode {
        HardwareMode::None => Ok(EncoderSelection {
            encoder: software_encoder(codec),
            encoder_type: EncoderType::Software,
            hw_platform: None,
            fallback_occurred: false,
        }),
        HardwareMode::Auto => {
            for platform in AUTO_PLATFORM_ORDER {
                if let Some(selection) = try_platform(registry, codec, platform).await {
                    return Ok(selection);
                }
            }
            debug!(codec, "no hardware encoder usable, using software");
            Ok(EncoderSelection {
                encoder: software_encoder(codec),
                encoder_type: EncoderType::Software,
                hw_platform: None,
                fallback_occurred: false,
            })
        }
        HardwareMode::Nvenc | HardwareMode::Qsv | HardwareMode::Vaapi => {
            let platform = match mode {
                HardwareMode::Nvenc => "nvenc",
                HardwareMode::Qsv => "qsv",
                _ => "vaapi",
            };
            if let Some(selection) = try_platform(registry, codec, platform).await {
                return Ok(selection);
            }
            if fallback_to_software {
                info!(codec, platform, "hardware encoder unavailable, falling back to software");
                return Ok(EncoderSelection {
                    encoder: software_encoder(codec),
                    encoder_type: EncoderType::Software,
                    hw_platform: None,
                    fallback_occurred: true,
                });
            }
            Err(CoreError::Preflight(format!(
                "hardware encoder for {codec} on {platform} is unavailable and \
                 software fallback is disabled"
            )))
        }
    }
}

async fn try_platform(
    registry: &ToolRegistry,
    codec: &str,
    platform: &str,
) -> Option<EncoderSelection> {
    let encoder = hardware_encoder(codec, platform)?;
    if !registry.has_encoder(encoder) {
        return None;
    }
    match registry.probe_encoder(encoder).await {
        Ok(true) => Some(EncoderSelection {
            encoder: encoder.to_string(),
            encoder_type: EncoderType::Hardware,
            hw_platform: Some(platform.to_string()),
            fallback_occurred: false,
        }),
        Ok(false) => {
            warn!(encoder, "encoder listed but runtime probe failed");
            None
        }
        Err(err) => {
            warn!(encoder, "encoder probe errored: {err}");
            None
        }
    }
}

/// Does captured stderr look like a hardware-encoder failure?
pub fn detect_hw_encoder_error(stderr_tail: &str) -> bool {
    let lowered = stderr_tail.to_ascii_lowercase();
    HW_ERROR_PATTERNS.iter().any(|p| lowered.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_support::fake_registry;

    #[test]
    fn software_mapping() {
        assert_eq!(software_encoder("hevc"), "libx265");
        assert_eq!(software_encoder("h265"), "libx265");
        assert_eq!(software_encoder("h264"), "libx264");
        assert_eq!(software_encoder("av1"), "libaom-av1");
    }

    #[tokio::test]
    async fn none_mode_is_always_software() {
        let registry = fake_registry((6, 0, 0), &["hevc_nvenc"], &[], &[]);
        let selection = select_encoder(&registry, "hevc", HardwareMode::None, true)
            .await
            .unwrap();
        assert_eq!(selection.encoder, "libx265");
        assert_eq!(selection.encoder_type, vpo_model::EncoderType::Software);
        assert!(!selection.fallback_occurred);
    }

    #[tokio::test]
    async fn explicit_platform_not_listed_falls_back() {
        // nvenc is not in the build's encoder list, so no probe is ever
        // attempted and software fallback engages.
        let registry = fake_registry((6, 0, 0), &["libx265"], &[], &[]);
        let selection = select_encoder(&registry, "hevc", HardwareMode::Nvenc, true)
            .await
            .unwrap();
        assert_eq!(selection.encoder, "libx265");
        assert!(selection.fallback_occurred);
    }

    #[tokio::test]
    async fn explicit_platform_without_fallback_fails_typed() {
        let registry = fake_registry((6, 0, 0), &["libx265"], &[], &[]);
        let err = select_encoder(&registry, "hevc", HardwareMode::Qsv, false)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Preflight(_)));
    }

    #[test]
    fn hw_error_patterns() {
        assert!(detect_hw_encoder_error(
            "[hevc_nvenc @ 0x5631] Cannot load libnvidia-encode.so.1"
        ));
        assert!(detect_hw_encoder_error("Device creation failed: -12."));
        assert!(detect_hw_encoder_error("CUDA error: out of memory"));
        assert!(!detect_hw_encoder_error(
            "Invalid data found when processing input"
        ));
    }
}
