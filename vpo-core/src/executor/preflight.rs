//! Pre-mutation checks. Everything here runs before the backup is taken;
//! a failure leaves the file untouched.

use std::path::Path;

use tracing::debug;
use vpo_model::policy::IncompatibleCodecBehavior;
use vpo_model::{FileInfo, Plan, PlannedAction, TrackKind};

use crate::error::{CoreError, Result};
use crate::tools::{Tool, ToolRegistry};

use super::Strategy;

/// Output-size ratios by target video codec, used to reserve disk space.
/// Estimates; a policy can override via `transcode.video.output_ratio`.
fn codec_output_ratio(codec: &str) -> f64 {
    match vpo_model::policy::normalize_codec(codec).as_str() {
        "hevc" | "av1" => 0.5,
        "h264" => 0.8,
        _ => 1.0,
    }
}

/// Bytes that must be free before the run starts.
pub fn required_bytes(plan: &Plan, file: &FileInfo, strategy: Strategy, ratio_override: Option<f64>) -> u64 {
    match strategy {
        // In-place edit: the full-copy backup is the only new data.
        Strategy::MkvPropedit => file.size_bytes,
        Strategy::StreamCopy => file.size_bytes,
        Strategy::RemuxTranscode => {
            let ratio = ratio_override.unwrap_or_else(|| {
                plan.actions
                    .iter()
                    .find_map(|a| match a {
                        PlannedAction::TranscodeVideo { target_codec, .. } => {
                            Some(codec_output_ratio(target_codec))
                        }
                        _ => None,
                    })
                    .unwrap_or(1.0)
            });
            (file.size_bytes as f64 * ratio) as u64
        }
    }
}

/// Disk-space preflight: the target directory must hold the estimated
/// output. Exactly-equal space passes.
pub fn check_disk_space(
    plan: &Plan,
    file: &FileInfo,
    strategy: Strategy,
    target_dir: &Path,
    ratio_override: Option<f64>,
) -> Result<()> {
    let needed = required_bytes(plan, file, strategy, ratio_override);
    let available = fs2::available_space(target_dir).map_err(|e| {
        CoreError::Preflight(format!(
            "cannot stat filesystem of {}: {e}",
            target_dir.display()
        ))
    })?;
    debug!(needed, available, dir = %target_dir.display(), "disk space preflight");
    if available < needed {
        return Err(CoreError::InsufficientDiskSpace {
            needed_bytes: needed,
            available_bytes: available,
            dir: target_dir.to_path_buf(),
        });
    }
    Ok(())
}

/// Tools the chosen strategy needs.
pub fn check_tools(registry: &ToolRegistry, strategy: Strategy) -> Result<()> {
    match strategy {
        Strategy::MkvPropedit => registry.require(Tool::Mkvpropedit).map(|_| ()),
        Strategy::StreamCopy | Strategy::RemuxTranscode => {
            registry.require(Tool::Ffmpeg).map(|_| ())
        }
    }
}

/// Build-capability preflight: muxers, filters, and audio encoders the
/// plan relies on must be present in the ffmpeg build.
pub fn check_capabilities(registry: &ToolRegistry, plan: &Plan) -> Result<()> {
    if !matches!(select_for_capabilities(plan), Strategy::RemuxTranscode) {
        return Ok(());
    }

    let target_container = plan
        .actions
        .iter()
        .find_map(|a| match a {
            PlannedAction::RemuxTo { target_container } => Some(target_container.as_str()),
            _ => None,
        })
        .unwrap_or(plan.source_container.as_str());
    let muxer = match target_container {
        "mkv" => "matroska",
        other => other,
    };
    if !registry.has_muxer(muxer) {
        return Err(CoreError::Preflight(format!(
            "ffmpeg build has no {muxer} muxer, required to write {target_container}"
        )));
    }

    for action in &plan.actions {
        match action {
            PlannedAction::SynthesizeAudio { spec } => {
                if spec.downmix_filter.as_deref().is_some_and(|f| f.starts_with("pan="))
                    && !registry.has_filter("pan")
                {
                    return Err(CoreError::Preflight(
                        "ffmpeg build has no pan filter, required for audio downmix".into(),
                    ));
                }
                check_audio_encoder(registry, &spec.codec)?;
            }
            PlannedAction::TranscodeAudio { target_codec, .. } => {
                check_audio_encoder(registry, target_codec)?;
            }
            _ => {}
        }
    }
    Ok(())
}

fn check_audio_encoder(registry: &ToolRegistry, codec: &str) -> Result<()> {
    let encoder = super::command::audio_encoder_for(codec);
    if !registry.has_encoder(encoder) {
        return Err(CoreError::Preflight(format!(
            "ffmpeg build has no {encoder} encoder, required for {codec} audio"
        )));
    }
    Ok(())
}

fn select_for_capabilities(plan: &Plan) -> Strategy {
    if plan.has_rewrite_actions() {
        Strategy::RemuxTranscode
    } else {
        Strategy::StreamCopy
    }
}

/// Codecs a container cannot hold.
fn incompatible_with(container: &str, kind: TrackKind, codec: &str) -> bool {
    let codec = codec.to_ascii_lowercase();
    match container {
        "mp4" => match kind {
            TrackKind::Subtitle => matches!(
                codec.as_str(),
                "hdmv_pgs_subtitle" | "dvd_subtitle" | "dvb_subtitle" | "vobsub" | "ass" | "ssa"
            ),
            TrackKind::Audio => matches!(codec.as_str(), "truehd" | "mlp"),
            _ => false,
        },
        _ => false,
    }
}

/// Container-conversion compatibility. Returns `true` to proceed,
/// `false` to skip the file (behavior `skip`); `error` raises typed,
/// `transcode` tolerates streams the plan re-encodes anyway.
pub fn check_container_compatibility(
    plan: &Plan,
    file: &FileInfo,
    behavior: IncompatibleCodecBehavior,
) -> Result<bool> {
    let Some(target) = plan.actions.iter().find_map(|a| match a {
        PlannedAction::RemuxTo { target_container } => Some(target_container.clone()),
        _ => None,
    }) else {
        return Ok(true);
    };

    let removed: Vec<usize> = plan
        .actions
        .iter()
        .filter_map(|a| match a {
            PlannedAction::RemoveTrack { track_index, .. } => Some(*track_index),
            _ => None,
        })
        .collect();
    let transcoded: Vec<usize> = plan
        .actions
        .iter()
        .filter_map(|a| match a {
            PlannedAction::TranscodeVideo { track_index, .. }
            | PlannedAction::TranscodeAudio { track_index, .. } => Some(*track_index),
            _ => None,
        })
        .collect();

    for track in &file.tracks {
        if removed.contains(&track.index) {
            continue;
        }
        // A stream the probe could not identify cannot be remuxed safely.
        let unknown = track.codec.is_none() && track.kind != TrackKind::Attachment;
        let incompatible =
            unknown || incompatible_with(&target, track.kind, &track.codec_lower());
        if !incompatible {
            continue;
        }
        if behavior == IncompatibleCodecBehavior::Transcode && transcoded.contains(&track.index) {
            continue;
        }
        match behavior {
            IncompatibleCodecBehavior::Skip => {
                return Ok(false);
            }
            _ => {
                return Err(CoreError::IncompatibleCodec {
                    stream_index: track.index,
                    codec: track.codec.clone().unwrap_or_else(|| "unknown".into()),
                    container: target,
                });
            }
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::test_support::*;
    use crate::tools::test_support::fake_registry;

    fn plan_with(actions: Vec<PlannedAction>) -> Plan {
        let mut plan = Plan::new("/m/movie.avi".into(), "avi".into());
        plan.actions = actions;
        plan
    }

    #[test]
    fn ratio_table() {
        assert_eq!(codec_output_ratio("hevc"), 0.5);
        assert_eq!(codec_output_ratio("h265"), 0.5);
        assert_eq!(codec_output_ratio("h264"), 0.8);
        assert_eq!(codec_output_ratio("mpeg2video"), 1.0);
    }

    #[test]
    fn required_bytes_uses_ratio_and_override() {
        let file = file_with(vec![video_track(0, "h264", 2160)]);
        let plan = plan_with(vec![PlannedAction::TranscodeVideo {
            track_index: 0,
            source_codec: "h264".into(),
            target_codec: "hevc".into(),
        }]);
        let size = file.size_bytes;
        assert_eq!(
            required_bytes(&plan, &file, Strategy::RemuxTranscode, None),
            size / 2
        );
        assert_eq!(
            required_bytes(&plan, &file, Strategy::RemuxTranscode, Some(0.75)),
            (size as f64 * 0.75) as u64
        );
    }

    #[test]
    fn disk_space_passes_on_real_tempdir() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = file_with(vec![video_track(0, "h264", 1080)]);
        file.size_bytes = 1024; // tiny
        let plan = plan_with(vec![]);
        assert!(check_disk_space(&plan, &file, Strategy::StreamCopy, dir.path(), None).is_ok());
    }

    #[test]
    fn missing_muxer_is_preflight_error() {
        let registry = fake_registry((6, 0, 0), &[], &["mp4"], &[]);
        let plan = plan_with(vec![PlannedAction::RemuxTo { target_container: "mkv".into() }]);
        let err = check_capabilities(&registry, &plan).unwrap_err();
        assert!(matches!(err, CoreError::Preflight(_)));
    }

    #[test]
    fn missing_audio_encoder_is_preflight_error() {
        let registry = fake_registry((6, 0, 0), &["aac"], &["matroska"], &[]);
        let plan = plan_with(vec![PlannedAction::TranscodeAudio {
            track_index: 1,
            source_codec: "dts".into(),
            target_codec: "opus".into(),
            target_bitrate: None,
            downmix_channels: None,
        }]);
        let err = check_capabilities(&registry, &plan).unwrap_err();
        assert!(matches!(err, CoreError::Preflight(_)));
    }

    #[test]
    fn incompatible_codec_error_names_stream() {
        // AVI with an unidentifiable stream converting to MKV.
        let mut file = file_with(vec![video_track(0, "h264", 1080), audio_track(1, "ac3", "eng", 6)]);
        file.container = "avi".into();
        file.tracks[1].codec = None;
        let plan = plan_with(vec![PlannedAction::RemuxTo { target_container: "mkv".into() }]);
        let err =
            check_container_compatibility(&plan, &file, IncompatibleCodecBehavior::Error)
                .unwrap_err();
        match err {
            CoreError::IncompatibleCodec { stream_index, container, .. } => {
                assert_eq!(stream_index, 1);
                assert_eq!(container, "mkv");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn incompatible_codec_skip_behavior() {
        let mut file = file_with(vec![
            video_track(0, "h264", 1080),
            subtitle_track(2, "eng"),
        ]);
        file.tracks[1].codec = Some("hdmv_pgs_subtitle".into());
        let plan = plan_with(vec![PlannedAction::RemuxTo { target_container: "mp4".into() }]);
        let proceed =
            check_container_compatibility(&plan, &file, IncompatibleCodecBehavior::Skip).unwrap();
        assert!(!proceed);
    }

    #[test]
    fn compatible_conversion_proceeds() {
        let file = file_with(vec![video_track(0, "h264", 1080), audio_track(1, "aac", "eng", 2)]);
        let plan = plan_with(vec![PlannedAction::RemuxTo { target_container: "mp4".into() }]);
        assert!(
            check_container_compatibility(&plan, &file, IncompatibleCodecBehavior::Error).unwrap()
        );
    }

    #[test]
    fn removed_streams_do_not_block_conversion() {
        let mut file = file_with(vec![
            video_track(0, "h264", 1080),
            audio_track(1, "truehd", "eng", 8),
        ]);
        file.container = "mkv".into();
        let plan = plan_with(vec![
            PlannedAction::RemuxTo { target_container: "mp4".into() },
            PlannedAction::RemoveTrack {
                track_index: 1,
                kind_removed: TrackKind::Audio,
                reason: "test".into(),
            },
        ]);
        assert!(
            check_container_compatibility(&plan, &file, IncompatibleCodecBehavior::Error).unwrap()
        );
    }
}
