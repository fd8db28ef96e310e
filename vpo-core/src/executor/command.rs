//! Command construction for the three strategies.
//!
//! Builders return plain argument vectors so tests can assert on them
//! without spawning anything. Selectors follow each tool's conventions:
//! mkvpropedit tracks are 1-based, ffmpeg maps are 0-based input indices
//! and per-kind output ordinals.

use std::path::Path;

use vpo_model::{
    FileInfo, Plan, PlannedAction, SynthesisPosition, TrackKind,
};

use crate::error::{CoreError, Result};
use crate::tools::ToolRegistry;

use super::encoders::EncoderSelection;

/// Video-encode knobs resolved from the policy by the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct VideoEncodeSettings {
    pub crf: Option<u8>,
    pub bitrate: Option<String>,
    pub preset: Option<String>,
}

/// Map a target audio codec onto its ffmpeg encoder.
pub fn audio_encoder_for(codec: &str) -> &'static str {
    match codec.to_ascii_lowercase().as_str() {
        "aac" => "aac",
        "ac3" => "ac3",
        "eac3" => "eac3",
        "opus" => "libopus",
        "mp3" => "libmp3lame",
        "flac" => "flac",
        "vorbis" => "libvorbis",
        _ => "aac",
    }
}

/// Build mkvpropedit arguments for an in-place metadata edit.
pub fn build_mkvpropedit_args(plan: &Plan) -> Result<Vec<String>> {
    let mut args: Vec<String> = vec![plan.path.to_string_lossy().into_owned()];
    for action in &plan.actions {
        match action {
            PlannedAction::SetDefault { track_index, desired_value, .. }
            | PlannedAction::ClearDefault { track_index, desired_value, .. } => {
                args.push("--edit".into());
                args.push(format!("track:@{}", track_index + 1));
                args.push("--set".into());
                args.push(format!("flag-default={}", u8::from(*desired_value)));
            }
            PlannedAction::SetForced { track_index, desired_value, .. }
            | PlannedAction::ClearForced { track_index, desired_value, .. } => {
                args.push("--edit".into());
                args.push(format!("track:@{}", track_index + 1));
                args.push("--set".into());
                args.push(format!("flag-forced={}", u8::from(*desired_value)));
            }
            PlannedAction::SetTitle { track_index, desired_value, .. } => {
                args.push("--edit".into());
                args.push(format!("track:@{}", track_index + 1));
                match desired_value {
                    Some(title) => {
                        args.push("--set".into());
                        args.push(format!("name={title}"));
                    }
                    None => {
                        args.push("--delete".into());
                        args.push("name".into());
                    }
                }
            }
            PlannedAction::SetLanguage { track_index, desired_value, .. } => {
                args.push("--edit".into());
                args.push(format!("track:@{}", track_index + 1));
                args.push("--set".into());
                args.push(format!("language={desired_value}"));
            }
            PlannedAction::SetContainerMetadata { current_value, desired_value } => {
                args.push("--edit".into());
                args.push("info".into());
                if desired_value.is_empty() {
                    args.push("--delete".into());
                    args.push(current_value.clone());
                } else {
                    args.push("--set".into());
                    args.push(format!("{current_value}={desired_value}"));
                }
            }
            PlannedAction::SetFileMtime { .. } => {}
            other => {
                return Err(CoreError::Preflight(format!(
                    "mkvpropedit strategy cannot realize {other:?}"
                )));
            }
        }
    }
    Ok(args)
}

/// Final (default, forced) flags for a track after the plan's actions.
fn final_flags(file: &FileInfo, plan: &Plan, index: usize) -> Option<(bool, bool)> {
    let track = file.tracks.iter().find(|t| t.index == index)?;
    let mut flags = (track.is_default, track.is_forced);
    for action in &plan.actions {
        match action {
            PlannedAction::SetDefault { track_index, desired_value, .. }
            | PlannedAction::ClearDefault { track_index, desired_value, .. }
                if *track_index == index =>
            {
                flags.0 = *desired_value;
            }
            PlannedAction::SetForced { track_index, desired_value, .. }
            | PlannedAction::ClearForced { track_index, desired_value, .. }
                if *track_index == index =>
            {
                flags.1 = *desired_value;
            }
            _ => {}
        }
    }
    Some(flags)
}

fn disposition_value(default: bool, forced: bool) -> String {
    match (default, forced) {
        (true, true) => "default+forced".into(),
        (true, false) => "default".into(),
        (false, true) => "forced".into(),
        (false, false) => "0".into(),
    }
}

/// Tracks whose flags change, with their final disposition.
fn disposition_changes(file: &FileInfo, plan: &Plan) -> Vec<(usize, String)> {
    let mut indices: Vec<usize> = plan
        .actions
        .iter()
        .filter_map(|a| match a {
            PlannedAction::SetDefault { track_index, .. }
            | PlannedAction::ClearDefault { track_index, .. }
            | PlannedAction::SetForced { track_index, .. }
            | PlannedAction::ClearForced { track_index, .. } => Some(*track_index),
            _ => None,
        })
        .collect();
    indices.sort_unstable();
    indices.dedup();
    indices
        .into_iter()
        .filter_map(|index| {
            let (default, forced) = final_flags(file, plan, index)?;
            Some((index, disposition_value(default, forced)))
        })
        .collect()
}

/// ffmpeg stream-copy strategy: `-map 0 -c copy` with disposition and
/// metadata flags; for non-Matroska containers where mkvpropedit cannot
/// help.
pub fn build_stream_copy_args(plan: &Plan, file: &FileInfo, output: &Path) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-y".into(),
        "-i".into(),
        file.path.to_string_lossy().into_owned(),
        "-map".into(),
        "0".into(),
        "-c".into(),
        "copy".into(),
    ];

    for (index, disposition) in disposition_changes(file, plan) {
        args.push(format!("-disposition:{index}"));
        args.push(disposition);
    }

    for action in &plan.actions {
        match action {
            PlannedAction::SetTitle { track_index, desired_value, .. } => {
                args.push(format!("-metadata:s:{track_index}"));
                args.push(format!("title={}", desired_value.as_deref().unwrap_or("")));
            }
            PlannedAction::SetLanguage { track_index, desired_value, .. } => {
                args.push(format!("-metadata:s:{track_index}"));
                args.push(format!("language={desired_value}"));
            }
            PlannedAction::SetContainerMetadata { current_value, desired_value } => {
                args.push("-metadata".into());
                args.push(format!("{current_value}={desired_value}"));
            }
            _ => {}
        }
    }

    args.push(output.to_string_lossy().into_owned());
    args
}

/// One output stream in the remux plan.
#[derive(Debug, Clone, PartialEq)]
enum OutputEntry {
    /// Mapped from an input track.
    Input(usize),
    /// Synthesized from `filter_complex` label `syn{ordinal}`.
    Synth(usize),
}

/// ffmpeg remux/transcode strategy: explicit per-stream maps, re-encoding
/// where planned, synthesis via filter graphs.
pub fn build_remux_args(
    plan: &Plan,
    file: &FileInfo,
    output: &Path,
    video_encoder: Option<&EncoderSelection>,
    video_settings: &VideoEncodeSettings,
    registry: &ToolRegistry,
) -> Result<Vec<String>> {
    let removed: Vec<usize> = plan
        .actions
        .iter()
        .filter_map(|a| match a {
            PlannedAction::RemoveTrack { track_index, .. } => Some(*track_index),
            _ => None,
        })
        .collect();

    // Surviving inputs, honoring an explicit reorder when present.
    let explicit_order = plan.actions.iter().find_map(|a| match a {
        PlannedAction::Reorder { order } => Some(order.clone()),
        _ => None,
    });
    let surviving: Vec<usize> = match explicit_order {
        Some(order) => order.into_iter().filter(|i| !removed.contains(i)).collect(),
        None => file
            .tracks
            .iter()
            .map(|t| t.index)
            .filter(|i| !removed.contains(i))
            .collect(),
    };

    // Synthesis specs in plan order.
    let synth_specs: Vec<&vpo_model::SynthesisSpec> = plan
        .actions
        .iter()
        .filter_map(|a| match a {
            PlannedAction::SynthesizeAudio { spec } => Some(spec),
            _ => None,
        })
        .collect();

    // Assemble the output order: inputs first, then place each synthesized
    // track per its position directive.
    let mut entries: Vec<OutputEntry> = surviving.iter().copied().map(OutputEntry::Input).collect();
    for (ordinal, spec) in synth_specs.iter().enumerate() {
        let at = match &spec.position {
            SynthesisPosition::End => entries.len(),
            SynthesisPosition::AfterSource => entries
                .iter()
                .position(|e| *e == OutputEntry::Input(spec.source_index))
                .map(|p| p + 1)
                .unwrap_or(entries.len()),
            SynthesisPosition::Index(i) => (*i - 1).min(entries.len()),
        };
        entries.insert(at, OutputEntry::Synth(ordinal));
    }

    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-y".into(),
        "-i".into(),
        file.path.to_string_lossy().into_owned(),
    ];

    if registry.supports_stats_period() {
        args.push("-stats_period".into());
        args.push("1".into());
    } else {
        args.push("-stats".into());
    }

    // Filter graph for synthesized tracks.
    if !synth_specs.is_empty() {
        let chains: Vec<String> = synth_specs
            .iter()
            .enumerate()
            .map(|(ordinal, spec)| {
                let filter = spec
                    .downmix_filter
                    .clone()
                    .unwrap_or_else(|| "anull".to_string());
                format!("[0:{}]{}[syn{}]", spec.source_index, filter, ordinal)
            })
            .collect();
        args.push("-filter_complex".into());
        args.push(chains.join(";"));
    }

    for entry in &entries {
        args.push("-map".into());
        match entry {
            OutputEntry::Input(index) => args.push(format!("0:{index}")),
            OutputEntry::Synth(ordinal) => args.push(format!("[syn{ordinal}]")),
        }
    }

    // Per-output codec arguments, addressed by per-kind ordinal.
    let kind_of = |index: usize| -> TrackKind {
        file.tracks
            .iter()
            .find(|t| t.index == index)
            .map(|t| t.kind)
            .unwrap_or(TrackKind::Other)
    };
    let mut video_ordinal = 0usize;
    let mut audio_ordinal = 0usize;
    let mut subtitle_seen = false;
    let mut attachment_seen = false;

    for entry in &entries {
        match entry {
            OutputEntry::Input(index) => match kind_of(*index) {
                TrackKind::Video => {
                    let transcode = plan.actions.iter().find_map(|a| match a {
                        PlannedAction::TranscodeVideo { track_index, .. }
                            if track_index == index =>
                        {
                            Some(())
                        }
                        _ => None,
                    });
                    if transcode.is_some() {
                        let selection = video_encoder.ok_or_else(|| {
                            CoreError::Preflight(
                                "plan transcodes video but no encoder was selected".into(),
                            )
                        })?;
                        args.push(format!("-c:v:{video_ordinal}"));
                        args.push(selection.encoder.clone());
                        if let Some(crf) = video_settings.crf {
                            args.push(format!("-crf:v:{video_ordinal}"));
                            args.push(crf.to_string());
                        }
                        if let Some(bitrate) = &video_settings.bitrate {
                            args.push(format!("-b:v:{video_ordinal}"));
                            args.push(bitrate.clone());
                        }
                        if let Some(preset) = &video_settings.preset {
                            args.push(format!("-preset:v:{video_ordinal}"));
                            args.push(preset.clone());
                        }
                    } else {
                        args.push(format!("-c:v:{video_ordinal}"));
                        args.push("copy".into());
                    }
                    video_ordinal += 1;
                }
                TrackKind::Audio => {
                    let transcode = plan.actions.iter().find_map(|a| match a {
                        PlannedAction::TranscodeAudio {
                            track_index,
                            target_codec,
                            target_bitrate,
                            downmix_channels: None,
                            ..
                        } if track_index == index => {
                            Some((target_codec.clone(), target_bitrate.clone()))
                        }
                        _ => None,
                    });
                    match transcode {
                        Some((codec, bitrate)) => {
                            args.push(format!("-c:a:{audio_ordinal}"));
                            args.push(audio_encoder_for(&codec).to_string());
                            if let Some(bitrate) = bitrate {
                                args.push(format!("-b:a:{audio_ordinal}"));
                                args.push(bitrate);
                            }
                        }
                        None => {
                            args.push(format!("-c:a:{audio_ordinal}"));
                            args.push("copy".into());
                        }
                    }
                    audio_ordinal += 1;
                }
                TrackKind::Subtitle => subtitle_seen = true,
                TrackKind::Attachment | TrackKind::Other => attachment_seen = true,
            },
            OutputEntry::Synth(ordinal) => {
                let spec = synth_specs[*ordinal];
                args.push(format!("-c:a:{audio_ordinal}"));
                args.push(audio_encoder_for(&spec.codec).to_string());
                if let Some(bitrate) = &spec.bitrate {
                    args.push(format!("-b:a:{audio_ordinal}"));
                    args.push(bitrate.clone());
                }
                if spec.downmix_filter.is_none() {
                    args.push(format!("-ac:a:{audio_ordinal}"));
                    args.push(spec.channels.to_string());
                }
                // Synthesized stream metadata.
                let out_index = entries
                    .iter()
                    .position(|e| *e == OutputEntry::Synth(*ordinal))
                    .unwrap_or(0);
                args.push(format!("-metadata:s:{out_index}"));
                args.push(format!("language={}", spec.language));
                if let Some(title) = &spec.title {
                    args.push(format!("-metadata:s:{out_index}"));
                    args.push(format!("title={title}"));
                }
                audio_ordinal += 1;
            }
        }
    }

    // The policy's extra downmix track: same source mapped again.
    let downmixes: Vec<(usize, String, Option<String>, u32)> = plan
        .actions
        .iter()
        .filter_map(|a| match a {
            PlannedAction::TranscodeAudio {
                track_index,
                target_codec,
                target_bitrate,
                downmix_channels: Some(channels),
                ..
            } => Some((*track_index, target_codec.clone(), target_bitrate.clone(), *channels)),
            _ => None,
        })
        .collect();
    for (source, codec, bitrate, channels) in downmixes {
        args.push("-map".into());
        args.push(format!("0:{source}"));
        args.push(format!("-c:a:{audio_ordinal}"));
        args.push(audio_encoder_for(&codec).to_string());
        args.push(format!("-ac:a:{audio_ordinal}"));
        args.push(channels.to_string());
        if let Some(bitrate) = bitrate {
            args.push(format!("-b:a:{audio_ordinal}"));
            args.push(bitrate);
        }
        audio_ordinal += 1;
    }

    if subtitle_seen {
        let target_container = plan
            .actions
            .iter()
            .find_map(|a| match a {
                PlannedAction::RemuxTo { target_container } => Some(target_container.as_str()),
                _ => None,
            })
            .unwrap_or(plan.source_container.as_str());
        args.push("-c:s".into());
        // mp4 cannot carry text subtitles verbatim.
        args.push(if target_container == "mp4" { "mov_text" } else { "copy" }.into());
    }
    if attachment_seen {
        args.push("-c:t".into());
        args.push("copy".into());
    }

    // Disposition and metadata edits, addressed by output position.
    let out_position = |index: usize| -> Option<usize> {
        entries.iter().position(|e| *e == OutputEntry::Input(index))
    };
    for (index, disposition) in disposition_changes(file, plan) {
        if let Some(position) = out_position(index) {
            args.push(format!("-disposition:{position}"));
            args.push(disposition);
        }
    }
    for action in &plan.actions {
        match action {
            PlannedAction::SetTitle { track_index, desired_value, .. } => {
                if let Some(position) = out_position(*track_index) {
                    args.push(format!("-metadata:s:{position}"));
                    args.push(format!("title={}", desired_value.as_deref().unwrap_or("")));
                }
            }
            PlannedAction::SetLanguage { track_index, desired_value, .. } => {
                if let Some(position) = out_position(*track_index) {
                    args.push(format!("-metadata:s:{position}"));
                    args.push(format!("language={desired_value}"));
                }
            }
            PlannedAction::SetContainerMetadata { current_value, desired_value } => {
                args.push("-metadata".into());
                args.push(format!("{current_value}={desired_value}"));
            }
            _ => {}
        }
    }

    args.push(output.to_string_lossy().into_owned());
    Ok(args)
}
