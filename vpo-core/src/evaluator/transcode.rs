//! Transcode planning: decide per-stream whether to copy or re-encode.

use tracing::debug;
use vpo_model::policy::{codec_matches_pattern, codecs_equivalent, TranscodeConfig};
use vpo_model::{PlannedAction, TrackKind};

use super::EvalContext;

pub(crate) fn plan_transcode(ctx: &mut EvalContext<'_>, cfg: &TranscodeConfig) {
    let mut actions: Vec<PlannedAction> = Vec::new();
    let mut any_encode = false;

    if let Some(video_cfg) = &cfg.video {
        if ctx.plan.skips.video_transcode {
            debug!("video transcode suppressed by skip flag");
        } else if let Some(video) = ctx.tracks_of(TrackKind::Video).next() {
            let codec = video.codec_lower();
            if !codec.is_empty() && !codecs_equivalent(&codec, &video_cfg.target) {
                actions.push(PlannedAction::TranscodeVideo {
                    track_index: video.index,
                    source_codec: codec,
                    target_codec: video_cfg.target.clone(),
                });
                any_encode = true;
            }
        }
    }

    if let Some(audio_cfg) = &cfg.audio {
        if ctx.plan.skips.audio_transcode {
            debug!("audio transcode suppressed by skip flag");
        } else {
            for track in ctx.tracks_of(TrackKind::Audio) {
                let codec = track.codec_lower();
                let preserved = audio_cfg
                    .preserve
                    .iter()
                    .any(|pattern| codec_matches_pattern(&codec, pattern));
                // A track already in the target codec is copied, not
                // re-encoded; that is what makes a second run a no-op.
                if preserved || codecs_equivalent(&codec, &audio_cfg.target) {
                    actions.push(PlannedAction::CopyStream { track_index: track.index });
                } else {
                    actions.push(PlannedAction::TranscodeAudio {
                        track_index: track.index,
                        source_codec: codec,
                        target_codec: audio_cfg.target.clone(),
                        target_bitrate: audio_cfg.bitrate.clone(),
                        downmix_channels: None,
                    });
                    any_encode = true;
                }
            }

            if let Some(downmix) = &audio_cfg.downmix {
                // Fed from the highest-channel surviving source, but only
                // when no surviving track already provides that layout.
                let already_present = ctx.tracks_of(TrackKind::Audio).any(|t| {
                    t.channels() == Some(downmix.channels)
                        && codecs_equivalent(&t.codec_lower(), &audio_cfg.target)
                });
                let source = ctx
                    .tracks_of(TrackKind::Audio)
                    .max_by_key(|t| (t.channels().unwrap_or(0), std::cmp::Reverse(t.index)));
                if let Some(source) = source {
                    if !already_present && source.channels().unwrap_or(0) > downmix.channels {
                        actions.push(PlannedAction::TranscodeAudio {
                            track_index: source.index,
                            source_codec: source.codec_lower(),
                            target_codec: audio_cfg.target.clone(),
                            target_bitrate: downmix
                                .bitrate
                                .clone()
                                .or_else(|| audio_cfg.bitrate.clone()),
                            downmix_channels: Some(downmix.channels),
                        });
                        any_encode = true;
                    }
                }
            }
        }
    }

    // COPY_STREAM entries only describe the mapping around real encode
    // work; a plan of nothing but copies is a finished plan.
    if any_encode {
        ctx.plan.actions.append(&mut actions);
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::analysis::AnalysisSet;
    use crate::evaluator::evaluate;
    use vpo_model::{PlannedAction, Policy};

    const POLICY: &str = r#"
name: t
phases:
  - name: p
    transcode:
      video:
        target: hevc
        crf: 22
      audio:
        preserve: [truehd, dts-hd]
        target: eac3
        bitrate: 640k
"#;

    #[test]
    fn h264_video_is_transcoded_preserved_audio_copied() {
        let policy = Policy::load(POLICY).unwrap();
        let file = file_with(vec![
            video_track(0, "h264", 2160),
            audio_track(1, "truehd", "eng", 8),
            audio_track(2, "aac", "eng", 2),
        ]);
        let plan = evaluate(&policy, &file, &AnalysisSet::default()).unwrap();
        assert_eq!(
            plan.actions,
            vec![
                PlannedAction::TranscodeVideo {
                    track_index: 0,
                    source_codec: "h264".into(),
                    target_codec: "hevc".into(),
                },
                PlannedAction::CopyStream { track_index: 1 },
                PlannedAction::TranscodeAudio {
                    track_index: 2,
                    source_codec: "aac".into(),
                    target_codec: "eac3".into(),
                    target_bitrate: Some("640k".into()),
                    downmix_channels: None,
                },
            ]
        );
    }

    #[test]
    fn hevc_source_is_not_retranscoded() {
        let policy = Policy::load(POLICY).unwrap();
        // h265 aliases to hevc; audio already preserved/eac3.
        let file = file_with(vec![
            video_track(0, "h265", 2160),
            audio_track(1, "truehd", "eng", 8),
            audio_track(2, "eac3", "eng", 6),
        ]);
        let plan = evaluate(&policy, &file, &AnalysisSet::default()).unwrap();
        assert!(plan.is_empty(), "expected empty plan, got {:?}", plan.actions);
    }

    #[test]
    fn skip_flags_drop_transcode_actions() {
        let policy = Policy::load(
            r#"
name: t
phases:
  - name: rules
    conditional_rules:
      rules:
        - name: no_video
          when: "exists(video)"
          then: [skip_video_transcode, skip_audio_transcode]
  - name: encode
    transcode:
      video:
        target: hevc
      audio:
        target: eac3
"#,
        )
        .unwrap();
        let file = file_with(vec![
            video_track(0, "h264", 1080),
            audio_track(1, "dts", "eng", 6),
        ]);
        let plan = evaluate(&policy, &file, &AnalysisSet::default()).unwrap();
        assert!(plan.is_empty());
        assert!(plan.skips.video_transcode);
        assert!(plan.skips.audio_transcode);
    }

    #[test]
    fn downmix_from_highest_channel_source() {
        let policy = Policy::load(
            r#"
name: t
phases:
  - name: p
    transcode:
      audio:
        preserve: [truehd]
        target: eac3
        bitrate: 640k
        downmix:
          channels: 2
          bitrate: 192k
"#,
        )
        .unwrap();
        let file = file_with(vec![
            audio_track(1, "truehd", "eng", 8),
            audio_track(2, "dts", "eng", 6),
        ]);
        let plan = evaluate(&policy, &file, &AnalysisSet::default()).unwrap();
        let downmix: Vec<_> = plan
            .actions
            .iter()
            .filter_map(|a| match a {
                PlannedAction::TranscodeAudio { downmix_channels: Some(2), track_index, target_bitrate, .. } => {
                    Some((*track_index, target_bitrate.clone()))
                }
                _ => None,
            })
            .collect();
        assert_eq!(downmix, vec![(1, Some("192k".into()))]);
    }

    #[test]
    fn downmix_skipped_when_stereo_target_exists() {
        let policy = Policy::load(
            r#"
name: t
phases:
  - name: p
    transcode:
      audio:
        preserve: [truehd]
        target: eac3
        downmix:
          channels: 2
"#,
        )
        .unwrap();
        let file = file_with(vec![
            audio_track(1, "truehd", "eng", 8),
            audio_track(2, "eac3", "eng", 2),
        ]);
        let plan = evaluate(&policy, &file, &AnalysisSet::default()).unwrap();
        assert!(plan.is_empty(), "got {:?}", plan.actions);
    }
}
