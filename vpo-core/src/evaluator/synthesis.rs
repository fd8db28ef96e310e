//! Audio synthesis planning: pick a source track, score candidates by the
//! policy's preferences, and emit `SYNTHESIZE_AUDIO` actions.

use tracing::debug;
use vpo_model::policy::conditions::StringOrList;
use vpo_model::policy::synthesis::{
    AudioSynthesisConfig, ChannelPreference, PositionSpec, SynthesisTrack,
};
use vpo_model::policy::filters::ExistingTrackMatch;
use vpo_model::{
    languages_match, PlannedAction, SynthesisPosition, SynthesisSpec, Track,
    TrackKind,
};

use crate::error::Result;

use super::{evaluate_condition, is_commentary, EvalContext};

pub(crate) fn plan_synthesis(
    ctx: &mut EvalContext<'_>,
    cfg: &AudioSynthesisConfig,
) -> Result<()> {
    for definition in &cfg.tracks {
        plan_one(ctx, definition)?;
    }
    Ok(())
}

fn plan_one(ctx: &mut EvalContext<'_>, definition: &SynthesisTrack) -> Result<()> {
    let target_channels = definition
        .channels
        .channel_count()
        .unwrap_or(2);

    // Explicit skip_if_exists, then the implicit convergence check: if a
    // surviving track already looks like the synthesis target, planning it
    // again would never reach a fixed point.
    if let Some(matcher) = &definition.skip_if_exists {
        if ctx
            .tracks_of(TrackKind::Audio)
            .any(|t| existing_matches(matcher, t, ctx))
        {
            debug!(name = %definition.name, "synthesis skipped: matching track exists");
            return Ok(());
        }
    }
    if synthesized_already_present(ctx, definition, target_channels) {
        debug!(name = %definition.name, "synthesis skipped: output already present");
        return Ok(());
    }

    if let Some(create_if) = &definition.create_if {
        let condition = create_if.resolve().map_err(|e| {
            crate::CoreError::Config(format!("synthesis {:?}: {e}", definition.name))
        })?;
        if !evaluate_condition(&condition, &ctx.condition_input()) {
            return Ok(());
        }
    }

    // Source selection scores every audio track of the original file, so a
    // conflict with the track filter is visible: when the winner is a
    // track the filter removed, the filter wins and the synthesis is
    // dropped with a warning.
    let candidates: Vec<&Track> = ctx
        .file
        .tracks
        .iter()
        .filter(|t| t.kind == TrackKind::Audio)
        .collect();
    if candidates.is_empty() {
        return Ok(());
    }

    // Highest score wins; ties go to the lowest index.
    let (best_score, source_index) = candidates
        .iter()
        .map(|t| (score_track(t, definition, ctx), t.index))
        .max_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)))
        .unwrap_or((0, candidates[0].index));
    let source_index = if best_score > 0 {
        source_index
    } else {
        // No criterion matched anywhere: first surviving audio track.
        let first_audio_index = ctx.tracks_of(TrackKind::Audio).next().map(|t| t.index);
        match first_audio_index {
            Some(idx) => idx,
            None => {
                ctx.plan.warn(format!(
                    "synthesis {:?} dropped: no surviving audio tracks",
                    definition.name
                ));
                return Ok(());
            }
        }
    };

    if ctx.track(source_index).is_none() {
        ctx.plan.warn(format!(
            "synthesis {:?} dropped: source track {source_index} is removed by the track filter",
            definition.name
        ));
        return Ok(());
    }

    let source = ctx.track(source_index).expect("checked above").clone();
    let source_channels = source.channels().unwrap_or(2);

    let language = if definition.language == "inherit" {
        source.language.clone()
    } else {
        definition.language.clone()
    };
    let title = if definition.title == "inherit" {
        source.title.clone()
    } else {
        Some(definition.title.clone())
    };

    let downmix_filter = (source_channels > target_channels)
        .then(|| downmix_filter_for(target_channels));

    let position = match &definition.position {
        PositionSpec::Keyword(kw) if kw == "after_source" => SynthesisPosition::AfterSource,
        PositionSpec::Keyword(_) => SynthesisPosition::End,
        PositionSpec::Index(i) => SynthesisPosition::Index(*i),
    };

    ctx.plan.actions.push(PlannedAction::SynthesizeAudio {
        spec: SynthesisSpec {
            source_index,
            codec: definition.codec.clone(),
            channels: target_channels,
            bitrate: definition.bitrate.clone(),
            downmix_filter,
            title,
            language,
            position,
            name: definition.name.clone(),
        },
    });
    Ok(())
}

/// Preference scoring: language match +100, not-commentary +80, channel
/// preference ±10 × channels, codec match +20.
fn score_track(track: &Track, definition: &SynthesisTrack, ctx: &EvalContext<'_>) -> i64 {
    let mut score = 0i64;
    for criterion in &definition.source.prefer {
        if let Some(language) = &criterion.language {
            let matched = match language {
                StringOrList::One(l) => languages_match(l, &track.language),
                StringOrList::Many(ls) => ls.iter().any(|l| languages_match(l, &track.language)),
            };
            if matched {
                score += 100;
            }
        }
        if criterion.not_commentary == Some(true) && !is_commentary(track, ctx.analyses) {
            score += 80;
        }
        if let Some(preference) = &criterion.channels {
            let channels = track.channels().unwrap_or(0) as i64;
            match preference {
                ChannelPreference::Max => score += 10 * channels,
                ChannelPreference::Min => score -= 10 * channels,
            }
        }
        if let Some(codec) = &criterion.codec {
            let track_codec = track.codec_lower();
            let matched = codec
                .iter()
                .any(|pattern| vpo_model::policy::codec_matches_pattern(&track_codec, pattern));
            if matched {
                score += 20;
            }
        }
    }
    score
}

fn existing_matches(matcher: &ExistingTrackMatch, track: &Track, ctx: &EvalContext<'_>) -> bool {
    if let Some(codec) = &matcher.codec {
        let track_codec = track.codec_lower();
        if !codec
            .iter()
            .any(|pattern| vpo_model::policy::codec_matches_pattern(&track_codec, pattern))
        {
            return false;
        }
    }
    if let Some(channels) = &matcher.channels {
        match track.channels() {
            Some(actual) if channels.matches(actual as i64) => {}
            _ => return false,
        }
    }
    if let Some(language) = &matcher.language {
        let matched = match language {
            StringOrList::One(l) => languages_match(l, &track.language),
            StringOrList::Many(ls) => ls.iter().any(|l| languages_match(l, &track.language)),
        };
        if !matched {
            return false;
        }
    }
    if matcher.not_commentary == Some(true) && is_commentary(track, ctx.analyses) {
        return false;
    }
    true
}

/// Would re-running this synthesis produce a track the file already has?
fn synthesized_already_present(
    ctx: &EvalContext<'_>,
    definition: &SynthesisTrack,
    target_channels: u32,
) -> bool {
    ctx.tracks_of(TrackKind::Audio).any(|t| {
        vpo_model::policy::codecs_equivalent(&t.codec_lower(), &definition.codec)
            && t.channels() == Some(target_channels)
            && (definition.language == "inherit"
                || languages_match(&t.language, &definition.language))
    })
}

/// Standard coefficient downmix for stereo; larger layouts fall back to a
/// channel-count filter and let the encoder pick the mix.
fn downmix_filter_for(target_channels: u32) -> String {
    match target_channels {
        1 => "pan=mono|c0=0.5*FL+0.5*FR+0.354*FC+0.25*BL+0.25*BR".to_string(),
        2 => "pan=stereo|FL<1.0*FL+0.707*FC+0.707*BL+0.5*LFE|FR<1.0*FR+0.707*FC+0.707*BR+0.5*LFE"
            .to_string(),
        n => format!("aformat=channel_layouts={}c", n),
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::analysis::AnalysisSet;
    use crate::evaluator::evaluate;
    use vpo_model::{PlannedAction, Policy, SynthesisPosition};

    const SYNTH_POLICY: &str = r#"
name: t
phases:
  - name: p
    audio_synthesis:
      tracks:
        - name: stereo
          codec: aac
          channels: stereo
          bitrate: 192k
          skip_if_exists:
            codec: aac
            channels: 2
            language: eng
          source:
            prefer:
              - language: eng
                not_commentary: true
              - channels: max
          position: after_source
"#;

    fn synth_actions(plan: &vpo_model::Plan) -> Vec<&vpo_model::SynthesisSpec> {
        plan.actions
            .iter()
            .filter_map(|a| match a {
                PlannedAction::SynthesizeAudio { spec } => Some(spec),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn synthesis_prefers_language_and_channels() {
        let policy = Policy::load(SYNTH_POLICY).unwrap();
        let file = file_with(vec![
            video_track(0, "h264", 1080),
            audio_track(1, "truehd", "eng", 8),
            audio_track(2, "ac3", "fre", 6),
        ]);
        let plan = evaluate(&policy, &file, &AnalysisSet::default()).unwrap();
        let specs = synth_actions(&plan);
        assert_eq!(specs.len(), 1);
        let spec = specs[0];
        assert_eq!(spec.source_index, 1);
        assert_eq!(spec.channels, 2);
        assert_eq!(spec.language, "eng");
        assert!(spec.downmix_filter.as_deref().unwrap().starts_with("pan=stereo"));
        assert_eq!(spec.position, SynthesisPosition::AfterSource);
    }

    #[test]
    fn skip_if_exists_suppresses() {
        let policy = Policy::load(SYNTH_POLICY).unwrap();
        let file = file_with(vec![
            audio_track(1, "truehd", "eng", 8),
            audio_track(2, "aac", "eng", 2),
        ]);
        let plan = evaluate(&policy, &file, &AnalysisSet::default()).unwrap();
        assert!(synth_actions(&plan).is_empty());
    }

    #[test]
    fn filter_wins_over_synthesis() {
        // The synthesis source (eng) is removed by the track filter, so
        // the synthesis is dropped with a warning.
        let policy = Policy::load(
            r#"
name: t
phases:
  - name: p
    track_filter:
      audio:
        languages: [jpn]
    audio_synthesis:
      tracks:
        - name: stereo
          codec: aac
          channels: stereo
          source:
            prefer:
              - language: eng
"#,
        )
        .unwrap();
        let file = file_with(vec![
            audio_track(1, "flac", "jpn", 6),
            audio_track(2, "truehd", "eng", 8),
        ]);
        let plan = evaluate(&policy, &file, &AnalysisSet::default()).unwrap();
        assert!(synth_actions(&plan).is_empty());
        assert!(plan
            .warnings
            .iter()
            .any(|w| w.contains("stereo") && w.contains("removed by the track filter")));
    }

    #[test]
    fn create_if_gates_synthesis() {
        let policy = Policy::load(
            r#"
name: t
phases:
  - name: p
    audio_synthesis:
      tracks:
        - name: stereo
          codec: aac
          channels: stereo
          create_if: "not exists(audio, channels<=2)"
          source:
            prefer:
              - channels: max
"#,
        )
        .unwrap();
        // A stereo track already exists, create_if is false.
        let file = file_with(vec![
            audio_track(1, "truehd", "eng", 8),
            audio_track(2, "aac", "eng", 2),
        ]);
        let plan = evaluate(&policy, &file, &AnalysisSet::default()).unwrap();
        assert!(synth_actions(&plan).is_empty());

        // Only surround audio: create_if is true.
        let file = file_with(vec![audio_track(1, "truehd", "eng", 8)]);
        let plan = evaluate(&policy, &file, &AnalysisSet::default()).unwrap();
        assert_eq!(synth_actions(&plan).len(), 1);
    }

    #[test]
    fn no_criterion_matches_falls_back_to_first_surviving() {
        let policy = Policy::load(
            r#"
name: t
phases:
  - name: p
    audio_synthesis:
      tracks:
        - name: stereo
          codec: aac
          channels: stereo
          source:
            prefer:
              - language: kor
"#,
        )
        .unwrap();
        let file = file_with(vec![
            audio_track(1, "ac3", "fre", 6),
            audio_track(2, "dts", "ger", 6),
        ]);
        let plan = evaluate(&policy, &file, &AnalysisSet::default()).unwrap();
        let specs = synth_actions(&plan);
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].source_index, 1);
    }

    #[test]
    fn inherit_title_and_language() {
        let policy = Policy::load(
            r#"
name: t
phases:
  - name: p
    audio_synthesis:
      tracks:
        - name: compat
          codec: ac3
          channels: "5.1"
          title: "Surround Compatibility"
          language: inherit
          source:
            prefer:
              - channels: max
"#,
        )
        .unwrap();
        let file = file_with(vec![audio_track(1, "truehd", "jpn", 8)]);
        let plan = evaluate(&policy, &file, &AnalysisSet::default()).unwrap();
        let specs = synth_actions(&plan);
        assert_eq!(specs[0].language, "jpn");
        assert_eq!(specs[0].title.as_deref(), Some("Surround Compatibility"));
        assert_eq!(specs[0].channels, 6);
    }
}
