//! Track-filter planning, pre-filter cleanup, and default-flag
//! normalization.

use tracing::debug;
use vpo_model::policy::{
    AudioFilter, DefaultFlagsConfig, LanguageFallback, TrackActionsConfig,
    TrackFilterConfig,
};
use vpo_model::{languages_match, TrackKind};

use crate::analysis::TrackCategory;
use crate::error::{CoreError, Result};

use super::EvalContext;

/// Pre-filter cleanup: clear flags/titles across every track of a kind
/// before any filtering decision looks at them.
pub(crate) fn apply_track_actions(
    ctx: &mut EvalContext<'_>,
    kind: TrackKind,
    cfg: &TrackActionsConfig,
) {
    if cfg.is_empty() {
        return;
    }
    let indices: Vec<usize> = ctx.tracks_of(kind).map(|t| t.index).collect();
    for index in indices {
        if cfg.clear_all_forced {
            ctx.plan_forced(index, false);
        }
        if cfg.clear_all_default {
            ctx.plan_default(index, false);
        }
        if cfg.clear_all_titles {
            ctx.plan_title(index, None);
        }
    }
}

pub(crate) fn plan_track_filter(
    ctx: &mut EvalContext<'_>,
    cfg: &TrackFilterConfig,
) -> Result<()> {
    if ctx.plan.skips.track_filter {
        debug!("track filter suppressed by skip flag");
        return Ok(());
    }

    if let Some(audio_cfg) = &cfg.audio {
        plan_audio_filter(ctx, audio_cfg)?;
    }

    if let Some(subtitle_cfg) = &cfg.subtitles {
        let subtitles: Vec<(usize, String, bool)> = ctx
            .tracks_of(TrackKind::Subtitle)
            .map(|t| (t.index, t.language.clone(), t.is_forced))
            .collect();
        for (index, language, forced) in subtitles {
            if subtitle_cfg.remove_all {
                ctx.plan_remove(index, "subtitle removal requested".into());
                continue;
            }
            let Some(languages) = &subtitle_cfg.languages else {
                continue;
            };
            let keep_language = languages.iter().any(|l| languages_match(l, &language));
            let keep_forced = subtitle_cfg.preserve_forced && forced;
            if !keep_language && !keep_forced {
                ctx.plan_remove(
                    index,
                    format!("subtitle language {language} not in [{}]", languages.join(", ")),
                );
            }
        }
    }

    if let Some(attachment_cfg) = &cfg.attachments {
        if attachment_cfg.remove_all {
            let attachments: Vec<usize> =
                ctx.tracks_of(TrackKind::Attachment).map(|t| t.index).collect();
            for index in attachments {
                ctx.plan_remove(index, "attachment removal requested".into());
            }
        }
    }

    Ok(())
}

fn plan_audio_filter(ctx: &mut EvalContext<'_>, cfg: &AudioFilter) -> Result<()> {
    let audio: Vec<(usize, String)> = ctx
        .tracks_of(TrackKind::Audio)
        .map(|t| (t.index, t.language.clone()))
        .collect();
    if audio.is_empty() {
        return Ok(());
    }

    // Classified music/sfx/non-speech tracks bypass the language filter
    // when the policy keeps them.
    let exempt: Vec<usize> = audio
        .iter()
        .filter(|(index, _)| {
            let category = ctx
                .analyses
                .classification_for(*index)
                .map(|c| c.category)
                .unwrap_or(TrackCategory::Unknown);
            match category {
                TrackCategory::Music => cfg.keep_music_tracks,
                TrackCategory::Sfx => cfg.keep_sfx_tracks,
                TrackCategory::NonSpeech => cfg.keep_non_speech_tracks,
                _ => false,
            }
        })
        .map(|(index, _)| *index)
        .collect();

    let language_kept: Vec<usize> = audio
        .iter()
        .filter(|(_, language)| cfg.languages.iter().any(|l| languages_match(l, language)))
        .map(|(index, _)| *index)
        .collect();

    let mut kept: Vec<usize> = language_kept.clone();
    for index in &exempt {
        if !kept.contains(index) {
            kept.push(*index);
        }
    }
    kept.sort_unstable();

    if kept.len() < cfg.minimum {
        let fallback = cfg.fallback.unwrap_or(LanguageFallback::Error);
        match fallback {
            LanguageFallback::KeepAll => {
                debug!("audio filter fallback keep_all engaged");
                return Ok(());
            }
            LanguageFallback::KeepFirst => {
                for (index, _) in &audio {
                    if kept.len() >= cfg.minimum {
                        break;
                    }
                    if !kept.contains(index) {
                        kept.push(*index);
                    }
                }
                kept.sort_unstable();
            }
            LanguageFallback::ContentLanguage => {
                match ctx.analyses.resolved_content_language() {
                    Some(content_language) => {
                        for (index, language) in &audio {
                            if languages_match(language, &content_language)
                                && !kept.contains(index)
                            {
                                kept.push(*index);
                            }
                        }
                        kept.sort_unstable();
                        if kept.len() < cfg.minimum {
                            ctx.plan.warn(format!(
                                "content-language fallback ({content_language}) still below \
                                 minimum; keeping all audio tracks"
                            ));
                            return Ok(());
                        }
                    }
                    None => {
                        ctx.plan.warn(
                            "content language unknown; keeping all audio tracks".to_string(),
                        );
                        return Ok(());
                    }
                }
            }
            LanguageFallback::Error => {
                return Err(CoreError::InsufficientTracks(format!(
                    "audio filter [{}] keeps {} of {} tracks (minimum {})",
                    cfg.languages.join(", "),
                    kept.len(),
                    audio.len(),
                    cfg.minimum
                )));
            }
        }
    }

    for (index, language) in &audio {
        if !kept.contains(index) {
            ctx.plan_remove(
                *index,
                format!("audio language {language} not in [{}]", cfg.languages.join(", ")),
            );
        }
    }
    Ok(())
}

/// Compute the desired default/forced layout after filtering and emit the
/// flag changes needed to reach it. After these actions apply, each
/// normalized kind carries exactly one default track.
pub(crate) fn plan_default_flags(ctx: &mut EvalContext<'_>, cfg: &DefaultFlagsConfig) {
    // Video: first surviving track is the default.
    if cfg.set_first_video_default {
        let videos: Vec<usize> = ctx.tracks_of(TrackKind::Video).map(|t| t.index).collect();
        if let Some((first, rest)) = videos.split_first() {
            ctx.plan_default(*first, true);
            if cfg.clear_other_defaults {
                for index in rest {
                    ctx.plan_default(*index, false);
                }
            }
        }
    }

    // Audio: first track matching the preference list, in list order;
    // falls back to the first audio track so exactly one default remains.
    let mut chosen_audio_language = None;
    if cfg.set_preferred_audio_default {
        let audio: Vec<(usize, String)> = ctx
            .tracks_of(TrackKind::Audio)
            .map(|t| (t.index, t.language.clone()))
            .collect();
        let chosen = choose_preferred(&audio, &cfg.audio_language_preference);
        if let Some((chosen_index, language)) = chosen {
            chosen_audio_language = Some(language);
            ctx.plan_default(chosen_index, true);
            if cfg.clear_other_defaults {
                for (index, _) in &audio {
                    if *index != chosen_index {
                        ctx.plan_default(*index, false);
                    }
                }
            }
        }
    }

    // Subtitle default, optional.
    if cfg.set_preferred_subtitle_default {
        let subtitles: Vec<(usize, String)> = ctx
            .tracks_of(TrackKind::Subtitle)
            .map(|t| (t.index, t.language.clone()))
            .collect();
        let chosen = choose_preferred(&subtitles, &cfg.subtitle_language_preference);
        if let Some((chosen_index, _)) = chosen {
            ctx.plan_default(chosen_index, true);
            if cfg.clear_other_defaults {
                for (index, _) in &subtitles {
                    if *index != chosen_index {
                        ctx.plan_default(*index, false);
                    }
                }
            }
        }
    }

    // Foreign-audio assist: when the chosen default audio is not the
    // listener's first preference, force-flag the preferred subtitle.
    if cfg.set_subtitle_forced_when_audio_differs {
        if let (Some(chosen), Some(preferred)) = (
            chosen_audio_language.as_deref(),
            cfg.audio_language_preference.first(),
        ) {
            if !languages_match(chosen, preferred) {
                let subtitles: Vec<(usize, String)> = ctx
                    .tracks_of(TrackKind::Subtitle)
                    .map(|t| (t.index, t.language.clone()))
                    .collect();
                let preference = if cfg.subtitle_language_preference.is_empty() {
                    std::slice::from_ref(preferred)
                } else {
                    &cfg.subtitle_language_preference[..]
                };
                if let Some((index, _)) = choose_preferred_strict(&subtitles, preference) {
                    ctx.plan_forced(index, true);
                }
            }
        }
    }
}

/// First track whose language matches the preference list, in list order;
/// without a match, the first track.
fn choose_preferred(
    tracks: &[(usize, String)],
    preference: &[String],
) -> Option<(usize, String)> {
    choose_preferred_strict(tracks, preference)
        .or_else(|| tracks.first().cloned())
}

fn choose_preferred_strict(
    tracks: &[(usize, String)],
    preference: &[String],
) -> Option<(usize, String)> {
    for wanted in preference {
        if let Some(found) = tracks
            .iter()
            .find(|(_, language)| languages_match(language, wanted))
        {
            return Some(found.clone());
        }
    }
    None
}
