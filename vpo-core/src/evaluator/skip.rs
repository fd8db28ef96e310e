//! `skip_when` evaluation: a disjunction of concrete predicates over the
//! file's current (virtual) state. The first matching predicate names the
//! skip reason recorded on the plan.

use vpo_model::policy::{resolution_height, SkipWhen};
use vpo_model::units::{parse_duration_literal, parse_size_literal};
use vpo_model::TrackKind;

use super::EvalContext;

pub(crate) fn evaluate_skip_when(cfg: &SkipWhen, ctx: &EvalContext<'_>) -> Option<String> {
    if cfg.is_empty() {
        return None;
    }

    if let Some(codecs) = &cfg.video_codec {
        if let Some(video) = ctx.tracks_of(TrackKind::Video).next() {
            let codec = video.codec_lower();
            if !codec.is_empty() {
                for target in codecs {
                    if vpo_model::policy::codecs_equivalent(&codec, target) {
                        return Some(format!(
                            "video_codec {codec:?} matches [{}]",
                            codecs.join(", ")
                        ));
                    }
                }
            }
        }
    }

    if let Some(target) = &cfg.audio_codec_exists {
        for track in ctx.tracks_of(TrackKind::Audio) {
            if vpo_model::policy::codecs_equivalent(&track.codec_lower(), target) {
                return Some(format!("audio_codec_exists: {target}"));
            }
        }
    }

    if let Some(target) = &cfg.subtitle_language_exists {
        for track in ctx.tracks_of(TrackKind::Subtitle) {
            if vpo_model::languages_match(&track.language, target) {
                return Some(format!("subtitle_language_exists: {target}"));
            }
        }
    }

    if let Some(containers) = &cfg.container {
        for target in containers {
            if ctx.container == vpo_model::normalize_container(target) {
                return Some(format!("container matches {target}"));
            }
        }
    }

    let height = ctx
        .tracks_of(TrackKind::Video)
        .next()
        .and_then(|t| t.height());

    if let Some(label) = &cfg.resolution {
        if let (Some(height), Some(wanted)) = (height, resolution_height(label)) {
            if nearest_resolution(height) == wanted {
                return Some(format!("resolution == {label}"));
            }
        }
    }

    if let Some(label) = &cfg.resolution_under {
        if let (Some(height), Some(limit)) = (height, resolution_height(label)) {
            if height < limit {
                return Some(format!("resolution under {label}"));
            }
        }
    }

    if let Some(raw) = &cfg.file_size_under {
        if let Ok(limit) = parse_size_literal(raw) {
            if ctx.file.size_bytes < limit {
                return Some(format!("file_size under {raw}"));
            }
        }
    }
    if let Some(raw) = &cfg.file_size_over {
        if let Ok(limit) = parse_size_literal(raw) {
            if ctx.file.size_bytes > limit {
                return Some(format!("file_size over {raw}"));
            }
        }
    }

    if let Some(duration) = ctx.file.duration_seconds {
        if let Some(raw) = &cfg.duration_under {
            if let Ok(limit) = parse_duration_literal(raw) {
                if duration < limit as f64 {
                    return Some(format!("duration under {raw}"));
                }
            }
        }
        if let Some(raw) = &cfg.duration_over {
            if let Ok(limit) = parse_duration_literal(raw) {
                if duration > limit as f64 {
                    return Some(format!("duration over {raw}"));
                }
            }
        }
    }

    None
}

/// Snap a frame height to its standard label height.
fn nearest_resolution(height: u32) -> u32 {
    match height {
        h if h >= 4320 => 4320,
        h if h >= 2160 => 2160,
        h if h >= 1440 => 1440,
        h if h >= 1080 => 1080,
        h if h >= 720 => 720,
        h if h >= 576 => 576,
        _ => 480,
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::analysis::AnalysisSet;
    use vpo_model::Policy;

    fn skip_of(yaml: &str, file: vpo_model::FileInfo) -> Option<String> {
        let policy = Policy::load(&format!(
            "name: t\nphases:\n  - name: p\n    skip_when:\n{yaml}"
        ))
        .unwrap();
        let analyses = AnalysisSet::default();
        let plan = crate::evaluator::evaluate(&policy, &file, &analyses).unwrap();
        plan.skipped_phases.first().map(|s| s.reason.clone())
    }

    #[test]
    fn video_codec_alias_matching() {
        let file = file_with(vec![video_track(0, "h265", 2160)]);
        let reason = skip_of("      video_codec: [hevc]\n", file).unwrap();
        assert!(reason.contains("video_codec"));
    }

    #[test]
    fn file_size_boundaries() {
        let mut file = file_with(vec![video_track(0, "h264", 1080)]);
        file.size_bytes = 700 * 1024 * 1024;
        // Exactly at the limit is not "under".
        assert!(skip_of("      file_size_under: 700M\n", file.clone()).is_none());
        file.size_bytes -= 1;
        assert!(skip_of("      file_size_under: 700M\n", file).is_some());
    }

    #[test]
    fn duration_over() {
        let mut file = file_with(vec![video_track(0, "h264", 1080)]);
        file.duration_seconds = Some(7300.0);
        assert!(skip_of("      duration_over: 2h\n", file).is_some());
    }

    #[test]
    fn resolution_exact_label() {
        let file = file_with(vec![video_track(0, "h264", 2160)]);
        assert!(skip_of("      resolution: 4k\n", file).is_some());
        let file = file_with(vec![video_track(0, "h264", 1080)]);
        assert!(skip_of("      resolution: 4k\n", file).is_none());
    }

    #[test]
    fn resolution_under() {
        let file = file_with(vec![video_track(0, "h264", 720)]);
        assert!(skip_of("      resolution_under: 1080p\n", file).is_some());
    }

    #[test]
    fn container_predicate() {
        let file = file_with(vec![video_track(0, "h264", 1080)]);
        assert!(skip_of("      container: [matroska]\n", file).is_some());
    }
}
