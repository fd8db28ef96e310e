//! Condition evaluation against the virtual file state.

use serde_json::Value;
use vpo_model::policy::conditions::{
    CompareOp, Condition, StringOrList, TitleMatch, TrackSelector,
};
use vpo_model::{languages_match, Track, TrackKind};

use crate::analysis::{AnalysisSet, TrackCategory};

/// Everything a condition may inspect: the surviving tracks in their
/// current (virtual) state, the container tags, and the analyses.
pub(crate) struct ConditionInput<'a> {
    pub tracks: &'a [Track],
    pub tags: &'a std::collections::BTreeMap<String, String>,
    pub analyses: &'a AnalysisSet,
}

pub(crate) fn evaluate_condition(cond: &Condition, input: &ConditionInput<'_>) -> bool {
    match cond {
        Condition::Exists { track_kind, filters } => input
            .tracks
            .iter()
            .any(|t| t.kind == *track_kind && selector_matches(filters, t, input.analyses)),
        Condition::Count { track_kind, filters, op, value } => {
            let count = input
                .tracks
                .iter()
                .filter(|t| t.kind == *track_kind && selector_matches(filters, t, input.analyses))
                .count() as i64;
            compare_ints(count, *op, *value)
        }
        Condition::PluginMetadata { plugin, field, op, value } => {
            let actual = input.analyses.plugin_field(plugin, field);
            compare_metadata(actual, *op, value.as_ref())
        }
        Condition::ContainerMetadata { field, op, value } => {
            let actual = input
                .tags
                .get(&field.to_ascii_lowercase())
                .map(|s| Value::String(s.clone()));
            compare_metadata(actual.as_ref(), *op, value.as_ref())
        }
        Condition::IsOriginal(payload) => {
            classification_matches(input, &payload.resolve(), true)
        }
        Condition::IsDubbed(payload) => {
            classification_matches(input, &payload.resolve(), false)
        }
        Condition::AudioIsMultiLanguage { track_index, threshold, primary_language } => {
            multi_language_matches(input, *track_index, *threshold, primary_language.as_deref())
        }
        Condition::All(items) => items.iter().all(|c| evaluate_condition(c, input)),
        Condition::Any(items) => items.iter().any(|c| evaluate_condition(c, input)),
        Condition::Not(inner) => !evaluate_condition(inner, input),
    }
}

/// Commentary detection: the classifier's verdict when present, else a
/// title heuristic.
pub(crate) fn is_commentary(track: &Track, analyses: &AnalysisSet) -> bool {
    if let Some(classification) = analyses.classification_for(track.index) {
        if classification.category == TrackCategory::Commentary {
            return true;
        }
    }
    track
        .title
        .as_deref()
        .is_some_and(|t| t.to_ascii_lowercase().contains("commentary"))
}

pub(crate) fn selector_matches(
    selector: &TrackSelector,
    track: &Track,
    analyses: &AnalysisSet,
) -> bool {
    if let Some(language) = &selector.language {
        let matched = match language {
            StringOrList::One(lang) => languages_match(lang, &track.language),
            StringOrList::Many(langs) => {
                langs.iter().any(|lang| languages_match(lang, &track.language))
            }
        };
        if !matched {
            return false;
        }
    }
    if let Some(codec) = &selector.codec {
        let track_codec = track.codec_lower();
        let matched = codec.iter().any(|pattern| {
            vpo_model::policy::codec_matches_pattern(&track_codec, pattern)
        });
        if !matched {
            return false;
        }
    }
    if let Some(expected) = selector.is_default {
        if track.is_default != expected {
            return false;
        }
    }
    if let Some(expected) = selector.is_forced {
        if track.is_forced != expected {
            return false;
        }
    }
    if let Some(channels) = &selector.channels {
        match track.channels() {
            Some(actual) if channels.matches(actual as i64) => {}
            _ => return false,
        }
    }
    if let Some(width) = &selector.width {
        match track.width() {
            Some(actual) if width.matches(actual as i64) => {}
            _ => return false,
        }
    }
    if let Some(height) = &selector.height {
        match track.height() {
            Some(actual) if height.matches(actual as i64) => {}
            _ => return false,
        }
    }
    if let Some(title) = &selector.title {
        let track_title = track.title.as_deref().unwrap_or_default();
        let matched = match title {
            TitleMatch::Substring(needle) => track_title
                .to_ascii_lowercase()
                .contains(&needle.to_ascii_lowercase()),
            TitleMatch::Spec { contains, regex } => {
                let contains_ok = contains.as_deref().is_none_or(|needle| {
                    track_title
                        .to_ascii_lowercase()
                        .contains(&needle.to_ascii_lowercase())
                });
                let regex_ok = regex.as_deref().is_none_or(|pattern| {
                    regex::Regex::new(pattern)
                        .map(|re| re.is_match(track_title))
                        .unwrap_or(false)
                });
                contains_ok && regex_ok
            }
        };
        if !matched {
            return false;
        }
    }
    if let Some(expected) = selector.not_commentary {
        let commentary = is_commentary(track, analyses);
        if commentary == expected {
            return false;
        }
    }
    true
}

fn classification_matches(
    input: &ConditionInput<'_>,
    spec: &vpo_model::policy::conditions::ClassificationSpec,
    original: bool,
) -> bool {
    input.tracks.iter().any(|track| {
        if track.kind != TrackKind::Audio {
            return false;
        }
        let Some(classification) = input.analyses.classification_for(track.index) else {
            return false;
        };
        let Some(is_original) = classification.is_original else {
            return false;
        };
        if classification.confidence < spec.min_confidence {
            return false;
        }
        if let Some(lang) = &spec.language {
            let track_lang = classification
                .detected_language
                .as_deref()
                .unwrap_or(&track.language);
            if !languages_match(lang, track_lang) {
                return false;
            }
        }
        // is_original wants original == value; is_dubbed wants the inverse.
        let observed = if original { is_original } else { !is_original };
        observed == spec.value
    })
}

fn multi_language_matches(
    input: &ConditionInput<'_>,
    track_index: Option<usize>,
    threshold: f64,
    primary_language: Option<&str>,
) -> bool {
    let check = |index: usize| -> bool {
        let Some(analysis) = input.analyses.language_for(index) else {
            return false;
        };
        if let Some(expected) = primary_language {
            let Some(primary) = analysis.primary_language.as_deref() else {
                return false;
            };
            if !languages_match(expected, primary) {
                return false;
            }
        }
        analysis.secondary_fraction() >= threshold
    };
    match track_index {
        Some(index) => check(index),
        None => input
            .tracks
            .iter()
            .filter(|t| t.kind == TrackKind::Audio)
            .any(|t| check(t.index)),
    }
}

fn compare_ints(actual: i64, op: CompareOp, expected: i64) -> bool {
    match op {
        CompareOp::Eq => actual == expected,
        CompareOp::Neq => actual != expected,
        CompareOp::Lt => actual < expected,
        CompareOp::Lte => actual <= expected,
        CompareOp::Gt => actual > expected,
        CompareOp::Gte => actual >= expected,
        CompareOp::Contains | CompareOp::Exists => false,
    }
}

/// Compare a metadata value against an expectation. Numeric comparisons
/// tolerate numbers stored as strings; everything else compares by value.
fn compare_metadata(actual: Option<&Value>, op: CompareOp, expected: Option<&Value>) -> bool {
    match op {
        CompareOp::Exists => actual.is_some(),
        _ => {
            let (Some(actual), Some(expected)) = (actual, expected) else {
                return false;
            };
            match op {
                CompareOp::Eq => json_eq(actual, expected),
                CompareOp::Neq => !json_eq(actual, expected),
                CompareOp::Contains => match (actual.as_str(), expected.as_str()) {
                    (Some(a), Some(e)) => {
                        a.to_ascii_lowercase().contains(&e.to_ascii_lowercase())
                    }
                    _ => false,
                },
                CompareOp::Lt | CompareOp::Lte | CompareOp::Gt | CompareOp::Gte => {
                    let (Some(a), Some(e)) = (as_number(actual), as_number(expected)) else {
                        return false;
                    };
                    match op {
                        CompareOp::Lt => a < e,
                        CompareOp::Lte => a <= e,
                        CompareOp::Gt => a > e,
                        CompareOp::Gte => a >= e,
                        _ => unreachable!(),
                    }
                }
                CompareOp::Exists => unreachable!(),
            }
        }
    }
}

fn json_eq(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    // "2019" == 2019 and case-insensitive string equality.
    match (as_number(a), as_number(b)) {
        (Some(x), Some(y)) => return x == y,
        _ => {}
    }
    match (a.as_str(), b.as_str()) {
        (Some(x), Some(y)) => x.eq_ignore_ascii_case(y),
        _ => false,
    }
}

fn as_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::TrackClassification;
    use std::collections::BTreeMap;
    use vpo_model::parse_expression;

    fn audio(index: usize, language: &str) -> Track {
        Track {
            index,
            kind: TrackKind::Audio,
            codec: Some("aac".into()),
            language: language.into(),
            title: None,
            is_default: false,
            is_forced: false,
            video: None,
            audio: Some(vpo_model::AudioInfo { channels: Some(6), channel_layout: Some("5.1".into()) }),
        }
    }

    fn input<'a>(
        tracks: &'a [Track],
        tags: &'a BTreeMap<String, String>,
        analyses: &'a AnalysisSet,
    ) -> ConditionInput<'a> {
        ConditionInput { tracks, tags, analyses }
    }

    #[test]
    fn exists_with_language_filter() {
        let tracks = vec![audio(1, "ger"), audio(2, "jpn")];
        let tags = BTreeMap::new();
        let analyses = AnalysisSet::default();
        let inp = input(&tracks, &tags, &analyses);

        let yes = parse_expression("exists(audio, language==jpn)").unwrap();
        assert!(evaluate_condition(&yes, &inp));

        let no = parse_expression("not exists(audio, language==eng)").unwrap();
        assert!(evaluate_condition(&no, &inp));
    }

    #[test]
    fn count_with_channels() {
        let tracks = vec![audio(1, "eng"), audio(2, "eng")];
        let tags = BTreeMap::new();
        let analyses = AnalysisSet::default();
        let inp = input(&tracks, &tags, &analyses);

        let cond = parse_expression("count(audio, channels>=6) >= 2").unwrap();
        assert!(evaluate_condition(&cond, &inp));
        let cond = parse_expression("count(audio, channels>=8) >= 1").unwrap();
        assert!(!evaluate_condition(&cond, &inp));
    }

    #[test]
    fn commentary_title_heuristic() {
        let mut track = audio(1, "eng");
        track.title = Some("Director's Commentary".into());
        let analyses = AnalysisSet::default();
        assert!(is_commentary(&track, &analyses));

        let plain = audio(2, "eng");
        assert!(!is_commentary(&plain, &analyses));
    }

    #[test]
    fn not_commentary_selector() {
        let mut commentary = audio(1, "eng");
        commentary.title = Some("Commentary".into());
        let clean = audio(2, "eng");
        let tracks = vec![commentary, clean];
        let tags = BTreeMap::new();
        let analyses = AnalysisSet::default();
        let inp = input(&tracks, &tags, &analyses);

        let cond = parse_expression("count(audio, not_commentary) >= 2").unwrap();
        assert!(!evaluate_condition(&cond, &inp));
        let cond = parse_expression("count(audio, not_commentary) >= 1").unwrap();
        assert!(evaluate_condition(&cond, &inp));
    }

    #[test]
    fn container_metadata_ops() {
        let tracks = vec![];
        let mut tags = BTreeMap::new();
        tags.insert("title".to_string(), "Some.Movie.720p.BluRay".to_string());
        let analyses = AnalysisSet::default();
        let inp = input(&tracks, &tags, &analyses);

        let cond = parse_expression("container_metadata(title) contains \"720p\"").unwrap();
        assert!(evaluate_condition(&cond, &inp));
        let cond = parse_expression("container_metadata(encoder)").unwrap();
        assert!(!evaluate_condition(&cond, &inp));
    }

    #[test]
    fn plugin_metadata_numeric_string_tolerance() {
        let tracks = vec![];
        let tags = BTreeMap::new();
        let mut analyses = AnalysisSet::default();
        analyses
            .plugin_metadata
            .insert("radarr".into(), serde_json::json!({"year": "2019"}));
        let inp = input(&tracks, &tags, &analyses);

        let cond = parse_expression("plugin_metadata(radarr, year) >= 2000").unwrap();
        assert!(evaluate_condition(&cond, &inp));
    }

    #[test]
    fn classification_conditions() {
        let tracks = vec![audio(1, "jpn"), audio(2, "eng")];
        let tags = BTreeMap::new();
        let mut analyses = AnalysisSet::default();
        analyses.classification.insert(
            1,
            TrackClassification {
                track_index: 1,
                is_original: Some(true),
                confidence: 0.9,
                detected_language: Some("jpn".into()),
                category: TrackCategory::Dialogue,
            },
        );
        analyses.classification.insert(
            2,
            TrackClassification {
                track_index: 2,
                is_original: Some(false),
                confidence: 0.85,
                detected_language: Some("eng".into()),
                category: TrackCategory::Dialogue,
            },
        );
        let inp = input(&tracks, &tags, &analyses);

        assert!(evaluate_condition(&parse_expression("is_original(jpn)").unwrap(), &inp));
        assert!(evaluate_condition(&parse_expression("is_dubbed(eng)").unwrap(), &inp));
        assert!(!evaluate_condition(&parse_expression("is_dubbed(jpn)").unwrap(), &inp));
        // Confidence gate.
        assert!(!evaluate_condition(
            &parse_expression("is_original(jpn, 0.95)").unwrap(),
            &inp
        ));
    }

    #[test]
    fn multi_language_condition() {
        use crate::analysis::{LanguageAnalysis, LanguageSegment};
        let tracks = vec![audio(1, "eng")];
        let tags = BTreeMap::new();
        let mut analyses = AnalysisSet::default();
        analyses.language.insert(
            1,
            LanguageAnalysis {
                track_index: 1,
                primary_language: Some("eng".into()),
                confidence: 0.9,
                segments: vec![
                    LanguageSegment { language: "eng".into(), start_seconds: 0.0, end_seconds: 80.0 },
                    LanguageSegment { language: "fre".into(), start_seconds: 80.0, end_seconds: 100.0 },
                ],
            },
        );
        let inp = input(&tracks, &tags, &analyses);

        assert!(evaluate_condition(
            &parse_expression("audio_is_multi_language(0.1, eng)").unwrap(),
            &inp
        ));
        assert!(!evaluate_condition(
            &parse_expression("audio_is_multi_language(0.5)").unwrap(),
            &inp
        ));
    }
}
