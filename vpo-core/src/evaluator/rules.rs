//! Conditional-rule execution.

use tracing::warn;
use vpo_model::policy::{
    ConditionalRulesConfig, PluginFieldRef, RuleAction, RuleMode,
};
use vpo_model::{RuleTraceEntry, TrackKind};

use crate::error::{CoreError, Result};

use super::{evaluate_condition, EvalContext};

pub(crate) fn run_rules(
    ctx: &mut EvalContext<'_>,
    cfg: &ConditionalRulesConfig,
) -> Result<()> {
    for rule in &cfg.rules {
        // Expressions were validated at policy load; a failure here means
        // the policy object was built by hand, which is still an error.
        let condition = rule
            .when
            .resolve()
            .map_err(|e| CoreError::Config(format!("rule {:?}: {e}", rule.name)))?;
        let matched = evaluate_condition(&condition, &ctx.condition_input());
        ctx.plan.trace.push(RuleTraceEntry {
            rule: rule.name.clone(),
            matched,
        });

        let actions = if matched { &rule.then } else { &rule.otherwise };
        for action in actions {
            apply_action(ctx, &rule.name, action)?;
        }

        if matched && cfg.mode == RuleMode::First {
            break;
        }
    }
    Ok(())
}

fn apply_action(ctx: &mut EvalContext<'_>, rule_name: &str, action: &RuleAction) -> Result<()> {
    match action {
        RuleAction::SkipVideoTranscode => ctx.plan.skips.video_transcode = true,
        RuleAction::SkipAudioTranscode => ctx.plan.skips.audio_transcode = true,
        RuleAction::SkipTrackFilter => ctx.plan.skips.track_filter = true,
        RuleAction::Warn(template) => {
            let message = render_template(template, ctx, rule_name);
            warn!(rule = rule_name, "{message}");
            ctx.plan.warn(message);
        }
        RuleAction::Fail(template) => {
            let message = render_template(template, ctx, rule_name);
            return Err(CoreError::ConditionalFail {
                rule: rule_name.to_string(),
                message,
            });
        }
        RuleAction::SetForced { track_kind, language, value } => {
            let targets = matching_tracks(ctx, *track_kind, language.as_deref());
            for index in targets {
                ctx.plan_forced(index, *value);
            }
        }
        RuleAction::SetDefault { track_kind, language, value } => {
            // set_default applies to at most one track: the first match.
            let targets = matching_tracks(ctx, *track_kind, language.as_deref());
            if let Some(index) = targets.into_iter().next() {
                ctx.plan_default(index, *value);
            }
        }
        RuleAction::SetLanguage { track_kind, language, from_plugin_metadata } => {
            let Some(new_language) =
                resolve_value(ctx, rule_name, language.as_deref(), from_plugin_metadata)
            else {
                return Ok(());
            };
            let targets = matching_tracks(ctx, *track_kind, None);
            for index in targets {
                ctx.plan_language(index, new_language.clone());
            }
        }
        RuleAction::SetContainerMetadata { field, value, from_plugin_metadata } => {
            let Some(new_value) =
                resolve_value(ctx, rule_name, value.as_deref(), from_plugin_metadata)
            else {
                return Ok(());
            };
            ctx.plan_container_tag(field, &new_value);
        }
    }
    Ok(())
}

/// Resolve a literal-or-plugin value. A missing plugin field drops the
/// action with a plan warning rather than failing.
fn resolve_value(
    ctx: &mut EvalContext<'_>,
    rule_name: &str,
    literal: Option<&str>,
    plugin_ref: &Option<PluginFieldRef>,
) -> Option<String> {
    if let Some(literal) = literal {
        return Some(literal.to_string());
    }
    let field_ref = plugin_ref.as_ref()?;
    match ctx.analyses.plugin_field(&field_ref.plugin, &field_ref.field) {
        Some(value) => Some(match value.as_str() {
            Some(s) => s.to_string(),
            None => value.to_string(),
        }),
        None => {
            let message = format!(
                "rule {:?}: plugin metadata {}.{} absent, action dropped",
                rule_name, field_ref.plugin, field_ref.field
            );
            warn!("{message}");
            ctx.plan.warn(message);
            None
        }
    }
}

fn matching_tracks(
    ctx: &EvalContext<'_>,
    kind: TrackKind,
    language: Option<&str>,
) -> Vec<usize> {
    ctx.tracks_of(kind)
        .filter(|t| {
            language.is_none_or(|lang| vpo_model::languages_match(lang, &t.language))
        })
        .map(|t| t.index)
        .collect()
}

fn render_template(template: &str, ctx: &EvalContext<'_>, rule_name: &str) -> String {
    template
        .replace("{filename}", &ctx.file.file_name())
        .replace("{path}", &ctx.file.path.to_string_lossy())
        .replace("{rule_name}", rule_name)
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::analysis::AnalysisSet;
    use crate::error::CoreError;
    use crate::evaluator::evaluate;
    use vpo_model::{PlannedAction, Policy};

    #[test]
    fn fail_action_aborts_with_rendered_message() {
        let policy = Policy::load(
            r#"
name: t
phases:
  - name: p
    conditional_rules:
      rules:
        - name: reject_av1
          when: "exists(video, codec==av1)"
          then:
            - fail: "{filename} is AV1, refusing ({rule_name})"
"#,
        )
        .unwrap();
        let file = file_with(vec![video_track(0, "av1", 2160)]);
        let err = evaluate(&policy, &file, &AnalysisSet::default()).unwrap_err();
        match err {
            CoreError::ConditionalFail { rule, message } => {
                assert_eq!(rule, "reject_av1");
                assert!(message.contains("movie.mkv"));
                assert!(message.contains("reject_av1"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn warn_action_accumulates() {
        let policy = Policy::load(
            r#"
name: t
phases:
  - name: p
    conditional_rules:
      rules:
        - name: notice
          when: "exists(video)"
          then:
            - warn: "seen {filename}"
"#,
        )
        .unwrap();
        let file = file_with(vec![video_track(0, "h264", 1080)]);
        let plan = evaluate(&policy, &file, &AnalysisSet::default()).unwrap();
        assert_eq!(plan.warnings, vec!["seen movie.mkv".to_string()]);
        assert!(plan.is_empty());
    }

    #[test]
    fn first_mode_stops_after_match() {
        let policy = Policy::load(
            r#"
name: t
phases:
  - name: p
    conditional_rules:
      mode: first
      rules:
        - name: a
          when: "exists(video)"
          then: [skip_video_transcode]
        - name: b
          when: "exists(video)"
          then: [skip_audio_transcode]
"#,
        )
        .unwrap();
        let file = file_with(vec![video_track(0, "h264", 1080)]);
        let plan = evaluate(&policy, &file, &AnalysisSet::default()).unwrap();
        assert!(plan.skips.video_transcode);
        assert!(!plan.skips.audio_transcode);
        assert_eq!(plan.trace.len(), 1);
    }

    #[test]
    fn else_branch_runs_on_no_match() {
        let policy = Policy::load(
            r#"
name: t
phases:
  - name: p
    conditional_rules:
      rules:
        - name: has_eng
          when: "exists(audio, language==eng)"
          then:
            - warn: "has english"
          else:
            - warn: "no english"
"#,
        )
        .unwrap();
        let file = file_with(vec![audio_track(1, "ac3", "ger", 6)]);
        let plan = evaluate(&policy, &file, &AnalysisSet::default()).unwrap();
        assert_eq!(plan.warnings, vec!["no english".to_string()]);
    }

    #[test]
    fn set_default_applies_to_first_match_only() {
        let policy = Policy::load(
            r#"
name: t
phases:
  - name: p
    conditional_rules:
      rules:
        - name: default_eng
          when: "exists(audio, language==eng)"
          then:
            - set_default:
                track_kind: audio
                language: eng
                value: true
"#,
        )
        .unwrap();
        let file = file_with(vec![
            audio_track(1, "ac3", "eng", 6),
            audio_track(2, "aac", "eng", 2),
        ]);
        let plan = evaluate(&policy, &file, &AnalysisSet::default()).unwrap();
        assert_eq!(plan.actions.len(), 1);
        assert!(matches!(
            plan.actions[0],
            PlannedAction::SetDefault { track_index: 1, .. }
        ));
    }

    #[test]
    fn set_language_from_missing_plugin_field_drops_with_warning() {
        let policy = Policy::load(
            r#"
name: t
phases:
  - name: p
    conditional_rules:
      rules:
        - name: tag_lang
          when: "exists(audio)"
          then:
            - set_language:
                track_kind: audio
                from_plugin_metadata:
                  plugin: radarr
                  field: original_language
"#,
        )
        .unwrap();
        let file = file_with(vec![audio_track(1, "ac3", "und", 6)]);
        let plan = evaluate(&policy, &file, &AnalysisSet::default()).unwrap();
        assert!(plan.actions.is_empty());
        assert_eq!(plan.warnings.len(), 1);
        assert!(plan.warnings[0].contains("radarr.original_language"));
    }

    #[test]
    fn set_language_from_plugin_field() {
        let policy = Policy::load(
            r#"
name: t
phases:
  - name: p
    conditional_rules:
      rules:
        - name: tag_lang
          when: "exists(audio, language==und)"
          then:
            - set_language:
                track_kind: audio
                from_plugin_metadata:
                  plugin: radarr
                  field: original_language
"#,
        )
        .unwrap();
        let file = file_with(vec![audio_track(1, "ac3", "und", 6)]);
        let mut analyses = AnalysisSet::default();
        analyses
            .plugin_metadata
            .insert("radarr".into(), serde_json::json!({"original_language": "jpn"}));
        let plan = evaluate(&policy, &file, &analyses).unwrap();
        assert_eq!(
            plan.actions,
            vec![PlannedAction::SetLanguage {
                track_index: 1,
                current_value: "und".into(),
                desired_value: "jpn".into(),
            }]
        );
    }

    #[test]
    fn set_container_metadata_delete_via_empty_value() {
        let policy = Policy::load(
            r#"
name: t
phases:
  - name: p
    conditional_rules:
      rules:
        - name: strip_title
          when: "container_metadata(title)"
          then:
            - set_container_metadata:
                field: title
                value: ""
"#,
        )
        .unwrap();
        let mut file = file_with(vec![video_track(0, "h264", 1080)]);
        file.tags.insert("title".into(), "Ugly.Release.Name".into());
        let plan = evaluate(&policy, &file, &AnalysisSet::default()).unwrap();
        assert_eq!(
            plan.actions,
            vec![PlannedAction::SetContainerMetadata {
                current_value: "title".into(),
                desired_value: String::new(),
            }]
        );
    }
}
