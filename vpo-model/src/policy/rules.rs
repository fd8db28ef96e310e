//! Conditional rules: when/then/else triples evaluated during a phase.

use serde::{Deserialize, Serialize};

use crate::probe::TrackKind;

use super::conditions::Condition;

/// A `when` predicate: either a structured condition tree or an expression
/// string. Expression strings are parsed at policy-load time so authoring
/// mistakes surface before any file is touched; the parsed form is cached
/// alongside the source text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionOrExpr {
    Expression(String),
    Structured(Condition),
}

impl ConditionOrExpr {
    /// Resolve to a condition, parsing the expression form.
    pub fn resolve(&self) -> Result<Condition, crate::expr::ExprError> {
        match self {
            Self::Structured(cond) => Ok(cond.clone()),
            Self::Expression(src) => crate::expr::parse_expression(src),
        }
    }
}

/// Reference to a plugin-supplied metadata field, read at evaluation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PluginFieldRef {
    pub plugin: String,
    pub field: String,
}

fn default_true() -> bool {
    true
}

/// Actions a matched rule can take.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    SkipVideoTranscode,
    SkipAudioTranscode,
    SkipTrackFilter,
    /// Template placeholders: `{filename}`, `{path}`, `{rule_name}`.
    Warn(String),
    /// Aborts evaluation for this file with a conditional-fail error.
    Fail(String),
    /// Applies to all matching tracks.
    SetForced {
        track_kind: TrackKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        language: Option<String>,
        #[serde(default = "default_true")]
        value: bool,
    },
    /// Applies to at most one track (first match).
    SetDefault {
        track_kind: TrackKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        language: Option<String>,
        #[serde(default = "default_true")]
        value: bool,
    },
    /// Exactly one of `language` / `from_plugin_metadata` must be set; the
    /// dynamic form reads the plugin field at evaluation time and is
    /// dropped with a warning when the field is absent.
    SetLanguage {
        track_kind: TrackKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        language: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_plugin_metadata: Option<PluginFieldRef>,
    },
    /// Empty `value` deletes the tag. Same exactly-one rule as above.
    SetContainerMetadata {
        field: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_plugin_metadata: Option<PluginFieldRef>,
    },
}

impl RuleAction {
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::SetLanguage { language, from_plugin_metadata, .. } => {
                if language.is_some() == from_plugin_metadata.is_some() {
                    return Err(
                        "set_language requires exactly one of language / from_plugin_metadata"
                            .into(),
                    );
                }
                Ok(())
            }
            Self::SetContainerMetadata { value, from_plugin_metadata, .. } => {
                if value.is_some() == from_plugin_metadata.is_some() {
                    return Err(
                        "set_container_metadata requires exactly one of value / from_plugin_metadata"
                            .into(),
                    );
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Whether rule evaluation stops at the first match or runs every rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleMode {
    First,
    All,
}

impl Default for RuleMode {
    fn default() -> Self {
        Self::All
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConditionalRule {
    pub name: String,
    pub when: ConditionOrExpr,
    #[serde(default)]
    pub then: Vec<RuleAction>,
    #[serde(default, rename = "else")]
    pub otherwise: Vec<RuleAction>,
}

impl ConditionalRule {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("conditional rule name cannot be empty".into());
        }
        if self.then.is_empty() && self.otherwise.is_empty() {
            return Err(format!(
                "rule {:?} must declare at least one then/else action",
                self.name
            ));
        }
        for action in self.then.iter().chain(&self.otherwise) {
            action.validate().map_err(|e| format!("rule {:?}: {e}", self.name))?;
        }
        match &self.when {
            ConditionOrExpr::Structured(cond) => cond.validate()?,
            ConditionOrExpr::Expression(src) => {
                crate::expr::parse_expression(src).map_err(|e| {
                    format!("rule {:?}: invalid expression: {e}", self.name)
                })?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConditionalRulesConfig {
    #[serde(default)]
    pub mode: RuleMode,
    pub rules: Vec<ConditionalRule>,
}

impl ConditionalRulesConfig {
    pub fn validate(&self) -> Result<(), String> {
        let mut seen = std::collections::BTreeSet::new();
        for rule in &self.rules {
            rule.validate()?;
            if !seen.insert(rule.name.as_str()) {
                return Err(format!("duplicate rule name: {:?}", rule.name));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_with_expression_when() {
        let yaml = r#"
name: force_english_subs_for_foreign_audio
when: "not exists(audio, language==eng)"
then:
  - set_forced:
      track_kind: subtitle
      language: eng
      value: true
"#;
        let rule: ConditionalRule = serde_yaml::from_str(yaml).unwrap();
        assert!(rule.validate().is_ok());
        assert!(matches!(rule.when, ConditionOrExpr::Expression(_)));
        assert!(matches!(
            rule.then[0],
            RuleAction::SetForced { track_kind: TrackKind::Subtitle, value: true, .. }
        ));
    }

    #[test]
    fn rule_with_structured_when() {
        let yaml = r#"
name: warn_on_many_audio
when:
  count:
    track_kind: audio
    op: gt
    value: 4
then:
  - warn: "{filename} has a lot of audio tracks"
"#;
        let rule: ConditionalRule = serde_yaml::from_str(yaml).unwrap();
        assert!(rule.validate().is_ok());
        assert!(matches!(rule.when, ConditionOrExpr::Structured(_)));
    }

    #[test]
    fn unit_actions_parse_from_strings() {
        let yaml = r#"
name: no_transcode_for_av1
when: "exists(video, codec==av1)"
then:
  - skip_video_transcode
  - skip_audio_transcode
"#;
        let rule: ConditionalRule = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            rule.then,
            vec![RuleAction::SkipVideoTranscode, RuleAction::SkipAudioTranscode]
        );
    }

    #[test]
    fn dynamic_set_language_parses() {
        let yaml = r#"
name: tag_original_language
when: "plugin_metadata(radarr, original_language)"
then:
  - set_language:
      track_kind: audio
      from_plugin_metadata:
        plugin: radarr
        field: original_language
"#;
        let rule: ConditionalRule = serde_yaml::from_str(yaml).unwrap();
        assert!(rule.validate().is_ok());
        match &rule.then[0] {
            RuleAction::SetLanguage { from_plugin_metadata: Some(field_ref), language: None, .. } => {
                assert_eq!(field_ref.plugin, "radarr");
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn invalid_expression_rejected_at_validate() {
        let rule = ConditionalRule {
            name: "broken".into(),
            when: ConditionOrExpr::Expression("exists(".into()),
            then: vec![RuleAction::SkipTrackFilter],
            otherwise: vec![],
        };
        assert!(rule.validate().is_err());
    }

    #[test]
    fn rule_without_actions_rejected() {
        let rule = ConditionalRule {
            name: "noop".into(),
            when: ConditionOrExpr::Expression("exists(audio)".into()),
            then: vec![],
            otherwise: vec![],
        };
        assert!(rule.validate().is_err());
    }
}
