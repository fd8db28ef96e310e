//! The condition algebra used by conditional rules.
//!
//! Conditions form a closed set: leaf predicates over tracks, container
//! tags, and side-channel analyses, combined with `and`/`or`/`not`. A
//! condition can be authored either as a YAML object tree or as an
//! expression string (see [`crate::expr`]); both parse into [`Condition`].

use serde::{Deserialize, Serialize};

use crate::probe::TrackKind;

/// Operators shared by count, plugin-metadata, and container-metadata
/// predicates. Ordered operators require numeric values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompareOp {
    Eq,
    Neq,
    Contains,
    Lt,
    Lte,
    Gt,
    Gte,
    Exists,
}

impl CompareOp {
    pub fn is_ordering(&self) -> bool {
        matches!(self, Self::Lt | Self::Lte | Self::Gt | Self::Gte)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Neq => "neq",
            Self::Contains => "contains",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Exists => "exists",
        }
    }
}

fn default_eq() -> CompareOp {
    CompareOp::Eq
}

/// Numeric comparison against a threshold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Comparison {
    pub op: CompareOp,
    pub value: i64,
}

/// An integer criterion that is either an exact value or a comparison.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IntOrCompare {
    Exact(i64),
    Compare(Comparison),
}

impl IntOrCompare {
    pub fn matches(&self, actual: i64) -> bool {
        match self {
            Self::Exact(v) => actual == *v,
            Self::Compare(c) => match c.op {
                CompareOp::Eq => actual == c.value,
                CompareOp::Neq => actual != c.value,
                CompareOp::Lt => actual < c.value,
                CompareOp::Lte => actual <= c.value,
                CompareOp::Gt => actual > c.value,
                CompareOp::Gte => actual >= c.value,
                // contains/exists make no sense numerically; never match.
                CompareOp::Contains | CompareOp::Exists => false,
            },
        }
    }
}

/// A single value or a set; a set matches when any member matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StringOrList {
    One(String),
    Many(Vec<String>),
}

impl StringOrList {
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        match self {
            Self::One(s) => std::slice::from_ref(s).iter().map(String::as_str),
            Self::Many(v) => v[..].iter().map(String::as_str),
        }
    }

    pub fn contains_normalized(&self, needle: &str) -> bool {
        let needle = needle.to_ascii_lowercase();
        self.iter().any(|s| s.to_ascii_lowercase() == needle)
    }
}

/// Title matching: plain substring or regex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TitleMatch {
    Substring(String),
    Spec {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        contains: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        regex: Option<String>,
    },
}

/// Criteria for matching track properties. All specified criteria must
/// match (AND); unspecified criteria match any track.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TrackSelector {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<StringOrList>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codec: Option<StringOrList>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_default: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_forced: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<IntOrCompare>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<IntOrCompare>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<IntOrCompare>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<TitleMatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_commentary: Option<bool>,
}

impl TrackSelector {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

fn default_true() -> bool {
    true
}

fn default_confidence() -> f64 {
    0.7
}

fn default_threshold() -> f64 {
    0.05
}

/// Classification predicate payload shared by `is_original`/`is_dubbed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClassificationSpec {
    #[serde(default = "default_true")]
    pub value: bool,
    #[serde(default = "default_confidence")]
    pub min_confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

impl Default for ClassificationSpec {
    fn default() -> Self {
        Self {
            value: true,
            min_confidence: default_confidence(),
            language: None,
        }
    }
}

/// YAML shorthand: `is_original: true` or the full spec object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BoolOrClassification {
    Shorthand(bool),
    Spec(ClassificationSpec),
}

impl BoolOrClassification {
    pub fn resolve(&self) -> ClassificationSpec {
        match self {
            Self::Shorthand(value) => ClassificationSpec {
                value: *value,
                ..ClassificationSpec::default()
            },
            Self::Spec(spec) => spec.clone(),
        }
    }
}

/// The closed condition algebra.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Exists {
        track_kind: TrackKind,
        #[serde(default, skip_serializing_if = "TrackSelector::is_empty")]
        filters: TrackSelector,
    },
    Count {
        track_kind: TrackKind,
        #[serde(default, skip_serializing_if = "TrackSelector::is_empty")]
        filters: TrackSelector,
        op: CompareOp,
        value: i64,
    },
    PluginMetadata {
        plugin: String,
        field: String,
        #[serde(default = "default_eq")]
        op: CompareOp,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<serde_json::Value>,
    },
    ContainerMetadata {
        field: String,
        #[serde(default = "default_eq")]
        op: CompareOp,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<serde_json::Value>,
    },
    IsOriginal(BoolOrClassification),
    IsDubbed(BoolOrClassification),
    AudioIsMultiLanguage {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        track_index: Option<usize>,
        #[serde(default = "default_threshold")]
        threshold: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        primary_language: Option<String>,
    },
    #[serde(rename = "and")]
    All(Vec<Condition>),
    #[serde(rename = "or")]
    Any(Vec<Condition>),
    #[serde(rename = "not")]
    Not(Box<Condition>),
}

impl Condition {
    /// Validate operator/value pairings that serde cannot express.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Count { op, .. } => {
                if matches!(op, CompareOp::Contains | CompareOp::Exists) {
                    return Err(format!("count does not support operator '{}'", op.as_str()));
                }
                Ok(())
            }
            Self::PluginMetadata { op, value, plugin, field } => {
                validate_metadata_operand(op, value.as_ref())
                    .map_err(|e| format!("plugin_metadata {plugin}.{field}: {e}"))
            }
            Self::ContainerMetadata { op, value, field } => {
                validate_metadata_operand(op, value.as_ref())
                    .map_err(|e| format!("container_metadata {field}: {e}"))
            }
            Self::All(inner) | Self::Any(inner) => {
                inner.iter().try_for_each(Condition::validate)
            }
            Self::Not(inner) => inner.validate(),
            _ => Ok(()),
        }
    }
}

fn validate_metadata_operand(
    op: &CompareOp,
    value: Option<&serde_json::Value>,
) -> Result<(), String> {
    match op {
        CompareOp::Exists => Ok(()),
        _ if value.is_none() => {
            Err(format!("operator '{}' requires a value", op.as_str()))
        }
        CompareOp::Lt | CompareOp::Lte | CompareOp::Gt | CompareOp::Gte => {
            match value {
                Some(v) if v.is_number() => Ok(()),
                _ => Err(format!(
                    "operator '{}' requires a numeric value",
                    op.as_str()
                )),
            }
        }
        CompareOp::Contains => match value {
            Some(v) if v.is_string() => Ok(()),
            _ => Err("operator 'contains' requires a string value".to_string()),
        },
        _ => Ok(()),
    }
}
