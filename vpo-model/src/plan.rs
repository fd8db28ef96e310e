//! Plans: the evaluator's deterministic output.
//!
//! A [`Plan`] is an ordered list of [`PlannedAction`]s plus the skip flags
//! and warnings the evaluator accumulated while producing it. Plans are
//! immutable; a stale plan is superseded by re-evaluating, never patched.
//! Actions reference tracks by index only, so a plan stays valid as a value
//! even after the `FileInfo` it was derived from is dropped.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::probe::TrackKind;

/// Where a synthesized track lands in the output stream order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynthesisPosition {
    AfterSource,
    End,
    /// 1-based explicit position.
    Index(usize),
}

/// Payload for a `SYNTHESIZE_AUDIO` action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SynthesisSpec {
    /// Index of the surviving audio track the new one is derived from.
    pub source_index: usize,
    pub codec: String,
    pub channels: u32,
    pub bitrate: Option<String>,
    /// Pan/downmix filter when source channels exceed target channels.
    pub downmix_filter: Option<String>,
    pub title: Option<String>,
    pub language: String,
    pub position: SynthesisPosition,
    /// Path-safe synthesis name, used in temp-file naming.
    pub name: String,
}

/// How the mtime of the finished file is chosen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MtimeTarget {
    /// Restore the mtime captured before execution.
    Preserve,
    /// An explicit timestamp resolved from plugin metadata (ISO-8601 UTC).
    ReleaseDate(String),
    /// Leave whatever the OS set.
    Now,
}

/// One mutation the executor must realize.
///
/// The action algebra is a closed set; dispatch on the `kind` tag only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlannedAction {
    SetDefault {
        track_index: usize,
        current_value: bool,
        desired_value: bool,
    },
    ClearDefault {
        track_index: usize,
        current_value: bool,
        desired_value: bool,
    },
    SetForced {
        track_index: usize,
        current_value: bool,
        desired_value: bool,
    },
    ClearForced {
        track_index: usize,
        current_value: bool,
        desired_value: bool,
    },
    SetTitle {
        track_index: usize,
        current_value: Option<String>,
        desired_value: Option<String>,
    },
    SetLanguage {
        track_index: usize,
        current_value: String,
        desired_value: String,
    },
    RemoveTrack {
        track_index: usize,
        kind_removed: TrackKind,
        reason: String,
    },
    Reorder {
        /// New output order as a list of current indices.
        order: Vec<usize>,
    },
    SetContainerMetadata {
        /// Tag name.
        current_value: String,
        /// Desired text; empty string deletes the tag.
        desired_value: String,
    },
    TranscodeVideo {
        track_index: usize,
        source_codec: String,
        target_codec: String,
    },
    TranscodeAudio {
        track_index: usize,
        source_codec: String,
        target_codec: String,
        target_bitrate: Option<String>,
        /// Extra downmix output channels, when this action is the policy's
        /// additional stereo/5.1 downmix rather than an in-place transcode.
        downmix_channels: Option<u32>,
    },
    CopyStream {
        track_index: usize,
    },
    RemuxTo {
        target_container: String,
    },
    SynthesizeAudio {
        spec: SynthesisSpec,
    },
    SetFileMtime {
        target: MtimeTarget,
    },
}

impl PlannedAction {
    /// Actions that can be realized without rewriting the media payload.
    pub fn is_metadata_only(&self) -> bool {
        matches!(
            self,
            Self::SetDefault { .. }
                | Self::ClearDefault { .. }
                | Self::SetForced { .. }
                | Self::ClearForced { .. }
                | Self::SetTitle { .. }
                | Self::SetLanguage { .. }
                | Self::SetContainerMetadata { .. }
                | Self::SetFileMtime { .. }
        )
    }

    /// Actions that force the remux/transcode strategy.
    pub fn requires_rewrite(&self) -> bool {
        matches!(
            self,
            Self::RemoveTrack { .. }
                | Self::Reorder { .. }
                | Self::RemuxTo { .. }
                | Self::SynthesizeAudio { .. }
                | Self::TranscodeVideo { .. }
                | Self::TranscodeAudio { .. }
                | Self::CopyStream { .. }
        )
    }

    pub fn track_index(&self) -> Option<usize> {
        match self {
            Self::SetDefault { track_index, .. }
            | Self::ClearDefault { track_index, .. }
            | Self::SetForced { track_index, .. }
            | Self::ClearForced { track_index, .. }
            | Self::SetTitle { track_index, .. }
            | Self::SetLanguage { track_index, .. }
            | Self::RemoveTrack { track_index, .. }
            | Self::TranscodeVideo { track_index, .. }
            | Self::TranscodeAudio { track_index, .. }
            | Self::CopyStream { track_index } => Some(*track_index),
            _ => None,
        }
    }
}

/// Skip flags set by conditional rules and consumed later in the phase loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SkipFlags {
    pub video_transcode: bool,
    pub audio_transcode: bool,
    pub track_filter: bool,
}

/// One conditional-rule evaluation, recorded for debuggability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleTraceEntry {
    pub rule: String,
    pub matched: bool,
}

/// A phase skipped by its `skip_when`, with the predicate that fired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSkipEntry {
    pub phase: String,
    pub reason: String,
}

/// Ordered set of mutations for one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub path: PathBuf,
    pub source_container: String,
    pub actions: Vec<PlannedAction>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub skips: SkipFlags,
    #[serde(default)]
    pub trace: Vec<RuleTraceEntry>,
    #[serde(default)]
    pub skipped_phases: Vec<PhaseSkipEntry>,
}

impl Plan {
    pub fn new(path: PathBuf, source_container: String) -> Self {
        Self {
            path,
            source_container,
            actions: Vec::new(),
            warnings: Vec::new(),
            skips: SkipFlags::default(),
            trace: Vec::new(),
            skipped_phases: Vec::new(),
        }
    }

    /// A plan is empty iff it carries no actions.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn has_rewrite_actions(&self) -> bool {
        self.actions.iter().any(PlannedAction::requires_rewrite)
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_round_trips_through_json() {
        let mut plan = Plan::new("/media/movie.mkv".into(), "mkv".into());
        plan.actions.push(PlannedAction::SetForced {
            track_index: 2,
            current_value: false,
            desired_value: true,
        });
        plan.actions.push(PlannedAction::RemoveTrack {
            track_index: 3,
            kind_removed: TrackKind::Audio,
            reason: "language fre not in [eng, jpn]".into(),
        });
        plan.actions.push(PlannedAction::SynthesizeAudio {
            spec: SynthesisSpec {
                source_index: 1,
                codec: "aac".into(),
                channels: 2,
                bitrate: Some("192k".into()),
                downmix_filter: Some("pan=stereo|FL<FL+0.707*FC|FR<FR+0.707*FC".into()),
                title: Some("Stereo".into()),
                language: "eng".into(),
                position: SynthesisPosition::AfterSource,
                name: "stereo".into(),
            },
        });
        plan.skips.video_transcode = true;
        plan.trace.push(RuleTraceEntry {
            rule: "force_english_subs_for_foreign_audio".into(),
            matched: false,
        });

        let json = serde_json::to_string(&plan).unwrap();
        let back: Plan = serde_json::from_str(&json).unwrap();
        assert_eq!(back, plan);
        // Action order is part of the value.
        assert!(matches!(back.actions[0], PlannedAction::SetForced { .. }));
        assert!(matches!(back.actions[2], PlannedAction::SynthesizeAudio { .. }));
    }

    #[test]
    fn empty_plan_has_no_actions() {
        let plan = Plan::new("/x.mkv".into(), "mkv".into());
        assert!(plan.is_empty());
        assert!(!plan.has_rewrite_actions());
    }

    #[test]
    fn metadata_only_classification() {
        let a = PlannedAction::SetTitle {
            track_index: 0,
            current_value: None,
            desired_value: Some("Main".into()),
        };
        assert!(a.is_metadata_only());
        assert!(!a.requires_rewrite());

        let b = PlannedAction::RemuxTo {
            target_container: "mkv".into(),
        };
        assert!(b.requires_rewrite());
    }

    #[test]
    fn action_kind_tag_serializes_screaming_snake() {
        let a = PlannedAction::CopyStream { track_index: 4 };
        let v = serde_json::to_value(&a).unwrap();
        assert_eq!(v["kind"], "COPY_STREAM");
    }
}
