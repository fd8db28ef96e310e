//! The policy evaluator.
//!
//! [`evaluate`] deterministically computes a [`Plan`] from a policy, a
//! probed file, and the optional side-channel analyses. It is pure: no
//! I/O, no clocks, no randomness. Given byte-identical inputs the output
//! plan is byte-identical.
//!
//! Phases run strictly in source order. Within a phase the sub-order is
//! fixed: conditional rules, then track actions/filter/default flags,
//! then container metadata and container conversion, then synthesis
//! planning, then transcode planning, then the file timestamp.
//!
//! The evaluator keeps a *virtual* copy of the file's tracks and tags and
//! mutates it as actions are planned, so later phases (and idempotence
//! checks) see the state the file will be in after execution. An action
//! whose current value already equals its desired value is elided, which
//! is what makes `evaluate(P, probe(apply(P, F)))` empty.

mod conditions;
mod filters;
mod rules;
mod skip;
mod synthesis;
mod transcode;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::debug;
use vpo_model::policy::{
    ContainerConfig, FileTimestampConfig, Policy, TimestampFallback,
    TimestampMode,
};
use vpo_model::{
    FileInfo, MtimeTarget, Plan, PlannedAction, Track, TrackKind,
};

use crate::analysis::AnalysisSet;
use crate::error::Result;

pub(crate) use conditions::{evaluate_condition, is_commentary, ConditionInput};

/// Evaluate a policy against a probed file.
pub fn evaluate(policy: &Policy, file: &FileInfo, analyses: &AnalysisSet) -> Result<Plan> {
    let mut ctx = EvalContext::new(file, analyses);

    for phase in &policy.phases {
        if let Some(reason) = skip::evaluate_skip_when(&phase.skip_when, &ctx) {
            debug!(phase = %phase.name, %reason, "phase skipped");
            ctx.plan.skipped_phases.push(vpo_model::PhaseSkipEntry {
                phase: phase.name.clone(),
                reason,
            });
            continue;
        }

        let result = run_phase(&mut ctx, phase);
        match result {
            Ok(()) => {}
            Err(err) => match phase.on_error {
                vpo_model::policy::OnError::Fail => return Err(err),
                vpo_model::policy::OnError::Continue => {
                    // Conditional fail always aborts; it is the policy
                    // author explicitly halting this file.
                    if matches!(err, crate::CoreError::ConditionalFail { .. }) {
                        return Err(err);
                    }
                    ctx.plan
                        .warn(format!("phase {:?} failed, continuing: {err}", phase.name));
                }
            },
        }
    }

    Ok(ctx.into_plan())
}

fn run_phase(ctx: &mut EvalContext<'_>, phase: &vpo_model::Phase) -> Result<()> {
    if let Some(rules_cfg) = &phase.conditional_rules {
        rules::run_rules(ctx, rules_cfg)?;
    }

    if let Some(actions) = &phase.audio_actions {
        filters::apply_track_actions(ctx, TrackKind::Audio, actions);
    }
    if let Some(actions) = &phase.subtitle_actions {
        filters::apply_track_actions(ctx, TrackKind::Subtitle, actions);
    }
    if let Some(filter_cfg) = &phase.track_filter {
        filters::plan_track_filter(ctx, filter_cfg)?;
    }
    if let Some(defaults) = &phase.default_flags {
        filters::plan_default_flags(ctx, defaults);
    }

    if let Some(metadata) = &phase.container_metadata {
        for (field, value) in &metadata.set {
            ctx.plan_container_tag(field, value);
        }
        for field in &metadata.delete {
            ctx.plan_container_tag(field, "");
        }
    }
    if let Some(container) = &phase.container {
        plan_container_conversion(ctx, container);
    }

    if let Some(synthesis_cfg) = &phase.audio_synthesis {
        synthesis::plan_synthesis(ctx, synthesis_cfg)?;
    }

    if let Some(transcode_cfg) = &phase.transcode {
        transcode::plan_transcode(ctx, transcode_cfg);
    }

    if let Some(timestamp) = &phase.file_timestamp {
        plan_file_timestamp(ctx, timestamp);
    }

    Ok(())
}

fn plan_container_conversion(ctx: &mut EvalContext<'_>, cfg: &ContainerConfig) {
    let target = cfg.target.as_str();
    if ctx.container == target {
        return;
    }
    ctx.plan.actions.push(PlannedAction::RemuxTo {
        target_container: target.to_string(),
    });
    ctx.container = target.to_string();
}

fn plan_file_timestamp(ctx: &mut EvalContext<'_>, cfg: &FileTimestampConfig) {
    // Only one mtime action survives; a later phase supersedes an earlier one.
    ctx.plan
        .actions
        .retain(|a| !matches!(a, PlannedAction::SetFileMtime { .. }));

    let target = match cfg.mode {
        TimestampMode::Now => None,
        TimestampMode::Preserve => {
            // Restoring the pre-run mtime is only meaningful when the run
            // changes something; emitting it alone would never converge.
            has_mutations(&ctx.plan.actions).then_some(MtimeTarget::Preserve)
        }
        TimestampMode::ReleaseDate => {
            match ctx.analyses.release_date(cfg.date_source.as_deref()) {
                Some(date) => {
                    if mtime_already_matches(ctx.file.modified_at, &date) {
                        None
                    } else {
                        Some(MtimeTarget::ReleaseDate(date))
                    }
                }
                None => match cfg.fallback {
                    TimestampFallback::Preserve => {
                        has_mutations(&ctx.plan.actions).then_some(MtimeTarget::Preserve)
                    }
                    TimestampFallback::Now | TimestampFallback::Skip => None,
                },
            }
        }
    };

    if let Some(target) = target {
        ctx.plan.actions.push(PlannedAction::SetFileMtime { target });
    }
}

fn has_mutations(actions: &[PlannedAction]) -> bool {
    actions
        .iter()
        .any(|a| !matches!(a, PlannedAction::SetFileMtime { .. }))
}

fn mtime_already_matches(modified_at: Option<DateTime<Utc>>, date: &str) -> bool {
    let Some(current) = modified_at else {
        return false;
    };
    let Some(wanted) = parse_release_date(date) else {
        return false;
    };
    (current - wanted).num_seconds().abs() < 2
}

pub(crate) fn parse_release_date(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    // Bare dates (2019-07-19) resolve to midnight UTC.
    chrono::NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// Evaluation state: the plan under construction plus the virtual file.
pub(crate) struct EvalContext<'a> {
    pub file: &'a FileInfo,
    pub analyses: &'a AnalysisSet,
    /// Surviving tracks in their post-planned-actions state. Indices are
    /// the original probe indices and never shift.
    pub tracks: Vec<Track>,
    /// Virtual container tags.
    pub tags: BTreeMap<String, String>,
    /// Virtual container format.
    pub container: String,
    pub plan: Plan,
}

impl<'a> EvalContext<'a> {
    fn new(file: &'a FileInfo, analyses: &'a AnalysisSet) -> Self {
        Self {
            file,
            analyses,
            tracks: file.tracks.clone(),
            tags: file.tags.clone(),
            container: file.container.clone(),
            plan: Plan::new(file.path.clone(), file.container.clone()),
        }
    }

    fn into_plan(self) -> Plan {
        self.plan
    }

    pub fn condition_input(&self) -> ConditionInput<'_> {
        ConditionInput {
            tracks: &self.tracks,
            tags: &self.tags,
            analyses: self.analyses,
        }
    }

    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &Track> {
        self.tracks.iter().filter(move |t| t.kind == kind)
    }

    pub fn track(&self, index: usize) -> Option<&Track> {
        self.tracks.iter().find(|t| t.index == index)
    }

    /// Plan a default-flag change, eliding no-ops.
    pub fn plan_default(&mut self, index: usize, desired: bool) {
        let Some(track) = self.tracks.iter_mut().find(|t| t.index == index) else {
            return;
        };
        if track.is_default == desired {
            return;
        }
        let action = if desired {
            PlannedAction::SetDefault {
                track_index: index,
                current_value: track.is_default,
                desired_value: desired,
            }
        } else {
            PlannedAction::ClearDefault {
                track_index: index,
                current_value: track.is_default,
                desired_value: desired,
            }
        };
        track.is_default = desired;
        self.plan.actions.push(action);
    }

    /// Plan a forced-flag change, eliding no-ops.
    pub fn plan_forced(&mut self, index: usize, desired: bool) {
        let Some(track) = self.tracks.iter_mut().find(|t| t.index == index) else {
            return;
        };
        if track.is_forced == desired {
            return;
        }
        let action = if desired {
            PlannedAction::SetForced {
                track_index: index,
                current_value: track.is_forced,
                desired_value: desired,
            }
        } else {
            PlannedAction::ClearForced {
                track_index: index,
                current_value: track.is_forced,
                desired_value: desired,
            }
        };
        track.is_forced = desired;
        self.plan.actions.push(action);
    }

    pub fn plan_title(&mut self, index: usize, desired: Option<String>) {
        let Some(track) = self.tracks.iter_mut().find(|t| t.index == index) else {
            return;
        };
        if track.title == desired {
            return;
        }
        self.plan.actions.push(PlannedAction::SetTitle {
            track_index: index,
            current_value: track.title.clone(),
            desired_value: desired.clone(),
        });
        track.title = desired;
    }

    pub fn plan_language(&mut self, index: usize, desired: String) {
        let desired = vpo_model::normalize_language(Some(&desired));
        let Some(track) = self.tracks.iter_mut().find(|t| t.index == index) else {
            return;
        };
        if track.language == desired {
            return;
        }
        self.plan.actions.push(PlannedAction::SetLanguage {
            track_index: index,
            current_value: track.language.clone(),
            desired_value: desired.clone(),
        });
        track.language = desired;
    }

    /// Plan a track removal and drop it from the virtual state.
    pub fn plan_remove(&mut self, index: usize, reason: String) {
        let Some(pos) = self.tracks.iter().position(|t| t.index == index) else {
            return;
        };
        let track = self.tracks.remove(pos);
        self.plan.actions.push(PlannedAction::RemoveTrack {
            track_index: index,
            kind_removed: track.kind,
            reason,
        });
    }

    /// Plan a container-tag edit; an empty value deletes the tag.
    pub fn plan_container_tag(&mut self, field: &str, desired: &str) {
        let key = field.to_ascii_lowercase();
        let current = self.tags.get(&key);
        if desired.is_empty() {
            if current.is_none() {
                return;
            }
            self.tags.remove(&key);
        } else {
            if current.is_some_and(|v| v == desired) {
                return;
            }
            self.tags.insert(key.clone(), desired.to_string());
        }
        self.plan.actions.push(PlannedAction::SetContainerMetadata {
            current_value: key,
            desired_value: desired.to_string(),
        });
    }
}
