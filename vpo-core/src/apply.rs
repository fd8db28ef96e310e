//! The apply workflow: evaluate a policy against one file and realize
//! the resulting plan.
//!
//! Probe, persist, load analyses, evaluate, execute, re-probe. A
//! successful execution invalidates the stored probe, so the refresh at
//! the end is part of the contract, not a nicety.

use std::path::Path;

use tracing::info;
use vpo_model::{Plan, Policy};

use crate::error::Result;
use crate::evaluator::evaluate;
use crate::executor::{ExecutionOutcome, Executor, ExecutorOptions};
use crate::probe::probe_file;
use crate::store::Store;
use crate::tools::ToolRegistry;

/// What one apply run produced.
#[derive(Debug)]
pub struct ApplyReport {
    pub plan: Plan,
    /// None for dry runs.
    pub outcome: Option<ExecutionOutcome>,
}

#[derive(Debug, Default)]
pub struct ApplyOptions {
    pub dry_run: bool,
    pub executor: ExecutorOptions,
}

/// Evaluate `policy` against `path` and execute the plan.
pub async fn apply_policy(
    registry: &ToolRegistry,
    store: &Store,
    policy: &Policy,
    path: &Path,
    opts: &ApplyOptions,
) -> Result<ApplyReport> {
    let info = probe_file(registry, path).await?;
    let file_id = store.upsert_file(&info, None).await?;
    let analyses = store.load_analyses(file_id).await?;

    let plan = evaluate(policy, &info, &analyses)?;
    info!(
        path = %path.display(),
        actions = plan.actions.len(),
        warnings = plan.warnings.len(),
        "plan evaluated"
    );

    if opts.dry_run {
        return Ok(ApplyReport { plan, outcome: None });
    }

    let executor = Executor::new(registry);
    let outcome = executor.execute(&plan, &info, &opts.executor).await?;

    // The file changed shape; refresh the stored probe.
    if !outcome.skipped {
        let refreshed = probe_file(registry, &outcome.output_path).await?;
        if outcome.output_path != *path {
            // Container conversion: the row moves to the new path.
            store.delete_file_by_path(path).await?;
        }
        store.upsert_file(&refreshed, None).await?;
    }

    Ok(ApplyReport { plan, outcome: Some(outcome) })
}
