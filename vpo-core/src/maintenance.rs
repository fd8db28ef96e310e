//! Maintenance: job-log retention, orphaned temp-file sweep, and stale
//! job recovery rolled into one report.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tracing::{info, warn};

use crate::error::Result;
use crate::queue::{JobQueue, DEFAULT_HEARTBEAT_TIMEOUT_SECS};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub logs_deleted: u64,
    pub temp_files_removed: u64,
    pub stale_jobs_recovered: u64,
}

/// Delete job logs older than `deletion_days`.
///
/// The retention policy has two thresholds; files past the compression
/// threshold but under the deletion threshold are left in place, files
/// past the deletion threshold are removed.
pub fn clean_job_logs(logs_dir: &Path, deletion_days: u32) -> Result<u64> {
    if !logs_dir.exists() {
        return Ok(0);
    }
    let cutoff = SystemTime::now() - Duration::from_secs(u64::from(deletion_days) * 86_400);
    let mut deleted = 0u64;
    for entry in std::fs::read_dir(logs_dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("log") {
            continue;
        }
        let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
            continue;
        };
        if modified < cutoff {
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    info!(path = %path.display(), "deleted expired job log");
                    deleted += 1;
                }
                Err(err) => warn!(path = %path.display(), "could not delete log: {err}"),
            }
        }
    }
    Ok(deleted)
}

/// Remove orphaned `.vpo_temp_*` files under the given directories. A
/// crashed run can leave one behind; the sentinel prefix makes them
/// unambiguous.
pub fn sweep_temp_files(dirs: &[PathBuf]) -> Result<u64> {
    let mut removed = 0u64;
    for dir in dirs {
        sweep_dir(dir, &mut removed);
    }
    Ok(removed)
}

fn sweep_dir(dir: &Path, removed: &mut u64) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(dir = %dir.display(), "cannot read directory: {err}");
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            sweep_dir(&path, removed);
            continue;
        }
        let name = entry.file_name();
        if name.to_string_lossy().starts_with(".vpo_temp_") {
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    info!(path = %path.display(), "removed orphaned temp file");
                    *removed += 1;
                }
                Err(err) => warn!(path = %path.display(), "could not remove temp: {err}"),
            }
        }
    }
}

/// Full maintenance pass.
pub async fn run_maintenance(
    queue: &JobQueue,
    logs_dir: &Path,
    media_dirs: &[PathBuf],
    log_deletion_days: u32,
) -> Result<MaintenanceReport> {
    Ok(MaintenanceReport {
        logs_deleted: clean_job_logs(logs_dir, log_deletion_days)?,
        temp_files_removed: sweep_temp_files(media_dirs)?,
        stale_jobs_recovered: queue
            .recover_stale_jobs(DEFAULT_HEARTBEAT_TIMEOUT_SECS)
            .await?,
    })
}
