//! Crash-safe backups.
//!
//! The backup is created before any mutation and pinned until the run
//! succeeds. Hard links make it free when source and backup share a
//! filesystem; otherwise a full copy is taken.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{CoreError, Result};

/// `<name>.vpo_backup.<ext>` sibling of the source file.
pub fn backup_path_for(source: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let ext = source
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = if ext.is_empty() {
        format!("{stem}.vpo_backup")
    } else {
        format!("{stem}.vpo_backup.{ext}")
    };
    source.with_file_name(name)
}

/// Create a backup of `source`.
///
/// `allow_hard_link` is only safe for strategies that replace the original
/// by rename: an in-place editor writes through the shared inode and would
/// corrupt a hard-linked backup, so the in-place strategy takes a full copy.
pub fn create_backup(source: &Path, allow_hard_link: bool) -> Result<PathBuf> {
    if !source.exists() {
        return Err(CoreError::Preflight(format!(
            "source file does not exist: {}",
            source.display()
        )));
    }
    let backup = backup_path_for(source);
    if backup.exists() {
        std::fs::remove_file(&backup)?;
    }
    if allow_hard_link {
        match std::fs::hard_link(source, &backup) {
            Ok(()) => {
                debug!(backup = %backup.display(), "backup hard-linked");
                return Ok(backup);
            }
            Err(err) => {
                debug!("hard link failed ({err}), copying instead");
            }
        }
    }
    std::fs::copy(source, &backup)?;
    Ok(backup)
}

/// Restore the original file from its backup, atomically where the
/// filesystem allows. Failures are logged, not propagated: restore runs
/// on error paths where the original error matters more.
pub fn safe_restore_from_backup(backup: &Path) -> bool {
    let Some(original) = original_path_for(backup) else {
        warn!(backup = %backup.display(), "cannot derive original path from backup name");
        return false;
    };
    match std::fs::rename(backup, &original) {
        Ok(()) => true,
        Err(rename_err) => {
            // Cross-device rename: copy then unlink.
            match std::fs::copy(backup, &original).and_then(|_| std::fs::remove_file(backup)) {
                Ok(()) => true,
                Err(copy_err) => {
                    warn!(
                        backup = %backup.display(),
                        "backup restore failed: rename: {rename_err}; copy: {copy_err}"
                    );
                    false
                }
            }
        }
    }
}

/// Remove a backup after success.
pub fn discard_backup(backup: &Path) {
    if let Err(err) = std::fs::remove_file(backup) {
        warn!(backup = %backup.display(), "could not remove backup: {err}");
    }
}

/// Invert [`backup_path_for`].
fn original_path_for(backup: &Path) -> Option<PathBuf> {
    let name = backup.file_name()?.to_string_lossy().into_owned();
    let restored = name.replacen(".vpo_backup", "", 1);
    if restored == name {
        return None;
    }
    Some(backup.with_file_name(restored))
}
