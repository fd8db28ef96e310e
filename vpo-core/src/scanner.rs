//! Incremental library scanning.
//!
//! A scan walks the given directories, compares each video file's size
//! and mtime against the stored row, and re-probes only what changed.
//! `--full` re-probes everything, `--verify-hash` additionally checks a
//! content hash over the head and tail of the file, and `--prune` drops
//! rows whose files vanished.

use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::probe::probe_file;
use crate::store::Store;
use crate::tools::ToolRegistry;

const VIDEO_EXTENSIONS: &[&str] = &[
    "mkv", "mp4", "m4v", "avi", "mov", "webm", "ts", "m2ts", "flv", "wmv",
];

/// Window hashed at each end of the file for change verification.
const HASH_WINDOW_BYTES: u64 = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, Default)]
pub struct ScanOptions {
    /// Re-probe every file regardless of size/mtime.
    pub full: bool,
    /// Remove store rows for files that no longer exist.
    pub prune: bool,
    /// Hash head+tail windows and compare against the stored hash.
    pub verify_hash: bool,
    /// Walk and report without writing anything.
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    pub discovered: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub pruned: u64,
    pub errors: u64,
}

#[derive(Debug)]
pub struct Scanner<'a> {
    store: &'a Store,
    registry: &'a ToolRegistry,
}

impl<'a> Scanner<'a> {
    pub fn new(store: &'a Store, registry: &'a ToolRegistry) -> Self {
        Self { store, registry }
    }

    pub async fn scan(&self, dirs: &[PathBuf], opts: ScanOptions) -> Result<ScanReport> {
        let mut report = ScanReport::default();

        for dir in dirs {
            let mut files = Vec::new();
            collect_video_files(dir, &mut files);
            files.sort();
            for path in files {
                match self.scan_one(&path, opts).await {
                    Ok(ScanOutcome::New) => {
                        report.discovered += 1;
                    }
                    Ok(ScanOutcome::Updated) => {
                        report.updated += 1;
                    }
                    Ok(ScanOutcome::Unchanged) => {
                        report.unchanged += 1;
                    }
                    Err(err) => {
                        warn!(path = %path.display(), "scan failed: {err}");
                        report.errors += 1;
                    }
                }
            }
        }

        if opts.prune {
            for dir in dirs {
                for stored in self.store.paths_under(dir).await? {
                    if !stored.exists() {
                        info!(path = %stored.display(), "pruning vanished file");
                        if !opts.dry_run {
                            self.store.delete_file_by_path(&stored).await?;
                        }
                        report.pruned += 1;
                    }
                }
            }
        }

        info!(
            discovered = report.discovered,
            updated = report.updated,
            unchanged = report.unchanged,
            pruned = report.pruned,
            errors = report.errors,
            "scan finished"
        );
        Ok(report)
    }

    async fn scan_one(&self, path: &Path, opts: ScanOptions) -> Result<ScanOutcome> {
        let metadata = std::fs::metadata(path)?;
        let size = metadata.len();
        let mtime: Option<DateTime<Utc>> = metadata.modified().ok().map(DateTime::from);

        let existing = self.store.file_meta(path).await?;
        let outcome = match &existing {
            None => ScanOutcome::New,
            Some(meta) => {
                let meta_changed = meta.size_bytes != size
                    || !same_second(meta.modified_at, mtime);
                let hash_changed = if opts.verify_hash {
                    let hash = content_hash(path)?;
                    meta.content_hash.as_deref() != Some(hash.as_str())
                } else {
                    false
                };
                if opts.full || meta_changed || hash_changed {
                    ScanOutcome::Updated
                } else {
                    ScanOutcome::Unchanged
                }
            }
        };

        if matches!(outcome, ScanOutcome::Unchanged) || opts.dry_run {
            debug!(path = %path.display(), ?outcome, dry_run = opts.dry_run, "scan decision");
            return Ok(outcome);
        }

        let info = probe_file(self.registry, path).await?;
        let hash = if opts.verify_hash {
            Some(content_hash(path)?)
        } else {
            existing.and_then(|m| m.content_hash)
        };
        self.store.upsert_file(&info, hash.as_deref()).await?;
        Ok(outcome)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanOutcome {
    New,
    Updated,
    Unchanged,
}

/// mtimes round-trip through the store at second granularity across
/// filesystems; compare accordingly.
fn same_second(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => (a - b).num_seconds().abs() < 2,
        (None, None) => true,
        _ => false,
    }
}

fn collect_video_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(dir = %dir.display(), "cannot read directory: {err}");
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        // Skip our own work files and dotfiles.
        if name.starts_with('.') || name.contains(".vpo_backup") {
            continue;
        }
        if path.is_dir() {
            collect_video_files(&path, out);
        } else if is_video_file(&path) {
            out.push(path);
        }
    }
}

fn is_video_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| VIDEO_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// SHA-256 over the first and last windows of the file plus its length.
/// Catches truncation and re-encodes without reading the whole payload.
pub fn content_hash(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let len = file.metadata()?.len();
    let mut hasher = Sha256::new();
    hasher.update(len.to_le_bytes());

    let window = HASH_WINDOW_BYTES.min(len);
    let mut buf = vec![0u8; window as usize];
    file.read_exact(&mut buf)?;
    hasher.update(&buf);

    if len > HASH_WINDOW_BYTES * 2 {
        file.seek(SeekFrom::End(-(window as i64)))?;
        file.read_exact(&mut buf)?;
        hasher.update(&buf);
    }

    let digest = hasher.finalize();
    Ok(format!("{digest:x}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn video_extension_filter() {
        assert!(is_video_file(Path::new("/m/a.mkv")));
        assert!(is_video_file(Path::new("/m/a.MP4")));
        assert!(!is_video_file(Path::new("/m/a.srt")));
        assert!(!is_video_file(Path::new("/m/a")));
    }

    #[test]
    fn walk_skips_backups_and_dotfiles() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("season1")).unwrap();
        std::fs::write(dir.path().join("a.mkv"), b"x").unwrap();
        std::fs::write(dir.path().join("season1/b.mp4"), b"x").unwrap();
        std::fs::write(dir.path().join("a.vpo_backup.mkv"), b"x").unwrap();
        std::fs::write(dir.path().join(".vpo_temp_a.mkv"), b"x").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        let mut files = Vec::new();
        collect_video_files(dir.path(), &mut files);
        files.sort();
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("a.mkv"));
        assert!(files[1].ends_with("season1/b.mp4"));
    }

    #[test]
    fn content_hash_changes_with_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.mkv");
        std::fs::write(&path, b"first contents").unwrap();
        let first = content_hash(&path).unwrap();

        std::fs::write(&path, b"other contents!").unwrap();
        let second = content_hash(&path).unwrap();
        assert_ne!(first, second);

        // Same content, same hash.
        std::fs::write(&path, b"first contents").unwrap();
        assert_eq!(content_hash(&path).unwrap(), first);
    }

    #[test]
    fn second_granularity_comparison() {
        let now = Utc::now();
        assert!(same_second(Some(now), Some(now + chrono::Duration::milliseconds(500))));
        assert!(!same_second(Some(now), Some(now + chrono::Duration::seconds(5))));
        assert!(same_second(None, None));
        assert!(!same_second(Some(now), None));
    }
}
