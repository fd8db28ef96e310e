//! The VPO data directory layout.
//!
//! ```text
//! <root>/library.db     the store
//! <root>/logs/          one log file per job id
//! <root>/plugins/       plugin storage, one subdir per plugin
//! <root>/policies/      policy YAML documents
//! <root>/profiles/      alternative configurations
//! ```

use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the directory skeleton if missing.
    pub fn ensure(&self) -> Result<()> {
        for dir in [
            self.root.clone(),
            self.logs_dir(),
            self.plugins_dir(),
            self.policies_dir(),
            self.profiles_dir(),
        ] {
            std::fs::create_dir_all(&dir)?;
        }
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn database_path(&self) -> PathBuf {
        self.root.join("library.db")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn plugins_dir(&self) -> PathBuf {
        self.root.join("plugins")
    }

    pub fn policies_dir(&self) -> PathBuf {
        self.root.join("policies")
    }

    pub fn profiles_dir(&self) -> PathBuf {
        self.root.join("profiles")
    }

    pub fn job_log_path(&self, job_id: Uuid) -> PathBuf {
        self.logs_dir().join(format!("{job_id}.log"))
    }

    pub fn plugin_storage(&self, plugin: &str) -> PathBuf {
        self.plugins_dir().join(plugin)
    }

    /// Policy file lookup: `<name>.yaml` then `<name>.yml`.
    pub fn policy_path(&self, name: &str) -> Option<PathBuf> {
        for ext in ["yaml", "yml"] {
            let candidate = self.policies_dir().join(format!("{name}.{ext}"));
            if candidate.exists() {
                return Some(candidate);
            }
        }
        None
    }

    pub fn list_policies(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let dir = self.policies_dir();
        if !dir.exists() {
            return Ok(names);
        }
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let is_yaml = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e == "yaml" || e == "yml");
            if is_yaml {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}
