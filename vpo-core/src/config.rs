//! Runtime configuration with layered precedence:
//! CLI args > environment (`VPO_*`) > config file > defaults.
//!
//! The CLI layer applies its overrides on top of [`Config::load`]; this
//! module owns the file and environment tiers.

use std::path::PathBuf;

use serde::Deserialize;
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::tools::ToolPaths;

fn default_data_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(|home| PathBuf::from(home).join(".local/share/vpo"))
        .unwrap_or_else(|| PathBuf::from("/var/lib/vpo"))
}

fn default_worker_count() -> usize {
    2
}

fn default_bind_addr() -> String {
    "127.0.0.1:8920".to_string()
}

fn default_db_timeout() -> u64 {
    30
}

fn default_log_compression_days() -> u32 {
    7
}

fn default_log_deletion_days() -> u32 {
    30
}

fn default_base_timeout() -> u64 {
    1800
}

/// File-tier configuration; every field optional so a partial file works.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct ConfigFile {
    data_dir: Option<PathBuf>,
    database_path: Option<PathBuf>,
    temp_dir: Option<PathBuf>,
    ffmpeg_path: Option<PathBuf>,
    ffprobe_path: Option<PathBuf>,
    mkvmerge_path: Option<PathBuf>,
    mkvpropedit_path: Option<PathBuf>,
    db_timeout_secs: Option<u64>,
    log_compression_days: Option<u32>,
    log_deletion_days: Option<u32>,
    auth_token: Option<String>,
    plugin_dirs: Option<Vec<PathBuf>>,
    worker_count: Option<usize>,
    bind_addr: Option<String>,
    base_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub database_path: Option<PathBuf>,
    pub temp_dir: Option<PathBuf>,
    pub tool_paths: ToolPaths,
    pub db_timeout_secs: u64,
    pub log_compression_days: u32,
    pub log_deletion_days: u32,
    pub auth_token: Option<String>,
    pub plugin_dirs: Vec<PathBuf>,
    pub worker_count: usize,
    pub bind_addr: String,
    /// Base subprocess timeout; zero disables deadlines.
    pub base_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            database_path: None,
            temp_dir: None,
            tool_paths: ToolPaths::default(),
            db_timeout_secs: default_db_timeout(),
            log_compression_days: default_log_compression_days(),
            log_deletion_days: default_log_deletion_days(),
            auth_token: None,
            plugin_dirs: Vec::new(),
            worker_count: default_worker_count(),
            bind_addr: default_bind_addr(),
            base_timeout_secs: default_base_timeout(),
        }
    }
}

impl Config {
    /// Resolve defaults, then the config file, then the environment.
    pub fn load(config_path: Option<&std::path::Path>) -> Result<Self> {
        let mut config = Self::default();

        let file_path = config_path
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("VPO_CONFIG_PATH").map(PathBuf::from));
        if let Some(path) = file_path {
            if path.exists() {
                debug!(path = %path.display(), "loading config file");
                let text = std::fs::read_to_string(&path)?;
                let file: ConfigFile = serde_yaml::from_str(&text).map_err(|e| {
                    CoreError::Config(format!("{}: {e}", path.display()))
                })?;
                config.apply_file(file);
            } else if config_path.is_some() {
                return Err(CoreError::Config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
        }

        config.apply_env();
        Ok(config)
    }

    fn apply_file(&mut self, file: ConfigFile) {
        if let Some(v) = file.data_dir {
            self.data_dir = v;
        }
        self.database_path = file.database_path.or(self.database_path.take());
        self.temp_dir = file.temp_dir.or(self.temp_dir.take());
        self.tool_paths.ffmpeg = file.ffmpeg_path.or(self.tool_paths.ffmpeg.take());
        self.tool_paths.ffprobe = file.ffprobe_path.or(self.tool_paths.ffprobe.take());
        self.tool_paths.mkvmerge = file.mkvmerge_path.or(self.tool_paths.mkvmerge.take());
        self.tool_paths.mkvpropedit =
            file.mkvpropedit_path.or(self.tool_paths.mkvpropedit.take());
        if let Some(v) = file.db_timeout_secs {
            self.db_timeout_secs = v;
        }
        if let Some(v) = file.log_compression_days {
            self.log_compression_days = v;
        }
        if let Some(v) = file.log_deletion_days {
            self.log_deletion_days = v;
        }
        self.auth_token = file.auth_token.or(self.auth_token.take());
        if let Some(v) = file.plugin_dirs {
            self.plugin_dirs = v;
        }
        if let Some(v) = file.worker_count {
            self.worker_count = v;
        }
        if let Some(v) = file.bind_addr {
            self.bind_addr = v;
        }
        if let Some(v) = file.base_timeout_secs {
            self.base_timeout_secs = v;
        }
    }

    fn apply_env(&mut self) {
        let path_var = |name: &str| std::env::var_os(name).map(PathBuf::from);
        if let Some(v) = path_var("VPO_DATA_DIR") {
            self.data_dir = v;
        }
        if let Some(v) = path_var("VPO_DATABASE_PATH") {
            self.database_path = Some(v);
        }
        if let Some(v) = path_var("VPO_TEMP_DIR") {
            self.temp_dir = Some(v);
        }
        if let Some(v) = path_var("VPO_FFMPEG_PATH") {
            self.tool_paths.ffmpeg = Some(v);
        }
        if let Some(v) = path_var("VPO_FFPROBE_PATH") {
            self.tool_paths.ffprobe = Some(v);
        }
        if let Some(v) = path_var("VPO_MKVMERGE_PATH") {
            self.tool_paths.mkvmerge = Some(v);
        }
        if let Some(v) = path_var("VPO_MKVPROPEDIT_PATH") {
            self.tool_paths.mkvpropedit = Some(v);
        }
        if let Ok(v) = std::env::var("VPO_DB_TIMEOUT") {
            if let Ok(secs) = v.parse() {
                self.db_timeout_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("VPO_LOG_COMPRESSION_DAYS") {
            if let Ok(days) = v.parse() {
                self.log_compression_days = days;
            }
        }
        if let Ok(v) = std::env::var("VPO_LOG_DELETION_DAYS") {
            if let Ok(days) = v.parse() {
                self.log_deletion_days = days;
            }
        }
        if let Ok(v) = std::env::var("VPO_AUTH_TOKEN") {
            if !v.is_empty() {
                self.auth_token = Some(v);
            }
        }
        if let Ok(v) = std::env::var("VPO_PLUGIN_DIRS") {
            let dirs: Vec<PathBuf> = std::env::split_paths(&v).collect();
            if !dirs.is_empty() {
                self.plugin_dirs = dirs;
            }
        }
    }

    /// The store path: explicit override or `<data_dir>/library.db`.
    pub fn resolved_database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("library.db"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.worker_count, 2);
        assert_eq!(config.db_timeout_secs, 30);
        assert_eq!(config.base_timeout_secs, 1800);
        assert!(config.auth_token.is_none());
    }

    #[test]
    fn file_tier_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "data_dir: /srv/vpo\nworker_count: 6\nffmpeg_path: /opt/ffmpeg/bin/ffmpeg\n",
        )
        .unwrap();
        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/srv/vpo"));
        assert_eq!(config.worker_count, 6);
        assert_eq!(
            config.tool_paths.ffmpeg,
            Some(PathBuf::from("/opt/ffmpeg/bin/ffmpeg"))
        );
    }

    #[test]
    fn unknown_file_keys_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "wrker_count: 6\n").unwrap();
        assert!(Config::load(Some(&path)).is_err());
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        assert!(Config::load(Some(std::path::Path::new("/no/such/config.yaml"))).is_err());
    }

    #[test]
    fn database_path_resolution() {
        let mut config = Config::default();
        config.data_dir = PathBuf::from("/srv/vpo");
        assert_eq!(
            config.resolved_database_path(),
            PathBuf::from("/srv/vpo/library.db")
        );
        config.database_path = Some(PathBuf::from("/fast/disk/library.db"));
        assert_eq!(
            config.resolved_database_path(),
            PathBuf::from("/fast/disk/library.db")
        );
    }
}
