use std::path::PathBuf;

use thiserror::Error;

/// Engine error taxonomy. Variants map one-to-one onto how the failure is
/// handled: configuration errors never reach the executor, preflight
/// errors abort before any mutation, subprocess and validation errors
/// trigger a backup restore, and lock contention is converted to "no work"
/// by the queue rather than surfaced.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("{tool} not found; install it or set its path explicitly")]
    ToolMissing { tool: String },

    #[error("{tool} is too old: {detail}")]
    ToolOutdated { tool: String, detail: String },

    #[error("preflight failed: {0}")]
    Preflight(String),

    #[error("insufficient disk space: need {needed_bytes} bytes, {available_bytes} available in {dir}")]
    InsufficientDiskSpace {
        needed_bytes: u64,
        available_bytes: u64,
        dir: PathBuf,
    },

    #[error("stream {stream_index} codec {codec:?} is not compatible with {container}")]
    IncompatibleCodec {
        stream_index: usize,
        codec: String,
        container: String,
    },

    #[error("{tool} failed with exit code {code:?}: {detail}")]
    Subprocess {
        tool: String,
        code: Option<i32>,
        detail: String,
    },

    #[error("{tool} exceeded its {seconds}s deadline and was killed")]
    Timeout { tool: String, seconds: u64 },

    #[error("output validation failed: {0}")]
    Validation(String),

    #[error("policy rule {rule:?} failed: {message}")]
    ConditionalFail { rule: String, message: String },

    #[error("track filter would leave no usable tracks: {0}")]
    InsufficientTracks(String),

    #[error("probe output unusable: {0}")]
    Probe(String),

    #[error("schema mismatch: {0}")]
    DataIntegrity(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Model(#[from] vpo_model::ModelError),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    /// True for errors the executor answers with a backup restore.
    pub fn triggers_restore(&self) -> bool {
        matches!(
            self,
            Self::Subprocess { .. } | Self::Timeout { .. } | Self::Validation(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
