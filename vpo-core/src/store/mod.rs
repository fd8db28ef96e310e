//! The library store: a single SQLite file per data directory.
//!
//! Writes go through a pool capped at one connection, which is the
//! single-writer discipline the job queue's claim protocol builds on;
//! long HTTP reads run on a separate read pool so they never sit on the
//! writer. Timestamps cross the storage boundary as ISO-8601 UTC text.

pub mod analysis;
pub mod files;
pub mod plans;
pub mod stats;

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::error::{CoreError, Result};

/// Ordered schema migrations; `_meta.schema_version` records the last one
/// applied.
const MIGRATIONS: &[&str] = &[
    // v1: base schema
    r#"
    CREATE TABLE files (
        id TEXT PRIMARY KEY,
        path TEXT NOT NULL UNIQUE,
        container TEXT NOT NULL DEFAULT '',
        size_bytes INTEGER NOT NULL DEFAULT 0,
        modified_at TEXT,
        duration_seconds REAL,
        tags_json TEXT NOT NULL DEFAULT '{}',
        content_hash TEXT,
        probed_at TEXT NOT NULL
    );
    CREATE INDEX idx_files_path ON files(path);

    CREATE TABLE tracks (
        file_id TEXT NOT NULL REFERENCES files(id) ON DELETE CASCADE,
        track_index INTEGER NOT NULL,
        kind TEXT NOT NULL,
        codec TEXT,
        language TEXT NOT NULL DEFAULT 'und',
        title TEXT,
        is_default INTEGER NOT NULL DEFAULT 0,
        is_forced INTEGER NOT NULL DEFAULT 0,
        width INTEGER,
        height INTEGER,
        frame_rate TEXT,
        channels INTEGER,
        channel_layout TEXT,
        color_json TEXT,
        PRIMARY KEY (file_id, track_index)
    );

    CREATE TABLE jobs (
        id TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        path TEXT NOT NULL,
        policy TEXT,
        priority INTEGER NOT NULL DEFAULT 100,
        status TEXT NOT NULL DEFAULT 'queued',
        created_at TEXT NOT NULL,
        started_at TEXT,
        completed_at TEXT,
        worker_pid INTEGER,
        worker_heartbeat TEXT,
        progress_percent REAL NOT NULL DEFAULT 0,
        progress_json TEXT,
        error_message TEXT,
        output_path TEXT,
        backup_path TEXT
    );
    CREATE INDEX idx_jobs_claim ON jobs(status, priority, created_at);
    CREATE INDEX idx_jobs_path ON jobs(path);

    CREATE TABLE plans (
        id TEXT PRIMARY KEY,
        job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
        file_path TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        plan_json TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE TABLE processing_stats (
        id TEXT PRIMARY KEY,
        job_id TEXT,
        file_path TEXT NOT NULL,
        input_bytes INTEGER NOT NULL,
        output_bytes INTEGER NOT NULL,
        wall_seconds REAL NOT NULL,
        encoder TEXT NOT NULL,
        encoder_type TEXT NOT NULL,
        fallback_occurred INTEGER NOT NULL DEFAULT 0,
        mean_fps REAL,
        peak_fps REAL,
        mean_bitrate_kbps REAL,
        total_frames INTEGER,
        created_at TEXT NOT NULL
    );

    CREATE TABLE language_analysis_results (
        file_id TEXT NOT NULL REFERENCES files(id) ON DELETE CASCADE,
        track_index INTEGER NOT NULL,
        primary_language TEXT,
        confidence REAL NOT NULL DEFAULT 0,
        PRIMARY KEY (file_id, track_index)
    );

    CREATE TABLE language_segments (
        file_id TEXT NOT NULL REFERENCES files(id) ON DELETE CASCADE,
        track_index INTEGER NOT NULL,
        seq INTEGER NOT NULL,
        language TEXT NOT NULL,
        start_seconds REAL NOT NULL,
        end_seconds REAL NOT NULL,
        PRIMARY KEY (file_id, track_index, seq)
    );

    CREATE TABLE track_classifications (
        file_id TEXT NOT NULL REFERENCES files(id) ON DELETE CASCADE,
        track_index INTEGER NOT NULL,
        is_original INTEGER,
        confidence REAL NOT NULL DEFAULT 0,
        detected_language TEXT,
        category TEXT NOT NULL DEFAULT 'unknown',
        PRIMARY KEY (file_id, track_index)
    );

    CREATE TABLE plugin_metadata (
        file_id TEXT NOT NULL REFERENCES files(id) ON DELETE CASCADE,
        plugin TEXT NOT NULL,
        payload_json TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (file_id, plugin)
    );

    CREATE TABLE plugin_registry (
        name TEXT PRIMARY KEY,
        version TEXT,
        enabled INTEGER NOT NULL DEFAULT 1,
        acknowledged INTEGER NOT NULL DEFAULT 0,
        registered_at TEXT NOT NULL
    );
    "#,
];

#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub busy_timeout: Duration,
    pub read_pool_size: u32,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_secs(30),
            read_pool_size: 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Store {
    writer: SqlitePool,
    reader: SqlitePool,
}

impl Store {
    /// Open (and create/migrate) the store at `path`.
    pub async fn open(path: &Path, opts: StoreOptions) -> Result<Self> {
        let url = format!("sqlite://{}", path.display());
        let connect = SqliteConnectOptions::from_str(&url)
            .map_err(CoreError::Database)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(opts.busy_timeout)
            .foreign_keys(true);

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect.clone())
            .await?;
        let reader = SqlitePoolOptions::new()
            .max_connections(opts.read_pool_size)
            .connect_with(connect)
            .await?;

        let store = Self { writer, reader };
        store.migrate().await?;
        Ok(store)
    }

    /// In-memory store for tests.
    pub async fn open_in_memory() -> Result<Self> {
        let connect = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(CoreError::Database)?
            .foreign_keys(true);
        // One shared connection: a second :memory: connection would see a
        // different database.
        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect)
            .await?;
        let store = Self { writer: writer.clone(), reader: writer };
        store.migrate().await?;
        Ok(store)
    }

    pub fn writer(&self) -> &SqlitePool {
        &self.writer
    }

    pub fn reader(&self) -> &SqlitePool {
        &self.reader
    }

    pub async fn schema_version(&self) -> Result<u32> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT value FROM _meta WHERE key = 'schema_version'")
                .fetch_optional(&self.writer)
                .await?;
        Ok(row
            .and_then(|(v,)| v.parse().ok())
            .unwrap_or(0))
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query("CREATE TABLE IF NOT EXISTS _meta (key TEXT PRIMARY KEY, value TEXT NOT NULL)")
            .execute(&self.writer)
            .await?;

        let current = self.schema_version().await?;
        if current as usize > MIGRATIONS.len() {
            return Err(CoreError::DataIntegrity(format!(
                "database schema version {current} is newer than this build supports \
                 ({} migrations)",
                MIGRATIONS.len()
            )));
        }

        for (offset, migration) in MIGRATIONS.iter().enumerate().skip(current as usize) {
            let version = offset + 1;
            debug!(version, "applying schema migration");
            let mut tx = self.writer.begin().await?;
            for statement in split_statements(migration) {
                sqlx::query(&statement).execute(&mut *tx).await?;
            }
            sqlx::query(
                "INSERT INTO _meta (key, value) VALUES ('schema_version', ?1)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            )
            .bind(version.to_string())
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            info!(version, "schema migrated");
        }
        Ok(())
    }
}

/// SQLite executes one statement per call; split a migration blob on the
/// semicolons that end statements.
fn split_statements(blob: &str) -> Vec<String> {
    blob.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

/// Format a timestamp for storage.
pub(crate) fn to_db_time(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

/// Parse a stored timestamp; bad data maps to a data-integrity error.
pub(crate) fn from_db_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| CoreError::DataIntegrity(format!("bad timestamp {raw:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn migrations_apply_once() {
        let store = Store::open_in_memory().await.unwrap();
        assert_eq!(store.schema_version().await.unwrap(), 1);
        // Re-running is a no-op.
        store.migrate().await.unwrap();
        assert_eq!(store.schema_version().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn on_disk_store_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("library.db");
        let store = Store::open(&path, StoreOptions::default()).await.unwrap();
        assert!(path.exists());
        assert_eq!(store.schema_version().await.unwrap(), 1);
    }

    #[test]
    fn time_round_trip() {
        let now = Utc::now();
        let parsed = from_db_time(&to_db_time(now)).unwrap();
        assert!((now - parsed).num_microseconds().unwrap().abs() < 2);
    }

    #[test]
    fn statement_splitting() {
        let statements = split_statements("CREATE TABLE a (x);\n\nCREATE INDEX i ON a(x);\n");
        assert_eq!(statements.len(), 2);
    }
}
