//! The persistent job queue.
//!
//! Coordination happens entirely through the `jobs` table on the store's
//! writer pool. The claim protocol is a transactional compare-and-swap:
//! an immediate-write transaction selects the head of the queue and
//! re-checks `status = 'queued'` in the UPDATE, so two workers can never
//! claim the same row. Lock contention surfaces as "no work right now",
//! never as an error.

use std::path::Path;

use chrono::{Duration as ChronoDuration, Utc};
use sqlx::Row;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vpo_model::{Job, JobKind, JobStatus};

use crate::error::{CoreError, Result};
use crate::store::files::parse_uuid;
use crate::store::{from_db_time, to_db_time, Store};

/// Heartbeats older than this many seconds mark a worker as dead.
pub const DEFAULT_HEARTBEAT_TIMEOUT_SECS: i64 = 300;

/// Filter/sort surface for job listings.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub kind: Option<JobKind>,
    pub since: Option<chrono::DateTime<Utc>>,
    /// Substring match on the target path.
    pub search: Option<String>,
    pub sort_by: Option<String>,
    pub sort_descending: bool,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// Per-status counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueStats {
    pub queued: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub total: u64,
}

#[derive(Debug, Clone)]
pub struct JobQueue {
    store: Store,
}

impl JobQueue {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Insert a new queued job. `output_path` is carried through for move
    /// jobs, which name their destination up front.
    pub async fn enqueue(&self, job: &Job) -> Result<()> {
        sqlx::query(
            "INSERT INTO jobs (id, kind, path, policy, priority, status, created_at,
                               output_path, progress_percent)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0)",
        )
        .bind(job.id.to_string())
        .bind(job.kind.as_str())
        .bind(job.path.to_string_lossy().as_ref())
        .bind(&job.policy)
        .bind(job.priority)
        .bind(job.status.as_str())
        .bind(to_db_time(job.created_at))
        .bind(job.output_path.as_ref().map(|p| p.to_string_lossy().into_owned()))
        .execute(self.store.writer())
        .await?;
        debug!(id = %job.id, kind = %job.kind, "job enqueued");
        Ok(())
    }

    /// Atomically claim the next queued job.
    ///
    /// Mutating jobs are mutually exclusive per path: a queued apply for a
    /// file that already has a running mutating job is passed over until
    /// the running one releases.
    pub async fn claim_next_job(&self, worker_pid: i64) -> Result<Option<Job>> {
        let now = to_db_time(Utc::now());

        let mut conn = self.store.writer().acquire().await?;

        // Immediate-write lock serializes claim attempts across processes.
        if let Err(err) = sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await {
            if is_lock_contention(&err) {
                warn!("lock contention while claiming job, treating as no work");
                return Ok(None);
            }
            return Err(err.into());
        }

        let claim = async {
            let row = sqlx::query(
                "SELECT id FROM jobs
                 WHERE status = 'queued'
                   AND (kind = 'scan' OR path NOT IN (
                        SELECT path FROM jobs WHERE status = 'running' AND kind != 'scan'))
                 ORDER BY priority ASC, created_at ASC
                 LIMIT 1",
            )
            .fetch_optional(&mut *conn)
            .await?;

            let Some(row) = row else {
                return Ok::<Option<String>, CoreError>(None);
            };
            let id: String = row.try_get("id")?;

            // The CAS: the status re-check defends against a claim that
            // raced past an earlier rollback.
            let updated = sqlx::query(
                "UPDATE jobs
                 SET status = 'running', started_at = ?1, worker_pid = ?2,
                     worker_heartbeat = ?1
                 WHERE id = ?3 AND status = 'queued'",
            )
            .bind(&now)
            .bind(worker_pid)
            .bind(&id)
            .execute(&mut *conn)
            .await?;

            Ok(if updated.rows_affected() == 1 {
                Some(id)
            } else {
                None
            })
        }
        .await;

        match claim {
            Ok(Some(id)) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                drop(conn);
                self.get(parse_uuid(&id)?).await
            }
            Ok(None) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                Ok(None)
            }
            Err(err) => {
                let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
                if let CoreError::Database(db_err) = &err {
                    if is_lock_contention(db_err) {
                        warn!("lock contention while claiming job, treating as no work");
                        return Ok(None);
                    }
                }
                Err(err)
            }
        }
    }

    /// Refresh the heartbeat; only succeeds while the row is running,
    /// which makes a successful update an assertion of ownership.
    pub async fn update_heartbeat(&self, job_id: Uuid, worker_pid: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET worker_heartbeat = ?1, worker_pid = ?2
             WHERE id = ?3 AND status = 'running'",
        )
        .bind(to_db_time(Utc::now()))
        .bind(worker_pid)
        .bind(job_id.to_string())
        .execute(self.store.writer())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn update_progress(
        &self,
        job_id: Uuid,
        percent: f64,
        detail: Option<&serde_json::Value>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET progress_percent = ?1, progress_json = ?2
             WHERE id = ?3 AND status = 'running'",
        )
        .bind(percent.clamp(0.0, 100.0))
        .bind(detail.map(|d| d.to_string()))
        .bind(job_id.to_string())
        .execute(self.store.writer())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Release a job into a terminal state. The only legitimate way out
    /// of `running`.
    pub async fn release(
        &self,
        job_id: Uuid,
        status: JobStatus,
        error_message: Option<&str>,
        output_path: Option<&Path>,
        backup_path: Option<&Path>,
    ) -> Result<bool> {
        if !status.is_terminal() {
            return Err(CoreError::Config(format!(
                "release requires a terminal status, got {status}"
            )));
        }
        let result = sqlx::query(
            "UPDATE jobs
             SET status = ?1, completed_at = ?2, error_message = ?3,
                 output_path = ?4, backup_path = ?5,
                 worker_pid = NULL, worker_heartbeat = NULL
             WHERE id = ?6",
        )
        .bind(status.as_str())
        .bind(to_db_time(Utc::now()))
        .bind(error_message)
        .bind(output_path.map(|p| p.to_string_lossy().into_owned()))
        .bind(backup_path.map(|p| p.to_string_lossy().into_owned()))
        .bind(job_id.to_string())
        .execute(self.store.writer())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Return running rows with stale heartbeats to the queue. Strictly
    /// older than the threshold: a heartbeat exactly at the boundary is
    /// not yet stale.
    pub async fn recover_stale_jobs(&self, threshold_secs: i64) -> Result<u64> {
        let cutoff = to_db_time(Utc::now() - ChronoDuration::seconds(threshold_secs));
        let rows = sqlx::query(
            "SELECT id FROM jobs WHERE status = 'running' AND worker_heartbeat < ?1",
        )
        .bind(&cutoff)
        .fetch_all(self.store.writer())
        .await?;

        let mut recovered = 0u64;
        for row in rows {
            let id: String = row.try_get("id")?;
            let updated = sqlx::query(
                "UPDATE jobs
                 SET status = 'queued', started_at = NULL, worker_pid = NULL,
                     worker_heartbeat = NULL, progress_percent = 0, progress_json = NULL
                 WHERE id = ?1 AND status = 'running' AND worker_heartbeat < ?2",
            )
            .bind(&id)
            .bind(&cutoff)
            .execute(self.store.writer())
            .await?;
            if updated.rows_affected() > 0 {
                info!(job = %id, "recovered stale job from dead worker");
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    /// Cancel a queued job. Running jobs are not cancellable through the
    /// queue; their worker owns them.
    pub async fn cancel(&self, job_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE jobs SET status = 'cancelled', completed_at = ?1
             WHERE id = ?2 AND status = 'queued'",
        )
        .bind(to_db_time(Utc::now()))
        .bind(job_id.to_string())
        .execute(self.store.writer())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Manual retry: failed or cancelled back to queued, worker and
    /// timing fields cleared.
    pub async fn requeue(&self, job_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE jobs
             SET status = 'queued', started_at = NULL, completed_at = NULL,
                 error_message = NULL, worker_pid = NULL, worker_heartbeat = NULL,
                 progress_percent = 0, progress_json = NULL
             WHERE id = ?1 AND status IN ('failed', 'cancelled')",
        )
        .bind(job_id.to_string())
        .execute(self.store.writer())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get(&self, job_id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?1")
            .bind(job_id.to_string())
            .fetch_optional(self.store.reader())
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let mut sql = String::from("SELECT * FROM jobs WHERE 1=1");
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if filter.kind.is_some() {
            sql.push_str(" AND kind = ?");
        }
        if filter.since.is_some() {
            sql.push_str(" AND created_at >= ?");
        }
        if filter.search.is_some() {
            sql.push_str(" AND path LIKE ?");
        }
        // Sort column is whitelisted, never interpolated from user input.
        let sort_column = match filter.sort_by.as_deref() {
            Some("priority") => "priority",
            Some("status") => "status",
            Some("completed_at") => "completed_at",
            Some("started_at") => "started_at",
            _ => "created_at",
        };
        sql.push_str(&format!(
            " ORDER BY {sort_column} {}",
            if filter.sort_descending { "DESC" } else { "ASC" }
        ));
        sql.push_str(" LIMIT ? OFFSET ?");

        let mut query = sqlx::query(&sql);
        if let Some(status) = filter.status {
            query = query.bind(status.as_str());
        }
        if let Some(kind) = filter.kind {
            query = query.bind(kind.as_str());
        }
        if let Some(since) = filter.since {
            query = query.bind(to_db_time(since));
        }
        if let Some(search) = &filter.search {
            query = query.bind(format!("%{search}%"));
        }
        query = query
            .bind(filter.limit.unwrap_or(100) as i64)
            .bind(filter.offset.unwrap_or(0) as i64);

        let rows = query.fetch_all(self.store.reader()).await?;
        rows.iter().map(job_from_row).collect()
    }

    pub async fn queue_stats(&self) -> Result<QueueStats> {
        let rows = sqlx::query("SELECT status, COUNT(*) as n FROM jobs GROUP BY status")
            .fetch_all(self.store.reader())
            .await?;
        let mut stats = QueueStats::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("n")?;
            let count = count as u64;
            match status.as_str() {
                "queued" => stats.queued = count,
                "running" => stats.running = count,
                "completed" => stats.completed = count,
                "failed" => stats.failed = count,
                "cancelled" => stats.cancelled = count,
                _ => {}
            }
            stats.total += count;
        }
        Ok(stats)
    }
}

fn is_lock_contention(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            let message = db.message().to_ascii_lowercase();
            message.contains("locked") || message.contains("busy")
        }
        _ => false,
    }
}

fn job_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Job> {
    let id: String = row.try_get("id")?;
    let kind_raw: String = row.try_get("kind")?;
    let status_raw: String = row.try_get("status")?;
    let progress_json: Option<String> = row.try_get("progress_json")?;
    let parse_ts = |raw: Option<String>| -> Result<Option<chrono::DateTime<Utc>>> {
        raw.as_deref().map(from_db_time).transpose()
    };

    Ok(Job {
        id: parse_uuid(&id)?,
        kind: JobKind::parse(&kind_raw)
            .ok_or_else(|| CoreError::DataIntegrity(format!("unknown job kind {kind_raw:?}")))?,
        path: std::path::PathBuf::from(row.try_get::<String, _>("path")?),
        policy: row.try_get("policy")?,
        priority: row.try_get("priority")?,
        status: JobStatus::parse(&status_raw).ok_or_else(|| {
            CoreError::DataIntegrity(format!("unknown job status {status_raw:?}"))
        })?,
        created_at: from_db_time(&row.try_get::<String, _>("created_at")?)?,
        started_at: parse_ts(row.try_get("started_at")?)?,
        completed_at: parse_ts(row.try_get("completed_at")?)?,
        worker_pid: row.try_get("worker_pid")?,
        worker_heartbeat: parse_ts(row.try_get("worker_heartbeat")?)?,
        progress_percent: row.try_get("progress_percent")?,
        progress_detail: progress_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?,
        error_message: row.try_get("error_message")?,
        output_path: row
            .try_get::<Option<String>, _>("output_path")?
            .map(std::path::PathBuf::from),
        backup_path: row
            .try_get::<Option<String>, _>("backup_path")?
            .map(std::path::PathBuf::from),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn queue() -> JobQueue {
        JobQueue::new(Store::open_in_memory().await.unwrap())
    }

    fn job(kind: JobKind, path: &str, priority: i64) -> Job {
        Job::new(kind, path.into(), Some("default".into()), priority)
    }

    #[tokio::test]
    async fn empty_queue_claims_nothing() {
        let q = queue().await;
        assert!(q.claim_next_job(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn claim_respects_priority_then_fifo() {
        let q = queue().await;
        let low = job(JobKind::Apply, "/a.mkv", 200);
        let high = job(JobKind::Apply, "/b.mkv", 10);
        q.enqueue(&low).await.unwrap();
        q.enqueue(&high).await.unwrap();

        let first = q.claim_next_job(42).await.unwrap().unwrap();
        assert_eq!(first.id, high.id);
        assert_eq!(first.status, JobStatus::Running);
        assert_eq!(first.worker_pid, Some(42));
        assert!(first.started_at.is_some());
        assert!(first.worker_heartbeat.is_some());

        let second = q.claim_next_job(42).await.unwrap().unwrap();
        assert_eq!(second.id, low.id);
    }

    #[tokio::test]
    async fn claimed_job_cannot_be_claimed_again() {
        let q = queue().await;
        let j = job(JobKind::Apply, "/a.mkv", 100);
        q.enqueue(&j).await.unwrap();
        assert!(q.claim_next_job(1).await.unwrap().is_some());
        assert!(q.claim_next_job(2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mutating_jobs_are_exclusive_per_path() {
        let q = queue().await;
        let first = job(JobKind::Apply, "/same.mkv", 10);
        let second = job(JobKind::Apply, "/same.mkv", 20);
        let other = job(JobKind::Apply, "/other.mkv", 30);
        q.enqueue(&first).await.unwrap();
        q.enqueue(&second).await.unwrap();
        q.enqueue(&other).await.unwrap();

        let claimed = q.claim_next_job(1).await.unwrap().unwrap();
        assert_eq!(claimed.id, first.id);

        // Second apply on the same path is passed over; the other file's
        // job is claimable.
        let next = q.claim_next_job(2).await.unwrap().unwrap();
        assert_eq!(next.id, other.id);
        assert!(q.claim_next_job(3).await.unwrap().is_none());

        // Releasing the first frees the path.
        q.release(first.id, JobStatus::Completed, None, None, None)
            .await
            .unwrap();
        let now_claimable = q.claim_next_job(3).await.unwrap().unwrap();
        assert_eq!(now_claimable.id, second.id);
    }

    #[tokio::test]
    async fn scans_are_not_exclusive() {
        let q = queue().await;
        let scan_a = job(JobKind::Scan, "/library", 10);
        let scan_b = job(JobKind::Scan, "/library", 20);
        q.enqueue(&scan_a).await.unwrap();
        q.enqueue(&scan_b).await.unwrap();
        assert!(q.claim_next_job(1).await.unwrap().is_some());
        assert!(q.claim_next_job(2).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn heartbeat_only_while_running() {
        let q = queue().await;
        let j = job(JobKind::Apply, "/a.mkv", 100);
        q.enqueue(&j).await.unwrap();
        assert!(!q.update_heartbeat(j.id, 1).await.unwrap());

        q.claim_next_job(1).await.unwrap().unwrap();
        assert!(q.update_heartbeat(j.id, 1).await.unwrap());

        q.release(j.id, JobStatus::Completed, None, None, None)
            .await
            .unwrap();
        assert!(!q.update_heartbeat(j.id, 1).await.unwrap());
    }

    #[tokio::test]
    async fn release_clears_worker_fields() {
        let q = queue().await;
        let j = job(JobKind::Apply, "/a.mkv", 100);
        q.enqueue(&j).await.unwrap();
        q.claim_next_job(9).await.unwrap().unwrap();
        q.release(
            j.id,
            JobStatus::Failed,
            Some("boom"),
            Some(Path::new("/a.mkv")),
            Some(Path::new("/a.vpo_backup.mkv")),
        )
        .await
        .unwrap();

        let row = q.get(j.id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Failed);
        assert_eq!(row.error_message.as_deref(), Some("boom"));
        assert!(row.worker_pid.is_none());
        assert!(row.worker_heartbeat.is_none());
        assert!(row.completed_at.is_some());
    }

    #[tokio::test]
    async fn release_requires_terminal_status() {
        let q = queue().await;
        let j = job(JobKind::Apply, "/a.mkv", 100);
        q.enqueue(&j).await.unwrap();
        assert!(q
            .release(j.id, JobStatus::Running, None, None, None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn stale_worker_recovery_scenario() {
        // Claim from pid 9999, age the heartbeat 600 s, recover with a
        // 300 s threshold, then reclaim from pid 1234.
        let q = queue().await;
        let j = job(JobKind::Apply, "/a.mkv", 100);
        q.enqueue(&j).await.unwrap();
        q.claim_next_job(9999).await.unwrap().unwrap();

        let stale = to_db_time(Utc::now() - ChronoDuration::seconds(600));
        sqlx::query("UPDATE jobs SET worker_heartbeat = ?1 WHERE id = ?2")
            .bind(&stale)
            .bind(j.id.to_string())
            .execute(q.store.writer())
            .await
            .unwrap();

        let recovered = q.recover_stale_jobs(300).await.unwrap();
        assert_eq!(recovered, 1);

        let row = q.get(j.id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Queued);
        assert!(row.worker_pid.is_none());
        assert!(row.worker_heartbeat.is_none());
        assert!(row.started_at.is_none());
        assert_eq!(row.progress_percent, 0.0);

        let reclaimed = q.claim_next_job(1234).await.unwrap().unwrap();
        assert_eq!(reclaimed.worker_pid, Some(1234));
    }

    #[tokio::test]
    async fn heartbeat_at_threshold_is_not_stale() {
        let q = queue().await;
        let j = job(JobKind::Apply, "/a.mkv", 100);
        q.enqueue(&j).await.unwrap();
        q.claim_next_job(1).await.unwrap().unwrap();

        // recover_stale_jobs(very large threshold) must not touch a
        // fresh heartbeat; the comparison is strict.
        let recovered = q.recover_stale_jobs(3600).await.unwrap();
        assert_eq!(recovered, 0);
        let row = q.get(j.id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Running);
    }

    #[tokio::test]
    async fn cancel_only_queued() {
        let q = queue().await;
        let j = job(JobKind::Apply, "/a.mkv", 100);
        q.enqueue(&j).await.unwrap();
        assert!(q.cancel(j.id).await.unwrap());
        assert_eq!(
            q.get(j.id).await.unwrap().unwrap().status,
            JobStatus::Cancelled
        );

        let running = job(JobKind::Apply, "/b.mkv", 100);
        q.enqueue(&running).await.unwrap();
        q.claim_next_job(1).await.unwrap().unwrap();
        assert!(!q.cancel(running.id).await.unwrap());
    }

    #[tokio::test]
    async fn requeue_failed_and_cancelled_only() {
        let q = queue().await;
        let j = job(JobKind::Apply, "/a.mkv", 100);
        q.enqueue(&j).await.unwrap();
        q.claim_next_job(1).await.unwrap().unwrap();
        q.release(j.id, JobStatus::Failed, Some("x"), None, None)
            .await
            .unwrap();

        assert!(q.requeue(j.id).await.unwrap());
        let row = q.get(j.id).await.unwrap().unwrap();
        assert_eq!(row.status, JobStatus::Queued);
        assert!(row.error_message.is_none());
        assert!(row.completed_at.is_none());

        // Completed rows stay completed.
        q.claim_next_job(1).await.unwrap().unwrap();
        q.release(j.id, JobStatus::Completed, None, None, None)
            .await
            .unwrap();
        assert!(!q.requeue(j.id).await.unwrap());
    }

    #[tokio::test]
    async fn list_filters_and_stats() {
        let q = queue().await;
        for (i, kind) in [JobKind::Apply, JobKind::Scan, JobKind::Apply].iter().enumerate() {
            q.enqueue(&job(*kind, &format!("/f{i}.mkv"), 100)).await.unwrap();
        }
        q.claim_next_job(1).await.unwrap().unwrap();

        let running = q
            .list(&JobFilter {
                status: Some(JobStatus::Running),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(running.len(), 1);

        let applies = q
            .list(&JobFilter {
                kind: Some(JobKind::Apply),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(applies.len(), 2);

        let searched = q
            .list(&JobFilter {
                search: Some("f2".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(searched.len(), 1);

        let stats = q.queue_stats().await.unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.running, 1);
        assert_eq!(stats.queued, 2);
    }

    #[tokio::test]
    async fn concurrent_claims_yield_distinct_jobs() {
        let q = queue().await;
        for i in 0..4 {
            q.enqueue(&job(JobKind::Apply, &format!("/f{i}.mkv"), 100))
                .await
                .unwrap();
        }
        let (a, b) = tokio::join!(q.claim_next_job(1), q.claim_next_job(2));
        let a = a.unwrap().unwrap();
        let b = b.unwrap().unwrap();
        assert_ne!(a.id, b.id);
    }
}
