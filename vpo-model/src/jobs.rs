//! Persistent job, plan-record, and processing-stats models.
//!
//! These mirror the library store's tables row-for-row. Timestamps are
//! `DateTime<Utc>` in memory and ISO-8601 UTC text at the storage boundary.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Scan,
    Apply,
    Transcode,
    Move,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scan => "scan",
            Self::Apply => "apply",
            Self::Transcode => "transcode",
            Self::Move => "move",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "scan" => Some(Self::Scan),
            "apply" => Some(Self::Apply),
            "transcode" => Some(Self::Transcode),
            "move" => Some(Self::Move),
            _ => None,
        }
    }

    /// Mutating kinds hold an exclusive claim on their target file.
    pub fn is_mutating(&self) -> bool {
        !matches!(self, Self::Scan)
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One persistent unit of work.
///
/// Invariant: at most one worker holds a job in `Running` at any instant;
/// the queue's claim protocol is the sole enforcement point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub kind: JobKind,
    pub path: PathBuf,
    pub policy: Option<String>,
    /// Lower runs sooner.
    pub priority: i64,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub worker_pid: Option<i64>,
    pub worker_heartbeat: Option<DateTime<Utc>>,
    pub progress_percent: f64,
    pub progress_detail: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub output_path: Option<PathBuf>,
    pub backup_path: Option<PathBuf>,
}

impl Job {
    pub fn new(kind: JobKind, path: PathBuf, policy: Option<String>, priority: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            path,
            policy,
            priority,
            status: JobStatus::Queued,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            worker_pid: None,
            worker_heartbeat: None,
            progress_percent: 0.0,
            progress_detail: None,
            error_message: None,
            output_path: None,
            backup_path: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanRecordStatus {
    Pending,
    Approved,
    Rejected,
    Executed,
    Failed,
}

impl PlanRecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Executed => "executed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "executed" => Some(Self::Executed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Permitted transitions: pending -> {approved, rejected},
    /// approved -> {executed, failed}. Terminal states are immutable.
    pub fn can_transition_to(&self, next: PlanRecordStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Approved)
                | (Self::Pending, Self::Rejected)
                | (Self::Approved, Self::Executed)
                | (Self::Approved, Self::Failed)
        )
    }
}

/// Persisted form of a plan, linked to the job that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanRecord {
    pub id: Uuid,
    pub job_id: Uuid,
    pub file_path: PathBuf,
    pub status: PlanRecordStatus,
    /// Serialized `Plan`.
    pub plan_json: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EncoderType {
    Hardware,
    Software,
    Unknown,
}

impl EncoderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hardware => "hardware",
            Self::Software => "software",
            Self::Unknown => "unknown",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw {
            "hardware" => Self::Hardware,
            "software" => Self::Software,
            _ => Self::Unknown,
        }
    }
}

/// One row per executed transcode. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingStats {
    pub id: Uuid,
    pub job_id: Option<Uuid>,
    pub file_path: PathBuf,
    pub input_bytes: u64,
    pub output_bytes: u64,
    pub wall_seconds: f64,
    pub encoder: String,
    pub encoder_type: EncoderType,
    pub fallback_occurred: bool,
    pub mean_fps: Option<f64>,
    pub peak_fps: Option<f64>,
    pub mean_bitrate_kbps: Option<f64>,
    pub total_frames: Option<u64>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_record_transitions() {
        use PlanRecordStatus::*;
        assert!(Pending.can_transition_to(Approved));
        assert!(Pending.can_transition_to(Rejected));
        assert!(Approved.can_transition_to(Executed));
        assert!(Approved.can_transition_to(Failed));

        assert!(!Pending.can_transition_to(Executed));
        assert!(!Rejected.can_transition_to(Approved));
        assert!(!Executed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Pending));
    }

    #[test]
    fn status_string_round_trip() {
        for status in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(JobStatus::parse("paused"), None);
    }

    #[test]
    fn new_job_starts_queued() {
        let job = Job::new(JobKind::Apply, "/m/a.mkv".into(), Some("default".into()), 10);
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.worker_pid.is_none());
        assert!(job.kind.is_mutating());
        assert!(!JobKind::Scan.is_mutating());
    }
}
