//! The worker pool driving the persistent queue.
//!
//! Each worker polls for a claim with a bounded backoff, runs the job,
//! heartbeats while it holds it, and releases it with the right terminal
//! status. Shutdown is cooperative: workers stop claiming and finish the
//! job in flight.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use vpo_core::executor::supervise::ProgressCallback;
use vpo_core::{apply_policy, ApplyOptions, ExecutorOptions, ScanOptions, Scanner};
use vpo_model::{Job, JobKind, JobStatus, Policy};

use crate::state::AppState;

const IDLE_POLL: Duration = Duration::from_secs(2);
const IDLE_POLL_MAX: Duration = Duration::from_secs(15);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.handles.len())
            .finish()
    }
}

impl WorkerPool {
    pub fn spawn(state: AppState, count: usize) -> Self {
        let handles = (0..count)
            .map(|id| {
                let state = state.clone();
                tokio::spawn(async move { worker_loop(id, state).await })
            })
            .collect();
        info!(count, "worker pool started");
        Self { handles }
    }

    /// Wait for every worker to drain and exit.
    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
        info!("worker pool drained");
    }
}

async fn worker_loop(id: usize, state: AppState) {
    let pid = std::process::id() as i64;
    let mut backoff = IDLE_POLL;
    info!(worker = id, "worker started");

    loop {
        if state.is_shutting_down() {
            info!(worker = id, "worker exiting on shutdown");
            break;
        }
        match state.queue.claim_next_job(pid).await {
            Ok(Some(job)) => {
                backoff = IDLE_POLL;
                run_claimed_job(&state, pid, job).await;
            }
            Ok(None) => {
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(IDLE_POLL_MAX);
            }
            Err(err) => {
                error!(worker = id, "claim failed: {err}");
                tokio::time::sleep(IDLE_POLL_MAX).await;
            }
        }
    }
}

async fn run_claimed_job(state: &AppState, pid: i64, job: Job) {
    info!(job = %job.id, kind = %job.kind, path = %job.path.display(), "job started");

    let heartbeat = {
        let queue = state.queue.clone();
        let job_id = job.id;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match queue.update_heartbeat(job_id, pid).await {
                    Ok(true) => {}
                    // Ownership lost (recovery or release); stop beating.
                    Ok(false) => break,
                    Err(err) => warn!(job = %job_id, "heartbeat failed: {err}"),
                }
            }
        })
    };

    let result = run_job(state, &job).await;
    heartbeat.abort();

    let release = match &result {
        Ok(outcome) => {
            info!(job = %job.id, "job completed");
            state
                .queue
                .release(
                    job.id,
                    JobStatus::Completed,
                    None,
                    outcome.output_path.as_deref(),
                    outcome.backup_path.as_deref(),
                )
                .await
        }
        Err(err) => {
            error!(job = %job.id, "job failed: {err}");
            state
                .queue
                .release(job.id, JobStatus::Failed, Some(&err.to_string()), None, None)
                .await
        }
    };
    if let Err(err) = release {
        error!(job = %job.id, "release failed: {err}");
    }
}

#[derive(Debug, Default)]
struct JobOutcome {
    output_path: Option<PathBuf>,
    backup_path: Option<PathBuf>,
}

async fn run_job(state: &AppState, job: &Job) -> vpo_core::Result<JobOutcome> {
    let mut log = JobLog::open(state, job);

    let outcome = match job.kind {
        JobKind::Scan => {
            let scanner = Scanner::new(&state.store, &state.registry);
            let report = scanner
                .scan(&[job.path.clone()], ScanOptions::default())
                .await?;
            log.line(&format!(
                "scan: {} discovered, {} updated, {} unchanged, {} errors",
                report.discovered, report.updated, report.unchanged, report.errors
            ));
            JobOutcome::default()
        }
        JobKind::Apply | JobKind::Transcode => {
            let policy = load_policy(state, job)?;
            let opts = ApplyOptions {
                dry_run: false,
                executor: executor_options_for(&policy, state),
            };
            let opts = with_progress(opts, state, job);
            let report = apply_policy(
                &state.registry,
                &state.store,
                &policy,
                &job.path,
                &opts,
            )
            .await?;
            for warning in &report.plan.warnings {
                log.line(&format!("warning: {warning}"));
            }
            log.line(&format!("plan: {} action(s)", report.plan.actions.len()));
            match report.outcome {
                Some(outcome) => {
                    log.line(&outcome.message);
                    if let Some(stats) = &outcome.stats {
                        state.store.insert_processing_stats(stats).await?;
                    }
                    JobOutcome {
                        output_path: Some(outcome.output_path),
                        backup_path: outcome.backup_path,
                    }
                }
                None => JobOutcome::default(),
            }
        }
        JobKind::Move => {
            let dest = job.output_path.clone().ok_or_else(|| {
                vpo_core::CoreError::Config("move job has no destination".into())
            })?;
            move_file(&job.path, &dest)?;
            state.store.delete_file_by_path(&job.path).await?;
            log.line(&format!("moved to {}", dest.display()));
            JobOutcome {
                output_path: Some(dest),
                backup_path: None,
            }
        }
    };

    Ok(outcome)
}

fn load_policy(state: &AppState, job: &Job) -> vpo_core::Result<Policy> {
    let name = job.policy.as_deref().ok_or_else(|| {
        vpo_core::CoreError::Config(format!("{} job has no policy", job.kind))
    })?;
    let path = state.data_dir.policy_path(name).ok_or_else(|| {
        vpo_core::CoreError::Config(format!("policy {name:?} not found in policies/"))
    })?;
    let text = std::fs::read_to_string(path)?;
    Ok(Policy::load(&text)?)
}

/// Resolve executor knobs from the policy's transcode configuration.
pub fn executor_options_for(policy: &Policy, state: &AppState) -> ExecutorOptions {
    let mut opts = ExecutorOptions {
        temp_dir: state.config.temp_dir.clone(),
        base_timeout_secs: state.config.base_timeout_secs,
        ..ExecutorOptions::default()
    };
    for phase in &policy.phases {
        if let Some(container) = &phase.container {
            opts.on_incompatible_codec = container.on_incompatible_codec;
        }
        if let Some(video) = phase.transcode.as_ref().and_then(|t| t.video.as_ref()) {
            opts.hardware = video.hardware;
            opts.fallback_to_software = video.fallback_to_software;
            opts.output_ratio_override = video.output_ratio;
            opts.video = vpo_core::executor::command::VideoEncodeSettings {
                crf: video.crf,
                bitrate: video.bitrate.clone(),
                preset: video.preset.clone(),
            };
        }
    }
    opts
}

/// Wire executor progress into the job row.
fn with_progress(mut opts: ApplyOptions, state: &AppState, job: &Job) -> ApplyOptions {
    let (tx, mut rx) = tokio::sync::mpsc::channel::<f64>(16);
    let queue = state.queue.clone();
    let job_id = job.id;
    tokio::spawn(async move {
        let mut last = -1.0f64;
        while let Some(fraction) = rx.recv().await {
            let percent = (fraction * 100.0).clamp(0.0, 100.0);
            if (percent - last).abs() >= 1.0 {
                last = percent;
                let _ = queue.update_progress(job_id, percent, None).await;
            }
        }
    });
    let callback: ProgressCallback = Arc::new(move |sample| {
        if let Some(fraction) = sample.fraction {
            let _ = tx.try_send(fraction);
        }
    });
    opts.executor.progress = Some(callback);
    opts
}

fn move_file(from: &std::path::Path, to: &std::path::Path) -> vpo_core::Result<()> {
    if let Some(parent) = to.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(_) => {
            std::fs::copy(from, to)?;
            std::fs::remove_file(from)?;
            Ok(())
        }
    }
}

/// Append-only per-job log file under `logs/<job-id>.log`.
struct JobLog {
    file: Option<std::fs::File>,
}

impl JobLog {
    fn open(state: &AppState, job: &Job) -> Self {
        let path = state.data_dir.job_log_path(job.id);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| {
                warn!(path = %path.display(), "cannot open job log: {err}");
                err
            })
            .ok();
        Self { file }
    }

    fn line(&mut self, message: &str) {
        if let Some(file) = &mut self.file {
            let stamp = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
            let _ = writeln!(file, "{stamp} {message}");
        }
    }
}
