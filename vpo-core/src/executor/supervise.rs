//! Timeout-bounded subprocess supervision with stderr progress capture.
//!
//! The supervised process runs with stdout discarded and stderr piped. A
//! dedicated reader task drains stderr into a line channel; the main loop
//! waits on process exit, new lines, and the deadline. Deadline expiry
//! kills the process, joins the reader within a short bound, and returns
//! a typed timeout error. The last stderr lines are retained for error
//! reporting and hardware-failure detection.

use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::error::{CoreError, Result};

use super::progress::{parse_progress_line, FfmpegProgress, MetricsAggregator};

/// Lines of stderr kept for diagnostics.
const STDERR_TAIL_LINES: usize = 60;
/// Bound on waiting for the reader after kill; an abandoned reader beats
/// a blocked shutdown.
const READER_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Caller-supplied progress observer.
pub type ProgressCallback = Arc<dyn Fn(&FfmpegProgress) + Send + Sync>;

/// Per-operation timeout rates, in seconds per mebibyte of input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// Metadata edit or stream copy.
    Remux,
    /// Anything that re-encodes samples.
    Transcode,
}

impl OpKind {
    fn seconds_per_mib(&self) -> f64 {
        match self {
            Self::Remux => 0.1,
            Self::Transcode => 0.5,
        }
    }
}

/// `base + size x rate`; a zero base disables the deadline.
pub fn compute_deadline(base_timeout_secs: u64, file_size_bytes: u64, kind: OpKind) -> Option<Duration> {
    if base_timeout_secs == 0 {
        return None;
    }
    let mib = file_size_bytes as f64 / (1024.0 * 1024.0);
    let total = base_timeout_secs as f64 + mib * kind.seconds_per_mib();
    Some(Duration::from_secs_f64(total))
}

/// Everything the caller learns from a finished supervised run.
#[derive(Debug)]
pub struct SupervisedOutput {
    pub stderr_tail: String,
    pub metrics: MetricsAggregator,
}

pub struct SuperviseOptions {
    pub tool: String,
    pub deadline: Option<Duration>,
    pub total_duration: Option<f64>,
    pub progress: Option<ProgressCallback>,
}

impl std::fmt::Debug for SuperviseOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SuperviseOptions")
            .field("tool", &self.tool)
            .field("deadline", &self.deadline)
            .field("total_duration", &self.total_duration)
            .field("has_progress", &self.progress.is_some())
            .finish()
    }
}

/// Run a command to completion under supervision.
pub async fn run_supervised(
    mut command: Command,
    opts: SuperviseOptions,
) -> Result<SupervisedOutput> {
    command.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::piped());
    let mut child = command.spawn().map_err(|e| CoreError::Subprocess {
        tool: opts.tool.clone(),
        code: None,
        detail: format!("failed to spawn: {e}"),
    })?;

    let stderr = child.stderr.take().ok_or_else(|| CoreError::Subprocess {
        tool: opts.tool.clone(),
        code: None,
        detail: "stderr pipe missing".into(),
    })?;

    let (line_tx, mut line_rx) = mpsc::channel::<String>(256);
    let reader = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line_tx.send(line).await.is_err() {
                break;
            }
        }
    });

    let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut metrics = MetricsAggregator::default();
    let deadline = opts.deadline.map(|d| tokio::time::Instant::now() + d);

    let mut handle_line = |line: String, metrics: &mut MetricsAggregator| {
        if let Some(sample) = parse_progress_line(&line, opts.total_duration) {
            metrics.record(&sample);
            if let Some(callback) = &opts.progress {
                // A panicking observer must not take the run down with it.
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    callback(&sample)
                }));
                if result.is_err() {
                    warn!(tool = %opts.tool, "progress callback panicked; ignoring");
                }
            }
        } else {
            debug!(tool = %opts.tool, "{line}");
        }
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    };

    let mut lines_open = true;
    let status = loop {
        let deadline_sleep = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            status = child.wait() => {
                break status.map_err(|e| CoreError::Subprocess {
                    tool: opts.tool.clone(),
                    code: None,
                    detail: format!("wait failed: {e}"),
                })?;
            }
            line = line_rx.recv(), if lines_open => {
                match line {
                    Some(line) => handle_line(line, &mut metrics),
                    // Closed channel just means stderr hit EOF; keep
                    // waiting for the exit status.
                    None => lines_open = false,
                }
            }
            _ = deadline_sleep => {
                error!(tool = %opts.tool, "deadline exceeded, killing process");
                let _ = child.start_kill();
                let _ = child.wait().await;
                drop(line_rx);
                if tokio::time::timeout(READER_JOIN_TIMEOUT, reader).await.is_err() {
                    warn!(tool = %opts.tool, "stderr reader did not stop in time, abandoning");
                }
                return Err(CoreError::Timeout {
                    tool: opts.tool.clone(),
                    seconds: opts.deadline.map(|d| d.as_secs()).unwrap_or(0),
                });
            }
        }
    };

    // Drain whatever the reader still has buffered.
    if tokio::time::timeout(READER_JOIN_TIMEOUT, reader).await.is_err() {
        warn!(tool = %opts.tool, "stderr reader still running after exit, abandoning");
    }
    while let Ok(line) = line_rx.try_recv() {
        handle_line(line, &mut metrics);
    }

    let stderr_tail = tail.into_iter().collect::<Vec<_>>().join("\n");

    if !status.success() {
        return Err(CoreError::Subprocess {
            tool: opts.tool,
            code: status.code(),
            detail: stderr_tail
                .lines()
                .rev()
                .take(10)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect::<Vec<_>>()
                .join("\n"),
        });
    }

    Ok(SupervisedOutput { stderr_tail, metrics })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn deadline_computation() {
        // 1 GiB transcode at 0.5 s/MiB on a 1800 s base.
        let deadline = compute_deadline(1800, 1024 * 1024 * 1024, OpKind::Transcode).unwrap();
        assert_eq!(deadline.as_secs(), 1800 + 512);

        let remux = compute_deadline(300, 1024 * 1024 * 1024, OpKind::Remux).unwrap();
        assert_eq!(remux.as_secs(), 300 + 102);

        assert!(compute_deadline(0, u64::MAX, OpKind::Transcode).is_none());
    }

    #[tokio::test]
    async fn successful_run_collects_stderr() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo 'line one' >&2; echo 'line two' >&2");
        let output = run_supervised(
            cmd,
            SuperviseOptions {
                tool: "sh".into(),
                deadline: Some(Duration::from_secs(10)),
                total_duration: None,
                progress: None,
            },
        )
        .await
        .unwrap();
        assert!(output.stderr_tail.contains("line one"));
        assert!(output.stderr_tail.contains("line two"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_subprocess_error() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo 'boom' >&2; exit 3");
        let err = run_supervised(
            cmd,
            SuperviseOptions {
                tool: "sh".into(),
                deadline: None,
                total_duration: None,
                progress: None,
            },
        )
        .await
        .unwrap_err();
        match err {
            CoreError::Subprocess { tool, code, detail } => {
                assert_eq!(tool, "sh");
                assert_eq!(code, Some(3));
                assert!(detail.contains("boom"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn deadline_kills_process() {
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let started = std::time::Instant::now();
        let err = run_supervised(
            cmd,
            SuperviseOptions {
                tool: "sleep".into(),
                deadline: Some(Duration::from_millis(200)),
                total_duration: None,
                progress: None,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CoreError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn progress_callback_sees_samples_and_panics_are_contained() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let callback: ProgressCallback = Arc::new(move |sample: &FfmpegProgress| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            assert!(sample.frame.is_some());
            panic!("observer bug");
        });

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(
            "echo 'frame=  100 fps= 25 time=00:00:04.00 bitrate=1000.0kbits/s speed=1.0x' >&2",
        );
        let output = run_supervised(
            cmd,
            SuperviseOptions {
                tool: "sh".into(),
                deadline: Some(Duration::from_secs(10)),
                total_duration: Some(8.0),
                progress: Some(callback),
            },
        )
        .await
        .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(output.metrics.total_frames(), Some(100));
        assert_eq!(output.metrics.peak_fps(), Some(25.0));
    }
}
