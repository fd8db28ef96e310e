//! The plan executor.
//!
//! Realizes a [`Plan`] on disk with crash safety: backup first, write to
//! a `.vpo_temp_` sibling, validate, atomic-rename into place, restore
//! the backup on any failure in between. Three strategies cover the
//! action space: an in-place Matroska property edit, an ffmpeg stream
//! copy for metadata on other containers, and a full remux/transcode
//! pass.

pub mod backup;
pub mod command;
pub mod encoders;
pub mod preflight;
pub mod progress;
pub mod supervise;

use std::path::{Path, PathBuf};
use std::time::Instant;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;
use vpo_model::policy::{HardwareMode, IncompatibleCodecBehavior};
use vpo_model::{
    EncoderType, FileInfo, MtimeTarget, Plan, PlannedAction, ProcessingStats,
};

use crate::error::{CoreError, Result};
use crate::tools::{Tool, ToolRegistry};

use backup::{create_backup, discard_backup, safe_restore_from_backup};
use command::VideoEncodeSettings;
use encoders::{detect_hw_encoder_error, select_encoder, software_encoder, EncoderSelection};
use supervise::{compute_deadline, run_supervised, OpKind, ProgressCallback, SuperviseOptions};

/// The three executor back-ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// mkvpropedit in-place edit; Matroska metadata only.
    MkvPropedit,
    /// ffmpeg `-map 0 -c copy` rewrite; metadata on non-Matroska.
    StreamCopy,
    /// Full remux/transcode pass.
    RemuxTranscode,
}

/// Pick the cheapest strategy that can realize the plan.
pub fn select_strategy(plan: &Plan, file: &FileInfo) -> Strategy {
    if plan.has_rewrite_actions() {
        Strategy::RemuxTranscode
    } else if file.is_matroska() {
        Strategy::MkvPropedit
    } else {
        Strategy::StreamCopy
    }
}

/// Run-time knobs the orchestrator resolves from policy and config.
pub struct ExecutorOptions {
    pub keep_backup: bool,
    pub temp_dir: Option<PathBuf>,
    /// Zero disables the deadline.
    pub base_timeout_secs: u64,
    pub hardware: HardwareMode,
    pub fallback_to_software: bool,
    pub video: VideoEncodeSettings,
    pub output_ratio_override: Option<f64>,
    pub on_incompatible_codec: IncompatibleCodecBehavior,
    pub progress: Option<ProgressCallback>,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            keep_backup: false,
            temp_dir: None,
            base_timeout_secs: 1800,
            hardware: HardwareMode::Auto,
            fallback_to_software: true,
            video: VideoEncodeSettings::default(),
            output_ratio_override: None,
            on_incompatible_codec: IncompatibleCodecBehavior::Error,
            progress: None,
        }
    }
}

impl std::fmt::Debug for ExecutorOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorOptions")
            .field("keep_backup", &self.keep_backup)
            .field("temp_dir", &self.temp_dir)
            .field("base_timeout_secs", &self.base_timeout_secs)
            .field("hardware", &self.hardware)
            .field("has_progress", &self.progress.is_some())
            .finish()
    }
}

/// What the executor hands back on success.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub output_path: PathBuf,
    pub backup_path: Option<PathBuf>,
    pub message: String,
    pub stats: Option<ProcessingStats>,
    /// True when the run was skipped (empty plan, or `skip` behavior on
    /// an incompatible conversion).
    pub skipped: bool,
}

#[derive(Debug)]
pub struct Executor<'a> {
    registry: &'a ToolRegistry,
}

impl<'a> Executor<'a> {
    pub fn new(registry: &'a ToolRegistry) -> Self {
        Self { registry }
    }

    /// Execute a plan against its file. `file` must be the probe the plan
    /// was evaluated from.
    pub async fn execute(
        &self,
        plan: &Plan,
        file: &FileInfo,
        opts: &ExecutorOptions,
    ) -> Result<ExecutionOutcome> {
        if plan.is_empty() {
            return Ok(ExecutionOutcome {
                output_path: plan.path.clone(),
                backup_path: None,
                message: "no changes to apply".into(),
                stats: None,
                skipped: true,
            });
        }

        let strategy = select_strategy(plan, file);
        info!(path = %plan.path.display(), ?strategy, actions = plan.actions.len(), "executing plan");

        // Preflight: nothing below may touch the file until all of these
        // pass.
        preflight::check_tools(self.registry, strategy)?;
        preflight::check_capabilities(self.registry, plan)?;
        if !preflight::check_container_compatibility(plan, file, opts.on_incompatible_codec)? {
            return Ok(ExecutionOutcome {
                output_path: plan.path.clone(),
                backup_path: None,
                message: "skipped: container conversion would drop incompatible streams".into(),
                stats: None,
                skipped: true,
            });
        }
        let final_dest = self.final_destination(plan);
        let work_dir = opts
            .temp_dir
            .clone()
            .unwrap_or_else(|| parent_dir(&final_dest));
        preflight::check_disk_space(plan, file, strategy, &work_dir, opts.output_ratio_override)?;

        let pre_run_mtime = std::fs::metadata(&plan.path)
            .and_then(|m| m.modified())
            .ok();

        // In-place edits need a real copy; rename-replace strategies can
        // share the inode.
        let backup = create_backup(&plan.path, strategy != Strategy::MkvPropedit)?;

        let result = match strategy {
            Strategy::MkvPropedit => self.run_mkvpropedit(plan, file, opts).await.map(|_| None),
            Strategy::StreamCopy => self
                .run_stream_copy(plan, file, &final_dest, &work_dir, opts)
                .await
                .map(|_| None),
            Strategy::RemuxTranscode => self
                .run_remux(plan, file, &final_dest, &work_dir, opts)
                .await
                .map(Some),
        };

        let stats = match result {
            Ok(stats) => stats.flatten(),
            Err(err) => {
                warn!(path = %plan.path.display(), "execution failed, restoring backup: {err}");
                safe_restore_from_backup(&backup);
                return Err(err);
            }
        };

        // Post-replace: the mtime action, then backup disposition.
        if let Err(err) = self.apply_mtime_action(plan, &final_dest, pre_run_mtime) {
            warn!("mtime restoration failed: {err}");
        }

        let backup_path = if opts.keep_backup {
            Some(backup)
        } else {
            discard_backup(&backup);
            None
        };

        Ok(ExecutionOutcome {
            output_path: final_dest,
            backup_path,
            message: format!("applied {} action(s)", plan.actions.len()),
            stats,
            skipped: false,
        })
    }

    /// Container conversion changes the extension; everything else keeps
    /// the original path.
    fn final_destination(&self, plan: &Plan) -> PathBuf {
        plan.actions
            .iter()
            .find_map(|a| match a {
                PlannedAction::RemuxTo { target_container } => {
                    Some(plan.path.with_extension(target_container))
                }
                _ => None,
            })
            .unwrap_or_else(|| plan.path.clone())
    }

    async fn run_mkvpropedit(
        &self,
        plan: &Plan,
        file: &FileInfo,
        opts: &ExecutorOptions,
    ) -> Result<()> {
        let tool = self.registry.require(Tool::Mkvpropedit)?;
        let args = command::build_mkvpropedit_args(plan)?;
        let mut cmd = tokio::process::Command::new(&tool.path);
        cmd.args(&args);
        run_supervised(
            cmd,
            SuperviseOptions {
                tool: "mkvpropedit".into(),
                deadline: compute_deadline(opts.base_timeout_secs, file.size_bytes, OpKind::Remux),
                total_duration: None,
                progress: None,
            },
        )
        .await?;
        Ok(())
    }

    async fn run_stream_copy(
        &self,
        plan: &Plan,
        file: &FileInfo,
        final_dest: &Path,
        work_dir: &Path,
        opts: &ExecutorOptions,
    ) -> Result<()> {
        let tool = self.registry.require(Tool::Ffmpeg)?;
        let temp = temp_path_for(final_dest, work_dir);
        let args = command::build_stream_copy_args(plan, file, &temp);
        let mut cmd = tokio::process::Command::new(&tool.path);
        cmd.args(&args);

        let run = run_supervised(
            cmd,
            SuperviseOptions {
                tool: "ffmpeg".into(),
                deadline: compute_deadline(opts.base_timeout_secs, file.size_bytes, OpKind::Remux),
                total_duration: file.duration_seconds,
                progress: opts.progress.clone(),
            },
        )
        .await;
        if let Err(err) = run {
            remove_temp(&temp);
            return Err(err);
        }

        self.validate_output(&temp, file.size_bytes, false)?;
        atomic_replace(&temp, final_dest)?;
        self.finish_conversion(plan, final_dest)?;
        Ok(())
    }

    async fn run_remux(
        &self,
        plan: &Plan,
        file: &FileInfo,
        final_dest: &Path,
        work_dir: &Path,
        opts: &ExecutorOptions,
    ) -> Result<Option<ProcessingStats>> {
        let needs_video_encoder = plan
            .actions
            .iter()
            .any(|a| matches!(a, PlannedAction::TranscodeVideo { .. }));
        let is_transcode = plan.actions.iter().any(|a| {
            matches!(
                a,
                PlannedAction::TranscodeVideo { .. }
                    | PlannedAction::TranscodeAudio { .. }
                    | PlannedAction::SynthesizeAudio { .. }
            )
        });

        let mut selection = if needs_video_encoder {
            Some(
                select_encoder(
                    self.registry,
                    self.video_target(plan),
                    opts.hardware,
                    opts.fallback_to_software,
                )
                .await?,
            )
        } else {
            None
        };

        let temp = temp_path_for(final_dest, work_dir);
        let started = Instant::now();
        let op_kind = if is_transcode { OpKind::Transcode } else { OpKind::Remux };

        let mut run = self
            .run_ffmpeg_once(plan, file, &temp, selection.as_ref(), opts, op_kind)
            .await;

        // Hardware failure at runtime: retry the same plan once with the
        // software encoder, recording the fallback in the stats row.
        if let Err(CoreError::Subprocess { detail, .. }) = &run {
            let hardware_failed = selection
                .as_ref()
                .is_some_and(|s| s.encoder_type == EncoderType::Hardware)
                && detect_hw_encoder_error(detail);
            if hardware_failed && opts.fallback_to_software {
                warn!("hardware encoder failed at runtime, retrying with software");
                remove_temp(&temp);
                selection = Some(EncoderSelection {
                    encoder: software_encoder(self.video_target(plan)),
                    encoder_type: EncoderType::Software,
                    hw_platform: None,
                    fallback_occurred: true,
                });
                run = self
                    .run_ffmpeg_once(plan, file, &temp, selection.as_ref(), opts, op_kind)
                    .await;
            }
        }

        let output = match run {
            Ok(output) => output,
            Err(err) => {
                remove_temp(&temp);
                return Err(err);
            }
        };

        if let Err(err) = self.validate_output(&temp, file.size_bytes, is_transcode) {
            remove_temp(&temp);
            return Err(err);
        }

        let output_bytes = std::fs::metadata(&temp).map(|m| m.len()).unwrap_or(0);
        atomic_replace(&temp, final_dest)?;
        self.finish_conversion(plan, final_dest)?;

        let stats = is_transcode.then(|| {
            let (encoder, encoder_type, fallback) = match &selection {
                Some(s) => (s.encoder.clone(), s.encoder_type, s.fallback_occurred),
                None => ("copy".to_string(), EncoderType::Unknown, false),
            };
            ProcessingStats {
                id: Uuid::new_v4(),
                job_id: None,
                file_path: final_dest.to_path_buf(),
                input_bytes: file.size_bytes,
                output_bytes,
                wall_seconds: started.elapsed().as_secs_f64(),
                encoder,
                encoder_type,
                fallback_occurred: fallback,
                mean_fps: output.metrics.mean_fps(),
                peak_fps: output.metrics.peak_fps(),
                mean_bitrate_kbps: output.metrics.mean_bitrate_kbps(),
                total_frames: output.metrics.total_frames(),
                created_at: Utc::now(),
            }
        });
        Ok(stats)
    }

    fn video_target<'p>(&self, plan: &'p Plan) -> &'p str {
        plan.actions
            .iter()
            .find_map(|a| match a {
                PlannedAction::TranscodeVideo { target_codec, .. } => Some(target_codec.as_str()),
                _ => None,
            })
            .unwrap_or("hevc")
    }

    async fn run_ffmpeg_once(
        &self,
        plan: &Plan,
        file: &FileInfo,
        temp: &Path,
        selection: Option<&EncoderSelection>,
        opts: &ExecutorOptions,
        op_kind: OpKind,
    ) -> Result<supervise::SupervisedOutput> {
        let tool = self.registry.require(Tool::Ffmpeg)?;
        let args = command::build_remux_args(
            plan,
            file,
            temp,
            selection,
            &opts.video,
            self.registry,
        )?;
        let mut cmd = tokio::process::Command::new(&tool.path);
        cmd.args(&args);
        run_supervised(
            cmd,
            SuperviseOptions {
                tool: "ffmpeg".into(),
                deadline: compute_deadline(opts.base_timeout_secs, file.size_bytes, op_kind),
                total_duration: file.duration_seconds,
                progress: opts.progress.clone(),
            },
        )
        .await
    }

    /// After a subprocess claims success the output must exist and be
    /// non-empty; a suspiciously small transcode logs but does not fail.
    fn validate_output(&self, output: &Path, input_size: u64, lossy: bool) -> Result<()> {
        let metadata = std::fs::metadata(output).map_err(|_| {
            CoreError::Validation(format!("output missing: {}", output.display()))
        })?;
        if metadata.len() == 0 {
            return Err(CoreError::Validation(format!(
                "output is empty: {}",
                output.display()
            )));
        }
        if lossy && input_size > 0 && metadata.len() <= input_size / 20 {
            warn!(
                output = %output.display(),
                output_bytes = metadata.len(),
                input_bytes = input_size,
                "output is under 5% of input size"
            );
        }
        Ok(())
    }

    /// When the container changed, the original file with the old
    /// extension is removed after the new one is in place.
    fn finish_conversion(&self, plan: &Plan, final_dest: &Path) -> Result<()> {
        if final_dest != plan.path && plan.path.exists() {
            std::fs::remove_file(&plan.path)?;
        }
        Ok(())
    }

    fn apply_mtime_action(
        &self,
        plan: &Plan,
        final_dest: &Path,
        pre_run_mtime: Option<std::time::SystemTime>,
    ) -> Result<()> {
        let Some(target) = plan.actions.iter().find_map(|a| match a {
            PlannedAction::SetFileMtime { target } => Some(target),
            _ => None,
        }) else {
            return Ok(());
        };
        match target {
            MtimeTarget::Now => Ok(()),
            MtimeTarget::Preserve => {
                if let Some(mtime) = pre_run_mtime {
                    filetime::set_file_mtime(
                        final_dest,
                        filetime::FileTime::from_system_time(mtime),
                    )?;
                }
                Ok(())
            }
            MtimeTarget::ReleaseDate(date) => {
                if let Some(when) = crate::evaluator::parse_release_date(date) {
                    let system: std::time::SystemTime = when.into();
                    filetime::set_file_mtime(
                        final_dest,
                        filetime::FileTime::from_system_time(system),
                    )?;
                } else {
                    warn!(date = %date, "unparseable release date, leaving mtime");
                }
                Ok(())
            }
        }
    }
}

fn parent_dir(path: &Path) -> PathBuf {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// `.vpo_temp_<name>` sibling in the working directory; orphans are
/// identifiable by the prefix and swept by maintenance.
pub fn temp_path_for(final_dest: &Path, work_dir: &Path) -> PathBuf {
    let name = final_dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    work_dir.join(format!(".vpo_temp_{name}"))
}

fn remove_temp(temp: &Path) {
    if temp.exists() {
        if let Err(err) = std::fs::remove_file(temp) {
            warn!(temp = %temp.display(), "could not remove temp file: {err}");
        }
    }
}

/// Rename temp into place; fall back to copy+fsync+unlink across
/// devices.
fn atomic_replace(temp: &Path, final_dest: &Path) -> Result<()> {
    match std::fs::rename(temp, final_dest) {
        Ok(()) => Ok(()),
        Err(rename_err) => {
            let copied = std::fs::copy(temp, final_dest)
                .and_then(|_| std::fs::File::open(final_dest)?.sync_all())
                .and_then(|_| std::fs::remove_file(temp));
            copied.map_err(|copy_err| {
                CoreError::Validation(format!(
                    "atomic replace failed: rename: {rename_err}; copy: {copy_err}"
                ))
            })
        }
    }
}
