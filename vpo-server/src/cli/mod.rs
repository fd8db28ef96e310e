//! The `vpo` command-line surface.
//!
//! Every verb drives the same engine the daemon uses. Exit codes: 0
//! success, 1 operational error, 2 policy validation error, 130 user
//! interrupt.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{error, info};
use vpo_core::{
    apply_policy, maintenance, ApplyOptions, Config, DataDir, JobQueue,
    ScanOptions, Scanner, Store, StoreOptions, ToolRegistry,
};
use vpo_model::Policy;

use crate::state::AppState;

pub const EXIT_OK: i32 = 0;
pub const EXIT_ERROR: i32 = 1;
pub const EXIT_POLICY_INVALID: i32 = 2;
pub const EXIT_INTERRUPTED: i32 = 130;

#[derive(Debug, Parser)]
#[command(name = "vpo", version, about = "Policy-driven video library manager")]
pub struct Cli {
    /// Machine-readable JSON output.
    #[arg(long, global = true)]
    pub json: bool,

    /// Verbose diagnostics.
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    /// Data directory (default: ~/.local/share/vpo).
    #[arg(long, global = true, env = "VPO_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Configuration file path.
    #[arg(long, global = true, env = "VPO_CONFIG_PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Initialize the data directory and database.
    Init,
    /// Scan directories into the library.
    Scan(ScanArgs),
    /// Apply a policy to files or directories.
    Apply(ApplyArgs),
    /// Transcode files using a policy's transcode settings.
    Transcode(TranscodeArgs),
    /// Maintenance operations.
    Maintain {
        #[command(subcommand)]
        target: MaintainTarget,
    },
    /// Manage analyzer/metadata plugins.
    Plugins {
        #[command(subcommand)]
        action: PluginAction,
    },
    /// Policy tooling.
    Policy {
        #[command(subcommand)]
        action: PolicyAction,
    },
    /// Installed policy documents.
    Policies {
        #[command(subcommand)]
        action: PoliciesAction,
    },
    /// Run the HTTP daemon and worker pool.
    Serve(ServeArgs),
}

#[derive(Debug, Args)]
pub struct ScanArgs {
    /// Directories to scan.
    #[arg(required = true)]
    pub dirs: Vec<PathBuf>,
    /// Re-probe every file regardless of change detection.
    #[arg(long)]
    pub full: bool,
    /// Remove library rows for files that no longer exist.
    #[arg(long)]
    pub prune: bool,
    /// Verify content hashes in addition to size/mtime.
    #[arg(long)]
    pub verify_hash: bool,
    /// Report without writing to the library.
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Debug, Args)]
pub struct ApplyArgs {
    /// Policy name (from policies/) or a path to a policy file.
    pub policy: String,
    /// Files or directories to process.
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,
    /// Evaluate and print the plan without executing.
    #[arg(long)]
    pub dry_run: bool,
    /// Keep the backup file next to the output on success.
    #[arg(long)]
    pub keep_backup: bool,
}

#[derive(Debug, Args)]
pub struct TranscodeArgs {
    /// Files or directories to transcode.
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,
    /// Policy supplying the transcode settings.
    #[arg(long, default_value = "default")]
    pub policy: String,
    /// Keep the backup file next to the output on success.
    #[arg(long)]
    pub keep_backup: bool,
}

#[derive(Debug, Subcommand)]
pub enum MaintainTarget {
    /// Clean expired job logs.
    Logs,
    /// Logs, temp files, and stale job recovery.
    All,
    /// Show queue and library status.
    Status,
}

#[derive(Debug, Subcommand)]
pub enum PluginAction {
    /// List registered plugins.
    List,
    /// Enable a plugin.
    Enable { name: String },
    /// Disable a plugin.
    Disable { name: String },
    /// Acknowledge a newly discovered plugin.
    Acknowledge { name: String },
}

#[derive(Debug, Subcommand)]
pub enum PolicyAction {
    /// Validate a policy document.
    Validate { file: PathBuf },
}

#[derive(Debug, Subcommand)]
pub enum PoliciesAction {
    /// List installed policies.
    List,
    /// Print one policy document.
    Show { name: String },
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Bind address, e.g. 127.0.0.1:8920.
    #[arg(long)]
    pub bind: Option<String>,
    /// Worker count override.
    #[arg(long)]
    pub workers: Option<usize>,
}

/// Shared bring-up for verbs that need the engine.
pub(crate) async fn open_state(cli: &Cli) -> Result<AppState> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(data_dir) = &cli.data_dir {
        config.data_dir = data_dir.clone();
    }
    let data_dir = DataDir::new(&config.data_dir);
    data_dir.ensure()?;

    let registry = Arc::new(ToolRegistry::detect(&config.tool_paths).await);
    let store = Store::open(
        &config.resolved_database_path(),
        StoreOptions {
            busy_timeout: std::time::Duration::from_secs(config.db_timeout_secs),
            ..StoreOptions::default()
        },
    )
    .await?;
    Ok(AppState::new(config, data_dir, registry, store))
}

pub async fn run(cli: Cli) -> Result<i32> {
    match &cli.command {
        Command::Init => {
            let state = open_state(&cli).await?;
            let version = state.store.schema_version().await?;
            if cli.json {
                println!(
                    "{}",
                    serde_json::json!({
                        "data_dir": state.data_dir.root(),
                        "schema_version": version,
                    })
                );
            } else {
                println!(
                    "initialized {} (schema v{version})",
                    state.data_dir.root().display()
                );
            }
            Ok(EXIT_OK)
        }
        Command::Scan(args) => {
            let state = open_state(&cli).await?;
            let scanner = Scanner::new(&state.store, &state.registry);
            let report = scanner
                .scan(
                    &args.dirs,
                    ScanOptions {
                        full: args.full,
                        prune: args.prune,
                        verify_hash: args.verify_hash,
                        dry_run: args.dry_run,
                    },
                )
                .await?;
            if cli.json {
                println!("{}", serde_json::to_string(&report)?);
            } else {
                println!(
                    "scan: {} new, {} updated, {} unchanged, {} pruned, {} errors",
                    report.discovered,
                    report.updated,
                    report.unchanged,
                    report.pruned,
                    report.errors
                );
            }
            Ok(if report.errors > 0 { EXIT_ERROR } else { EXIT_OK })
        }
        Command::Apply(args) => {
            run_apply(&cli, &args.policy, &args.paths, args.dry_run, args.keep_backup).await
        }
        Command::Transcode(args) => {
            run_apply(&cli, &args.policy, &args.paths, false, args.keep_backup).await
        }
        Command::Maintain { target } => run_maintain(&cli, target).await,
        Command::Plugins { action } => run_plugins(&cli, action).await,
        Command::Policy { action } => match action {
            PolicyAction::Validate { file } => {
                let text = std::fs::read_to_string(file)
                    .with_context(|| format!("cannot read {}", file.display()))?;
                match Policy::load(&text) {
                    Ok(policy) => {
                        if cli.json {
                            println!(
                                "{}",
                                serde_json::json!({
                                    "valid": true,
                                    "name": policy.name,
                                    "phases": policy.phases.len(),
                                })
                            );
                        } else {
                            println!(
                                "{}: valid ({} phase(s))",
                                policy.name,
                                policy.phases.len()
                            );
                        }
                        Ok(EXIT_OK)
                    }
                    Err(err) => {
                        if cli.json {
                            println!(
                                "{}",
                                serde_json::json!({ "valid": false, "error": err.to_string() })
                            );
                        } else {
                            eprintln!("invalid policy: {err}");
                        }
                        Ok(EXIT_POLICY_INVALID)
                    }
                }
            }
        },
        Command::Policies { action } => run_policies(&cli, action).await,
        Command::Serve(args) => crate::serve::run_daemon(&cli, args).await,
    }
}

/// Resolve a policy argument: an installed name first, then a file path.
fn resolve_policy(state: &AppState, name_or_path: &str) -> Result<Policy> {
    let path = state
        .data_dir
        .policy_path(name_or_path)
        .or_else(|| {
            let candidate = PathBuf::from(name_or_path);
            candidate.exists().then_some(candidate)
        })
        .with_context(|| format!("policy {name_or_path:?} not found"))?;
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    Ok(Policy::load(&text)?)
}

fn expand_paths(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            let mut found = Vec::new();
            collect_dir(path, &mut found);
            found.sort();
            files.extend(found);
        } else {
            files.push(path.clone());
        }
    }
    files
}

fn collect_dir(dir: &std::path::Path, out: &mut Vec<PathBuf>) {
    if let Ok(entries) = std::fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                collect_dir(&path, out);
            } else if matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("mkv" | "mp4" | "m4v" | "avi" | "mov" | "webm" | "ts" | "flv" | "wmv")
            ) {
                out.push(path);
            }
        }
    }
}

async fn run_apply(
    cli: &Cli,
    policy_arg: &str,
    paths: &[PathBuf],
    dry_run: bool,
    keep_backup: bool,
) -> Result<i32> {
    let state = open_state(cli).await?;
    let policy = resolve_policy(&state, policy_arg)?;
    let files = expand_paths(paths);
    if files.is_empty() {
        eprintln!("no video files found");
        return Ok(EXIT_ERROR);
    }

    let mut failures = 0usize;
    for path in &files {
        let mut opts = ApplyOptions {
            dry_run,
            executor: crate::workers::executor_options_for(&policy, &state),
        };
        opts.executor.keep_backup = keep_backup;

        match apply_policy(&state.registry, &state.store, &policy, path, &opts).await {
            Ok(report) => {
                if cli.json {
                    println!(
                        "{}",
                        serde_json::json!({
                            "path": path,
                            "actions": report.plan.actions.len(),
                            "warnings": report.plan.warnings,
                            "dry_run": dry_run,
                            "plan": if dry_run { Some(&report.plan) } else { None },
                        })
                    );
                } else if dry_run {
                    println!("{}: {} action(s) planned", path.display(), report.plan.actions.len());
                    for action in &report.plan.actions {
                        println!("  {action:?}");
                    }
                    for warning in &report.plan.warnings {
                        println!("  warning: {warning}");
                    }
                } else {
                    let message = report
                        .outcome
                        .as_ref()
                        .map(|o| o.message.as_str())
                        .unwrap_or("done");
                    println!("{}: {message}", path.display());
                }
            }
            Err(err) => {
                failures += 1;
                error!(path = %path.display(), "apply failed: {err}");
                if cli.verbose {
                    eprintln!("{}: {err:?}", path.display());
                } else {
                    eprintln!("{}: {err}", path.display());
                }
            }
        }
    }

    info!(total = files.len(), failures, "apply run finished");
    Ok(if failures > 0 { EXIT_ERROR } else { EXIT_OK })
}

async fn run_maintain(cli: &Cli, target: &MaintainTarget) -> Result<i32> {
    let state = open_state(cli).await?;
    let queue = JobQueue::new(state.store.clone());
    match target {
        MaintainTarget::Logs => {
            let deleted = maintenance::clean_job_logs(
                &state.data_dir.logs_dir(),
                state.config.log_deletion_days,
            )?;
            if cli.json {
                println!("{}", serde_json::json!({ "logs_deleted": deleted }));
            } else {
                println!("deleted {deleted} expired log(s)");
            }
        }
        MaintainTarget::All => {
            let report = maintenance::run_maintenance(
                &queue,
                &state.data_dir.logs_dir(),
                &[],
                state.config.log_deletion_days,
            )
            .await?;
            if cli.json {
                println!("{}", serde_json::to_string(&report)?);
            } else {
                println!(
                    "maintenance: {} log(s) deleted, {} temp file(s) removed, {} job(s) recovered",
                    report.logs_deleted, report.temp_files_removed, report.stale_jobs_recovered
                );
            }
        }
        MaintainTarget::Status => {
            let stats = queue.queue_stats().await?;
            let files = state.store.file_count().await?;
            if cli.json {
                println!(
                    "{}",
                    serde_json::json!({ "queue": stats, "library_files": files })
                );
            } else {
                println!(
                    "library: {files} file(s); queue: {} queued, {} running, {} completed, \
                     {} failed, {} cancelled",
                    stats.queued, stats.running, stats.completed, stats.failed, stats.cancelled
                );
            }
        }
    }
    Ok(EXIT_OK)
}

async fn run_plugins(cli: &Cli, action: &PluginAction) -> Result<i32> {
    let state = open_state(cli).await?;
    match action {
        PluginAction::List => {
            let plugins = state.store.list_plugins().await?;
            if cli.json {
                println!("{}", serde_json::to_string(&plugins)?);
            } else if plugins.is_empty() {
                println!("no plugins registered");
            } else {
                for plugin in plugins {
                    println!(
                        "{}  {}  {}{}",
                        plugin.name,
                        plugin.version.as_deref().unwrap_or("-"),
                        if plugin.enabled { "enabled" } else { "disabled" },
                        if plugin.acknowledged { "" } else { "  (unacknowledged)" },
                    );
                }
            }
        }
        PluginAction::Enable { name } => {
            let changed = state.store.set_plugin_enabled(name, true).await?;
            report_plugin_change(cli, name, changed, "enabled")?;
        }
        PluginAction::Disable { name } => {
            let changed = state.store.set_plugin_enabled(name, false).await?;
            report_plugin_change(cli, name, changed, "disabled")?;
        }
        PluginAction::Acknowledge { name } => {
            let changed = state.store.acknowledge_plugin(name).await?;
            report_plugin_change(cli, name, changed, "acknowledged")?;
        }
    }
    Ok(EXIT_OK)
}

fn report_plugin_change(cli: &Cli, name: &str, changed: bool, verb: &str) -> Result<()> {
    if cli.json {
        println!(
            "{}",
            serde_json::json!({ "plugin": name, "changed": changed })
        );
    } else if changed {
        println!("{name} {verb}");
    } else {
        println!("{name} not found");
    }
    Ok(())
}

async fn run_policies(cli: &Cli, action: &PoliciesAction) -> Result<i32> {
    let state = open_state(cli).await?;
    match action {
        PoliciesAction::List => {
            let names = state.data_dir.list_policies()?;
            if cli.json {
                println!("{}", serde_json::to_string(&names)?);
            } else if names.is_empty() {
                println!("no policies installed");
            } else {
                for name in names {
                    println!("{name}");
                }
            }
            Ok(EXIT_OK)
        }
        PoliciesAction::Show { name } => {
            let Some(path) = state.data_dir.policy_path(name) else {
                eprintln!("policy {name:?} not found");
                return Ok(EXIT_ERROR);
            };
            let text = std::fs::read_to_string(path)?;
            if cli.json {
                let policy = Policy::load(&text)?;
                println!("{}", serde_json::to_string(&policy)?);
            } else {
                print!("{text}");
            }
            Ok(EXIT_OK)
        }
    }
}
