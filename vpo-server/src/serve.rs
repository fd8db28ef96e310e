//! Daemon bring-up: HTTP listener, worker pool, periodic stale-job
//! recovery, and signal-driven graceful shutdown.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use vpo_core::queue::DEFAULT_HEARTBEAT_TIMEOUT_SECS;

use crate::api::build_router;
use crate::cli::{Cli, ServeArgs, EXIT_INTERRUPTED};
use crate::state::AppState;
use crate::workers::WorkerPool;

const RECOVERY_INTERVAL: Duration = Duration::from_secs(60);

pub async fn run_daemon(cli: &Cli, args: &ServeArgs) -> Result<i32> {
    let state = crate::cli::open_state(cli).await?;

    // Repair anything a previous crash left behind before taking work.
    let recovered = state
        .queue
        .recover_stale_jobs(DEFAULT_HEARTBEAT_TIMEOUT_SECS)
        .await?;
    if recovered > 0 {
        info!(recovered, "recovered stale jobs at startup");
    }

    let worker_count = args.workers.unwrap_or(state.config.worker_count).max(1);
    let pool = WorkerPool::spawn(state.clone(), worker_count);

    let recovery = {
        let queue = state.queue.clone();
        let state = state.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(RECOVERY_INTERVAL);
            loop {
                ticker.tick().await;
                if state.is_shutting_down() {
                    break;
                }
                match queue.recover_stale_jobs(DEFAULT_HEARTBEAT_TIMEOUT_SECS).await {
                    Ok(0) => {}
                    Ok(n) => info!(recovered = n, "stale jobs returned to queue"),
                    Err(err) => warn!("stale-job recovery failed: {err}"),
                }
            }
        })
    };

    let bind = args
        .bind
        .clone()
        .unwrap_or_else(|| state.config.bind_addr.clone());
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("cannot bind {bind}"))?;
    info!(addr = %bind, workers = worker_count, "daemon listening");

    let router = build_router(state.clone());
    let shutdown_state = state.clone();
    let server = axum::serve(listener, router).with_graceful_shutdown(async move {
        wait_for_shutdown_signal().await;
        info!("shutdown signal received, draining");
        shutdown_state.begin_shutdown();
    });

    server.await.context("http server failed")?;

    // HTTP is down; let in-flight jobs finish, then stop the recovery
    // ticker.
    pool.join().await;
    recovery.abort();
    info!("daemon stopped");
    Ok(EXIT_INTERRUPTED)
}

async fn wait_for_shutdown_signal() {
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            warn!("cannot install SIGTERM handler: {err}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}
