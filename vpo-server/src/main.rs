//! # VPO
//!
//! Policy-driven video library manager: scan a directory tree, evaluate a
//! declarative YAML policy against each file's probed state, and realize
//! the resulting plan through ffmpeg and the Matroska tools, from a CLI
//! or through the long-running daemon with its job queue and JSON API.

mod api;
mod cli;
mod serve;
mod state;
mod workers;

use clap::Parser;
use tracing::error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cli::{Cli, EXIT_ERROR};

#[tokio::main]
async fn main() {
    let args = Cli::parse();

    let default_filter = if args.verbose {
        "vpo_server=debug,vpo_core=debug,vpo_model=debug,info"
    } else {
        "info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let code = match cli::run(args).await {
        Ok(code) => code,
        Err(err) => {
            error!("{err:#}");
            eprintln!("error: {err:#}");
            EXIT_ERROR
        }
    };
    std::process::exit(code);
}
