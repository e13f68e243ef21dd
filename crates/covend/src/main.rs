//! covend - coven orchestration daemon.
//!
//! Binary entry point: argument parsing, tracing, signal handling.

use clap::Parser;
use covend::{Daemon, DaemonConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Orchestration daemon driving AI coding agents through grimoires.
#[derive(Debug, Parser)]
#[command(name = "covend", version)]
struct Args {
    /// Repository to serve (must be a git work tree).
    #[arg(long, default_value = ".")]
    repo: PathBuf,

    /// Control socket path (default: <repo>/.coven/covend.sock).
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Extra config file applied over <repo>/.coven/config.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Start with the scheduler paused; use `POST /session/start`.
    #[arg(long)]
    paused: bool,
}

fn main() {
    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = DaemonConfig::new(args.repo);
    config.socket_path = args.socket;
    config.config_file = args.config;
    config.start_paused = args.paused;

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("failed to create tokio runtime: {e}");
            std::process::exit(1);
        }
    };

    runtime.block_on(async {
        let daemon = match Daemon::new(config) {
            Ok(daemon) => Arc::new(daemon),
            Err(e) => {
                error!("failed to initialize daemon: {e}");
                std::process::exit(1);
            }
        };

        // Signals request shutdown; `run` then drains and returns.
        let signal_daemon = Arc::clone(&daemon);
        tokio::spawn(async move {
            let mut sigterm = match tokio::signal::unix::signal(
                tokio::signal::unix::SignalKind::terminate(),
            ) {
                Ok(signal) => signal,
                Err(e) => {
                    error!("failed to install SIGTERM handler: {e}");
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("received SIGINT, shutting down"),
                _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
            }
            signal_daemon.shutdown();
        });

        if let Err(e) = daemon.run().await {
            error!("daemon error: {e}");
            std::process::exit(1);
        }
    });
}
