//! Switchyard Daemon - Adaptive Model Router Process
//!
//! Wraps the switchyard router in a long-running process that speaks
//! newline-delimited JSON on stdin/stdout. Logs go to stderr so stdout stays
//! a clean reply stream.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (~/.config/switchyard/router.toml)
//! switchyard-daemon
//!
//! # With config file
//! switchyard-daemon --config /etc/switchyard/router.toml
//!
//! # Keep learned state somewhere else
//! switchyard-daemon --state /var/lib/switchyard/state.json
//!
//! # Verbose logging
//! RUST_LOG=debug switchyard-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: stop reading requests, finish in-flight ones,
//!   save learned state

mod server;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use switchyard_core::{default_state_path, load_config_from_path, Router, RouterConfig};

/// Switchyard Daemon - routes queries to the best available model
#[derive(Parser, Debug)]
#[command(name = "switchyard-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "SWITCHYARD_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Learned state file (performance records and context graph)
    #[arg(short = 's', long, value_name = "FILE")]
    state: Option<PathBuf>,

    /// Start fresh and never write state
    #[arg(long)]
    no_state: bool,

    /// Don't run the background health advisor
    #[arg(long)]
    no_advisor: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "SWITCHYARD_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "switchyard_daemon={level},switchyard_core={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

/// Pick the state file: flag, then config, then the XDG data dir
fn resolve_state_path(args: &Args, config: &RouterConfig) -> Option<PathBuf> {
    if args.no_state {
        return None;
    }
    args.state
        .clone()
        .or_else(|| config.persistence.state_path.clone())
        .or_else(default_state_path)
}

/// Move an unreadable state file to `<path>.unreadable`
///
/// The shutdown save would otherwise replace it with a fresh snapshot.
async fn set_aside_unreadable(path: &Path) -> std::io::Result<PathBuf> {
    let mut aside = path.as_os_str().to_owned();
    aside.push(".unreadable");
    let aside = PathBuf::from(aside);
    tokio::fs::rename(path, &aside).await?;
    Ok(aside)
}

/// Restore learned state, returning where to save it on shutdown
///
/// An unreadable file is moved aside before the path is reused. If that
/// fails too, saving is disabled for this run.
async fn restore_or_set_aside(router: &Router, path: PathBuf) -> Option<PathBuf> {
    match router.restore_state(&path).await {
        Ok(true) => info!(path = ?path, "Restored learned state"),
        Ok(false) => info!(path = ?path, "No saved state, starting fresh"),
        Err(e) => {
            warn!(error = %e, path = ?path, "Ignoring unreadable state");
            match set_aside_unreadable(&path).await {
                Ok(aside) => warn!(path = ?aside, "Moved unreadable state aside"),
                Err(e) => {
                    error!(
                        error = %e,
                        path = ?path,
                        "Cannot move unreadable state, state will not be saved"
                    );
                    return None;
                }
            }
        }
    }
    Some(path)
}

/// Cancel `shutdown` on SIGINT or SIGTERM
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "Failed to install SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                    shutdown.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Received SIGINT, initiating shutdown"),
                _ = sigterm.recv() => info!("Received SIGTERM, initiating shutdown"),
                () = shutdown.cancelled() => return,
            }
        }
        #[cfg(not(unix))]
        {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Received Ctrl-C, initiating shutdown"),
                () = shutdown.cancelled() => return,
            }
        }
        shutdown.cancel();
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!("Switchyard daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = load_config_from_path(args.config.clone()).context("Failed to load config")?;
    let state_path = resolve_state_path(&args, &config);
    let advisor_enabled = config.advisor.enabled && !args.no_advisor;

    let router = Arc::new(Router::new(config).context("Failed to build router")?);
    info!(models = router.registry().len(), "Router ready");

    let state_path = match state_path {
        Some(path) => restore_or_set_aside(&router, path).await,
        None => None,
    };

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let advisor = advisor_enabled.then(|| router.advisor());
    let advisor_task = advisor
        .clone()
        .map(|advisor| advisor.spawn(shutdown.child_token()));

    let result = server::serve(
        Arc::clone(&router),
        advisor,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        shutdown.clone(),
    )
    .await;

    info!("Shutting down...");
    shutdown.cancel();
    if let Some(task) = advisor_task {
        if let Err(e) = task.await {
            warn!(error = %e, "Advisor task failed");
        }
    }

    if let Some(ref path) = state_path {
        match router.save_state(path).await {
            Ok(()) => info!(path = ?path, "Saved learned state"),
            Err(e) => error!(error = %e, path = ?path, "Failed to save state"),
        }
    }

    match result {
        Ok(()) => {
            info!("Switchyard daemon stopped cleanly");
            // the stdin reader thread may still be parked in a read
            std::process::exit(0);
        }
        Err(e) => {
            error!(error = %e, "Daemon stopped with error");
            Err(e)
        }
    }
}
