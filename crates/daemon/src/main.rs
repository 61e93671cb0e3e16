//! confsync daemon entry point.
//!
//! Loads configuration, opens the sync engine, then runs a bidirectional
//! sync on an interval and shortly after the local tree changes, until
//! SIGINT or SIGTERM.

mod scheduler;
mod signals;
mod watcher;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::{mpsc, Notify};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use confsync_core::config::{expand_tilde, SyncConfig};
use confsync_core::sync_engine::SyncEngine;

/// Quiet period after the last file event before a sync is triggered.
const DEBOUNCE: Duration = Duration::from_secs(2);

/// How long shutdown waits for an in-flight sync.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// confsync auto-sync daemon.
#[derive(Parser, Debug)]
#[command(
    name = "confsync-daemon",
    version,
    about = "Keep a config tree in sync on an interval and on file changes"
)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter (trace, debug, info, warn, error, or an EnvFilter directive).
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config_path = expand_tilde(&args.config.unwrap_or_else(SyncConfig::default_path));
    let config = SyncConfig::load_and_validate(&config_path)
        .with_context(|| format!("failed to load configuration from {}", config_path.display()))?;

    let log_dir = expand_tilde(&config.paths.log_dir());
    std::fs::create_dir_all(&log_dir).context("failed to create log directory")?;
    let _log_guard = init_tracing(&args.log_level, &log_dir);

    info!("========================================");
    info!("  confsync daemon v{}", env!("CARGO_PKG_VERSION"));
    info!("========================================");
    info!("Config file   : {}", config_path.display());
    info!("Repository    : {}", config.sync.repository);
    info!("Branch        : {}", config.sync.branch);
    info!("Local tree    : {}", config.paths.local_root.display());
    info!("Interval      : {} min", config.sync.sync_interval_minutes);
    info!("Strategy      : {}", config.sync.conflict_strategy);
    info!("Log dir       : {}", log_dir.display());
    info!("========================================");

    if !config.sync.auto_sync {
        warn!("auto_sync is disabled in the configuration; nothing to do");
        return Ok(());
    }

    let interval = Duration::from_secs(u64::from(config.sync.sync_interval_minutes) * 60);
    let local_root = expand_tilde(&config.paths.local_root);
    std::fs::create_dir_all(&local_root).context("failed to create local tree")?;

    // Bootstrapping may clone over the network.
    let engine = tokio::task::spawn_blocking(move || SyncEngine::from_config(config))
        .await
        .context("engine initialisation task failed")?
        .context("failed to initialise sync engine")?;
    let engine = Arc::new(engine);
    info!("Sync engine initialized");

    let (raw_tx, raw_rx) = mpsc::channel::<()>(256);
    let (change_tx, change_rx) = mpsc::channel::<()>(1);
    let _watcher = watcher::watch(&local_root, raw_tx)
        .with_context(|| format!("failed to watch {}", local_root.display()))?;
    let debounce_handle = tokio::spawn(scheduler::debounce(raw_rx, change_tx, DEBOUNCE));
    info!("Watching {} for changes", local_root.display());

    let shutdown = Arc::new(Notify::new());
    let scheduler_shutdown = Arc::clone(&shutdown);
    let mut sched = scheduler::Scheduler::new(Arc::clone(&engine), interval, change_rx);
    let scheduler_handle = tokio::spawn(async move {
        sched.run(scheduler_shutdown).await;
    });

    signals::wait_for_shutdown().await;
    info!("Shutdown signal received, stopping...");

    // notify_one stores a permit, so a scheduler that is between polls still sees it.
    shutdown.notify_one();

    match tokio::time::timeout(SHUTDOWN_GRACE, scheduler_handle).await {
        Ok(Ok(())) => info!("scheduler stopped gracefully"),
        Ok(Err(e)) => warn!("scheduler task error: {}", e),
        Err(_) => warn!(
            "scheduler did not stop within {}s, forcing shutdown",
            SHUTDOWN_GRACE.as_secs()
        ),
    }

    debounce_handle.abort();
    info!("confsync daemon stopped.");
    Ok(())
}

/// Log to stdout and to a daily-rotated file under `log_dir`.
///
/// The returned guard flushes the file writer on drop and must live for the
/// whole process.
fn init_tracing(level: &str, log_dir: &Path) -> WorkerGuard {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let file_appender = tracing_appender::rolling::daily(log_dir, "confsync-daemon.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();

    guard
}
