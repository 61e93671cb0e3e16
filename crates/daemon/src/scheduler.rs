//! Sync scheduler that runs a bidirectional sync on an interval and after
//! debounced file changes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{error, info, warn};

use confsync_core::conflict::SkipPrompt;
use confsync_core::models::SyncResult;
use confsync_core::sync_engine::{SyncEngine, SyncOptions};

/// One unattended sync run.
pub trait SyncJob: Send + Sync + 'static {
    fn run(&self) -> SyncResult;
}

impl SyncJob for SyncEngine {
    fn run(&self) -> SyncResult {
        self.sync(SyncOptions::default(), &SkipPrompt)
    }
}

/// Tracks aggregate statistics across sync cycles.
#[derive(Default)]
pub struct SchedulerStats {
    pub total_cycles: AtomicU64,
    pub skipped_cycles: AtomicU64,
    pub total_unresolved: AtomicU64,
    pub total_errors: AtomicU64,
    pub consecutive_errors: AtomicU64,
}

/// Runs syncs on a timer and on file-change notifications.
///
/// Each sync runs on the blocking pool so the loop keeps listening; a
/// trigger that arrives while a sync is in flight is skipped, not queued.
pub struct Scheduler<J: SyncJob> {
    job: Arc<J>,
    interval: Duration,
    changes_rx: mpsc::Receiver<()>,
    running: Arc<AtomicBool>,
    stats: Arc<SchedulerStats>,
    in_flight: Option<JoinHandle<()>>,
}

impl<J: SyncJob> Scheduler<J> {
    pub fn new(job: Arc<J>, interval: Duration, changes_rx: mpsc::Receiver<()>) -> Self {
        Self {
            job,
            interval,
            changes_rx,
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(SchedulerStats::default()),
            in_flight: None,
        }
    }

    pub fn stats(&self) -> Arc<SchedulerStats> {
        Arc::clone(&self.stats)
    }

    /// Main scheduler loop; returns after `shutdown` is notified and the
    /// in-flight sync (if any) has finished.
    pub async fn run(&mut self, shutdown: Arc<Notify>) {
        info!(interval_secs = self.interval.as_secs(), "scheduler started");

        // The first tick fires immediately, giving a sync at startup.
        let mut interval = time::interval(self.interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.try_start("scheduled");
                }
                Some(()) = self.changes_rx.recv() => {
                    if self.try_start("file_change") {
                        interval.reset();
                    }
                }
                _ = shutdown.notified() => {
                    info!("scheduler shutting down");
                    break;
                }
            }
        }

        self.wait_idle().await;
    }

    /// Start a sync unless one is already running. Returns whether a sync
    /// was started.
    pub fn try_start(&mut self, trigger: &'static str) -> bool {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.stats.skipped_cycles.fetch_add(1, Ordering::SeqCst);
            warn!(trigger, "skipping sync: previous sync still running");
            return false;
        }

        let cycle = self.stats.total_cycles.fetch_add(1, Ordering::SeqCst) + 1;
        let job = Arc::clone(&self.job);
        let running = Arc::clone(&self.running);
        let stats = Arc::clone(&self.stats);

        self.in_flight = Some(tokio::spawn(async move {
            info!(cycle, trigger, "starting sync");
            match tokio::task::spawn_blocking(move || job.run()).await {
                Ok(result) => record(&stats, cycle, &result),
                Err(e) => {
                    stats.total_errors.fetch_add(1, Ordering::SeqCst);
                    error!(cycle, error = %e, "sync task panicked");
                }
            }
            running.store(false, Ordering::SeqCst);
        }));
        true
    }

    /// Wait for the in-flight sync, if any.
    pub async fn wait_idle(&mut self) {
        if let Some(handle) = self.in_flight.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "sync task did not finish cleanly");
            }
        }
    }
}

fn record(stats: &SchedulerStats, cycle: u64, result: &SyncResult) {
    let unresolved = result.unresolved().count() as u64;
    stats.total_unresolved.fetch_add(unresolved, Ordering::SeqCst);

    if result.success {
        stats.consecutive_errors.store(0, Ordering::SeqCst);
        info!(
            cycle,
            pulled = result.pulled_count,
            pushed = result.pushed_count,
            conflicts = result.conflicts.len(),
            unresolved,
            "sync completed"
        );
        if unresolved > 0 {
            warn!(cycle, unresolved, "conflicts left unresolved; run 'confsync sync' to resolve them");
        }
    } else {
        let errors = stats.total_errors.fetch_add(1, Ordering::SeqCst) + 1;
        let consecutive = stats.consecutive_errors.fetch_add(1, Ordering::SeqCst) + 1;
        error!(
            cycle,
            message = %result.message,
            total_errors = errors,
            consecutive_errors = consecutive,
            "sync failed"
        );
    }
}

/// Coalesce bursts on `events` into a single message on `out`, sent once
/// `quiet` has passed with no further event. Returns when either channel
/// closes.
pub async fn debounce(mut events: mpsc::Receiver<()>, out: mpsc::Sender<()>, quiet: Duration) {
    while events.recv().await.is_some() {
        loop {
            match time::timeout(quiet, events.recv()).await {
                Ok(Some(())) => continue,
                Ok(None) => {
                    let _ = out.send(()).await;
                    return;
                }
                Err(_) => break,
            }
        }
        if out.send(()).await.is_err() {
            return;
        }
    }
}
