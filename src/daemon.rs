//! Daemon - Foreground scheduler for periodic synchronization
//!
//! Runs the whole discovery and reconciliation pipeline once at startup and then
//! every `schedule.interval`, until Ctrl+C or SIGTERM. Each run gets a fresh
//! [`RunContext`], so run statistics never leak between runs.

use anyhow::{anyhow, Context, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::duration::{format_go_duration, parse_go_duration};
use crate::events::RunContext;
use crate::sync::{SyncEngine, SyncSummary};

/// Daemon state and control
pub struct Daemon {
    config: Arc<Config>,
    interval: Duration,
    shutdown_sender: broadcast::Sender<()>,
    is_running: Arc<AtomicBool>,
    started: Instant,
    total_syncs: AtomicU64,
    failed_syncs: AtomicU64,
}

/// Daemon statistics and status
#[derive(Debug, Clone)]
pub struct DaemonStatus {
    pub is_running: bool,
    pub uptime: Duration,
    pub interval: Duration,
    pub total_syncs: u64,
    pub successful_syncs: u64,
    pub failed_syncs: u64,
}

impl Daemon {
    /// Create a daemon from a configuration with a `schedule` block
    pub fn new(config: Config) -> Result<Self> {
        let schedule = config
            .schedule
            .as_ref()
            .ok_or_else(|| anyhow!("No schedule configured; add `schedule: {{ interval: 24h }}`"))?;

        let interval = parse_go_duration(&schedule.interval)
            .with_context(|| format!("Invalid schedule interval '{}'", schedule.interval))?;
        if interval.is_zero() {
            return Err(anyhow!("Schedule interval must be greater than zero"));
        }

        let (shutdown_sender, _) = broadcast::channel(1);

        Ok(Self {
            config: Arc::new(config),
            interval,
            shutdown_sender,
            is_running: Arc::new(AtomicBool::new(false)),
            started: Instant::now(),
            total_syncs: AtomicU64::new(0),
            failed_syncs: AtomicU64::new(0),
        })
    }

    /// Sender that stops the daemon loop when anything is sent on it
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_sender.clone()
    }

    /// Run in the foreground until a shutdown signal arrives
    pub async fn run(&self) -> Result<()> {
        info!(interval = %format_go_duration(self.interval), "Starting RepoWarden daemon");
        self.is_running.store(true, Ordering::SeqCst);

        let shutdown_receiver = self.shutdown_sender.subscribe();
        let shutdown_sender = self.shutdown_sender.clone();
        let signal_task = tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            info!("Shutdown signal received, stopping daemon...");
            let _ = shutdown_sender.send(());
        });

        let result = self.daemon_loop(shutdown_receiver).await;

        signal_task.abort();
        self.is_running.store(false, Ordering::SeqCst);
        info!("Daemon stopped");
        result
    }

    pub fn status(&self) -> DaemonStatus {
        let total_syncs = self.total_syncs.load(Ordering::Relaxed);
        let failed_syncs = self.failed_syncs.load(Ordering::Relaxed);

        DaemonStatus {
            is_running: self.is_running.load(Ordering::SeqCst),
            uptime: self.started.elapsed(),
            interval: self.interval,
            total_syncs,
            successful_syncs: total_syncs.saturating_sub(failed_syncs),
            failed_syncs,
        }
    }

    async fn daemon_loop(&self, mut shutdown_receiver: broadcast::Receiver<()>) -> Result<()> {
        let mut interval_timer = interval(self.interval);
        interval_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown_receiver.recv() => {
                    debug!("Shutdown signal received in daemon loop");
                    break;
                }

                // The first tick completes immediately, so a run starts at startup
                _ = interval_timer.tick() => {
                    let summary = self.run_once().await;
                    self.record(&summary);
                    info!(
                        "Next run in {}",
                        format_go_duration(self.interval)
                    );
                }
            }
        }

        Ok(())
    }

    async fn run_once(&self) -> SyncSummary {
        let ctx = RunContext::new(false);
        debug!(run_id = %ctx.run_id, "Starting scheduled sync operation");
        SyncEngine::new(self.config.as_ref().clone(), ctx).run().await
    }

    fn record(&self, summary: &SyncSummary) {
        self.total_syncs.fetch_add(1, Ordering::Relaxed);

        if summary.has_failures() {
            self.failed_syncs.fetch_add(1, Ordering::Relaxed);
            error!(
                "Sync finished with {} failed units out of {}",
                summary.failed_operations,
                summary.results.len()
            );
        } else {
            info!(
                "Sync completed successfully in {:.2}s: {} repos, {} successful, {} skipped",
                summary.duration.as_secs_f64(),
                summary.total_repositories,
                summary.successful_operations,
                summary.skipped_operations
            );
        }
    }
}

/// Wait for Ctrl+C, or SIGTERM on Unix
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => debug!("Ctrl+C received"),
                    _ = terminate.recv() => debug!("SIGTERM received"),
                }
                return;
            }
            Err(e) => warn!("Cannot listen for SIGTERM: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Cannot listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
}
