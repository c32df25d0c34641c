//! Per-run observability context
//!
//! Components never log through process-wide state of their own; they receive a
//! [`RunContext`] and report what happened through its [`EventSink`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Something worth reporting to an observability collaborator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    RepoDiscovered { repo: String, source: String },
    RepoFiltered { repo: String, reason: String },
    ReconcileStarted { repo: String, destination: String },
    ReconcileSucceeded { repo: String, destination: String },
    ReconcileSkipped { repo: String, destination: String, reason: String },
    ReconcileFailed { repo: String, destination: String, error: String },
    ObjectUploaded { destination: String, key: String },
    ObjectPruned { destination: String, key: String },
}

/// Receiver of run events
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &Event);
}

/// Default sink: every event becomes a tracing event
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl EventSink for LogSink {
    fn emit(&self, event: &Event) {
        match event {
            Event::RepoDiscovered { repo, source } => {
                debug!(stage = "discover", repo = %repo, source = %source, "Repository discovered")
            }
            Event::RepoFiltered { repo, reason } => {
                debug!(stage = "filter", repo = %repo, "Filtered out: {}", reason)
            }
            Event::ReconcileStarted { repo, destination } => {
                debug!(stage = "reconcile", repo = %repo, destination = %destination, "Started")
            }
            Event::ReconcileSucceeded { repo, destination } => {
                info!(stage = "reconcile", repo = %repo, destination = %destination, "Succeeded")
            }
            Event::ReconcileSkipped {
                repo,
                destination,
                reason,
            } => info!(
                stage = "reconcile",
                repo = %repo,
                destination = %destination,
                "Skipped: {}",
                reason
            ),
            Event::ReconcileFailed {
                repo,
                destination,
                error,
            } => error!(
                stage = "reconcile",
                repo = %repo,
                destination = %destination,
                "Failed: {}",
                error
            ),
            Event::ObjectUploaded { destination, key } => {
                debug!(stage = "upload", destination = %destination, key = %key, "Uploaded")
            }
            Event::ObjectPruned { destination, key } => {
                info!(stage = "prune", destination = %destination, key = %key, "Pruned")
            }
        }
    }
}

/// Counters for the end-of-run summary
#[derive(Debug, Default)]
pub struct RunStats {
    discovered: AtomicUsize,
    filtered: AtomicUsize,
    succeeded: AtomicUsize,
    skipped: AtomicUsize,
    failed: AtomicUsize,
    uploaded: AtomicUsize,
    pruned: AtomicUsize,
}

/// Point-in-time copy of [`RunStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub discovered: usize,
    pub filtered: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub uploaded: usize,
    pub pruned: usize,
}

impl RunStats {
    fn record(&self, event: &Event) {
        let counter = match event {
            Event::RepoDiscovered { .. } => &self.discovered,
            Event::RepoFiltered { .. } => &self.filtered,
            Event::ReconcileStarted { .. } => return,
            Event::ReconcileSucceeded { .. } => &self.succeeded,
            Event::ReconcileSkipped { .. } => &self.skipped,
            Event::ReconcileFailed { .. } => &self.failed,
            Event::ObjectUploaded { .. } => &self.uploaded,
            Event::ObjectPruned { .. } => &self.pruned,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            discovered: self.discovered.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            uploaded: self.uploaded.load(Ordering::Relaxed),
            pruned: self.pruned.load(Ordering::Relaxed),
        }
    }
}

/// Everything a component needs to know about the run it is part of
#[derive(Clone)]
pub struct RunContext {
    pub dry_run: bool,
    pub run_id: String,
    sink: Arc<dyn EventSink>,
    stats: Arc<RunStats>,
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("dry_run", &self.dry_run)
            .field("run_id", &self.run_id)
            .finish_non_exhaustive()
    }
}

impl RunContext {
    pub fn new(dry_run: bool) -> Self {
        Self::with_sink(dry_run, Arc::new(LogSink))
    }

    pub fn with_sink(dry_run: bool, sink: Arc<dyn EventSink>) -> Self {
        Self {
            dry_run,
            run_id: chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string(),
            sink,
            stats: Arc::new(RunStats::default()),
        }
    }

    pub fn emit(&self, event: Event) {
        self.stats.record(&event);
        self.sink.emit(&event);
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}

/// Sink that keeps every event, for assertions in tests
#[derive(Debug, Default)]
pub struct MemorySink {
    events: std::sync::Mutex<Vec<Event>>,
}

impl MemorySink {
    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &Event) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_are_counted_and_forwarded() {
        let sink = Arc::new(MemorySink::default());
        let ctx = RunContext::with_sink(false, sink.clone());

        ctx.emit(Event::ReconcileStarted {
            repo: "acme/a".to_string(),
            destination: "local:/tmp".to_string(),
        });
        ctx.emit(Event::ReconcileSucceeded {
            repo: "acme/a".to_string(),
            destination: "local:/tmp".to_string(),
        });
        ctx.emit(Event::ObjectPruned {
            destination: "s3".to_string(),
            key: "a/stale".to_string(),
        });

        let stats = ctx.stats();
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.pruned, 1);
        assert_eq!(stats.failed, 0);
        assert_eq!(sink.events().len(), 3);
    }

    #[test]
    fn test_clones_share_stats() {
        let ctx = RunContext::new(true);
        let clone = ctx.clone();

        clone.emit(Event::ReconcileFailed {
            repo: "acme/a".to_string(),
            destination: "gitea:x".to_string(),
            error: "boom".to_string(),
        });

        assert!(ctx.dry_run);
        assert_eq!(ctx.stats().failed, 1);
    }
}
