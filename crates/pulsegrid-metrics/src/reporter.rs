//! Periodic metrics summary in the logs.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::collector::EngineSnapshot;

/// Anything that can produce a full engine snapshot.
pub trait SnapshotSource: Send + Sync {
    fn snapshot(&self) -> EngineSnapshot;
}

/// Logs a summary of engine activity every `interval`.
pub struct MetricsReporter {
    source: Arc<dyn SnapshotSource>,
    interval: Duration,
}

/// Activity between two snapshots.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Delta {
    pub ingest_rate: f64,
    pub upserts_exhausted: u64,
    pub events_dispatched: u64,
    pub events_dropped: u64,
}

impl Delta {
    pub fn between(prev: &EngineSnapshot, next: &EngineSnapshot, interval: Duration) -> Self {
        let secs = interval.as_secs_f64().max(f64::EPSILON);
        let ingested = next.scores_ingested.saturating_sub(prev.scores_ingested);
        Self {
            ingest_rate: ingested as f64 / secs,
            upserts_exhausted: next.upserts_exhausted.saturating_sub(prev.upserts_exhausted),
            events_dispatched: next.events_dispatched.saturating_sub(prev.events_dispatched),
            events_dropped: next.events_dropped.saturating_sub(prev.events_dropped),
        }
    }
}

impl MetricsReporter {
    pub fn new(source: Arc<dyn SnapshotSource>, interval: Duration) -> Self {
        Self { source, interval }
    }

    /// Run the reporting loop until shutdown signal.
    pub async fn run(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "metrics reporter started"
        );
        let mut prev = self.source.snapshot();

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    let next = self.source.snapshot();
                    let delta = Delta::between(&prev, &next, self.interval);
                    info!(
                        ingest_rate = format_args!("{:.2}", delta.ingest_rate),
                        exhausted = delta.upserts_exhausted,
                        dispatched = delta.events_dispatched,
                        dropped = delta.events_dropped,
                        subscribers = next.subscribers,
                        cache_hit_rate = format_args!("{:.3}", next.cache.hit_rate),
                        "engine activity"
                    );
                    prev = next;
                }
                _ = shutdown.changed() => {
                    debug!("metrics reporter shutting down");
                    break;
                }
            }
        }
    }
}
