//! Engine counters.
//!
//! Lock-free atomics updated from the ingest path, the fanout writer and
//! the dispatcher. Gauges owned by other components (cache statistics,
//! guard states) are filled in when a snapshot is assembled.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Monotonic counters shared across the engine.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    scores_ingested: AtomicU64,
    scores_rejected: AtomicU64,
    upserts_applied: AtomicU64,
    upserts_retried: AtomicU64,
    upserts_exhausted: AtomicU64,
    events_dispatched: AtomicU64,
    events_dropped: AtomicU64,
    subscribers: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_ingested(&self) {
        self.scores_ingested.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.scores_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_upserts_applied(&self, n: usize) {
        self.upserts_applied.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_upserts_retried(&self, n: usize) {
        self.upserts_retried.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Keys whose retries ran out.
    pub fn record_upserts_exhausted(&self, n: usize) {
        self.upserts_exhausted.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_dispatched(&self, n: usize) {
        self.events_dispatched.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, n: usize) {
        self.events_dropped.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn set_subscribers(&self, n: usize) {
        self.subscribers.store(n as u64, Ordering::Relaxed);
    }

    /// Counter values only; the remaining snapshot fields stay at their defaults.
    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            scores_ingested: self.scores_ingested.load(Ordering::Relaxed),
            scores_rejected: self.scores_rejected.load(Ordering::Relaxed),
            upserts_applied: self.upserts_applied.load(Ordering::Relaxed),
            upserts_retried: self.upserts_retried.load(Ordering::Relaxed),
            upserts_exhausted: self.upserts_exhausted.load(Ordering::Relaxed),
            events_dispatched: self.events_dispatched.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            subscribers: self.subscribers.load(Ordering::Relaxed),
            ..EngineSnapshot::default()
        }
    }
}

/// Cache statistics as seen at snapshot time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheGauges {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: u64,
    pub hit_rate: f64,
}

/// Breaker and quota state for one dependency.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GuardGauge {
    pub dependency: String,
    /// 0 = closed, 1 = open, 2 = half-open.
    pub breaker_state: Option<u8>,
    pub quota_used: Option<u64>,
    pub quota_limit: Option<u64>,
}

/// Point-in-time view of everything `/metrics` exposes.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EngineSnapshot {
    pub scores_ingested: u64,
    pub scores_rejected: u64,
    pub upserts_applied: u64,
    pub upserts_retried: u64,
    pub upserts_exhausted: u64,
    pub events_dispatched: u64,
    pub events_dropped: u64,
    pub subscribers: u64,
    pub cache: CacheGauges,
    pub guards: Vec<GuardGauge>,
}
