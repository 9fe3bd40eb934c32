//! Persisted record types.
//!
//! All types are serializable to/from JSON for storage in redb tables.

use pulse_core::Bucket;
use serde::{Deserialize, Serialize};

/// Unique identifier for a guarded upstream dependency.
pub type DependencyId = String;

// ── Buckets ────────────────────────────────────────────────────────

/// A bucket as stored, with its physical expiry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredBucket {
    pub bucket: Bucket,
    /// Unix timestamp (seconds) after which the record may be purged.
    pub expires_at: i64,
}

/// One incremental update produced by the write fanout.
///
/// `bucket` is the delta (usually a single-score bucket) that is merged
/// into whatever already exists at the same key and bucket start.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketUpsert {
    pub bucket: Bucket,
    pub expires_at: i64,
}

/// Outcome of a batch upsert. Failed updates did not touch the store and
/// may be retried on their own.
#[derive(Debug, Default)]
pub struct UpsertReport {
    /// Post-merge state of every applied update.
    pub applied: Vec<Bucket>,
    pub failed: Vec<FailedUpsert>,
}

#[derive(Debug, Clone)]
pub struct FailedUpsert {
    pub upsert: BucketUpsert,
    pub error: String,
}

// ── Guards ─────────────────────────────────────────────────────────

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    /// Numeric encoding for gauges.
    pub fn as_gauge(self) -> u8 {
        match self {
            BreakerState::Closed => 0,
            BreakerState::Open => 1,
            BreakerState::HalfOpen => 2,
        }
    }
}

/// Persisted circuit breaker state for one dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerRecord {
    pub dependency_id: DependencyId,
    pub state: BreakerState,
    pub failure_count: u32,
    /// When the first failure of the current window was counted.
    pub failure_window_start: Option<i64>,
    pub opened_at: Option<i64>,
    pub updated_at: i64,
}

impl BreakerRecord {
    /// A fresh, closed breaker.
    pub fn closed(dependency_id: &str, now: i64) -> Self {
        Self {
            dependency_id: dependency_id.to_string(),
            state: BreakerState::Closed,
            failure_count: 0,
            failure_window_start: None,
            opened_at: None,
            updated_at: now,
        }
    }
}

/// Persisted quota consumption for one dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaRecord {
    pub dependency_id: DependencyId,
    pub period_secs: i64,
    pub limit: u64,
    pub used: u64,
    pub reset_at: i64,
}

impl QuotaRecord {
    /// A fresh quota period starting at `now`.
    pub fn new(dependency_id: &str, limit: u64, period_secs: i64, now: i64) -> Self {
        Self {
            dependency_id: dependency_id.to_string(),
            period_secs,
            limit,
            used: 0,
            reset_at: now + period_secs,
        }
    }

    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.used)
    }
}
