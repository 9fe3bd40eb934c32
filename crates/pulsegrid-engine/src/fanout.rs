//! Write fanout: one raw score becomes one incremental update per
//! resolution, submitted as a single batch.
//!
//! Keys that fail are retried on their own with exponential backoff;
//! keys that succeed are never rewritten. A key that runs out of attempts
//! is counted and logged, and the rest of the write stands.

use std::sync::Arc;
use std::time::Duration;

use pulse_core::config::FanoutConfig;
use pulse_core::{Bucket, RawScore, Resolution};
use pulsegrid_metrics::EngineMetrics;
use pulsegrid_state::{BucketUpsert, FailedUpsert, TimeseriesStore};
use tracing::{debug, error, warn};

/// Build the per-resolution updates for `score`.
///
/// Always yields one update per resolution, each aligned to its window and
/// expiring one retention period after `now`.
pub fn fanout(score: &RawScore, now: i64) -> Vec<BucketUpsert> {
    Resolution::ALL
        .iter()
        .map(|&resolution| BucketUpsert {
            bucket: Bucket::from_score(score, resolution),
            expires_at: now + resolution.ttl_secs(),
        })
        .collect()
}

/// Backoff schedule for per-key retries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    pub maximum_interval: Duration,
    /// Attempts per key, including the first.
    pub maximum_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::from(&FanoutConfig::default())
    }
}

impl From<&FanoutConfig> for RetryPolicy {
    fn from(config: &FanoutConfig) -> Self {
        Self {
            initial_interval: Duration::from_millis(config.initial_backoff_ms),
            backoff_coefficient: 2.0,
            maximum_interval: Duration::from_millis(config.max_backoff_ms),
            maximum_attempts: config.max_attempts.max(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1 for the first retry).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self
            .backoff_coefficient
            .powi(retry.saturating_sub(1).min(64) as i32);
        let millis = (self.initial_interval.as_millis() as f64 * factor)
            .min(self.maximum_interval.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }
}

/// Result of fanning out one score.
#[derive(Debug, Default)]
pub struct FanoutOutcome {
    /// Post-merge buckets, one per resolution that was written.
    pub applied: Vec<Bucket>,
    /// Updates given up on after the final attempt.
    pub exhausted: Vec<FailedUpsert>,
}

impl FanoutOutcome {
    pub fn is_complete(&self) -> bool {
        self.exhausted.is_empty()
    }
}

pub struct FanoutWriter {
    store: Arc<dyn TimeseriesStore>,
    policy: RetryPolicy,
    metrics: Arc<EngineMetrics>,
}

impl FanoutWriter {
    pub fn new(
        store: Arc<dyn TimeseriesStore>,
        policy: RetryPolicy,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            store,
            policy,
            metrics,
        }
    }

    /// Fan `score` out to every resolution and write it.
    pub async fn write(&self, score: &RawScore, now: i64) -> FanoutOutcome {
        self.write_batch(fanout(score, now)).await
    }

    /// Submit `pending` and retry whatever fails until it succeeds or the
    /// attempts run out.
    pub async fn write_batch(&self, mut pending: Vec<BucketUpsert>) -> FanoutOutcome {
        let mut outcome = FanoutOutcome::default();
        let mut attempt = 1;

        while !pending.is_empty() {
            let failed = match self.store.batch_upsert(&pending) {
                Ok(report) => {
                    self.metrics.record_upserts_applied(report.applied.len());
                    outcome.applied.extend(report.applied);
                    report.failed
                }
                // Nothing in the batch was committed.
                Err(e) => pending
                    .drain(..)
                    .map(|upsert| FailedUpsert {
                        upsert,
                        error: e.to_string(),
                    })
                    .collect(),
            };

            if failed.is_empty() {
                break;
            }
            if attempt >= self.policy.maximum_attempts {
                for f in &failed {
                    error!(
                        key = %f.upsert.bucket.key(),
                        bucket_start = f.upsert.bucket.bucket_start,
                        attempts = attempt,
                        error = %f.error,
                        "bucket upsert abandoned"
                    );
                }
                self.metrics.record_upserts_exhausted(failed.len());
                outcome.exhausted = failed;
                break;
            }

            let delay = self.policy.delay_for(attempt);
            warn!(
                failed = failed.len(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                "retrying failed bucket upserts"
            );
            self.metrics.record_upserts_retried(failed.len());
            tokio::time::sleep(delay).await;
            pending = failed.into_iter().map(|f| f.upsert).collect();
            attempt += 1;
        }

        debug!(
            applied = outcome.applied.len(),
            exhausted = outcome.exhausted.len(),
            "fanout complete"
        );
        outcome
    }
}
