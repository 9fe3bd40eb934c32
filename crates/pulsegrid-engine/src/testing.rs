//! Shared fixtures for engine unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use pulse_core::{Bucket, RawScore, Resolution, SentimentLabel, TimeseriesKey};
use pulsegrid_state::{
    BucketUpsert, FailedUpsert, StateError, StateResult, StateStore, TimeseriesStore, UpsertReport,
};

/// 2024-01-01 10:35:00 UTC, on a 5m boundary.
pub const T1035: i64 = 1_704_105_300;

pub fn score(entity: &str, value: f64, ts: i64) -> RawScore {
    let label = if value > 0.05 {
        SentimentLabel::Positive
    } else if value < -0.05 {
        SentimentLabel::Negative
    } else {
        SentimentLabel::Neutral
    };
    RawScore::new(entity, value, label, ts).unwrap()
}

/// Wraps a real store and injects failures.
pub struct FlakyStore {
    inner: StateStore,
    /// Remaining per-key failures by resolution.
    failing: Mutex<HashMap<Resolution, u32>>,
    /// Remaining whole-batch failures.
    failing_batches: Mutex<u32>,
    fail_reads: AtomicBool,
}

impl FlakyStore {
    pub fn new(inner: StateStore) -> Self {
        Self {
            inner,
            failing: Mutex::new(HashMap::new()),
            failing_batches: Mutex::new(0),
            fail_reads: AtomicBool::new(false),
        }
    }

    pub fn fail_resolution(self, resolution: Resolution, times: u32) -> Self {
        self.failing.lock().insert(resolution, times);
        self
    }

    pub fn fail_batches(self, times: u32) -> Self {
        *self.failing_batches.lock() = times;
        self
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    fn check_reads(&self) -> StateResult<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StateError::Unavailable("reads disabled".to_string()));
        }
        Ok(())
    }
}

impl TimeseriesStore for FlakyStore {
    fn get(&self, key: &TimeseriesKey, bucket_start: i64) -> StateResult<Option<Bucket>> {
        self.check_reads()?;
        self.inner.get(key, bucket_start)
    }

    fn range_query(
        &self,
        entity_id: &str,
        resolution: Resolution,
        start: i64,
        end: i64,
    ) -> StateResult<Vec<Bucket>> {
        self.check_reads()?;
        self.inner.range_query(entity_id, resolution, start, end)
    }

    fn batch_upsert(&self, updates: &[BucketUpsert]) -> StateResult<UpsertReport> {
        {
            let mut batches = self.failing_batches.lock();
            if *batches > 0 {
                *batches -= 1;
                return Err(StateError::Transaction("injected commit failure".to_string()));
            }
        }
        let mut passing = Vec::new();
        let mut failed = Vec::new();
        {
            let mut failing = self.failing.lock();
            for upsert in updates {
                match failing.get_mut(&upsert.bucket.resolution) {
                    Some(remaining) if *remaining > 0 => {
                        *remaining -= 1;
                        failed.push(FailedUpsert {
                            upsert: upsert.clone(),
                            error: "injected write failure".to_string(),
                        });
                    }
                    _ => passing.push(upsert.clone()),
                }
            }
        }
        let mut report = self.inner.batch_upsert(&passing)?;
        report.failed.extend(failed);
        Ok(report)
    }
}
