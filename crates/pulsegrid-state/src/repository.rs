//! Storage seams consumed by the engine and guard crates.
//!
//! [`StateStore`](crate::StateStore) implements all three traits; tests in
//! other crates wrap or replace them to inject failures.

use pulse_core::{Bucket, RawScore, Resolution, TimeseriesKey};

use crate::error::StateResult;
use crate::types::{BreakerRecord, BucketUpsert, QuotaRecord, UpsertReport};

/// Keyed bucket storage, one record per (entity, resolution, bucket_start).
pub trait TimeseriesStore: Send + Sync {
    fn get(&self, key: &TimeseriesKey, bucket_start: i64) -> StateResult<Option<Bucket>>;

    /// Buckets whose `bucket_start` lies in `[floor(start), end]`, ascending.
    fn range_query(
        &self,
        entity_id: &str,
        resolution: Resolution,
        start: i64,
        end: i64,
    ) -> StateResult<Vec<Bucket>>;

    /// Merge each update into the stored bucket at its key.
    ///
    /// Per-update failures are reported in [`UpsertReport::failed`] and
    /// leave that key untouched; an `Err` means nothing was applied.
    fn batch_upsert(&self, updates: &[BucketUpsert]) -> StateResult<UpsertReport>;
}

/// Append-only log of ingested scores.
pub trait RawScoreLog: Send + Sync {
    fn append_raw(&self, score: &RawScore) -> StateResult<()>;

    /// Scores with `start <= timestamp < end`, in timestamp then arrival order.
    fn raw_scores_between(&self, entity_id: &str, start: i64, end: i64)
    -> StateResult<Vec<RawScore>>;

    /// Entities with at least one score at or after `since`, each paired
    /// with its latest score timestamp. Sorted by entity id.
    fn entities_since(&self, since: i64) -> StateResult<Vec<(String, i64)>>;
}

/// Persistence for circuit breaker and quota state.
pub trait GuardRepository: Send + Sync {
    fn load_breaker(&self, dependency_id: &str) -> StateResult<Option<BreakerRecord>>;
    fn save_breaker(&self, record: &BreakerRecord) -> StateResult<()>;
    fn load_quota(&self, dependency_id: &str) -> StateResult<Option<QuotaRecord>>;
    fn save_quota(&self, record: &QuotaRecord) -> StateResult<()>;
}
