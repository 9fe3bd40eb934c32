//! Read path: cache first, then the store, with the in-progress bucket
//! attached separately.

use std::sync::Arc;
use std::time::Instant;

use pulse_core::{
    validate_entity_id, validate_timestamp, Bucket, BucketView, PartialBucket, Resolution,
    SharedClock, TimeseriesKey,
};
use pulsegrid_guard::GuardRegistry;
use pulsegrid_state::TimeseriesStore;
use serde::Serialize;
use tracing::{debug, warn};

use crate::cache::{CachedSeries, ResolutionCache, LIVE_END};
use crate::error::{EngineError, EngineResult};
use crate::partial::PartialComputer;

/// Response of a time-series query.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub entity: String,
    pub resolution: Resolution,
    /// Completed buckets, ascending by `bucket_start`.
    pub buckets: Vec<BucketView>,
    pub partial_bucket: Option<PartialBucket>,
    pub cache_hit: bool,
    /// Served from last-known data.
    pub degraded: bool,
    pub query_time_ms: f64,
}

pub struct QueryService {
    store: Arc<dyn TimeseriesStore>,
    cache: Arc<ResolutionCache>,
    partials: Arc<PartialComputer>,
    guards: Arc<GuardRegistry>,
    clock: SharedClock,
}

impl QueryService {
    pub fn new(
        store: Arc<dyn TimeseriesStore>,
        cache: Arc<ResolutionCache>,
        partials: Arc<PartialComputer>,
        guards: Arc<GuardRegistry>,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            cache,
            partials,
            guards,
            clock,
        }
    }

    /// Buckets of `entity_id` at `resolution` starting in
    /// `[floor(start), end]`.
    pub fn query(
        &self,
        entity_id: &str,
        resolution: Resolution,
        start: i64,
        end: i64,
    ) -> EngineResult<QueryResult> {
        validate_entity_id(entity_id)?;
        validate_timestamp(start)?;
        validate_timestamp(end)?;
        if start > end {
            return Err(EngineError::InvalidQuery(format!(
                "start {start} is after end {end}"
            )));
        }
        let started = Instant::now();
        let now = self.clock.now();
        let current_start = resolution.floor(now);
        let key = TimeseriesKey::new(entity_id, resolution);
        let mut degraded = self.guards.any_degraded();

        let (buckets, cache_hit) = match self.cache.get(&key, start, end) {
            Some(buckets) => (buckets, true),
            None => match self.store.range_query(entity_id, resolution, start, end) {
                Ok(buckets) => {
                    let series_end = if end >= current_start { LIVE_END } else { end };
                    self.cache.set(
                        key.clone(),
                        CachedSeries {
                            start,
                            end: series_end,
                            buckets: buckets.clone(),
                        },
                    );
                    (buckets, false)
                }
                Err(e) => {
                    let Some(stale) = self.cache.get_stale(&key, start, end) else {
                        return Err(EngineError::Unavailable(e.to_string()));
                    };
                    warn!(%key, error = %e, "store read failed, serving last-known buckets");
                    degraded = true;
                    (stale, false)
                }
            },
        };

        let buckets: Vec<BucketView> = buckets
            .into_iter()
            .filter(|b: &Bucket| b.bucket_start < current_start)
            .map(BucketView::from)
            .collect();

        let reaches_current = resolution.floor(start) <= current_start && end >= current_start;
        let partial_bucket = if reaches_current {
            match self.partials.compute_at(entity_id, resolution, now) {
                Ok(partial) => partial,
                Err(e) => {
                    warn!(%key, error = %e, "partial bucket unavailable");
                    degraded = true;
                    None
                }
            }
        } else {
            None
        };

        let query_time_ms = started.elapsed().as_secs_f64() * 1000.0;
        debug!(
            %key,
            buckets = buckets.len(),
            cache_hit,
            degraded,
            query_time_ms,
            "timeseries query"
        );
        Ok(QueryResult {
            entity: entity_id.to_string(),
            resolution,
            buckets,
            partial_bucket,
            cache_hit,
            degraded,
            query_time_ms,
        })
    }
}
