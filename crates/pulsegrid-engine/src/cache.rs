//! Resolution-aware read cache.
//!
//! One entry per (entity, resolution) series. An entry is fresh for one
//! resolution duration after insertion, so coarse series stay cached far
//! longer than fine ones. The cache is bounded and evicts in insertion
//! order. Expiry is lazy: an expired entry reads as a miss but stays in
//! place, available to [`ResolutionCache::get_stale`], until it is
//! overwritten or evicted.
//!
//! An entry populated up to the present is "live": the ingest path keeps
//! it current through [`ResolutionCache::patch_bucket`], so it also covers
//! later reads that extend to a newer `end`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use pulse_core::{Bucket, SharedClock, TimeseriesKey};
use pulsegrid_metrics::CacheGauges;
use tracing::debug;

/// Upper bound marking a series as live.
pub const LIVE_END: i64 = i64::MAX;

/// Cached buckets of one series over `[start, end]`, ascending.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedSeries {
    pub start: i64,
    pub end: i64,
    pub buckets: Vec<Bucket>,
}

impl CachedSeries {
    fn covers(&self, start: i64, end: i64) -> bool {
        self.start <= start && end <= self.end
    }

    /// Buckets starting in `[floor(start), end]`.
    fn slice(&self, first_start: i64, end: i64) -> Vec<Bucket> {
        self.buckets
            .iter()
            .filter(|b| b.bucket_start >= first_start && b.bucket_start <= end)
            .cloned()
            .collect()
    }
}

struct CacheEntry {
    series: CachedSeries,
    inserted_at: i64,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<TimeseriesKey, CacheEntry>,
    /// Insertion order for FIFO eviction.
    order: VecDeque<TimeseriesKey>,
}

impl CacheInner {
    fn remove(&mut self, key: &TimeseriesKey) {
        if self.entries.remove(key).is_some() {
            self.order.retain(|k| k != key);
        }
    }
}

pub struct ResolutionCache {
    inner: Mutex<CacheInner>,
    max_entries: usize,
    clock: SharedClock,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl ResolutionCache {
    pub fn new(max_entries: usize, clock: SharedClock) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            max_entries: max_entries.max(1),
            clock,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Fresh buckets for `key` over `[start, end]`, if a cached entry
    /// covers the whole range.
    pub fn get(&self, key: &TimeseriesKey, start: i64, end: i64) -> Option<Vec<Bucket>> {
        let now = self.clock.now();
        let ttl = key.resolution.duration_secs();
        let first_start = key.resolution.floor(start);
        let inner = self.inner.lock();

        let found = match inner.entries.get(key) {
            Some(entry) if now - entry.inserted_at >= ttl => {
                debug!(%key, "cache entry expired");
                None
            }
            Some(entry) if entry.series.covers(first_start, end) => {
                Some(entry.series.slice(first_start, end))
            }
            _ => None,
        };

        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    /// Last-known buckets for `key` in `[start, end]`, ignoring freshness
    /// and coverage. Used when the store cannot be read.
    pub fn get_stale(&self, key: &TimeseriesKey, start: i64, end: i64) -> Option<Vec<Bucket>> {
        let first_start = key.resolution.floor(start);
        let inner = self.inner.lock();
        inner
            .entries
            .get(key)
            .map(|entry| entry.series.slice(first_start, end))
    }

    /// Insert or overwrite the entry for `key`. An overwritten entry moves
    /// to the back of the eviction queue.
    pub fn set(&self, key: TimeseriesKey, mut series: CachedSeries) {
        let now = self.clock.now();
        series.start = key.resolution.floor(series.start);
        let mut inner = self.inner.lock();
        inner.remove(&key);
        while inner.entries.len() >= self.max_entries {
            let Some(oldest) = inner.order.pop_front() else {
                break;
            };
            inner.entries.remove(&oldest);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(key = %oldest, "cache entry evicted");
        }
        inner.order.push_back(key.clone());
        inner.entries.insert(
            key,
            CacheEntry {
                series,
                inserted_at: now,
            },
        );
    }

    /// Replace or insert `bucket` in its series if that series is cached
    /// and its range includes the bucket. Freshness is unchanged.
    pub fn patch_bucket(&self, bucket: &Bucket) -> bool {
        let key = bucket.key();
        let mut inner = self.inner.lock();
        let Some(entry) = inner.entries.get_mut(&key) else {
            return false;
        };
        let series = &mut entry.series;
        if bucket.bucket_start < series.start || bucket.bucket_start > series.end {
            return false;
        }
        match series
            .buckets
            .binary_search_by_key(&bucket.bucket_start, |b| b.bucket_start)
        {
            Ok(i) => series.buckets[i] = bucket.clone(),
            Err(i) => series.buckets.insert(i, bucket.clone()),
        }
        true
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `hits / (hits + misses)`, or 0 before any lookup.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }

    pub fn gauges(&self) -> CacheGauges {
        CacheGauges {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: self.len() as u64,
            hit_rate: self.hit_rate(),
        }
    }
}
