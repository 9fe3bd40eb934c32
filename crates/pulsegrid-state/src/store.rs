//! StateStore: redb-backed persistence for PulseGrid.
//!
//! Provides the bucket store, the raw score log, and guard records. All
//! values are JSON-serialized into redb's `&[u8]` value columns. The store
//! supports both on-disk and in-memory backends (the latter for testing).

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use pulse_core::{Bucket, RawScore, Resolution, TimeseriesKey};
use redb::{Database, ReadableDatabase, ReadableTable, Table, TableHandle};
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::repository::{GuardRepository, RawScoreLog, TimeseriesStore};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    /// Disambiguates raw scores sharing an entity and timestamp.
    raw_seq: Arc<AtomicU64>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::with_db(db);
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::with_db(db);
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn with_db(db: Database) -> Self {
        // Seeded from the wall clock so sequence numbers keep increasing
        // across restarts of an on-disk store.
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        Self {
            db: Arc::new(db),
            raw_seq: Arc::new(AtomicU64::new(seed)),
        }
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        txn.open_table(BUCKETS).map_err(map_err!(Table))?;
        txn.open_table(RAW_SCORES).map_err(map_err!(Table))?;
        txn.open_table(BREAKERS).map_err(map_err!(Table))?;
        txn.open_table(QUOTAS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Retention ──────────────────────────────────────────────────

    /// Delete bucket records whose `expires_at <= now`. Returns number deleted.
    ///
    /// Records that fail to deserialize are left in place and logged.
    pub fn purge_expired_buckets(&self, now: i64) -> StateResult<u32> {
        let keys: Vec<String> = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(BUCKETS).map_err(map_err!(Table))?;
            let mut expired = Vec::new();
            for entry in table.iter().map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                match serde_json::from_slice::<StoredBucket>(value.value()) {
                    Ok(stored) if stored.expires_at <= now => {
                        expired.push(key.value().to_string());
                    }
                    Ok(_) => {}
                    Err(e) => warn!(key = key.value(), error = %e, "unreadable bucket record"),
                }
            }
            expired
        };
        self.remove_keys(BUCKETS, &keys)
    }

    /// Delete raw scores with `timestamp < cutoff`. Returns number deleted.
    pub fn purge_raw_before(&self, cutoff: i64) -> StateResult<u32> {
        let keys: Vec<String> = {
            let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
            let table = txn.open_table(RAW_SCORES).map_err(map_err!(Table))?;
            table
                .iter()
                .map_err(map_err!(Read))?
                .filter_map(|entry| {
                    let (key, _) = entry.ok()?;
                    let k = key.value();
                    let (_, ts) = parse_raw_key(k)?;
                    (ts < cutoff).then(|| k.to_string())
                })
                .collect()
        };
        self.remove_keys(RAW_SCORES, &keys)
    }

    fn remove_keys(&self, definition: JsonTable, keys: &[String]) -> StateResult<u32> {
        if keys.is_empty() {
            return Ok(0);
        }
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(definition).map_err(map_err!(Table))?;
            for key in keys {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(table = definition.name(), count = keys.len(), "records purged");
        Ok(keys.len() as u32)
    }

    // ── Guard listings ─────────────────────────────────────────────

    pub fn list_breakers(&self) -> StateResult<Vec<BreakerRecord>> {
        self.list_records(BREAKERS)
    }

    pub fn list_quotas(&self) -> StateResult<Vec<QuotaRecord>> {
        self.list_records(QUOTAS)
    }

    fn list_records<T: serde::de::DeserializeOwned>(
        &self,
        definition: JsonTable,
    ) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(definition).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
        Ok(results)
    }

    fn get_record<T: serde::de::DeserializeOwned>(
        &self,
        definition: JsonTable,
        key: &str,
    ) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(definition).map_err(map_err!(Table))?;
        match table.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let record = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn put_record<T: serde::Serialize>(
        &self,
        definition: JsonTable,
        key: &str,
        record: &T,
    ) -> StateResult<()> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(definition).map_err(map_err!(Table))?;
            table.insert(key, value.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }
}

/// Merge one update into its stored bucket inside an open write transaction.
fn merge_into(
    table: &mut Table<'_, &'static str, &'static [u8]>,
    upsert: &BucketUpsert,
) -> StateResult<Bucket> {
    let key = bucket_key(&upsert.bucket.key(), upsert.bucket.bucket_start);
    let existing: Option<StoredBucket> = match table.get(key.as_str()).map_err(map_err!(Read))? {
        Some(guard) => Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?),
        None => None,
    };

    let stored = match existing {
        Some(mut stored) => {
            stored.bucket.merge(&upsert.bucket).map_err(map_err!(Merge))?;
            stored.expires_at = stored.expires_at.max(upsert.expires_at);
            stored
        }
        None => {
            let mut bucket = upsert.bucket.clone();
            bucket.is_partial = false;
            StoredBucket {
                bucket,
                expires_at: upsert.expires_at,
            }
        }
    };

    let value = serde_json::to_vec(&stored).map_err(map_err!(Serialize))?;
    table
        .insert(key.as_str(), value.as_slice())
        .map_err(map_err!(Write))?;
    Ok(stored.bucket)
}

impl TimeseriesStore for StateStore {
    fn get(&self, key: &TimeseriesKey, bucket_start: i64) -> StateResult<Option<Bucket>> {
        let stored: Option<StoredBucket> =
            self.get_record(BUCKETS, &bucket_key(key, bucket_start))?;
        Ok(stored.map(|s| s.bucket))
    }

    fn range_query(
        &self,
        entity_id: &str,
        resolution: Resolution,
        start: i64,
        end: i64,
    ) -> StateResult<Vec<Bucket>> {
        let first = resolution.floor(start);
        if first > end {
            return Ok(Vec::new());
        }
        let key = TimeseriesKey::new(entity_id, resolution);
        let lo = bucket_key(&key, first);
        let hi = bucket_key(&key, end);

        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(BUCKETS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table
            .range(lo.as_str()..=hi.as_str())
            .map_err(map_err!(Read))?
        {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let stored: StoredBucket =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(stored.bucket);
        }
        Ok(results)
    }

    fn batch_upsert(&self, updates: &[BucketUpsert]) -> StateResult<UpsertReport> {
        let mut report = UpsertReport::default();
        if updates.is_empty() {
            return Ok(report);
        }
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(BUCKETS).map_err(map_err!(Table))?;
            for upsert in updates {
                match merge_into(&mut table, upsert) {
                    Ok(bucket) => report.applied.push(bucket),
                    Err(e) => {
                        warn!(
                            key = %upsert.bucket.key(),
                            bucket_start = upsert.bucket.bucket_start,
                            error = %e,
                            "bucket upsert failed"
                        );
                        report.failed.push(FailedUpsert {
                            upsert: upsert.clone(),
                            error: e.to_string(),
                        });
                    }
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            applied = report.applied.len(),
            failed = report.failed.len(),
            "bucket batch committed"
        );
        Ok(report)
    }
}

impl RawScoreLog for StateStore {
    fn append_raw(&self, score: &RawScore) -> StateResult<()> {
        let seq = self.raw_seq.fetch_add(1, Ordering::Relaxed);
        let key = raw_key(&score.entity_id, score.timestamp, seq);
        self.put_record(RAW_SCORES, &key, score)
    }

    fn raw_scores_between(
        &self,
        entity_id: &str,
        start: i64,
        end: i64,
    ) -> StateResult<Vec<RawScore>> {
        if start >= end {
            return Ok(Vec::new());
        }
        let lo = raw_key_prefix(entity_id, start);
        let hi = raw_key_prefix(entity_id, end);

        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RAW_SCORES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table
            .range(lo.as_str()..hi.as_str())
            .map_err(map_err!(Read))?
        {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let score: RawScore =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(score);
        }
        Ok(results)
    }

    fn entities_since(&self, since: i64) -> StateResult<Vec<(String, i64)>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RAW_SCORES).map_err(map_err!(Table))?;
        let mut latest: BTreeMap<String, i64> = BTreeMap::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            if let Some((entity, ts)) = parse_raw_key(key.value()) {
                if ts >= since {
                    latest
                        .entry(entity.to_string())
                        .and_modify(|last| *last = (*last).max(ts))
                        .or_insert(ts);
                }
            }
        }
        Ok(latest.into_iter().collect())
    }
}

impl GuardRepository for StateStore {
    fn load_breaker(&self, dependency_id: &str) -> StateResult<Option<BreakerRecord>> {
        self.get_record(BREAKERS, dependency_id)
    }

    fn save_breaker(&self, record: &BreakerRecord) -> StateResult<()> {
        self.put_record(BREAKERS, &record.dependency_id, record)?;
        debug!(dependency = %record.dependency_id, state = ?record.state, "breaker stored");
        Ok(())
    }

    fn load_quota(&self, dependency_id: &str) -> StateResult<Option<QuotaRecord>> {
        self.get_record(QUOTAS, dependency_id)
    }

    fn save_quota(&self, record: &QuotaRecord) -> StateResult<()> {
        self.put_record(QUOTAS, &record.dependency_id, record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::SentimentLabel;

    // 2024-01-01 10:35:00 UTC
    const T1035: i64 = 1_704_105_300;

    fn score(entity: &str, value: f64, ts: i64) -> RawScore {
        RawScore::new(entity, value, SentimentLabel::Neutral, ts).unwrap()
    }

    fn upsert(entity: &str, value: f64, ts: i64, res: Resolution) -> BucketUpsert {
        BucketUpsert {
            bucket: Bucket::from_score(&score(entity, value, ts), res),
            expires_at: ts + res.ttl_secs(),
        }
    }

    // ── Buckets ────────────────────────────────────────────────────

    #[test]
    fn upsert_then_get() {
        let store = StateStore::open_in_memory().unwrap();
        let report = store
            .batch_upsert(&[upsert("AAPL", 0.5, T1035 + 10, Resolution::FiveMinutes)])
            .unwrap();
        assert_eq!(report.applied.len(), 1);
        assert!(report.failed.is_empty());

        let key = TimeseriesKey::new("AAPL", Resolution::FiveMinutes);
        let bucket = store.get(&key, T1035).unwrap().unwrap();
        assert_eq!(bucket.count, 1);
        assert_eq!(bucket.open, 0.5);
        assert!(store.get(&key, T1035 + 300).unwrap().is_none());
    }

    #[test]
    fn upserts_merge_incrementally() {
        let store = StateStore::open_in_memory().unwrap();
        let res = Resolution::FiveMinutes;
        // Out of order arrival: 10:35:20 before 10:35:10.
        for (value, offset) in [(0.9, 20), (0.6, 10), (0.3, 30), (0.7, 40)] {
            store
                .batch_upsert(&[upsert("AAPL", value, T1035 + offset, res)])
                .unwrap();
        }
        let bucket = store
            .get(&TimeseriesKey::new("AAPL", res), T1035)
            .unwrap()
            .unwrap();
        assert_eq!(bucket.open, 0.6);
        assert_eq!(bucket.high, 0.9);
        assert_eq!(bucket.low, 0.3);
        assert_eq!(bucket.close, 0.7);
        assert_eq!(bucket.count, 4);
        assert!((bucket.avg() - 0.625).abs() < 1e-12);
    }

    #[test]
    fn range_query_is_ascending_and_bounded() {
        let store = StateStore::open_in_memory().unwrap();
        let res = Resolution::OneMinute;
        let updates: Vec<BucketUpsert> = [5, 3, 1, 0, 4]
            .iter()
            .map(|m| upsert("AAPL", 0.1, T1035 + m * 60 + 5, res))
            .collect();
        store.batch_upsert(&updates).unwrap();
        // Another entity and resolution must not leak into the scan.
        store
            .batch_upsert(&[
                upsert("AAPLX", 0.1, T1035 + 65, res),
                upsert("AAPL", 0.1, T1035 + 65, Resolution::FiveMinutes),
            ])
            .unwrap();

        // start is floored: 10:36:30 -> 10:36
        let buckets = store
            .range_query("AAPL", res, T1035 + 90, T1035 + 4 * 60)
            .unwrap();
        let starts: Vec<i64> = buckets.iter().map(|b| b.bucket_start).collect();
        assert_eq!(starts, vec![T1035 + 60, T1035 + 180, T1035 + 240]);
        assert!(buckets.iter().all(|b| b.entity_id == "AAPL"));

        assert!(store.range_query("AAPL", res, T1035 + 600, T1035).unwrap().is_empty());
    }

    #[test]
    fn batch_isolates_per_key_failures() {
        let store = StateStore::open_in_memory().unwrap();
        let good = upsert("AAPL", 0.2, T1035 + 1, Resolution::OneHour);
        store.batch_upsert(&[good.clone()]).unwrap();
        let mut bad = good.clone();
        bad.bucket.entity_id = "MSFT".to_string();
        let key = bucket_key(&good.bucket.key(), good.bucket.bucket_start);
        {
            // Plant a record under MSFT's key that belongs to AAPL.
            let txn = store.db.begin_write().unwrap();
            {
                let mut table = txn.open_table(BUCKETS).unwrap();
                let planted = StoredBucket {
                    bucket: good.bucket.clone(),
                    expires_at: good.expires_at,
                };
                let msft_key = bucket_key(&bad.bucket.key(), bad.bucket.bucket_start);
                let value = serde_json::to_vec(&planted).unwrap();
                table.insert(msft_key.as_str(), value.as_slice()).unwrap();
            }
            txn.commit().unwrap();
        }

        let report = store.batch_upsert(&[good.clone(), bad.clone()]).unwrap();
        assert_eq!(report.applied.len(), 1);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].upsert, bad);
        assert!(report.failed[0].error.contains("merge"));

        let stored: StoredBucket = store.get_record(BUCKETS, &key).unwrap().unwrap();
        assert_eq!(stored.bucket.count, 2);
    }

    #[test]
    fn purge_expired_buckets_only() {
        let store = StateStore::open_in_memory().unwrap();
        let short = upsert("AAPL", 0.1, T1035, Resolution::OneMinute);
        let long = upsert("AAPL", 0.1, T1035, Resolution::TwentyFourHours);
        store.batch_upsert(&[short.clone(), long.clone()]).unwrap();

        assert_eq!(store.purge_expired_buckets(T1035).unwrap(), 0);
        assert_eq!(store.purge_expired_buckets(short.expires_at).unwrap(), 1);

        let key = TimeseriesKey::new("AAPL", Resolution::OneMinute);
        assert!(store.get(&key, T1035).unwrap().is_none());
        let key = TimeseriesKey::new("AAPL", Resolution::TwentyFourHours);
        assert!(store.get(&key, long.bucket.bucket_start).unwrap().is_some());
    }

    // ── Raw scores ─────────────────────────────────────────────────

    #[test]
    fn raw_scores_window_is_half_open() {
        let store = StateStore::open_in_memory().unwrap();
        for ts in [T1035 - 1, T1035, T1035 + 10, T1035 + 10, T1035 + 300] {
            store.append_raw(&score("AAPL", 0.1, ts)).unwrap();
        }
        store.append_raw(&score("MSFT", 0.1, T1035 + 5)).unwrap();

        let scores = store.raw_scores_between("AAPL", T1035, T1035 + 300).unwrap();
        let ts: Vec<i64> = scores.iter().map(|s| s.timestamp).collect();
        assert_eq!(ts, vec![T1035, T1035 + 10, T1035 + 10]);
        assert!(store.raw_scores_between("AAPL", T1035, T1035).unwrap().is_empty());
    }

    #[test]
    fn raw_scores_keep_arrival_order_on_ties() {
        let store = StateStore::open_in_memory().unwrap();
        store.append_raw(&score("AAPL", 0.1, T1035)).unwrap();
        store.append_raw(&score("AAPL", 0.2, T1035)).unwrap();
        let scores = store.raw_scores_between("AAPL", T1035, T1035 + 1).unwrap();
        let values: Vec<f64> = scores.iter().map(|s| s.value).collect();
        assert_eq!(values, vec![0.1, 0.2]);
    }

    #[test]
    fn purge_raw_and_list_entities() {
        let store = StateStore::open_in_memory().unwrap();
        store.append_raw(&score("AAPL", 0.1, T1035 - 100)).unwrap();
        store.append_raw(&score("MSFT", 0.1, T1035)).unwrap();
        store.append_raw(&score("TSLA", 0.1, T1035 + 1)).unwrap();

        store.append_raw(&score("TSLA", 0.3, T1035 + 40)).unwrap();
        store.append_raw(&score("TSLA", 0.2, T1035 + 7)).unwrap();

        let expected = vec![("MSFT".to_string(), T1035), ("TSLA".to_string(), T1035 + 40)];
        assert_eq!(store.entities_since(T1035).unwrap(), expected);
        assert_eq!(store.purge_raw_before(T1035).unwrap(), 1);
        assert_eq!(store.entities_since(i64::MIN).unwrap(), expected);
        assert_eq!(
            store.entities_since(T1035 + 41).unwrap(),
            Vec::<(String, i64)>::new()
        );
    }

    // ── Guards ─────────────────────────────────────────────────────

    #[test]
    fn guard_records_round_trip() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.load_breaker("api").unwrap().is_none());

        let mut breaker = BreakerRecord::closed("api", T1035);
        breaker.state = BreakerState::Open;
        breaker.opened_at = Some(T1035);
        store.save_breaker(&breaker).unwrap();
        assert_eq!(store.load_breaker("api").unwrap(), Some(breaker));

        let mut quota = QuotaRecord::new("api", 100, 86_400, T1035);
        quota.used = 42;
        store.save_quota(&quota).unwrap();
        assert_eq!(store.load_quota("api").unwrap().unwrap().remaining(), 58);

        assert_eq!(store.list_breakers().unwrap().len(), 1);
        assert_eq!(store.list_quotas().unwrap().len(), 1);
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("pulse.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store
                .batch_upsert(&[upsert("AAPL", 0.4, T1035, Resolution::OneHour)])
                .unwrap();
            store.append_raw(&score("AAPL", 0.4, T1035)).unwrap();
        }

        let store = StateStore::open(&db_path).unwrap();
        let key = TimeseriesKey::new("AAPL", Resolution::OneHour);
        let start = Resolution::OneHour.floor(T1035);
        assert_eq!(store.get(&key, start).unwrap().unwrap().close, 0.4);
        assert_eq!(
            store.raw_scores_between("AAPL", T1035, T1035 + 1).unwrap().len(),
            1
        );
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();
        assert!(store.range_query("X", Resolution::OneMinute, 0, 1_000).unwrap().is_empty());
        assert!(store.batch_upsert(&[]).unwrap().applied.is_empty());
        assert_eq!(store.purge_expired_buckets(i64::MAX).unwrap(), 0);
        assert_eq!(store.purge_raw_before(i64::MAX).unwrap(), 0);
        assert!(store.list_breakers().unwrap().is_empty());
    }
}
