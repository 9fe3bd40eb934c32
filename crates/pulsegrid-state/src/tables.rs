//! redb table definitions and key encoding for the PulseGrid state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized records).
//! Time-ordered keys embed timestamps through [`sortable_ts`] so that
//! lexicographic key order equals chronological order, which lets range
//! scans return buckets ascending by `bucket_start`.

use pulse_core::TimeseriesKey;
use redb::TableDefinition;

/// Shape shared by every table: string key, JSON value.
pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Aggregated buckets keyed by `{entity}#{resolution}#{sortable bucket_start}`.
pub const BUCKETS: JsonTable = TableDefinition::new("buckets");

/// Raw scores keyed by `{entity}#{sortable timestamp}#{sequence}`.
pub const RAW_SCORES: JsonTable = TableDefinition::new("raw_scores");

/// Circuit breaker records keyed by `{dependency_id}`.
pub const BREAKERS: JsonTable = TableDefinition::new("breakers");

/// Quota usage records keyed by `{dependency_id}`.
pub const QUOTAS: JsonTable = TableDefinition::new("quotas");

const SIGN_BIT: u64 = 1 << 63;

/// Encode a signed timestamp as a fixed-width string whose byte order
/// matches numeric order, including for negative values.
pub fn sortable_ts(ts: i64) -> String {
    format!("{:020}", (ts as u64) ^ SIGN_BIT)
}

/// Inverse of [`sortable_ts`].
pub fn decode_sortable_ts(encoded: &str) -> Option<i64> {
    let raw: u64 = encoded.parse().ok()?;
    Some((raw ^ SIGN_BIT) as i64)
}

/// Full key of one bucket record.
pub fn bucket_key(key: &TimeseriesKey, bucket_start: i64) -> String {
    format!("{}#{}", key.encode(), sortable_ts(bucket_start))
}

/// Prefix of every raw score key for `entity_id` at `ts`.
pub fn raw_key_prefix(entity_id: &str, ts: i64) -> String {
    format!("{entity_id}#{}", sortable_ts(ts))
}

/// Full key of one raw score record.
pub fn raw_key(entity_id: &str, ts: i64, seq: u64) -> String {
    format!("{}#{seq:020}", raw_key_prefix(entity_id, ts))
}

/// Split a raw score key into `(entity_id, timestamp)`.
pub fn parse_raw_key(key: &str) -> Option<(&str, i64)> {
    let mut parts = key.split('#');
    let entity = parts.next()?;
    let ts = decode_sortable_ts(parts.next()?)?;
    Some((entity, ts))
}
