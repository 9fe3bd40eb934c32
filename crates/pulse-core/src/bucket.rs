//! Time-aligned OHLC aggregates and the aggregation/merge rules.
//!
//! A [`Bucket`] summarizes every score for one entity that falls inside one
//! resolution window. Buckets are built either in one pass by
//! [`aggregate`] or incrementally by [`Bucket::merge_score`] /
//! [`Bucket::merge`]; both paths produce the same result for the same
//! scores in the same order.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::resolution::Resolution;
use crate::score::{RawScore, SentimentLabel, KEY_DELIMITER};

/// Upper bound for a partial bucket's progress. A bucket still in progress
/// is never reported as 100% complete.
pub const MAX_PARTIAL_PROGRESS: f64 = 100.0 - 1e-9;

/// Identity of one series: an entity at one resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeseriesKey {
    pub entity_id: String,
    pub resolution: Resolution,
}

impl TimeseriesKey {
    pub fn new(entity_id: impl Into<String>, resolution: Resolution) -> Self {
        Self {
            entity_id: entity_id.into(),
            resolution,
        }
    }

    /// Partition key encoding, `{entity_id}#{resolution}`.
    pub fn encode(&self) -> String {
        format!("{}{KEY_DELIMITER}{}", self.entity_id, self.resolution)
    }
}

impl fmt::Display for TimeseriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{KEY_DELIMITER}{}", self.entity_id, self.resolution)
    }
}

/// Histogram of sentiment labels within a bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelCounts {
    pub positive: u64,
    pub neutral: u64,
    pub negative: u64,
}

impl LabelCounts {
    pub fn increment(&mut self, label: SentimentLabel) {
        match label {
            SentimentLabel::Positive => self.positive += 1,
            SentimentLabel::Neutral => self.neutral += 1,
            SentimentLabel::Negative => self.negative += 1,
        }
    }

    pub fn add(&mut self, other: &LabelCounts) {
        self.positive += other.positive;
        self.neutral += other.neutral;
        self.negative += other.negative;
    }

    pub fn total(&self) -> u64 {
        self.positive + self.neutral + self.negative
    }
}

/// OHLC aggregate for one (entity, resolution, bucket_start).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    pub entity_id: String,
    pub resolution: Resolution,
    /// Aligned window start (epoch seconds).
    pub bucket_start: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub count: u64,
    pub sum: f64,
    pub label_counts: LabelCounts,
    /// Timestamp of the score that set `open`.
    pub first_ts: i64,
    /// Timestamp of the score that set `close`.
    pub last_ts: i64,
    #[serde(default)]
    pub is_partial: bool,
}

impl Bucket {
    /// A single-score bucket aligned to `resolution`.
    pub fn from_score(score: &RawScore, resolution: Resolution) -> Self {
        let mut label_counts = LabelCounts::default();
        label_counts.increment(score.label);
        Self {
            entity_id: score.entity_id.clone(),
            resolution,
            bucket_start: resolution.floor(score.timestamp),
            open: score.value,
            high: score.value,
            low: score.value,
            close: score.value,
            count: 1,
            sum: score.value,
            label_counts,
            first_ts: score.timestamp,
            last_ts: score.timestamp,
            is_partial: false,
        }
    }

    pub fn key(&self) -> TimeseriesKey {
        TimeseriesKey::new(self.entity_id.clone(), self.resolution)
    }

    /// Mean score, always `sum / count`.
    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum / self.count as f64
    }

    /// Exclusive end of this bucket's window.
    pub fn bucket_end(&self) -> i64 {
        self.bucket_start.saturating_add(self.resolution.duration_secs())
    }

    /// Whether `now` is still inside this bucket's window.
    pub fn is_open_at(&self, now: i64) -> bool {
        self.bucket_start <= now && now < self.bucket_end()
    }

    /// Fold one more score into this bucket.
    ///
    /// `open` only moves for a strictly earlier score; `close` moves for a
    /// score at or after the latest seen, so equal timestamps resolve in
    /// arrival order.
    pub fn merge_score(&mut self, score: &RawScore) -> CoreResult<()> {
        if score.entity_id != self.entity_id {
            return Err(CoreError::MixedEntities(
                self.entity_id.clone(),
                score.entity_id.clone(),
            ));
        }
        if self.resolution.floor(score.timestamp) != self.bucket_start {
            return Err(CoreError::OutsideBucket {
                resolution: self.resolution,
                bucket_start: self.bucket_start,
                timestamp: score.timestamp,
            });
        }
        self.merge(&Bucket::from_score(score, self.resolution))
    }

    /// Merge another aggregate of the same key into this one.
    ///
    /// high/low/count/sum/labels combine commutatively; open/close follow
    /// the earliest/latest contributing timestamps.
    pub fn merge(&mut self, other: &Bucket) -> CoreResult<()> {
        if other.entity_id != self.entity_id
            || other.resolution != self.resolution
            || other.bucket_start != self.bucket_start
        {
            return Err(CoreError::KeyMismatch(
                format!("{}@{}", self.key(), self.bucket_start),
                format!("{}@{}", other.key(), other.bucket_start),
            ));
        }
        if other.first_ts < self.first_ts {
            self.open = other.open;
            self.first_ts = other.first_ts;
        }
        if other.last_ts >= self.last_ts {
            self.close = other.close;
            self.last_ts = other.last_ts;
        }
        self.high = self.high.max(other.high);
        self.low = self.low.min(other.low);
        self.count += other.count;
        self.sum += other.sum;
        self.label_counts.add(&other.label_counts);
        Ok(())
    }
}

/// Reduce a non-empty set of scores into one bucket.
///
/// Scores are stable-sorted by timestamp first, so ties keep their
/// insertion order. All scores must belong to one entity and fall inside
/// one `resolution` window.
pub fn aggregate(scores: &[RawScore], resolution: Resolution) -> CoreResult<Bucket> {
    let mut ordered: Vec<&RawScore> = scores.iter().collect();
    ordered.sort_by_key(|s| s.timestamp);

    let (first, rest) = ordered.split_first().ok_or(CoreError::EmptyAggregation)?;
    let mut bucket = Bucket::from_score(first, resolution);
    for score in rest {
        bucket.merge_score(score)?;
    }
    Ok(bucket)
}

/// Percentage of `resolution`'s window elapsed at `now`, clamped to `[0, 100)`.
pub fn progress_pct(bucket_start: i64, resolution: Resolution, now: i64) -> f64 {
    let elapsed = now.saturating_sub(bucket_start) as f64;
    let pct = 100.0 * elapsed / resolution.duration_secs() as f64;
    pct.clamp(0.0, MAX_PARTIAL_PROGRESS)
}

/// The provisional aggregate for a window that has not closed yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialBucket {
    #[serde(flatten)]
    pub bucket: Bucket,
    pub progress_pct: f64,
    /// When a refreshed partial will next be available (epoch seconds).
    pub next_update_at: i64,
}

impl PartialBucket {
    /// Wrap an in-progress aggregate, marking it partial.
    pub fn new(mut bucket: Bucket, now: i64, refresh_secs: i64) -> Self {
        bucket.is_partial = true;
        let progress_pct = progress_pct(bucket.bucket_start, bucket.resolution, now);
        let next_update_at = now
            .saturating_add(refresh_secs.max(1))
            .min(bucket.bucket_end());
        Self {
            bucket,
            progress_pct,
            next_update_at,
        }
    }
}

/// Wire representation of a bucket with the derived average included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketView {
    #[serde(flatten)]
    pub bucket: Bucket,
    pub avg: f64,
}

impl From<Bucket> for BucketView {
    fn from(bucket: Bucket) -> Self {
        let avg = bucket.avg();
        Self { bucket, avg }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::score::SentimentLabel::*;

    // 2024-01-01T10:35:00Z
    const T1035: i64 = 1_704_105_300;

    fn score(value: f64, label: SentimentLabel, timestamp: i64) -> RawScore {
        RawScore::new("X", value, label, timestamp).unwrap()
    }

    fn scenario() -> Vec<RawScore> {
        vec![
            score(0.6, Positive, T1035 + 10),
            score(0.9, Positive, T1035 + 20),
            score(0.3, Neutral, T1035 + 30),
            score(0.7, Positive, T1035 + 40),
        ]
    }

    #[test]
    fn aggregate_five_minute_scenario() {
        let bucket = aggregate(&scenario(), Resolution::FiveMinutes).unwrap();
        assert_eq!(bucket.bucket_start, T1035);
        assert_eq!(bucket.open, 0.6);
        assert_eq!(bucket.high, 0.9);
        assert_eq!(bucket.low, 0.3);
        assert_eq!(bucket.close, 0.7);
        assert_eq!(bucket.count, 4);
        assert!((bucket.avg() - 0.625).abs() < 1e-12);
        assert_eq!(bucket.label_counts.positive, 3);
        assert_eq!(bucket.label_counts.neutral, 1);
        assert!(!bucket.is_partial);
    }

    #[test]
    fn aggregate_sorts_unordered_input() {
        let mut scores = scenario();
        scores.reverse();
        let bucket = aggregate(&scores, Resolution::FiveMinutes).unwrap();
        assert_eq!(bucket.open, 0.6);
        assert_eq!(bucket.close, 0.7);
    }

    #[test]
    fn aggregate_ties_keep_insertion_order() {
        let scores = vec![
            score(0.1, Neutral, T1035 + 5),
            score(0.2, Neutral, T1035 + 5),
            score(0.3, Neutral, T1035 + 5),
        ];
        let bucket = aggregate(&scores, Resolution::OneMinute).unwrap();
        assert_eq!(bucket.open, 0.1);
        assert_eq!(bucket.close, 0.3);
    }

    #[test]
    fn aggregate_rejects_empty() {
        assert_eq!(
            aggregate(&[], Resolution::OneHour).unwrap_err(),
            CoreError::EmptyAggregation
        );
    }

    #[test]
    fn aggregate_rejects_mixed_entities_and_windows() {
        let mut scores = scenario();
        scores.push(RawScore::new("Y", 0.0, Neutral, T1035 + 50).unwrap());
        assert!(matches!(
            aggregate(&scores, Resolution::FiveMinutes),
            Err(CoreError::MixedEntities(..))
        ));

        let scores = vec![score(0.1, Neutral, T1035), score(0.2, Neutral, T1035 + 300)];
        assert!(matches!(
            aggregate(&scores, Resolution::FiveMinutes),
            Err(CoreError::OutsideBucket { .. })
        ));
    }

    #[test]
    fn ohlc_bounds_hold() {
        let values = [0.2, -0.8, 0.95, -0.1, 0.0, 0.4, -1.0, 1.0];
        let scores: Vec<RawScore> = values
            .iter()
            .enumerate()
            .map(|(i, v)| score(*v, Neutral, T1035 + (7 * i as i64) % 60))
            .collect();
        let b = aggregate(&scores, Resolution::OneMinute).unwrap();
        assert!(b.low <= b.open && b.open <= b.high);
        assert!(b.low <= b.close && b.close <= b.high);
        assert_eq!(b.count, values.len() as u64);
        assert_eq!(b.label_counts.total(), b.count);
    }

    #[test]
    fn incremental_merge_matches_batch_aggregate() {
        let scores = scenario();
        // Arrival order differs from timestamp order.
        let arrival = [2usize, 0, 3, 1];
        let mut bucket = Bucket::from_score(&scores[arrival[0]], Resolution::FiveMinutes);
        for &i in &arrival[1..] {
            bucket.merge_score(&scores[i]).unwrap();
        }
        let batch = aggregate(&scores, Resolution::FiveMinutes).unwrap();
        assert_eq!(bucket.open, batch.open);
        assert_eq!(bucket.close, batch.close);
        assert_eq!(bucket.high, batch.high);
        assert_eq!(bucket.low, batch.low);
        assert_eq!(bucket.count, batch.count);
        assert_eq!(bucket.label_counts, batch.label_counts);
        assert_eq!((bucket.first_ts, bucket.last_ts), (batch.first_ts, batch.last_ts));
        // Summation order differs, so only approximately equal.
        assert!((bucket.sum - batch.sum).abs() < 1e-12);
    }

    #[test]
    fn merge_is_order_independent_for_distinct_timestamps() {
        let scores = scenario();
        let left = aggregate(&scores[..2], Resolution::FiveMinutes).unwrap();
        let right = aggregate(&scores[2..], Resolution::FiveMinutes).unwrap();

        let mut a = left.clone();
        a.merge(&right).unwrap();
        let mut b = right;
        b.merge(&left).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn merge_rejects_other_keys() {
        let mut a = Bucket::from_score(&score(0.1, Neutral, T1035), Resolution::OneMinute);
        let b = Bucket::from_score(&score(0.1, Neutral, T1035 + 60), Resolution::OneMinute);
        assert!(matches!(a.merge(&b), Err(CoreError::KeyMismatch(..))));
        assert!(a.merge_score(&score(0.2, Neutral, T1035 + 61)).is_err());
    }

    #[test]
    fn progress_at_half_window() {
        // 10:37:30 inside the 10:35 five-minute window.
        let pct = progress_pct(T1035, Resolution::FiveMinutes, T1035 + 150);
        assert!((pct - 50.0).abs() < 1e-9);
    }

    #[test]
    fn progress_is_clamped() {
        assert_eq!(progress_pct(T1035, Resolution::OneMinute, T1035 - 10), 0.0);
        assert!(progress_pct(T1035, Resolution::OneMinute, T1035 + 60) < 100.0);
        assert!(progress_pct(T1035, Resolution::OneMinute, T1035 + 59) < 100.0);
    }

    #[test]
    fn window_math_saturates_at_the_i64_edges() {
        assert_eq!(progress_pct(i64::MIN, Resolution::OneMinute, i64::MAX), MAX_PARTIAL_PROGRESS);
        assert_eq!(progress_pct(i64::MAX, Resolution::OneMinute, i64::MIN), 0.0);

        // Scores this far out never pass validation; build the bucket directly.
        let mut bucket = aggregate(&scenario(), Resolution::OneHour).unwrap();
        bucket.bucket_start = Resolution::OneHour.floor(i64::MAX);
        assert_eq!(bucket.bucket_end(), i64::MAX);
        assert!(bucket.is_open_at(i64::MAX - 1));
        let partial = PartialBucket::new(bucket, i64::MAX - 1, 30);
        assert_eq!(partial.next_update_at, i64::MAX);
    }

    #[test]
    fn partial_bucket_next_update_capped_at_window_end() {
        let bucket = aggregate(&scenario(), Resolution::FiveMinutes).unwrap();
        let partial = PartialBucket::new(bucket, T1035 + 295, 10);
        assert!(partial.bucket.is_partial);
        assert_eq!(partial.next_update_at, T1035 + 300);

        let bucket = aggregate(&scenario(), Resolution::FiveMinutes).unwrap();
        let partial = PartialBucket::new(bucket, T1035 + 100, 10);
        assert_eq!(partial.next_update_at, T1035 + 110);
    }

    #[test]
    fn views_carry_avg_and_flatten() {
        let bucket = aggregate(&scenario(), Resolution::FiveMinutes).unwrap();
        let json = serde_json::to_value(BucketView::from(bucket)).unwrap();
        assert_eq!(json["resolution"], "5m");
        assert_eq!(json["open"], 0.6);
        assert!((json["avg"].as_f64().unwrap() - 0.625).abs() < 1e-12);
    }

    #[test]
    fn key_encoding() {
        let key = TimeseriesKey::new("AAPL", Resolution::TwelveHours);
        assert_eq!(key.encode(), "AAPL#12h");
        assert_eq!(key.to_string(), key.encode());
    }
}
