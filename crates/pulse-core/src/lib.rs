//! pulse-core: shared vocabulary for PulseGrid.
//!
//! Defines the closed [`Resolution`] set with bucket alignment, raw
//! sentiment scores, OHLC [`Bucket`]s with their aggregation and merge
//! rules, the [`Clock`] abstraction, and the `pulse.toml` config.

pub mod bucket;
pub mod clock;
pub mod config;
pub mod error;
pub mod resolution;
pub mod score;

pub use bucket::{
    aggregate, progress_pct, Bucket, BucketView, LabelCounts, PartialBucket, TimeseriesKey,
};
pub use clock::{epoch_secs, Clock, ManualClock, SharedClock, SystemClock};
pub use config::PulseConfig;
pub use error::{CoreError, CoreResult};
pub use resolution::{floor_to_bucket, Resolution};
pub use score::{
    validate_entity_id, validate_timestamp, RawScore, SentimentLabel, MAX_TIMESTAMP, MIN_TIMESTAMP,
};
