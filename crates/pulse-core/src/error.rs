//! Errors for malformed input at the core boundary.

use thiserror::Error;

use crate::resolution::Resolution;

/// Result type alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Malformed-input errors. These are rejected at the boundary and never
/// silently coerced into a default value.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CoreError {
    #[error("unknown resolution: {0:?}")]
    UnknownResolution(String),

    #[error("unknown label: {0:?}")]
    UnknownLabel(String),

    #[error("invalid entity id {0:?}: {1}")]
    InvalidEntity(String, &'static str),

    #[error(
        "score value {0} outside [{min}, {max}]",
        min = crate::score::MIN_VALUE,
        max = crate::score::MAX_VALUE
    )]
    ValueOutOfRange(f64),

    #[error(
        "timestamp {0} outside [{min}, {max}]",
        min = crate::score::MIN_TIMESTAMP,
        max = crate::score::MAX_TIMESTAMP
    )]
    TimestampOutOfRange(i64),

    #[error("cannot aggregate an empty score set")]
    EmptyAggregation,

    #[error("scores span multiple entities ({0} and {1})")]
    MixedEntities(String, String),

    #[error("score at {timestamp} is outside the {resolution} bucket starting at {bucket_start}")]
    OutsideBucket {
        resolution: Resolution,
        bucket_start: i64,
        timestamp: i64,
    },

    #[error("cannot merge buckets with different keys ({0} vs {1})")]
    KeyMismatch(String, String),
}
