//! Raw sentiment measurements as produced by the ingestion collaborator.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Lowest accepted score value.
pub const MIN_VALUE: f64 = -1.0;
/// Highest accepted score value.
pub const MAX_VALUE: f64 = 1.0;

/// Delimiter used by composite store keys; forbidden inside entity ids.
pub const KEY_DELIMITER: char = '#';

/// Longest accepted entity id, in bytes.
pub const MAX_ENTITY_LEN: usize = 64;

/// Earliest accepted timestamp: the Unix epoch.
pub const MIN_TIMESTAMP: i64 = 0;
/// Latest accepted timestamp: 9999-12-31T23:59:59Z.
pub const MAX_TIMESTAMP: i64 = 253_402_300_799;

/// Categorical sentiment attached to each score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SentimentLabel {
    Positive,
    Neutral,
    Negative,
}

impl SentimentLabel {
    pub const fn as_str(self) -> &'static str {
        match self {
            SentimentLabel::Positive => "positive",
            SentimentLabel::Neutral => "neutral",
            SentimentLabel::Negative => "negative",
        }
    }
}

impl fmt::Display for SentimentLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SentimentLabel {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "positive" => Ok(SentimentLabel::Positive),
            "neutral" => Ok(SentimentLabel::Neutral),
            "negative" => Ok(SentimentLabel::Negative),
            other => Err(CoreError::UnknownLabel(other.to_string())),
        }
    }
}

/// A single scored measurement for one entity (ticker).
///
/// Immutable once constructed. Use [`RawScore::new`] or
/// [`RawScore::validate`] after deserializing untrusted input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawScore {
    pub entity_id: String,
    pub value: f64,
    pub label: SentimentLabel,
    /// Unix timestamp in seconds.
    pub timestamp: i64,
}

impl RawScore {
    /// Build a validated score.
    pub fn new(
        entity_id: impl Into<String>,
        value: f64,
        label: SentimentLabel,
        timestamp: i64,
    ) -> CoreResult<Self> {
        let score = Self {
            entity_id: entity_id.into(),
            value,
            label,
            timestamp,
        };
        score.validate()?;
        Ok(score)
    }

    /// Check the entity id, timestamp and value range.
    pub fn validate(&self) -> CoreResult<()> {
        validate_entity_id(&self.entity_id)?;
        validate_timestamp(self.timestamp)?;
        if !self.value.is_finite() || !(MIN_VALUE..=MAX_VALUE).contains(&self.value) {
            return Err(CoreError::ValueOutOfRange(self.value));
        }
        Ok(())
    }
}

/// Reject timestamps outside `[MIN_TIMESTAMP, MAX_TIMESTAMP]`.
///
/// Bucket arithmetic on accepted timestamps never overflows.
pub fn validate_timestamp(timestamp: i64) -> CoreResult<()> {
    if (MIN_TIMESTAMP..=MAX_TIMESTAMP).contains(&timestamp) {
        Ok(())
    } else {
        Err(CoreError::TimestampOutOfRange(timestamp))
    }
}

/// Reject entity ids that would corrupt composite key encoding.
pub fn validate_entity_id(entity_id: &str) -> CoreResult<()> {
    if entity_id.is_empty() {
        return Err(CoreError::InvalidEntity(entity_id.to_string(), "must not be empty"));
    }
    if entity_id.len() > MAX_ENTITY_LEN {
        return Err(CoreError::InvalidEntity(entity_id.to_string(), "too long"));
    }
    if entity_id.contains(KEY_DELIMITER) {
        return Err(CoreError::InvalidEntity(
            entity_id.to_string(),
            "must not contain '#'",
        ));
    }
    if entity_id.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(CoreError::InvalidEntity(
            entity_id.to_string(),
            "must not contain whitespace",
        ));
    }
    Ok(())
}
