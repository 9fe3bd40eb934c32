//! The fixed set of time granularities and bucket alignment.
//!
//! Every resolution aligns to UTC wall-clock boundaries anchored at the
//! Unix epoch, so 1h buckets start at `:00` and 5m buckets at
//! `:00/:05/:10…`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

const MINUTE: i64 = 60;
const HOUR: i64 = 60 * MINUTE;
const DAY: i64 = 24 * HOUR;

/// A supported aggregation granularity.
///
/// The set is closed; new resolutions cannot be introduced at runtime.
/// Variants are declared in ascending duration order so the derived
/// `Ord` matches the natural ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Resolution {
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "10m")]
    TenMinutes,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "3h")]
    ThreeHours,
    #[serde(rename = "6h")]
    SixHours,
    #[serde(rename = "12h")]
    TwelveHours,
    #[serde(rename = "24h")]
    TwentyFourHours,
}

impl Resolution {
    /// All resolutions, finest first.
    pub const ALL: [Resolution; 8] = [
        Resolution::OneMinute,
        Resolution::FiveMinutes,
        Resolution::TenMinutes,
        Resolution::OneHour,
        Resolution::ThreeHours,
        Resolution::SixHours,
        Resolution::TwelveHours,
        Resolution::TwentyFourHours,
    ];

    /// Bucket width in seconds.
    pub const fn duration_secs(self) -> i64 {
        match self {
            Resolution::OneMinute => MINUTE,
            Resolution::FiveMinutes => 5 * MINUTE,
            Resolution::TenMinutes => 10 * MINUTE,
            Resolution::OneHour => HOUR,
            Resolution::ThreeHours => 3 * HOUR,
            Resolution::SixHours => 6 * HOUR,
            Resolution::TwelveHours => 12 * HOUR,
            Resolution::TwentyFourHours => DAY,
        }
    }

    /// How long a stored bucket at this resolution is retained, in seconds.
    pub const fn ttl_secs(self) -> i64 {
        match self {
            Resolution::OneMinute => 6 * HOUR,
            Resolution::FiveMinutes => 12 * HOUR,
            Resolution::TenMinutes => DAY,
            Resolution::OneHour => 7 * DAY,
            Resolution::ThreeHours => 14 * DAY,
            Resolution::SixHours => 30 * DAY,
            Resolution::TwelveHours => 60 * DAY,
            Resolution::TwentyFourHours => 90 * DAY,
        }
    }

    /// Short wire name (`"1m"`, `"24h"`, …).
    pub const fn as_str(self) -> &'static str {
        match self {
            Resolution::OneMinute => "1m",
            Resolution::FiveMinutes => "5m",
            Resolution::TenMinutes => "10m",
            Resolution::OneHour => "1h",
            Resolution::ThreeHours => "3h",
            Resolution::SixHours => "6h",
            Resolution::TwelveHours => "12h",
            Resolution::TwentyFourHours => "24h",
        }
    }

    /// Start of the bucket containing `timestamp` at this resolution.
    pub const fn floor(self, timestamp: i64) -> i64 {
        floor_to_bucket(timestamp, self)
    }

    /// Parse a comma-separated list such as `"1m,5m,1h"`.
    ///
    /// Whitespace around items is ignored; empty items are skipped.
    /// Duplicates collapse. An unknown item rejects the whole list.
    pub fn parse_list(input: &str) -> Result<Vec<Resolution>, CoreError> {
        let mut out: Vec<Resolution> = Vec::new();
        for item in input.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let res: Resolution = item.parse()?;
            if !out.contains(&res) {
                out.push(res);
            }
        }
        out.sort();
        Ok(out)
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Resolution::ALL
            .into_iter()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| CoreError::UnknownResolution(s.to_string()))
    }
}

/// Map a timestamp (epoch seconds) to the start of its containing bucket.
///
/// Uses Euclidean division so pre-epoch timestamps still floor downwards.
/// Total over `i64`: a window whose aligned start lies below `i64::MIN`
/// saturates to `i64::MIN`.
pub const fn floor_to_bucket(timestamp: i64, resolution: Resolution) -> i64 {
    let width = resolution.duration_secs();
    timestamp.saturating_sub(timestamp.rem_euclid(width))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durations_ascend_with_declaration_order() {
        for pair in Resolution::ALL.windows(2) {
            assert!(pair[0] < pair[1]);
            assert!(pair[0].duration_secs() < pair[1].duration_secs());
            assert!(pair[0].ttl_secs() < pair[1].ttl_secs());
        }
    }

    #[test]
    fn ttl_table() {
        assert_eq!(Resolution::OneMinute.ttl_secs(), 6 * 3600);
        assert_eq!(Resolution::TenMinutes.ttl_secs(), 86_400);
        assert_eq!(Resolution::OneHour.ttl_secs(), 7 * 86_400);
        assert_eq!(Resolution::TwentyFourHours.ttl_secs(), 90 * 86_400);
    }

    #[test]
    fn parse_round_trips_wire_names() {
        for res in Resolution::ALL {
            assert_eq!(res.as_str().parse::<Resolution>().unwrap(), res);
        }
    }

    #[test]
    fn parse_rejects_unknown() {
        let err = "2m".parse::<Resolution>().unwrap_err();
        assert_eq!(err, CoreError::UnknownResolution("2m".to_string()));
    }

    #[test]
    fn serde_uses_wire_names() {
        let json = serde_json::to_string(&Resolution::ThreeHours).unwrap();
        assert_eq!(json, "\"3h\"");
        let back: Resolution = serde_json::from_str("\"12h\"").unwrap();
        assert_eq!(back, Resolution::TwelveHours);
        assert!(serde_json::from_str::<Resolution>("\"7m\"").is_err());
    }

    #[test]
    fn parse_list_dedups_and_sorts() {
        let list = Resolution::parse_list(" 1h, 1m ,1h,,5m").unwrap();
        assert_eq!(
            list,
            vec![Resolution::OneMinute, Resolution::FiveMinutes, Resolution::OneHour]
        );
        assert!(Resolution::parse_list("1m,bogus").is_err());
        assert!(Resolution::parse_list("").unwrap().is_empty());
    }

    #[test]
    fn floor_on_boundary_is_identity() {
        // 2024-01-01T10:35:00Z
        let t = 1_704_105_300;
        assert_eq!(floor_to_bucket(t, Resolution::FiveMinutes), t);
        assert_eq!(floor_to_bucket(t, Resolution::OneMinute), t);
    }

    #[test]
    fn floor_aligns_to_wall_clock() {
        // 2024-01-01T10:37:30Z
        let t = 1_704_105_450;
        assert_eq!(floor_to_bucket(t, Resolution::FiveMinutes), 1_704_105_300);
        assert_eq!(floor_to_bucket(t, Resolution::TenMinutes), 1_704_105_000);
        assert_eq!(floor_to_bucket(t, Resolution::OneHour), 1_704_103_200);
        assert_eq!(floor_to_bucket(t, Resolution::TwentyFourHours), 1_704_067_200);
    }

    #[test]
    fn floor_contains_and_is_idempotent_for_all_resolutions() {
        let samples = [
            i64::MIN,
            i64::MIN + 1,
            i64::MIN / 2,
            -86_401,
            -1,
            0,
            1,
            59,
            60,
            3_599,
            1_704_105_450,
            i64::MAX / 2,
            i64::MAX - 1,
            i64::MAX,
        ];
        for res in Resolution::ALL {
            for &t in &samples {
                let start = floor_to_bucket(t, res);
                assert!(start <= t, "{res} {t}");
                assert!((t as i128) < start as i128 + res.duration_secs() as i128, "{res} {t}");
                assert_eq!(floor_to_bucket(start, res), start);
            }
        }
    }

    #[test]
    fn floor_is_total_at_the_i64_edges() {
        for res in Resolution::ALL {
            let width = res.duration_secs();
            let top = floor_to_bucket(i64::MAX, res);
            assert_eq!(top.rem_euclid(width), 0, "{res}");
            assert!(i64::MAX - top < width, "{res}");
            // No aligned start is representable below the lowest window.
            assert_eq!(floor_to_bucket(i64::MIN, res), i64::MIN, "{res}");
            assert_eq!(floor_to_bucket(i64::MIN + width, res) % width, 0, "{res}");
        }
    }
}
