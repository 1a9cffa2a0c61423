//! Timestamp normalization.
//!
//! Collectors deliver instants as ISO-8601 text or as integer epoch values
//! whose resolution is not labelled. Integers are classified by magnitude:
//!
//! | `|value|` range      | resolution    |
//! |----------------------|---------------|
//! | `< 1e11`             | seconds       |
//! | `[1e11, 1e14)`       | milliseconds  |
//! | `[1e14, 1e17)`       | microseconds  |
//! | `>= 1e17`            | nanoseconds   |
//!
//! Every boundary corresponds to 1973-03-03T09:46:40Z in the finer
//! resolution and to the year 5138 in the coarser one, so any instant between
//! 1973-03-03 and 2100 is classified correctly in all four resolutions.
//! Sub-second encodings of instants before 1973-03-03 are read as the next
//! coarser resolution.
//!
//! All instants are truncated to microseconds, the precision of the fact
//! store, so fingerprints survive a round-trip through storage.

use chrono::{DateTime, NaiveDate, NaiveDateTime, SubsecRound, Utc};

use crate::error::{NormalizationError, NormalizationReason};
use crate::models::RawTimestamp;

// ---

/// Smallest magnitude read as milliseconds.
pub const MILLIS_THRESHOLD: u64 = 100_000_000_000;
/// Smallest magnitude read as microseconds.
pub const MICROS_THRESHOLD: u64 = 100_000_000_000_000;
/// Smallest magnitude read as nanoseconds.
pub const NANOS_THRESHOLD: u64 = 100_000_000_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochResolution {
    Seconds,
    Milliseconds,
    Microseconds,
    Nanoseconds,
}

impl EpochResolution {
    /// Classify an epoch value by its magnitude.
    pub fn classify(value: i64) -> Self {
        // ---
        let magnitude = value.unsigned_abs();
        if magnitude >= NANOS_THRESHOLD {
            EpochResolution::Nanoseconds
        } else if magnitude >= MICROS_THRESHOLD {
            EpochResolution::Microseconds
        } else if magnitude >= MILLIS_THRESHOLD {
            EpochResolution::Milliseconds
        } else {
            EpochResolution::Seconds
        }
    }

    fn units_per_second(self) -> i64 {
        match self {
            EpochResolution::Seconds => 1,
            EpochResolution::Milliseconds => 1_000,
            EpochResolution::Microseconds => 1_000_000,
            EpochResolution::Nanoseconds => 1_000_000_000,
        }
    }
}

const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Coerce a raw timestamp into a UTC instant at microsecond precision.
pub fn normalize(raw: &RawTimestamp) -> Result<DateTime<Utc>, NormalizationError> {
    // ---
    let instant = match raw {
        RawTimestamp::Epoch(value) => from_epoch(*value),
        RawTimestamp::Fractional(value) => fractional_epoch(*value).and_then(from_epoch),
        RawTimestamp::Text(text) => from_text(text.trim()),
    };

    instant
        .map(|ts| ts.trunc_subsecs(6))
        .ok_or_else(|| NormalizationError {
            reason: match raw {
                RawTimestamp::Text(_) => NormalizationReason::Unparseable,
                RawTimestamp::Fractional(v) if !v.is_finite() => NormalizationReason::Unparseable,
                _ => NormalizationReason::OutOfRange,
            },
            raw_value: raw.to_string(),
        })
}

/// The whole units of a fractional epoch, or `None` when they do not fit an
/// `i64`.
fn fractional_epoch(value: f64) -> Option<i64> {
    // ---
    let whole = value.trunc();
    (i64::MIN as f64..i64::MAX as f64)
        .contains(&whole)
        .then_some(whole as i64)
}

fn from_epoch(value: i64) -> Option<DateTime<Utc>> {
    // ---
    let per_second = EpochResolution::classify(value).units_per_second();
    let secs = value.div_euclid(per_second);
    let nanos = value.rem_euclid(per_second) * (1_000_000_000 / per_second);
    DateTime::from_timestamp(secs, nanos as u32)
}

fn from_text(text: &str) -> Option<DateTime<Utc>> {
    // ---
    if text.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(text) {
        return Some(ts.with_timezone(&Utc));
    }
    if let Ok(ts) = DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Some(ts.with_timezone(&Utc));
    }
    for format in NAIVE_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|naive| naive.and_utc());
    }
    text.parse::<i64>().ok().and_then(from_epoch)
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::{Datelike, TimeZone, Timelike};

    fn epoch(v: i64) -> DateTime<Utc> {
        normalize(&RawTimestamp::Epoch(v)).unwrap()
    }

    fn text(s: &str) -> Result<DateTime<Utc>, NormalizationError> {
        normalize(&RawTimestamp::Text(s.to_string()))
    }

    #[test]
    fn test_same_instant_in_every_resolution() {
        // ---
        let expected = Utc.with_ymd_and_hms(2023, 11, 14, 22, 13, 20).unwrap();
        assert_eq!(epoch(1_700_000_000), expected);
        assert_eq!(epoch(1_700_000_000_000), expected);
        assert_eq!(epoch(1_700_000_000_000_000), expected);
        assert_eq!(epoch(1_700_000_000_000_000_000), expected);
    }

    #[test]
    fn test_threshold_boundaries() {
        // ---
        assert_eq!(EpochResolution::classify(99_999_999_999), EpochResolution::Seconds);
        assert_eq!(EpochResolution::classify(100_000_000_000), EpochResolution::Milliseconds);
        assert_eq!(EpochResolution::classify(99_999_999_999_999), EpochResolution::Milliseconds);
        assert_eq!(EpochResolution::classify(100_000_000_000_000), EpochResolution::Microseconds);
        assert_eq!(
            EpochResolution::classify(99_999_999_999_999_999),
            EpochResolution::Microseconds
        );
        assert_eq!(
            EpochResolution::classify(100_000_000_000_000_000),
            EpochResolution::Nanoseconds
        );
        assert_eq!(EpochResolution::classify(i64::MIN), EpochResolution::Nanoseconds);

        // Each threshold lands on the same instant in its own resolution
        let boundary = Utc.with_ymd_and_hms(1973, 3, 3, 9, 46, 40).unwrap();
        assert_eq!(epoch(100_000_000_000), boundary);
        assert_eq!(epoch(100_000_000_000_000), boundary);
        assert_eq!(epoch(100_000_000_000_000_000), boundary);
    }

    #[test]
    fn test_year_2100_is_unambiguous() {
        // ---
        let end = Utc.with_ymd_and_hms(2100, 1, 1, 0, 0, 0).unwrap();
        let secs = end.timestamp();
        assert_eq!(EpochResolution::classify(secs), EpochResolution::Seconds);
        assert_eq!(EpochResolution::classify(secs * 1_000), EpochResolution::Milliseconds);
        assert_eq!(EpochResolution::classify(secs * 1_000_000), EpochResolution::Microseconds);
        assert_eq!(
            EpochResolution::classify(secs * 1_000_000_000),
            EpochResolution::Nanoseconds
        );
        assert_eq!(epoch(secs * 1_000_000_000), end);
    }

    #[test]
    fn test_millis_keep_subsecond_and_nanos_truncate() {
        // ---
        let ts = epoch(1_700_000_000_123);
        assert_eq!(ts.timestamp_subsec_millis(), 123);

        let ts = epoch(1_700_000_000_123_456_789);
        assert_eq!(ts.timestamp_subsec_nanos(), 123_456_000);
    }

    #[test]
    fn test_negative_epoch_before_1970() {
        // ---
        let ts = epoch(-86_400);
        assert_eq!((ts.year(), ts.month(), ts.day()), (1969, 12, 31));
    }

    #[test]
    fn test_text_encodings() {
        // ---
        let expected = Utc.with_ymd_and_hms(2025, 7, 1, 12, 30, 0).unwrap();
        assert_eq!(text("2025-07-01T12:30:00Z").unwrap(), expected);
        assert_eq!(text("2025-07-01T14:30:00+02:00").unwrap(), expected);
        assert_eq!(text("2025-07-01 12:30:00+00:00").unwrap(), expected);
        assert_eq!(text("2025-07-01T12:30:00").unwrap(), expected);
        assert_eq!(text(" 2025-07-01 12:30:00 ").unwrap(), expected);
        assert_eq!(text("2025-07-01 12:30:00.000").unwrap(), expected);
        assert_eq!(text("1751373000").unwrap(), expected);
        assert_eq!(text("2025-07-01").unwrap().hour(), 0);
    }

    #[test]
    fn test_unparseable_values_fail() {
        // ---
        let err = text("last tuesday").unwrap_err();
        assert_eq!(err.reason, NormalizationReason::Unparseable);
        assert_eq!(err.raw_value, "\"last tuesday\"");

        assert!(text("").is_err());
        assert!(normalize(&RawTimestamp::Fractional(f64::NAN)).is_err());
    }

    #[test]
    fn test_fractional_epoch() {
        // ---
        let ts = normalize(&RawTimestamp::Fractional(1_700_000_000.9)).unwrap();
        assert_eq!(ts.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_fractional_epoch_beyond_i64_is_out_of_range() {
        // ---
        for value in [1e19, -1e19, 9.3e18] {
            let err = normalize(&RawTimestamp::Fractional(value)).unwrap_err();
            assert_eq!(err.reason, NormalizationReason::OutOfRange);
        }
        let err = normalize(&RawTimestamp::Fractional(f64::INFINITY)).unwrap_err();
        assert_eq!(err.reason, NormalizationReason::Unparseable);
    }
}
