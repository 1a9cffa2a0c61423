//! Error taxonomy of the harmonization core.
//!
//! Per-row and per-value errors (`NormalizationError`, `CoercionError`) are
//! recovered where they occur and folded into an [`IngestSummary`]. Per-date
//! and per-source errors surface through [`PipelineError`] so a multi-date
//! run can report exactly what needs attention.
//!
//! [`IngestSummary`]: crate::materialize::IngestSummary

use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizationReason {
    Unparseable,
    OutOfRange,
}

impl std::fmt::Display for NormalizationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NormalizationReason::Unparseable => f.write_str("unparseable"),
            NormalizationReason::OutOfRange => f.write_str("out of range"),
        }
    }
}

/// A raw timestamp that could not be turned into an instant.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("cannot normalize timestamp {raw_value}: {reason}")]
pub struct NormalizationError {
    pub reason: NormalizationReason,
    pub raw_value: String,
}

/// A metric value that could not be coerced to a finite float.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("cannot coerce column {column} value {raw_value} to a number")]
pub struct CoercionError {
    pub column: String,
    pub raw_value: String,
}

/// More than one assignment interval matched a single instant.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("sensor {sensor_id} role {role} matches {} intervals at {instant}: {group_ids:?}", .group_ids.len())]
pub struct AmbiguousAssignmentError {
    pub sensor_id: String,
    pub role: String,
    pub instant: DateTime<Utc>,
    pub group_ids: Vec<String>,
}

/// Two calibration rules for one `(sensor_id, metric_name)` overlap in time.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("calibration rules for {sensor_id}/{metric_name} overlap at {effective_date}")]
pub struct CalibrationConflict {
    pub sensor_id: String,
    pub metric_name: String,
    pub effective_date: NaiveDate,
}

/// Failures of the backing store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("payload encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("invalid stored data: {0}")]
    Invalid(String),

    #[error("injected fault: {0}")]
    Injected(&'static str),
}

/// Structural failures surfaced to the caller for one date or one source.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    AmbiguousAssignment(#[from] AmbiguousAssignmentError),

    #[error(transparent)]
    CalibrationConflict(#[from] CalibrationConflict),

    #[error("no wide schema is registered for source {source_id}")]
    UnknownSource { source_id: String },

    #[error("atomic replace of partition {date} failed, previous rows remain visible: {source}")]
    AtomicReplace {
        date: NaiveDate,
        #[source]
        source: StoreError,
    },

    #[error("staging buffer {source_id}/{date} expired at {expired_at}; re-ingest required")]
    ExpiredStaging {
        source_id: String,
        date: NaiveDate,
        expired_at: DateTime<Utc>,
    },

    #[error("no staging buffer for {source_id}/{date}")]
    MissingStaging { source_id: String, date: NaiveDate },

    #[error("no archived batches for {date}")]
    NothingArchived { date: NaiveDate },

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_error_messages_name_the_offender() {
        // ---
        let err = NormalizationError {
            reason: NormalizationReason::Unparseable,
            raw_value: "\"yesterday\"".into(),
        };
        assert_eq!(
            err.to_string(),
            "cannot normalize timestamp \"yesterday\": unparseable"
        );

        let err = PipelineError::ExpiredStaging {
            source_id: "TSI".into(),
            date: NaiveDate::from_ymd_opt(2025, 7, 2).unwrap(),
            expired_at: DateTime::from_timestamp(0, 0).unwrap(),
        };
        assert!(err.to_string().contains("TSI/2025-07-02"));
        assert!(err.to_string().contains("re-ingest"));
    }
}
