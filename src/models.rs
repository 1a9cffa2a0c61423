//! Core data models for the harmonization pipeline.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

// ---

/// A timestamp exactly as a collector delivered it.
///
/// Integers are epoch values of unknown resolution, strings are date-time
/// text (or integer text). Floats only appear when a vendor serialises epoch
/// values as JSON doubles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawTimestamp {
    Epoch(i64),
    Fractional(f64),
    Text(String),
}

impl std::fmt::Display for RawTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RawTimestamp::Epoch(v) => write!(f, "{v}"),
            RawTimestamp::Fractional(v) => write!(f, "{v}"),
            RawTimestamp::Text(s) => write!(f, "{s:?}"),
        }
    }
}

/// One wide row from a collector: a sensor at an instant with many metric
/// columns, keyed by the vendor's column names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawObservation {
    // ---
    pub source_id: String,
    pub sensor_id: String,
    pub timestamp_raw: RawTimestamp,
    #[serde(default)]
    pub metrics: BTreeMap<String, serde_json::Value>,
}

/// One long-form fact row: a single metric of a single sensor at an instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CanonicalReading {
    // ---
    pub fingerprint: String,
    #[sqlx(rename = "ts")]
    pub timestamp: DateTime<Utc>,
    pub sensor_id: String,
    pub metric_name: String,
    pub value: f64,
    pub source_id: String,
}

impl CanonicalReading {
    // ---
    pub fn new(
        timestamp: DateTime<Utc>,
        sensor_id: impl Into<String>,
        metric_name: impl Into<String>,
        value: f64,
        source_id: impl Into<String>,
    ) -> Self {
        // ---
        let sensor_id = sensor_id.into();
        let metric_name = metric_name.into();
        CanonicalReading {
            fingerprint: fingerprint(&timestamp, &sensor_id, &metric_name),
            timestamp,
            sensor_id,
            metric_name,
            value,
            source_id: source_id.into(),
        }
    }

    /// Build a derived metric for the same sensor, instant and source.
    pub fn derive(&self, metric_name: impl Into<String>, value: f64) -> Self {
        CanonicalReading::new(
            self.timestamp,
            self.sensor_id.clone(),
            metric_name,
            value,
            self.source_id.clone(),
        )
    }

    /// The date partition this row lives in.
    pub fn partition_date(&self) -> NaiveDate {
        self.timestamp.date_naive()
    }

    /// Rough on-disk size of the row, used for dry-run volume estimates.
    pub fn estimated_bytes(&self) -> u64 {
        // fingerprint + ts + date + value + text columns
        (self.fingerprint.len() + 8 + 4 + 8) as u64
            + (self.sensor_id.len() + self.metric_name.len() + self.source_id.len()) as u64
    }
}

/// Overall outcome of an operation that spans several dates or sources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    /// Some dates or sources were skipped; everything attempted succeeded.
    Partial,
    /// At least one date or source needs operator attention.
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
        }
    }
}

/// Every date in `[start, end]`, empty if `end < start`.
pub fn date_range(start: NaiveDate, end: NaiveDate) -> impl Iterator<Item = NaiveDate> {
    start.iter_days().take_while(move |d| *d <= end)
}

/// Deterministic dedup key of a fact row.
///
/// Hex SHA-256 over the microsecond epoch, sensor id and metric name,
/// separated by the ASCII unit separator so that no id can bleed into the
/// next field.
pub fn fingerprint(timestamp: &DateTime<Utc>, sensor_id: &str, metric_name: &str) -> String {
    // ---
    let mut hasher = Sha256::new();
    hasher.update(timestamp.timestamp_micros().to_be_bytes());
    hasher.update([0x1f]);
    hasher.update(sensor_id.as_bytes());
    hasher.update([0x1f]);
    hasher.update(metric_name.as_bytes());
    format!("{:x}", hasher.finalize())
}
