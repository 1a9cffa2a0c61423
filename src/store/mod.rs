//! Storage seam of the pipeline.
//!
//! The core talks to three traits: the durable fact store with its staging
//! area, the externally administered reference data, and the archive of raw
//! wide batches. `MemoryStore` backs tests and local runs, `PgStore` backs
//! production.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::assignment::AssignmentInterval;
use crate::calibration::{CalibrationRule, MultivariateModel};
use crate::error::StoreError;
use crate::models::{CanonicalReading, RawObservation};
use crate::staging::StagingBuffer;

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

// ---

/// Filter for reading facts back out of the store.
#[derive(Debug, Clone, Deserialize)]
pub struct ReadingsQuery {
    // ---
    pub start: NaiveDate,
    /// Inclusive.
    pub end: NaiveDate,
    pub sensor_id: Option<String>,
    pub metric_name: Option<String>,
    pub limit: Option<u32>,
}

impl ReadingsQuery {
    pub const DEFAULT_LIMIT: u32 = 1000;

    pub fn matches(&self, reading: &CanonicalReading) -> bool {
        // ---
        let date = reading.partition_date();
        date >= self.start
            && date <= self.end
            && self.sensor_id.as_ref().map_or(true, |id| &reading.sensor_id == id)
            && self.metric_name.as_ref().map_or(true, |m| &reading.metric_name == m)
    }

    pub fn limit(&self) -> usize {
        self.limit.unwrap_or(Self::DEFAULT_LIMIT) as usize
    }
}

/// How a partition changed when it was replaced.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PartitionDiff {
    pub inserted: usize,
    pub removed: usize,
    pub changed: usize,
    pub unchanged: usize,
}

impl PartitionDiff {
    /// Compare the old `fingerprint -> (value, source)` set with the new rows.
    pub fn between(old: &HashMap<String, (f64, String)>, new: &[CanonicalReading]) -> Self {
        // ---
        let mut diff = PartitionDiff::default();
        for row in new {
            match old.get(&row.fingerprint) {
                None => diff.inserted += 1,
                Some((value, source)) if *value == row.value && *source == row.source_id => diff.unchanged += 1,
                Some(_) => diff.changed += 1,
            }
        }
        let kept = diff.unchanged + diff.changed;
        diff.removed = old.len().saturating_sub(kept);
        diff
    }

    pub fn is_noop(&self) -> bool {
        self.inserted == 0 && self.removed == 0 && self.changed == 0
    }
}

/// One audited invocation of a pipeline operation.
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub operation: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: String,
    pub detail: String,
}

/// The durable fact store and its staging area.
pub trait FactStore {
    /// Swap the whole partition for `date` to `rows`. Readers see either the
    /// previous complete set or the new one, never a mix.
    fn replace_partition(
        &self,
        date: NaiveDate,
        rows: Vec<CanonicalReading>,
    ) -> impl Future<Output = Result<PartitionDiff, StoreError>> + Send;

    fn partition(&self, date: NaiveDate) -> impl Future<Output = Result<Vec<CanonicalReading>, StoreError>> + Send;

    fn query(&self, query: &ReadingsQuery) -> impl Future<Output = Result<Vec<CanonicalReading>, StoreError>> + Send;

    /// Current values of the given fingerprints in the `date` partition.
    fn existing_values(
        &self,
        date: NaiveDate,
        fingerprints: &[String],
    ) -> impl Future<Output = Result<HashMap<String, f64>, StoreError>> + Send;

    /// Upsert `rows` by fingerprint and mark the buffer merged, atomically.
    fn apply_merge(
        &self,
        source_id: &str,
        date: NaiveDate,
        rows: Vec<CanonicalReading>,
        merged_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Write (or overwrite) the staging buffer for its `(source, date)`.
    fn put_staging(&self, buffer: StagingBuffer) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn staging(
        &self,
        source_id: &str,
        date: NaiveDate,
    ) -> impl Future<Output = Result<Option<StagingBuffer>, StoreError>> + Send;

    fn record_run(&self, run: &RunRecord) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// Calibration and assignment tables, administered outside the pipeline.
/// Every call returns the current contents; nothing is cached.
pub trait ReferenceData {
    fn calibration_rules(&self) -> impl Future<Output = Result<Vec<CalibrationRule>, StoreError>> + Send;

    fn assignment_intervals(&self) -> impl Future<Output = Result<Vec<AssignmentInterval>, StoreError>> + Send;

    fn multivariate_models(&self) -> impl Future<Output = Result<Vec<MultivariateModel>, StoreError>> + Send;
}

/// Landing area for raw wide batches, one per `(source, date)`.
pub trait RawArchive {
    fn archive_batch(
        &self,
        source_id: &str,
        date: NaiveDate,
        rows: &[RawObservation],
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn archived_batch(
        &self,
        source_id: &str,
        date: NaiveDate,
    ) -> impl Future<Output = Result<Option<Vec<RawObservation>>, StoreError>> + Send;

    /// All batches for `date`, ordered by source id.
    fn archived_batches(
        &self,
        date: NaiveDate,
    ) -> impl Future<Output = Result<BTreeMap<String, Vec<RawObservation>>, StoreError>> + Send;
}

/// Everything the pipeline needs from a backend.
pub trait Store: FactStore + ReferenceData + RawArchive + Send + Sync + 'static {}

impl<T> Store for T where T: FactStore + ReferenceData + RawArchive + Send + Sync + 'static {}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::TimeZone;

    fn row(metric: &str, value: f64) -> CanonicalReading {
        let ts = Utc.with_ymd_and_hms(2025, 7, 1, 0, 0, 0).unwrap();
        CanonicalReading::new(ts, "s-1", metric, value, "TSI")
    }

    #[test]
    fn test_partition_diff_counts() {
        // ---
        let old: HashMap<String, (f64, String)> = [row("a", 1.0), row("b", 2.0), row("c", 3.0)]
            .into_iter()
            .map(|r| (r.fingerprint, (r.value, r.source_id)))
            .collect();

        let new = vec![row("a", 1.0), row("b", 2.5), row("d", 4.0)];
        let diff = PartitionDiff::between(&old, &new);

        assert_eq!(
            diff,
            PartitionDiff {
                inserted: 1,
                removed: 1,
                changed: 1,
                unchanged: 1,
            }
        );
        assert!(!diff.is_noop());

        let same = vec![row("a", 1.0), row("b", 2.0), row("c", 3.0)];
        assert!(PartitionDiff::between(&old, &same).is_noop());
    }

    #[test]
    fn test_query_filters() {
        // ---
        let q = ReadingsQuery {
            start: NaiveDate::from_ymd_opt(2025, 7, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2025, 7, 1).unwrap(),
            sensor_id: Some("s-1".into()),
            metric_name: Some("a".into()),
            limit: None,
        };
        assert!(q.matches(&row("a", 1.0)));
        assert!(!q.matches(&row("b", 1.0)));
        assert_eq!(q.limit(), 1000);
    }
}
