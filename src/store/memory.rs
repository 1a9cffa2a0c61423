//! In-process store for tests and local runs.
//!
//! Partitions are immutable maps behind an `Arc`; a replace builds the new
//! map off to the side and swaps the pointer, so a failure before the swap
//! leaves the previous partition untouched.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, NaiveDate, Utc};

use super::{FactStore, PartitionDiff, RawArchive, ReadingsQuery, ReferenceData, RunRecord};
use crate::assignment::AssignmentInterval;
use crate::calibration::{CalibrationRule, MultivariateModel};
use crate::error::StoreError;
use crate::models::{CanonicalReading, RawObservation};
use crate::staging::StagingBuffer;

// ---

type Partition = Arc<BTreeMap<String, CanonicalReading>>;

#[derive(Debug, Default)]
struct Inner {
    partitions: BTreeMap<NaiveDate, Partition>,
    staging: BTreeMap<(String, NaiveDate), StagingBuffer>,
    raw: BTreeMap<(NaiveDate, String), Vec<RawObservation>>,
    rules: Vec<CalibrationRule>,
    intervals: Vec<AssignmentInterval>,
    models: Vec<MultivariateModel>,
    runs: Vec<RunRecord>,
}

#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    fail_next_replace: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    // ---
    /// An empty store seeded with the built-in multivariate models.
    pub fn new() -> Self {
        MemoryStore {
            inner: Mutex::new(Inner {
                models: MultivariateModel::defaults(),
                ..Inner::default()
            }),
            fail_next_replace: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_calibration_rule(&self, rule: CalibrationRule) {
        self.lock().rules.push(rule);
    }

    pub fn add_assignment_interval(&self, interval: AssignmentInterval) {
        self.lock().intervals.push(interval);
    }

    /// Make the next partition replace fail after the new rows are written
    /// aside but before they become visible.
    pub fn fail_next_replace(&self) {
        self.fail_next_replace.store(true, Ordering::SeqCst);
    }

    pub fn runs(&self) -> Vec<RunRecord> {
        self.lock().runs.clone()
    }

    /// Number of fact rows across all partitions.
    pub fn fact_count(&self) -> usize {
        self.lock().partitions.values().map(|p| p.len()).sum()
    }

    /// A deep copy of every fact row, ordered by date then fingerprint.
    pub fn snapshot(&self) -> Vec<CanonicalReading> {
        self.lock()
            .partitions
            .values()
            .flat_map(|p| p.values().cloned())
            .collect()
    }
}

impl FactStore for MemoryStore {
    // ---
    async fn replace_partition(&self, date: NaiveDate, rows: Vec<CanonicalReading>) -> Result<PartitionDiff, StoreError> {
        // ---
        let mut inner = self.lock();

        let old: HashMap<String, (f64, String)> = inner
            .partitions
            .get(&date)
            .map(|p| {
                p.values()
                    .map(|r| (r.fingerprint.clone(), (r.value, r.source_id.clone())))
                    .collect()
            })
            .unwrap_or_default();
        let diff = PartitionDiff::between(&old, &rows);

        let written: BTreeMap<String, CanonicalReading> =
            rows.into_iter().map(|r| (r.fingerprint.clone(), r)).collect();

        if self.fail_next_replace.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Injected("partition swap interrupted"));
        }

        inner.partitions.insert(date, Arc::new(written));
        Ok(diff)
    }

    async fn partition(&self, date: NaiveDate) -> Result<Vec<CanonicalReading>, StoreError> {
        Ok(self
            .lock()
            .partitions
            .get(&date)
            .map(|p| p.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn query(&self, query: &ReadingsQuery) -> Result<Vec<CanonicalReading>, StoreError> {
        // ---
        let inner = self.lock();
        let mut rows: Vec<CanonicalReading> = inner
            .partitions
            .range(query.start..=query.end.max(query.start))
            .flat_map(|(_, p)| p.values())
            .filter(|r| query.matches(r))
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            (a.timestamp, &a.sensor_id, &a.metric_name).cmp(&(b.timestamp, &b.sensor_id, &b.metric_name))
        });
        rows.truncate(query.limit());
        Ok(rows)
    }

    async fn existing_values(&self, date: NaiveDate, fingerprints: &[String]) -> Result<HashMap<String, f64>, StoreError> {
        // ---
        let inner = self.lock();
        let Some(partition) = inner.partitions.get(&date) else {
            return Ok(HashMap::new());
        };
        Ok(fingerprints
            .iter()
            .filter_map(|fp| partition.get(fp).map(|r| (fp.clone(), r.value)))
            .collect())
    }

    async fn apply_merge(
        &self,
        source_id: &str,
        date: NaiveDate,
        rows: Vec<CanonicalReading>,
        merged_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        // ---
        let mut inner = self.lock();

        let mut next: BTreeMap<String, CanonicalReading> = inner
            .partitions
            .get(&date)
            .map(|p| p.as_ref().clone())
            .unwrap_or_default();
        for row in rows {
            next.insert(row.fingerprint.clone(), row);
        }

        let Some(buffer) = inner.staging.get_mut(&(source_id.to_string(), date)) else {
            return Err(StoreError::Invalid(format!("no staging buffer {source_id}/{date}")));
        };
        buffer.merged_at = Some(merged_at);
        inner.partitions.insert(date, Arc::new(next));
        Ok(())
    }

    async fn put_staging(&self, buffer: StagingBuffer) -> Result<(), StoreError> {
        self.lock()
            .staging
            .insert((buffer.source_id.clone(), buffer.date), buffer);
        Ok(())
    }

    async fn staging(&self, source_id: &str, date: NaiveDate) -> Result<Option<StagingBuffer>, StoreError> {
        Ok(self.lock().staging.get(&(source_id.to_string(), date)).cloned())
    }

    async fn record_run(&self, run: &RunRecord) -> Result<(), StoreError> {
        self.lock().runs.push(run.clone());
        Ok(())
    }
}

impl ReferenceData for MemoryStore {
    async fn calibration_rules(&self) -> Result<Vec<CalibrationRule>, StoreError> {
        Ok(self.lock().rules.clone())
    }

    async fn assignment_intervals(&self) -> Result<Vec<AssignmentInterval>, StoreError> {
        Ok(self.lock().intervals.clone())
    }

    async fn multivariate_models(&self) -> Result<Vec<MultivariateModel>, StoreError> {
        Ok(self.lock().models.clone())
    }
}

impl RawArchive for MemoryStore {
    async fn archive_batch(&self, source_id: &str, date: NaiveDate, rows: &[RawObservation]) -> Result<(), StoreError> {
        self.lock().raw.insert((date, source_id.to_string()), rows.to_vec());
        Ok(())
    }

    async fn archived_batch(&self, source_id: &str, date: NaiveDate) -> Result<Option<Vec<RawObservation>>, StoreError> {
        Ok(self.lock().raw.get(&(date, source_id.to_string())).cloned())
    }

    async fn archived_batches(&self, date: NaiveDate) -> Result<BTreeMap<String, Vec<RawObservation>>, StoreError> {
        // ---
        Ok(self
            .lock()
            .raw
            .iter()
            .filter(|((d, _), _)| *d == date)
            .map(|((_, source), rows)| (source.clone(), rows.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::TimeZone;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 7, 1).unwrap()
    }

    fn row(metric: &str, value: f64) -> CanonicalReading {
        let ts = Utc.with_ymd_and_hms(2025, 7, 1, 6, 0, 0).unwrap();
        CanonicalReading::new(ts, "s-1", metric, value, "TSI")
    }

    #[test]
    fn test_failed_replace_keeps_previous_partition() {
        // ---
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            store.replace_partition(date(), vec![row("a", 1.0), row("b", 2.0)]).await.unwrap();

            store.fail_next_replace();
            let err = store.replace_partition(date(), vec![row("c", 3.0)]).await;
            assert!(err.is_err());

            let visible = store.partition(date()).await.unwrap();
            assert_eq!(visible.len(), 2);
            assert!(visible.iter().all(|r| r.metric_name != "c"));

            // The fault is one-shot
            store.replace_partition(date(), vec![row("c", 3.0)]).await.unwrap();
            assert_eq!(store.partition(date()).await.unwrap().len(), 1);
        });
    }

    #[test]
    fn test_existing_values_only_reports_known_rows() {
        // ---
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            let a = row("a", 1.5);
            store.replace_partition(date(), vec![a.clone()]).await.unwrap();

            let found = store
                .existing_values(date(), &[a.fingerprint.clone(), "missing".to_string()])
                .await
                .unwrap();
            assert_eq!(found.len(), 1);
            assert_eq!(found[&a.fingerprint], 1.5);
        });
    }

    #[test]
    fn test_defaults_are_seeded() {
        // ---
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            assert_eq!(store.multivariate_models().await.unwrap().len(), 2);
            assert!(store.calibration_rules().await.unwrap().is_empty());
        });
    }
}
