//! Fact materialization: wide batch for one date -> calibrated, deduplicated
//! long-form rows -> atomic partition replace (or a staging buffer).

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::assignment::AssignmentTable;
use crate::calibration::{CalibrationEngine, CalibrationTable, SkippedCorrections};
use crate::error::PipelineError;
use crate::models::{CanonicalReading, RawObservation};
use crate::staging::StagingReconciler;
use crate::store::{FactStore, PartitionDiff, ReferenceData};
use crate::wide;

// ---

const MAX_SAMPLES: usize = 5;

/// What was dropped or collapsed while building a date's rows.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct IngestSummary {
    // ---
    pub rows_in: usize,
    /// Rows dropped because their timestamp could not be normalized.
    pub rows_dropped: usize,
    /// Metric values dropped because they could not be coerced.
    pub values_dropped: usize,
    /// Rows whose instant falls outside the date being built.
    pub out_of_partition: usize,
    /// Rows of another source handed to a single-source staging build.
    pub foreign_source_rows: usize,
    /// Readings that shared a fingerprint with a later reading in the batch.
    pub duplicates_collapsed: usize,
    pub raw_readings: usize,
    pub derived_readings: usize,
    pub skipped_corrections: SkippedCorrections,
    pub unmapped_columns: BTreeSet<String>,
    pub samples: Vec<String>,
}

impl IngestSummary {
    fn sample(&mut self, reason: impl Into<String>) {
        if self.samples.len() < MAX_SAMPLES {
            self.samples.push(reason.into());
        }
    }

    fn log(&self, label: &str) {
        // ---
        if self.rows_dropped + self.values_dropped + self.out_of_partition + self.foreign_source_rows > 0 {
            warn!(
                "{}: dropped {} rows (timestamp), {} values (coercion), {} out of partition, {} foreign; samples={:?}",
                label,
                self.rows_dropped,
                self.values_dropped,
                self.out_of_partition,
                self.foreign_source_rows,
                self.samples
            );
        }
        if self.skipped_corrections.ambiguous > 0 {
            warn!(
                "{}: {} sensor instants with conflicting indoor/outdoor assignments, multivariate correction skipped",
                label, self.skipped_corrections.ambiguous
            );
        }
        if !self.unmapped_columns.is_empty() {
            warn!("{}: unmapped columns {:?}", label, self.unmapped_columns);
        }
        debug!(
            "{}: {} raw + {} derived readings, {} duplicates collapsed",
            label, self.raw_readings, self.derived_readings, self.duplicates_collapsed
        );
    }
}

/// The complete row set for one date.
#[derive(Debug)]
pub struct Materialized {
    pub date: NaiveDate,
    /// Ordered by fingerprint, no two rows share one.
    pub rows: Vec<CanonicalReading>,
    pub summary: IngestSummary,
}

#[derive(Debug, Serialize)]
pub struct MaterializeReport {
    pub run_id: Uuid,
    pub date: NaiveDate,
    pub rows_written: usize,
    pub diff: PartitionDiff,
    pub summary: IngestSummary,
}

#[derive(Debug, Serialize)]
pub struct StageReport {
    pub run_id: Uuid,
    pub source_id: String,
    pub date: NaiveDate,
    pub rows_staged: usize,
    pub expires_at: DateTime<Utc>,
    pub summary: IngestSummary,
}

/// Load the reference data in force right now.
pub async fn load_engine<S: ReferenceData + Sync>(store: &S) -> Result<CalibrationEngine, PipelineError> {
    // ---
    let rules = CalibrationTable::new(store.calibration_rules().await?)?;
    let models = store.multivariate_models().await?;
    let assignments = AssignmentTable::new(store.assignment_intervals().await?);
    debug!(
        "Loaded {} calibration rules, {} models, {} assignment intervals",
        rules.len(),
        models.len(),
        assignments.len()
    );
    Ok(CalibrationEngine::new(rules, models, assignments))
}

/// Build the full row set for `date` from a wide batch.
///
/// When two readings share a fingerprint the later one in batch order wins.
/// With `only_source` set, rows of other sources are counted and skipped.
pub fn build(
    engine: &CalibrationEngine,
    date: NaiveDate,
    batch: &[RawObservation],
    only_source: Option<&str>,
) -> Result<Materialized, PipelineError> {
    // ---
    let mut summary = IngestSummary {
        rows_in: batch.len(),
        ..IngestSummary::default()
    };
    let mut facts: BTreeMap<String, CanonicalReading> = BTreeMap::new();

    for row in batch {
        if only_source.is_some_and(|s| s != row.source_id) {
            summary.foreign_source_rows += 1;
            continue;
        }
        let schema = wide::schema_for(&row.source_id).ok_or_else(|| PipelineError::UnknownSource {
            source_id: row.source_id.clone(),
        })?;

        let expanded = wide::expand(row, schema);
        summary.unmapped_columns.extend(expanded.unmapped_columns);

        if let Some(e) = expanded.timestamp_error {
            summary.rows_dropped += 1;
            summary.sample(format!("{}: {}", row.sensor_id, e));
            continue;
        }
        if expanded.timestamp.is_some_and(|ts| ts.date_naive() != date) {
            summary.out_of_partition += 1;
            continue;
        }

        // Only rows that stay in the partition contribute dropped values
        summary.values_dropped += expanded.coercion_errors.len();
        for e in &expanded.coercion_errors {
            summary.sample(format!("{}: {}", row.sensor_id, e));
        }

        for reading in expanded.readings {
            if facts.insert(reading.fingerprint.clone(), reading).is_some() {
                summary.duplicates_collapsed += 1;
            }
        }
    }

    let raw: Vec<CanonicalReading> = facts.values().cloned().collect();
    summary.raw_readings = raw.len();

    let derived = engine.derive_calibrated_metrics(&raw, date);
    summary.derived_readings = derived.readings.len();
    summary.skipped_corrections = derived.skipped;
    for e in &derived.ambiguities {
        summary.sample(e.to_string());
    }
    for reading in derived.readings {
        facts.insert(reading.fingerprint.clone(), reading);
    }

    Ok(Materialized {
        date,
        rows: facts.into_values().collect(),
        summary,
    })
}

/// Turns wide batches into fact rows and writes them.
pub struct FactMaterializer<'a, S> {
    store: &'a S,
}

impl<'a, S> FactMaterializer<'a, S>
where
    S: FactStore + ReferenceData + Sync,
{
    // ---
    pub fn new(store: &'a S) -> Self {
        FactMaterializer { store }
    }

    /// Rebuild the `date` partition from `batch` and swap it in atomically.
    ///
    /// Reference data is reloaded on every call. Re-running with unchanged
    /// inputs yields the same rows and a no-op diff.
    #[tracing::instrument(skip(self, batch), fields(rows = batch.len()))]
    pub async fn materialize(&self, date: NaiveDate, batch: &[RawObservation]) -> Result<MaterializeReport, PipelineError> {
        // ---
        let engine = load_engine(self.store).await?;
        let built = build(&engine, date, batch, None)?;
        built.summary.log(&format!("materialize {date}"));

        let rows_written = built.rows.len();
        let diff = self
            .store
            .replace_partition(date, built.rows)
            .await
            .map_err(|source| PipelineError::AtomicReplace { date, source })?;

        info!(
            "Materialized {}: {} rows (+{} -{} ~{} ={})",
            date, rows_written, diff.inserted, diff.removed, diff.changed, diff.unchanged
        );

        Ok(MaterializeReport {
            run_id: Uuid::new_v4(),
            date,
            rows_written,
            diff,
            summary: built.summary,
        })
    }

    /// Build the rows of one source for `date` into a staging buffer.
    #[tracing::instrument(skip(self, batch, reconciler), fields(rows = batch.len()))]
    pub async fn stage(
        &self,
        reconciler: &StagingReconciler<'_, S>,
        source_id: &str,
        date: NaiveDate,
        batch: &[RawObservation],
        retention: chrono::Duration,
    ) -> Result<StageReport, PipelineError> {
        // ---
        let engine = load_engine(self.store).await?;
        let built = build(&engine, date, batch, Some(source_id))?;
        built.summary.log(&format!("stage {source_id}/{date}"));

        let rows_staged = built.rows.len();
        let buffer = reconciler.stage(source_id, date, built.rows, retention).await?;

        Ok(StageReport {
            run_id: Uuid::new_v4(),
            source_id: source_id.to_string(),
            date,
            rows_staged,
            expires_at: buffer.expires_at,
            summary: built.summary,
        })
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::assignment::{AssignmentInterval, ROLE_INDOOR, ROLE_OUTDOOR};
    use crate::calibration::{CalibrationRule, MultivariateModel};
    use crate::models::RawTimestamp;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 7, 1).unwrap()
    }

    fn wu(sensor: &str, ts: &str, metrics: serde_json::Value) -> RawObservation {
        // ---
        RawObservation {
            source_id: "WU".into(),
            sensor_id: sensor.into(),
            timestamp_raw: RawTimestamp::Text(ts.into()),
            metrics: serde_json::from_value(metrics).unwrap(),
        }
    }

    fn engine() -> CalibrationEngine {
        // ---
        let rule = CalibrationRule {
            sensor_id: "KNC1".into(),
            metric_name: "temperature".into(),
            slope: 0.91,
            intercept: 0.5,
            effective_date: NaiveDate::from_ymd_opt(2025, 1, 1).unwrap(),
            end_date: None,
            description: "co-location fit".into(),
        };
        CalibrationEngine::new(
            CalibrationTable::new(vec![rule]).unwrap(),
            MultivariateModel::defaults(),
            AssignmentTable::default(),
        )
    }

    #[test]
    fn test_build_expands_and_calibrates() {
        // ---
        let batch = vec![wu(
            "KNC1",
            "2025-07-01T10:00:00Z",
            json!({ "tempAvg": 20.0, "humidityAvg": 55.0, "stationID": "KNC1" }),
        )];

        let built = build(&engine(), day(), &batch, None).unwrap();
        let mut metrics: Vec<(&str, f64)> = built.rows.iter().map(|r| (r.metric_name.as_str(), r.value)).collect();
        metrics.sort_by(|a, b| a.0.cmp(b.0));

        assert_eq!(
            metrics,
            vec![("humidity", 55.0), ("temperature", 20.0), ("temperature_calibrated", 18.7)]
        );
        assert_eq!(built.summary.raw_readings, 2);
        assert_eq!(built.summary.derived_readings, 1);
    }

    #[test]
    fn test_build_recovers_per_row_and_per_value() {
        // ---
        let batch = vec![
            wu("KNC1", "not a time", json!({ "tempAvg": 20.0 })),
            wu("KNC1", "2025-07-01T11:00:00Z", json!({ "tempAvg": "warm", "humidityAvg": 40.0 })),
            wu("KNC1", "2025-07-02T00:00:00Z", json!({ "tempAvg": 21.0 })),
        ];

        let built = build(&engine(), day(), &batch, None).unwrap();
        assert_eq!(built.summary.rows_dropped, 1);
        assert_eq!(built.summary.values_dropped, 1);
        assert_eq!(built.summary.out_of_partition, 1);
        assert_eq!(built.rows.len(), 1);
        assert_eq!(built.rows[0].metric_name, "humidity");
        assert_eq!(built.summary.samples.len(), 2);
    }

    #[test]
    fn test_out_of_partition_row_does_not_count_its_bad_values() {
        // ---
        let batch = vec![wu("KNC1", "2025-07-02T00:00:00Z", json!({ "tempAvg": "warm", "humidityAvg": 40.0 }))];

        let built = build(&engine(), day(), &batch, None).unwrap();
        assert_eq!(built.summary.out_of_partition, 1);
        assert_eq!(built.summary.values_dropped, 0);
        assert!(built.summary.samples.is_empty());
        assert!(built.rows.is_empty());
    }

    #[test]
    fn test_conflicting_class_keeps_the_rest_of_the_date() {
        // ---
        let since: DateTime<Utc> = "2025-01-01T00:00:00Z".parse().unwrap();
        let placed = |group: &str, role: &str| AssignmentInterval {
            group_id: group.into(),
            sensor_id: "tsi-9".into(),
            role: role.into(),
            start_ts: since,
            end_ts: None,
        };
        let engine = CalibrationEngine::new(
            CalibrationTable::default(),
            MultivariateModel::defaults(),
            AssignmentTable::new(vec![placed("home-1", ROLE_INDOOR), placed("yard-1", ROLE_OUTDOOR)]),
        );
        let mut air = wu("tsi-9", "2025-07-01T10:00:00Z", json!({ "pm2_5": 12.0, "rh": 40.0 }));
        air.source_id = "TSI".into();
        let batch = vec![wu("KNC1", "2025-07-01T10:00:00Z", json!({ "tempAvg": 20.0 })), air];

        let built = build(&engine, day(), &batch, None).unwrap();
        assert_eq!(built.summary.skipped_corrections.ambiguous, 1);
        assert_eq!(built.summary.samples.len(), 1);
        assert!(built.summary.samples[0].contains("tsi-9"));
        assert_eq!(built.rows.len(), 3);
        assert!(built.rows.iter().all(|r| !r.metric_name.ends_with("_mv_corrected")));
    }

    #[test]
    fn test_unknown_source_is_an_error() {
        // ---
        let mut row = wu("KNC1", "2025-07-01T10:00:00Z", json!({ "tempAvg": 20.0 }));
        row.source_id = "NEWVENDOR".into();
        let err = build(&engine(), day(), &[row], None).unwrap_err();
        assert!(matches!(err, PipelineError::UnknownSource { .. }));
    }

    #[test]
    fn test_later_row_wins_on_duplicate_fingerprint() {
        // ---
        let mut first = wu("KNC1", "2025-07-01T10:00:00Z", json!({ "temperature": 20.0 }));
        first.source_id = "TSI".into();
        let batch = vec![first, wu("KNC1", "2025-07-01T10:00:00Z", json!({ "tempAvg": 22.0 }))];

        let built = build(&engine(), day(), &batch, None).unwrap();
        let raw: Vec<&CanonicalReading> = built.rows.iter().filter(|r| r.metric_name == "temperature").collect();
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0].value, 22.0);
        assert_eq!(raw[0].source_id, "WU");
        assert_eq!(built.summary.duplicates_collapsed, 1);
    }

    #[tokio::test]
    async fn test_materialize_replaces_partition() {
        // ---
        let store = MemoryStore::new();
        store.add_assignment_interval(AssignmentInterval {
            group_id: "yard".into(),
            sensor_id: "KNC1".into(),
            role: ROLE_OUTDOOR.into(),
            start_ts: "2025-01-01T00:00:00Z".parse().unwrap(),
            end_ts: None,
        });
        let materializer = FactMaterializer::new(&store);

        let first = vec![wu("KNC1", "2025-07-01T10:00:00Z", json!({ "tempAvg": 20.0, "humidityAvg": 50.0 }))];
        let report = materializer.materialize(day(), &first).await.unwrap();
        assert_eq!(report.diff.inserted, 2);

        // A smaller batch replaces, never merges into, the partition
        let second = vec![wu("KNC1", "2025-07-01T10:00:00Z", json!({ "humidityAvg": 51.0 }))];
        let report = materializer.materialize(day(), &second).await.unwrap();
        assert_eq!(report.diff.changed, 1);
        assert_eq!(report.diff.removed, 1);
        assert_eq!(store.partition(day()).await.unwrap().len(), 1);
    }
}
