//! The operational surface of the core: one handle over a store that runs
//! materializations, staging, merges and read-only lookups, and audits each
//! run.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::assignment::{AssignmentConflict, AssignmentTable};
use crate::backfill::{self, BackfillReport, CancelFlag};
use crate::calibration::{CalibrationRule, CalibrationTable};
use crate::error::PipelineError;
use crate::materialize::{FactMaterializer, MaterializeReport, StageReport};
use crate::models::{CanonicalReading, RawObservation, RunStatus};
use crate::staging::{MergeReport, MergeRequest, StagingReconciler};
use crate::store::{ReadingsQuery, RunRecord, Store};
use crate::wide;

// ---

/// A fact row attributed to the group its sensor belonged to at that instant.
#[derive(Debug, Clone, Serialize)]
pub struct AttributedReading {
    #[serde(flatten)]
    pub reading: CanonicalReading,
    pub group_id: Option<String>,
}

pub struct Pipeline<S> {
    store: S,
    retention: chrono::Duration,
    now: fn() -> DateTime<Utc>,
    cancel: CancelFlag,
}

impl<S: Store> Pipeline<S> {
    // ---
    pub fn new(store: S, retention: chrono::Duration) -> Self {
        Pipeline {
            store,
            retention,
            now: Utc::now,
            cancel: CancelFlag::default(),
        }
    }

    /// Replace the wall clock used for staging retention.
    pub fn with_clock(mut self, now: fn() -> DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    fn reconciler(&self) -> StagingReconciler<'_, S> {
        StagingReconciler::new(&self.store, self.now)
    }

    async fn audit(&self, run_id: Uuid, operation: &str, started_at: DateTime<Utc>, status: &str, detail: String) {
        // ---
        let run = RunRecord {
            run_id,
            operation: operation.to_string(),
            started_at,
            finished_at: (self.now)(),
            status: status.to_string(),
            detail,
        };
        if let Err(e) = self.store.record_run(&run).await {
            warn!("Failed to record {} run {}: {}", operation, run_id, e);
        }
    }

    /// Land a raw wide batch for `(source_id, date)`.
    pub async fn archive_batch(&self, source_id: &str, date: NaiveDate, rows: &[RawObservation]) -> Result<(), PipelineError> {
        // ---
        if wide::schema_for(source_id).is_none() {
            return Err(PipelineError::UnknownSource {
                source_id: source_id.to_string(),
            });
        }
        self.store.archive_batch(source_id, date, rows).await?;
        info!("Archived {} rows for {}/{}", rows.len(), source_id, date);
        Ok(())
    }

    /// Rebuild the `date` partition from `batch`.
    pub async fn materialize(&self, date: NaiveDate, batch: &[RawObservation]) -> Result<MaterializeReport, PipelineError> {
        // ---
        let started_at = (self.now)();
        let result = FactMaterializer::new(&self.store).materialize(date, batch).await;
        match &result {
            Ok(report) => {
                let detail = format!("{date}: {} rows", report.rows_written);
                self.audit(report.run_id, "materialize", started_at, RunStatus::Success.as_str(), detail)
                    .await
            }
            Err(e) => {
                self.audit(Uuid::new_v4(), "materialize", started_at, RunStatus::Failed.as_str(), format!("{date}: {e}"))
                    .await
            }
        }
        result
    }

    /// Rebuild the `date` partition from every archived batch of that date.
    pub async fn materialize_archived(&self, date: NaiveDate) -> Result<MaterializeReport, PipelineError> {
        // ---
        let batches = self.store.archived_batches(date).await?;
        if batches.is_empty() {
            return Err(PipelineError::NothingArchived { date });
        }
        let batch: Vec<RawObservation> = batches.into_values().flatten().collect();
        self.materialize(date, &batch).await
    }

    /// Build a staging buffer for one source and date.
    pub async fn stage(&self, source_id: &str, date: NaiveDate, batch: &[RawObservation]) -> Result<StageReport, PipelineError> {
        // ---
        let reconciler = self.reconciler();
        FactMaterializer::new(&self.store)
            .stage(&reconciler, source_id, date, batch, self.retention)
            .await
    }

    pub async fn stage_archived(&self, source_id: &str, date: NaiveDate) -> Result<StageReport, PipelineError> {
        // ---
        let Some(batch) = self.store.archived_batch(source_id, date).await? else {
            return Err(PipelineError::NothingArchived { date });
        };
        self.stage(source_id, date, &batch).await
    }

    /// Merge staged buffers over a date range.
    pub async fn merge_range(&self, request: &MergeRequest) -> MergeReport {
        // ---
        let started_at = (self.now)();
        let report = self.reconciler().merge_range(request, &self.cancel).await;
        let detail = format!(
            "{}..={} sources={:?} dry_run={} writes={}",
            request.start,
            request.end,
            request.sources,
            request.dry_run,
            report.totals.would_affect()
        );
        self.audit(report.run_id, "merge", started_at, report.status.as_str(), detail)
            .await;
        report
    }

    /// Rematerialize `[start, end]` from the raw archive.
    pub async fn recompute_range(&self, start: NaiveDate, end: NaiveDate) -> BackfillReport {
        // ---
        let started_at = (self.now)();
        let report = backfill::recompute_range(&self.store, start, end, &self.cancel).await;
        let detail = format!("{start}..={end}: {} dates", report.dates.len());
        self.audit(report.run_id, "recompute", started_at, report.status.as_str(), detail)
            .await;
        report
    }

    /// The group a sensor belonged to in `role` at `instant`.
    pub async fn resolve(&self, sensor_id: &str, role: &str, instant: DateTime<Utc>) -> Result<Option<String>, PipelineError> {
        // ---
        let table = AssignmentTable::new(self.store.assignment_intervals().await?);
        Ok(table.resolve(sensor_id, role, instant)?)
    }

    /// The calibration rule in force for a sensor and metric on `date`.
    pub async fn calibration_for(
        &self,
        sensor_id: &str,
        metric_name: &str,
        date: NaiveDate,
    ) -> Result<Option<CalibrationRule>, PipelineError> {
        // ---
        let table = CalibrationTable::new(self.store.calibration_rules().await?)?;
        Ok(table.lookup(sensor_id, metric_name, date).cloned())
    }

    /// Fact rows matching `query`, each attributed to its group in `role`
    /// when a role is given.
    pub async fn readings(&self, query: &ReadingsQuery, role: Option<&str>) -> Result<Vec<AttributedReading>, PipelineError> {
        // ---
        let rows = self.store.query(query).await?;
        let Some(role) = role else {
            return Ok(rows
                .into_iter()
                .map(|reading| AttributedReading { reading, group_id: None })
                .collect());
        };

        let table = AssignmentTable::new(self.store.assignment_intervals().await?);
        rows.into_iter()
            .map(|reading| -> Result<AttributedReading, PipelineError> {
                let group_id = table.resolve(&reading.sensor_id, role, reading.timestamp)?;
                Ok(AttributedReading { reading, group_id })
            })
            .collect()
    }

    /// Overlapping assignment intervals in the current reference data.
    pub async fn validate_assignments(&self) -> Result<Vec<AssignmentConflict>, PipelineError> {
        // ---
        let table = AssignmentTable::new(self.store.assignment_intervals().await?);
        let conflicts = table.validate();
        if !conflicts.is_empty() {
            warn!("{} overlapping assignment intervals", conflicts.len());
        }
        Ok(conflicts)
    }
}
