//! Staged backfill reconciliation.
//!
//! A staging buffer holds the readings of one source for one day. It moves
//! `Staged -> Merged`, and becomes `Expired` once its retention elapses; an
//! expired buffer is refused rather than merged or skipped. A pair with no
//! buffer at all is reported as missing.

use std::collections::HashMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::backfill::CancelFlag;
use crate::error::PipelineError;
use crate::models::{date_range, CanonicalReading, RunStatus};
use crate::store::FactStore;

// ---

#[derive(Debug, Clone, PartialEq)]
pub struct StagingBuffer {
    // ---
    pub source_id: String,
    pub date: NaiveDate,
    pub rows: Vec<CanonicalReading>,
    pub staged_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub merged_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StagingState {
    Staged,
    Merged,
    Expired,
}

impl StagingBuffer {
    pub fn state(&self, now: DateTime<Utc>) -> StagingState {
        // ---
        if now >= self.expires_at {
            StagingState::Expired
        } else if self.merged_at.is_some() {
            StagingState::Merged
        } else {
            StagingState::Staged
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct MergeRequest {
    // ---
    pub start: NaiveDate,
    /// Inclusive.
    pub end: NaiveDate,
    pub sources: Vec<String>,
    #[serde(default = "default_true")]
    pub update_only_if_changed: bool,
    #[serde(default)]
    pub dry_run: bool,
}

/// Row counts of one merge (or of what a dry run would do).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MergeCounts {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub estimated_bytes: u64,
}

impl MergeCounts {
    /// Rows that are (or would be) written.
    pub fn would_affect(&self) -> usize {
        self.inserted + self.updated
    }

    fn add(&mut self, other: &MergeCounts) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.estimated_bytes += other.estimated_bytes;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PairOutcome {
    Merged(MergeCounts),
    /// No staging buffer; the source is skipped for this date.
    Missing,
    /// The buffer outlived its retention and must be re-ingested.
    Expired { expired_at: DateTime<Utc> },
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct PairReport {
    pub date: NaiveDate,
    pub source_id: String,
    #[serde(flatten)]
    pub outcome: PairOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeReport {
    // ---
    pub run_id: Uuid,
    pub dry_run: bool,
    pub status: RunStatus,
    pub cancelled: bool,
    pub totals: MergeCounts,
    pub pairs: Vec<PairReport>,
}

impl MergeReport {
    pub fn missing(&self) -> impl Iterator<Item = &PairReport> {
        self.pairs.iter().filter(|p| p.outcome == PairOutcome::Missing)
    }
}

/// The rows a merge writes and the counts it reports.
#[derive(Debug, Default)]
pub struct MergePlan {
    pub writes: Vec<CanonicalReading>,
    pub counts: MergeCounts,
}

/// Decide, row by row, whether a staged reading is inserted, updated or
/// left alone.
pub fn plan_merge(
    staged: &[CanonicalReading],
    existing: &HashMap<String, f64>,
    update_only_if_changed: bool,
) -> MergePlan {
    // ---
    let mut plan = MergePlan::default();
    for row in staged {
        let write = match existing.get(&row.fingerprint) {
            None => {
                plan.counts.inserted += 1;
                true
            }
            Some(current) if update_only_if_changed && *current == row.value => {
                plan.counts.unchanged += 1;
                false
            }
            Some(_) => {
                plan.counts.updated += 1;
                true
            }
        };
        if write {
            plan.counts.estimated_bytes += row.estimated_bytes();
            plan.writes.push(row.clone());
        }
    }
    plan
}

/// Builds staging buffers and merges them into the fact store.
pub struct StagingReconciler<'a, S> {
    store: &'a S,
    now: fn() -> DateTime<Utc>,
}

impl<'a, S: FactStore + Sync> StagingReconciler<'a, S> {
    // ---
    pub fn new(store: &'a S, now: fn() -> DateTime<Utc>) -> Self {
        StagingReconciler { store, now }
    }

    /// Write a fresh buffer for `(source_id, date)`; restages replace the old
    /// buffer and restart its retention.
    pub async fn stage(
        &self,
        source_id: &str,
        date: NaiveDate,
        rows: Vec<CanonicalReading>,
        retention: chrono::Duration,
    ) -> Result<StagingBuffer, PipelineError> {
        // ---
        let staged_at = (self.now)();
        let buffer = StagingBuffer {
            source_id: source_id.to_string(),
            date,
            rows,
            staged_at,
            expires_at: staged_at + retention,
            merged_at: None,
        };
        self.store.put_staging(buffer.clone()).await?;
        info!(
            "Staged {} rows for {}/{} (expires {})",
            buffer.rows.len(),
            source_id,
            date,
            buffer.expires_at
        );
        Ok(buffer)
    }

    /// Merge one `(source, date)` buffer. Safe to repeat with the same input.
    pub async fn merge_one(
        &self,
        source_id: &str,
        date: NaiveDate,
        update_only_if_changed: bool,
        dry_run: bool,
    ) -> Result<MergeCounts, PipelineError> {
        let mut planned = HashMap::new();
        self.merge_pair(source_id, date, update_only_if_changed, dry_run, &mut planned)
            .await
    }

    /// Merge one pair. A dry run writes nothing, so the values it would have
    /// written for this date are kept in `planned` and layered over the
    /// store for the sources that follow.
    async fn merge_pair(
        &self,
        source_id: &str,
        date: NaiveDate,
        update_only_if_changed: bool,
        dry_run: bool,
        planned: &mut HashMap<String, f64>,
    ) -> Result<MergeCounts, PipelineError> {
        // ---
        let now = (self.now)();
        let Some(buffer) = self.store.staging(source_id, date).await? else {
            return Err(PipelineError::MissingStaging {
                source_id: source_id.to_string(),
                date,
            });
        };
        if buffer.state(now) == StagingState::Expired {
            return Err(PipelineError::ExpiredStaging {
                source_id: source_id.to_string(),
                date,
                expired_at: buffer.expires_at,
            });
        }

        let fingerprints: Vec<String> = buffer.rows.iter().map(|r| r.fingerprint.clone()).collect();
        let mut existing = self.store.existing_values(date, &fingerprints).await?;
        if dry_run {
            for fp in &fingerprints {
                if let Some(value) = planned.get(fp) {
                    existing.insert(fp.clone(), *value);
                }
            }
        }
        let plan = plan_merge(&buffer.rows, &existing, update_only_if_changed);

        if dry_run {
            planned.extend(plan.writes.iter().map(|r| (r.fingerprint.clone(), r.value)));
        } else {
            self.store.apply_merge(source_id, date, plan.writes, now).await?;
        }
        Ok(plan.counts)
    }

    /// Merge every requested source for every date in `[start, end]`.
    ///
    /// A missing buffer skips only that source on that date. Expired buffers
    /// and store failures are reported per pair without stopping the range.
    /// Cancellation is honoured between dates.
    pub async fn merge_range(&self, request: &MergeRequest, cancel: &CancelFlag) -> MergeReport {
        // ---
        let mut report = MergeReport {
            run_id: Uuid::new_v4(),
            dry_run: request.dry_run,
            status: RunStatus::Success,
            cancelled: false,
            totals: MergeCounts::default(),
            pairs: Vec::new(),
        };

        for date in date_range(request.start, request.end) {
            if cancel.is_cancelled() {
                warn!("Merge cancelled before {}", date);
                report.cancelled = true;
                break;
            }

            let mut planned = HashMap::new();
            for source_id in &request.sources {
                let outcome = match self
                    .merge_pair(
                        source_id,
                        date,
                        request.update_only_if_changed,
                        request.dry_run,
                        &mut planned,
                    )
                    .await
                {
                    Ok(counts) => {
                        info!(
                            "{} {}/{}: +{} ~{} ={}",
                            if request.dry_run { "Would merge" } else { "Merged" },
                            source_id,
                            date,
                            counts.inserted,
                            counts.updated,
                            counts.unchanged
                        );
                        report.totals.add(&counts);
                        PairOutcome::Merged(counts)
                    }
                    Err(PipelineError::MissingStaging { .. }) => {
                        warn!("No staging buffer for {}/{}, skipping source", source_id, date);
                        PairOutcome::Missing
                    }
                    Err(PipelineError::ExpiredStaging { expired_at, .. }) => {
                        error!("Staging buffer {}/{} expired at {}, re-ingest required", source_id, date, expired_at);
                        PairOutcome::Expired { expired_at }
                    }
                    Err(e) => {
                        error!("Merge of {}/{} failed: {}", source_id, date, e);
                        PairOutcome::Failed { error: e.to_string() }
                    }
                };
                report.pairs.push(PairReport {
                    date,
                    source_id: source_id.clone(),
                    outcome,
                });
            }
        }

        report.status = merge_status(&report);
        report
    }
}

fn merge_status(report: &MergeReport) -> RunStatus {
    // ---
    let failed = report
        .pairs
        .iter()
        .any(|p| matches!(p.outcome, PairOutcome::Expired { .. } | PairOutcome::Failed { .. }));
    if failed {
        RunStatus::Failed
    } else if report.cancelled || report.missing().next().is_some() {
        RunStatus::Partial
    } else {
        RunStatus::Success
    }
}
