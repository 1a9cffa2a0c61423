//! Operator-driven recomputation of a date range.
//!
//! Used after calibration or assignment corrections: every date is rebuilt
//! from its archived raw batches against the reference data in force when
//! that date is processed. Cancellation is checked between dates only, so an
//! interrupted run never leaves a date half-written.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::materialize::FactMaterializer;
use crate::models::{date_range, RawObservation, RunStatus};
use crate::store::{PartitionDiff, Store};

// ---

/// Cooperative cancellation shared between a long run and whoever stops it.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DateOutcome {
    Materialized { rows_written: usize, diff: PartitionDiff },
    /// Nothing archived for this date.
    NoData,
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct DateReport {
    pub date: NaiveDate,
    #[serde(flatten)]
    pub outcome: DateOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackfillReport {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub cancelled: bool,
    pub dates: Vec<DateReport>,
}

/// Rematerialize every date in `[start, end]` from the raw archive.
#[tracing::instrument(skip(store, cancel))]
pub async fn recompute_range<S: Store>(store: &S, start: NaiveDate, end: NaiveDate, cancel: &CancelFlag) -> BackfillReport {
    // ---
    let materializer = FactMaterializer::new(store);
    let mut report = BackfillReport {
        run_id: Uuid::new_v4(),
        status: RunStatus::Success,
        cancelled: false,
        dates: Vec::new(),
    };

    for date in date_range(start, end) {
        if cancel.is_cancelled() {
            warn!("Recompute cancelled before {}", date);
            report.cancelled = true;
            break;
        }

        let outcome = match store.archived_batches(date).await {
            Ok(batches) if batches.is_empty() => {
                warn!("Nothing archived for {}, skipping", date);
                DateOutcome::NoData
            }
            Ok(batches) => {
                let batch: Vec<RawObservation> = batches.into_values().flatten().collect();
                match materializer.materialize(date, &batch).await {
                    Ok(done) => DateOutcome::Materialized {
                        rows_written: done.rows_written,
                        diff: done.diff,
                    },
                    Err(e) => {
                        error!("Recompute of {} failed: {}", date, e);
                        DateOutcome::Failed { error: e.to_string() }
                    }
                }
            }
            Err(e) => {
                error!("Loading archive for {} failed: {}", date, e);
                DateOutcome::Failed { error: e.to_string() }
            }
        };
        report.dates.push(DateReport { date, outcome });
    }

    report.status = if report.dates.iter().any(|d| matches!(d.outcome, DateOutcome::Failed { .. })) {
        RunStatus::Failed
    } else if report.cancelled || report.dates.iter().any(|d| d.outcome == DateOutcome::NoData) {
        RunStatus::Partial
    } else {
        RunStatus::Success
    };

    info!(
        "Recompute {}..={} finished: {} dates, status {}",
        start,
        end,
        report.dates.len(),
        report.status.as_str()
    );
    report
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_cancel_flag_is_shared() {
        // ---
        let flag = CancelFlag::default();
        let handle = flag.clone();
        assert!(!flag.is_cancelled());
        handle.cancel();
        assert!(flag.is_cancelled());
    }
}
