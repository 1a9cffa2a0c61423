//! Landing endpoint for raw wide batches.

use axum::{
    extract::{Path, State},
    routing::put,
    Json, Router,
};
use chrono::NaiveDate;
use serde::Serialize;
use tracing::info;

use super::{ApiError, AppState};
use crate::models::RawObservation;
use crate::store::Store;

// ---

pub fn router<S: Store>() -> Router<AppState<S>> {
    Router::new().route("/raw/{source_id}/{date}", put(archive::<S>))
}

#[derive(Serialize)]
struct Archived {
    source_id: String,
    date: NaiveDate,
    rows: usize,
}

/// Handle `PUT /raw/{source_id}/{date}`: store the batch, replacing any
/// earlier batch for the same source and date.
async fn archive<S: Store>(
    State(pipeline): State<AppState<S>>,
    Path((source_id, date)): Path<(String, NaiveDate)>,
    Json(rows): Json<Vec<RawObservation>>,
) -> Result<Json<Archived>, ApiError> {
    // ---
    info!("PUT /raw/{}/{} - {} rows", source_id, date, rows.len());
    pipeline.archive_batch(&source_id, date, &rows).await?;
    Ok(Json(Archived {
        rows: rows.len(),
        source_id,
        date,
    }))
}
