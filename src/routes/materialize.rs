//! Endpoints that rebuild facts from the raw archive: whole-date
//! materialization, per-source staging and operator-driven recompute.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use chrono::NaiveDate;
use serde::Deserialize;
use tracing::info;

use super::{run_status_code, ApiError, AppState};
use crate::materialize::{MaterializeReport, StageReport};
use crate::store::Store;

// ---

pub fn router<S: Store>() -> Router<AppState<S>> {
    // ---
    Router::new()
        .route("/materialize/{date}", post(materialize::<S>))
        .route("/stage/{source_id}/{date}", post(stage::<S>))
        .route("/recompute", post(recompute::<S>))
}

async fn materialize<S: Store>(
    State(pipeline): State<AppState<S>>,
    Path(date): Path<NaiveDate>,
) -> Result<Json<MaterializeReport>, ApiError> {
    // ---
    info!("POST /materialize/{}", date);
    Ok(Json(pipeline.materialize_archived(date).await?))
}

async fn stage<S: Store>(
    State(pipeline): State<AppState<S>>,
    Path((source_id, date)): Path<(String, NaiveDate)>,
) -> Result<Json<StageReport>, ApiError> {
    // ---
    info!("POST /stage/{}/{}", source_id, date);
    Ok(Json(pipeline.stage_archived(&source_id, date).await?))
}

#[derive(Debug, Deserialize)]
struct RecomputeRequest {
    start: NaiveDate,
    /// Inclusive.
    end: NaiveDate,
}

async fn recompute<S: Store>(
    State(pipeline): State<AppState<S>>,
    Json(request): Json<RecomputeRequest>,
) -> impl IntoResponse {
    // ---
    info!("POST /recompute {}..={}", request.start, request.end);
    if request.end < request.start {
        return (StatusCode::UNPROCESSABLE_ENTITY, "end precedes start").into_response();
    }
    let report = pipeline.recompute_range(request.start, request.end).await;
    (run_status_code(report.status), Json(report)).into_response()
}
