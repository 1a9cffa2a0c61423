//! Staged backfill merge endpoint.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::post, Json, Router};
use tracing::info;

use super::{run_status_code, AppState};
use crate::staging::MergeRequest;
use crate::store::Store;

// ---

pub fn router<S: Store>() -> Router<AppState<S>> {
    Router::new().route("/merge", post(merge::<S>))
}

/// Handle `POST /merge`.
///
/// Answers 200 when every pair merged, 207 when some sources were missing
/// or the run was cancelled, and 500 when a pair expired or failed. The body
/// is the full report in every case.
async fn merge<S: Store>(State(pipeline): State<AppState<S>>, Json(request): Json<MergeRequest>) -> impl IntoResponse {
    // ---
    info!(
        "POST /merge {}..={} sources={:?} dry_run={}",
        request.start, request.end, request.sources, request.dry_run
    );
    if request.end < request.start || request.sources.is_empty() {
        return (StatusCode::UNPROCESSABLE_ENTITY, "empty date range or source list").into_response();
    }
    let report = pipeline.merge_range(&request).await;
    (run_status_code(report.status), Json(report)).into_response()
}
