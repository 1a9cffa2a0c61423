//! HTTP gateway of the harmonization service.
//!
//! Every sibling module owns its endpoints and exports a `router()`; this
//! module merges them, attaches the shared [`Pipeline`] as state and maps
//! [`PipelineError`] onto status codes, so `main.rs` only sees [`router`].

use std::sync::Arc;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json, Router,
};
use serde::Serialize;

use crate::error::PipelineError;
use crate::models::RunStatus;
use crate::pipeline::Pipeline;
use crate::store::Store;

mod calibration;
mod health;
mod materialize;
mod merge;
mod raw;
mod readings;
mod resolve;

// ---

/// Shared state of every route.
pub type AppState<S> = Arc<Pipeline<S>>;

pub fn router<S: Store>(pipeline: Arc<Pipeline<S>>) -> Router {
    // ---
    Router::new()
        .merge(health::router())
        .merge(raw::router())
        .merge(materialize::router())
        .merge(merge::router())
        .merge(resolve::router())
        .merge(calibration::router())
        .merge(readings::router())
        .with_state(pipeline)
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

/// A [`PipelineError`] on its way out as an HTTP response.
pub struct ApiError(PipelineError);

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // ---
        let status = match &self.0 {
            PipelineError::AmbiguousAssignment(_) | PipelineError::CalibrationConflict(_) => StatusCode::CONFLICT,
            PipelineError::UnknownSource { .. } | PipelineError::ExpiredStaging { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            PipelineError::MissingStaging { .. } | PipelineError::NothingArchived { .. } => StatusCode::NOT_FOUND,
            PipelineError::AtomicReplace { .. } | PipelineError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self.0);
        } else {
            tracing::warn!("Request rejected: {}", self.0);
        }
        (status, Json(ErrorBody { error: self.0.to_string() })).into_response()
    }
}

/// Status code of a multi-date or multi-source report. The body always
/// carries the full report, whatever the code.
fn run_status_code(status: RunStatus) -> StatusCode {
    match status {
        RunStatus::Success => StatusCode::OK,
        RunStatus::Partial => StatusCode::MULTI_STATUS,
        RunStatus::Failed => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
