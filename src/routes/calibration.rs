//! Calibration rule lookup.

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use chrono::NaiveDate;
use serde::Deserialize;

use super::{ApiError, AppState};
use crate::calibration::CalibrationRule;
use crate::store::Store;

// ---

pub fn router<S: Store>() -> Router<AppState<S>> {
    Router::new().route("/calibration", get(lookup::<S>))
}

#[derive(Debug, Deserialize)]
struct CalibrationParams {
    sensor_id: String,
    metric_name: String,
    as_of: NaiveDate,
}

/// Handle `GET /calibration?sensor_id&metric_name&as_of`. Falls back to the
/// metric's default rule; `null` when neither applies.
async fn lookup<S: Store>(
    State(pipeline): State<AppState<S>>,
    Query(params): Query<CalibrationParams>,
) -> Result<Json<Option<CalibrationRule>>, ApiError> {
    // ---
    let rule = pipeline
        .calibration_for(&params.sensor_id, &params.metric_name, params.as_of)
        .await?;
    Ok(Json(rule))
}
