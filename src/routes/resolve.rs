//! Point-in-time group lookup.

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ApiError, AppState};
use crate::assignment::AssignmentConflict;
use crate::store::Store;

// ---

pub fn router<S: Store>() -> Router<AppState<S>> {
    Router::new()
        .route("/resolve", get(resolve::<S>))
        .route("/assignments/validate", get(validate::<S>))
}

#[derive(Debug, Deserialize)]
struct ResolveParams {
    sensor_id: String,
    role: String,
    at: DateTime<Utc>,
}

#[derive(Serialize)]
struct Resolved {
    sensor_id: String,
    role: String,
    at: DateTime<Utc>,
    group_id: Option<String>,
}

/// Handle `GET /resolve?sensor_id&role&at`. A sensor with no interval
/// covering `at` resolves to `null`, overlapping intervals answer 409.
async fn resolve<S: Store>(
    State(pipeline): State<AppState<S>>,
    Query(params): Query<ResolveParams>,
) -> Result<Json<Resolved>, ApiError> {
    // ---
    let group_id = pipeline.resolve(&params.sensor_id, &params.role, params.at).await?;
    Ok(Json(Resolved {
        sensor_id: params.sensor_id,
        role: params.role,
        at: params.at,
        group_id,
    }))
}

/// Handle `GET /assignments/validate`: every pair of intervals that assigns
/// one sensor to two groups in the same role at once.
async fn validate<S: Store>(State(pipeline): State<AppState<S>>) -> Result<Json<Vec<AssignmentConflict>>, ApiError> {
    // ---
    Ok(Json(pipeline.validate_assignments().await?))
}
