//! Fact store query endpoint.

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use chrono::NaiveDate;
use serde::Deserialize;
use tracing::debug;

use super::{ApiError, AppState};
use crate::pipeline::AttributedReading;
use crate::store::{ReadingsQuery, Store};

// ---

pub fn router<S: Store>() -> Router<AppState<S>> {
    Router::new().route("/readings", get(readings::<S>))
}

/// Query parameters for filtering fact rows.
#[derive(Debug, Deserialize)]
struct ReadingsParams {
    start: NaiveDate,
    end: NaiveDate,
    sensor_id: Option<String>,
    metric_name: Option<String>,
    /// Attribute each row to its group in this role.
    role: Option<String>,
    limit: Option<u32>,
}

async fn readings<S: Store>(
    State(pipeline): State<AppState<S>>,
    Query(params): Query<ReadingsParams>,
) -> Result<Json<Vec<AttributedReading>>, ApiError> {
    // ---
    debug!("GET /readings {:?}", params);
    let query = ReadingsQuery {
        start: params.start,
        end: params.end,
        sensor_id: params.sensor_id,
        metric_name: params.metric_name,
        limit: params.limit,
    };
    let rows = pipeline.readings(&query, params.role.as_deref()).await?;
    Ok(Json(rows))
}
