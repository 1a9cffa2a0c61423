use std::sync::Arc;

use anyhow::Result;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};

use sensorflow_harmonize::assignment::{AssignmentInterval, ROLE_OUTDOOR};
use sensorflow_harmonize::{routes, MemoryStore, Pipeline};

// ---

/// Bind the router on an ephemeral port and return its base URL along with
/// the pipeline it serves, so tests can seed reference data directly.
async fn spawn_app() -> Result<(String, Arc<Pipeline<MemoryStore>>)> {
    // ---
    let pipeline = Arc::new(Pipeline::new(MemoryStore::new(), chrono::Duration::days(7)));
    let app = routes::router(pipeline.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}"), pipeline))
}

#[derive(Debug, Deserialize)]
struct Reading {
    sensor_id: String,
    metric_name: String,
    value: f64,
    source_id: String,
    group_id: Option<String>,
}

fn weather_batch(date: &str) -> Value {
    json!([
        {
            "source_id": "WU",
            "sensor_id": "KNC1",
            "timestamp_raw": format!("{date}T12:00:00Z"),
            "metrics": {"tempAvg": 20, "humidityAvg": "55", "newVendorColumn": 1}
        },
        {
            "source_id": "WU",
            "sensor_id": "KNC1",
            "timestamp_raw": "not a time",
            "metrics": {"tempAvg": 19}
        }
    ])
}

#[tokio::test]
async fn health_endpoint_answers() -> Result<()> {
    // ---
    let (base, _) = spawn_app().await?;
    let body: Value = Client::new().get(format!("{base}/health")).send().await?.json().await?;
    assert_eq!(body["status"], "ok");
    Ok(())
}

#[tokio::test]
async fn archive_then_materialize_then_query() -> Result<()> {
    // ---
    let (base, _) = spawn_app().await?;
    let client = Client::new();

    let resp = client
        .put(format!("{base}/raw/WU/2025-07-01"))
        .json(&weather_batch("2025-07-01"))
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::OK);

    let report: Value = client
        .post(format!("{base}/materialize/2025-07-01"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(report["rows_written"], 2);
    assert_eq!(report["summary"]["rows_dropped"], 1);
    assert_eq!(report["summary"]["unmapped_columns"], json!(["newVendorColumn"]));

    let readings: Vec<Reading> = client
        .get(format!("{base}/readings?start=2025-07-01&end=2025-07-01&sensor_id=KNC1"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(readings.len(), 2);
    assert!(readings.iter().all(|r| r.sensor_id == "KNC1" && r.source_id == "WU"));
    assert!(readings.iter().all(|r| r.group_id.is_none()));

    let humidity = readings.iter().find(|r| r.metric_name == "humidity").unwrap();
    assert_eq!(humidity.value, 55.0);
    Ok(())
}

#[tokio::test]
async fn unknown_source_is_unprocessable() -> Result<()> {
    // ---
    let (base, _) = spawn_app().await?;
    let resp = Client::new()
        .put(format!("{base}/raw/ACME/2025-07-01"))
        .json(&json!([]))
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let body: Value = resp.json().await?;
    assert!(body["error"].as_str().unwrap().contains("ACME"));
    Ok(())
}

#[tokio::test]
async fn partial_merge_answers_multi_status() -> Result<()> {
    // ---
    let (base, _) = spawn_app().await?;
    let client = Client::new();

    for date in ["2025-07-01", "2025-07-02"] {
        client
            .put(format!("{base}/raw/WU/{date}"))
            .json(&weather_batch(date))
            .send()
            .await?
            .error_for_status()?;
        client
            .post(format!("{base}/stage/WU/{date}"))
            .send()
            .await?
            .error_for_status()?;
    }

    let request = json!({
        "start": "2025-07-01",
        "end": "2025-07-03",
        "sources": ["WU"],
    });
    let resp = client.post(format!("{base}/merge")).json(&request).send().await?;
    assert_eq!(resp.status(), StatusCode::MULTI_STATUS);

    let report: Value = resp.json().await?;
    assert_eq!(report["status"], "partial");
    assert_eq!(report["totals"]["inserted"], 4);
    assert_eq!(report["pairs"][2]["outcome"], "missing");
    Ok(())
}

#[tokio::test]
async fn lookups_answer_null_when_nothing_applies() -> Result<()> {
    // ---
    let (base, _) = spawn_app().await?;
    let client = Client::new();

    let resolved: Value = client
        .get(format!("{base}/resolve?sensor_id=KNC1&role=outdoor&at=2025-07-01T00:00:00Z"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(resolved["group_id"], Value::Null);

    let rule: Value = client
        .get(format!("{base}/calibration?sensor_id=KNC1&metric_name=temperature&as_of=2025-07-01"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(rule, Value::Null);
    Ok(())
}

fn outdoor(sensor: &str, group: &str, start: &str) -> Result<AssignmentInterval> {
    // ---
    Ok(AssignmentInterval {
        group_id: group.into(),
        sensor_id: sensor.into(),
        role: ROLE_OUTDOOR.into(),
        start_ts: start.parse()?,
        end_ts: None,
    })
}

#[tokio::test]
async fn overlapping_assignments_answer_conflict() -> Result<()> {
    // ---
    let (base, pipeline) = spawn_app().await?;
    let client = Client::new();
    pipeline.store().add_assignment_interval(outdoor("KNC1", "site-a", "2025-06-01T00:00:00Z")?);
    pipeline.store().add_assignment_interval(outdoor("KNC1", "site-b", "2025-06-15T00:00:00Z")?);

    let resp = client
        .get(format!("{base}/resolve?sensor_id=KNC1&role=outdoor&at=2025-07-01T00:00:00Z"))
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let body: Value = resp.json().await?;
    assert!(body["error"].as_str().unwrap().contains("KNC1"));

    client
        .put(format!("{base}/raw/WU/2025-07-01"))
        .json(&weather_batch("2025-07-01"))
        .send()
        .await?
        .error_for_status()?;
    client
        .post(format!("{base}/materialize/2025-07-01"))
        .send()
        .await?
        .error_for_status()?;

    let resp = client
        .get(format!("{base}/readings?start=2025-07-01&end=2025-07-01&role=outdoor"))
        .send()
        .await?;
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    let conflicts: Vec<Value> = client
        .get(format!("{base}/assignments/validate"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0]["sensor_id"], "KNC1");
    assert_eq!(conflicts[0]["first_group"], "site-a");
    assert_eq!(conflicts[0]["second_group"], "site-b");
    Ok(())
}
