//! Database schema management for `sensorflow-harmonize`.
//!
//! Ensures required tables and indexes exist before serving requests.
//! Applied once on startup from `main.rs`.

use anyhow::Result;
use sqlx::PgPool;

use crate::calibration::MultivariateModel;

// ---

const TABLES: &[&str] = &[
    // Long-form fact store, one row per fingerprint
    r#"
    CREATE TABLE IF NOT EXISTS sensor_readings (
        fingerprint  TEXT             PRIMARY KEY,
        reading_date DATE             NOT NULL,
        ts           TIMESTAMPTZ      NOT NULL,
        sensor_id    TEXT             NOT NULL,
        metric_name  TEXT             NOT NULL,
        value        DOUBLE PRECISION NOT NULL,
        source_id    TEXT             NOT NULL
    );
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_sensor_readings_date_sensor_metric
        ON sensor_readings (reading_date, sensor_id, metric_name);
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS staging_buffers (
        source_id   TEXT        NOT NULL,
        buffer_date DATE        NOT NULL,
        staged_at   TIMESTAMPTZ NOT NULL,
        expires_at  TIMESTAMPTZ NOT NULL,
        merged_at   TIMESTAMPTZ,
        row_count   BIGINT      NOT NULL,
        PRIMARY KEY (source_id, buffer_date)
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS staging_readings (
        source_id     TEXT             NOT NULL,
        buffer_date   DATE             NOT NULL,
        fingerprint   TEXT             NOT NULL,
        ts            TIMESTAMPTZ      NOT NULL,
        sensor_id     TEXT             NOT NULL,
        metric_name   TEXT             NOT NULL,
        value         DOUBLE PRECISION NOT NULL,
        row_source_id TEXT             NOT NULL,
        PRIMARY KEY (source_id, buffer_date, fingerprint),
        FOREIGN KEY (source_id, buffer_date)
            REFERENCES staging_buffers (source_id, buffer_date) ON DELETE CASCADE
    );
    "#,
    // Landing archive of wide batches, replayed by recompute
    r#"
    CREATE TABLE IF NOT EXISTS raw_batches (
        source_id   TEXT        NOT NULL,
        batch_date  DATE        NOT NULL,
        payload     TEXT        NOT NULL,
        received_at TIMESTAMPTZ NOT NULL,
        PRIMARY KEY (source_id, batch_date)
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS calibration_rules (
        sensor_id      TEXT             NOT NULL,
        metric_name    TEXT             NOT NULL,
        slope          DOUBLE PRECISION NOT NULL,
        intercept      DOUBLE PRECISION NOT NULL,
        effective_date DATE             NOT NULL,
        end_date       DATE,
        description    TEXT             NOT NULL DEFAULT '',
        PRIMARY KEY (sensor_id, metric_name, effective_date)
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS assignment_intervals (
        group_id  TEXT        NOT NULL,
        sensor_id TEXT        NOT NULL,
        role      TEXT        NOT NULL,
        start_ts  TIMESTAMPTZ NOT NULL,
        end_ts    TIMESTAMPTZ,
        PRIMARY KEY (sensor_id, role, start_ts)
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS mv_correction_models (
        sensor_class  TEXT             NOT NULL,
        target_metric TEXT             NOT NULL,
        intercept     DOUBLE PRECISION NOT NULL,
        coefficients  TEXT             NOT NULL,
        PRIMARY KEY (sensor_class, target_metric)
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS pipeline_runs (
        run_id      UUID        PRIMARY KEY,
        operation   TEXT        NOT NULL,
        started_at  TIMESTAMPTZ NOT NULL,
        finished_at TIMESTAMPTZ NOT NULL,
        status      TEXT        NOT NULL,
        detail      TEXT        NOT NULL
    );
    "#,
];

/// Create or update the database schema (idempotent).
///
/// Creates the fact, staging, archive, reference and audit tables, and seeds
/// the built-in multivariate corrections without touching models an operator
/// has already edited. Safe to call on every startup.
pub async fn create_schema(pool: &PgPool) -> Result<()> {
    // ---
    let mut tx = pool.begin().await?;

    for ddl in TABLES {
        sqlx::query(ddl).execute(&mut *tx).await?;
    }

    for model in MultivariateModel::defaults() {
        sqlx::query(
            r#"
            INSERT INTO mv_correction_models (sensor_class, target_metric, intercept, coefficients)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (sensor_class, target_metric) DO NOTHING
            "#,
        )
        .bind(model.sensor_class.role())
        .bind(&model.target_metric)
        .bind(model.intercept)
        .bind(serde_json::to_string(&model.coefficients)?)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    tracing::info!("Database schema ready");
    Ok(())
}
