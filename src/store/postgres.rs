//! PostgreSQL backend.
//!
//! The fact table is keyed by fingerprint and carries its date partition in
//! `reading_date`. A partition replace runs as one transaction holding a
//! date-scoped advisory lock, so it either commits whole or leaves the
//! previous rows in place.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use sqlx::{PgPool, Postgres, Transaction};

use super::{FactStore, PartitionDiff, RawArchive, ReadingsQuery, ReferenceData, RunRecord};
use crate::assignment::{AssignmentInterval, SensorClass};
use crate::calibration::{CalibrationRule, MultivariateModel};
use crate::error::StoreError;
use crate::models::{CanonicalReading, RawObservation};
use crate::staging::StagingBuffer;

// ---

/// Namespace of the advisory locks taken per partition date.
const PARTITION_LOCK_NAMESPACE: i64 = 0x5346_0000_0000;

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        PgStore { pool }
    }
}

/// Column-wise arrays for `UNNEST` bulk writes.
#[derive(Default)]
struct Columns {
    fingerprints: Vec<String>,
    timestamps: Vec<DateTime<Utc>>,
    sensor_ids: Vec<String>,
    metric_names: Vec<String>,
    values: Vec<f64>,
    source_ids: Vec<String>,
}

impl Columns {
    fn from_rows(rows: Vec<CanonicalReading>) -> Self {
        // ---
        let mut cols = Columns::default();
        for r in rows {
            cols.fingerprints.push(r.fingerprint);
            cols.timestamps.push(r.timestamp);
            cols.sensor_ids.push(r.sensor_id);
            cols.metric_names.push(r.metric_name);
            cols.values.push(r.value);
            cols.source_ids.push(r.source_id);
        }
        cols
    }
}

async fn upsert_readings(
    tx: &mut Transaction<'_, Postgres>,
    date: NaiveDate,
    rows: Vec<CanonicalReading>,
) -> Result<u64, sqlx::Error> {
    // ---
    if rows.is_empty() {
        return Ok(0);
    }
    let cols = Columns::from_rows(rows);
    let done = sqlx::query(
        r#"
        INSERT INTO sensor_readings (
            fingerprint, reading_date, ts, sensor_id, metric_name, value, source_id
        )
        SELECT u.fingerprint, $1, u.ts, u.sensor_id, u.metric_name, u.value, u.source_id
        FROM UNNEST($2::text[], $3::timestamptz[], $4::text[], $5::text[], $6::float8[], $7::text[])
            AS u(fingerprint, ts, sensor_id, metric_name, value, source_id)
        ON CONFLICT (fingerprint) DO UPDATE SET
            value        = EXCLUDED.value,
            source_id    = EXCLUDED.source_id,
            ts           = EXCLUDED.ts,
            reading_date = EXCLUDED.reading_date
        "#,
    )
    .bind(date)
    .bind(&cols.fingerprints)
    .bind(&cols.timestamps)
    .bind(&cols.sensor_ids)
    .bind(&cols.metric_names)
    .bind(&cols.values)
    .bind(&cols.source_ids)
    .execute(&mut **tx)
    .await?;

    Ok(done.rows_affected())
}

impl FactStore for PgStore {
    // ---
    async fn replace_partition(&self, date: NaiveDate, rows: Vec<CanonicalReading>) -> Result<PartitionDiff, StoreError> {
        // ---
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(PARTITION_LOCK_NAMESPACE + i64::from(date.num_days_from_ce()))
            .execute(&mut *tx)
            .await?;

        let old: Vec<(String, f64, String)> = sqlx::query_as(
            "SELECT fingerprint, value, source_id FROM sensor_readings WHERE reading_date = $1",
        )
        .bind(date)
        .fetch_all(&mut *tx)
        .await?;
        let old: HashMap<String, (f64, String)> = old.into_iter().map(|(fp, v, s)| (fp, (v, s))).collect();
        let diff = PartitionDiff::between(&old, &rows);

        sqlx::query("DELETE FROM sensor_readings WHERE reading_date = $1")
            .bind(date)
            .execute(&mut *tx)
            .await?;
        upsert_readings(&mut tx, date, rows).await?;

        tx.commit().await?;
        Ok(diff)
    }

    async fn partition(&self, date: NaiveDate) -> Result<Vec<CanonicalReading>, StoreError> {
        // ---
        let rows = sqlx::query_as::<_, CanonicalReading>(
            r#"
            SELECT fingerprint, ts, sensor_id, metric_name, value, source_id
            FROM sensor_readings
            WHERE reading_date = $1
            ORDER BY fingerprint
            "#,
        )
        .bind(date)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn query(&self, query: &ReadingsQuery) -> Result<Vec<CanonicalReading>, StoreError> {
        // ---
        let rows = sqlx::query_as::<_, CanonicalReading>(
            r#"
            SELECT fingerprint, ts, sensor_id, metric_name, value, source_id
            FROM sensor_readings
            WHERE reading_date BETWEEN $1 AND $2
              AND ($3::text IS NULL OR sensor_id = $3)
              AND ($4::text IS NULL OR metric_name = $4)
            ORDER BY ts, sensor_id, metric_name
            LIMIT $5
            "#,
        )
        .bind(query.start)
        .bind(query.end)
        .bind(&query.sensor_id)
        .bind(&query.metric_name)
        .bind(query.limit() as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn existing_values(&self, date: NaiveDate, fingerprints: &[String]) -> Result<HashMap<String, f64>, StoreError> {
        // ---
        let rows: Vec<(String, f64)> = sqlx::query_as(
            "SELECT fingerprint, value FROM sensor_readings WHERE reading_date = $1 AND fingerprint = ANY($2)",
        )
        .bind(date)
        .bind(fingerprints)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    async fn apply_merge(
        &self,
        source_id: &str,
        date: NaiveDate,
        rows: Vec<CanonicalReading>,
        merged_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        // ---
        let mut tx = self.pool.begin().await?;
        upsert_readings(&mut tx, date, rows).await?;

        let marked = sqlx::query("UPDATE staging_buffers SET merged_at = $3 WHERE source_id = $1 AND buffer_date = $2")
            .bind(source_id)
            .bind(date)
            .bind(merged_at)
            .execute(&mut *tx)
            .await?;
        if marked.rows_affected() == 0 {
            return Err(StoreError::Invalid(format!("no staging buffer {source_id}/{date}")));
        }

        tx.commit().await?;
        Ok(())
    }

    async fn put_staging(&self, buffer: StagingBuffer) -> Result<(), StoreError> {
        // ---
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM staging_readings WHERE source_id = $1 AND buffer_date = $2")
            .bind(&buffer.source_id)
            .bind(buffer.date)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            INSERT INTO staging_buffers (source_id, buffer_date, staged_at, expires_at, merged_at, row_count)
            VALUES ($1, $2, $3, $4, NULL, $5)
            ON CONFLICT (source_id, buffer_date) DO UPDATE SET
                staged_at  = EXCLUDED.staged_at,
                expires_at = EXCLUDED.expires_at,
                merged_at  = NULL,
                row_count  = EXCLUDED.row_count
            "#,
        )
        .bind(&buffer.source_id)
        .bind(buffer.date)
        .bind(buffer.staged_at)
        .bind(buffer.expires_at)
        .bind(buffer.rows.len() as i64)
        .execute(&mut *tx)
        .await?;

        let cols = Columns::from_rows(buffer.rows);
        sqlx::query(
            r#"
            INSERT INTO staging_readings (
                source_id, buffer_date, fingerprint, ts, sensor_id, metric_name, value, row_source_id
            )
            SELECT $1, $2, u.fingerprint, u.ts, u.sensor_id, u.metric_name, u.value, u.source_id
            FROM UNNEST($3::text[], $4::timestamptz[], $5::text[], $6::text[], $7::float8[], $8::text[])
                AS u(fingerprint, ts, sensor_id, metric_name, value, source_id)
            "#,
        )
        .bind(&buffer.source_id)
        .bind(buffer.date)
        .bind(&cols.fingerprints)
        .bind(&cols.timestamps)
        .bind(&cols.sensor_ids)
        .bind(&cols.metric_names)
        .bind(&cols.values)
        .bind(&cols.source_ids)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn staging(&self, source_id: &str, date: NaiveDate) -> Result<Option<StagingBuffer>, StoreError> {
        // ---
        let header: Option<(DateTime<Utc>, DateTime<Utc>, Option<DateTime<Utc>>)> = sqlx::query_as(
            "SELECT staged_at, expires_at, merged_at FROM staging_buffers WHERE source_id = $1 AND buffer_date = $2",
        )
        .bind(source_id)
        .bind(date)
        .fetch_optional(&self.pool)
        .await?;

        let Some((staged_at, expires_at, merged_at)) = header else {
            return Ok(None);
        };

        let rows = sqlx::query_as::<_, CanonicalReading>(
            r#"
            SELECT fingerprint, ts, sensor_id, metric_name, value, row_source_id AS source_id
            FROM staging_readings
            WHERE source_id = $1 AND buffer_date = $2
            ORDER BY fingerprint
            "#,
        )
        .bind(source_id)
        .bind(date)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(StagingBuffer {
            source_id: source_id.to_string(),
            date,
            rows,
            staged_at,
            expires_at,
            merged_at,
        }))
    }

    async fn record_run(&self, run: &RunRecord) -> Result<(), StoreError> {
        // ---
        sqlx::query(
            r#"
            INSERT INTO pipeline_runs (run_id, operation, started_at, finished_at, status, detail)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(run.run_id)
        .bind(&run.operation)
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(&run.status)
        .bind(&run.detail)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

impl ReferenceData for PgStore {
    // ---
    async fn calibration_rules(&self) -> Result<Vec<CalibrationRule>, StoreError> {
        let rules = sqlx::query_as::<_, CalibrationRule>(
            r#"
            SELECT sensor_id, metric_name, slope, intercept, effective_date, end_date, description
            FROM calibration_rules
            ORDER BY sensor_id, metric_name, effective_date
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rules)
    }

    async fn assignment_intervals(&self) -> Result<Vec<AssignmentInterval>, StoreError> {
        let intervals = sqlx::query_as::<_, AssignmentInterval>(
            r#"
            SELECT group_id, sensor_id, role, start_ts, end_ts
            FROM assignment_intervals
            ORDER BY sensor_id, role, start_ts
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(intervals)
    }

    async fn multivariate_models(&self) -> Result<Vec<MultivariateModel>, StoreError> {
        // ---
        let rows: Vec<(String, String, f64, String)> = sqlx::query_as(
            r#"
            SELECT sensor_class, target_metric, intercept, coefficients
            FROM mv_correction_models
            ORDER BY sensor_class, target_metric
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(class, target_metric, intercept, coefficients)| -> Result<MultivariateModel, StoreError> {
                let sensor_class = SensorClass::from_role(&class)
                    .ok_or_else(|| StoreError::Invalid(format!("unknown sensor class {class:?}")))?;
                Ok(MultivariateModel {
                    sensor_class,
                    target_metric,
                    coefficients: serde_json::from_str(&coefficients)?,
                    intercept,
                })
            })
            .collect()
    }
}

impl RawArchive for PgStore {
    // ---
    async fn archive_batch(&self, source_id: &str, date: NaiveDate, rows: &[RawObservation]) -> Result<(), StoreError> {
        let payload = serde_json::to_string(rows)?;
        sqlx::query(
            r#"
            INSERT INTO raw_batches (source_id, batch_date, payload, received_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (source_id, batch_date) DO UPDATE SET
                payload     = EXCLUDED.payload,
                received_at = EXCLUDED.received_at
            "#,
        )
        .bind(source_id)
        .bind(date)
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn archived_batch(&self, source_id: &str, date: NaiveDate) -> Result<Option<Vec<RawObservation>>, StoreError> {
        let payload: Option<(String,)> =
            sqlx::query_as("SELECT payload FROM raw_batches WHERE source_id = $1 AND batch_date = $2")
                .bind(source_id)
                .bind(date)
                .fetch_optional(&self.pool)
                .await?;
        payload
            .map(|(p,)| serde_json::from_str(&p).map_err(StoreError::from))
            .transpose()
    }

    async fn archived_batches(&self, date: NaiveDate) -> Result<BTreeMap<String, Vec<RawObservation>>, StoreError> {
        // ---
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT source_id, payload FROM raw_batches WHERE batch_date = $1 ORDER BY source_id")
                .bind(date)
                .fetch_all(&self.pool)
                .await?;

        let mut batches = BTreeMap::new();
        for (source_id, payload) in rows {
            batches.insert(source_id, serde_json::from_str(&payload)?);
        }
        Ok(batches)
    }
}
