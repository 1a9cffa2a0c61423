//! Wide-to-long reshaping of collector rows.
//!
//! Each source has a fixed table mapping vendor columns to canonical metric
//! names. Columns in neither the metric table nor the metadata list are
//! reported back as unmapped so schema drift stays visible.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::{CoercionError, NormalizationError};
use crate::models::{CanonicalReading, RawObservation};
use crate::timestamp;

// ---

/// The fixed wide layout of one source type.
#[derive(Debug)]
pub struct SourceSchema {
    pub source_id: &'static str,
    /// `(vendor column, canonical metric name)`
    pub metric_columns: &'static [(&'static str, &'static str)],
    /// Known non-metric columns, ignored during expansion.
    pub metadata_columns: &'static [&'static str],
}

impl SourceSchema {
    pub fn metric_for(&self, column: &str) -> Option<&'static str> {
        self.metric_columns
            .iter()
            .find(|(vendor, _)| *vendor == column)
            .map(|(_, metric)| *metric)
    }

    pub fn is_metadata(&self, column: &str) -> bool {
        self.metadata_columns.contains(&column)
    }
}

/// Outdoor weather stations.
pub static WEATHER_STATION: SourceSchema = SourceSchema {
    source_id: "WU",
    metric_columns: &[
        ("tempAvg", "temperature"),
        ("tempHigh", "temperature_high"),
        ("tempLow", "temperature_low"),
        ("humidityAvg", "humidity"),
        ("humidityHigh", "humidity_high"),
        ("humidityLow", "humidity_low"),
        ("precipRate", "precip_rate"),
        ("precipTotal", "precip_total"),
        ("windspeedAvg", "wind_speed_avg"),
        ("windspeedHigh", "wind_speed_high"),
        ("windspeedLow", "wind_speed_low"),
        ("windgustAvg", "wind_gust_avg"),
        ("windgustHigh", "wind_gust_high"),
        ("windgustLow", "wind_gust_low"),
        ("winddirAvg", "wind_direction_avg"),
        ("pressureMax", "pressure_max"),
        ("pressureMin", "pressure_min"),
        ("pressureTrend", "pressure_trend"),
        ("solarRadiationHigh", "solar_radiation"),
        ("uvHigh", "uv_high"),
        ("windchillAvg", "wind_chill_avg"),
        ("windchillHigh", "wind_chill_high"),
        ("windchillLow", "wind_chill_low"),
        ("heatindexAvg", "heat_index_avg"),
        ("heatindexHigh", "heat_index_high"),
        ("heatindexLow", "heat_index_low"),
        ("dewptAvg", "dew_point_avg"),
        ("dewptHigh", "dew_point_high"),
        ("dewptLow", "dew_point_low"),
    ],
    metadata_columns: &[
        "stationID",
        "obsTimeUtc",
        "obsTimeLocal",
        "epoch",
        "tz",
        "lat",
        "lon",
        "qcStatus",
    ],
};

/// Indoor and outdoor air-quality monitors.
pub static AIR_QUALITY: SourceSchema = SourceSchema {
    source_id: "TSI",
    metric_columns: &[
        ("pm1_0", "pm1_0"),
        ("pm2_5", "pm2_5"),
        ("pm4_0", "pm4_0"),
        ("pm10", "pm10"),
        ("pm2_5_aqi", "pm2_5_aqi"),
        ("pm10_aqi", "pm10_aqi"),
        ("ncpm0_5", "ncpm0_5"),
        ("ncpm1_0", "ncpm1_0"),
        ("ncpm2_5", "ncpm2_5"),
        ("ncpm4_0", "ncpm4_0"),
        ("ncpm10", "ncpm10"),
        ("rh", "humidity"),
        ("temperature", "temperature"),
        ("tpsize", "tpsize"),
        ("co2_ppm", "co2_ppm"),
        ("co_ppm", "co_ppm"),
        ("o3_ppb", "o3_ppb"),
        ("no2_ppb", "no2_ppb"),
        ("so2_ppb", "so2_ppb"),
        ("ch2o_ppb", "ch2o_ppb"),
        ("voc_mgm3", "voc_mgm3"),
        ("baro_inhg", "baro_inhg"),
    ],
    metadata_columns: &[
        "cloud_account_id",
        "cloud_device_id",
        "cloud_timestamp",
        "device_id",
        "native_sensor_id",
        "model",
        "serial",
        "is_indoor",
        "is_public",
        "latitude",
        "longitude",
    ],
};

static SCHEMAS: [&SourceSchema; 2] = [&WEATHER_STATION, &AIR_QUALITY];

pub fn schema_for(source_id: &str) -> Option<&'static SourceSchema> {
    SCHEMAS.iter().copied().find(|s| s.source_id == source_id)
}

/// Coerce one raw metric value.
///
/// `Ok(None)` means the value is absent (`null` or blank text), which is not
/// an error.
pub fn coerce_metric(column: &str, value: &Value) -> Result<Option<f64>, CoercionError> {
    // ---
    let parsed = match value {
        Value::Null => return Ok(None),
        Value::Number(n) => n.as_f64(),
        Value::String(s) if s.trim().is_empty() => return Ok(None),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(_) | Value::Array(_) | Value::Object(_) => None,
    };

    match parsed {
        Some(v) if v.is_finite() => Ok(Some(v)),
        _ => Err(CoercionError {
            column: column.to_string(),
            raw_value: value.to_string(),
        }),
    }
}

/// The long-form rows of one wide observation plus the recoverable problems
/// found while expanding it.
#[derive(Debug, Default)]
pub struct Expanded {
    pub timestamp: Option<DateTime<Utc>>,
    pub readings: Vec<CanonicalReading>,
    pub timestamp_error: Option<NormalizationError>,
    pub coercion_errors: Vec<CoercionError>,
    pub unmapped_columns: BTreeSet<String>,
}

/// Expand one wide row into one reading per non-null known metric.
///
/// A timestamp that cannot be normalized drops the whole row; a value that
/// cannot be coerced drops only that metric.
pub fn expand(row: &RawObservation, schema: &SourceSchema) -> Expanded {
    // ---
    let mut out = Expanded::default();

    let ts = match timestamp::normalize(&row.timestamp_raw) {
        Ok(ts) => ts,
        Err(e) => {
            out.timestamp_error = Some(e);
            return out;
        }
    };
    out.timestamp = Some(ts);

    for (column, value) in &row.metrics {
        let Some(metric) = schema.metric_for(column) else {
            if !schema.is_metadata(column) {
                out.unmapped_columns.insert(column.clone());
            }
            continue;
        };

        match coerce_metric(column, value) {
            Ok(Some(v)) => out.readings.push(CanonicalReading::new(
                ts,
                row.sensor_id.clone(),
                metric,
                v,
                row.source_id.clone(),
            )),
            Ok(None) => {}
            Err(e) => out.coercion_errors.push(e),
        }
    }

    out
}
