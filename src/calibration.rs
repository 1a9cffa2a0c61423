//! Calibration rules and the engine that applies them.
//!
//! Affine rules are versioned by a half-open date window
//! `[effective_date, end_date)`. Multivariate models correct one target
//! metric from itself plus covariates, with a coefficient set per sensor
//! class. Both only ever add derived readings; raw readings are left as they
//! are.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::assignment::{AssignmentTable, SensorClass};
use crate::error::{AmbiguousAssignmentError, CalibrationConflict};
use crate::models::CanonicalReading;

// ---

/// Sensor id of fallback rules.
pub const DEFAULT_SENSOR: &str = "DEFAULT";
/// Suffix of affine-calibrated metrics.
pub const CALIBRATED_SUFFIX: &str = "_calibrated";
/// Suffix of multivariate-corrected metrics.
pub const MV_CORRECTED_SUFFIX: &str = "_mv_corrected";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct CalibrationRule {
    // ---
    pub sensor_id: String,
    pub metric_name: String,
    pub slope: f64,
    pub intercept: f64,
    pub effective_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub description: String,
}

impl CalibrationRule {
    pub fn is_active_on(&self, date: NaiveDate) -> bool {
        self.effective_date <= date && self.end_date.map_or(true, |end| date < end)
    }

    pub fn apply(&self, raw_value: f64) -> f64 {
        raw_value * self.slope + self.intercept
    }

    fn overlaps(&self, other: &CalibrationRule) -> bool {
        // ---
        let self_before = self.end_date.is_some_and(|end| end <= other.effective_date);
        let other_before = other.end_date.is_some_and(|end| end <= self.effective_date);
        !self_before && !other_before
    }
}

/// A fixed regression correcting `target_metric` for one sensor class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MultivariateModel {
    // ---
    pub sensor_class: SensorClass,
    pub target_metric: String,
    /// Weight per input metric; the target itself is usually one of them.
    pub coefficients: BTreeMap<String, f64>,
    pub intercept: f64,
}

impl MultivariateModel {
    /// Built-in particulate corrections used when no models are configured.
    ///
    /// The outdoor set is the US-wide PM2.5 correction for optical
    /// particle counters (`0.524·PM − 0.0862·RH + 5.75`).
    pub fn defaults() -> Vec<MultivariateModel> {
        // ---
        vec![
            MultivariateModel {
                sensor_class: SensorClass::Outdoor,
                target_metric: "pm2_5".into(),
                coefficients: BTreeMap::from([
                    ("pm2_5".to_string(), 0.524),
                    ("humidity".to_string(), -0.0862),
                ]),
                intercept: 5.75,
            },
            MultivariateModel {
                sensor_class: SensorClass::Indoor,
                target_metric: "pm2_5".into(),
                coefficients: BTreeMap::from([
                    ("pm2_5".to_string(), 0.48),
                    ("humidity".to_string(), -0.045),
                    ("temperature".to_string(), 0.021),
                ]),
                intercept: 2.1,
            },
        ]
    }

    pub fn output_metric(&self) -> String {
        format!("{}{}", self.target_metric, MV_CORRECTED_SUFFIX)
    }

    /// `intercept + Σ weight·input`, or `None` when an input is missing.
    pub fn evaluate(&self, inputs: &BTreeMap<&str, f64>) -> Option<f64> {
        // ---
        let mut total = self.intercept;
        for (metric, weight) in &self.coefficients {
            total += weight * inputs.get(metric.as_str())?;
        }
        Some(total)
    }
}

/// A validated snapshot of the affine rules.
#[derive(Debug, Clone, Default)]
pub struct CalibrationTable {
    rules: Vec<CalibrationRule>,
}

impl CalibrationTable {
    /// Build a table, rejecting overlapping windows for the same
    /// `(sensor_id, metric_name)`.
    pub fn new(rules: Vec<CalibrationRule>) -> Result<Self, CalibrationConflict> {
        // ---
        for (i, a) in rules.iter().enumerate() {
            for b in &rules[i + 1..] {
                if a.sensor_id == b.sensor_id && a.metric_name == b.metric_name && a.overlaps(b) {
                    return Err(CalibrationConflict {
                        sensor_id: a.sensor_id.clone(),
                        metric_name: a.metric_name.clone(),
                        effective_date: a.effective_date.max(b.effective_date),
                    });
                }
            }
        }
        Ok(CalibrationTable { rules })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// The rule in force for a sensor and metric on `date`, falling back to
    /// the `DEFAULT` sensor's rule for that metric.
    pub fn lookup(&self, sensor_id: &str, metric_name: &str, date: NaiveDate) -> Option<&CalibrationRule> {
        // ---
        let active = |sensor: &str| {
            self.rules
                .iter()
                .find(|r| r.sensor_id == sensor && r.metric_name == metric_name && r.is_active_on(date))
        };
        active(sensor_id).or_else(|| active(DEFAULT_SENSOR))
    }
}

/// Counters of multivariate corrections that were not emitted.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SkippedCorrections {
    pub unclassified: usize,
    pub missing_covariates: usize,
    /// Sensor instants whose class could not be decided from assignments.
    pub ambiguous: usize,
}

#[derive(Debug, Default)]
pub struct Derived {
    pub readings: Vec<CanonicalReading>,
    pub skipped: SkippedCorrections,
    pub ambiguities: Vec<AmbiguousAssignmentError>,
}

/// Applies a snapshot of reference data to raw readings.
#[derive(Debug, Clone)]
pub struct CalibrationEngine {
    rules: CalibrationTable,
    models: Vec<MultivariateModel>,
    assignments: AssignmentTable,
}

impl CalibrationEngine {
    // ---
    pub fn new(rules: CalibrationTable, models: Vec<MultivariateModel>, assignments: AssignmentTable) -> Self {
        CalibrationEngine {
            rules,
            models,
            assignments,
        }
    }

    pub fn rules(&self) -> &CalibrationTable {
        &self.rules
    }

    /// Derived readings for a batch of raw readings on `as_of`.
    ///
    /// The result depends only on the inputs and the snapshot, and is emitted
    /// in a stable order, so repeated calls are identical. An ambiguous
    /// assignment only skips the multivariate rows of that sensor instant.
    pub fn derive_calibrated_metrics(&self, readings: &[CanonicalReading], as_of: NaiveDate) -> Derived {
        // ---
        let mut derived = Derived::default();

        for reading in readings {
            if let Some(rule) = self.rules.lookup(&reading.sensor_id, &reading.metric_name, as_of) {
                derived.readings.push(reading.derive(
                    format!("{}{}", reading.metric_name, CALIBRATED_SUFFIX),
                    rule.apply(reading.value),
                ));
            }
        }

        if self.models.is_empty() {
            return derived;
        }

        let mut instants: BTreeMap<(&str, DateTime<Utc>), BTreeMap<&str, &CanonicalReading>> = BTreeMap::new();
        for reading in readings {
            instants
                .entry((reading.sensor_id.as_str(), reading.timestamp))
                .or_default()
                .insert(reading.metric_name.as_str(), reading);
        }

        for ((sensor_id, instant), metrics) in &instants {
            let targets: Vec<&MultivariateModel> = self
                .models
                .iter()
                .filter(|m| metrics.contains_key(m.target_metric.as_str()))
                .collect();
            if targets.is_empty() {
                continue;
            }

            let class = match self.assignments.class_of(sensor_id, *instant) {
                Ok(Some(class)) => class,
                Ok(None) => {
                    derived.skipped.unclassified += 1;
                    continue;
                }
                Err(e) => {
                    derived.skipped.ambiguous += 1;
                    derived.ambiguities.push(e);
                    continue;
                }
            };

            let inputs: BTreeMap<&str, f64> = metrics.iter().map(|(k, r)| (*k, r.value)).collect();
            for model in targets.into_iter().filter(|m| m.sensor_class == class) {
                match model.evaluate(&inputs) {
                    Some(value) => {
                        let target = metrics[model.target_metric.as_str()];
                        derived.readings.push(target.derive(model.output_metric(), value));
                    }
                    None => derived.skipped.missing_covariates += 1,
                }
            }
        }

        derived
    }
}
