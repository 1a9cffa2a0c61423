//! Temporal resolution of sensor-to-group assignments.
//!
//! An interval is half-open: `[start_ts, end_ts)`, with a null `end_ts`
//! meaning the assignment is still active.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AmbiguousAssignmentError;

// ---

/// Role name of indoor deployments.
pub const ROLE_INDOOR: &str = "indoor";
/// Role name of outdoor deployments.
pub const ROLE_OUTDOOR: &str = "outdoor";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct AssignmentInterval {
    // ---
    pub group_id: String,
    pub sensor_id: String,
    pub role: String,
    pub start_ts: DateTime<Utc>,
    pub end_ts: Option<DateTime<Utc>>,
}

impl AssignmentInterval {
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start_ts <= instant && self.end_ts.map_or(true, |end| instant < end)
    }

    fn overlaps(&self, other: &AssignmentInterval) -> bool {
        // ---
        let self_before_other = self.end_ts.is_some_and(|end| end <= other.start_ts);
        let other_before_self = other.end_ts.is_some_and(|end| end <= self.start_ts);
        !self_before_other && !other_before_self
    }
}

/// Deployment class of a sensor, derived from its assignment role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorClass {
    Indoor,
    Outdoor,
}

impl SensorClass {
    pub fn role(self) -> &'static str {
        match self {
            SensorClass::Indoor => ROLE_INDOOR,
            SensorClass::Outdoor => ROLE_OUTDOOR,
        }
    }

    pub fn from_role(role: &str) -> Option<Self> {
        match role {
            ROLE_INDOOR => Some(SensorClass::Indoor),
            ROLE_OUTDOOR => Some(SensorClass::Outdoor),
            _ => None,
        }
    }
}

/// A pair of intervals that violate the non-overlap invariant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssignmentConflict {
    pub sensor_id: String,
    pub role: String,
    pub first_group: String,
    pub second_group: String,
}

/// A snapshot of assignment intervals, loaded fresh for each run or date.
#[derive(Debug, Clone, Default)]
pub struct AssignmentTable {
    intervals: Vec<AssignmentInterval>,
}

impl AssignmentTable {
    // ---
    pub fn new(intervals: Vec<AssignmentInterval>) -> Self {
        AssignmentTable { intervals }
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// The group a sensor belonged to in `role` at `instant`.
    ///
    /// `Ok(None)` means unattributed. More than one matching interval is a
    /// configuration defect and is returned as an error rather than picking
    /// one.
    pub fn resolve(
        &self,
        sensor_id: &str,
        role: &str,
        instant: DateTime<Utc>,
    ) -> Result<Option<String>, AmbiguousAssignmentError> {
        // ---
        let matches: Vec<&AssignmentInterval> = self
            .intervals
            .iter()
            .filter(|i| i.sensor_id == sensor_id && i.role == role && i.contains(instant))
            .collect();

        match matches.as_slice() {
            [] => Ok(None),
            [only] => Ok(Some(only.group_id.clone())),
            many => Err(AmbiguousAssignmentError {
                sensor_id: sensor_id.to_string(),
                role: role.to_string(),
                instant,
                group_ids: many.iter().map(|i| i.group_id.clone()).collect(),
            }),
        }
    }

    /// Whether the sensor was deployed indoors or outdoors at `instant`.
    pub fn class_of(
        &self,
        sensor_id: &str,
        instant: DateTime<Utc>,
    ) -> Result<Option<SensorClass>, AmbiguousAssignmentError> {
        // ---
        let indoor = self.resolve(sensor_id, ROLE_INDOOR, instant)?;
        let outdoor = self.resolve(sensor_id, ROLE_OUTDOOR, instant)?;

        match (indoor, outdoor) {
            (Some(a), Some(b)) => Err(AmbiguousAssignmentError {
                sensor_id: sensor_id.to_string(),
                role: format!("{ROLE_INDOOR}|{ROLE_OUTDOOR}"),
                instant,
                group_ids: vec![a, b],
            }),
            (Some(_), None) => Ok(Some(SensorClass::Indoor)),
            (None, Some(_)) => Ok(Some(SensorClass::Outdoor)),
            (None, None) => Ok(None),
        }
    }

    /// Every pair of intervals for the same `(sensor_id, role)` that overlap.
    ///
    /// Two open-ended intervals always overlap, so this also catches a second
    /// "currently active" assignment.
    pub fn validate(&self) -> Vec<AssignmentConflict> {
        // ---
        let mut conflicts = Vec::new();
        for (i, a) in self.intervals.iter().enumerate() {
            for b in &self.intervals[i + 1..] {
                if a.sensor_id == b.sensor_id && a.role == b.role && a.overlaps(b) {
                    conflicts.push(AssignmentConflict {
                        sensor_id: a.sensor_id.clone(),
                        role: a.role.clone(),
                        first_group: a.group_id.clone(),
                        second_group: b.group_id.clone(),
                    });
                }
            }
        }
        conflicts
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use chrono::TimeZone;

    fn day(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn interval(group: &str, role: &str, start: DateTime<Utc>, end: Option<DateTime<Utc>>) -> AssignmentInterval {
        // ---
        AssignmentInterval {
            group_id: group.into(),
            sensor_id: "tsi-001".into(),
            role: role.into(),
            start_ts: start,
            end_ts: end,
        }
    }

    fn summer_then_fall() -> AssignmentTable {
        AssignmentTable::new(vec![
            interval("site-A", ROLE_INDOOR, day(2025, 7, 1), Some(day(2025, 9, 1))),
            interval("site-B", ROLE_INDOOR, day(2025, 9, 1), None),
        ])
    }

    #[test]
    fn test_start_is_inclusive_end_is_exclusive() {
        // ---
        let table = summer_then_fall();

        assert_eq!(
            table.resolve("tsi-001", ROLE_INDOOR, day(2025, 7, 1)).unwrap(),
            Some("site-A".to_string())
        );
        assert_eq!(
            table.resolve("tsi-001", ROLE_INDOOR, day(2025, 9, 1)).unwrap(),
            Some("site-B".to_string())
        );
        assert_eq!(
            table
                .resolve("tsi-001", ROLE_INDOOR, day(2025, 9, 1) - chrono::Duration::microseconds(1))
                .unwrap(),
            Some("site-A".to_string())
        );
    }

    #[test]
    fn test_unattributed_is_none() {
        // ---
        let table = summer_then_fall();
        assert_eq!(table.resolve("tsi-001", ROLE_INDOOR, day(2025, 6, 30)).unwrap(), None);
        assert_eq!(table.resolve("tsi-001", ROLE_OUTDOOR, day(2025, 8, 1)).unwrap(), None);
        assert_eq!(table.resolve("tsi-999", ROLE_INDOOR, day(2025, 8, 1)).unwrap(), None);
    }

    #[test]
    fn test_exclusive_end_without_successor_is_none() {
        // ---
        let table = AssignmentTable::new(vec![interval(
            "site-A",
            ROLE_INDOOR,
            day(2025, 7, 1),
            Some(day(2025, 9, 1)),
        )]);
        assert_eq!(table.resolve("tsi-001", ROLE_INDOOR, day(2025, 9, 1)).unwrap(), None);
    }

    #[test]
    fn test_overlap_fails_loudly() {
        // ---
        let table = AssignmentTable::new(vec![
            interval("site-A", ROLE_INDOOR, day(2025, 7, 1), None),
            interval("site-B", ROLE_INDOOR, day(2025, 8, 1), None),
        ]);

        let err = table.resolve("tsi-001", ROLE_INDOOR, day(2025, 8, 15)).unwrap_err();
        assert_eq!(err.group_ids, vec!["site-A".to_string(), "site-B".to_string()]);

        // Before the second interval starts there is exactly one match
        assert_eq!(
            table.resolve("tsi-001", ROLE_INDOOR, day(2025, 7, 15)).unwrap(),
            Some("site-A".to_string())
        );

        let conflicts = table.validate();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].first_group, "site-A");
    }

    #[test]
    fn test_validate_accepts_touching_intervals() {
        // ---
        assert!(summer_then_fall().validate().is_empty());
    }

    #[test]
    fn test_class_follows_role() {
        // ---
        let mut intervals = summer_then_fall().intervals;
        intervals.push(AssignmentInterval {
            sensor_id: "tsi-002".into(),
            ..interval("yard-1", ROLE_OUTDOOR, day(2025, 1, 1), None)
        });
        let table = AssignmentTable::new(intervals);

        assert_eq!(
            table.class_of("tsi-001", day(2025, 8, 1)).unwrap(),
            Some(SensorClass::Indoor)
        );
        assert_eq!(
            table.class_of("tsi-002", day(2025, 8, 1)).unwrap(),
            Some(SensorClass::Outdoor)
        );
        assert_eq!(table.class_of("tsi-001", day(2025, 1, 1)).unwrap(), None);
    }
}
