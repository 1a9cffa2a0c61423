//! Incremental harmonization and reconciliation of environmental sensor
//! telemetry.
//!
//! Wide per-source batches from weather stations and air-quality monitors are
//! normalized, calibrated and folded into a long-form fact store keyed by a
//! deterministic fingerprint. Partitions are rebuilt atomically per date, and
//! late sources are reconciled through day-and-source scoped staging buffers.
//!
//! Module boundaries follow the service layout: `models`/`error` hold shared
//! types, the transformation stages live in their own siblings, `store` hides
//! persistence behind a trait seam, and `routes` is the HTTP gateway.

pub mod assignment;
pub mod backfill;
pub mod calibration;
pub mod config;
pub mod error;
pub mod materialize;
pub mod models;
pub mod pipeline;
pub mod routes;
pub mod schema;
pub mod staging;
pub mod store;
pub mod timestamp;
pub mod wide;

pub use assignment::{AssignmentInterval, AssignmentTable, SensorClass};
pub use backfill::{BackfillReport, CancelFlag};
pub use calibration::{CalibrationEngine, CalibrationRule, MultivariateModel};
pub use config::Config;
pub use error::{PipelineError, StoreError};
pub use materialize::{FactMaterializer, IngestSummary, MaterializeReport};
pub use models::{CanonicalReading, RawObservation, RawTimestamp, RunStatus};
pub use pipeline::{AttributedReading, Pipeline};
pub use staging::{MergeReport, MergeRequest, StagingReconciler};
pub use store::{MemoryStore, PgStore, ReadingsQuery, Store};
