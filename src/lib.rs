//! # Surgical Volume Analytics
//!
//! Analytical core for a hospital operations dashboard: it turns surgical
//! case records into period aggregates, leaderboards, trend forecasts and
//! target classifications.
//!
//! ## Pipeline
//!
//! - `ingest`: validates raw rows into `CaseRecord`s and counts what was dropped.
//! - `aggregate`: buckets records per hospital, department and surgeon on a
//!   fiscal calendar (`calendar`).
//! - `ranking` / `surgeon`: competition-ranked leaderboards with rank movement.
//! - `forecast`: seasonal-trend projection with widening uncertainty bands.
//! - `targets` / `scorecard`: target classification and the weekly department
//!   scorecard.
//!
//! Every computation is a pure function of its inputs. Persistence sits behind
//! the `store::SnapshotStore` trait and is never called from the core.

pub mod aggregate;
pub mod calendar;
pub mod error;
pub mod forecast;
pub mod ingest;
pub mod models;
pub mod ranking;
pub mod report;
pub mod scorecard;
pub mod settings;
pub mod store;
pub mod surgeon;
pub mod targets;
pub mod weekly;

pub use calendar::FiscalCalendar;
pub use error::{AnalyticsError, Result};
pub use forecast::ForecastOptions;
pub use models::{
    Aggregates, CaseRecord, DimensionId, DimensionKind, Forecast, ForecastPoint, Granularity,
    PeriodAggregate, PeriodKey, RankingEntry, TargetClassification, TargetStatus,
};
pub use ranking::Metric;
pub use settings::{load_settings, Settings};
pub use store::{MemoryStore, PgSnapshotStore, SnapshotStore, StoreError};
pub use targets::{Target, TargetBook};
