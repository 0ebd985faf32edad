use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub const UNCATEGORIZED: &str = "uncategorized";

/// One validated surgical case. Built only through [`crate::ingest`] or by
/// callers that already hold clean data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseRecord {
    pub date: NaiveDate,
    pub hospital: Option<String>,
    pub department: Option<String>,
    pub surgeon: Option<String>,
    pub duration_minutes: u32,
    pub category: String,
    pub completed: bool,
}

impl CaseRecord {
    pub fn dimension_value(&self, kind: DimensionKind) -> Option<&str> {
        match kind {
            DimensionKind::Hospital => self.hospital.as_deref(),
            DimensionKind::Department => self.department.as_deref(),
            DimensionKind::Surgeon => self.surgeon.as_deref(),
        }
    }

    pub fn belongs_to(&self, dimension: &DimensionId) -> bool {
        self.dimension_value(dimension.kind) == Some(dimension.id.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DimensionKind {
    Hospital,
    Department,
    Surgeon,
}

impl DimensionKind {
    pub const ALL: [DimensionKind; 3] = [
        DimensionKind::Hospital,
        DimensionKind::Department,
        DimensionKind::Surgeon,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DimensionKind::Hospital => "hospital",
            DimensionKind::Department => "department",
            DimensionKind::Surgeon => "surgeon",
        }
    }
}

impl fmt::Display for DimensionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DimensionKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "hospital" => Ok(DimensionKind::Hospital),
            "department" | "dept" => Ok(DimensionKind::Department),
            "surgeon" => Ok(DimensionKind::Surgeon),
            other => Err(format!("unknown dimension kind '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DimensionId {
    pub kind: DimensionKind,
    pub id: String,
}

impl DimensionId {
    pub fn new(kind: DimensionKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    pub fn hospital(id: impl Into<String>) -> Self {
        Self::new(DimensionKind::Hospital, id)
    }

    pub fn department(id: impl Into<String>) -> Self {
        Self::new(DimensionKind::Department, id)
    }

    pub fn surgeon(id: impl Into<String>) -> Self {
        Self::new(DimensionKind::Surgeon, id)
    }
}

impl fmt::Display for DimensionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Granularity {
    Day,
    Week,
    Month,
    FiscalYear,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Day => "day",
            Granularity::Week => "week",
            Granularity::Month => "month",
            Granularity::FiscalYear => "fiscal-year",
        }
    }

    /// Length of one seasonal cycle, in periods of this granularity.
    pub fn default_season_length(&self) -> usize {
        match self {
            Granularity::Day => 7,
            Granularity::Week => 4,
            Granularity::Month => 12,
            Granularity::FiscalYear => 1,
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "day" | "daily" => Ok(Granularity::Day),
            "week" | "weekly" => Ok(Granularity::Week),
            "month" | "monthly" => Ok(Granularity::Month),
            "fiscal-year" | "fiscal_year" | "fy" => Ok(Granularity::FiscalYear),
            other => Err(format!("unknown granularity '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeriodKey {
    pub dimension: DimensionId,
    pub granularity: Granularity,
    pub start: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodAggregate {
    pub key: PeriodKey,
    pub case_count: u64,
    pub total_duration_minutes: u64,
    pub completed_count: u64,
    pub by_category: BTreeMap<String, u64>,
}

impl PeriodAggregate {
    pub fn empty(key: PeriodKey) -> Self {
        Self {
            key,
            case_count: 0,
            total_duration_minutes: 0,
            completed_count: 0,
            by_category: BTreeMap::new(),
        }
    }

    pub fn total_duration_hours(&self) -> f64 {
        self.total_duration_minutes as f64 / 60.0
    }

    pub fn category_count(&self, category: &str) -> u64 {
        self.by_category.get(category).copied().unwrap_or(0)
    }
}

pub type Aggregates = BTreeMap<PeriodKey, PeriodAggregate>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind", content = "places")]
pub enum RankDelta {
    New,
    /// Positive when the dimension climbed since the prior period.
    Moved(i64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingEntry {
    pub dimension: DimensionId,
    pub period_start: NaiveDate,
    pub rank: u32,
    pub value: f64,
    pub prior_rank: Option<u32>,
    pub delta: RankDelta,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ForecastModel {
    SeasonalTrend,
    LinearTrend,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastPoint {
    pub period_start: NaiveDate,
    pub point: f64,
    pub lower: f64,
    pub upper: f64,
    pub confidence: f64,
}

impl ForecastPoint {
    pub fn band_width(&self) -> f64 {
        self.upper - self.lower
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    pub dimension: DimensionId,
    pub granularity: Granularity,
    pub model: ForecastModel,
    pub season_length: usize,
    pub low_confidence: bool,
    pub slope: f64,
    pub residual_std_dev: f64,
    pub confidence: f64,
    pub points: Vec<ForecastPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FiscalYearProjection {
    pub fiscal_year: i32,
    pub actual_to_date: f64,
    pub forecast_remaining: f64,
    pub projected_total: f64,
    pub remaining_periods: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetClassification {
    Met,
    AtRisk,
    Missed,
    NoTarget,
}

impl fmt::Display for TargetClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TargetClassification::Met => "met",
            TargetClassification::AtRisk => "at-risk",
            TargetClassification::Missed => "missed",
            TargetClassification::NoTarget => "no-target",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetStatus {
    pub dimension: DimensionId,
    pub period_start: NaiveDate,
    pub value: f64,
    pub target: Option<f64>,
    pub achievement_pct: Option<f64>,
    pub classification: TargetClassification,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeeklySummary {
    pub week_start: NaiveDate,
    pub case_count: u64,
    pub working_day_cases: u64,
    pub active_working_days: u32,
    pub avg_per_working_day: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CumulativePoint {
    pub period_start: NaiveDate,
    pub actual: u64,
    pub cumulative_actual: u64,
    pub cumulative_target: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YearOverYear {
    pub fiscal_year: i32,
    pub current_start: NaiveDate,
    pub as_of: NaiveDate,
    pub current_total: u64,
    pub previous_total: u64,
    pub difference: i64,
    pub growth_pct: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepartmentScore {
    pub department: String,
    pub total_score: f64,
    pub grade: String,
    pub target_performance: f64,
    pub improvement: f64,
    pub competitiveness: f64,
    pub latest_cases: u64,
    pub average_cases: f64,
    pub weekly_target: Option<f64>,
    pub achievement_pct: Option<f64>,
    pub week_over_week_pct: f64,
    pub hospital_rank: u32,
    pub improvement_rank: u32,
}
