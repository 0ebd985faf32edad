use std::collections::BTreeMap;
use std::io::Read;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::{AnalyticsError, Result};
use crate::models::{
    DimensionId, DimensionKind, Forecast, RankingEntry, TargetClassification, TargetStatus,
};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub value: f64,
    /// Share of `value`, in percent, that still counts as at-risk rather than missed.
    pub tolerance_pct: f64,
}

impl Target {
    pub fn new(value: f64, tolerance_pct: f64) -> Result<Self> {
        if !value.is_finite() || value < 0.0 {
            return Err(AnalyticsError::Configuration(format!(
                "target must be a finite, non-negative number (got {value})"
            )));
        }
        check_tolerance(tolerance_pct)?;
        Ok(Self {
            value,
            tolerance_pct,
        })
    }

    pub fn tolerance(&self) -> f64 {
        self.value * self.tolerance_pct / 100.0
    }

    pub fn classify(&self, value: f64) -> TargetClassification {
        if value >= self.value {
            TargetClassification::Met
        } else if value >= self.value - self.tolerance() {
            TargetClassification::AtRisk
        } else {
            TargetClassification::Missed
        }
    }
}

fn check_tolerance(tolerance_pct: f64) -> Result<()> {
    if (0.0..=100.0).contains(&tolerance_pct) {
        Ok(())
    } else {
        Err(AnalyticsError::Configuration(format!(
            "tolerance must be between 0 and 100 percent (got {tolerance_pct})"
        )))
    }
}

/// Classifies one actual or forecast value. A missing target is a valid
/// state and yields `no-target`.
pub fn evaluate(
    dimension: &DimensionId,
    period_start: NaiveDate,
    value: f64,
    target: Option<Target>,
) -> TargetStatus {
    let (classification, achievement_pct) = match target {
        Some(target) => (
            target.classify(value),
            (target.value > 0.0).then(|| value / target.value * 100.0),
        ),
        None => (TargetClassification::NoTarget, None),
    };
    TargetStatus {
        dimension: dimension.clone(),
        period_start,
        value,
        target: target.map(|t| t.value),
        achievement_pct,
        classification,
    }
}

/// Targets keyed by dimension and metric name.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetBook {
    default_tolerance_pct: f64,
    entries: BTreeMap<(DimensionId, String), Target>,
}

impl Default for TargetBook {
    fn default() -> Self {
        Self {
            default_tolerance_pct: 10.0,
            entries: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TargetRow {
    dimension: String,
    id: String,
    #[serde(default)]
    metric: Option<String>,
    target: f64,
    #[serde(default)]
    tolerance_pct: Option<f64>,
}

impl TargetBook {
    pub fn new(default_tolerance_pct: f64) -> Result<Self> {
        check_tolerance(default_tolerance_pct)?;
        Ok(Self {
            default_tolerance_pct,
            entries: BTreeMap::new(),
        })
    }

    pub fn default_tolerance_pct(&self) -> f64 {
        self.default_tolerance_pct
    }

    /// Adds or replaces a target. Without an explicit tolerance the book's
    /// default applies.
    pub fn insert(
        &mut self,
        dimension: DimensionId,
        metric: impl Into<String>,
        target: f64,
        tolerance_pct: Option<f64>,
    ) -> Result<()> {
        let target = Target::new(target, tolerance_pct.unwrap_or(self.default_tolerance_pct))?;
        self.entries.insert((dimension, metric.into()), target);
        Ok(())
    }

    pub fn get(&self, dimension: &DimensionId, metric: &str) -> Option<Target> {
        self.entries
            .get(&(dimension.clone(), metric.to_string()))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&DimensionId, &str, &Target)> {
        self.entries
            .iter()
            .map(|((dimension, metric), target)| (dimension, metric.as_str(), target))
    }

    /// Reads `dimension,id,metric,target,tolerance_pct` rows. A blank metric
    /// means case counts. Any bad row rejects the whole file.
    pub fn from_csv<R: Read>(reader: R, default_tolerance_pct: f64) -> Result<Self> {
        let mut book = Self::new(default_tolerance_pct)?;
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);

        for (index, row) in reader.deserialize::<TargetRow>().enumerate() {
            let line = index + 1;
            let row = row.map_err(|err| {
                AnalyticsError::Configuration(format!("target row {line}: {err}"))
            })?;
            let kind: DimensionKind = row.dimension.parse().map_err(|err| {
                AnalyticsError::Configuration(format!("target row {line}: {err}"))
            })?;
            let metric = row
                .metric
                .filter(|metric| !metric.is_empty())
                .unwrap_or_else(|| "cases".to_string());
            book.insert(DimensionId::new(kind, row.id), metric, row.target, row.tolerance_pct)
                .map_err(|err| match err {
                    AnalyticsError::Configuration(reason) => {
                        AnalyticsError::Configuration(format!("target row {line}: {reason}"))
                    }
                    other => other,
                })?;
        }

        tracing::info!(targets = book.len(), "loaded target book");
        Ok(book)
    }

    /// Classifies every entry of a leaderboard against its own target.
    pub fn evaluate_ranking(&self, entries: &[RankingEntry], metric: &str) -> Vec<TargetStatus> {
        entries
            .iter()
            .map(|entry| {
                evaluate(
                    &entry.dimension,
                    entry.period_start,
                    entry.value,
                    self.get(&entry.dimension, metric),
                )
            })
            .collect()
    }

    /// Classifies each forecast point estimate.
    pub fn evaluate_forecast(&self, forecast: &Forecast, metric: &str) -> Vec<TargetStatus> {
        let target = self.get(&forecast.dimension, metric);
        forecast
            .points
            .iter()
            .map(|point| evaluate(&forecast.dimension, point.period_start, point.point, target))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ForecastModel, ForecastPoint, Granularity, RankDelta};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn classify(value: f64, target: Option<Target>) -> TargetClassification {
        evaluate(&DimensionId::department("ortho"), date(2025, 6, 2), value, target)
            .classification
    }

    #[test]
    fn boundaries_are_inclusive_on_the_favourable_side() {
        let target = Target::new(100.0, 10.0).unwrap();
        assert_eq!(classify(100.0, Some(target)), TargetClassification::Met);
        assert_eq!(classify(130.0, Some(target)), TargetClassification::Met);
        assert_eq!(classify(99.9, Some(target)), TargetClassification::AtRisk);
        assert_eq!(classify(90.0, Some(target)), TargetClassification::AtRisk);
        assert_eq!(classify(89.9, Some(target)), TargetClassification::Missed);
        assert_eq!(classify(50.0, None), TargetClassification::NoTarget);
    }

    #[test]
    fn tolerance_scales_with_target() {
        let small = Target::new(10.0, 10.0).unwrap();
        let large = Target::new(1000.0, 10.0).unwrap();
        assert_eq!(classify(9.0, Some(small)), TargetClassification::AtRisk);
        assert_eq!(classify(991.0, Some(large)), TargetClassification::AtRisk);
        assert_eq!(classify(899.0, Some(large)), TargetClassification::Missed);
    }

    #[test]
    fn status_carries_achievement() {
        let status = evaluate(
            &DimensionId::hospital("central"),
            date(2025, 6, 2),
            45.0,
            Some(Target::new(50.0, 5.0).unwrap()),
        );
        assert_eq!(status.target, Some(50.0));
        assert!((status.achievement_pct.unwrap() - 90.0).abs() < 1e-9);
        assert_eq!(status.classification, TargetClassification::Missed);

        let zero = evaluate(
            &DimensionId::hospital("central"),
            date(2025, 6, 2),
            0.0,
            Some(Target::new(0.0, 5.0).unwrap()),
        );
        assert_eq!(zero.classification, TargetClassification::Met);
        assert_eq!(zero.achievement_pct, None);
    }

    #[test]
    fn invalid_targets_are_configuration_errors() {
        assert!(matches!(
            Target::new(-1.0, 10.0),
            Err(AnalyticsError::Configuration(_))
        ));
        assert!(matches!(
            Target::new(f64::NAN, 10.0),
            Err(AnalyticsError::Configuration(_))
        ));
        assert!(matches!(
            Target::new(10.0, 120.0),
            Err(AnalyticsError::Configuration(_))
        ));
        assert!(TargetBook::new(-5.0).is_err());
    }

    #[test]
    fn loads_book_from_csv() {
        let data = "\
dimension,id,metric,target,tolerance_pct
department,ortho,cases,40,
department,cardio,hours,55.5,5
hospital,central,,200,20
";
        let book = TargetBook::from_csv(data.as_bytes(), 10.0).unwrap();
        assert_eq!(book.len(), 3);

        let ortho = book.get(&DimensionId::department("ortho"), "cases").unwrap();
        assert_eq!(ortho.tolerance_pct, 10.0);
        let cardio = book.get(&DimensionId::department("cardio"), "hours").unwrap();
        assert_eq!(cardio.value, 55.5);
        assert!(book.get(&DimensionId::department("cardio"), "cases").is_none());
        assert!(book.get(&DimensionId::hospital("central"), "cases").is_some());
    }

    #[test]
    fn bad_csv_row_rejects_the_file() {
        let data = "dimension,id,metric,target,tolerance_pct\nward,ortho,cases,40,\n";
        let err = TargetBook::from_csv(data.as_bytes(), 10.0).unwrap_err();
        assert!(matches!(err, AnalyticsError::Configuration(ref reason) if reason.contains("row 1")));

        let negative = "dimension,id,metric,target,tolerance_pct\ndepartment,ortho,cases,-3,\n";
        assert!(TargetBook::from_csv(negative.as_bytes(), 10.0).is_err());
    }

    #[test]
    fn evaluates_rankings_and_forecasts() {
        let mut book = TargetBook::default();
        book.insert(DimensionId::department("ortho"), "cases", 20.0, None)
            .unwrap();

        let entry = |id: &str, value: f64| RankingEntry {
            dimension: DimensionId::department(id),
            period_start: date(2025, 6, 2),
            rank: 1,
            value,
            prior_rank: None,
            delta: RankDelta::New,
        };
        let statuses = book.evaluate_ranking(&[entry("ortho", 19.0), entry("cardio", 30.0)], "cases");
        assert_eq!(statuses[0].classification, TargetClassification::AtRisk);
        assert_eq!(statuses[1].classification, TargetClassification::NoTarget);

        let forecast = Forecast {
            dimension: DimensionId::department("ortho"),
            granularity: Granularity::Week,
            model: ForecastModel::LinearTrend,
            season_length: 4,
            low_confidence: true,
            slope: 1.0,
            residual_std_dev: 0.0,
            confidence: 1.0,
            points: vec![
                ForecastPoint {
                    period_start: date(2025, 6, 9),
                    point: 21.0,
                    lower: 21.0,
                    upper: 21.0,
                    confidence: 1.0,
                },
                ForecastPoint {
                    period_start: date(2025, 6, 16),
                    point: 12.0,
                    lower: 12.0,
                    upper: 12.0,
                    confidence: 1.0,
                },
            ],
        };
        let classes: Vec<TargetClassification> = book
            .evaluate_forecast(&forecast, "cases")
            .into_iter()
            .map(|s| s.classification)
            .collect();
        assert_eq!(
            classes,
            vec![TargetClassification::Met, TargetClassification::Missed]
        );
    }
}
