use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::calendar::FiscalCalendar;
use crate::error::{AnalyticsError, Result};
use crate::forecast::ForecastOptions;
use crate::ranking::{metric_by_name, Metric};
use crate::targets::TargetBook;

pub const DEFAULT_SETTINGS_FILE: &str = "surgical-ops.toml";
pub const ENV_PREFIX: &str = "SURGICAL_OPS";

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub fiscal: FiscalCalendar,
    pub targets: TargetSettings,
    pub forecast: ForecastOptions,
    pub ranking: RankingSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetSettings {
    pub default_tolerance_pct: f64,
    /// CSV of per-dimension targets. Without one every status is `no-target`.
    pub file: Option<PathBuf>,
}

impl Default for TargetSettings {
    fn default() -> Self {
        Self {
            default_tolerance_pct: 10.0,
            file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RankingSettings {
    pub default_metric: String,
    /// Weights of the `composite` metric.
    pub count_weight: f64,
    pub hours_weight: f64,
    pub leaderboard_limit: Option<usize>,
    pub scorecard_weeks: usize,
}

impl Default for RankingSettings {
    fn default() -> Self {
        Self {
            default_metric: "cases".to_string(),
            count_weight: 1.0,
            hours_weight: 1.0,
            leaderboard_limit: None,
            scorecard_weeks: 12,
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        self.fiscal.validate()?;
        self.forecast.validate()?;
        if !(0.0..=100.0).contains(&self.targets.default_tolerance_pct) {
            return Err(AnalyticsError::Configuration(format!(
                "default tolerance must be between 0 and 100 percent (got {})",
                self.targets.default_tolerance_pct
            )));
        }
        for (name, weight) in [
            ("count_weight", self.ranking.count_weight),
            ("hours_weight", self.ranking.hours_weight),
        ] {
            if !weight.is_finite() || weight < 0.0 {
                return Err(AnalyticsError::Configuration(format!(
                    "{name} must be a finite, non-negative number (got {weight})"
                )));
            }
        }
        if self.ranking.scorecard_weeks == 0 {
            return Err(AnalyticsError::Configuration(
                "scorecard_weeks must be at least 1".to_string(),
            ));
        }
        self.metric(&self.ranking.default_metric).map(|_| ())
    }

    /// Resolves a metric name with the configured composite weights.
    pub fn metric(&self, name: &str) -> Result<Box<dyn Metric>> {
        metric_by_name(name, self.ranking.count_weight, self.ranking.hours_weight)
    }

    /// Loads the configured target file, or an empty book when none is set.
    pub fn target_book(&self) -> Result<TargetBook> {
        let Some(path) = &self.targets.file else {
            return TargetBook::new(self.targets.default_tolerance_pct);
        };
        let file = std::fs::File::open(path).map_err(|err| {
            AnalyticsError::Configuration(format!(
                "cannot open target file {}: {err}",
                path.display()
            ))
        })?;
        TargetBook::from_csv(file, self.targets.default_tolerance_pct)
    }
}

/// Reads settings from an optional TOML file, then `SURGICAL_OPS__*`
/// environment variables (`SURGICAL_OPS__FISCAL__START_MONTH=1`).
///
/// An explicit `path` must exist; the default file is optional.
pub fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let file = match path {
        Some(path) => config::File::from(path).required(true),
        None => config::File::with_name(DEFAULT_SETTINGS_FILE).required(false),
    };
    let settings = config::Config::builder()
        .add_source(file)
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .and_then(|built| built.try_deserialize::<Settings>())
        .map_err(|err| AnalyticsError::Configuration(err.to_string()))?;

    settings.validate()?;
    tracing::debug!(?settings, "loaded settings");
    Ok(settings)
}
