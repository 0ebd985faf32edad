use serde::{Deserialize, Serialize};

use crate::calendar::FiscalCalendar;
use crate::error::{AnalyticsError, Result};
use crate::models::{
    FiscalYearProjection, Forecast, ForecastModel, ForecastPoint, Granularity, PeriodAggregate,
};
use crate::ranking::{CaseCount, Metric};

const MIN_HISTORY: usize = 2;
const EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForecastOptions {
    /// Periods per seasonal cycle. Defaults to the granularity's natural cycle.
    pub season_length: Option<usize>,
    /// Band multiplier on the residual standard deviation (1.96 ≈ 95%).
    pub z_score: f64,
    /// Extra band widening applied when falling back to a plain trend.
    pub fallback_band_factor: f64,
    /// Fallback residual floor, as a fraction of the mean fitted level.
    pub fallback_noise_floor: f64,
    pub low_confidence_below: f64,
}

impl Default for ForecastOptions {
    fn default() -> Self {
        Self {
            season_length: None,
            z_score: 1.96,
            fallback_band_factor: 1.5,
            fallback_noise_floor: 0.1,
            low_confidence_below: 0.5,
        }
    }
}

impl ForecastOptions {
    pub fn validate(&self) -> Result<()> {
        if self.season_length == Some(0) {
            return Err(AnalyticsError::Configuration(
                "season length must be at least 1".to_string(),
            ));
        }
        if !(self.z_score.is_finite() && self.z_score > 0.0) {
            return Err(AnalyticsError::Configuration(format!(
                "z score must be positive, got {}",
                self.z_score
            )));
        }
        if !(self.fallback_band_factor.is_finite() && self.fallback_band_factor >= 1.0) {
            return Err(AnalyticsError::Configuration(
                "fallback band factor must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.fallback_noise_floor)
            || !(0.0..=1.0).contains(&self.low_confidence_below)
        {
            return Err(AnalyticsError::Configuration(
                "noise floor and confidence threshold must be within 0..=1".to_string(),
            ));
        }
        Ok(())
    }
}

struct Fit {
    model: ForecastModel,
    fallback: bool,
    season_length: usize,
    intercept: f64,
    slope: f64,
    offsets: Vec<f64>,
    residual_std_dev: f64,
    mean_level: f64,
}

impl Fit {
    fn trend(&self, t: usize) -> f64 {
        self.intercept + self.slope * t as f64
    }

    fn seasonal(&self, t: usize) -> f64 {
        if self.offsets.is_empty() {
            0.0
        } else {
            self.offsets[t % self.offsets.len()]
        }
    }
}

/// Forecasts case volume `horizon` periods past the end of `history`.
pub fn forecast(
    history: &[PeriodAggregate],
    horizon: usize,
    calendar: &FiscalCalendar,
    options: &ForecastOptions,
) -> Result<Forecast> {
    forecast_with(history, horizon, calendar, options, &CaseCount)
}

/// Forecasts any metric of one dimension's ordered history.
///
/// Uses a trend plus seasonal decomposition when the history covers at least
/// two full cycles, otherwise a linear trend with wider bands and a reduced
/// confidence. Band half-width grows with the square root of the horizon.
pub fn forecast_with(
    history: &[PeriodAggregate],
    horizon: usize,
    calendar: &FiscalCalendar,
    options: &ForecastOptions,
    metric: &dyn Metric,
) -> Result<Forecast> {
    options.validate()?;
    if history.len() < MIN_HISTORY {
        return Err(AnalyticsError::InsufficientHistory {
            required: MIN_HISTORY,
            available: history.len(),
        });
    }
    check_history(history)?;

    let first = &history[0].key;
    let granularity = first.granularity;
    let values: Vec<f64> = history.iter().map(|a| metric.value(a)).collect();
    let season_length = options
        .season_length
        .unwrap_or_else(|| granularity.default_season_length());

    let fit = fit(&values, season_length, options);
    let fallback = fit.fallback;
    let confidence = confidence(&fit, if fallback { 0.5 } else { 1.0 });
    let band_factor = if fallback {
        options.fallback_band_factor
    } else {
        1.0
    };

    if fallback {
        tracing::warn!(
            dimension = %first.dimension,
            periods = values.len(),
            season_length,
            "history shorter than two seasonal cycles, using linear trend"
        );
    }

    let n = values.len();
    let mut points = Vec::with_capacity(horizon);
    let mut cursor = history[n - 1].key.start;
    for step in 1..=horizon {
        cursor = calendar.next_period_start(cursor, granularity)?;
        let t = n - 1 + step;
        let point = fit.trend(t) + fit.seasonal(t);
        let half_width =
            options.z_score * fit.residual_std_dev * band_factor * (step as f64).sqrt();
        points.push(ForecastPoint {
            period_start: cursor,
            point,
            lower: point - half_width,
            upper: point + half_width,
            confidence,
        });
    }

    tracing::debug!(
        dimension = %first.dimension,
        %granularity,
        horizon,
        confidence,
        "forecast complete"
    );

    Ok(Forecast {
        dimension: first.dimension.clone(),
        granularity,
        model: fit.model,
        season_length: fit.season_length,
        low_confidence: fallback || confidence < options.low_confidence_below,
        slope: fit.slope,
        residual_std_dev: fit.residual_std_dev,
        confidence,
        points,
    })
}

fn check_history(history: &[PeriodAggregate]) -> Result<()> {
    let first = &history[0].key;
    for pair in history.windows(2) {
        let (previous, next) = (&pair[0].key, &pair[1].key);
        if next.dimension != first.dimension || next.granularity != first.granularity {
            return Err(AnalyticsError::Configuration(format!(
                "history mixes {} {} with {} {}",
                first.dimension, first.granularity, next.dimension, next.granularity
            )));
        }
        if next.start <= previous.start {
            return Err(AnalyticsError::Configuration(format!(
                "history is not in ascending period order at {}",
                next.start
            )));
        }
    }
    Ok(())
}

fn fit(values: &[f64], season_length: usize, options: &ForecastOptions) -> Fit {
    let n = values.len();
    let seasonal = season_length >= 2 && n >= 2 * season_length;

    if !seasonal {
        // A cycle of one period has nothing seasonal to miss, so a plain trend
        // is the intended model rather than a fallback.
        let fallback = season_length >= 2;
        let (intercept, slope) = least_squares(values);
        let residuals: Vec<f64> = values
            .iter()
            .enumerate()
            .map(|(t, y)| y - (intercept + slope * t as f64))
            .collect();
        let mean_level = mean_level(intercept, slope, n);
        let mut residual_std_dev = residual_std_dev(&residuals, n.saturating_sub(2));
        if fallback {
            residual_std_dev = residual_std_dev.max(options.fallback_noise_floor * mean_level);
        }
        return Fit {
            model: ForecastModel::LinearTrend,
            fallback,
            season_length,
            intercept,
            slope,
            offsets: Vec::new(),
            residual_std_dev,
            mean_level,
        };
    }

    // Seasonal offsets are the average deviation from a centred moving
    // average at each cycle position, centred so they sum to zero.
    let smoothed = centred_moving_average(values, season_length);
    let mut sums = vec![0.0; season_length];
    let mut counts = vec![0usize; season_length];
    for (t, (y, trend)) in values.iter().zip(&smoothed).enumerate() {
        if let Some(trend) = trend {
            sums[t % season_length] += y - trend;
            counts[t % season_length] += 1;
        }
    }
    let mut offsets: Vec<f64> = sums
        .iter()
        .zip(&counts)
        .map(|(sum, count)| if *count > 0 { sum / *count as f64 } else { 0.0 })
        .collect();
    let centre = offsets.iter().sum::<f64>() / season_length as f64;
    offsets.iter_mut().for_each(|offset| *offset -= centre);

    let deseasonalised: Vec<f64> = values
        .iter()
        .enumerate()
        .map(|(t, y)| y - offsets[t % season_length])
        .collect();
    let (intercept, slope) = least_squares(&deseasonalised);
    let residuals: Vec<f64> = values
        .iter()
        .enumerate()
        .map(|(t, y)| y - (intercept + slope * t as f64 + offsets[t % season_length]))
        .collect();
    let degrees_of_freedom = n.saturating_sub(2 + season_length - 1);

    Fit {
        model: ForecastModel::SeasonalTrend,
        fallback: false,
        season_length,
        intercept,
        slope,
        offsets,
        residual_std_dev: residual_std_dev(&residuals, degrees_of_freedom),
        mean_level: mean_level(intercept, slope, n),
    }
}

/// Moving average spanning exactly one cycle, centred on each period. Even
/// cycle lengths use half weights on the two outer periods. Periods too close
/// to either end have no value.
fn centred_moving_average(values: &[f64], span: usize) -> Vec<Option<f64>> {
    let n = values.len();
    let half = span / 2;
    (0..n)
        .map(|t| {
            if t < half || t + half >= n {
                return None;
            }
            let total = if span % 2 == 1 {
                values[t - half..=t + half].iter().sum::<f64>()
            } else {
                0.5 * values[t - half]
                    + values[t + 1 - half..t + half].iter().sum::<f64>()
                    + 0.5 * values[t + half]
            };
            Some(total / span as f64)
        })
        .collect()
}

/// Ordinary least squares over t = 0..n, returning (intercept, slope).
fn least_squares(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean_t = (n - 1.0) / 2.0;
    let mean_y = values.iter().sum::<f64>() / n;
    let (mut sxy, mut sxx) = (0.0, 0.0);
    for (t, y) in values.iter().enumerate() {
        let dt = t as f64 - mean_t;
        sxy += dt * (y - mean_y);
        sxx += dt * dt;
    }
    let slope = if sxx > 0.0 { sxy / sxx } else { 0.0 };
    (mean_y - slope * mean_t, slope)
}

fn residual_std_dev(residuals: &[f64], degrees_of_freedom: usize) -> f64 {
    let sum_sq: f64 = residuals.iter().map(|r| r * r).sum();
    let std_dev = (sum_sq / degrees_of_freedom.max(1) as f64).sqrt();
    if std_dev < EPSILON {
        0.0
    } else {
        std_dev
    }
}

fn mean_level(intercept: f64, slope: f64, n: usize) -> f64 {
    (0..n)
        .map(|t| (intercept + slope * t as f64).abs())
        .sum::<f64>()
        / n as f64
}

fn confidence(fit: &Fit, scale: f64) -> f64 {
    let raw = if fit.residual_std_dev == 0.0 {
        1.0
    } else if fit.mean_level < EPSILON {
        0.0
    } else {
        1.0 - fit.residual_std_dev / fit.mean_level
    };
    (raw * scale).clamp(0.0, 1.0)
}

/// Number of periods after `last_start` that still fall in its fiscal year.
pub fn periods_remaining_in_fiscal_year(
    last_start: chrono::NaiveDate,
    granularity: Granularity,
    calendar: &FiscalCalendar,
) -> Result<usize> {
    let fiscal_start = calendar.period_start(last_start, Granularity::FiscalYear)?;
    let fiscal_end = calendar.period_end(fiscal_start, Granularity::FiscalYear)?;
    let mut remaining = 0;
    let mut cursor = calendar.next_period_start(last_start, granularity)?;
    while cursor <= fiscal_end {
        remaining += 1;
        cursor = calendar.next_period_start(cursor, granularity)?;
    }
    Ok(remaining)
}

/// Actual volume so far in the fiscal year of the last observed period, plus
/// forecast volume for the periods of that year still to come.
pub fn fiscal_year_projection(
    history: &[PeriodAggregate],
    forecast: &Forecast,
    metric: &dyn Metric,
    calendar: &FiscalCalendar,
) -> Result<FiscalYearProjection> {
    let last = history.last().ok_or(AnalyticsError::InsufficientHistory {
        required: 1,
        available: 0,
    })?;
    let fiscal_year = calendar.fiscal_year(last.key.start)?;
    let fiscal_start = calendar.fiscal_year_start(fiscal_year)?;
    let fiscal_end = calendar.period_end(fiscal_start, Granularity::FiscalYear)?;

    let actual_to_date: f64 = history
        .iter()
        .filter(|a| a.key.start >= fiscal_start && a.key.start <= fiscal_end)
        .map(|a| metric.value(a))
        .sum();
    let remaining: Vec<&ForecastPoint> = forecast
        .points
        .iter()
        .filter(|p| p.period_start > last.key.start && p.period_start <= fiscal_end)
        .collect();
    let needed = periods_remaining_in_fiscal_year(last.key.start, last.key.granularity, calendar)?;
    if remaining.len() < needed {
        return Err(AnalyticsError::Configuration(format!(
            "forecast covers {} of the {needed} periods left in FY{fiscal_year}",
            remaining.len()
        )));
    }
    let forecast_remaining: f64 = remaining.iter().map(|p| p.point.max(0.0)).sum();

    Ok(FiscalYearProjection {
        fiscal_year,
        actual_to_date,
        forecast_remaining,
        projected_total: actual_to_date + forecast_remaining,
        remaining_periods: remaining.len(),
    })
}

/// Fits a forecast that runs to the end of the fiscal year of the last
/// observed period and projects that year's total from it.
pub fn project_fiscal_year(
    history: &[PeriodAggregate],
    calendar: &FiscalCalendar,
    options: &ForecastOptions,
    metric: &dyn Metric,
) -> Result<FiscalYearProjection> {
    let last = history.last().ok_or(AnalyticsError::InsufficientHistory {
        required: MIN_HISTORY,
        available: 0,
    })?;
    let horizon = periods_remaining_in_fiscal_year(last.key.start, last.key.granularity, calendar)?;
    let forecast = forecast_with(history, horizon, calendar, options, metric)?;
    fiscal_year_projection(history, &forecast, metric, calendar)
}
