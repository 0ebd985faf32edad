use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;

use crate::calendar::FiscalCalendar;
use crate::error::Result;
use crate::models::{CaseRecord, CumulativePoint, DimensionId, Granularity, PeriodAggregate, WeeklySummary};

#[derive(Default)]
struct WeekTally {
    cases: u64,
    working_day_cases: u64,
    active_days: BTreeSet<NaiveDate>,
}

/// Per-week volume with working-day averages, optionally cut back to the last
/// complete week so a half-finished week does not drag the trend down.
pub fn weekly_summary(
    records: &[CaseRecord],
    dimension: Option<&DimensionId>,
    calendar: &FiscalCalendar,
    complete_weeks_only: bool,
) -> Result<Vec<WeeklySummary>> {
    calendar.validate()?;
    let scoped: Vec<&CaseRecord> = records
        .iter()
        .filter(|record| dimension.map_or(true, |d| record.belongs_to(d)))
        .collect();

    let Some(latest) = scoped.iter().map(|record| record.date).max() else {
        return Ok(Vec::new());
    };
    let cutoff = if complete_weeks_only {
        calendar.latest_complete_week_end(latest)?
    } else {
        latest
    };

    let mut weeks: BTreeMap<NaiveDate, WeekTally> = BTreeMap::new();
    for record in scoped.into_iter().filter(|record| record.date <= cutoff) {
        let week_start = calendar.period_start(record.date, Granularity::Week)?;
        let tally = weeks.entry(week_start).or_default();
        tally.cases += 1;
        if calendar.is_working_day(record.date) {
            tally.working_day_cases += 1;
            tally.active_days.insert(record.date);
        }
    }

    tracing::debug!(weeks = weeks.len(), %cutoff, "built weekly summary");
    Ok(weeks
        .into_iter()
        .map(|(week_start, tally)| {
            let active_working_days = tally.active_days.len() as u32;
            let avg_per_working_day = if active_working_days > 0 {
                round_tenth(tally.working_day_cases as f64 / f64::from(active_working_days))
            } else {
                0.0
            };
            WeeklySummary {
                week_start,
                case_count: tally.cases,
                working_day_cases: tally.working_day_cases,
                active_working_days,
                avg_per_working_day,
            }
        })
        .collect())
}

/// Running actual volume against a flat per-period target.
pub fn cumulative_progress(history: &[PeriodAggregate], target_per_period: f64) -> Vec<CumulativePoint> {
    let mut running = 0;
    history
        .iter()
        .enumerate()
        .map(|(index, aggregate)| {
            running += aggregate.case_count;
            CumulativePoint {
                period_start: aggregate.key.start,
                actual: aggregate.case_count,
                cumulative_actual: running,
                cumulative_target: (index + 1) as f64 * target_per_period,
            }
        })
        .collect()
}

fn round_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
