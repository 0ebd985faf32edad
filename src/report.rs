use std::collections::BTreeMap;
use std::fmt::Write;

use chrono::NaiveDate;
use serde::Serialize;

use crate::aggregate::{aggregate_refs, dimensions, series_through, year_over_year};
use crate::error::{AnalyticsError, Result};
use crate::forecast::{forecast_with, project_fiscal_year};
use crate::models::{CaseRecord, DimensionId, DimensionKind, Granularity, RankDelta};
use crate::ranking::{rank, Metric};
use crate::scorecard::weekly_scorecard;
use crate::settings::Settings;
use crate::targets::TargetBook;
use crate::weekly::weekly_summary;

const RECENT_WEEKS: usize = 6;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategorySummary {
    pub category: String,
    pub count: usize,
    pub avg_duration_minutes: f64,
}

/// Case mix by category, largest first.
pub fn summarize_by_category(records: &[CaseRecord]) -> Vec<CategorySummary> {
    let mut map: BTreeMap<&str, (usize, u64)> = BTreeMap::new();
    for record in records {
        let entry = map.entry(record.category.as_str()).or_insert((0, 0));
        entry.0 += 1;
        entry.1 += u64::from(record.duration_minutes);
    }

    let mut summaries: Vec<CategorySummary> = map
        .into_iter()
        .map(|(category, (count, minutes))| CategorySummary {
            category: category.to_string(),
            count,
            avg_duration_minutes: if count == 0 {
                0.0
            } else {
                minutes as f64 / count as f64
            },
        })
        .collect();

    summaries.sort_by(|a, b| b.count.cmp(&a.count));
    summaries
}

/// Markdown operations report covering complete weeks up to `as_of`.
pub fn build_report(
    records: &[CaseRecord],
    as_of: NaiveDate,
    horizon: usize,
    settings: &Settings,
    targets: &TargetBook,
    metric: &dyn Metric,
) -> Result<String> {
    let calendar = &settings.fiscal;
    let cutoff = calendar.latest_complete_week_end(as_of)?;
    let scoped: Vec<CaseRecord> = records
        .iter()
        .filter(|record| record.date <= cutoff)
        .cloned()
        .collect();
    let weekly = aggregate_refs(&scoped, Granularity::Week, calendar)?;
    let latest_week = calendar.period_start(cutoff, Granularity::Week)?;

    let mut output = String::new();
    let _ = writeln!(output, "# Surgical Volume Report");
    let _ = writeln!(
        output,
        "Complete weeks through {} (metric: {})",
        cutoff,
        metric.name()
    );
    let _ = writeln!(output);

    let _ = writeln!(output, "## Fiscal Year to Date");
    if scoped.is_empty() {
        let _ = writeln!(output, "No cases recorded up to this date.");
    } else {
        let yoy = year_over_year(&scoped, cutoff, calendar, None)?;
        let _ = writeln!(
            output,
            "- FY{} since {}: {} cases (previous year {}, {:+})",
            yoy.fiscal_year, yoy.current_start, yoy.current_total, yoy.previous_total, yoy.difference
        );
        if let Some(growth) = yoy.growth_pct {
            let _ = writeln!(output, "- Growth: {growth:+.1}%");
        }
        for summary in summarize_by_category(&scoped).iter().take(5) {
            let _ = writeln!(
                output,
                "- {}: {} cases (avg {:.0} min)",
                summary.category, summary.count, summary.avg_duration_minutes
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Recent Weeks");
    let weeks = weekly_summary(&scoped, None, calendar, false)?;
    if weeks.is_empty() {
        let _ = writeln!(output, "No weekly data available.");
    } else {
        for week in weeks.iter().rev().take(RECENT_WEEKS).rev() {
            let _ = writeln!(
                output,
                "- Week of {}: {} cases, {:.1} per working day over {} days",
                week.week_start, week.case_count, week.avg_per_working_day, week.active_working_days
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Department Leaderboard");
    let board = rank(
        &weekly,
        DimensionKind::Department,
        Granularity::Week,
        latest_week,
        metric,
        calendar,
    )?;
    if board.is_empty() {
        let _ = writeln!(output, "No departments operated in the week of {latest_week}.");
    } else {
        let statuses = targets.evaluate_ranking(&board, metric.name());
        for (entry, status) in board.iter().zip(&statuses) {
            let movement = match entry.delta {
                RankDelta::New => "new".to_string(),
                RankDelta::Moved(0) => "=".to_string(),
                RankDelta::Moved(places) => format!("{places:+}"),
            };
            let _ = writeln!(
                output,
                "{}. {} {:.1} ({}) target {}",
                entry.rank, entry.dimension.id, entry.value, movement, status.classification
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Weekly Scorecard");
    let scores = weekly_scorecard(
        &weekly,
        targets,
        metric,
        latest_week,
        settings.ranking.scorecard_weeks,
        calendar,
    )?;
    if scores.is_empty() {
        let _ = writeln!(output, "No departments to score.");
    } else {
        for score in &scores {
            let _ = writeln!(
                output,
                "- {} {} {:.1} (target {:.1}, improvement {:.1}, competitiveness {:.1})",
                score.grade,
                score.department,
                score.total_score,
                score.target_performance,
                score.improvement,
                score.competitiveness
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Forecast");
    let hospitals = dimensions(&weekly, DimensionKind::Hospital);
    if hospitals.is_empty() {
        let _ = writeln!(output, "No hospital history to forecast.");
    }
    for hospital in hospitals {
        let dimension = DimensionId::hospital(hospital.as_str());
        let history =
            series_through(&weekly, &dimension, Granularity::Week, latest_week, calendar)?;
        let projected = match forecast_with(&history, horizon, calendar, &settings.forecast, metric) {
            Ok(projected) => projected,
            Err(AnalyticsError::InsufficientHistory { available, .. }) => {
                let _ = writeln!(
                    output,
                    "- {hospital}: not enough history ({available} weeks)"
                );
                continue;
            }
            Err(err) => return Err(err),
        };

        let _ = writeln!(
            output,
            "### {} ({:?}, confidence {:.2}{})",
            hospital,
            projected.model,
            projected.confidence,
            if projected.low_confidence { ", low" } else { "" }
        );
        let statuses = targets.evaluate_forecast(&projected, metric.name());
        for (point, status) in projected.points.iter().zip(&statuses) {
            let _ = writeln!(
                output,
                "- Week of {}: {:.1} [{:.1}, {:.1}] target {}",
                point.period_start, point.point, point.lower, point.upper, status.classification
            );
        }
        let projection = project_fiscal_year(&history, calendar, &settings.forecast, metric)?;
        let _ = writeln!(
            output,
            "- FY{} projection: {:.0} ({:.0} actual + {:.0} forecast over {} weeks)",
            projection.fiscal_year,
            projection.projected_total,
            projection.actual_to_date,
            projection.forecast_remaining,
            projection.remaining_periods
        );
    }

    tracing::info!(%cutoff, departments = board.len(), "built report");
    Ok(output)
}
