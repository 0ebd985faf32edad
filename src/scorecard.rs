use chrono::{Days, NaiveDate};

use crate::aggregate::dimensions;
use crate::calendar::FiscalCalendar;
use crate::error::{AnalyticsError, Result};
use crate::models::{
    Aggregates, DepartmentScore, DimensionId, DimensionKind, Granularity, PeriodKey,
};
use crate::ranking::Metric;
use crate::targets::TargetBook;

/// Weekly department scorecard over the `weeks` weeks ending with the week
/// that contains `latest`.
///
/// Each department is scored out of 100: target performance (55),
/// improvement and stability (25) and competitiveness against the other
/// departments (20). Targets are looked up under the metric's name. The
/// result is ordered by total score.
pub fn weekly_scorecard(
    aggregates: &Aggregates,
    targets: &TargetBook,
    metric: &dyn Metric,
    latest: NaiveDate,
    weeks: usize,
    calendar: &FiscalCalendar,
) -> Result<Vec<DepartmentScore>> {
    if weeks == 0 {
        return Err(AnalyticsError::Configuration(
            "scorecard window must cover at least one week".to_string(),
        ));
    }
    let latest_week = calendar.period_start(latest, Granularity::Week)?;
    let out_of_range =
        || AnalyticsError::Configuration(format!("{weeks} weeks before {latest_week} is out of range"));
    let span = u64::try_from(weeks - 1)
        .ok()
        .and_then(|extra| extra.checked_mul(7))
        .ok_or_else(out_of_range)?;
    let first_week = latest_week
        .checked_sub_days(Days::new(span))
        .ok_or_else(out_of_range)?;

    let mut drafts = Vec::new();
    for department in dimensions(aggregates, DimensionKind::Department) {
        let dimension = DimensionId::department(department.as_str());
        let values =
            window_values(aggregates, &dimension, metric, first_week, latest_week, calendar)?;
        if values.is_empty() {
            continue;
        }
        let target = targets
            .get(&dimension, metric.name())
            .map(|t| t.value)
            .filter(|value| *value > 0.0);
        drafts.push(Draft::new(department, &values, target));
    }

    drafts.sort_by(|a, b| {
        b.preliminary()
            .total_cmp(&a.preliminary())
            .then_with(|| a.department.cmp(&b.department))
    });

    let mut by_improvement: Vec<usize> = (0..drafts.len()).collect();
    by_improvement.sort_by(|&a, &b| {
        drafts[b]
            .week_over_week_pct
            .total_cmp(&drafts[a].week_over_week_pct)
    });
    let mut improvement_ranks = vec![0u32; drafts.len()];
    for (position, index) in by_improvement.into_iter().enumerate() {
        improvement_ranks[index] = position as u32 + 1;
    }

    let total = drafts.len();
    let mut scores: Vec<DepartmentScore> = drafts
        .into_iter()
        .zip(improvement_ranks)
        .enumerate()
        .map(|(position, (draft, improvement_rank))| {
            let hospital_rank = position as u32 + 1;
            let competitiveness = hospital_rank_score(hospital_rank, total)
                + improvement_rank_score(improvement_rank);
            draft.finish(hospital_rank, improvement_rank, competitiveness)
        })
        .collect();

    scores.sort_by(|a, b| {
        b.total_score
            .total_cmp(&a.total_score)
            .then_with(|| a.hospital_rank.cmp(&b.hospital_rank))
    });

    tracing::debug!(departments = scores.len(), %latest_week, weeks, "built weekly scorecard");
    Ok(scores)
}

/// Metric values per week from the department's first active week inside
/// the window through `latest_week`, with quiet weeks as zero.
fn window_values(
    aggregates: &Aggregates,
    dimension: &DimensionId,
    metric: &dyn Metric,
    first_week: NaiveDate,
    latest_week: NaiveDate,
    calendar: &FiscalCalendar,
) -> Result<Vec<f64>> {
    let key = |start: NaiveDate| PeriodKey {
        dimension: dimension.clone(),
        granularity: Granularity::Week,
        start,
    };
    let Some(first_active) = aggregates
        .range(key(first_week)..=key(latest_week))
        .map(|(key, _)| key.start)
        .next()
    else {
        return Ok(Vec::new());
    };

    let mut values = Vec::new();
    let mut week = first_active;
    while week <= latest_week {
        values.push(aggregates.get(&key(week)).map_or(0.0, |a| metric.value(a)));
        week = calendar.next_period_start(week, Granularity::Week)?;
    }
    Ok(values)
}

struct Draft {
    department: String,
    target_performance: f64,
    improvement: f64,
    latest: f64,
    average: f64,
    weekly_target: Option<f64>,
    week_over_week_pct: f64,
}

impl Draft {
    fn new(department: String, values: &[f64], weekly_target: Option<f64>) -> Self {
        let latest = values.last().copied().unwrap_or(0.0);
        let average = mean(values);
        let previous = values.len().checked_sub(2).map(|i| values[i]);
        let week_over_week_pct = match previous {
            Some(previous) if previous > 0.0 => (latest - previous) / previous * 100.0,
            _ => 0.0,
        };

        Self {
            department,
            target_performance: target_performance(latest, average, weekly_target),
            improvement: improvement(values, latest, average),
            latest,
            average,
            weekly_target,
            week_over_week_pct,
        }
    }

    /// Score before competitiveness is known, with the midpoint standing in.
    fn preliminary(&self) -> f64 {
        self.target_performance + self.improvement + 10.0
    }

    fn finish(self, hospital_rank: u32, improvement_rank: u32, competitiveness: f64) -> DepartmentScore {
        let total_score = self.target_performance + self.improvement + competitiveness;
        DepartmentScore {
            department: self.department,
            total_score,
            grade: grade(total_score).to_string(),
            target_performance: self.target_performance,
            improvement: self.improvement,
            competitiveness,
            latest_cases: self.latest.round().max(0.0) as u64,
            average_cases: self.average,
            weekly_target: self.weekly_target,
            achievement_pct: self.weekly_target.map(|target| self.latest / target * 100.0),
            week_over_week_pct: self.week_over_week_pct,
            hospital_rank,
            improvement_rank,
        }
    }
}

fn target_performance(latest: f64, average: f64, weekly_target: Option<f64>) -> f64 {
    let Some(target) = weekly_target else {
        return 17.5 + 10.0;
    };

    let latest_pct = latest / target * 100.0;
    let latest_score = match latest_pct {
        p if p >= 120.0 => 30.0,
        p if p >= 100.0 => 25.0,
        p if p >= 90.0 => 20.0,
        p if p >= 80.0 => 15.0,
        p if p >= 70.0 => 10.0,
        p => (p / 70.0 * 10.0).max(0.0),
    };

    let average_pct = average / target * 100.0;
    let average_score = match average_pct {
        p if p >= 110.0 => 15.0,
        p if p >= 100.0 => 12.0,
        p if p >= 90.0 => 10.0,
        p if p >= 80.0 => 8.0,
        p => (p / 80.0 * 8.0).max(0.0),
    };

    latest_score
        + bonus(latest_pct)
        + average_score
        + bonus(average_pct)
}

fn bonus(achievement_pct: f64) -> f64 {
    if achievement_pct >= 100.0 {
        5.0
    } else {
        0.0
    }
}

fn improvement(values: &[f64], latest: f64, average: f64) -> f64 {
    let trend = match values.len().checked_sub(2).map(|i| values[i]) {
        None => 7.5,
        Some(previous) => {
            let week_over_week = if previous > 0.0 {
                match (latest - previous) / previous * 100.0 {
                    p if p >= 15.0 => 10.0,
                    p if p >= 10.0 => 8.0,
                    p if p >= 5.0 => 6.0,
                    p if p >= 0.0 => 4.0,
                    p if p >= -5.0 => 2.0,
                    _ => 0.0,
                }
            } else {
                5.0
            };
            let against_average = if average > 0.0 {
                match (latest - average) / average * 100.0 {
                    p if p >= 10.0 => 5.0,
                    p if p >= 5.0 => 4.0,
                    p if p >= 0.0 => 3.0,
                    p if p >= -5.0 => 2.0,
                    _ => 0.0,
                }
            } else {
                2.5
            };
            week_over_week + against_average
        }
    };

    let stability = if values.len() >= 3 {
        match coefficient_of_variation(values) {
            cv if cv <= 0.1 => 10.0,
            cv if cv <= 0.2 => 8.0,
            cv if cv <= 0.3 => 6.0,
            cv if cv <= 0.4 => 4.0,
            _ => 2.0,
        }
    } else {
        5.0
    };

    trend + stability
}

/// Sample standard deviation over the mean; 0.3 when the mean is zero.
fn coefficient_of_variation(values: &[f64]) -> f64 {
    let average = mean(values);
    if average <= 0.0 || values.len() < 2 {
        return 0.3;
    }
    let variance = values
        .iter()
        .map(|value| (value - average).powi(2))
        .sum::<f64>()
        / (values.len() - 1) as f64;
    variance.sqrt() / average
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

fn hospital_rank_score(rank: u32, total: usize) -> f64 {
    let position = f64::from(rank);
    match rank {
        1 => 12.0,
        2 => 10.0,
        3 => 8.0,
        4 | 5 => 6.0,
        _ if position <= total as f64 * 0.3 => 4.0,
        _ if position <= total as f64 * 0.5 => 2.0,
        _ => 0.0,
    }
}

fn improvement_rank_score(rank: u32) -> f64 {
    match rank {
        1 => 8.0,
        2 => 6.0,
        3 => 4.0,
        4 | 5 => 2.0,
        _ => 0.0,
    }
}

pub fn grade(total_score: f64) -> &'static str {
    match total_score {
        s if s >= 90.0 => "S+",
        s if s >= 85.0 => "S",
        s if s >= 80.0 => "A+",
        s if s >= 75.0 => "A",
        s if s >= 65.0 => "B",
        s if s >= 50.0 => "C",
        _ => "D",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::aggregate;
    use crate::models::CaseRecord;
    use crate::ranking::CaseCount;
    use chrono::Duration;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn cases(week: NaiveDate, department: &str, count: usize) -> Vec<CaseRecord> {
        (0..count)
            .map(|_| CaseRecord {
                date: week,
                hospital: Some("central".to_string()),
                department: Some(department.to_string()),
                surgeon: None,
                duration_minutes: 90,
                category: "general".to_string(),
                completed: true,
            })
            .collect()
    }

    fn weekly(department: &str, counts: &[usize]) -> Vec<CaseRecord> {
        counts
            .iter()
            .enumerate()
            .flat_map(|(i, count)| {
                cases(date(2025, 5, 19) + Duration::weeks(i as i64), department, *count)
            })
            .collect()
    }

    #[test]
    fn grade_boundaries() {
        assert_eq!(grade(90.0), "S+");
        assert_eq!(grade(89.99), "S");
        assert_eq!(grade(85.0), "S");
        assert_eq!(grade(80.0), "A+");
        assert_eq!(grade(75.0), "A");
        assert_eq!(grade(74.9), "B");
        assert_eq!(grade(65.0), "B");
        assert_eq!(grade(50.0), "C");
        assert_eq!(grade(49.9), "D");
    }

    #[test]
    fn scores_departments_against_targets_and_each_other() {
        let calendar = FiscalCalendar::default();
        let mut records = weekly("ortho", &[10, 10, 12]);
        records.extend(weekly("cardio", &[20, 16, 12]));
        let aggregates = aggregate(&records, Granularity::Week, &calendar).unwrap();

        let mut targets = TargetBook::default();
        targets
            .insert(DimensionId::department("ortho"), "cases", 10.0, None)
            .unwrap();
        targets
            .insert(DimensionId::department("cardio"), "cases", 20.0, None)
            .unwrap();

        let scores =
            weekly_scorecard(&aggregates, &targets, &CaseCount, date(2025, 6, 4), 4, &calendar)
                .unwrap();
        assert_eq!(scores.len(), 2);

        let ortho = &scores[0];
        assert_eq!(ortho.department, "ortho");
        assert!((ortho.target_performance - 52.0).abs() < 1e-9);
        assert!((ortho.improvement - 23.0).abs() < 1e-9);
        assert!((ortho.competitiveness - 20.0).abs() < 1e-9);
        assert!((ortho.total_score - 95.0).abs() < 1e-9);
        assert_eq!(ortho.grade, "S+");
        assert_eq!(ortho.latest_cases, 12);
        assert!((ortho.achievement_pct.unwrap() - 120.0).abs() < 1e-9);
        assert_eq!((ortho.hospital_rank, ortho.improvement_rank), (1, 1));

        let cardio = &scores[1];
        assert!((cardio.target_performance - (60.0 / 70.0 * 10.0 + 8.0)).abs() < 1e-9);
        assert!((cardio.improvement - 6.0).abs() < 1e-9);
        assert!((cardio.competitiveness - 16.0).abs() < 1e-9);
        assert_eq!(cardio.grade, "D");
        assert!((cardio.week_over_week_pct + 25.0).abs() < 1e-9);
    }

    #[test]
    fn untargeted_short_history_uses_neutral_scores() {
        let calendar = FiscalCalendar::default();
        let records = cases(date(2025, 6, 2), "neuro", 5);
        let aggregates = aggregate(&records, Granularity::Week, &calendar).unwrap();

        let scores = weekly_scorecard(
            &aggregates,
            &TargetBook::default(),
            &CaseCount,
            date(2025, 6, 2),
            12,
            &calendar,
        )
        .unwrap();
        let neuro = &scores[0];
        assert!((neuro.target_performance - 27.5).abs() < 1e-9);
        assert!((neuro.improvement - 12.5).abs() < 1e-9);
        assert!((neuro.total_score - 60.0).abs() < 1e-9);
        assert_eq!(neuro.weekly_target, None);
        assert_eq!(neuro.achievement_pct, None);
    }

    #[test]
    fn departments_outside_the_window_are_skipped() {
        let calendar = FiscalCalendar::default();
        let mut records = cases(date(2025, 1, 6), "ent", 3);
        records.extend(cases(date(2025, 6, 2), "ortho", 3));
        let aggregates = aggregate(&records, Granularity::Week, &calendar).unwrap();

        let scores = weekly_scorecard(
            &aggregates,
            &TargetBook::default(),
            &CaseCount,
            date(2025, 6, 2),
            4,
            &calendar,
        )
        .unwrap();
        assert_eq!(scores.len(), 1);
        assert_eq!(scores[0].department, "ortho");

        assert!(weekly_scorecard(
            &aggregates,
            &TargetBook::default(),
            &CaseCount,
            date(2025, 6, 2),
            0,
            &calendar
        )
        .is_err());
    }

    #[test]
    fn oversized_window_is_a_configuration_error() {
        let calendar = FiscalCalendar::default();
        let aggregates = aggregate(&cases(date(2025, 6, 2), "ortho", 3), Granularity::Week, &calendar).unwrap();
        for weeks in [usize::MAX, 100_000_000] {
            let result = weekly_scorecard(
                &aggregates,
                &TargetBook::default(),
                &CaseCount,
                date(2025, 6, 2),
                weeks,
                &calendar,
            );
            assert!(matches!(result, Err(AnalyticsError::Configuration(_))), "{weeks}");
        }
    }

    #[test]
    fn rank_scores_follow_position() {
        assert_eq!(hospital_rank_score(1, 20), 12.0);
        assert_eq!(hospital_rank_score(5, 20), 6.0);
        assert_eq!(hospital_rank_score(6, 20), 4.0);
        assert_eq!(hospital_rank_score(10, 20), 2.0);
        assert_eq!(hospital_rank_score(11, 20), 0.0);
        assert_eq!(improvement_rank_score(3), 4.0);
        assert_eq!(improvement_rank_score(6), 0.0);
    }
}
