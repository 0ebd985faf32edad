use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;

use crate::aggregate::periods;
use crate::calendar::FiscalCalendar;
use crate::error::{AnalyticsError, Result};
use crate::models::{
    Aggregates, DimensionId, DimensionKind, Granularity, PeriodAggregate, RankDelta, RankingEntry,
};

/// Extracts the value a leaderboard is ordered by.
pub trait Metric: Send + Sync {
    fn name(&self) -> &str;
    fn value(&self, aggregate: &PeriodAggregate) -> f64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CaseCount;

impl Metric for CaseCount {
    fn name(&self) -> &str {
        "cases"
    }

    fn value(&self, aggregate: &PeriodAggregate) -> f64 {
        aggregate.case_count as f64
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TotalHours;

impl Metric for TotalHours {
    fn name(&self) -> &str {
        "hours"
    }

    fn value(&self, aggregate: &PeriodAggregate) -> f64 {
        aggregate.total_duration_hours()
    }
}

/// Cases of a single category, e.g. general anaesthesia only.
#[derive(Debug, Clone)]
pub struct CategoryCount {
    category: String,
    name: String,
}

impl CategoryCount {
    pub fn new(category: impl Into<String>) -> Self {
        let category = category.into();
        let name = format!("category:{category}");
        Self { category, name }
    }
}

impl Metric for CategoryCount {
    fn name(&self) -> &str {
        &self.name
    }

    fn value(&self, aggregate: &PeriodAggregate) -> f64 {
        aggregate.category_count(&self.category) as f64
    }
}

/// Weighted sum of other metrics.
pub struct Weighted {
    components: Vec<(f64, Box<dyn Metric>)>,
}

impl Weighted {
    pub fn new() -> Self {
        Self {
            components: Vec::new(),
        }
    }

    pub fn with(mut self, weight: f64, metric: impl Metric + 'static) -> Self {
        let metric: Box<dyn Metric> = Box::new(metric);
        self.components.push((weight, metric));
        self
    }
}

impl Default for Weighted {
    fn default() -> Self {
        Self::new()
    }
}

impl Metric for Weighted {
    fn name(&self) -> &str {
        "composite"
    }

    fn value(&self, aggregate: &PeriodAggregate) -> f64 {
        self.components
            .iter()
            .map(|(weight, metric)| weight * metric.value(aggregate))
            .sum()
    }
}

/// Resolves a metric name as used on the command line and in target files.
pub fn metric_by_name(name: &str, count_weight: f64, hours_weight: f64) -> Result<Box<dyn Metric>> {
    match name.trim() {
        "cases" | "count" => Ok(Box::new(CaseCount)),
        "hours" | "duration" => Ok(Box::new(TotalHours)),
        "composite" => Ok(Box::new(
            Weighted::new()
                .with(count_weight, CaseCount)
                .with(hours_weight, TotalHours),
        )),
        other => match other.strip_prefix("category:") {
            Some(category) if !category.is_empty() => Ok(Box::new(CategoryCount::new(category))),
            _ => Err(AnalyticsError::Configuration(format!("unknown metric '{other}'"))),
        },
    }
}

/// Leaderboard for one dimension kind in the period containing `period`.
///
/// Ordered by metric value descending, ties broken by id ascending. Ties share
/// a rank and the next distinct value skips ahead (1, 1, 3). A period with no
/// aggregates yields an empty leaderboard.
pub fn rank(
    aggregates: &Aggregates,
    kind: DimensionKind,
    granularity: Granularity,
    period: NaiveDate,
    metric: &dyn Metric,
    calendar: &FiscalCalendar,
) -> Result<Vec<RankingEntry>> {
    let start = calendar.period_start(period, granularity)?;
    let current = standings(aggregates, kind, granularity, start, metric);
    if current.is_empty() {
        tracing::debug!(%kind, %granularity, %start, "no aggregates for period");
        return Ok(Vec::new());
    }

    let previous_start = calendar.previous_period_start(start, granularity)?;
    let prior: HashMap<DimensionId, u32> =
        standings(aggregates, kind, granularity, previous_start, metric)
            .into_iter()
            .map(|(dimension, _, rank)| (dimension, rank))
            .collect();

    let entries: Vec<RankingEntry> = current
        .into_iter()
        .map(|(dimension, value, rank)| {
            let prior_rank = prior.get(&dimension).copied();
            let delta = match prior_rank {
                Some(before) => RankDelta::Moved(i64::from(before) - i64::from(rank)),
                None => RankDelta::New,
            };
            RankingEntry {
                dimension,
                period_start: start,
                rank,
                value,
                prior_rank,
                delta,
            }
        })
        .collect();

    tracing::debug!(
        %kind,
        %granularity,
        %start,
        metric = metric.name(),
        entries = entries.len(),
        "ranked period"
    );
    Ok(entries)
}

/// Leaderboards for every period present for the dimension kind.
pub fn rank_history(
    aggregates: &Aggregates,
    kind: DimensionKind,
    granularity: Granularity,
    metric: &dyn Metric,
    calendar: &FiscalCalendar,
) -> Result<BTreeMap<NaiveDate, Vec<RankingEntry>>> {
    periods(aggregates, kind, granularity)
        .into_iter()
        .map(|start| Ok((start, rank(aggregates, kind, granularity, start, metric, calendar)?)))
        .collect()
}

fn standings(
    aggregates: &Aggregates,
    kind: DimensionKind,
    granularity: Granularity,
    start: NaiveDate,
    metric: &dyn Metric,
) -> Vec<(DimensionId, f64, u32)> {
    let mut scored: Vec<(DimensionId, f64)> = aggregates
        .values()
        .filter(|a| {
            a.key.dimension.kind == kind && a.key.granularity == granularity && a.key.start == start
        })
        .map(|a| (a.key.dimension.clone(), metric.value(a)))
        .collect();

    scored.sort_by(|(a_id, a_value), (b_id, b_value)| {
        b_value.total_cmp(a_value).then_with(|| a_id.id.cmp(&b_id.id))
    });

    let ranks = competition_ranks(scored.iter().map(|(_, value)| *value));
    scored
        .into_iter()
        .zip(ranks)
        .map(|((dimension, value), rank)| (dimension, value, rank))
        .collect()
}

/// Standard competition ranks for values already sorted best-first.
pub fn competition_ranks(sorted_values: impl IntoIterator<Item = f64>) -> Vec<u32> {
    let mut ranks = Vec::new();
    let mut previous: Option<f64> = None;
    let mut current_rank = 0;
    for (position, value) in sorted_values.into_iter().enumerate() {
        if previous != Some(value) {
            current_rank = position as u32 + 1;
        }
        ranks.push(current_rank);
        previous = Some(value);
    }
    ranks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::aggregate;
    use crate::models::CaseRecord;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn cases(day: NaiveDate, department: &str, count: usize, minutes: u32) -> Vec<CaseRecord> {
        (0..count)
            .map(|_| CaseRecord {
                date: day,
                hospital: Some("central".to_string()),
                department: Some(department.to_string()),
                surgeon: None,
                duration_minutes: minutes,
                category: "general".to_string(),
                completed: true,
            })
            .collect()
    }

    fn monthly(records: &[CaseRecord]) -> Aggregates {
        aggregate(records, Granularity::Month, &FiscalCalendar::default()).unwrap()
    }

    fn department_ranks(aggregates: &Aggregates, period: NaiveDate, metric: &dyn Metric) -> Vec<RankingEntry> {
        rank(
            aggregates,
            DimensionKind::Department,
            Granularity::Month,
            period,
            metric,
            &FiscalCalendar::default(),
        )
        .unwrap()
    }

    #[test]
    fn ties_share_rank_and_next_rank_skips() {
        let june = date(2025, 6, 1);
        let mut records = cases(june, "ortho", 100, 60);
        records.extend(cases(june, "cardio", 100, 60));
        records.extend(cases(june, "neuro", 90, 60));

        let entries = department_ranks(&monthly(&records), june, &CaseCount);
        let summary: Vec<(&str, u32)> = entries
            .iter()
            .map(|e| (e.dimension.id.as_str(), e.rank))
            .collect();
        assert_eq!(summary, vec![("cardio", 1), ("ortho", 1), ("neuro", 3)]);
    }

    #[test]
    fn delta_compares_against_previous_period() {
        let may = date(2025, 5, 10);
        let june = date(2025, 6, 10);
        let mut records = cases(may, "ortho", 5, 60);
        records.extend(cases(may, "cardio", 3, 60));
        records.extend(cases(june, "ortho", 2, 60));
        records.extend(cases(june, "cardio", 4, 60));
        records.extend(cases(june, "neuro", 1, 60));

        let entries = department_ranks(&monthly(&records), june, &CaseCount);
        assert_eq!(entries[0].dimension.id, "cardio");
        assert_eq!(entries[0].prior_rank, Some(2));
        assert_eq!(entries[0].delta, RankDelta::Moved(1));
        assert_eq!(entries[1].delta, RankDelta::Moved(-1));
        assert_eq!(entries[2].dimension.id, "neuro");
        assert_eq!(entries[2].delta, RankDelta::New);
    }

    #[test]
    fn single_entrant_is_rank_one() {
        let records = cases(date(2025, 6, 3), "ortho", 4, 60);
        let entries = department_ranks(&monthly(&records), date(2025, 6, 1), &CaseCount);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].rank, 1);
        assert_eq!(entries[0].delta, RankDelta::New);
    }

    #[test]
    fn empty_period_yields_no_entries() {
        let records = cases(date(2025, 6, 3), "ortho", 4, 60);
        let entries = department_ranks(&monthly(&records), date(2024, 1, 1), &CaseCount);
        assert!(entries.is_empty());
    }

    #[test]
    fn ranking_is_idempotent_and_contiguous() {
        let june = date(2025, 6, 1);
        let mut records = Vec::new();
        for (index, department) in ["a", "b", "c", "d", "e", "f", "g"].iter().enumerate() {
            records.extend(cases(june, department, 10 - (index / 2), 60));
        }
        let aggregates = monthly(&records);

        let first = department_ranks(&aggregates, june, &CaseCount);
        let second = department_ranks(&aggregates, june, &CaseCount);
        assert_eq!(first, second);

        let ranks: Vec<u32> = first.iter().map(|e| e.rank).collect();
        assert_eq!(ranks, vec![1, 1, 3, 3, 5, 5, 7]);
        assert_eq!(ranks[0], 1);
        for window in ranks.windows(2) {
            assert!(window[1] >= window[0]);
        }
    }

    #[test]
    fn metric_choice_changes_order() {
        let june = date(2025, 6, 1);
        let mut records = cases(june, "ortho", 5, 30);
        records.extend(cases(june, "cardio", 2, 240));
        let aggregates = monthly(&records);

        let by_count = department_ranks(&aggregates, june, &CaseCount);
        assert_eq!(by_count[0].dimension.id, "ortho");

        let by_hours = department_ranks(&aggregates, june, &TotalHours);
        assert_eq!(by_hours[0].dimension.id, "cardio");
        assert_eq!(by_hours[0].value, 8.0);

        let composite = Weighted::new().with(1.0, CaseCount).with(0.5, TotalHours);
        let mixed = department_ranks(&aggregates, june, &composite);
        // ortho: 5 + 1.25, cardio: 2 + 4
        assert_eq!(mixed[0].dimension.id, "ortho");
        assert!((mixed[0].value - 6.25).abs() < 1e-9);
    }

    #[test]
    fn resolves_metrics_by_name() {
        assert_eq!(metric_by_name("cases", 1.0, 1.0).unwrap().name(), "cases");
        assert_eq!(
            metric_by_name("category:general", 1.0, 1.0).unwrap().name(),
            "category:general"
        );
        assert!(metric_by_name("velocity", 1.0, 1.0).is_err());
    }

    #[test]
    fn history_ranks_every_period() {
        let mut records = cases(date(2025, 5, 2), "ortho", 2, 60);
        records.extend(cases(date(2025, 6, 2), "ortho", 1, 60));
        let history = rank_history(
            &monthly(&records),
            DimensionKind::Department,
            Granularity::Month,
            &CaseCount,
            &FiscalCalendar::default(),
        )
        .unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[&date(2025, 6, 1)][0].delta, RankDelta::Moved(0));
    }
}
