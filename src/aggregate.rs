use std::collections::{BTreeMap, BTreeSet};

use chrono::{Months, NaiveDate};

use crate::calendar::FiscalCalendar;
use crate::error::{AnalyticsError, Result};
use crate::models::{
    Aggregates, CaseRecord, DimensionId, DimensionKind, Granularity, PeriodAggregate, PeriodKey,
    YearOverYear,
};

/// Buckets every record into one period per dimension it carries.
///
/// A record with no surgeon still counts toward its hospital and department.
/// A record whose date has no period under `calendar` is skipped and logged
/// as malformed. An empty slice produces an empty map.
pub fn aggregate(
    records: &[CaseRecord],
    granularity: Granularity,
    calendar: &FiscalCalendar,
) -> Result<Aggregates> {
    aggregate_refs(records, granularity, calendar)
}

/// Same as [`aggregate`] over borrowed records, so callers can pre-filter
/// without cloning.
pub fn aggregate_refs<'a>(
    records: impl IntoIterator<Item = &'a CaseRecord>,
    granularity: Granularity,
    calendar: &FiscalCalendar,
) -> Result<Aggregates> {
    calendar.validate()?;
    let mut buckets: Aggregates = BTreeMap::new();
    let mut seen = 0usize;
    let mut skipped = 0usize;

    for record in records {
        seen += 1;
        let start = match calendar.period_start(record.date, granularity) {
            Ok(start) => start,
            Err(err) => {
                let err = AnalyticsError::MalformedRecord {
                    row: seen,
                    reason: err.to_string(),
                };
                tracing::warn!(%err, date = %record.date, "skipping case record");
                skipped += 1;
                continue;
            }
        };
        for kind in DimensionKind::ALL {
            let Some(id) = record.dimension_value(kind) else {
                continue;
            };
            let key = PeriodKey {
                dimension: DimensionId::new(kind, id),
                granularity,
                start,
            };
            let bucket = buckets
                .entry(key.clone())
                .or_insert_with(|| PeriodAggregate::empty(key));
            accumulate(bucket, record);
        }
    }

    tracing::debug!(
        records = seen,
        skipped,
        buckets = buckets.len(),
        %granularity,
        "aggregated case records"
    );
    Ok(buckets)
}

fn accumulate(bucket: &mut PeriodAggregate, record: &CaseRecord) {
    bucket.case_count += 1;
    bucket.total_duration_minutes += u64::from(record.duration_minutes);
    if record.completed {
        bucket.completed_count += 1;
    }
    *bucket.by_category.entry(record.category.clone()).or_insert(0) += 1;
}

/// Ordered history of one dimension. Periods with no cases between the first
/// and last observed period are filled with empty aggregates. An unknown
/// dimension yields an empty vector.
pub fn series(
    aggregates: &Aggregates,
    dimension: &DimensionId,
    granularity: Granularity,
    calendar: &FiscalCalendar,
) -> Result<Vec<PeriodAggregate>> {
    fill_series(aggregates, dimension, granularity, None, calendar)
}

/// Like [`series`], but keeps zero-filling past the last observed period up
/// to the period containing `through`, so a dimension that went quiet still
/// ends at the caller's cutoff.
pub fn series_through(
    aggregates: &Aggregates,
    dimension: &DimensionId,
    granularity: Granularity,
    through: NaiveDate,
    calendar: &FiscalCalendar,
) -> Result<Vec<PeriodAggregate>> {
    let through = calendar.period_start(through, granularity)?;
    fill_series(aggregates, dimension, granularity, Some(through), calendar)
}

fn fill_series(
    aggregates: &Aggregates,
    dimension: &DimensionId,
    granularity: Granularity,
    through: Option<NaiveDate>,
    calendar: &FiscalCalendar,
) -> Result<Vec<PeriodAggregate>> {
    let observed: Vec<&PeriodAggregate> = aggregates
        .range(
            key_bound(dimension, granularity, NaiveDate::MIN)
                ..=key_bound(dimension, granularity, NaiveDate::MAX),
        )
        .map(|(_, aggregate)| aggregate)
        .collect();

    let (Some(first), Some(last)) = (observed.first(), observed.last()) else {
        return Ok(Vec::new());
    };

    let end = through.map_or(last.key.start, |through| through.max(last.key.start));
    let mut filled = Vec::with_capacity(observed.len());
    let mut cursor = first.key.start;
    let mut observed = observed.iter().peekable();
    while cursor <= end {
        match observed.peek() {
            Some(aggregate) if aggregate.key.start == cursor => {
                filled.push((**aggregate).clone());
                observed.next();
            }
            _ => filled.push(PeriodAggregate::empty(key_bound(dimension, granularity, cursor))),
        }
        cursor = calendar.next_period_start(cursor, granularity)?;
    }
    Ok(filled)
}

fn key_bound(dimension: &DimensionId, granularity: Granularity, start: NaiveDate) -> PeriodKey {
    PeriodKey {
        dimension: dimension.clone(),
        granularity,
        start,
    }
}

/// Sorted distinct ids of one dimension kind present in the aggregates.
pub fn dimensions(aggregates: &Aggregates, kind: DimensionKind) -> Vec<String> {
    aggregates
        .keys()
        .filter(|key| key.dimension.kind == kind)
        .map(|key| key.dimension.id.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Sorted distinct period starts for one dimension kind and granularity.
pub fn periods(aggregates: &Aggregates, kind: DimensionKind, granularity: Granularity) -> Vec<NaiveDate> {
    aggregates
        .keys()
        .filter(|key| key.dimension.kind == kind && key.granularity == granularity)
        .map(|key| key.start)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

pub fn lookup<'a>(aggregates: &'a Aggregates, key: &PeriodKey) -> Result<&'a PeriodAggregate> {
    aggregates
        .get(key)
        .ok_or_else(|| AnalyticsError::UnknownDimension(format!("{} @ {}", key.dimension, key.start)))
}

/// Fiscal-year-to-date volume compared with the same span one year earlier.
pub fn year_over_year(
    records: &[CaseRecord],
    as_of: NaiveDate,
    calendar: &FiscalCalendar,
    dimension: Option<&DimensionId>,
) -> Result<YearOverYear> {
    calendar.validate()?;
    let fiscal_year = calendar.fiscal_year(as_of)?;
    let current_start = calendar.fiscal_year_start(fiscal_year)?;
    let previous_start = calendar.fiscal_year_start(fiscal_year - 1)?;
    let previous_end = as_of.checked_sub_months(Months::new(12)).ok_or_else(|| {
        AnalyticsError::Configuration(format!("cannot compare {as_of} with the prior year"))
    })?;

    let count_between = |start: NaiveDate, end: NaiveDate| {
        records
            .iter()
            .filter(|record| dimension.map_or(true, |d| record.belongs_to(d)))
            .filter(|record| record.date >= start && record.date <= end)
            .count() as u64
    };

    let current_total = count_between(current_start, as_of);
    let previous_total = count_between(previous_start, previous_end);
    let difference = current_total as i64 - previous_total as i64;
    let growth_pct = (previous_total > 0).then(|| difference as f64 / previous_total as f64 * 100.0);

    Ok(YearOverYear {
        fiscal_year,
        current_start,
        as_of,
        current_total,
        previous_total,
        difference,
        growth_pct,
    })
}
