use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;

use crate::aggregate::aggregate_refs;
use crate::calendar::FiscalCalendar;
use crate::error::Result;
use crate::models::{CaseRecord, DimensionKind, Granularity, RankingEntry};
use crate::ranking::{rank, Metric};

/// Surgeon leaderboard for the period containing `period`, optionally scoped
/// to one department.
///
/// Rank deltas compare against the same department scope in the previous
/// period. `limit` keeps the top entries plus anyone tied with the last one
/// kept, so a cut never splits a tie.
pub fn surgeon_leaderboard(
    records: &[CaseRecord],
    department: Option<&str>,
    granularity: Granularity,
    period: NaiveDate,
    metric: &dyn Metric,
    calendar: &FiscalCalendar,
    limit: Option<usize>,
) -> Result<Vec<RankingEntry>> {
    let scoped = records
        .iter()
        .filter(|record| department.map_or(true, |d| record.department.as_deref() == Some(d)));
    let aggregates = aggregate_refs(scoped, granularity, calendar)?;
    let entries = rank(
        &aggregates,
        DimensionKind::Surgeon,
        granularity,
        period,
        metric,
        calendar,
    )?;

    tracing::debug!(
        department = department.unwrap_or("all"),
        surgeons = entries.len(),
        "built surgeon leaderboard"
    );
    Ok(match limit {
        Some(limit) => truncate_keeping_ties(entries, limit),
        None => entries,
    })
}

/// One leaderboard per department observed in the records.
pub fn leaderboards_by_department(
    records: &[CaseRecord],
    granularity: Granularity,
    period: NaiveDate,
    metric: &dyn Metric,
    calendar: &FiscalCalendar,
    limit: Option<usize>,
) -> Result<BTreeMap<String, Vec<RankingEntry>>> {
    let departments: BTreeSet<&str> = records
        .iter()
        .filter_map(|record| record.department.as_deref())
        .collect();

    let mut boards = BTreeMap::new();
    for department in departments {
        let board = surgeon_leaderboard(
            records,
            Some(department),
            granularity,
            period,
            metric,
            calendar,
            limit,
        )?;
        if !board.is_empty() {
            boards.insert(department.to_string(), board);
        }
    }
    Ok(boards)
}

/// Departments each surgeon has operated in.
pub fn surgeon_departments(records: &[CaseRecord]) -> BTreeMap<String, BTreeSet<String>> {
    let mut map: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for record in records {
        if let (Some(surgeon), Some(department)) = (&record.surgeon, &record.department) {
            map.entry(surgeon.clone())
                .or_default()
                .insert(department.clone());
        }
    }
    map
}

fn truncate_keeping_ties(entries: Vec<RankingEntry>, limit: usize) -> Vec<RankingEntry> {
    if entries.len() <= limit {
        return entries;
    }
    let Some(cutoff) = limit.checked_sub(1).and_then(|i| entries.get(i)).map(|e| e.rank) else {
        return Vec::new();
    };
    entries.into_iter().take_while(|e| e.rank <= cutoff).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ranking::{CaseCount, TotalHours};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn case(day: NaiveDate, department: &str, surgeon: Option<&str>, minutes: u32) -> CaseRecord {
        CaseRecord {
            date: day,
            hospital: Some("central".to_string()),
            department: Some(department.to_string()),
            surgeon: surgeon.map(str::to_string),
            duration_minutes: minutes,
            category: "general".to_string(),
            completed: true,
        }
    }

    fn sample() -> Vec<CaseRecord> {
        let week = date(2025, 6, 9);
        vec![
            case(week, "ortho", Some("dr-sato"), 60),
            case(week, "ortho", Some("dr-sato"), 60),
            case(week, "ortho", Some("dr-mori"), 200),
            case(week, "ortho", Some("dr-kato"), 60),
            case(week, "ortho", Some("dr-kato"), 60),
            case(week, "ortho", None, 60),
            case(week, "cardio", Some("dr-ito"), 300),
            case(week, "cardio", Some("dr-sato"), 90),
            case(week, "cardio", Some("dr-sato"), 90),
            case(week, "cardio", Some("dr-sato"), 90),
        ]
    }

    #[test]
    fn department_scope_limits_cases_counted() {
        let calendar = FiscalCalendar::default();
        let board = surgeon_leaderboard(
            &sample(),
            Some("ortho"),
            Granularity::Week,
            date(2025, 6, 9),
            &CaseCount,
            &calendar,
            None,
        )
        .unwrap();

        let summary: Vec<(&str, u32, f64)> = board
            .iter()
            .map(|e| (e.dimension.id.as_str(), e.rank, e.value))
            .collect();
        assert_eq!(
            summary,
            vec![("dr-kato", 1, 2.0), ("dr-sato", 1, 2.0), ("dr-mori", 3, 1.0)]
        );
    }

    #[test]
    fn hospital_wide_board_includes_every_department() {
        let calendar = FiscalCalendar::default();
        let board = surgeon_leaderboard(
            &sample(),
            None,
            Granularity::Week,
            date(2025, 6, 11),
            &TotalHours,
            &calendar,
            Some(1),
        )
        .unwrap();
        assert_eq!(board.len(), 1);
        assert_eq!(board[0].dimension.id, "dr-sato");
        assert!((board[0].value - 6.5).abs() < 1e-9);
    }

    #[test]
    fn limit_never_splits_a_tie() {
        let calendar = FiscalCalendar::default();
        let board = surgeon_leaderboard(
            &sample(),
            Some("ortho"),
            Granularity::Week,
            date(2025, 6, 9),
            &CaseCount,
            &calendar,
            Some(1),
        )
        .unwrap();
        assert_eq!(board.len(), 2);

        let none = surgeon_leaderboard(
            &sample(),
            Some("ortho"),
            Granularity::Week,
            date(2025, 6, 9),
            &CaseCount,
            &calendar,
            Some(0),
        )
        .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn groups_boards_and_departments() {
        let calendar = FiscalCalendar::default();
        let boards = leaderboards_by_department(
            &sample(),
            Granularity::Week,
            date(2025, 6, 9),
            &CaseCount,
            &calendar,
            None,
        )
        .unwrap();
        assert_eq!(boards.len(), 2);
        assert_eq!(boards["cardio"][0].dimension.id, "dr-sato");

        let departments = surgeon_departments(&sample());
        assert_eq!(departments["dr-sato"].len(), 2);
        assert_eq!(departments["dr-ito"].len(), 1);
    }
}
