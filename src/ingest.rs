use std::collections::HashMap;
use std::io::Read;

use chrono::NaiveDate;
use serde::Deserialize;

use crate::error::AnalyticsError;
use crate::models::{CaseRecord, UNCATEGORIZED};

const MAX_CASE_MINUTES: f64 = 24.0 * 60.0;

/// A case row as it arrives from a spreadsheet-like source, before any
/// validation. Every field is optional text.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawCaseRow {
    #[serde(default)]
    pub case_id: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub hospital: Option<String>,
    #[serde(default)]
    pub department: Option<String>,
    #[serde(default)]
    pub surgeon: Option<String>,
    #[serde(default)]
    pub duration_minutes: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub completed: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct IngestOutcome {
    pub records: Vec<CaseRecord>,
    pub rejected: Vec<AnalyticsError>,
    pub duplicates: usize,
}

impl IngestOutcome {
    pub fn dropped(&self) -> usize {
        self.rejected.len()
    }
}

pub fn ingest(rows: impl IntoIterator<Item = RawCaseRow>) -> IngestOutcome {
    collect(rows.into_iter().map(Ok))
}

/// Reads rows from CSV with a header line. Rows that fail to deserialize are
/// reported the same way as rows that fail validation.
pub fn ingest_csv<R: Read>(reader: R) -> IngestOutcome {
    let mut reader = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let rows: Vec<Result<RawCaseRow, String>> = reader
        .deserialize::<RawCaseRow>()
        .map(|result| result.map_err(|err| err.to_string()))
        .collect();
    collect(rows)
}

fn collect(rows: impl IntoIterator<Item = Result<RawCaseRow, String>>) -> IngestOutcome {
    let mut outcome = IngestOutcome::default();
    let mut seen: HashMap<String, usize> = HashMap::new();

    for (index, row) in rows.into_iter().enumerate() {
        let row_number = index + 1;
        let parsed = row.and_then(|raw| {
            let case_id = clean(raw.case_id.clone());
            validate(raw).map(|record| (case_id, record))
        });

        match parsed {
            Ok((Some(case_id), record)) => {
                if let Some(&position) = seen.get(&case_id) {
                    outcome.records[position] = record;
                    outcome.duplicates += 1;
                } else {
                    seen.insert(case_id, outcome.records.len());
                    outcome.records.push(record);
                }
            }
            Ok((None, record)) => outcome.records.push(record),
            Err(reason) => {
                tracing::warn!(row = row_number, %reason, "dropping malformed case record");
                outcome.rejected.push(AnalyticsError::MalformedRecord {
                    row: row_number,
                    reason,
                });
            }
        }
    }

    tracing::info!(
        accepted = outcome.records.len(),
        dropped = outcome.dropped(),
        duplicates = outcome.duplicates,
        "ingested case records"
    );
    outcome
}

pub fn validate(raw: RawCaseRow) -> Result<CaseRecord, String> {
    let date = parse_date(clean(raw.date).as_deref())?;
    let duration_minutes = parse_duration(clean(raw.duration_minutes).as_deref())?;
    let completed = parse_flag(clean(raw.completed).as_deref())?;

    Ok(CaseRecord {
        date,
        hospital: clean(raw.hospital),
        department: clean(raw.department),
        surgeon: clean(raw.surgeon),
        duration_minutes,
        category: clean(raw.category).unwrap_or_else(|| UNCATEGORIZED.to_string()),
        completed,
    })
}

fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_date(value: Option<&str>) -> Result<NaiveDate, String> {
    let value = value.ok_or("missing date")?;
    // Accept timestamps by keeping only the date part.
    let day_part = value.split([' ', 'T']).next().unwrap_or(value);
    let date = NaiveDate::parse_from_str(day_part, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(day_part, "%Y/%m/%d"))
        .map_err(|_| format!("unparseable date '{value}'"))?;

    let earliest = NaiveDate::from_ymd_opt(1990, 1, 1);
    let latest = NaiveDate::from_ymd_opt(2100, 12, 31);
    match (earliest, latest) {
        (Some(earliest), Some(latest)) if date >= earliest && date <= latest => Ok(date),
        _ => Err(format!("date {date} is outside the plausible range")),
    }
}

fn parse_duration(value: Option<&str>) -> Result<u32, String> {
    let value = value.ok_or("missing duration")?;
    let minutes: f64 = value
        .parse()
        .map_err(|_| format!("unparseable duration '{value}'"))?;
    if !minutes.is_finite() || minutes < 0.0 {
        return Err(format!("duration must be non-negative, got {value}"));
    }
    if minutes > MAX_CASE_MINUTES {
        return Err(format!("duration of {value} minutes exceeds one day"));
    }
    Ok(minutes.round() as u32)
}

fn parse_flag(value: Option<&str>) -> Result<bool, String> {
    match value.map(str::to_ascii_lowercase).as_deref() {
        None => Ok(true),
        Some("true" | "yes" | "y" | "1") => Ok(true),
        Some("false" | "no" | "n" | "0") => Ok(false),
        Some(other) => Err(format!("unrecognised completion flag '{other}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(date: &str, department: &str, duration: &str) -> RawCaseRow {
        RawCaseRow {
            date: Some(date.to_string()),
            hospital: Some("central".to_string()),
            department: Some(department.to_string()),
            surgeon: Some("dr-sato".to_string()),
            duration_minutes: Some(duration.to_string()),
            category: Some("general".to_string()),
            ..RawCaseRow::default()
        }
    }

    #[test]
    fn bad_rows_are_dropped_without_aborting_the_batch() {
        let outcome = ingest(vec![
            row("2025-04-01", "ortho", "90"),
            row("2025-04-02", "ortho", "-5"),
            row("1850-01-01", "ortho", "30"),
            row("2025/04/03", "cardio", "120"),
        ]);

        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.dropped(), 2);
        assert!(matches!(
            outcome.rejected[0],
            AnalyticsError::MalformedRecord { row: 2, .. }
        ));
        assert_eq!(outcome.records[1].department.as_deref(), Some("cardio"));
    }

    #[test]
    fn blank_fields_become_missing_dimensions() {
        let mut raw = row("2025-04-01", "  ", "45");
        raw.surgeon = Some(String::new());
        raw.category = None;

        let record = validate(raw).unwrap();
        assert_eq!(record.department, None);
        assert_eq!(record.surgeon, None);
        assert_eq!(record.category, UNCATEGORIZED);
        assert!(record.completed);
    }

    #[test]
    fn duplicate_case_ids_keep_the_last_row() {
        let mut first = row("2025-04-01", "ortho", "60");
        first.case_id = Some("A-1".to_string());
        let mut second = row("2025-04-01", "ortho", "75");
        second.case_id = Some("A-1".to_string());

        let outcome = ingest(vec![first, second]);
        assert_eq!(outcome.records.len(), 1);
        assert_eq!(outcome.duplicates, 1);
        assert_eq!(outcome.records[0].duration_minutes, 75);
    }

    #[test]
    fn reads_csv_with_headers() {
        let data = "\
date,hospital,department,surgeon,duration_minutes,category,completed
2025-04-01,central,ortho,dr-sato,90,general,yes
2025-04-02,central,ortho,,abc,general,no
2025-04-03 08:30:00,central,cardio,dr-ito,150,general,0
";
        let outcome = ingest_csv(data.as_bytes());
        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.dropped(), 1);
        assert!(!outcome.records[1].completed);
        assert_eq!(
            outcome.records[1].date,
            NaiveDate::from_ymd_opt(2025, 4, 3).unwrap()
        );
    }
}
