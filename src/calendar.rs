use std::collections::BTreeSet;

use chrono::{Datelike, Days, Months, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};

use crate::error::{AnalyticsError, Result};
use crate::models::Granularity;

/// Calendar rules used to cut dates into period buckets.
///
/// The fiscal year starts on `start_month`/`start_day` and is labelled by the
/// calendar year it starts in, so with an April start FY2024 runs from
/// 2024-04-01 to 2025-03-31.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FiscalCalendar {
    pub start_month: u32,
    pub start_day: u32,
    pub week_start: Weekday,
    /// Treat Dec 29 - Jan 3 as non-working.
    pub year_end_closure: bool,
    pub holidays: BTreeSet<NaiveDate>,
}

impl Default for FiscalCalendar {
    fn default() -> Self {
        Self {
            start_month: 4,
            start_day: 1,
            week_start: Weekday::Mon,
            year_end_closure: true,
            holidays: BTreeSet::new(),
        }
    }
}

impl FiscalCalendar {
    pub fn new(start_month: u32, start_day: u32) -> Result<Self> {
        let calendar = Self {
            start_month,
            start_day,
            ..Self::default()
        };
        calendar.validate()?;
        Ok(calendar)
    }

    pub fn with_week_start(mut self, week_start: Weekday) -> Self {
        self.week_start = week_start;
        self
    }

    pub fn with_holidays(mut self, holidays: impl IntoIterator<Item = NaiveDate>) -> Self {
        self.holidays.extend(holidays);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=12).contains(&self.start_month) {
            return Err(AnalyticsError::Configuration(format!(
                "fiscal start month must be 1-12, got {}",
                self.start_month
            )));
        }
        // 2023 is not a leap year: a fiscal year cannot start on Feb 29.
        if NaiveDate::from_ymd_opt(2023, self.start_month, self.start_day).is_none() {
            return Err(AnalyticsError::Configuration(format!(
                "fiscal start day {} does not exist in month {}",
                self.start_day, self.start_month
            )));
        }
        Ok(())
    }

    pub fn fiscal_year_start(&self, fiscal_year: i32) -> Result<NaiveDate> {
        NaiveDate::from_ymd_opt(fiscal_year, self.start_month, self.start_day).ok_or_else(|| {
            AnalyticsError::Configuration(format!(
                "fiscal year {fiscal_year} cannot start on {}/{}",
                self.start_month, self.start_day
            ))
        })
    }

    pub fn fiscal_year(&self, date: NaiveDate) -> Result<i32> {
        let start = self.fiscal_year_start(date.year())?;
        Ok(if date >= start {
            date.year()
        } else {
            date.year() - 1
        })
    }

    pub fn period_start(&self, date: NaiveDate, granularity: Granularity) -> Result<NaiveDate> {
        match granularity {
            Granularity::Day => Ok(date),
            Granularity::Week => {
                let offset = (date.weekday().num_days_from_monday() + 7
                    - self.week_start.num_days_from_monday())
                    % 7;
                date.checked_sub_days(Days::new(u64::from(offset)))
                    .ok_or_else(|| out_of_range(date))
            }
            Granularity::Month => date.with_day(1).ok_or_else(|| out_of_range(date)),
            Granularity::FiscalYear => self.fiscal_year_start(self.fiscal_year(date)?),
        }
    }

    pub fn next_period_start(&self, start: NaiveDate, granularity: Granularity) -> Result<NaiveDate> {
        let start = self.period_start(start, granularity)?;
        let next = match granularity {
            Granularity::Day => start.checked_add_days(Days::new(1)),
            Granularity::Week => start.checked_add_days(Days::new(7)),
            Granularity::Month => start.checked_add_months(Months::new(1)),
            Granularity::FiscalYear => {
                return self.fiscal_year_start(self.fiscal_year(start)? + 1);
            }
        };
        next.ok_or_else(|| out_of_range(start))
    }

    pub fn previous_period_start(
        &self,
        start: NaiveDate,
        granularity: Granularity,
    ) -> Result<NaiveDate> {
        let start = self.period_start(start, granularity)?;
        let previous = match granularity {
            Granularity::Day => start.checked_sub_days(Days::new(1)),
            Granularity::Week => start.checked_sub_days(Days::new(7)),
            Granularity::Month => start.checked_sub_months(Months::new(1)),
            Granularity::FiscalYear => {
                return self.fiscal_year_start(self.fiscal_year(start)? - 1);
            }
        };
        previous.ok_or_else(|| out_of_range(start))
    }

    /// Last day (inclusive) of the period beginning at `start`.
    pub fn period_end(&self, start: NaiveDate, granularity: Granularity) -> Result<NaiveDate> {
        let next = self.next_period_start(start, granularity)?;
        next.pred_opt().ok_or_else(|| out_of_range(next))
    }

    pub fn is_working_day(&self, date: NaiveDate) -> bool {
        if matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
            return false;
        }
        if self.year_end_closure
            && ((date.month() == 12 && date.day() >= 29) || (date.month() == 1 && date.day() <= 3))
        {
            return false;
        }
        !self.holidays.contains(&date)
    }

    pub fn working_days_between(&self, start: NaiveDate, end: NaiveDate) -> u32 {
        start
            .iter_days()
            .take_while(|day| *day <= end)
            .filter(|day| self.is_working_day(*day))
            .count() as u32
    }

    /// Last day of the most recent week that is fully covered by data ending
    /// on `latest`.
    pub fn latest_complete_week_end(&self, latest: NaiveDate) -> Result<NaiveDate> {
        let week_start = self.period_start(latest, Granularity::Week)?;
        let week_end = self.period_end(week_start, Granularity::Week)?;
        if latest == week_end {
            Ok(latest)
        } else {
            week_start.pred_opt().ok_or_else(|| out_of_range(week_start))
        }
    }
}

fn out_of_range(date: NaiveDate) -> AnalyticsError {
    AnalyticsError::Configuration(format!("date {date} is outside the supported calendar range"))
}
