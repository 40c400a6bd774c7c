//! Five-field cron expressions evaluated in UTC.
//!
//! Fields are `minute hour day-of-month month day-of-week`. Each accepts `*`,
//! single values, ranges `a-b`, steps `*/n` or `a-b/n`, and comma lists.
//! Day-of-week runs 0-7 where both 0 and 7 mean Sunday. When both day fields
//! are restricted a day matches if either does.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, TimeDelta, Timelike, Utc};

use crate::error::{Result, WorkerError};

/// How far back [`CronSchedule::latest_at_or_before`] searches.
const SEARCH_DAYS: i64 = 366 * 5;

/// A parsed cron expression.
#[derive(Clone, PartialEq, Eq)]
pub struct CronSchedule {
    source: String,
    minutes: u64,
    hours: u64,
    days: u64,
    months: u64,
    weekdays: u64,
    days_restricted: bool,
    weekdays_restricted: bool,
}

struct Field {
    name: &'static str,
    min: u32,
    max: u32,
}

const MINUTE: Field = Field { name: "minute", min: 0, max: 59 };
const HOUR: Field = Field { name: "hour", min: 0, max: 23 };
const DAY: Field = Field { name: "day-of-month", min: 1, max: 31 };
const MONTH: Field = Field { name: "month", min: 1, max: 12 };
const WEEKDAY: Field = Field { name: "day-of-week", min: 0, max: 7 };

impl CronSchedule {
    /// Parses an expression.
    pub fn parse(expr: &str) -> Result<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(cron_error(expr, format!("expected 5 fields, found {}", fields.len())));
        }

        let minutes = parse_field(expr, fields[0], &MINUTE)?;
        let hours = parse_field(expr, fields[1], &HOUR)?;
        let days = parse_field(expr, fields[2], &DAY)?;
        let months = parse_field(expr, fields[3], &MONTH)?;
        let mut weekdays = parse_field(expr, fields[4], &WEEKDAY)?;
        if weekdays & (1 << 7) != 0 {
            weekdays = (weekdays | 1) & !(1 << 7);
        }

        Ok(Self {
            source: expr.to_string(),
            minutes,
            hours,
            days,
            months,
            weekdays,
            days_restricted: !fields[2].starts_with('*'),
            weekdays_restricted: !fields[4].starts_with('*'),
        })
    }

    /// Returns the expression as written.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Returns true if the schedule fires during the minute containing `at`.
    #[must_use]
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        self.month_matches(at.month())
            && self.day_matches(at.date_naive())
            && bit(self.hours, at.hour())
            && bit(self.minutes, at.minute())
    }

    /// Most recent occurrence at or before `now`, truncated to the minute.
    ///
    /// Returns `None` if the schedule has not fired in the last five years.
    #[must_use]
    pub fn latest_at_or_before(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let floor = now - TimeDelta::days(SEARCH_DAYS);
        let mut t = now.with_second(0)?.with_nanosecond(0)?;

        while t >= floor {
            if !self.month_matches(t.month()) {
                t = start_of_month(t)? - TimeDelta::minutes(1);
                continue;
            }
            if !self.day_matches(t.date_naive()) {
                t = start_of_day(t.date_naive())? - TimeDelta::minutes(1);
                continue;
            }
            if !bit(self.hours, t.hour()) {
                t = t.with_minute(0)? - TimeDelta::minutes(1);
                continue;
            }
            if !bit(self.minutes, t.minute()) {
                t -= TimeDelta::minutes(1);
                continue;
            }
            return Some(t);
        }
        None
    }

    fn month_matches(&self, month: u32) -> bool {
        bit(self.months, month)
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = bit(self.days, date.day());
        let dow = bit(self.weekdays, date.weekday().num_days_from_sunday());
        match (self.days_restricted, self.weekdays_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }
}

impl FromStr for CronSchedule {
    type Err = WorkerError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Debug for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CronSchedule").field(&self.source).finish()
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

const fn bit(mask: u64, value: u32) -> bool {
    mask & (1 << value) != 0
}

fn start_of_day(date: NaiveDate) -> Option<DateTime<Utc>> {
    date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc())
}

fn start_of_month(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    NaiveDate::from_ymd_opt(t.year(), t.month(), 1).and_then(start_of_day)
}

fn cron_error(expr: &str, reason: impl Into<String>) -> WorkerError {
    WorkerError::InvalidCron {
        expr: expr.to_string(),
        reason: reason.into(),
    }
}

fn parse_field(expr: &str, raw: &str, field: &Field) -> Result<u64> {
    let mut mask = 0u64;
    for item in raw.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| cron_error(expr, format!("invalid step '{step}' in {}", field.name)))?;
                if step == 0 {
                    return Err(cron_error(expr, format!("zero step in {}", field.name)));
                }
                (range, step)
            }
            None => (item, 1),
        };

        let (start, end) = if range == "*" {
            (field.min, field.max)
        } else if let Some((a, b)) = range.split_once('-') {
            (value(expr, a, field)?, value(expr, b, field)?)
        } else {
            let start = value(expr, range, field)?;
            // `a/n` runs from a to the end of the field
            let end = if item.contains('/') { field.max } else { start };
            (start, end)
        };
        if start > end {
            return Err(cron_error(expr, format!("range {start}-{end} is reversed in {}", field.name)));
        }

        let mut v = start;
        while v <= end {
            mask |= 1 << v;
            v += step;
        }
    }
    Ok(mask)
}

fn value(expr: &str, raw: &str, field: &Field) -> Result<u32> {
    let v: u32 = raw
        .parse()
        .map_err(|_| cron_error(expr, format!("invalid value '{raw}' in {}", field.name)))?;
    if v < field.min || v > field.max {
        return Err(cron_error(
            expr,
            format!("value {v} out of range {}-{} in {}", field.min, field.max, field.name),
        ));
    }
    Ok(v)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    mod parse_tests {
        use super::*;
        use test_case::test_case;

        #[test_case("* * * * *" ; "all stars")]
        #[test_case("0 9 * * 1-5" ; "weekday mornings")]
        #[test_case("*/15 0-6,22-23 * * *" ; "steps and lists")]
        #[test_case("30 2 1 */3 0" ; "quarterly")]
        #[test_case("0 0 * * 7" ; "sunday as seven")]
        #[test_case("5/10 * * * *" ; "start with step")]
        fn test_accepts(expr: &str) {
            assert!(CronSchedule::parse(expr).is_ok());
        }

        #[test_case("" ; "empty")]
        #[test_case("* * * *" ; "four fields")]
        #[test_case("* * * * * *" ; "six fields")]
        #[test_case("60 * * * *" ; "minute out of range")]
        #[test_case("* 24 * * *" ; "hour out of range")]
        #[test_case("* * 0 * *" ; "day zero")]
        #[test_case("* * * 13 *" ; "month out of range")]
        #[test_case("* * * * 8" ; "weekday out of range")]
        #[test_case("*/0 * * * *" ; "zero step")]
        #[test_case("10-5 * * * *" ; "reversed range")]
        #[test_case("a * * * *" ; "not a number")]
        fn test_rejects(expr: &str) {
            assert!(matches!(
                CronSchedule::parse(expr),
                Err(WorkerError::InvalidCron { .. })
            ));
        }

        #[test]
        fn test_sunday_seven_equals_zero() {
            let seven = CronSchedule::parse("0 0 * * 7").unwrap();
            let zero = CronSchedule::parse("0 0 * * 0").unwrap();
            assert_eq!(seven.weekdays, zero.weekdays);
        }
    }

    mod match_tests {
        use super::*;

        #[test]
        fn test_weekday_mornings() {
            let cron = CronSchedule::parse("0 9 * * 1-5").unwrap();
            // 2024-01-01 is a Monday
            assert!(cron.matches(utc(2024, 1, 1, 9, 0)));
            assert!(!cron.matches(utc(2024, 1, 1, 9, 1)));
            assert!(!cron.matches(utc(2024, 1, 6, 9, 0)));
        }

        #[test]
        fn test_restricted_day_fields_are_ored() {
            let cron = CronSchedule::parse("0 0 13 * 5").unwrap();
            // Friday 2024-01-05, the 13th 2024-01-13 (a Saturday)
            assert!(cron.matches(utc(2024, 1, 5, 0, 0)));
            assert!(cron.matches(utc(2024, 1, 13, 0, 0)));
            assert!(!cron.matches(utc(2024, 1, 6, 0, 0)));
        }
    }

    mod latest_tests {
        use super::*;
        use test_case::test_case;

        #[test_case("* * * * *", utc(2024, 3, 10, 12, 34), utc(2024, 3, 10, 12, 34) ; "every minute")]
        #[test_case("0 * * * *", utc(2024, 3, 10, 12, 34), utc(2024, 3, 10, 12, 0) ; "top of hour")]
        #[test_case("0 22 * * *", utc(2024, 3, 10, 6, 0), utc(2024, 3, 9, 22, 0) ; "previous evening")]
        #[test_case("0 9 * * 1-5", utc(2024, 1, 7, 12, 0), utc(2024, 1, 5, 9, 0) ; "skips weekend")]
        #[test_case("0 0 1 1 *", utc(2024, 3, 1, 0, 0), utc(2024, 1, 1, 0, 0) ; "new year")]
        #[test_case("30 2 1 */3 *", utc(2024, 6, 15, 0, 0), utc(2024, 4, 1, 2, 30) ; "quarterly")]
        #[test_case("0 0 29 2 *", utc(2025, 6, 1, 0, 0), utc(2024, 2, 29, 0, 0) ; "leap day")]
        fn test_finds_latest(expr: &str, now: DateTime<Utc>, expected: DateTime<Utc>) {
            let cron = CronSchedule::parse(expr).unwrap();
            assert_eq!(cron.latest_at_or_before(now), Some(expected));
        }

        #[test]
        fn test_truncates_seconds() {
            let cron = CronSchedule::parse("* * * * *").unwrap();
            let now = Utc.with_ymd_and_hms(2024, 3, 10, 12, 34, 56).unwrap();
            assert_eq!(cron.latest_at_or_before(now), Some(utc(2024, 3, 10, 12, 34)));
        }

        #[test]
        fn test_impossible_date_has_no_occurrence() {
            let cron = CronSchedule::parse("0 0 31 2 *").unwrap();
            assert_eq!(cron.latest_at_or_before(utc(2024, 3, 1, 0, 0)), None);
        }
    }
}
