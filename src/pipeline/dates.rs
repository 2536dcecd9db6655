//! Mixed-format date resolution for spreadsheet cells.
//!
//! Cells arrive as ISO strings, locale strings ("15/01/2024 08:30"), or
//! spreadsheet serial day numbers (44197). Resolution order:
//! 1. empty / null token -> absent
//! 2. a recognised date or date-time string
//! 3. a number (or numeric string) in the serial range, counted from 1899-12-30
//! 4. otherwise a [`DateParseError`]
//!
//! Nothing ever defaults to "today".

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime};
use thiserror::Error;

use crate::constants::{is_null_token, SERIAL_DATE_MAX, SERIAL_DATE_THRESHOLD};
use crate::types::RawValue;

#[derive(Error, Debug, Clone, PartialEq)]
#[error("could not resolve '{raw}' in field '{field}' as a date")]
pub struct DateParseError {
    pub field: String,
    pub raw: String,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DateResolution {
    Absent,
    Resolved(NaiveDateTime),
}

impl DateResolution {
    pub fn date(&self) -> Option<NaiveDate> {
        match self {
            DateResolution::Absent => None,
            DateResolution::Resolved(ts) => Some(ts.date()),
        }
    }
}

const ISO_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y/%m/%d %H:%M:%S",
    "%Y/%m/%d %H:%M",
];

const ISO_DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%Y.%m.%d"];

const DAY_FIRST_DATETIME_FORMATS: &[&str] = &[
    "%d/%m/%Y %H:%M:%S",
    "%d/%m/%Y %H:%M",
    "%d-%m-%Y %H:%M:%S",
    "%d-%m-%Y %H:%M",
    "%d.%m.%Y %H:%M:%S",
    "%d.%m.%Y %H:%M",
];

const DAY_FIRST_DATE_FORMATS: &[&str] = &[
    "%d/%m/%Y",
    "%d-%m-%Y",
    "%d.%m.%Y",
    "%d/%m/%y",
    "%d-%m-%y",
    "%d.%m.%y",
];

const MONTH_FIRST_DATETIME_FORMATS: &[&str] = &[
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
    "%m-%d-%Y %H:%M:%S",
    "%m-%d-%Y %H:%M",
];

const MONTH_FIRST_DATE_FORMATS: &[&str] = &["%m/%d/%Y", "%m-%d-%Y", "%m/%d/%y", "%m-%d-%y"];

// chrono's %Y also accepts one- and two-digit years. Anything earlier than
// this is a short year matched by the wrong format.
const MIN_YEAR: i32 = 1000;

const NAMED_MONTH_DATE_FORMATS: &[&str] = &[
    "%d %b %Y",
    "%d %B %Y",
    "%d-%b-%Y",
    "%b %d, %Y",
    "%B %d, %Y",
    "%b %d %Y",
    "%B %d %Y",
];

/// Resolves raw cells into calendar dates / timestamps
#[derive(Debug, Clone)]
pub struct DateResolver {
    day_first: bool,
    serial_threshold: f64,
}

impl Default for DateResolver {
    fn default() -> Self {
        Self::new(true)
    }
}

impl DateResolver {
    pub fn new(day_first: bool) -> Self {
        Self {
            day_first,
            serial_threshold: SERIAL_DATE_THRESHOLD,
        }
    }

    pub fn resolve(&self, field: &str, value: &RawValue) -> Result<DateResolution, DateParseError> {
        match value {
            RawValue::Empty => Ok(DateResolution::Absent),
            RawValue::Number(n) => self
                .from_serial(*n)
                .map(DateResolution::Resolved)
                .ok_or_else(|| parse_error(field, &n.to_string())),
            RawValue::Text(s) => {
                let trimmed = s.trim();
                if is_null_token(trimmed) {
                    return Ok(DateResolution::Absent);
                }
                if let Some(ts) = self.parse_text(trimmed) {
                    return Ok(DateResolution::Resolved(ts));
                }
                trimmed
                    .parse::<f64>()
                    .ok()
                    .and_then(|n| self.from_serial(n))
                    .map(DateResolution::Resolved)
                    .ok_or_else(|| parse_error(field, trimmed))
            }
        }
    }

    /// Spreadsheet serial day number to a timestamp. The 1899-12-30 epoch
    /// absorbs the 1900 leap-year bug for every serial above 60, which the
    /// threshold guarantees.
    fn from_serial(&self, n: f64) -> Option<NaiveDateTime> {
        if !n.is_finite() || n < self.serial_threshold || n > SERIAL_DATE_MAX {
            return None;
        }

        let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?.and_time(NaiveTime::MIN);
        let days = n.trunc() as i64;
        let seconds = ((n - n.trunc()) * 86_400.0).round() as i64;
        epoch.checked_add_signed(Duration::days(days) + Duration::seconds(seconds))
    }

    fn parse_text(&self, s: &str) -> Option<NaiveDateTime> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
            return Some(dt.naive_local());
        }

        let (first_dt, first_d, second_dt, second_d) = if self.day_first {
            (
                DAY_FIRST_DATETIME_FORMATS,
                DAY_FIRST_DATE_FORMATS,
                MONTH_FIRST_DATETIME_FORMATS,
                MONTH_FIRST_DATE_FORMATS,
            )
        } else {
            (
                MONTH_FIRST_DATETIME_FORMATS,
                MONTH_FIRST_DATE_FORMATS,
                DAY_FIRST_DATETIME_FORMATS,
                DAY_FIRST_DATE_FORMATS,
            )
        };

        try_datetimes(s, ISO_DATETIME_FORMATS)
            .or_else(|| try_dates(s, ISO_DATE_FORMATS))
            .or_else(|| try_datetimes(s, first_dt))
            .or_else(|| try_dates(s, first_d))
            .or_else(|| try_datetimes(s, second_dt))
            .or_else(|| try_dates(s, second_d))
            .or_else(|| try_dates(s, NAMED_MONTH_DATE_FORMATS))
    }
}

fn try_datetimes(s: &str, formats: &[&str]) -> Option<NaiveDateTime> {
    formats
        .iter()
        .filter_map(|f| NaiveDateTime::parse_from_str(s, f).ok())
        .find(|ts| ts.year() >= MIN_YEAR)
}

fn try_dates(s: &str, formats: &[&str]) -> Option<NaiveDateTime> {
    formats
        .iter()
        .filter_map(|f| NaiveDate::parse_from_str(s, f).ok())
        .find(|d| d.year() >= MIN_YEAR)
        .map(|d| d.and_time(NaiveTime::MIN))
}

fn parse_error(field: &str, raw: &str) -> DateParseError {
    DateParseError {
        field: field.to_string(),
        raw: raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn resolve_date(resolver: &DateResolver, value: RawValue) -> Option<NaiveDate> {
        resolver.resolve("record_date", &value).unwrap().date()
    }

    #[test]
    fn serial_numbers_count_from_1899_12_30() {
        let r = DateResolver::default();
        assert_eq!(resolve_date(&r, RawValue::Number(44197.0)), Some(date(2021, 1, 1)));
        assert_eq!(resolve_date(&r, "44197".into()), Some(date(2021, 1, 1)));
        assert_eq!(resolve_date(&r, RawValue::Number(45292.0)), Some(date(2024, 1, 1)));
    }

    #[test]
    fn serial_fraction_is_time_of_day() {
        let r = DateResolver::default();
        let res = r.resolve("ts", &RawValue::Number(44197.75)).unwrap();
        assert_eq!(
            res,
            DateResolution::Resolved(date(2021, 1, 1).and_hms_opt(18, 0, 0).unwrap())
        );
    }

    #[test]
    fn small_numbers_are_not_dates() {
        let r = DateResolver::default();
        let err = r.resolve("record_date", &RawValue::Number(1.0)).unwrap_err();
        assert_eq!(err.field, "record_date");
        assert_eq!(err.raw, "1");
        assert!(r.resolve("record_date", &"2021".into()).is_err());
        assert!(r.resolve("record_date", &RawValue::Number(99_999_999.0)).is_err());
    }

    #[test]
    fn empty_and_null_tokens_are_absent() {
        let r = DateResolver::default();
        assert_eq!(r.resolve("d", &RawValue::Empty).unwrap(), DateResolution::Absent);
        assert_eq!(r.resolve("d", &"   ".into()).unwrap(), DateResolution::Absent);
        assert_eq!(r.resolve("d", &"N/A".into()).unwrap(), DateResolution::Absent);
    }

    #[test]
    fn iso_and_rfc3339_strings() {
        let r = DateResolver::default();
        assert_eq!(resolve_date(&r, "2024-03-05".into()), Some(date(2024, 3, 5)));
        assert_eq!(resolve_date(&r, "2024-03-05T10:15:00".into()), Some(date(2024, 3, 5)));
        assert_eq!(
            resolve_date(&r, "2024-03-05T23:15:00+01:00".into()),
            Some(date(2024, 3, 5))
        );
        assert_eq!(resolve_date(&r, "2024/03/05 07:00".into()), Some(date(2024, 3, 5)));
    }

    #[test]
    fn day_first_preference_with_fallback() {
        let day_first = DateResolver::new(true);
        let month_first = DateResolver::new(false);

        assert_eq!(resolve_date(&day_first, "03/04/2024".into()), Some(date(2024, 4, 3)));
        assert_eq!(resolve_date(&month_first, "03/04/2024".into()), Some(date(2024, 3, 4)));
        // Day 25 cannot be a month, so both resolvers agree.
        assert_eq!(resolve_date(&day_first, "12/25/2024".into()), Some(date(2024, 12, 25)));
        assert_eq!(resolve_date(&month_first, "25/12/2024".into()), Some(date(2024, 12, 25)));
    }

    #[test]
    fn locale_strings_with_time_and_month_names() {
        let r = DateResolver::default();
        let res = r.resolve("ts", &"15/01/2024 08:30:00".into()).unwrap();
        assert_eq!(
            res,
            DateResolution::Resolved(date(2024, 1, 15).and_hms_opt(8, 30, 0).unwrap())
        );
        assert_eq!(resolve_date(&r, "5 Mar 2024".into()), Some(date(2024, 3, 5)));
        assert_eq!(resolve_date(&r, "March 5, 2024".into()), Some(date(2024, 3, 5)));
    }

    #[test]
    fn two_digit_years_are_never_read_as_four_digit() {
        let day_first = DateResolver::new(true);
        let month_first = DateResolver::new(false);

        assert_eq!(resolve_date(&day_first, "15/01/24".into()), Some(date(2024, 1, 15)));
        assert_eq!(resolve_date(&day_first, "15-01-24".into()), Some(date(2024, 1, 15)));
        assert_eq!(resolve_date(&day_first, "15.01.24".into()), Some(date(2024, 1, 15)));
        assert_eq!(resolve_date(&day_first, "01/02/03".into()), Some(date(2003, 2, 1)));
        assert_eq!(resolve_date(&month_first, "01/02/03".into()), Some(date(2003, 1, 2)));
        assert_eq!(resolve_date(&month_first, "01-15-24".into()), Some(date(2024, 1, 15)));
        // Four-digit years still win over the short forms.
        assert_eq!(resolve_date(&day_first, "15/01/2024".into()), Some(date(2024, 1, 15)));
        assert!(day_first.resolve("record_date", &"5 Mar 24".into()).is_err());
    }

    #[test]
    fn garbage_fails_with_raw_value() {
        let r = DateResolver::default();
        let err = r.resolve("record_date", &"not-a-date".into()).unwrap_err();
        assert_eq!(err.raw, "not-a-date");
        assert_eq!(
            err.to_string(),
            "could not resolve 'not-a-date' in field 'record_date' as a date"
        );
    }
}
