//! Cron expression parsing and next-fire evaluation.
//!
//! Standard 5-field expressions, evaluated in UTC:
//! ```text
//! ┌───────────── minute (0-59)
//! │ ┌───────────── hour (0-23)
//! │ │ ┌───────────── day of month (1-31)
//! │ │ │ ┌───────────── month (1-12)
//! │ │ │ │ ┌───────────── day of week (0-6, 0 = Sunday)
//! │ │ │ │ │
//! * * * * *
//! ```
//!
//! Each field accepts `*`, single values, comma lists, ranges `a-b`, and
//! steps `*/n`, `a-b/n` (and `a/n`, meaning `a-max/n`).
//!
//! When both day-of-month and day-of-week are restricted a day matches if
//! *either* does; when one of them starts with `*` both must match.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use thiserror::Error;

/// How far ahead [`CronExpr::next_after`] searches before giving up.
pub const SEARCH_HORIZON_YEARS: i64 = 4;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronError {
    /// The expression is malformed or a value is out of range.
    #[error("invalid cron expression `{expr}`: {reason}")]
    InvalidExpression { expr: String, reason: String },
    /// The expression parses but never fires within the search horizon.
    #[error("cron expression `{expr}` has no match within {years} years of {from}")]
    NoMatchFound {
        expr: String,
        years: i64,
        from: DateTime<Utc>,
    },
}

// ---------------------------------------------------------------------------
// CronField
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    Minute,
    Hour,
    DayOfMonth,
    Month,
    DayOfWeek,
}

impl FieldKind {
    fn name(self) -> &'static str {
        match self {
            FieldKind::Minute => "minute",
            FieldKind::Hour => "hour",
            FieldKind::DayOfMonth => "day-of-month",
            FieldKind::Month => "month",
            FieldKind::DayOfWeek => "day-of-week",
        }
    }

    fn bounds(self) -> (u32, u32) {
        match self {
            FieldKind::Minute => (0, 59),
            FieldKind::Hour => (0, 23),
            FieldKind::DayOfMonth => (1, 31),
            FieldKind::Month => (1, 12),
            FieldKind::DayOfWeek => (0, 6),
        }
    }
}

/// The set of values one field accepts, stored as a bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CronField {
    mask: u64,
    max: u32,
    /// The field text started with `*` (unrestricted for day OR/AND rules).
    wildcard: bool,
}

impl CronField {
    fn parse(kind: FieldKind, text: &str) -> Result<Self, String> {
        let (min, max) = kind.bounds();
        let mut mask = 0u64;

        for part in text.split(',') {
            if part.is_empty() {
                return Err(format!("empty list element in {} field", kind.name()));
            }

            let (range, step) = match part.split_once('/') {
                Some((range, step)) => {
                    let step: u32 = step
                        .parse()
                        .map_err(|_| format!("invalid step `{step}` in {} field", kind.name()))?;
                    if step == 0 {
                        return Err(format!("step must be positive in {} field", kind.name()));
                    }
                    (range, Some(step))
                }
                None => (part, None),
            };

            let (start, end) = if range == "*" {
                (min, max)
            } else if let Some((a, b)) = range.split_once('-') {
                let a = parse_value(kind, a)?;
                let b = parse_value(kind, b)?;
                if a > b {
                    return Err(format!("range {a}-{b} is reversed in {} field", kind.name()));
                }
                (a, b)
            } else {
                let value = parse_value(kind, range)?;
                // `a/n` steps from `a` to the end of the field.
                if step.is_some() {
                    (value, max)
                } else {
                    (value, value)
                }
            };

            let step = step.unwrap_or(1);
            let mut value = start;
            while value <= end {
                mask |= 1 << value;
                value += step;
            }
        }

        Ok(Self {
            mask,
            max,
            wildcard: text.starts_with('*'),
        })
    }

    /// Whether `value` is accepted by this field.
    pub fn matches(&self, value: u32) -> bool {
        value <= self.max && self.mask & (1 << value) != 0
    }

    /// Smallest accepted value `>= value`.
    fn next_from(&self, value: u32) -> Option<u32> {
        (value..=self.max).find(|v| self.matches(*v))
    }
}

fn parse_value(kind: FieldKind, text: &str) -> Result<u32, String> {
    let (min, max) = kind.bounds();
    let value: u32 = text
        .parse()
        .map_err(|_| format!("invalid value `{text}` in {} field", kind.name()))?;
    if value < min || value > max {
        return Err(format!(
            "value {value} out of range {min}-{max} for {} field",
            kind.name()
        ));
    }
    Ok(value)
}

// ---------------------------------------------------------------------------
// CronExpr
// ---------------------------------------------------------------------------

/// A parsed 5-field cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    source: String,
    minute: CronField,
    hour: CronField,
    day_of_month: CronField,
    month: CronField,
    day_of_week: CronField,
}

impl CronExpr {
    /// Parse and validate a cron expression.
    pub fn parse(expr: &str) -> Result<Self, CronError> {
        let invalid = |reason: String| CronError::InvalidExpression {
            expr: expr.to_string(),
            reason,
        };

        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(invalid(format!("expected 5 fields, got {}", fields.len())));
        }

        Ok(Self {
            source: fields.join(" "),
            minute: CronField::parse(FieldKind::Minute, fields[0]).map_err(invalid)?,
            hour: CronField::parse(FieldKind::Hour, fields[1]).map_err(invalid)?,
            day_of_month: CronField::parse(FieldKind::DayOfMonth, fields[2]).map_err(invalid)?,
            month: CronField::parse(FieldKind::Month, fields[3]).map_err(invalid)?,
            day_of_week: CronField::parse(FieldKind::DayOfWeek, fields[4]).map_err(invalid)?,
        })
    }

    /// The normalised expression text (fields joined by single spaces).
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether every field of `dt` (to minute precision) satisfies the expression.
    pub fn matches(&self, dt: &DateTime<Utc>) -> bool {
        self.minute.matches(dt.minute())
            && self.hour.matches(dt.hour())
            && self.month.matches(dt.month())
            && self.day_matches(dt.date_naive())
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.day_of_month.matches(date.day());
        let dow = self
            .day_of_week
            .matches(date.weekday().num_days_from_sunday());
        if self.day_of_month.wildcard || self.day_of_week.wildcard {
            dom && dow
        } else {
            dom || dow
        }
    }

    /// Smallest minute-aligned time strictly after `from` that matches.
    ///
    /// Skips whole months, days and hours that cannot match, so the search
    /// is bounded by the number of days in [`SEARCH_HORIZON_YEARS`].
    pub fn next_after(&self, from: &DateTime<Utc>) -> Result<DateTime<Utc>, CronError> {
        let no_match = || CronError::NoMatchFound {
            expr: self.source.clone(),
            years: SEARCH_HORIZON_YEARS,
            from: *from,
        };

        let start = from
            .with_second(0)
            .and_then(|dt| dt.with_nanosecond(0))
            .ok_or_else(no_match)?
            + Duration::minutes(1);
        let horizon = (start + Duration::days(366 * SEARCH_HORIZON_YEARS)).date_naive();

        let mut date = start.date_naive();
        let mut hour = start.hour();
        let mut minute = start.minute();

        loop {
            if date > horizon {
                return Err(no_match());
            }

            if !self.month.matches(date.month()) {
                date = first_of_next_month(date).ok_or_else(no_match)?;
                hour = 0;
                minute = 0;
                continue;
            }

            if !self.day_matches(date) {
                date = date.succ_opt().ok_or_else(no_match)?;
                hour = 0;
                minute = 0;
                continue;
            }

            match self.hour.next_from(hour) {
                Some(h) if h == hour => {}
                Some(h) => {
                    hour = h;
                    minute = 0;
                }
                None => {
                    date = date.succ_opt().ok_or_else(no_match)?;
                    hour = 0;
                    minute = 0;
                    continue;
                }
            }

            match self.minute.next_from(minute) {
                Some(m) => {
                    let naive = date.and_hms_opt(hour, m, 0).ok_or_else(no_match)?;
                    return Ok(Utc.from_utc_datetime(&naive));
                }
                None => {
                    minute = 0;
                    if hour == 23 {
                        date = date.succ_opt().ok_or_else(no_match)?;
                        hour = 0;
                    } else {
                        hour += 1;
                    }
                }
            }
        }
    }

    /// [`next_after`](Self::next_after) on epoch seconds.
    pub fn next_after_epoch(&self, from: i64) -> Result<i64, CronError> {
        let from_dt = DateTime::from_timestamp(from, 0).ok_or_else(|| CronError::NoMatchFound {
            expr: self.source.clone(),
            years: SEARCH_HORIZON_YEARS,
            from: DateTime::<Utc>::MIN_UTC,
        })?;
        Ok(self.next_after(&from_dt)?.timestamp())
    }
}

fn first_of_next_month(date: NaiveDate) -> Option<NaiveDate> {
    if date.month() == 12 {
        NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)
    }
}

impl FromStr for CronExpr {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CronExpr::parse(s)
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Parse `expression` and compute its next fire time after `from` (epoch seconds).
pub fn next_run_after(expression: &str, from: i64) -> Result<i64, CronError> {
    CronExpr::parse(expression)?.next_after_epoch(from)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn parses_wildcards_lists_ranges_and_steps() {
        let expr = CronExpr::parse("0,30 9-17 */10 1-12/3 1-5").unwrap();
        assert!(expr.minute.matches(0));
        assert!(expr.minute.matches(30));
        assert!(!expr.minute.matches(15));
        assert!(expr.hour.matches(9) && expr.hour.matches(17));
        assert!(!expr.hour.matches(18));
        assert!(expr.day_of_month.matches(1));
        assert!(expr.day_of_month.matches(11));
        assert!(!expr.day_of_month.matches(10));
        assert!(expr.month.matches(1) && expr.month.matches(4) && expr.month.matches(10));
        assert!(!expr.month.matches(2));
        assert!(!expr.day_of_week.matches(0));
    }

    #[test]
    fn single_value_with_step_runs_to_field_end() {
        let expr = CronExpr::parse("50/5 * * * *").unwrap();
        assert!(expr.minute.matches(50));
        assert!(expr.minute.matches(55));
        assert!(!expr.minute.matches(45));
    }

    #[test]
    fn rejects_malformed_expressions() {
        for bad in [
            "",
            "* * * *",
            "* * * * * *",
            "60 * * * *",
            "* 24 * * *",
            "* * 0 * *",
            "* * 32 * *",
            "* * * 13 *",
            "* * * * 7",
            "*/0 * * * *",
            "5-1 * * * *",
            "a * * * *",
            "1,,2 * * * *",
            "-1 * * * *",
        ] {
            assert!(
                matches!(CronExpr::parse(bad), Err(CronError::InvalidExpression { .. })),
                "expected `{bad}` to be rejected"
            );
        }
    }

    #[test]
    fn normalises_whitespace() {
        let expr = CronExpr::parse("  */5   *  * * *").unwrap();
        assert_eq!(expr.to_string(), "*/5 * * * *");
    }

    #[test]
    fn next_after_is_strictly_later_on_exact_match() {
        let expr = CronExpr::parse("15 12 * * *").unwrap();
        let next = expr.next_after(&at(2024, 1, 15, 12, 15, 0)).unwrap();
        assert_eq!(next, at(2024, 1, 16, 12, 15, 0));
    }

    #[test]
    fn crosses_year_boundary() {
        let expr = CronExpr::parse("0 0 1 1 *").unwrap();
        let next = expr.next_after(&at(2024, 6, 1, 0, 0, 0)).unwrap();
        assert_eq!(next, at(2025, 1, 1, 0, 0, 0));
    }

    #[test]
    fn leap_day_waits_for_leap_year() {
        let expr = CronExpr::parse("0 0 29 2 *").unwrap();
        let next = expr.next_after(&at(2025, 3, 1, 0, 0, 0)).unwrap();
        assert_eq!(next, at(2028, 2, 29, 0, 0, 0));
    }

    #[test]
    fn impossible_date_reports_no_match() {
        let expr = CronExpr::parse("0 0 31 2 *").unwrap();
        let err = expr.next_after(&at(2024, 1, 1, 0, 0, 0)).unwrap_err();
        assert!(matches!(err, CronError::NoMatchFound { .. }));
    }

    #[test]
    fn restricted_dom_and_dow_use_or() {
        // 13th of the month OR any Friday.
        let expr = CronExpr::parse("0 0 13 * 5").unwrap();
        // 2024-09-01 is a Sunday; the first Friday is the 6th.
        let next = expr.next_after(&at(2024, 9, 1, 0, 0, 0)).unwrap();
        assert_eq!(next, at(2024, 9, 6, 0, 0, 0));
        let after = expr.next_after(&at(2024, 9, 12, 0, 0, 0)).unwrap();
        assert_eq!(after, at(2024, 9, 13, 0, 0, 0));
    }

    #[test]
    fn wildcard_dom_with_restricted_dow_uses_and() {
        // Mondays only.
        let expr = CronExpr::parse("30 8 * * 1").unwrap();
        let next = expr.next_after(&at(2024, 9, 1, 0, 0, 0)).unwrap();
        assert_eq!(next, at(2024, 9, 2, 8, 30, 0));
    }

    #[test]
    fn epoch_helper_matches_datetime_form() {
        let from = at(2024, 3, 10, 12, 7, 0);
        let next = next_run_after("*/15 * * * *", from.timestamp()).unwrap();
        assert_eq!(next, at(2024, 3, 10, 12, 15, 0).timestamp());
    }
}
