use chrono::{DateTime, Duration, TimeZone, Utc};
use cw_core::cron::{next_run_after, CronError, CronExpr};

fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
}

// ===========================================================================
// Scenarios
// ===========================================================================

#[test]
fn every_fifteen_minutes_from_seven_past() {
    let expr = CronExpr::parse("*/15 * * * *").unwrap();
    let next = expr.next_after(&at(2024, 5, 20, 12, 7, 0)).unwrap();
    assert_eq!(next, at(2024, 5, 20, 12, 15, 0));
}

#[test]
fn daily_nine_am_just_after_firing_moves_to_tomorrow() {
    let expr = CronExpr::parse("0 9 * * *").unwrap();
    let next = expr.next_after(&at(2024, 5, 20, 9, 0, 1)).unwrap();
    assert_eq!(next, at(2024, 5, 21, 9, 0, 0));
}

#[test]
fn month_end_rolls_into_next_month() {
    let expr = CronExpr::parse("0 0 1 * *").unwrap();
    let next = expr.next_after(&at(2024, 1, 31, 23, 59, 59)).unwrap();
    assert_eq!(next, at(2024, 2, 1, 0, 0, 0));
}

#[test]
fn thirty_first_skips_short_months() {
    let expr = CronExpr::parse("0 12 31 * *").unwrap();
    let next = expr.next_after(&at(2024, 4, 1, 0, 0, 0)).unwrap();
    assert_eq!(next, at(2024, 5, 31, 12, 0, 0));
}

#[test]
fn february_29_in_leap_year() {
    let expr = CronExpr::parse("0 0 29 2 *").unwrap();
    let next = expr.next_after(&at(2024, 1, 1, 0, 0, 0)).unwrap();
    assert_eq!(next, at(2024, 2, 29, 0, 0, 0));
}

#[test]
fn never_matching_expression_fails_with_no_match() {
    let err = next_run_after("0 0 30 2 *", at(2024, 1, 1, 0, 0, 0).timestamp()).unwrap_err();
    assert!(matches!(err, CronError::NoMatchFound { .. }));
}

#[test]
fn invalid_expression_reports_reason() {
    let err = CronExpr::parse("61 * * * *").unwrap_err();
    match err {
        CronError::InvalidExpression { expr, reason } => {
            assert_eq!(expr, "61 * * * *");
            assert!(reason.contains("minute"), "reason was {reason}");
        }
        other => panic!("expected InvalidExpression, got {other:?}"),
    }
}

// ===========================================================================
// Properties
// ===========================================================================

const EXPRESSIONS: &[&str] = &[
    "* * * * *",
    "*/15 * * * *",
    "0 9 * * *",
    "30 8 * * 1-5",
    "0 0 1 * *",
    "0 0 13 * 5",
    "5,35 */2 * * *",
    "0 12 1-7 */3 0",
    "59 23 31 12 *",
];

#[test]
fn next_is_strictly_later_and_matches() {
    let mut from = at(2023, 12, 30, 22, 17, 45);
    let step = Duration::minutes(997);
    for _ in 0..40 {
        for text in EXPRESSIONS {
            let expr = CronExpr::parse(text).unwrap();
            let next = expr.next_after(&from).unwrap();
            assert!(next > from, "`{text}` from {from} gave {next}");
            assert!(expr.matches(&next), "`{text}` returned non-matching {next}");
        }
        from += step;
    }
}

#[test]
fn next_is_the_earliest_match() {
    // Brute-force minute scan over a short window agrees with the evaluator.
    let from = at(2024, 2, 27, 22, 3, 10);
    for text in ["*/7 * * * *", "0 0 * * *", "10-20/5 23 * * *", "0 0 29 2 *"] {
        let expr = CronExpr::parse(text).unwrap();
        let next = expr.next_after(&from).unwrap();

        let mut probe = at(2024, 2, 27, 22, 4, 0);
        while probe < next {
            assert!(!expr.matches(&probe), "`{text}` skipped earlier match {probe}");
            probe += Duration::minutes(1);
        }
    }
}
