#![forbid(unsafe_code)]

//! Allowance window arithmetic. All windows are computed in UTC; weeks start on Monday.

use cardveil_kernel_contracts::card::AllowanceDuration;
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc};

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN))
}

fn first_of_month(year: i32, month: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, 1)
}

pub fn window_start(duration: AllowanceDuration, now: DateTime<Utc>) -> DateTime<Utc> {
    let today = now.date_naive();
    match duration {
        AllowanceDuration::Day => midnight(today),
        AllowanceDuration::Week => {
            let back = i64::from(today.weekday().num_days_from_monday());
            midnight(today - Duration::days(back))
        }
        AllowanceDuration::Month => {
            midnight(first_of_month(today.year(), today.month()).unwrap_or(today))
        }
    }
}

pub fn next_window_start(duration: AllowanceDuration, now: DateTime<Utc>) -> DateTime<Utc> {
    let start = window_start(duration, now);
    match duration {
        AllowanceDuration::Day => start + Duration::days(1),
        AllowanceDuration::Week => start + Duration::days(7),
        AllowanceDuration::Month => {
            let d = start.date_naive();
            let (y, m) = if d.month() == 12 {
                (d.year() + 1, 1)
            } else {
                (d.year(), d.month() + 1)
            };
            first_of_month(y, m)
                .map(midnight)
                .unwrap_or(start + Duration::days(31))
        }
    }
}

pub fn remaining_cents(allowance_value_cents: u64, spent_cents: u64) -> u64 {
    allowance_value_cents.saturating_sub(spent_cents)
}
