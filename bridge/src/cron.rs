// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Job cadences: six field cron expressions with a leading seconds field
//! (`*/1 * * * * *`), the classic five field form, or `@every <n><unit>`.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveDate, TimeZone, Timelike, Utc};
use serde_with::{DeserializeFromStr, SerializeDisplay};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::BridgeError;

// Searching further than this for a matching instant means the expression
// can't fire (e.g. February 30th).
const MAX_SEARCH_YEARS: i32 = 5;

#[derive(Clone, Debug, PartialEq, Eq, SerializeDisplay, DeserializeFromStr)]
pub enum Schedule {
    Cron(CronSchedule),
    Every(Duration),
}

impl Schedule {
    pub fn every(interval: Duration) -> Self {
        Schedule::Every(interval)
    }

    /// The first firing instant strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Schedule::Every(interval) => {
                ChronoDuration::from_std(*interval)
                    .ok()
                    .and_then(|interval| after.checked_add_signed(interval))
            }
            Schedule::Cron(cron) => cron.next_after(after),
        }
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Schedule::Cron(cron) => f.write_str(&cron.expression),
            Schedule::Every(interval) => write!(f, "@every {}", format_interval(*interval)),
        }
    }
}

fn format_interval(interval: Duration) -> String {
    let millis = interval.as_millis();
    if millis % 3_600_000 == 0 && millis > 0 {
        format!("{}h", millis / 3_600_000)
    } else if millis % 60_000 == 0 && millis > 0 {
        format!("{}m", millis / 60_000)
    } else if millis % 1000 == 0 {
        format!("{}s", millis / 1000)
    } else {
        format!("{millis}ms")
    }
}

fn parse_interval(s: &str) -> Result<Duration, BridgeError> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| BridgeError::ConfigError(format!("Interval {s:?} has no unit")))?;
    let (value, unit) = s.split_at(split);
    let value: u64 = value
        .parse()
        .map_err(|_| BridgeError::ConfigError(format!("Invalid interval {s:?}")))?;
    let interval = match unit {
        "ms" => Duration::from_millis(value),
        "s" => Duration::from_secs(value),
        "m" => Duration::from_secs(value * 60),
        "h" => Duration::from_secs(value * 3600),
        other => {
            return Err(BridgeError::ConfigError(format!(
                "Unknown interval unit {other:?} in {s:?}"
            )))
        }
    };
    if interval.is_zero() {
        return Err(BridgeError::ConfigError("Interval must be positive".into()));
    }
    Ok(interval)
}

impl FromStr for Schedule {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(interval) = s.strip_prefix("@every") {
            return parse_interval(interval).map(Schedule::Every);
        }
        CronSchedule::from_str(s).map(Schedule::Cron)
    }
}

// Bit sets of the allowed values of each field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CronSchedule {
    expression: String,
    seconds: u64,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    // Standard cron: when both day fields are restricted either may match.
    day_of_month_any: bool,
    day_of_week_any: bool,
}

fn parse_field(field: &str, min: u32, max: u32, name: &str) -> Result<u64, BridgeError> {
    let invalid = || BridgeError::ConfigError(format!("Invalid cron {name} field {field:?}"));
    let mut bits = 0u64;
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| invalid())?;
                if step == 0 {
                    return Err(invalid());
                }
                (range, step)
            }
            None => (part, 1),
        };
        let (start, end) = if range == "*" {
            (min, max)
        } else if let Some((start, end)) = range.split_once('-') {
            (
                start.parse().map_err(|_| invalid())?,
                end.parse().map_err(|_| invalid())?,
            )
        } else {
            let value: u32 = range.parse().map_err(|_| invalid())?;
            // `5/15` means from 5 to the end in steps of 15.
            if step > 1 {
                (value, max)
            } else {
                (value, value)
            }
        };
        if start < min || end > max || start > end {
            return Err(invalid());
        }
        let mut value = start;
        while value <= end {
            bits |= 1 << value;
            value += step;
        }
    }
    Ok(bits)
}

fn is_set(bits: u64, value: u32) -> bool {
    bits & (1 << value) != 0
}

impl FromStr for CronSchedule {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = s.split_whitespace().collect();
        let fields: Vec<&str> = match fields.len() {
            6 => fields,
            5 => std::iter::once("0").chain(fields).collect(),
            n => {
                return Err(BridgeError::ConfigError(format!(
                    "Cron expression {s:?} has {n} fields, expected 5 or 6"
                )))
            }
        };
        let mut days_of_week = parse_field(fields[5], 0, 7, "day of week")?;
        // 7 is Sunday as well
        if is_set(days_of_week, 7) {
            days_of_week = (days_of_week | 1) & !(1 << 7);
        }
        Ok(CronSchedule {
            expression: s.split_whitespace().collect::<Vec<_>>().join(" "),
            seconds: parse_field(fields[0], 0, 59, "second")?,
            minutes: parse_field(fields[1], 0, 59, "minute")?,
            hours: parse_field(fields[2], 0, 23, "hour")?,
            days_of_month: parse_field(fields[3], 1, 31, "day of month")?,
            months: parse_field(fields[4], 1, 12, "month")?,
            days_of_week,
            day_of_month_any: fields[3] == "*",
            day_of_week_any: fields[5] == "*",
        })
    }
}

impl CronSchedule {
    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = is_set(self.days_of_month, date.day());
        let dow = is_set(self.days_of_week, date.weekday().num_days_from_sunday());
        match (self.day_of_month_any, self.day_of_week_any) {
            (true, true) => true,
            (true, false) => dow,
            (false, true) => dom,
            (false, false) => dom || dow,
        }
    }

    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = after.with_nanosecond(0)?.naive_utc() + ChronoDuration::seconds(1);
        let last_year = t.year() + MAX_SEARCH_YEARS;
        while t.year() <= last_year {
            if !is_set(self.months, t.month()) {
                let (year, month) = if t.month() == 12 {
                    (t.year() + 1, 1)
                } else {
                    (t.year(), t.month() + 1)
                };
                t = NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.day_matches(t.date()) {
                t = t.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !is_set(self.hours, t.hour()) {
                t = t.date().and_hms_opt(t.hour(), 0, 0)? + ChronoDuration::hours(1);
                continue;
            }
            if !is_set(self.minutes, t.minute()) {
                t = t.date().and_hms_opt(t.hour(), t.minute(), 0)? + ChronoDuration::minutes(1);
                continue;
            }
            if !is_set(self.seconds, t.second()) {
                t += ChronoDuration::seconds(1);
                continue;
            }
            return Some(Utc.from_utc_datetime(&t));
        }
        None
    }
}
