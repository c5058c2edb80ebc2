//! # Calendar Helpers
//!
//! Forecast timestamps (`init`, `valid_time`) are stored as floating point
//! days since 1970-01-01 on a proleptic Gregorian calendar. These helpers
//! convert between that encoding and `chrono` dates.

use chrono::{Datelike, Months, NaiveDate, TimeDelta};

/// CF `units` attribute written for every encoded timestamp.
pub const TIME_UNITS: &str = "days since 1970-01-01";

/// CF `calendar` attribute written for every encoded timestamp.
pub const CALENDAR: &str = "proleptic_gregorian";

// chrono's default date is the Unix epoch.
fn epoch() -> NaiveDate {
    NaiveDate::default()
}

/// Encodes a date as days since the epoch.
pub fn date_to_days(date: NaiveDate) -> f64 {
    (date - epoch()).num_days() as f64
}

/// Decodes days since the epoch, truncating any fractional day.
///
/// Returns `None` for non-finite values or dates outside chrono's range.
pub fn days_to_date(days: f64) -> Option<NaiveDate> {
    if !days.is_finite() {
        return None;
    }
    let delta = TimeDelta::try_days(days.floor() as i64)?;
    epoch().checked_add_signed(delta)
}

/// Parses CF time units such as `days since 1993-01-01` or
/// `hours since 1950-01-01 00:00:00` into the number of units per day and
/// the reference date. The time of day of the reference is ignored.
pub fn parse_time_units(units: &str) -> Option<(f64, NaiveDate)> {
    let mut parts = units.split_whitespace();
    let unit = parts.next()?;
    if parts.next()? != "since" {
        return None;
    }
    let reference = parts.next()?.split('T').next()?;
    let per_day = match unit.to_ascii_lowercase().as_str() {
        "days" | "day" | "d" => 1.0,
        "hours" | "hour" | "h" => 24.0,
        "minutes" | "minute" | "min" => 1440.0,
        "seconds" | "second" | "s" => 86400.0,
        _ => return None,
    };
    let base = NaiveDate::parse_from_str(reference, "%Y-%m-%d").ok()?;
    Some((per_day, base))
}

/// Re-expresses CF-encoded times as days since the epoch.
pub fn to_epoch_days(values: &[f64], units: &str) -> Option<Vec<f64>> {
    let (per_day, base) = parse_time_units(units)?;
    let offset = date_to_days(base);
    Some(values.iter().map(|v| offset + v / per_day).collect())
}

/// First day of the given month, used as the forecast initialization date.
pub fn init_date(year: i32, month: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, 1)
}

/// Calendar month (1-12) of an encoded timestamp.
pub fn month_of(days: f64) -> Option<u32> {
    days_to_date(days).map(|d| d.month())
}

/// Calendar year of an encoded timestamp.
pub fn year_of(days: f64) -> Option<i32> {
    days_to_date(days).map(|d| d.year())
}

/// Adds whole months to a date, clamping the day to the end of the month.
pub fn add_months(date: NaiveDate, months: u32) -> Option<NaiveDate> {
    date.checked_add_months(Months::new(months))
}
