use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};

/// Get the last day of a given month.
pub fn last_day_of_month(year: i32, month: u32) -> Option<NaiveDate> {
    let first_of_next = if month == 12 {
        NaiveDate::from_ymd_opt(year.checked_add(1)?, 1, 1)?
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)?
    };
    first_of_next.checked_sub_signed(Duration::days(1))
}

/// Shift a date by a signed number of calendar months.
///
/// The day of month is clamped to the last valid day of the target month,
/// so Mar 31 minus one month is Feb 28 (or Feb 29 in a leap year).
pub fn shift_months(d: NaiveDate, months: i64) -> Option<NaiveDate> {
    let total = i64::from(d.year())
        .checked_mul(12)?
        .checked_add(i64::from(d.month0()))?
        .checked_add(months)?;
    let year = i32::try_from(total.div_euclid(12)).ok()?;
    let month = u32::try_from(total.rem_euclid(12)).ok()? + 1;
    let last = last_day_of_month(year, month)?;
    let day = d.day().min(last.day());
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Midnight UTC at the start of the given date.
pub fn midnight_utc(d: NaiveDate) -> DateTime<Utc> {
    d.and_time(chrono::NaiveTime::MIN).and_utc()
}

/// Format an instant the way SQLite's `datetime()` normalises timestamps.
pub fn sqlite_datetime(t: &DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%S").to_string()
}
