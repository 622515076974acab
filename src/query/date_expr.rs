use std::sync::LazyLock;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use regex::Regex;

use crate::date_util::{midnight_utc, shift_months};
use crate::error::{Error, Result};

static RE_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{4})-(\d{2})-(\d{2})$").unwrap());
static RE_NOW_OFFSET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\$NOW\(\s*([+-]?)\s*(\d+)\s+([A-Za-z]+)\s*\)$").unwrap()
});
static RE_PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([^{}]*?)\s*\}\}").unwrap());

const NOW_TOKEN: &str = "$NOW";

/// Calendar unit of a `$NOW(...)` offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetUnit {
    Day,
    Week,
    Month,
    Year,
}

impl OffsetUnit {
    fn parse(s: &str) -> Option<Self> {
        let lower = s.to_ascii_lowercase();
        let singular = lower.strip_suffix('s').unwrap_or(&lower);
        match singular {
            "day" => Some(OffsetUnit::Day),
            "week" => Some(OffsetUnit::Week),
            "month" => Some(OffsetUnit::Month),
            "year" => Some(OffsetUnit::Year),
            _ => None,
        }
    }
}

/// A parsed date expression, before it is anchored to an evaluation instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DateExpr {
    Literal(DateTime<Utc>),
    Now,
    NowOffset { amount: i64, unit: OffsetUnit },
    Placeholder(String),
}

impl DateExpr {
    /// Parse a date expression.
    ///
    /// Supported formats, tried in order:
    /// - `2025-01-31`: midnight UTC of that date
    /// - `2025-01-31T12:00:00Z`: an RFC 3339 timestamp
    /// - `$NOW`: the evaluation instant
    /// - `$NOW(-1 MONTH)`: the evaluation instant shifted by DAY, WEEK, MONTH or YEAR
    /// - `{{name}}`: a variable that was never substituted
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();

        if let Some(caps) = RE_DATE.captures(s) {
            let year: i32 = caps[1].parse().map_err(|_| invalid(s))?;
            let month: u32 = caps[2].parse().map_err(|_| invalid(s))?;
            let day: u32 = caps[3].parse().map_err(|_| invalid(s))?;
            let date = NaiveDate::from_ymd_opt(year, month, day)
                .ok_or_else(|| Error::DateParse(format!("no such calendar date: {s}")))?;
            return Ok(DateExpr::Literal(midnight_utc(date)));
        }

        if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
            return Ok(DateExpr::Literal(ts.with_timezone(&Utc)));
        }

        if s == NOW_TOKEN {
            return Ok(DateExpr::Now);
        }

        if let Some(caps) = RE_NOW_OFFSET.captures(s) {
            let magnitude: i64 = caps[2]
                .parse()
                .map_err(|_| Error::DateParse(format!("offset out of range: {s}")))?;
            let amount = if &caps[1] == "-" { -magnitude } else { magnitude };
            let unit = OffsetUnit::parse(&caps[3])
                .ok_or_else(|| Error::DateParse(format!("unknown unit '{}' in {s}", &caps[3])))?;
            return Ok(DateExpr::NowOffset { amount, unit });
        }

        if let Some(caps) = RE_PLACEHOLDER.captures(s) {
            return Ok(DateExpr::Placeholder(caps[1].to_string()));
        }

        Err(invalid(s))
    }

    /// Anchor the expression to `reference`.
    pub fn resolve(&self, reference: DateTime<Utc>) -> Result<DateTime<Utc>> {
        match self {
            DateExpr::Literal(ts) => Ok(*ts),
            DateExpr::Now => Ok(reference),
            DateExpr::NowOffset { amount, unit } => shift(reference, *amount, *unit),
            DateExpr::Placeholder(name) => {
                Err(Error::UnresolvedVariable(format!("{{{{{name}}}}}")))
            }
        }
    }
}

/// Parse and resolve a date expression in one step.
pub fn resolve(expr: &str, reference: DateTime<Utc>) -> Result<DateTime<Utc>> {
    DateExpr::parse(expr)?.resolve(reference)
}

fn shift(reference: DateTime<Utc>, amount: i64, unit: OffsetUnit) -> Result<DateTime<Utc>> {
    let overflow = || Error::DateParse(format!("offset of {amount} {unit:?} is out of range"));
    match unit {
        OffsetUnit::Day | OffsetUnit::Week => {
            let days = if unit == OffsetUnit::Week {
                amount.checked_mul(7).ok_or_else(overflow)?
            } else {
                amount
            };
            let delta = Duration::try_days(days).ok_or_else(overflow)?;
            reference.checked_add_signed(delta).ok_or_else(overflow)
        }
        OffsetUnit::Month | OffsetUnit::Year => {
            let months = if unit == OffsetUnit::Year {
                amount.checked_mul(12).ok_or_else(overflow)?
            } else {
                amount
            };
            let date = shift_months(reference.date_naive(), months).ok_or_else(overflow)?;
            Ok(date.and_time(reference.time()).and_utc())
        }
    }
}

fn invalid(s: &str) -> Error {
    Error::DateParse(format!("unrecognized date expression: {s:?}"))
}
