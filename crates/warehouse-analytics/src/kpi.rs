//! KPI derivations.
//!
//! Ratios go through [`safe_divide`]: a zero or missing denominator yields
//! `Missing`, never an error or infinity. Every derived float is checked for
//! finiteness on the way out; a non-finite value means a formula skipped its
//! guard and surfaces as `DivisionGuardViolation`.

use chrono::{Datelike, NaiveDate};

use crate::error::{AnalyticsError, Result};
use crate::pipeline::derive;
use crate::table::{DataType, Table, Value};

/// Calendar-month boundaries crossed from `start` to `end`
/// (`(y2 - y1) * 12 + (m2 - m1)`, day of month ignored).
#[must_use]
pub fn months_between(start: NaiveDate, end: NaiveDate) -> i64 {
    i64::from(end.year() - start.year()) * 12 + i64::from(end.month()) - i64::from(start.month())
}

/// Completed years from `birth` to `as_of`.
#[must_use]
pub fn whole_years_between(birth: NaiveDate, as_of: NaiveDate) -> i64 {
    let mut years = i64::from(as_of.year() - birth.year());
    if (as_of.month(), as_of.day()) < (birth.month(), birth.day()) {
        years -= 1;
    }
    years
}

/// `numerator / denominator`, or `Missing` when either side is missing or
/// the denominator is zero.
#[must_use]
pub fn safe_divide(numerator: &Value, denominator: &Value) -> Value {
    match (numerator.as_f64(), denominator.as_f64()) {
        (Some(n), Some(d)) if d != 0.0 => Value::Float(n / d),
        _ => Value::Missing,
    }
}

/// `minuend - subtrahend`, or `Missing` when either side is missing.
#[must_use]
pub fn difference(minuend: &Value, subtrahend: &Value) -> Value {
    match (minuend.as_f64(), subtrahend.as_f64()) {
        (Some(a), Some(b)) => Value::Float(a - b),
        _ => Value::Missing,
    }
}

/// Round half away from zero to `decimals` places.
#[must_use]
pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Reject non-finite floats produced by `formula`.
pub fn checked(formula: &str, value: Value) -> Result<Value> {
    match value {
        Value::Float(v) if !v.is_finite() => Err(AnalyticsError::DivisionGuardViolation {
            formula: formula.to_string(),
        }),
        other => Ok(other),
    }
}

/// Append `output = numerator / denominator` with the zero/missing guard.
pub fn derive_ratio(table: &Table, output: &str, numerator: &str, denominator: &str) -> Result<Table> {
    let formula = format!("{output} = {numerator} / {denominator}");
    derive(table, output, DataType::Float, |row| {
        checked(&formula, safe_divide(row.get(numerator)?, row.get(denominator)?))
    })
}

/// Append `output = minuend - subtrahend`.
pub fn derive_difference(table: &Table, output: &str, minuend: &str, subtrahend: &str) -> Result<Table> {
    derive(table, output, DataType::Float, |row| {
        Ok(difference(row.get(minuend)?, row.get(subtrahend)?))
    })
}

/// Append a rounded copy of a numeric column.
pub fn derive_rounded(table: &Table, output: &str, source: &str, decimals: i32) -> Result<Table> {
    derive(table, output, DataType::Float, |row| {
        let value = row.get(source)?.as_f64().map(|v| round_to(v, decimals));
        checked(output, value.into())
    })
}

/// Append month boundaries between two date columns.
pub fn derive_months_between(table: &Table, output: &str, start: &str, end: &str) -> Result<Table> {
    derive(table, output, DataType::Integer, |row| {
        Ok(match (row.get(start)?.as_date(), row.get(end)?.as_date()) {
            (Some(s), Some(e)) => Value::Integer(months_between(s, e)),
            _ => Value::Missing,
        })
    })
}

/// Append months elapsed from a date column to `as_of`.
pub fn derive_recency(table: &Table, output: &str, last: &str, as_of: NaiveDate) -> Result<Table> {
    derive(table, output, DataType::Integer, |row| {
        Ok(row
            .get(last)?
            .as_date()
            .map(|d| months_between(d, as_of))
            .into())
    })
}

/// Append completed years from a birthdate column to `as_of`.
pub fn derive_age(table: &Table, output: &str, birthdate: &str, as_of: NaiveDate) -> Result<Table> {
    derive(table, output, DataType::Integer, |row| {
        Ok(row
            .get(birthdate)?
            .as_date()
            .map(|d| whole_years_between(d, as_of))
            .into())
    })
}
