//! Typed scalar values flowing from extraction to the target store

use bigdecimal::{BigDecimal, ToPrimitive, Zero};
use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;
use std::str::FromStr;

/// Largest decimal exponent, in either direction, accepted from text. Scaling
/// a decimal costs work proportional to the exponent, so text such as
/// `1e999999999` is rejected before anything is scaled.
pub const MAX_DECIMAL_EXPONENT: i64 = 1_000;

/// Whether `d` can be rescaled and compared at bounded cost
pub fn decimal_in_bounds(d: &BigDecimal) -> bool {
    let (_, exponent) = d.as_bigint_and_exponent();
    exponent.unsigned_abs() <= MAX_DECIMAL_EXPONENT.unsigned_abs()
}

/// A resolved column value. Absence is always `Option::None`, never a variant.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Text(String),
    Int(i64),
    Decimal(BigDecimal),
    Bool(bool),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
}

impl Value {
    pub fn text(s: impl Into<String>) -> Self {
        Value::Text(s.into())
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Text(_) => "text",
            Value::Int(_) => "int",
            Value::Decimal(_) => "decimal",
            Value::Bool(_) => "bool",
            Value::Date(_) => "date",
            Value::DateTime(_) => "datetime",
        }
    }

    /// Whitespace-only text counts as blank; every other value is not
    pub fn is_blank(&self) -> bool {
        matches!(self, Value::Text(s) if s.trim().is_empty())
    }

    /// Numeric view of the value; text is parsed after trimming. Text outside
    /// [`MAX_DECIMAL_EXPONENT`] is not numeric.
    pub fn to_decimal(&self) -> Option<BigDecimal> {
        match self {
            Value::Int(i) => Some(BigDecimal::from(*i)),
            Value::Decimal(d) => Some(d.clone()),
            Value::Bool(b) => Some(BigDecimal::from(i64::from(*b))),
            Value::Text(s) => BigDecimal::from_str(s.trim())
                .ok()
                .filter(decimal_in_bounds),
            Value::Date(_) | Value::DateTime(_) => None,
        }
    }

    pub fn to_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Text(s) => s
                .trim()
                .parse()
                .ok()
                .or_else(|| self.to_decimal().and_then(|d| d.to_i64())),
            other => other.to_decimal().and_then(|d| d.to_i64()),
        }
    }

    /// Truthiness used by boolean operators and `CASE WHEN`
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Decimal(d) => !d.is_zero(),
            Value::Text(s) => !s.trim().is_empty(),
            Value::Date(_) | Value::DateTime(_) => true,
        }
    }

    /// Convert a JSON literal from the contract. Arrays, objects and null have
    /// no scalar meaning and yield `None`.
    pub fn from_json(json: &serde_json::Value) -> Option<Value> {
        match json {
            serde_json::Value::String(s) => Some(Value::Text(s.clone())),
            serde_json::Value::Bool(b) => Some(Value::Bool(*b)),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Some(Value::Int(i)),
                None => BigDecimal::from_str(&n.to_string()).ok().map(Value::Decimal),
            },
            _ => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Text(s) => f.write_str(s),
            Value::Int(i) => write!(f, "{i}"),
            Value::Decimal(d) => write!(f, "{d}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Value::DateTime(dt) => write!(f, "{}", dt.format("%Y-%m-%dT%H:%M:%S%.f")),
        }
    }
}
