//! Per-step application of transform chains

use bigdecimal::{BigDecimal, RoundingMode, ToPrimitive};
use chrono::{NaiveDate, NaiveDateTime};
use std::collections::BTreeMap;

use crate::contract::{Coercion, Contract, EnumLookup, Rounding, SourceRef, StepKind, TargetType};
use crate::document::{Document, Element, ElementPath};
use crate::expression::Scope;
use crate::selector::SelectionResult;
use crate::value::{decimal_in_bounds, Value, MAX_DECIMAL_EXPONENT};

use super::IssueKind;

const DEFAULT_DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%Y%m%d"];
const DEFAULT_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%m/%d/%Y %H:%M:%S",
];

pub(crate) type StepResult = Result<Option<Value>, (IssueKind, String)>;

/// Everything a step can read while one row is being built
pub(crate) struct StepContext<'a, 'd> {
    pub contract: &'a Contract,
    pub document: &'d Document,
    pub selection: &'a SelectionResult<'d>,
    pub scope: &'d Element,
    pub row: &'a BTreeMap<String, Value>,
    pub current: Option<&'a Value>,
}

/// Attribute or text at `source`, resolved from `base`
pub(crate) fn extract(document: &Document, base: &Element, source: &SourceRef) -> Option<Value> {
    let element = document.resolve(base, &source.path).into_iter().next()?;
    let raw = match &source.attribute {
        Some(attribute) => element.attr(attribute),
        None => element.text(),
    };
    raw.map(Value::text)
}

impl Scope for StepContext<'_, '_> {
    /// Identifier lookup order: the current chain value (`value`), columns
    /// already resolved in this row, attributes of the scope element, then
    /// attributes of the root element. `root.x` and `<key identifier>.x` reach
    /// a specific element.
    fn lookup(&self, name: &str) -> Option<Value> {
        if name.eq_ignore_ascii_case("value") {
            return self.current.cloned();
        }
        if let Some(v) = self.row.get(name) {
            return Some(v.clone());
        }
        if let Some((prefix, attribute)) = name.split_once('.') {
            let element = if prefix == "root" {
                Some(self.selection.root)
            } else {
                self.selection.key_identifier(prefix).map(|k| k.element)
            };
            return element.and_then(|e| e.attr(attribute)).map(Value::text);
        }
        self.scope
            .attr(name)
            .or_else(|| self.selection.root.attr(name))
            .map(Value::text)
    }

    fn field(&self, path: &str, attribute: Option<&str>) -> Option<Value> {
        let source = SourceRef {
            path: ElementPath::parse(path),
            attribute: attribute.map(str::to_string),
        };
        extract(self.document, self.scope, &source)
    }
}

pub(crate) fn apply(kind: &StepKind, current: Option<Value>, ctx: &StepContext<'_, '_>) -> StepResult {
    match kind {
        StepKind::Literal(v) => Ok(Some(v.clone())),
        StepKind::Field(source) => Ok(extract(ctx.document, ctx.scope, source)),
        StepKind::Copy {
            key_identifier,
            source,
        } => {
            let base = match key_identifier {
                Some(name) => match ctx.selection.key_identifier(name) {
                    Some(found) if source.path.is_self() && source.attribute.is_none() => {
                        return Ok(Some(Value::text(found.value.clone())));
                    }
                    Some(found) => found.element,
                    None => return Ok(None),
                },
                None => ctx.selection.root,
            };
            Ok(extract(ctx.document, base, source))
        }
        StepKind::Calculated(expr) => expr
            .evaluate(ctx)
            .map_err(|e| (IssueKind::Expression, e.to_string())),
        StepKind::Enum(enum_type) => {
            let Some(value) = current else {
                return Ok(None);
            };
            match ctx.contract.lookup_enum(enum_type, &value.to_string()) {
                EnumLookup::Mapped(code) | EnumLookup::Defaulted(code) => Ok(Some(Value::Int(code))),
                EnumLookup::Unmapped => Ok(None),
                EnumLookup::Rejected => Err((
                    IssueKind::UnmappedEnum,
                    format!("'{value}' is not in enum table {enum_type}"),
                )),
            }
        }
        StepKind::Bit(conversion) => {
            let Some(value) = current else {
                return Ok(None);
            };
            let bit = match &value {
                Value::Bool(b) => Some(i64::from(*b)),
                Value::Int(i @ (0 | 1)) => Some(*i),
                other => ctx.contract.bit_value(conversion, &other.to_string()),
            };
            bit.map(|b| Some(Value::Int(b))).ok_or_else(|| {
                (
                    IssueKind::UnknownToken,
                    format!("'{value}' is not a {conversion} token"),
                )
            })
        }
        StepKind::Coerce(coercion) => match current {
            None => Ok(None),
            Some(value) => coerce(value, coercion).map(Some),
        },
    }
}

fn check_range(value: &BigDecimal, coercion: &Coercion) -> Result<(), (IssueKind, String)> {
    if let Some(min) = &coercion.min {
        if value < min {
            return Err((IssueKind::OutOfRange, format!("{value} is below minimum {min}")));
        }
    }
    if let Some(max) = &coercion.max {
        if value > max {
            return Err((IssueKind::OutOfRange, format!("{value} is above maximum {max}")));
        }
    }
    Ok(())
}

fn not_a(target: &str, value: &Value) -> (IssueKind, String) {
    (
        IssueKind::Coercion,
        format!("'{value}' is not a valid {target}"),
    )
}

/// Numeric view for coercion. Numbers whose exponent is out of bounds are
/// reported as out of range rather than as non-numeric.
fn numeric(value: &Value, target: &str) -> Result<BigDecimal, (IssueKind, String)> {
    let decimal = match value {
        Value::Text(s) => s.trim().parse::<BigDecimal>().map_err(|_| not_a(target, value))?,
        other => other.to_decimal().ok_or_else(|| not_a(target, other))?,
    };
    if !decimal_in_bounds(&decimal) {
        return Err((
            IssueKind::OutOfRange,
            format!("{target} exponent exceeds {MAX_DECIMAL_EXPONENT}"),
        ));
    }
    Ok(decimal)
}

pub(crate) fn coerce(value: Value, coercion: &Coercion) -> Result<Value, (IssueKind, String)> {
    match coercion.to {
        TargetType::Text => {
            let text = value.to_string();
            let text = match coercion.max_length {
                Some(max) => text.chars().take(max).collect(),
                None => text,
            };
            Ok(Value::Text(text))
        }
        TargetType::Int => {
            let decimal = numeric(&value, "integer")?;
            check_range(&decimal, coercion)?;
            // Fractions are truncated toward zero
            decimal
                .to_i64()
                .map(Value::Int)
                .ok_or_else(|| (IssueKind::OutOfRange, format!("{decimal} does not fit in 64 bits")))
        }
        TargetType::Decimal => {
            let decimal = numeric(&value, "decimal")?;
            let scaled = match (coercion.scale, coercion.rounding) {
                (None, _) => decimal,
                (Some(scale), Rounding::Truncate) => decimal.with_scale(scale),
                (Some(scale), Rounding::HalfUp) => decimal.with_scale_round(scale, RoundingMode::HalfUp),
            };
            check_range(&scaled, coercion)?;
            Ok(Value::Decimal(scaled))
        }
        TargetType::Bool => match &value {
            Value::Bool(b) => Ok(Value::Bool(*b)),
            Value::Int(0) => Ok(Value::Bool(false)),
            Value::Int(1) => Ok(Value::Bool(true)),
            Value::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "t" | "yes" | "y" | "1" => Ok(Value::Bool(true)),
                "false" | "f" | "no" | "n" | "0" => Ok(Value::Bool(false)),
                _ => Err(not_a("boolean", &value)),
            },
            _ => Err(not_a("boolean", &value)),
        },
        TargetType::Date => match &value {
            Value::Date(d) => Ok(Value::Date(*d)),
            Value::DateTime(dt) => Ok(Value::Date(dt.date())),
            Value::Text(s) => parse_date(s.trim(), &coercion.formats)
                .map(Value::Date)
                .ok_or_else(|| not_a("date", &value)),
            _ => Err(not_a("date", &value)),
        },
        TargetType::Datetime => match &value {
            Value::DateTime(dt) => Ok(Value::DateTime(*dt)),
            Value::Date(d) => Ok(Value::DateTime(d.and_time(chrono::NaiveTime::MIN))),
            Value::Text(s) => parse_datetime(s.trim(), &coercion.formats)
                .map(Value::DateTime)
                .ok_or_else(|| not_a("datetime", &value)),
            _ => Err(not_a("datetime", &value)),
        },
    }
}

fn parse_date(text: &str, formats: &[String]) -> Option<NaiveDate> {
    if !formats.is_empty() {
        return formats.iter().find_map(|f| {
            NaiveDate::parse_from_str(text, f)
                .ok()
                .or_else(|| NaiveDateTime::parse_from_str(text, f).ok().map(|dt| dt.date()))
        });
    }
    DEFAULT_DATE_FORMATS
        .iter()
        .find_map(|f| NaiveDate::parse_from_str(text, f).ok())
        .or_else(|| {
            DEFAULT_DATETIME_FORMATS
                .iter()
                .find_map(|f| NaiveDateTime::parse_from_str(text, f).ok())
                .map(|dt| dt.date())
        })
}

fn parse_datetime(text: &str, formats: &[String]) -> Option<NaiveDateTime> {
    if !formats.is_empty() {
        return formats
            .iter()
            .find_map(|f| NaiveDateTime::parse_from_str(text, f).ok());
    }
    DEFAULT_DATETIME_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(text, f).ok())
        .or_else(|| parse_date(text, &[]).map(|d| d.and_time(chrono::NaiveTime::MIN)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn coercion(to: TargetType) -> Coercion {
        Coercion {
            to,
            scale: None,
            rounding: Rounding::Truncate,
            max_length: None,
            min: None,
            max: None,
            formats: Vec::new(),
        }
    }

    fn decimal(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).unwrap()
    }

    #[test]
    fn test_int_coercion_truncates() {
        let c = coercion(TargetType::Int);
        assert_eq!(coerce(Value::text("42"), &c), Ok(Value::Int(42)));
        assert_eq!(coerce(Value::text("-7.9"), &c), Ok(Value::Int(-7)));
        assert_eq!(
            coerce(Value::text("n/a"), &c).unwrap_err().0,
            IssueKind::Coercion
        );
    }

    #[test]
    fn test_decimal_scale_policies() {
        let mut c = coercion(TargetType::Decimal);
        c.scale = Some(2);
        assert_eq!(
            coerce(Value::text("10.239"), &c),
            Ok(Value::Decimal(decimal("10.23")))
        );
        c.rounding = Rounding::HalfUp;
        assert_eq!(
            coerce(Value::text("10.235"), &c),
            Ok(Value::Decimal(decimal("10.24")))
        );
    }

    #[test]
    fn test_huge_exponent_is_out_of_range() {
        let int = coercion(TargetType::Int);
        assert_eq!(
            coerce(Value::text("1e999999999"), &int).unwrap_err().0,
            IssueKind::OutOfRange
        );

        let mut dec = coercion(TargetType::Decimal);
        dec.scale = Some(2);
        assert_eq!(
            coerce(Value::text("1e999999999"), &dec).unwrap_err().0,
            IssueKind::OutOfRange
        );
        assert_eq!(
            coerce(Value::text("1e-999999999"), &dec).unwrap_err().0,
            IssueKind::OutOfRange
        );
        assert_eq!(
            coerce(Value::text("1.5e3"), &dec),
            Ok(Value::Decimal(decimal("1500.00")))
        );
    }

    #[test]
    fn test_range_checks() {
        let mut c = coercion(TargetType::Int);
        c.min = Some(decimal("0"));
        c.max = Some(decimal("999"));
        assert_eq!(coerce(Value::text("999"), &c), Ok(Value::Int(999)));
        assert_eq!(
            coerce(Value::text("1000"), &c).unwrap_err().0,
            IssueKind::OutOfRange
        );
        assert_eq!(
            coerce(Value::text("-1"), &c).unwrap_err().0,
            IssueKind::OutOfRange
        );
    }

    #[test]
    fn test_text_truncation() {
        let mut c = coercion(TargetType::Text);
        c.max_length = Some(3);
        assert_eq!(coerce(Value::text("abcdef"), &c), Ok(Value::text("abc")));
        assert_eq!(coerce(Value::Int(12345), &c), Ok(Value::text("123")));
    }

    #[test]
    fn test_date_formats() {
        let c = coercion(TargetType::Date);
        let expected = Value::Date(NaiveDate::from_ymd_opt(2023, 4, 5).unwrap());
        assert_eq!(coerce(Value::text("2023-04-05"), &c), Ok(expected.clone()));
        assert_eq!(coerce(Value::text("04/05/2023"), &c), Ok(expected.clone()));
        assert_eq!(
            coerce(Value::text("2023-04-05T10:11:12"), &c),
            Ok(expected)
        );
        assert!(coerce(Value::text("yesterday"), &c).is_err());

        let mut custom = coercion(TargetType::Date);
        custom.formats = vec!["%d.%m.%Y".to_string()];
        assert_eq!(
            coerce(Value::text("05.04.2023"), &custom),
            Ok(Value::Date(NaiveDate::from_ymd_opt(2023, 4, 5).unwrap()))
        );
    }

    #[test]
    fn test_datetime_accepts_dates() {
        let c = coercion(TargetType::Datetime);
        let midnight = NaiveDate::from_ymd_opt(2023, 4, 5)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        assert_eq!(
            coerce(Value::text("2023-04-05"), &c),
            Ok(Value::DateTime(midnight))
        );
        let precise = NaiveDate::from_ymd_opt(2023, 4, 5)
            .unwrap()
            .and_hms_milli_opt(8, 30, 0, 250)
            .unwrap();
        assert_eq!(
            coerce(Value::text("2023-04-05 08:30:00.250"), &c),
            Ok(Value::DateTime(precise))
        );
    }

    #[test]
    fn test_bool_tokens() {
        let c = coercion(TargetType::Bool);
        assert_eq!(coerce(Value::text("Y"), &c), Ok(Value::Bool(true)));
        assert_eq!(coerce(Value::text("false"), &c), Ok(Value::Bool(false)));
        assert!(coerce(Value::text("maybe"), &c).is_err());
    }
}
