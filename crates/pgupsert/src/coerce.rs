//! Coercion of input values to their column's declared type.
//!
//! Parameters are bound with binary encoding, so every value has to be the
//! exact Rust type the column's Postgres type maps to before it reaches the
//! store. NOT NULL is left to the store.

use pgupsert_schema::{ColumnDescriptor, PgType, TypeModifier};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};

use crate::error::ExecutionError;
use crate::query::Value;

/// Coerce `value` for `column`. `row` is the input row index, for the error.
pub fn coerce(value: Value, column: &ColumnDescriptor, row: usize) -> Result<Value, ExecutionError> {
    coerce_to(value, column.pg_type, column.modifier).map_err(|message| {
        ExecutionError::Coercion {
            row,
            column: column.name.clone(),
            expected: type_label(column.pg_type, column.modifier),
            message,
        }
    })
}

/// `VARCHAR(20)`, `NUMERIC(10,2)`, `INTEGER`...
fn type_label(pg_type: PgType, modifier: TypeModifier) -> String {
    match modifier {
        TypeModifier::None => pg_type.to_string(),
        TypeModifier::Length(n) => format!("{pg_type}({n})"),
        TypeModifier::Numeric { precision, scale } => format!("{pg_type}({precision},{scale})"),
    }
}

fn mismatch(expected: &str, got: &Value) -> String {
    format!("expected {expected}, got {}", got.kind())
}

fn coerce_to(value: Value, pg_type: PgType, modifier: TypeModifier) -> Result<Value, String> {
    if value.is_null() {
        return Ok(Value::Null);
    }

    match pg_type {
        PgType::Boolean => match value {
            Value::Bool(b) => Ok(Value::Bool(b)),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "t" => Ok(Value::Bool(true)),
                "false" | "f" => Ok(Value::Bool(false)),
                _ => Err(format!("cannot parse {s:?} as boolean")),
            },
            other => Err(mismatch("boolean", &other)),
        },
        PgType::SmallInt => {
            let n = to_i64(&value)?;
            i16::try_from(n)
                .map(Value::I16)
                .map_err(|_| format!("{n} is out of range for SMALLINT"))
        }
        PgType::Integer => {
            let n = to_i64(&value)?;
            i32::try_from(n)
                .map(Value::I32)
                .map_err(|_| format!("{n} is out of range for INTEGER"))
        }
        PgType::BigInt => to_i64(&value).map(Value::I64),
        PgType::Real => {
            let v = to_f64(&value)?;
            let narrowed = v as f32;
            if v.is_finite() && !narrowed.is_finite() {
                return Err(format!("{v} is out of range for REAL"));
            }
            Ok(Value::F32(narrowed))
        }
        PgType::DoublePrecision => to_f64(&value).map(Value::F64),
        PgType::Numeric => {
            let d = to_decimal(&value)?;
            apply_numeric_modifier(d, modifier).map(Value::Decimal)
        }
        PgType::Text => match value {
            Value::String(s) => Ok(Value::String(s)),
            other => Err(mismatch("string", &other)),
        },
        PgType::Varchar => match value {
            Value::String(s) => {
                if let TypeModifier::Length(max) = modifier {
                    let len = s.chars().count();
                    if len > max as usize {
                        return Err(format!("{len} characters exceed the limit of {max}"));
                    }
                }
                Ok(Value::String(s))
            }
            other => Err(mismatch("string", &other)),
        },
        PgType::Bytea => match value {
            Value::Bytes(b) => Ok(Value::Bytes(b)),
            Value::String(s) => decode_hex(&s).map(Value::Bytes),
            other => Err(mismatch("bytes", &other)),
        },
        PgType::Timestamptz => match value {
            Value::Timestamp(t) => Ok(Value::Timestamp(t)),
            Value::String(s) => s
                .trim()
                .parse::<jiff::Timestamp>()
                .map(Value::Timestamp)
                .map_err(|e| format!("cannot parse {s:?} as timestamp: {e}")),
            other => Err(mismatch("timestamp", &other)),
        },
        PgType::Date => match value {
            Value::Date(d) => Ok(Value::Date(d)),
            Value::String(s) => s
                .trim()
                .parse::<jiff::civil::Date>()
                .map(Value::Date)
                .map_err(|e| format!("cannot parse {s:?} as date: {e}")),
            other => Err(mismatch("date", &other)),
        },
        PgType::Time => match value {
            Value::Time(t) => Ok(Value::Time(t)),
            Value::String(s) => s
                .trim()
                .parse::<jiff::civil::Time>()
                .map(Value::Time)
                .map_err(|e| format!("cannot parse {s:?} as time: {e}")),
            other => Err(mismatch("time", &other)),
        },
        PgType::Uuid => match value {
            Value::Uuid(u) => Ok(Value::Uuid(u)),
            Value::String(s) => uuid::Uuid::parse_str(s.trim())
                .map(Value::Uuid)
                .map_err(|e| format!("cannot parse {s:?} as uuid: {e}")),
            other => Err(mismatch("uuid", &other)),
        },
        PgType::Jsonb => match value {
            Value::Json(text) => Ok(Value::Json(text)),
            other => json_text(&other).map(Value::Json),
        },
        PgType::TextArray => coerce_array(value, PgType::Text),
        PgType::BigIntArray => coerce_array(value, PgType::BigInt),
        PgType::IntegerArray => coerce_array(value, PgType::Integer),
    }
}

fn coerce_array(value: Value, element: PgType) -> Result<Value, String> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .enumerate()
            .map(|(i, item)| {
                coerce_to(item, element, TypeModifier::None)
                    .map_err(|message| format!("element {i}: {message}"))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        other => Err(mismatch("array", &other)),
    }
}

fn to_i64(value: &Value) -> Result<i64, String> {
    match value {
        Value::I16(v) => Ok(i64::from(*v)),
        Value::I32(v) => Ok(i64::from(*v)),
        Value::I64(v) => Ok(*v),
        Value::F32(v) => float_to_i64(f64::from(*v)),
        Value::F64(v) => float_to_i64(*v),
        Value::Decimal(d) => {
            if !d.fract().is_zero() {
                return Err(format!("{d} is not an integer"));
            }
            d.to_i64().ok_or_else(|| format!("{d} is out of range for BIGINT"))
        }
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|e| format!("cannot parse {s:?} as integer: {e}")),
        other => Err(mismatch("integer", other)),
    }
}

fn float_to_i64(v: f64) -> Result<i64, String> {
    // i64::MAX as f64 rounds up to 2^63, which is itself out of range
    if v.fract() == 0.0 && v >= i64::MIN as f64 && v < i64::MAX as f64 {
        Ok(v as i64)
    } else {
        Err(format!("{v} is not an integer in range"))
    }
}

fn to_f64(value: &Value) -> Result<f64, String> {
    match value {
        Value::I16(v) => Ok(f64::from(*v)),
        Value::I32(v) => Ok(f64::from(*v)),
        Value::I64(v) => Ok(*v as f64),
        Value::F32(v) => Ok(f64::from(*v)),
        Value::F64(v) => Ok(*v),
        Value::Decimal(d) => d
            .to_f64()
            .ok_or_else(|| format!("{d} cannot be represented as a float")),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|e| format!("cannot parse {s:?} as float: {e}")),
        other => Err(mismatch("number", other)),
    }
}

fn to_decimal(value: &Value) -> Result<Decimal, String> {
    match value {
        Value::I16(v) => Ok(Decimal::from(*v)),
        Value::I32(v) => Ok(Decimal::from(*v)),
        Value::I64(v) => Ok(Decimal::from(*v)),
        Value::F32(v) => {
            Decimal::from_f32(*v).ok_or_else(|| format!("{v} cannot be represented as NUMERIC"))
        }
        Value::F64(v) => {
            Decimal::from_f64(*v).ok_or_else(|| format!("{v} cannot be represented as NUMERIC"))
        }
        Value::Decimal(d) => Ok(*d),
        Value::String(s) => {
            let s = s.trim();
            let parsed = if s.contains(['e', 'E']) {
                Decimal::from_scientific(s)
            } else {
                s.parse::<Decimal>()
            };
            parsed.map_err(|e| format!("cannot parse {s:?} as numeric: {e}"))
        }
        other => Err(mismatch("number", other)),
    }
}

/// Round to the column's scale, then reject values whose integer part does
/// not fit in `precision - scale` digits.
fn apply_numeric_modifier(d: Decimal, modifier: TypeModifier) -> Result<Decimal, String> {
    let TypeModifier::Numeric { precision, scale } = modifier else {
        return Ok(d);
    };

    let rounded = d.round_dp_with_strategy(scale, RoundingStrategy::MidpointAwayFromZero);
    let int_part = rounded.abs().trunc();
    let int_digits = if int_part.is_zero() {
        0
    } else {
        int_part.normalize().to_string().len() as u32
    };

    if int_digits > precision.saturating_sub(scale) {
        return Err(format!("{d} overflows NUMERIC({precision},{scale})"));
    }
    Ok(rounded)
}

/// Decode Postgres' `\x0a0b` bytea hex format.
fn decode_hex(s: &str) -> Result<Vec<u8>, String> {
    let Some(hex) = s.strip_prefix("\\x") else {
        return Err("bytea text must use the \\x hex format".to_string());
    };
    if !hex.is_ascii() || hex.len() % 2 != 0 {
        return Err(format!("invalid hex string {s:?}"));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|e| format!("{s:?}: {e}")))
        .collect()
}

/// Encode a value as JSON text for a JSONB column.
fn json_text(value: &Value) -> Result<String, String> {
    let mut out = String::new();
    write_json(value, &mut out)?;
    Ok(out)
}

fn write_json(value: &Value, out: &mut String) -> Result<(), String> {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::I16(v) => out.push_str(&v.to_string()),
        Value::I32(v) => out.push_str(&v.to_string()),
        Value::I64(v) => out.push_str(&v.to_string()),
        Value::F32(v) if v.is_finite() => out.push_str(&v.to_string()),
        Value::F64(v) if v.is_finite() => out.push_str(&v.to_string()),
        Value::F32(_) | Value::F64(_) => return Err("non-finite float in JSON".to_string()),
        Value::Decimal(d) => out.push_str(&d.to_string()),
        Value::String(s) => write_json_string(s, out),
        Value::Uuid(u) => write_json_string(&u.to_string(), out),
        Value::Timestamp(t) => write_json_string(&t.to_string(), out),
        Value::Date(d) => write_json_string(&d.to_string(), out),
        Value::Time(t) => write_json_string(&t.to_string(), out),
        Value::Json(raw) => out.push_str(raw),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_json(item, out)?;
            }
            out.push(']');
        }
        Value::Bytes(_) => return Err(mismatch("JSON value", value)),
    }
    Ok(())
}

fn write_json_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn column(pg_type: PgType) -> ColumnDescriptor {
        ColumnDescriptor::new("c", pg_type)
    }

    #[test]
    fn test_null_passes_through() {
        let col = column(PgType::Integer);
        assert_eq!(coerce(Value::Null, &col, 0).unwrap(), Value::Null);
    }

    #[test]
    fn test_integers_narrow_to_column_width() {
        let col = column(PgType::Integer);
        assert_eq!(coerce(Value::I64(5), &col, 0).unwrap(), Value::I32(5));
        assert_eq!(
            coerce(Value::from("42"), &col, 0).unwrap(),
            Value::I32(42)
        );
        assert_eq!(coerce(Value::F64(3.0), &col, 0).unwrap(), Value::I32(3));

        let err = coerce(Value::I64(i64::from(i32::MAX) + 1), &col, 3).unwrap_err();
        match err {
            ExecutionError::Coercion {
                row,
                column,
                expected,
                ..
            } => {
                assert_eq!(row, 3);
                assert_eq!(column, "c");
                assert_eq!(expected, "INTEGER");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_smallint_range() {
        let col = column(PgType::SmallInt);
        assert_eq!(coerce(Value::I32(-7), &col, 0).unwrap(), Value::I16(-7));
        assert!(coerce(Value::I32(70_000), &col, 0).is_err());
    }

    #[test]
    fn test_fractional_float_is_not_an_integer() {
        assert!(coerce(Value::F64(1.5), &column(PgType::BigInt), 0).is_err());
        assert!(coerce(Value::F64(f64::NAN), &column(PgType::BigInt), 0).is_err());
    }

    #[test]
    fn test_unparseable_string() {
        let err = coerce(Value::from("abc"), &column(PgType::BigInt), 0).unwrap_err();
        assert!(err.to_string().contains("cannot parse \"abc\""), "{err}");
    }

    #[test]
    fn test_numeric_rounds_to_scale() {
        let col = column(PgType::Numeric).modifier(TypeModifier::Numeric {
            precision: 5,
            scale: 2,
        });
        assert_eq!(
            coerce(Value::from("123.456"), &col, 0).unwrap(),
            Value::Decimal(Decimal::from_str("123.46").unwrap())
        );
        assert_eq!(
            coerce(Value::I32(7), &col, 0).unwrap(),
            Value::Decimal(Decimal::from(7))
        );
    }

    #[test]
    fn test_numeric_precision_overflow() {
        let col = column(PgType::Numeric).modifier(TypeModifier::Numeric {
            precision: 5,
            scale: 2,
        });
        let err = coerce(Value::from("1234.5"), &col, 0).unwrap_err();
        assert!(err.to_string().contains("NUMERIC(5,2)"), "{err}");

        // rounding can push a value over the limit
        assert!(coerce(Value::from("999.999"), &col, 0).is_err());
        assert!(coerce(Value::from("999.994"), &col, 0).is_ok());
    }

    #[test]
    fn test_unconstrained_numeric_keeps_scale() {
        let col = column(PgType::Numeric);
        assert_eq!(
            coerce(Value::from("1.23456789"), &col, 0).unwrap(),
            Value::Decimal(Decimal::from_str("1.23456789").unwrap())
        );
        assert_eq!(
            coerce(Value::from("1.5e3"), &col, 0).unwrap(),
            Value::Decimal(Decimal::from(1500))
        );
    }

    #[test]
    fn test_varchar_length_counts_characters() {
        let col = column(PgType::Varchar).modifier(TypeModifier::Length(3));
        assert!(coerce(Value::from("héé"), &col, 0).is_ok());
        let err = coerce(Value::from("abcd"), &col, 0).unwrap_err();
        assert!(err.to_string().contains("VARCHAR(3)"), "{err}");
    }

    #[test]
    fn test_text_rejects_other_kinds() {
        let err = coerce(Value::Bool(true), &column(PgType::Text), 0).unwrap_err();
        assert!(err.to_string().contains("expected string, got bool"), "{err}");
    }

    #[test]
    fn test_string_parsing_for_temporal_and_uuid() {
        assert_eq!(
            coerce(Value::from("2024-03-01"), &column(PgType::Date), 0).unwrap(),
            Value::Date(jiff::civil::date(2024, 3, 1))
        );
        assert_eq!(
            coerce(Value::from("13:45:00"), &column(PgType::Time), 0).unwrap(),
            Value::Time(jiff::civil::time(13, 45, 0, 0))
        );
        assert!(matches!(
            coerce(
                Value::from("2024-03-01T12:00:00Z"),
                &column(PgType::Timestamptz),
                0
            )
            .unwrap(),
            Value::Timestamp(_)
        ));
        assert!(coerce(Value::from("2024-03-01T12:00:00"), &column(PgType::Timestamptz), 0).is_err());
        assert_eq!(
            coerce(
                Value::from("67e55044-10b1-426f-9247-bb680e5fe0c8"),
                &column(PgType::Uuid),
                0
            )
            .unwrap(),
            Value::Uuid(uuid::Uuid::from_str("67e55044-10b1-426f-9247-bb680e5fe0c8").unwrap())
        );
    }

    #[test]
    fn test_bytea_hex() {
        let col = column(PgType::Bytea);
        assert_eq!(
            coerce(Value::from("\\x00ff10"), &col, 0).unwrap(),
            Value::Bytes(vec![0x00, 0xff, 0x10])
        );
        assert!(coerce(Value::from("00ff"), &col, 0).is_err());
        assert!(coerce(Value::from("\\x0"), &col, 0).is_err());
    }

    #[test]
    fn test_jsonb_encodes_plain_values() {
        let col = column(PgType::Jsonb);
        assert_eq!(
            coerce(Value::from("say \"hi\"\n"), &col, 0).unwrap(),
            Value::Json(r#""say \"hi\"\n""#.to_string())
        );
        assert_eq!(
            coerce(
                Value::Array(vec![Value::I32(1), Value::Bool(false), Value::Null]),
                &col,
                0
            )
            .unwrap(),
            Value::Json("[1,false,null]".to_string())
        );
        assert_eq!(
            coerce(Value::Json(r#"{"a":1}"#.into()), &col, 0).unwrap(),
            Value::Json(r#"{"a":1}"#.to_string())
        );
    }

    #[test]
    fn test_array_elements_are_coerced() {
        let col = column(PgType::IntegerArray);
        assert_eq!(
            coerce(
                Value::Array(vec![Value::I64(1), Value::from("2"), Value::Null]),
                &col,
                0
            )
            .unwrap(),
            Value::Array(vec![Value::I32(1), Value::I32(2), Value::Null])
        );

        let err = coerce(
            Value::Array(vec![Value::I64(1), Value::from("x")]),
            &col,
            0,
        )
        .unwrap_err();
        assert!(err.to_string().contains("element 1"), "{err}");

        assert!(coerce(Value::I32(1), &col, 0).is_err());
    }

    #[test]
    fn test_boolean_strings() {
        let col = column(PgType::Boolean);
        assert_eq!(coerce(Value::from("TRUE"), &col, 0).unwrap(), Value::Bool(true));
        assert_eq!(coerce(Value::from("f"), &col, 0).unwrap(), Value::Bool(false));
        assert!(coerce(Value::from("yes please"), &col, 0).is_err());
    }
}
