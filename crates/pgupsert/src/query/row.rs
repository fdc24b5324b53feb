//! Row mapping between Postgres and runtime values.

use super::Value;
use crate::session::StoreError;
use pgupsert_schema::PgType;
use rust_decimal::Decimal;
use std::error::Error as StdError;
use tokio_postgres::types::{FromSql, IsNull, Kind, ToSql, Type as PgTypeInfo, WrongType};

/// Internal type for reading raw JSONB bytes from PostgreSQL.
struct JsonbRaw(Vec<u8>);

impl<'a> FromSql<'a> for JsonbRaw {
    fn from_sql(
        ty: &PgTypeInfo,
        raw: &'a [u8],
    ) -> Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        if *ty == PgTypeInfo::JSON || *ty == PgTypeInfo::JSONB {
            Ok(JsonbRaw(raw.to_vec()))
        } else {
            Err(format!("expected JSON or JSONB, got {:?}", ty).into())
        }
    }

    fn accepts(ty: &PgTypeInfo) -> bool {
        *ty == PgTypeInfo::JSON || *ty == PgTypeInfo::JSONB
    }
}

/// Optional version for handling NULL JSONB values.
struct OptionalJsonbRaw(Option<Vec<u8>>);

impl<'a> FromSql<'a> for OptionalJsonbRaw {
    fn from_sql(
        ty: &PgTypeInfo,
        raw: &'a [u8],
    ) -> Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        JsonbRaw::from_sql(ty, raw).map(|r| OptionalJsonbRaw(Some(r.0)))
    }

    fn from_sql_null(_ty: &PgTypeInfo) -> Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        Ok(OptionalJsonbRaw(None))
    }

    fn accepts(ty: &PgTypeInfo) -> bool {
        JsonbRaw::accepts(ty)
    }
}

/// Convert a tokio_postgres Row to values, one per expected column type.
pub fn pg_row_to_values(
    pg_row: &tokio_postgres::Row,
    types: &[PgType],
) -> Result<Vec<Value>, StoreError> {
    types
        .iter()
        .enumerate()
        .map(|(i, pg_type)| pg_value_to_value(pg_row, i, *pg_type))
        .collect()
}

/// Extract a value from a Postgres row at a given index.
pub fn pg_value_to_value(
    row: &tokio_postgres::Row,
    idx: usize,
    pg_type: PgType,
) -> Result<Value, StoreError> {
    let column_name = row
        .columns()
        .get(idx)
        .map(|c| c.name().to_string())
        .unwrap_or_else(|| format!("#{idx}"));

    // Helper to create an error when reading a column fails.
    // A WrongType source means the database column type doesn't match what
    // we tried to deserialize as.
    let read_error = |expected: &str, e: tokio_postgres::Error| {
        if e.source()
            .and_then(|s| s.downcast_ref::<WrongType>())
            .is_some()
        {
            let actual = row
                .columns()
                .get(idx)
                .map(|c| c.type_().name().to_string())
                .unwrap_or_else(|| "unknown".to_string());

            return StoreError::TypeMismatch {
                column: column_name.clone(),
                expected: expected.to_string(),
                actual,
            };
        }

        StoreError::ColumnRead {
            column: column_name.clone(),
            expected: expected.to_string(),
            message: e.to_string(),
        }
    };

    match pg_type {
        PgType::Boolean => {
            let v: Option<bool> = row.try_get(idx).map_err(|e| read_error("bool", e))?;
            Ok(v.map(Value::Bool).unwrap_or(Value::Null))
        }
        PgType::SmallInt => {
            let v: Option<i16> = row.try_get(idx).map_err(|e| read_error("smallint", e))?;
            Ok(v.map(Value::I16).unwrap_or(Value::Null))
        }
        PgType::Integer => {
            let v: Option<i32> = row.try_get(idx).map_err(|e| read_error("integer", e))?;
            Ok(v.map(Value::I32).unwrap_or(Value::Null))
        }
        PgType::BigInt => {
            let v: Option<i64> = row.try_get(idx).map_err(|e| read_error("bigint", e))?;
            Ok(v.map(Value::I64).unwrap_or(Value::Null))
        }
        PgType::Real => {
            let v: Option<f32> = row.try_get(idx).map_err(|e| read_error("real", e))?;
            Ok(v.map(Value::F32).unwrap_or(Value::Null))
        }
        PgType::DoublePrecision => {
            let v: Option<f64> = row
                .try_get(idx)
                .map_err(|e| read_error("double precision", e))?;
            Ok(v.map(Value::F64).unwrap_or(Value::Null))
        }
        PgType::Numeric => {
            let v: Option<Decimal> = row.try_get(idx).map_err(|e| read_error("numeric", e))?;
            Ok(v.map(Value::Decimal).unwrap_or(Value::Null))
        }
        PgType::Text | PgType::Varchar => {
            let v: Option<String> = row.try_get(idx).map_err(|e| read_error("text", e))?;
            Ok(v.map(Value::String).unwrap_or(Value::Null))
        }
        PgType::Bytea => {
            let v: Option<Vec<u8>> = row.try_get(idx).map_err(|e| read_error("bytea", e))?;
            Ok(v.map(Value::Bytes).unwrap_or(Value::Null))
        }
        PgType::Timestamptz => {
            let v: Option<jiff::Timestamp> = row
                .try_get(idx)
                .map_err(|e| read_error("timestamptz", e))?;
            Ok(v.map(Value::Timestamp).unwrap_or(Value::Null))
        }
        PgType::Date => {
            let v: Option<jiff::civil::Date> =
                row.try_get(idx).map_err(|e| read_error("date", e))?;
            Ok(v.map(Value::Date).unwrap_or(Value::Null))
        }
        PgType::Time => {
            let v: Option<jiff::civil::Time> =
                row.try_get(idx).map_err(|e| read_error("time", e))?;
            Ok(v.map(Value::Time).unwrap_or(Value::Null))
        }
        PgType::Uuid => {
            let v: Option<uuid::Uuid> = row.try_get(idx).map_err(|e| read_error("uuid", e))?;
            Ok(v.map(Value::Uuid).unwrap_or(Value::Null))
        }
        PgType::Jsonb => {
            let v: OptionalJsonbRaw = row.try_get(idx).map_err(|e| read_error("jsonb", e))?;
            match v.0 {
                Some(raw) => {
                    // JSONB wire format has a 1-byte version prefix, skip it
                    let json_bytes = if raw.first() == Some(&1) {
                        &raw[1..]
                    } else {
                        &raw
                    };
                    let json_str = String::from_utf8_lossy(json_bytes).into_owned();
                    Ok(Value::Json(json_str))
                }
                None => Ok(Value::Null),
            }
        }
        PgType::TextArray => {
            let v: Option<Vec<Option<String>>> =
                row.try_get(idx).map_err(|e| read_error("text[]", e))?;
            Ok(array_value(v))
        }
        PgType::BigIntArray => {
            let v: Option<Vec<Option<i64>>> =
                row.try_get(idx).map_err(|e| read_error("bigint[]", e))?;
            Ok(array_value(v))
        }
        PgType::IntegerArray => {
            let v: Option<Vec<Option<i32>>> =
                row.try_get(idx).map_err(|e| read_error("integer[]", e))?;
            Ok(array_value(v))
        }
    }
}

fn array_value<T: Into<Value>>(items: Option<Vec<Option<T>>>) -> Value {
    match items {
        Some(items) => Value::Array(items.into_iter().map(Value::from).collect()),
        None => Value::Null,
    }
}

/// Wrapper to make our Value usable as a ToSql parameter.
#[derive(Debug)]
pub struct SqlParam<'a>(pub &'a Value);

impl ToSql for SqlParam<'_> {
    fn to_sql(
        &self,
        ty: &PgTypeInfo,
        out: &mut bytes::BytesMut,
    ) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self.0 {
            Value::Null => Ok(IsNull::Yes),
            Value::Bool(v) => v.to_sql_checked(ty, out),
            Value::I16(v) => v.to_sql_checked(ty, out),
            Value::I32(v) => v.to_sql_checked(ty, out),
            Value::I64(v) => v.to_sql_checked(ty, out),
            Value::F32(v) => v.to_sql_checked(ty, out),
            Value::F64(v) => v.to_sql_checked(ty, out),
            Value::Decimal(v) => v.to_sql_checked(ty, out),
            Value::String(v) => v.to_sql_checked(ty, out),
            Value::Bytes(v) => v.to_sql_checked(ty, out),
            Value::Uuid(v) => v.to_sql_checked(ty, out),
            Value::Timestamp(v) => v.to_sql_checked(ty, out),
            Value::Date(v) => v.to_sql_checked(ty, out),
            Value::Time(v) => v.to_sql_checked(ty, out),
            Value::Json(v) => {
                // For JSONB, we need to prepend the version byte
                if *ty == PgTypeInfo::JSONB {
                    out.extend_from_slice(&[1]); // JSONB version 1
                }
                out.extend_from_slice(v.as_bytes());
                Ok(IsNull::No)
            }
            Value::Array(items) => {
                if !matches!(ty.kind(), Kind::Array(_)) {
                    return Err(Box::new(WrongType::new::<Vec<SqlParam<'_>>>(ty.clone())));
                }
                let items: Vec<SqlParam<'_>> = items.iter().map(SqlParam).collect();
                items.to_sql(ty, out)
            }
        }
    }

    fn accepts(ty: &PgTypeInfo) -> bool {
        if let Kind::Array(member) = ty.kind() {
            return Self::accepts(member);
        }
        matches!(
            *ty,
            PgTypeInfo::BOOL
                | PgTypeInfo::INT2
                | PgTypeInfo::INT4
                | PgTypeInfo::INT8
                | PgTypeInfo::FLOAT4
                | PgTypeInfo::FLOAT8
                | PgTypeInfo::NUMERIC
                | PgTypeInfo::TEXT
                | PgTypeInfo::VARCHAR
                | PgTypeInfo::BPCHAR
                | PgTypeInfo::BYTEA
                | PgTypeInfo::JSON
                | PgTypeInfo::JSONB
                | PgTypeInfo::UUID
                | PgTypeInfo::TIMESTAMPTZ
                | PgTypeInfo::DATE
                | PgTypeInfo::TIME
        )
    }

    tokio_postgres::types::to_sql_checked!();
}

/// Borrow a parameter list as the trait objects tokio-postgres expects.
pub(crate) fn sql_params(params: &[Value]) -> Vec<SqlParam<'_>> {
    params.iter().map(SqlParam).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_null_binds_as_null() {
        let mut out = BytesMut::new();
        let result = SqlParam(&Value::Null).to_sql(&PgTypeInfo::INT4, &mut out).unwrap();
        assert!(matches!(result, IsNull::Yes));
        assert!(out.is_empty());
    }

    #[test]
    fn test_width_mismatch_is_rejected() {
        let mut out = BytesMut::new();
        let result = SqlParam(&Value::I64(1)).to_sql(&PgTypeInfo::INT4, &mut out);
        assert!(result.is_err());
    }

    #[test]
    fn test_jsonb_gets_version_byte() {
        let mut out = BytesMut::new();
        SqlParam(&Value::Json("{}".into()))
            .to_sql(&PgTypeInfo::JSONB, &mut out)
            .unwrap();
        assert_eq!(&out[..], b"\x01{}");
    }

    #[test]
    fn test_array_needs_array_type() {
        let value = Value::Array(vec![Value::from("a")]);
        let mut out = BytesMut::new();
        assert!(SqlParam(&value).to_sql(&PgTypeInfo::TEXT, &mut out).is_err());

        let mut out = BytesMut::new();
        assert!(
            SqlParam(&value)
                .to_sql(&PgTypeInfo::TEXT_ARRAY, &mut out)
                .is_ok()
        );
    }

    #[test]
    fn test_accepts_arrays_of_known_members() {
        assert!(SqlParam::accepts(&PgTypeInfo::TEXT_ARRAY));
        assert!(SqlParam::accepts(&PgTypeInfo::INT8_ARRAY));
        assert!(!SqlParam::accepts(&PgTypeInfo::INET));
    }
}
