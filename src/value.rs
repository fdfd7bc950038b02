// ABOUTME: SqlValue - backend-neutral cell value used for change keys and view slices
// ABOUTME: Binds to PostgreSQL and SQLite parameters and decodes from their rows

use anyhow::{Context, Result};
use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::error::Error;
use std::fmt;
use std::hash::{Hash, Hasher};
use thiserror::Error;
use tokio_postgres::types::{FromSql, IsNull, ToSql, Type};

/// A single column value read from the source and written to the target.
///
/// Widths are kept as the source reported them. When bound to PostgreSQL,
/// integers are resized to the parameter type; other variants must match it.
/// PostgreSQL types without a dedicated variant travel as `Raw` binary values
/// and can only be bound back to a parameter of the same type.
#[derive(Debug, Clone)]
pub enum SqlValue {
    Null,
    Bool(bool),
    SmallInt(i16),
    Int(i32),
    BigInt(i64),
    Real(f32),
    Double(f64),
    Numeric(Decimal),
    Text(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Uuid(uuid::Uuid),
    Json(serde_json::Value),
    /// Binary wire value of any other PostgreSQL type (enums, intervals,
    /// arrays, network types, ...).
    Raw { ty: Type, bytes: Vec<u8> },
}

/// A column value that cannot be represented as a `SqlValue`.
///
/// Re-reading the same row fails the same way, so this is never retryable.
#[derive(Debug, Error)]
#[error("cannot decode {ty} value: {reason}")]
pub struct DecodeError {
    pub ty: String,
    pub reason: String,
}

/// Captures a PostgreSQL value in its binary wire format.
struct RawBytes(Vec<u8>);

impl<'a> FromSql<'a> for RawBytes {
    fn from_sql(
        _ty: &Type,
        raw: &'a [u8],
    ) -> std::result::Result<Self, Box<dyn Error + Sync + Send>> {
        Ok(RawBytes(raw.to_vec()))
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Integer view of the value, used when reading watermarks.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::SmallInt(v) => Some(i64::from(*v)),
            SqlValue::Int(v) => Some(i64::from(*v)),
            SqlValue::BigInt(v) => Some(*v),
            SqlValue::Numeric(d) if d.fract().is_zero() => d.to_i64(),
            SqlValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Typed parameter for every variant except `Null` and `Raw`.
    fn as_pg_param(&self) -> Option<&(dyn ToSql + Sync)> {
        match self {
            SqlValue::Null | SqlValue::Raw { .. } => None,
            SqlValue::Bool(v) => Some(v),
            SqlValue::SmallInt(v) => Some(v),
            SqlValue::Int(v) => Some(v),
            SqlValue::BigInt(v) => Some(v),
            SqlValue::Real(v) => Some(v),
            SqlValue::Double(v) => Some(v),
            SqlValue::Numeric(v) => Some(v),
            SqlValue::Text(v) => Some(v),
            SqlValue::Bytes(v) => Some(v),
            SqlValue::Date(v) => Some(v),
            SqlValue::Time(v) => Some(v),
            SqlValue::Timestamp(v) => Some(v),
            SqlValue::TimestampTz(v) => Some(v),
            SqlValue::Uuid(v) => Some(v),
            SqlValue::Json(v) => Some(v),
        }
    }

    /// Discriminant used by the total equality and hash below.
    fn tag(&self) -> u8 {
        match self {
            SqlValue::Null => 0,
            SqlValue::Bool(_) => 1,
            SqlValue::SmallInt(_) => 2,
            SqlValue::Int(_) => 3,
            SqlValue::BigInt(_) => 4,
            SqlValue::Real(_) => 5,
            SqlValue::Double(_) => 6,
            SqlValue::Numeric(_) => 7,
            SqlValue::Text(_) => 8,
            SqlValue::Bytes(_) => 9,
            SqlValue::Date(_) => 10,
            SqlValue::Timestamp(_) => 11,
            SqlValue::TimestampTz(_) => 12,
            SqlValue::Uuid(_) => 13,
            SqlValue::Json(_) => 14,
            SqlValue::Time(_) => 15,
            SqlValue::Raw { .. } => 16,
        }
    }
}

// Floats compare by bit pattern so that keys can live in a HashSet.
impl PartialEq for SqlValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (SqlValue::Null, SqlValue::Null) => true,
            (SqlValue::Bool(a), SqlValue::Bool(b)) => a == b,
            (SqlValue::SmallInt(a), SqlValue::SmallInt(b)) => a == b,
            (SqlValue::Int(a), SqlValue::Int(b)) => a == b,
            (SqlValue::BigInt(a), SqlValue::BigInt(b)) => a == b,
            (SqlValue::Real(a), SqlValue::Real(b)) => a.to_bits() == b.to_bits(),
            (SqlValue::Double(a), SqlValue::Double(b)) => a.to_bits() == b.to_bits(),
            (SqlValue::Numeric(a), SqlValue::Numeric(b)) => a == b,
            (SqlValue::Text(a), SqlValue::Text(b)) => a == b,
            (SqlValue::Bytes(a), SqlValue::Bytes(b)) => a == b,
            (SqlValue::Date(a), SqlValue::Date(b)) => a == b,
            (SqlValue::Timestamp(a), SqlValue::Timestamp(b)) => a == b,
            (SqlValue::TimestampTz(a), SqlValue::TimestampTz(b)) => a == b,
            (SqlValue::Uuid(a), SqlValue::Uuid(b)) => a == b,
            (SqlValue::Json(a), SqlValue::Json(b)) => a == b,
            (SqlValue::Time(a), SqlValue::Time(b)) => a == b,
            (
                SqlValue::Raw { ty: ta, bytes: ba },
                SqlValue::Raw { ty: tb, bytes: bb },
            ) => ta == tb && ba == bb,
            _ => false,
        }
    }
}

impl Eq for SqlValue {}

impl Hash for SqlValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.tag().hash(state);
        match self {
            SqlValue::Null => {}
            SqlValue::Bool(v) => v.hash(state),
            SqlValue::SmallInt(v) => v.hash(state),
            SqlValue::Int(v) => v.hash(state),
            SqlValue::BigInt(v) => v.hash(state),
            SqlValue::Real(v) => v.to_bits().hash(state),
            SqlValue::Double(v) => v.to_bits().hash(state),
            SqlValue::Numeric(v) => v.hash(state),
            SqlValue::Text(v) => v.hash(state),
            SqlValue::Bytes(v) => v.hash(state),
            SqlValue::Date(v) => v.hash(state),
            SqlValue::Timestamp(v) => v.hash(state),
            SqlValue::TimestampTz(v) => v.hash(state),
            SqlValue::Uuid(v) => v.hash(state),
            SqlValue::Json(v) => v.to_string().hash(state),
            SqlValue::Time(v) => v.hash(state),
            SqlValue::Raw { ty, bytes } => {
                ty.oid().hash(state);
                bytes.hash(state);
            }
        }
    }
}

impl fmt::Display for SqlValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlValue::Null => f.write_str("NULL"),
            SqlValue::Bool(v) => write!(f, "{}", v),
            SqlValue::SmallInt(v) => write!(f, "{}", v),
            SqlValue::Int(v) => write!(f, "{}", v),
            SqlValue::BigInt(v) => write!(f, "{}", v),
            SqlValue::Real(v) => write!(f, "{}", v),
            SqlValue::Double(v) => write!(f, "{}", v),
            SqlValue::Numeric(v) => write!(f, "{}", v),
            SqlValue::Text(v) => write!(f, "'{}'", v),
            SqlValue::Bytes(v) => write!(f, "<{} bytes>", v.len()),
            SqlValue::Date(v) => write!(f, "{}", v),
            SqlValue::Timestamp(v) => write!(f, "{}", v),
            SqlValue::TimestampTz(v) => write!(f, "{}", v.to_rfc3339()),
            SqlValue::Uuid(v) => write!(f, "{}", v),
            SqlValue::Json(v) => write!(f, "{}", v),
            SqlValue::Time(v) => write!(f, "{}", v),
            SqlValue::Raw { ty, bytes } => write!(f, "<{} value, {} bytes>", ty, bytes.len()),
        }
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::Int(v)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::BigInt(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<NaiveDate> for SqlValue {
    fn from(v: NaiveDate) -> Self {
        SqlValue::Date(v)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

// Integers are resized to the parameter's width (a change function may report
// int8 keys for an int4 column). Everything else delegates to the checked
// conversion of its inner type, so a mismatch surfaces as a WrongType error.
impl ToSql for SqlValue {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> std::result::Result<IsNull, Box<dyn Error + Sync + Send>> {
        if let SqlValue::SmallInt(_) | SqlValue::Int(_) | SqlValue::BigInt(_) = self {
            if let Some(v) = self.as_i64() {
                if *ty == Type::INT2 {
                    return i16::try_from(v)?.to_sql(ty, out);
                } else if *ty == Type::INT4 {
                    return i32::try_from(v)?.to_sql(ty, out);
                } else if *ty == Type::INT8 {
                    return v.to_sql(ty, out);
                }
            }
        }

        match self {
            SqlValue::Null => Ok(IsNull::Yes),
            SqlValue::Raw { ty: source, bytes } => {
                if source != ty {
                    return Err(
                        format!("cannot bind a {} value to a {} parameter", source, ty).into(),
                    );
                }
                out.extend_from_slice(bytes);
                Ok(IsNull::No)
            }
            other => match other.as_pg_param() {
                Some(param) => param.to_sql_checked(ty, out),
                None => Ok(IsNull::Yes),
            },
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    fn to_sql_checked(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> std::result::Result<IsNull, Box<dyn Error + Sync + Send>> {
        self.to_sql(ty, out)
    }
}

impl rusqlite::ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<rusqlite::types::ToSqlOutput<'_>> {
        use rusqlite::types::{ToSqlOutput, Value, ValueRef};

        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(Value::Null),
            SqlValue::Bool(v) => ToSqlOutput::Owned(Value::Integer(i64::from(*v))),
            SqlValue::SmallInt(v) => ToSqlOutput::Owned(Value::Integer(i64::from(*v))),
            SqlValue::Int(v) => ToSqlOutput::Owned(Value::Integer(i64::from(*v))),
            SqlValue::BigInt(v) => ToSqlOutput::Owned(Value::Integer(*v)),
            SqlValue::Real(v) => ToSqlOutput::Owned(Value::Real(f64::from(*v))),
            SqlValue::Double(v) => ToSqlOutput::Owned(Value::Real(*v)),
            SqlValue::Numeric(v) => ToSqlOutput::Owned(Value::Text(v.to_string())),
            SqlValue::Text(v) => ToSqlOutput::Borrowed(ValueRef::Text(v.as_bytes())),
            SqlValue::Bytes(v) => ToSqlOutput::Borrowed(ValueRef::Blob(v)),
            SqlValue::Date(v) => ToSqlOutput::Owned(Value::Text(v.format("%Y-%m-%d").to_string())),
            SqlValue::Timestamp(v) => {
                ToSqlOutput::Owned(Value::Text(v.format("%Y-%m-%d %H:%M:%S%.f").to_string()))
            }
            SqlValue::TimestampTz(v) => ToSqlOutput::Owned(Value::Text(v.to_rfc3339())),
            SqlValue::Uuid(v) => ToSqlOutput::Owned(Value::Text(v.to_string())),
            SqlValue::Json(v) => ToSqlOutput::Owned(Value::Text(v.to_string())),
            SqlValue::Time(v) => {
                ToSqlOutput::Owned(Value::Text(v.format("%H:%M:%S%.f").to_string()))
            }
            SqlValue::Raw { bytes, .. } => ToSqlOutput::Borrowed(ValueRef::Blob(bytes)),
        })
    }
}

/// Decode one column of a SQLite row.
///
/// SQLite is dynamically typed, so the storage class decides the variant.
pub fn from_sqlite(value: rusqlite::types::ValueRef<'_>) -> Result<SqlValue> {
    use rusqlite::types::ValueRef;

    Ok(match value {
        ValueRef::Null => SqlValue::Null,
        ValueRef::Integer(v) => SqlValue::BigInt(v),
        ValueRef::Real(v) => SqlValue::Double(v),
        ValueRef::Text(bytes) => SqlValue::Text(
            std::str::from_utf8(bytes)
                .map_err(|e| DecodeError {
                    ty: "SQLite TEXT".to_string(),
                    reason: e.to_string(),
                })?
                .to_string(),
        ),
        ValueRef::Blob(bytes) => SqlValue::Bytes(bytes.to_vec()),
    })
}

/// Decode column `idx` of a PostgreSQL row based on its declared type.
pub fn from_postgres(row: &tokio_postgres::Row, idx: usize) -> Result<SqlValue> {
    let column = &row.columns()[idx];
    let ty = column.type_();

    macro_rules! get {
        ($t:ty, $variant:expr) => {
            row.try_get::<_, Option<$t>>(idx)
                .map_err(|e| DecodeError {
                    ty: ty.to_string(),
                    reason: e.to_string(),
                })
                .with_context(|| format!("Failed to decode column '{}'", column.name()))?
                .map($variant)
                .unwrap_or(SqlValue::Null)
        };
    }

    let value = match ty.name() {
        "bool" => get!(bool, SqlValue::Bool),
        "int2" => get!(i16, SqlValue::SmallInt),
        "int4" => get!(i32, SqlValue::Int),
        "int8" => get!(i64, SqlValue::BigInt),
        "float4" => get!(f32, SqlValue::Real),
        "float8" => get!(f64, SqlValue::Double),
        "numeric" => get!(Decimal, SqlValue::Numeric),
        "text" | "varchar" | "bpchar" | "name" => get!(String, SqlValue::Text),
        "bytea" => get!(Vec<u8>, SqlValue::Bytes),
        "date" => get!(NaiveDate, SqlValue::Date),
        "time" => get!(NaiveTime, SqlValue::Time),
        "timestamp" => get!(NaiveDateTime, SqlValue::Timestamp),
        "timestamptz" => get!(DateTime<Utc>, SqlValue::TimestampTz),
        "uuid" => get!(uuid::Uuid, SqlValue::Uuid),
        "json" | "jsonb" => get!(serde_json::Value, SqlValue::Json),
        _ if <String as FromSql<'_>>::accepts(ty) => get!(String, SqlValue::Text),
        _ => get!(RawBytes, |raw: RawBytes| SqlValue::Raw {
            ty: ty.clone(),
            bytes: raw.0,
        }),
    };

    Ok(value)
}
