use std::error::Error;

use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type as PgType};

/// A single typed value of a record.
///
/// Records are fixed-arity sequences of these, validated against the column
/// list before they are sent anywhere.
#[derive(Debug, Clone, PartialEq)]
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
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Json(serde_json::Value),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Text representation as Postgres parses it on input, `None` for null.
    pub fn to_text(&self) -> Option<String> {
        match self {
            SqlValue::Null => None,
            SqlValue::Bool(value) => Some(if *value { "true" } else { "false" }.to_string()),
            SqlValue::SmallInt(value) => Some(value.to_string()),
            SqlValue::Int(value) => Some(value.to_string()),
            SqlValue::BigInt(value) => Some(value.to_string()),
            SqlValue::Real(value) => Some(Self::float_text(f64::from(*value))),
            SqlValue::Double(value) => Some(Self::float_text(*value)),
            SqlValue::Numeric(value) => Some(value.to_string()),
            SqlValue::Text(value) => Some(value.clone()),
            SqlValue::Date(value) => Some(value.format("%Y-%m-%d").to_string()),
            SqlValue::Timestamp(value) => Some(value.format("%Y-%m-%d %H:%M:%S%.f").to_string()),
            SqlValue::TimestampTz(value) => Some(value.to_rfc3339()),
            SqlValue::Json(value) => Some(value.to_string()),
        }
    }

    fn float_text(value: f64) -> String {
        if value.is_nan() {
            "NaN".to_string()
        } else if value.is_infinite() {
            let text = if value.is_sign_positive() { "Infinity" } else { "-Infinity" };
            text.to_string()
        } else {
            value.to_string()
        }
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<i32> for SqlValue {
    fn from(value: i32) -> Self {
        SqlValue::Int(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::BigInt(value)
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        SqlValue::Bool(value)
    }
}

impl From<NaiveDate> for SqlValue {
    fn from(value: NaiveDate) -> Self {
        SqlValue::Date(value)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self, ty: &PgType, out: &mut BytesMut) -> Result<IsNull, Box<dyn Error + Sync + Send>> {
        match self {
            SqlValue::Null => Ok(IsNull::Yes),
            SqlValue::Bool(value) => value.to_sql(ty, out),
            SqlValue::SmallInt(value) => value.to_sql(ty, out),
            SqlValue::Int(value) => value.to_sql(ty, out),
            SqlValue::BigInt(value) => value.to_sql(ty, out),
            SqlValue::Real(value) => value.to_sql(ty, out),
            SqlValue::Double(value) => value.to_sql(ty, out),
            SqlValue::Numeric(value) => value.to_sql(ty, out),
            SqlValue::Text(value) => value.to_sql(ty, out),
            SqlValue::Date(value) => value.to_sql(ty, out),
            SqlValue::Timestamp(value) => value.to_sql(ty, out),
            SqlValue::TimestampTz(value) => value.to_sql(ty, out),
            SqlValue::Json(value) => value.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &PgType) -> bool {
        true
    }

    to_sql_checked!();
}
