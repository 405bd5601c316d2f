//! Runtime value model for parameters and result columns.

use time::{Date, OffsetDateTime, PrimitiveDateTime};
use uuid::Uuid;

use crate::protocol::types::PgType;

/// A PostgreSQL value, as bound to a parameter or decoded from a column.
///
/// The supported set mirrors the declared types a substitutor may assign
/// (see [`PgType`]); anything outside it travels as [`PgValue::Text`] or
/// [`PgValue::Bytes`] through the decoder fallback.
#[derive(Debug, Clone, PartialEq)]
pub enum PgValue {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Text(String),
    Bytes(Vec<u8>),
    Date(Date),
    /// Timestamp without time zone; interpreted as UTC on the wire.
    Timestamp(PrimitiveDateTime),
    TimestampTz(OffsetDateTime),
    Uuid(Uuid),
    Json(serde_json::Value),
}

impl PgValue {
    pub fn is_null(&self) -> bool {
        matches!(self, PgValue::Null)
    }

    /// The declared type this value binds to when none is given explicitly.
    pub fn default_type(&self) -> PgType {
        match self {
            PgValue::Null | PgValue::Text(_) => PgType::Text,
            PgValue::Bool(_) => PgType::Boolean,
            PgValue::Int2(_) => PgType::SmallInteger,
            PgValue::Int4(_) => PgType::Integer,
            PgValue::Int8(_) => PgType::BigInteger,
            PgValue::Float4(_) => PgType::Real,
            PgValue::Float8(_) => PgType::Double,
            PgValue::Bytes(_) => PgType::Bytea,
            PgValue::Date(_) => PgType::Date,
            PgValue::Timestamp(_) => PgType::Timestamp,
            PgValue::TimestampTz(_) => PgType::TimestampTz,
            PgValue::Uuid(_) => PgType::Uuid,
            PgValue::Json(_) => PgType::Json,
        }
    }

    /// Short name of the runtime variant, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            PgValue::Null => "null",
            PgValue::Bool(_) => "bool",
            PgValue::Int2(_) => "int2",
            PgValue::Int4(_) => "int4",
            PgValue::Int8(_) => "int8",
            PgValue::Float4(_) => "float4",
            PgValue::Float8(_) => "float8",
            PgValue::Text(_) => "text",
            PgValue::Bytes(_) => "bytes",
            PgValue::Date(_) => "date",
            PgValue::Timestamp(_) => "timestamp",
            PgValue::TimestampTz(_) => "timestamptz",
            PgValue::Uuid(_) => "uuid",
            PgValue::Json(_) => "json",
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PgValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer view with widening from the smaller integer variants.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            PgValue::Int2(v) => Some(i64::from(*v)),
            PgValue::Int4(v) => Some(i64::from(*v)),
            PgValue::Int8(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            PgValue::Int2(v) => Some(i32::from(*v)),
            PgValue::Int4(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PgValue::Float4(v) => Some(f64::from(*v)),
            PgValue::Float8(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PgValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            PgValue::Bytes(b) => Some(b),
            _ => None,
        }
    }
}

impl From<bool> for PgValue {
    fn from(v: bool) -> Self {
        PgValue::Bool(v)
    }
}

impl From<i16> for PgValue {
    fn from(v: i16) -> Self {
        PgValue::Int2(v)
    }
}

impl From<i32> for PgValue {
    fn from(v: i32) -> Self {
        PgValue::Int4(v)
    }
}

impl From<i64> for PgValue {
    fn from(v: i64) -> Self {
        PgValue::Int8(v)
    }
}

impl From<f32> for PgValue {
    fn from(v: f32) -> Self {
        PgValue::Float4(v)
    }
}

impl From<f64> for PgValue {
    fn from(v: f64) -> Self {
        PgValue::Float8(v)
    }
}

impl From<&str> for PgValue {
    fn from(v: &str) -> Self {
        PgValue::Text(v.to_string())
    }
}

impl From<String> for PgValue {
    fn from(v: String) -> Self {
        PgValue::Text(v)
    }
}

impl From<Vec<u8>> for PgValue {
    fn from(v: Vec<u8>) -> Self {
        PgValue::Bytes(v)
    }
}

impl From<Date> for PgValue {
    fn from(v: Date) -> Self {
        PgValue::Date(v)
    }
}

impl From<PrimitiveDateTime> for PgValue {
    fn from(v: PrimitiveDateTime) -> Self {
        PgValue::Timestamp(v)
    }
}

impl From<OffsetDateTime> for PgValue {
    fn from(v: OffsetDateTime) -> Self {
        PgValue::TimestampTz(v)
    }
}

impl From<Uuid> for PgValue {
    fn from(v: Uuid) -> Self {
        PgValue::Uuid(v)
    }
}

impl From<serde_json::Value> for PgValue {
    fn from(v: serde_json::Value) -> Self {
        PgValue::Json(v)
    }
}

impl<T: Into<PgValue>> From<Option<T>> for PgValue {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => PgValue::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_types() {
        assert_eq!(PgValue::from(1_i32).default_type(), PgType::Integer);
        assert_eq!(PgValue::from("x").default_type(), PgType::Text);
        assert_eq!(PgValue::Null.default_type(), PgType::Text);
    }

    #[test]
    fn integer_widening() {
        assert_eq!(PgValue::Int2(7).as_i64(), Some(7));
        assert_eq!(PgValue::Int4(7).as_i64(), Some(7));
        assert_eq!(PgValue::Text("7".into()).as_i64(), None);
    }

    #[test]
    fn option_maps_to_null() {
        assert_eq!(PgValue::from(None::<i32>), PgValue::Null);
        assert_eq!(PgValue::from(Some(3_i32)), PgValue::Int4(3));
    }
}
