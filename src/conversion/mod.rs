//! Binary and text codecs between [`PgValue`] and Postgres wire payloads.

mod literal;

pub use literal::literal;

use std::collections::HashMap;
use std::sync::Arc;

use time::{Date, OffsetDateTime, PrimitiveDateTime};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::protocol::types::{FormatCode, Oid, PgType, oid};
use crate::value::PgValue;

/// Julian day number of the Postgres date epoch, 2000-01-01.
const J2000: i32 = 2_451_545;

/// Microseconds between the Unix epoch and the Postgres timestamp epoch,
/// 2000-01-01T00:00:00Z.
const PG_EPOCH_UNIX_MICROS: i128 = 946_684_800_000_000;

/// Encode a value in Postgres binary format for the declared type.
///
/// Returns `None` for SQL NULL. A runtime value that does not fit the
/// declared type fails with [`Error::InvalidType`]; a string that does not
/// parse as the declared type (e.g. a malformed UUID) fails with
/// [`Error::InvalidFormat`].
pub fn encode(value: &PgValue, ty: PgType) -> Result<Option<Vec<u8>>> {
    if value.is_null() {
        return Ok(None);
    }

    let bytes = match ty {
        PgType::Boolean => match value {
            PgValue::Bool(b) => vec![u8::from(*b)],
            _ => return Err(mismatch(value, ty)),
        },
        PgType::SmallInteger => {
            let v = value.as_i64().ok_or_else(|| mismatch(value, ty))?;
            let v = i16::try_from(v).map_err(|_| overflow(value, ty))?;
            v.to_be_bytes().to_vec()
        }
        PgType::Integer | PgType::Serial => {
            let v = value.as_i64().ok_or_else(|| mismatch(value, ty))?;
            let v = i32::try_from(v).map_err(|_| overflow(value, ty))?;
            v.to_be_bytes().to_vec()
        }
        PgType::BigInteger | PgType::BigSerial => {
            let v = value.as_i64().ok_or_else(|| mismatch(value, ty))?;
            v.to_be_bytes().to_vec()
        }
        PgType::Real => match value {
            PgValue::Float4(v) => v.to_be_bytes().to_vec(),
            _ => return Err(mismatch(value, ty)),
        },
        PgType::Double => match value {
            PgValue::Float4(v) => f64::from(*v).to_be_bytes().to_vec(),
            PgValue::Float8(v) => v.to_be_bytes().to_vec(),
            _ => return Err(mismatch(value, ty)),
        },
        PgType::Text | PgType::Name => match value {
            PgValue::Text(s) => s.as_bytes().to_vec(),
            _ => return Err(mismatch(value, ty)),
        },
        PgType::Date => match value {
            PgValue::Date(d) => encode_date(*d),
            _ => return Err(mismatch(value, ty)),
        },
        PgType::Timestamp => match value {
            PgValue::Timestamp(dt) => encode_timestamp(dt.assume_utc())?,
            PgValue::TimestampTz(dt) => encode_timestamp(*dt)?,
            _ => return Err(mismatch(value, ty)),
        },
        PgType::TimestampTz => match value {
            PgValue::TimestampTz(dt) => encode_timestamp(*dt)?,
            PgValue::Timestamp(dt) => encode_timestamp(dt.assume_utc())?,
            _ => return Err(mismatch(value, ty)),
        },
        PgType::Bytea => match value {
            PgValue::Bytes(b) => b.clone(),
            _ => return Err(mismatch(value, ty)),
        },
        PgType::Uuid => match value {
            PgValue::Uuid(u) => u.as_bytes().to_vec(),
            PgValue::Text(s) => Uuid::parse_str(s)
                .map_err(|e| Error::InvalidFormat(format!("malformed uuid {s:?}: {e}")))?
                .as_bytes()
                .to_vec(),
            _ => return Err(mismatch(value, ty)),
        },
        PgType::Json => {
            let text = match value {
                PgValue::Json(j) => j.to_string(),
                PgValue::Text(s) => s.clone(),
                _ => return Err(mismatch(value, ty)),
            };
            let mut out = Vec::with_capacity(text.len() + 1);
            out.push(0x01); // jsonb version byte
            out.extend_from_slice(text.as_bytes());
            out
        }
    };

    Ok(Some(bytes))
}

/// Decode a column payload using the built-in table, an override, or the
/// raw-bytes / UTF-8 fallback for types outside the table.
pub fn decode(
    type_oid: Oid,
    format: FormatCode,
    bytes: &[u8],
    registry: &DecoderRegistry,
) -> Result<PgValue> {
    if let Some(decoder) = registry.get(type_oid) {
        return decoder(bytes);
    }

    match format {
        FormatCode::Binary => decode_binary(type_oid, bytes),
        FormatCode::Text => Ok(decode_text(type_oid, bytes)),
    }
}

fn decode_binary(type_oid: Oid, bytes: &[u8]) -> Result<PgValue> {
    Ok(match type_oid {
        oid::BOOL => {
            let [b] = bytes else {
                return Err(Error::InvalidFormat(format!(
                    "bool payload of {} bytes",
                    bytes.len()
                )));
            };
            PgValue::Bool(*b != 0)
        }
        oid::INT2 => PgValue::Int2(i16::from_be_bytes(fixed(bytes, "int2")?)),
        oid::INT4 => PgValue::Int4(i32::from_be_bytes(fixed(bytes, "int4")?)),
        oid::INT8 => PgValue::Int8(i64::from_be_bytes(fixed(bytes, "int8")?)),
        oid::OID => PgValue::Int8(i64::from(u32::from_be_bytes(fixed(bytes, "oid")?))),
        oid::FLOAT4 => PgValue::Float4(f32::from_be_bytes(fixed(bytes, "float4")?)),
        oid::FLOAT8 => PgValue::Float8(f64::from_be_bytes(fixed(bytes, "float8")?)),
        oid::TEXT | oid::NAME | oid::VARCHAR => PgValue::Text(utf8(bytes)?.to_string()),
        oid::BYTEA => PgValue::Bytes(bytes.to_vec()),
        oid::DATE => {
            let days = i32::from_be_bytes(fixed(bytes, "date")?);
            let date = Date::from_julian_day(
                J2000
                    .checked_add(days)
                    .ok_or_else(|| Error::InvalidFormat("date out of range".into()))?,
            )
            .map_err(|_| Error::InvalidFormat("date out of range".into()))?;
            PgValue::Date(date)
        }
        oid::TIMESTAMP => {
            let dt = decode_timestamp(i64::from_be_bytes(fixed(bytes, "timestamp")?))?;
            PgValue::Timestamp(PrimitiveDateTime::new(dt.date(), dt.time()))
        }
        oid::TIMESTAMPTZ => {
            PgValue::TimestampTz(decode_timestamp(i64::from_be_bytes(fixed(bytes, "timestamptz")?))?)
        }
        oid::UUID => PgValue::Uuid(
            Uuid::from_slice(bytes)
                .map_err(|e| Error::InvalidFormat(format!("malformed uuid payload: {e}")))?,
        ),
        oid::JSON | oid::JSONB => {
            let text = match bytes.split_first() {
                Some((&0x01, rest)) => rest,
                _ => bytes,
            };
            PgValue::Json(
                serde_json::from_slice(text)
                    .map_err(|e| Error::InvalidFormat(format!("malformed json payload: {e}")))?,
            )
        }
        _ => fallback(bytes),
    })
}

/// Text-format decoding, used on the simple-query path.
///
/// Only the scalar types are parsed; anything else passes through as text
/// (or raw bytes when not valid UTF-8).
fn decode_text(type_oid: Oid, bytes: &[u8]) -> PgValue {
    let Ok(text) = simdutf8::compat::from_utf8(bytes) else {
        return PgValue::Bytes(bytes.to_vec());
    };

    match type_oid {
        oid::BOOL => match text {
            "t" | "true" => PgValue::Bool(true),
            "f" | "false" => PgValue::Bool(false),
            _ => PgValue::Text(text.to_string()),
        },
        oid::INT2 => text
            .parse()
            .map_or_else(|_| PgValue::Text(text.to_string()), PgValue::Int2),
        oid::INT4 => text
            .parse()
            .map_or_else(|_| PgValue::Text(text.to_string()), PgValue::Int4),
        oid::INT8 => text
            .parse()
            .map_or_else(|_| PgValue::Text(text.to_string()), PgValue::Int8),
        oid::FLOAT4 => parse_float(text)
            .map_or_else(|| PgValue::Text(text.to_string()), |v| PgValue::Float4(v as f32)),
        oid::FLOAT8 => {
            parse_float(text).map_or_else(|| PgValue::Text(text.to_string()), PgValue::Float8)
        }
        _ => PgValue::Text(text.to_string()),
    }
}

fn parse_float(text: &str) -> Option<f64> {
    match text {
        "NaN" => Some(f64::NAN),
        "Infinity" => Some(f64::INFINITY),
        "-Infinity" => Some(f64::NEG_INFINITY),
        _ => text.parse().ok(),
    }
}

fn fallback(bytes: &[u8]) -> PgValue {
    match simdutf8::compat::from_utf8(bytes) {
        Ok(text) => PgValue::Text(text.to_string()),
        Err(_) => PgValue::Bytes(bytes.to_vec()),
    }
}

fn encode_date(date: Date) -> Vec<u8> {
    (date.to_julian_day() - J2000).to_be_bytes().to_vec()
}

fn encode_timestamp(dt: OffsetDateTime) -> Result<Vec<u8>> {
    let micros = dt.unix_timestamp_nanos() / 1000 - PG_EPOCH_UNIX_MICROS;
    let micros =
        i64::try_from(micros).map_err(|_| Error::InvalidFormat("timestamp out of range".into()))?;
    Ok(micros.to_be_bytes().to_vec())
}

fn decode_timestamp(micros: i64) -> Result<OffsetDateTime> {
    let nanos = (i128::from(micros) + PG_EPOCH_UNIX_MICROS) * 1000;
    OffsetDateTime::from_unix_timestamp_nanos(nanos)
        .map_err(|_| Error::InvalidFormat("timestamp out of range".into()))
}

fn fixed<const N: usize>(bytes: &[u8], what: &str) -> Result<[u8; N]> {
    bytes
        .try_into()
        .map_err(|_| Error::InvalidFormat(format!("{what} payload of {} bytes", bytes.len())))
}

fn utf8(bytes: &[u8]) -> Result<&str> {
    simdutf8::compat::from_utf8(bytes)
        .map_err(|e| Error::InvalidFormat(format!("invalid UTF-8: {e}")))
}

fn mismatch(value: &PgValue, ty: PgType) -> Error {
    Error::InvalidType(format!("cannot encode {} as {}", value.kind(), ty.name()))
}

fn overflow(value: &PgValue, ty: PgType) -> Error {
    Error::InvalidType(format!("{:?} does not fit in {}", value, ty.name()))
}

type Decoder = Arc<dyn Fn(&[u8]) -> Result<PgValue> + Send + Sync>;

/// Caller-extensible table of column decoders keyed by type OID.
///
/// Registered decoders take precedence over the built-in table, so exotic
/// types (PostGIS geometries from EWKB, for instance) can be mapped without
/// touching the core.
#[derive(Clone, Default)]
pub struct DecoderRegistry {
    overrides: HashMap<Oid, Decoder>,
}

impl DecoderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a decoder for a type OID.
    pub fn register<F>(&mut self, type_oid: Oid, decoder: F)
    where
        F: Fn(&[u8]) -> Result<PgValue> + Send + Sync + 'static,
    {
        self.overrides.insert(type_oid, Arc::new(decoder));
    }

    fn get(&self, type_oid: Oid) -> Option<&Decoder> {
        self.overrides.get(&type_oid)
    }
}

impl std::fmt::Debug for DecoderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoderRegistry")
            .field("overrides", &self.overrides.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{date, datetime};

    fn round_trip(value: PgValue, ty: PgType) -> PgValue {
        let bytes = encode(&value, ty).unwrap().unwrap();
        decode_binary(ty.oid(), &bytes).unwrap()
    }

    #[test]
    fn bool_round_trip() {
        assert_eq!(round_trip(PgValue::Bool(true), PgType::Boolean), PgValue::Bool(true));
        assert_eq!(
            round_trip(PgValue::Bool(false), PgType::Boolean),
            PgValue::Bool(false)
        );
    }

    #[test]
    fn integer_round_trips_at_boundaries() {
        for v in [i16::MIN, -1, 0, 1, i16::MAX] {
            assert_eq!(
                round_trip(PgValue::Int2(v), PgType::SmallInteger),
                PgValue::Int2(v)
            );
        }
        for v in [i32::MIN, 0, i32::MAX] {
            assert_eq!(round_trip(PgValue::Int4(v), PgType::Integer), PgValue::Int4(v));
        }
        for v in [i64::MIN, 0, i64::MAX] {
            assert_eq!(
                round_trip(PgValue::Int8(v), PgType::BigInteger),
                PgValue::Int8(v)
            );
        }
    }

    #[test]
    fn integer_widening_and_overflow() {
        // An int8 value that fits an int4 column encodes fine.
        assert_eq!(
            round_trip(PgValue::Int8(7), PgType::Integer),
            PgValue::Int4(7)
        );
        // One that does not fails with invalid-type.
        assert!(matches!(
            encode(&PgValue::Int8(i64::MAX), PgType::Integer),
            Err(Error::InvalidType(_))
        ));
    }

    #[test]
    fn float_round_trips_including_specials() {
        for v in [0.0_f64, -0.0, 1.5, f64::INFINITY, f64::NEG_INFINITY, f64::MAX] {
            let decoded = round_trip(PgValue::Float8(v), PgType::Double);
            assert_eq!(decoded, PgValue::Float8(v));
        }
        let PgValue::Float8(nan) = round_trip(PgValue::Float8(f64::NAN), PgType::Double) else {
            panic!("expected float8");
        };
        assert!(nan.is_nan());

        let PgValue::Float4(v) = round_trip(PgValue::Float4(1.25), PgType::Real) else {
            panic!("expected float4");
        };
        assert_eq!(v, 1.25);
    }

    #[test]
    fn text_round_trips() {
        for s in ["", "plain", "múlti→byte ✓", "with\nnewline"] {
            assert_eq!(
                round_trip(PgValue::Text(s.into()), PgType::Text),
                PgValue::Text(s.into())
            );
        }
    }

    #[test]
    fn bytea_round_trips_empty_and_binary() {
        for b in [vec![], vec![0_u8, 1, 2, 255]] {
            assert_eq!(
                round_trip(PgValue::Bytes(b.clone()), PgType::Bytea),
                PgValue::Bytes(b)
            );
        }
    }

    #[test]
    fn date_epoch_is_zero_days() {
        let bytes = encode(&PgValue::Date(date!(2000 - 01 - 01)), PgType::Date)
            .unwrap()
            .unwrap();
        assert_eq!(bytes, 0_i32.to_be_bytes());

        for d in [date!(2000 - 01 - 01), date!(1970 - 01 - 01), date!(9999 - 12 - 31)] {
            assert_eq!(round_trip(PgValue::Date(d), PgType::Date), PgValue::Date(d));
        }
    }

    #[test]
    fn timestamp_epoch_is_zero_micros() {
        let v = PgValue::TimestampTz(datetime!(2000-01-01 00:00:00 UTC));
        let bytes = encode(&v, PgType::TimestampTz).unwrap().unwrap();
        assert_eq!(bytes, 0_i64.to_be_bytes());
    }

    #[test]
    fn timestamp_round_trips_far_values() {
        for dt in [
            datetime!(1900-01-07 03:04:05.000006 UTC),
            datetime!(2038-01-19 03:14:07 UTC),
            datetime!(9000-06-15 23:59:59.999999 UTC),
        ] {
            assert_eq!(
                round_trip(PgValue::TimestampTz(dt), PgType::TimestampTz),
                PgValue::TimestampTz(dt)
            );
        }
    }

    #[test]
    fn uuid_binary_is_sixteen_raw_bytes() {
        let u = Uuid::parse_str("a0eebc99-9c0b-4ef8-bb6d-6bb9bd380a11").unwrap();
        let bytes = encode(&PgValue::Uuid(u), PgType::Uuid).unwrap().unwrap();
        assert_eq!(bytes.len(), 16);
        assert_eq!(round_trip(PgValue::Uuid(u), PgType::Uuid), PgValue::Uuid(u));
    }

    #[test]
    fn uuid_accepts_string_form_and_rejects_garbage() {
        let bytes = encode(
            &PgValue::Text("a0eebc99-9c0b-4ef8-bb6d-6bb9bd380a11".into()),
            PgType::Uuid,
        )
        .unwrap()
        .unwrap();
        assert_eq!(bytes.len(), 16);

        assert!(matches!(
            encode(&PgValue::Text("not-a-uuid".into()), PgType::Uuid),
            Err(Error::InvalidFormat(_))
        ));
    }

    #[test]
    fn json_carries_version_byte() {
        let v = PgValue::Json(serde_json::json!({"a": [1, 2]}));
        let bytes = encode(&v, PgType::Json).unwrap().unwrap();
        assert_eq!(bytes[0], 0x01);
        assert_eq!(decode_binary(oid::JSONB, &bytes).unwrap(), v);
        // Version byte absent (json rather than jsonb) still decodes.
        assert_eq!(decode_binary(oid::JSON, &bytes[1..]).unwrap(), v);
    }

    #[test]
    fn null_encodes_as_none() {
        assert_eq!(encode(&PgValue::Null, PgType::Integer).unwrap(), None);
    }

    #[test]
    fn type_mismatch_is_invalid_type() {
        assert!(matches!(
            encode(&PgValue::Text("x".into()), PgType::Integer),
            Err(Error::InvalidType(_))
        ));
        assert!(matches!(
            encode(&PgValue::Bool(true), PgType::Bytea),
            Err(Error::InvalidType(_))
        ));
    }

    #[test]
    fn unknown_oid_falls_back_to_text_or_bytes() {
        let registry = DecoderRegistry::new();
        assert_eq!(
            decode(9999, FormatCode::Binary, b"hello", &registry).unwrap(),
            PgValue::Text("hello".into())
        );
        assert_eq!(
            decode(9999, FormatCode::Binary, &[0xFF, 0xFE], &registry).unwrap(),
            PgValue::Bytes(vec![0xFF, 0xFE])
        );
    }

    #[test]
    fn registered_decoder_takes_precedence() {
        let mut registry = DecoderRegistry::new();
        registry.register(9999, |bytes| Ok(PgValue::Int4(bytes.len() as i32)));
        assert_eq!(
            decode(9999, FormatCode::Binary, b"abc", &registry).unwrap(),
            PgValue::Int4(3)
        );
    }

    #[test]
    fn text_format_scalars() {
        assert_eq!(decode_text(oid::INT4, b"41"), PgValue::Int4(41));
        assert_eq!(decode_text(oid::BOOL, b"t"), PgValue::Bool(true));
        assert_eq!(decode_text(oid::FLOAT8, b"-Infinity"), PgValue::Float8(f64::NEG_INFINITY));
        assert_eq!(decode_text(oid::TEXT, b"abc"), PgValue::Text("abc".into()));
    }
}
