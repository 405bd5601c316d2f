//! SQL literal rendering for the simple-query path.

use time::{Date, OffsetDateTime, UtcOffset};

use crate::value::PgValue;

/// Render a value as a SQL literal safe to inline in a statement.
pub fn literal(value: &PgValue) -> String {
    match value {
        PgValue::Null => "null".into(),
        PgValue::Bool(true) => "TRUE".into(),
        PgValue::Bool(false) => "FALSE".into(),
        PgValue::Int2(v) => v.to_string(),
        PgValue::Int4(v) => v.to_string(),
        PgValue::Int8(v) => v.to_string(),
        PgValue::Float4(v) => float_literal(f64::from(*v)),
        PgValue::Float8(v) => float_literal(*v),
        PgValue::Text(s) => quote(s),
        PgValue::Bytes(b) => {
            let mut hex = String::with_capacity(2 + b.len() * 2);
            hex.push_str("\\x");
            for byte in b {
                hex.push_str(&format!("{byte:02x}"));
            }
            quote(&hex)
        }
        PgValue::Date(d) => quote(&date_text(*d)),
        PgValue::Timestamp(dt) => quote(&timestamp_text(dt.assume_utc())),
        PgValue::TimestampTz(dt) => quote(&timestamp_text(*dt)),
        PgValue::Uuid(u) => quote(&u.to_string()),
        PgValue::Json(j) => quote(&j.to_string()),
    }
}

fn float_literal(v: f64) -> String {
    if v.is_nan() {
        "'nan'".into()
    } else if v == f64::INFINITY {
        "'infinity'".into()
    } else if v == f64::NEG_INFINITY {
        "'-infinity'".into()
    } else {
        v.to_string()
    }
}

/// Single-quote a string, doubling embedded quotes. Strings containing
/// backslashes use the `E'…'` escape form with backslashes doubled.
fn quote(s: &str) -> String {
    let escaped = s.replace('\'', "''");
    if s.contains('\\') {
        format!("E'{}'", escaped.replace('\\', "\\\\"))
    } else {
        format!("'{escaped}'")
    }
}

/// ISO-8601 date. BC years render the absolute year (1 BC is ISO year 0)
/// zero-padded to four digits, with a trailing ` BC`.
fn date_text(d: Date) -> String {
    let (year, suffix) = display_year(d.year());
    format!(
        "{year:04}-{:02}-{:02}{suffix}",
        u8::from(d.month()),
        d.day()
    )
}

/// ISO-8601 timestamp with a `±HH:MM` zone offset.
fn timestamp_text(dt: OffsetDateTime) -> String {
    let (year, suffix) = display_year(dt.year());
    let offset = offset_text(dt.offset());
    format!(
        "{year:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:06}{offset}{suffix}",
        u8::from(dt.month()),
        dt.day(),
        dt.hour(),
        dt.minute(),
        dt.second(),
        dt.microsecond(),
    )
}

fn display_year(year: i32) -> (i32, &'static str) {
    if year <= 0 { (1 - year, " BC") } else { (year, "") }
}

fn offset_text(offset: UtcOffset) -> String {
    let total_minutes = offset.whole_minutes();
    let sign = if total_minutes < 0 { '-' } else { '+' };
    let minutes = total_minutes.abs();
    format!("{sign}{:02}:{:02}", minutes / 60, minutes % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{date, datetime};

    #[test]
    fn null_and_booleans() {
        assert_eq!(literal(&PgValue::Null), "null");
        assert_eq!(literal(&PgValue::Bool(true)), "TRUE");
        assert_eq!(literal(&PgValue::Bool(false)), "FALSE");
    }

    #[test]
    fn quotes_are_doubled() {
        assert_eq!(literal(&PgValue::Text("it's".into())), "'it''s'");
    }

    #[test]
    fn backslashes_use_escape_string_form() {
        assert_eq!(literal(&PgValue::Text(r"a\b".into())), r"E'a\\b'");
        assert_eq!(literal(&PgValue::Text(r"'\".into())), r"E'''\\'");
    }

    #[test]
    fn float_specials() {
        assert_eq!(literal(&PgValue::Float8(f64::NAN)), "'nan'");
        assert_eq!(literal(&PgValue::Float8(f64::INFINITY)), "'infinity'");
        assert_eq!(literal(&PgValue::Float8(f64::NEG_INFINITY)), "'-infinity'");
        assert_eq!(literal(&PgValue::Float8(1.5)), "1.5");
    }

    #[test]
    fn timestamps_carry_zone_offset() {
        assert_eq!(
            literal(&PgValue::TimestampTz(datetime!(2024-03-01 12:30:45 UTC))),
            "'2024-03-01T12:30:45.000000+00:00'"
        );
        assert_eq!(
            literal(&PgValue::TimestampTz(datetime!(2024-03-01 12:30:45 -5:30))),
            "'2024-03-01T12:30:45.000000-05:30'"
        );
    }

    #[test]
    fn bc_years_render_absolute_with_suffix() {
        // ISO year 0 is 1 BC.
        assert_eq!(literal(&PgValue::Date(date!(0000 - 02 - 03))), "'0001-02-03 BC'");
        assert_eq!(
            literal(&PgValue::Date(date!(-0099 - 12 - 31))),
            "'0100-12-31 BC'"
        );
        assert_eq!(literal(&PgValue::Date(date!(2024 - 01 - 02))), "'2024-01-02'");
    }

    #[test]
    fn bytea_renders_hex_escape() {
        assert_eq!(
            literal(&PgValue::Bytes(vec![0xDE, 0xAD])),
            r"E'\\xdead'"
        );
    }

    #[test]
    fn json_is_quoted_text() {
        assert_eq!(
            literal(&PgValue::Json(serde_json::json!({"k": 1}))),
            r#"'{"k":1}'"#
        );
    }
}
