//! Parameter substitution: `@name` placeholders to literals or `$n` bindings.

use std::collections::HashMap;

use crate::conversion::literal;
use crate::error::{Error, Result};
use crate::protocol::types::PgType;
use crate::value::PgValue;

/// One ordered, typed parameter produced for the extended-query path.
#[derive(Debug, Clone)]
pub struct Parameter {
    pub name: String,
    pub ty: PgType,
    pub value: PgValue,
}

/// Contract between the connection engine and a parameter substitutor.
///
/// Given a statement and a name → value map, a substitutor produces either
/// a fully inlined SQL string for the simple-query path, or a `$1, $2, …`
/// rewrite plus the ordered, typed parameter list for the extended path.
pub trait Substitutor: Send + Sync {
    /// Inline every placeholder as a SQL literal.
    fn literal(&self, statement: &str, values: &HashMap<String, PgValue>) -> Result<String>;

    /// Rewrite placeholders to `$n` and collect the ordered parameters.
    fn extended(
        &self,
        statement: &str,
        values: &HashMap<String, PgValue>,
    ) -> Result<(String, Vec<Parameter>)>;
}

/// The built-in substitutor.
///
/// Placeholders are `@name` or `@name:type`, where `type` is one of the
/// declared type names (see [`PgType::from_name`]). `@@` escapes a literal
/// `@`. Text inside single-quoted strings and double-quoted identifiers is
/// left untouched. Repeated uses of one name share a single `$n` ordinal.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultSubstitutor;

impl Substitutor for DefaultSubstitutor {
    fn literal(&self, statement: &str, values: &HashMap<String, PgValue>) -> Result<String> {
        let mut out = String::with_capacity(statement.len());
        scan(statement, |piece| {
            match piece {
                Piece::Sql(text) => out.push_str(text),
                Piece::Placeholder { name, .. } => {
                    let value = values
                        .get(name)
                        .ok_or_else(|| missing(name))?;
                    out.push_str(&literal(value));
                }
            }
            Ok(())
        })?;
        Ok(out)
    }

    fn extended(
        &self,
        statement: &str,
        values: &HashMap<String, PgValue>,
    ) -> Result<(String, Vec<Parameter>)> {
        let mut sql = String::with_capacity(statement.len());
        let mut params: Vec<Parameter> = Vec::new();
        let mut ordinals: HashMap<String, usize> = HashMap::new();

        scan(statement, |piece| {
            match piece {
                Piece::Sql(text) => sql.push_str(text),
                Piece::Placeholder { name, ty } => {
                    let index = match ordinals.get(name).copied() {
                        Some(index) => {
                            if let Some(ty) = ty
                                && params[index].ty != ty
                            {
                                return Err(Error::InvalidFormat(format!(
                                    "parameter @{name} declared as both {} and {}",
                                    params[index].ty.name(),
                                    ty.name()
                                )));
                            }
                            index
                        }
                        None => {
                            let value = values
                                .get(name)
                                .ok_or_else(|| missing(name))?;
                            params.push(Parameter {
                                name: name.to_string(),
                                ty: ty.unwrap_or_else(|| value.default_type()),
                                value: value.clone(),
                            });
                            let index = params.len() - 1;
                            ordinals.insert(name.to_string(), index);
                            index
                        }
                    };
                    sql.push('$');
                    sql.push_str(&(index + 1).to_string());
                }
            }
            Ok(())
        })?;

        Ok((sql, params))
    }
}

enum Piece<'a> {
    Sql(&'a str),
    Placeholder { name: &'a str, ty: Option<PgType> },
}

/// Walk the statement, yielding literal SQL runs and placeholders.
fn scan<'a>(statement: &'a str, mut emit: impl FnMut(Piece<'a>) -> Result<()>) -> Result<()> {
    let bytes = statement.as_bytes();
    let mut run_start = 0;
    let mut i = 0;
    let mut in_single = false;
    let mut in_double = false;

    while i < bytes.len() {
        match bytes[i] {
            b'\'' if !in_double => {
                in_single = !in_single;
                i += 1;
            }
            b'"' if !in_single => {
                in_double = !in_double;
                i += 1;
            }
            b'@' if !in_single && !in_double => {
                // Escaped at-sign
                if bytes.get(i + 1) == Some(&b'@') {
                    emit(Piece::Sql(&statement[run_start..=i]))?;
                    i += 2;
                    run_start = i;
                    continue;
                }

                let name_end = ident_end(bytes, i + 1);
                if name_end == i + 1 {
                    // Bare '@' (operator use), not a placeholder
                    i += 1;
                    continue;
                }

                emit(Piece::Sql(&statement[run_start..i]))?;
                let name = &statement[i + 1..name_end];

                let (ty, next) = match bytes.get(name_end) {
                    Some(b':') if bytes.get(name_end + 1) != Some(&b':') => {
                        let ty_end = type_end(bytes, name_end + 1);
                        let ty_name = &statement[name_end + 1..ty_end];
                        let ty = PgType::from_name(ty_name).ok_or_else(|| {
                            Error::InvalidFormat(format!(
                                "unknown type {ty_name:?} for parameter @{name}"
                            ))
                        })?;
                        (Some(ty), ty_end)
                    }
                    _ => (None, name_end),
                };

                emit(Piece::Placeholder { name, ty })?;
                i = next;
                run_start = i;
            }
            _ => i += 1,
        }
    }

    if run_start < statement.len() {
        emit(Piece::Sql(&statement[run_start..]))?;
    }
    Ok(())
}

fn ident_end(bytes: &[u8], start: usize) -> usize {
    let mut i = start;
    if i < bytes.len() && (bytes[i].is_ascii_alphabetic() || bytes[i] == b'_') {
        i += 1;
        while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
            i += 1;
        }
    }
    i
}

fn type_end(bytes: &[u8], start: usize) -> usize {
    let mut i = start;
    while i < bytes.len() && bytes[i].is_ascii_alphabetic() {
        i += 1;
    }
    i
}

fn missing(name: &str) -> Error {
    Error::InvalidFormat(format!("missing value for parameter @{name}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(pairs: &[(&str, PgValue)]) -> HashMap<String, PgValue> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn extended_rewrites_to_dollar_ordinals() {
        let (sql, params) = DefaultSubstitutor
            .extended(
                "SELECT * FROM t WHERE id = @id AND name = @name",
                &values(&[("id", PgValue::Int4(3)), ("name", PgValue::from("bo"))]),
            )
            .unwrap();
        assert_eq!(sql, "SELECT * FROM t WHERE id = $1 AND name = $2");
        assert_eq!(params.len(), 2);
        assert_eq!(params[0].ty, PgType::Integer);
        assert_eq!(params[1].ty, PgType::Text);
    }

    #[test]
    fn repeated_names_share_an_ordinal() {
        let (sql, params) = DefaultSubstitutor
            .extended(
                "SELECT @a + @a + @b",
                &values(&[("a", PgValue::Int4(1)), ("b", PgValue::Int4(2))]),
            )
            .unwrap();
        assert_eq!(sql, "SELECT $1 + $1 + $2");
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn explicit_type_annotation_wins() {
        let (sql, params) = DefaultSubstitutor
            .extended(
                "SELECT @id:bigInteger",
                &values(&[("id", PgValue::Int4(1))]),
            )
            .unwrap();
        assert_eq!(sql, "SELECT $1");
        assert_eq!(params[0].ty, PgType::BigInteger);
    }

    #[test]
    fn unknown_type_annotation_fails() {
        let err = DefaultSubstitutor
            .extended("SELECT @id:geometry", &values(&[("id", PgValue::Int4(1))]))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidFormat(_)));
    }

    #[test]
    fn cast_after_placeholder_is_preserved() {
        let (sql, _) = DefaultSubstitutor
            .extended("SELECT @id::int8", &values(&[("id", PgValue::Int4(1))]))
            .unwrap();
        assert_eq!(sql, "SELECT $1::int8");
    }

    #[test]
    fn quoted_text_is_untouched() {
        let (sql, params) = DefaultSubstitutor
            .extended(
                "SELECT 'mail@example.com', \"weird@col\", @id",
                &values(&[("id", PgValue::Int4(1))]),
            )
            .unwrap();
        assert_eq!(sql, "SELECT 'mail@example.com', \"weird@col\", $1");
        assert_eq!(params.len(), 1);
    }

    #[test]
    fn double_at_escapes() {
        let (sql, params) = DefaultSubstitutor
            .extended("SELECT x @@ y", &HashMap::new())
            .unwrap();
        assert_eq!(sql, "SELECT x @ y");
        assert!(params.is_empty());
    }

    #[test]
    fn missing_value_fails() {
        let err = DefaultSubstitutor
            .extended("SELECT @nope", &HashMap::new())
            .unwrap_err();
        assert!(err.to_string().contains("@nope"));
    }

    #[test]
    fn literal_path_inlines_values() {
        let sql = DefaultSubstitutor
            .literal(
                "INSERT INTO t VALUES (@id, @name)",
                &values(&[("id", PgValue::Int4(3)), ("name", PgValue::from("it's"))]),
            )
            .unwrap();
        assert_eq!(sql, "INSERT INTO t VALUES (3, 'it''s')");
    }

    #[test]
    fn statement_without_placeholders_passes_through() {
        let sql = DefaultSubstitutor
            .literal("SELECT 1", &HashMap::new())
            .unwrap();
        assert_eq!(sql, "SELECT 1");
    }
}
