//! Result-carrying backend messages.

use crate::error::{Error, Result};
use crate::protocol::codec::{get_bytes, get_cstr, get_i16, get_i32, get_u16, get_u32};
use crate::protocol::types::{FormatCode, Oid};

/// Description of one column in a result set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    /// Field name
    pub name: String,
    /// Table OID (0 if not a table column)
    pub table_oid: Oid,
    /// Column attribute number (0 if not a table column)
    pub column_id: i16,
    /// Data type OID
    pub type_oid: Oid,
    /// Type size (-1 for variable, -2 for NUL-terminated)
    pub type_size: i16,
    /// Type modifier (type-specific)
    pub type_modifier: i32,
    /// Format code of the values in DataRow messages
    pub format: FormatCode,
}

/// Parse a RowDescription payload into its column descriptors.
pub fn parse_row_description(payload: &[u8]) -> Result<Vec<FieldDescription>> {
    let (count, mut data) = get_u16(payload)?;
    let mut fields = Vec::with_capacity(count as usize);

    for _ in 0..count {
        let (name, rest) = get_cstr(data)?;
        let (table_oid, rest) = get_u32(rest)?;
        let (column_id, rest) = get_i16(rest)?;
        let (type_oid, rest) = get_u32(rest)?;
        let (type_size, rest) = get_i16(rest)?;
        let (type_modifier, rest) = get_i32(rest)?;
        let (format, rest) = get_u16(rest)?;

        fields.push(FieldDescription {
            name: name.to_string(),
            table_oid,
            column_id,
            type_oid,
            type_size,
            type_modifier,
            format: FormatCode::from_u16(format),
        });
        data = rest;
    }

    Ok(fields)
}

/// Parse a DataRow payload into raw column slices. `None` is SQL NULL.
pub fn parse_data_row(payload: &[u8]) -> Result<Vec<Option<Vec<u8>>>> {
    let (count, mut data) = get_u16(payload)?;
    let mut columns = Vec::with_capacity(count as usize);

    for _ in 0..count {
        let (len, rest) = get_i32(data)?;
        if len == -1 {
            columns.push(None);
            data = rest;
        } else if len < 0 {
            return Err(Error::Protocol(format!("DataRow: negative length {len}")));
        } else {
            let (value, rest) = get_bytes(rest, len as usize, "DataRow column")?;
            columns.push(Some(value.to_vec()));
            data = rest;
        }
    }

    Ok(columns)
}

/// Parse a CommandComplete tag into the affected-row count.
///
/// Tags look like `SELECT 5`, `INSERT 0 1`, `UPDATE 10`, `BEGIN`. Commands
/// that carry no count report zero.
pub fn parse_command_complete(payload: &[u8]) -> Result<u64> {
    let (tag, _) = get_cstr(payload)?;
    let parts: Vec<&str> = tag.split_whitespace().collect();

    let count = match parts.as_slice() {
        ["INSERT", _oid, count] => count.parse().ok(),
        [_, count] => count.parse().ok(),
        _ => None,
    };

    Ok(count.unwrap_or(0))
}

/// Parse a ParameterDescription payload into the parameter type OIDs.
pub fn parse_parameter_description(payload: &[u8]) -> Result<Vec<Oid>> {
    let (count, mut data) = get_u16(payload)?;
    let mut oids = Vec::with_capacity(count as usize);

    for _ in 0..count {
        let (oid, rest) = get_u32(data)?;
        oids.push(oid);
        data = rest;
    }

    Ok(oids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::oid;

    fn sample_row_description() -> Vec<u8> {
        let mut payload = 1_u16.to_be_bytes().to_vec();
        payload.extend_from_slice(b"id\0");
        payload.extend_from_slice(&100_u32.to_be_bytes()); // table oid
        payload.extend_from_slice(&1_i16.to_be_bytes()); // column id
        payload.extend_from_slice(&oid::INT4.to_be_bytes()); // type oid
        payload.extend_from_slice(&4_i16.to_be_bytes()); // type size
        payload.extend_from_slice(&(-1_i32).to_be_bytes()); // type modifier
        payload.extend_from_slice(&1_u16.to_be_bytes()); // format
        payload
    }

    #[test]
    fn row_description_fields() {
        let fields = parse_row_description(&sample_row_description()).unwrap();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields[0].name, "id");
        assert_eq!(fields[0].table_oid, 100);
        assert_eq!(fields[0].type_oid, oid::INT4);
        assert_eq!(fields[0].format, FormatCode::Binary);
    }

    #[test]
    fn data_row_with_null() {
        let mut payload = 2_u16.to_be_bytes().to_vec();
        payload.extend_from_slice(&4_i32.to_be_bytes());
        payload.extend_from_slice(&7_i32.to_be_bytes());
        payload.extend_from_slice(&(-1_i32).to_be_bytes());

        let columns = parse_data_row(&payload).unwrap();
        assert_eq!(columns.len(), 2);
        assert_eq!(columns[0].as_deref(), Some(&7_i32.to_be_bytes()[..]));
        assert_eq!(columns[1], None);
    }

    #[test]
    fn command_tags() {
        assert_eq!(parse_command_complete(b"SELECT 5\0").unwrap(), 5);
        assert_eq!(parse_command_complete(b"INSERT 0 3\0").unwrap(), 3);
        assert_eq!(parse_command_complete(b"UPDATE 10\0").unwrap(), 10);
        assert_eq!(parse_command_complete(b"BEGIN\0").unwrap(), 0);
        assert_eq!(parse_command_complete(b"CREATE TABLE\0").unwrap(), 0);
    }

    #[test]
    fn parameter_description_oids() {
        let mut payload = 2_u16.to_be_bytes().to_vec();
        payload.extend_from_slice(&oid::INT4.to_be_bytes());
        payload.extend_from_slice(&oid::TEXT.to_be_bytes());
        assert_eq!(
            parse_parameter_description(&payload).unwrap(),
            vec![oid::INT4, oid::TEXT]
        );
    }
}
