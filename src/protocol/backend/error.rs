//! ErrorResponse and NoticeResponse parsing.

use std::collections::HashMap;

use crate::error::{Result, ServerError};
use crate::protocol::codec::get_cstr;

/// Parse the field list shared by ErrorResponse and NoticeResponse.
///
/// The payload is a sequence of `field-type byte | NUL-terminated value`
/// pairs ending with a single zero byte.
pub fn parse_fields(payload: &[u8]) -> Result<ServerError> {
    let mut fields = HashMap::new();
    let mut data = payload;

    while let Some((&field_type, rest)) = data.split_first() {
        if field_type == 0 {
            break;
        }
        let (value, rest) = get_cstr(rest)?;
        fields.insert(field_type, value.to_string());
        data = rest;
    }

    Ok(ServerError::new(fields))
}
