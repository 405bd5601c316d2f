//! Extended query protocol messages.

use crate::protocol::codec::MessageBuilder;
use crate::protocol::types::FormatCode;

/// One encoded parameter value for a Bind message.
#[derive(Debug, Clone)]
pub struct EncodedParam {
    pub format: FormatCode,
    /// Encoded payload; `None` is SQL NULL (wire length -1).
    pub bytes: Option<Vec<u8>>,
}

/// Write a Parse message.
///
/// Parameter types are never prespecified; the server infers them and
/// reports its choice through ParameterDescription.
pub fn write_parse(buf: &mut Vec<u8>, statement_name: &str, sql: &str) {
    let mut msg = MessageBuilder::tagged(buf, super::msg_type::PARSE);
    msg.put_cstr(statement_name);
    msg.put_cstr(sql);
    msg.put_i16(0);
    msg.finish();
}

/// Write a Bind message against the unnamed portal.
///
/// Parameter format codes use the compact form when possible: a single `1`
/// when every parameter is binary, a single `0` when every parameter is
/// text, and one explicit code per parameter otherwise. Results are always
/// requested in binary.
pub fn write_bind(buf: &mut Vec<u8>, statement_name: &str, params: &[EncodedParam]) {
    let mut msg = MessageBuilder::tagged(buf, super::msg_type::BIND);
    msg.put_cstr(""); // portal
    msg.put_cstr(statement_name);

    let all_binary = params.iter().all(|p| p.format == FormatCode::Binary);
    let all_text = params.iter().all(|p| p.format == FormatCode::Text);
    if all_binary {
        msg.put_i16(1);
        msg.put_i16(FormatCode::Binary as i16);
    } else if all_text {
        msg.put_i16(1);
        msg.put_i16(FormatCode::Text as i16);
    } else {
        msg.put_i16(params.len() as i16);
        for param in params {
            msg.put_i16(param.format as i16);
        }
    }

    msg.put_i16(params.len() as i16);
    for param in params {
        match &param.bytes {
            Some(bytes) => {
                msg.put_i32(bytes.len() as i32);
                msg.put_bytes(bytes);
            }
            None => msg.put_i32(-1),
        }
    }

    // Result format codes: all binary
    msg.put_i16(1);
    msg.put_i16(FormatCode::Binary as i16);
    msg.finish();
}

/// Write a Describe message for a prepared statement (`'S'` variant).
pub fn write_describe_statement(buf: &mut Vec<u8>, statement_name: &str) {
    let mut msg = MessageBuilder::tagged(buf, super::msg_type::DESCRIBE);
    msg.put_u8(b'S');
    msg.put_cstr(statement_name);
    msg.finish();
}

/// Write an Execute message against the unnamed portal, no row limit.
pub fn write_execute(buf: &mut Vec<u8>) {
    let mut msg = MessageBuilder::tagged(buf, super::msg_type::EXECUTE);
    msg.put_cstr(""); // portal
    msg.put_i32(0); // max rows: unlimited
    msg.finish();
}

/// Write a Sync message, delimiting the pipelined request group.
pub fn write_sync(buf: &mut Vec<u8>) {
    let msg = MessageBuilder::tagged(buf, super::msg_type::SYNC);
    msg.finish();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binary(bytes: &[u8]) -> EncodedParam {
        EncodedParam {
            format: FormatCode::Binary,
            bytes: Some(bytes.to_vec()),
        }
    }

    fn text(bytes: &[u8]) -> EncodedParam {
        EncodedParam {
            format: FormatCode::Text,
            bytes: Some(bytes.to_vec()),
        }
    }

    #[test]
    fn parse_has_zero_prespecified_types() {
        let mut buf = Vec::new();
        write_parse(&mut buf, "000000000001", "SELECT $1");

        assert_eq!(buf[0], b'P');
        assert_eq!(&buf[buf.len() - 2..], &0_i16.to_be_bytes());
    }

    #[test]
    fn bind_compacts_uniform_binary_formats() {
        let mut buf = Vec::new();
        write_bind(&mut buf, "s", &[binary(&[0, 0, 0, 1]), binary(&[0, 0, 0, 2])]);

        // portal "" + statement "s" end at offset 5 + 1 + 2
        let body = &buf[8..];
        assert_eq!(&body[0..2], &1_i16.to_be_bytes()); // one format code
        assert_eq!(&body[2..4], &1_i16.to_be_bytes()); // binary
        assert_eq!(&body[4..6], &2_i16.to_be_bytes()); // two values
    }

    #[test]
    fn bind_expands_mixed_formats() {
        let mut buf = Vec::new();
        write_bind(&mut buf, "", &[binary(&[1]), text(b"x")]);

        let body = &buf[7..];
        assert_eq!(&body[0..2], &2_i16.to_be_bytes()); // explicit per-param codes
        assert_eq!(&body[2..4], &1_i16.to_be_bytes());
        assert_eq!(&body[4..6], &0_i16.to_be_bytes());
    }

    #[test]
    fn bind_encodes_null_as_negative_length() {
        let mut buf = Vec::new();
        write_bind(
            &mut buf,
            "",
            &[EncodedParam {
                format: FormatCode::Binary,
                bytes: None,
            }],
        );
        assert!(
            buf.windows(4).any(|w| w == (-1_i32).to_be_bytes()),
            "missing NULL length"
        );
    }

    #[test]
    fn sync_is_length_only() {
        let mut buf = Vec::new();
        write_sync(&mut buf);
        assert_eq!(buf, vec![b'S', 0, 0, 0, 4]);
    }

    #[test]
    fn execute_unnamed_portal_unlimited() {
        let mut buf = Vec::new();
        write_execute(&mut buf);
        assert_eq!(buf[0], b'E');
        let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        assert_eq!(len, 9);
    }
}
