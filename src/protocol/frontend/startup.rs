//! Startup, SSL negotiation, and termination messages.

use crate::protocol::codec::MessageBuilder;

/// Protocol version 3.0 (0x00030000)
pub const PROTOCOL_VERSION: i32 = 196608;

/// SSL request code
pub const SSL_REQUEST_CODE: i32 = 80877103;

/// Write an SSLRequest message.
///
/// Sent before StartupMessage to request TLS. The server answers with a
/// single byte: `'S'` (accepted) or `'N'` (rejected).
pub fn write_ssl_request(buf: &mut Vec<u8>) {
    let mut msg = MessageBuilder::untagged(buf);
    msg.put_i32(SSL_REQUEST_CODE);
    msg.finish();
}

/// Write a StartupMessage with NUL-terminated key/value parameter pairs.
pub fn write_startup(buf: &mut Vec<u8>, params: &[(&str, &str)]) {
    let mut msg = MessageBuilder::untagged(buf);
    msg.put_i32(PROTOCOL_VERSION);

    for (name, value) in params {
        msg.put_cstr(name);
        msg.put_cstr(value);
    }

    // Terminator
    msg.put_u8(0);
    msg.finish();
}

/// Write a Terminate message for a clean close.
pub fn write_terminate(buf: &mut Vec<u8>) {
    let msg = MessageBuilder::tagged(buf, super::msg_type::TERMINATE);
    msg.finish();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ssl_request_is_eight_bytes() {
        let mut buf = Vec::new();
        write_ssl_request(&mut buf);

        assert_eq!(buf.len(), 8);
        assert_eq!(&buf[0..4], &8_i32.to_be_bytes());
        assert_eq!(&buf[4..8], &SSL_REQUEST_CODE.to_be_bytes());
    }

    #[test]
    fn startup_carries_version_and_pairs() {
        let mut buf = Vec::new();
        write_startup(
            &mut buf,
            &[
                ("user", "postgres"),
                ("database", "dart_test"),
                ("client_encoding", "UTF8"),
                ("TimeZone", "UTC"),
            ],
        );

        let len = i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        assert_eq!(len as usize, buf.len());

        let version = i32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        assert_eq!(version, PROTOCOL_VERSION);

        assert_eq!(buf[buf.len() - 1], 0);
        assert!(
            buf.windows(5).any(|w| w == b"UTF8\0"),
            "client_encoding missing"
        );
    }

    #[test]
    fn terminate_has_empty_payload() {
        let mut buf = Vec::new();
        write_terminate(&mut buf);

        assert_eq!(buf.len(), 5);
        assert_eq!(buf[0], b'X');
        assert_eq!(&buf[1..5], &4_i32.to_be_bytes());
    }
}
