//! Wire-level encoding and decoding primitives.
//!
//! PostgreSQL uses big-endian (network byte order) for all integers.

use crate::error::{Error, Result};
use zerocopy::FromBytes;

use super::types::{I16BE, I32BE, U16BE, U32BE};

/// Read a 1-byte unsigned integer.
#[inline]
pub fn get_u8(data: &[u8]) -> Result<(u8, &[u8])> {
    match data.split_first() {
        Some((byte, rest)) => Ok((*byte, rest)),
        None => Err(Error::Protocol("get_u8: empty buffer".into())),
    }
}

/// Read a 2-byte big-endian signed integer.
#[inline]
pub fn get_i16(data: &[u8]) -> Result<(i16, &[u8])> {
    let (head, rest) = split(data, 2, "get_i16")?;
    let value = I16BE::ref_from_bytes(head)
        .map_err(|e| Error::Protocol(format!("get_i16: {e:?}")))?
        .get();
    Ok((value, rest))
}

/// Read a 2-byte big-endian unsigned integer.
#[inline]
pub fn get_u16(data: &[u8]) -> Result<(u16, &[u8])> {
    let (head, rest) = split(data, 2, "get_u16")?;
    let value = U16BE::ref_from_bytes(head)
        .map_err(|e| Error::Protocol(format!("get_u16: {e:?}")))?
        .get();
    Ok((value, rest))
}

/// Read a 4-byte big-endian signed integer.
#[inline]
pub fn get_i32(data: &[u8]) -> Result<(i32, &[u8])> {
    let (head, rest) = split(data, 4, "get_i32")?;
    let value = I32BE::ref_from_bytes(head)
        .map_err(|e| Error::Protocol(format!("get_i32: {e:?}")))?
        .get();
    Ok((value, rest))
}

/// Read a 4-byte big-endian unsigned integer.
#[inline]
pub fn get_u32(data: &[u8]) -> Result<(u32, &[u8])> {
    let (head, rest) = split(data, 4, "get_u32")?;
    let value = U32BE::ref_from_bytes(head)
        .map_err(|e| Error::Protocol(format!("get_u32: {e:?}")))?
        .get();
    Ok((value, rest))
}

/// Read `len` raw bytes.
#[inline]
pub fn get_bytes<'a>(data: &'a [u8], len: usize, what: &'static str) -> Result<(&'a [u8], &'a [u8])> {
    split(data, len, what)
}

/// Read a NUL-terminated string as UTF-8.
#[inline]
pub fn get_cstr(data: &[u8]) -> Result<(&str, &[u8])> {
    match memchr::memchr(0, data) {
        Some(pos) => {
            let text = simdutf8::compat::from_utf8(&data[..pos])
                .map_err(|e| Error::Protocol(format!("get_cstr: invalid UTF-8: {e}")))?;
            Ok((text, &data[pos + 1..]))
        }
        None => Err(Error::Protocol("get_cstr: missing NUL terminator".into())),
    }
}

#[inline]
fn split<'a>(data: &'a [u8], len: usize, what: &'static str) -> Result<(&'a [u8], &'a [u8])> {
    data.split_at_checked(len).ok_or_else(|| {
        Error::Protocol(format!("{what}: buffer too short: {} < {len}", data.len()))
    })
}

/// Builder for a single frontend message, backfilling the length field.
///
/// Message format: type byte (not counted in the length), then a 4-byte
/// big-endian length that includes itself, then the payload. Startup-family
/// messages omit the type byte.
pub struct MessageBuilder<'a> {
    buf: &'a mut Vec<u8>,
    base: usize,
}

impl<'a> MessageBuilder<'a> {
    /// Begin a tagged message.
    pub fn tagged(buf: &'a mut Vec<u8>, tag: u8) -> Self {
        buf.push(tag);
        Self::untagged(buf)
    }

    /// Begin an untagged (startup-family) message.
    pub fn untagged(buf: &'a mut Vec<u8>) -> Self {
        let base = buf.len();
        buf.extend_from_slice(&[0, 0, 0, 0]);
        Self { buf, base }
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn put_i16(&mut self, value: i16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Write a NUL-terminated string.
    pub fn put_cstr(&mut self, s: &str) {
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
    }

    /// Backfill the length field. Must be called exactly once.
    pub fn finish(self) {
        let len = (self.buf.len() - self.base) as i32;
        self.buf[self.base..self.base + 4].copy_from_slice(&len.to_be_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_primitives() {
        let data = [0x01, 0x00, 0x02, 0xFF, 0xFF, 0xFF, 0xFE];
        let (byte, rest) = get_u8(&data).unwrap();
        assert_eq!(byte, 1);
        let (word, rest) = get_i16(rest).unwrap();
        assert_eq!(word, 2);
        let (dword, rest) = get_i32(rest).unwrap();
        assert_eq!(dword, -2);
        assert!(rest.is_empty());
        assert!(get_i32(rest).is_err());
    }

    #[test]
    fn cstr_stops_at_nul() {
        let data = b"hello\0rest";
        let (text, rest) = get_cstr(data).unwrap();
        assert_eq!(text, "hello");
        assert_eq!(rest, b"rest");
        assert!(get_cstr(b"no terminator").is_err());
    }

    #[test]
    fn builder_backfills_length() {
        let mut buf = Vec::new();
        let mut msg = MessageBuilder::tagged(&mut buf, b'Q');
        msg.put_cstr("SELECT 1");
        msg.finish();

        assert_eq!(buf[0], b'Q');
        let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        assert_eq!(len as usize, buf.len() - 1);
    }

    #[test]
    fn untagged_builder() {
        let mut buf = Vec::new();
        let mut msg = MessageBuilder::untagged(&mut buf);
        msg.put_i32(80877103);
        msg.finish();

        assert_eq!(buf.len(), 8);
        assert_eq!(&buf[0..4], &8_i32.to_be_bytes());
    }
}
