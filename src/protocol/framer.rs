//! Reassembly of backend messages from an arbitrary byte stream.

use super::backend::BackendMessage;
use crate::error::{Error, Result};

/// Incremental framer for the backend message stream.
///
/// TCP delivers bytes in arbitrary chunks; the framer buffers whatever has
/// arrived and emits one typed [`BackendMessage`] per complete frame, in
/// stream order. A frame is `type (1 byte) | length (4 bytes, big-endian,
/// inclusive of itself) | payload (length - 4 bytes)`. Partial headers and
/// partial payloads are held until the next chunk.
#[derive(Debug, Default)]
pub struct Framer {
    buf: Vec<u8>,
    /// Type code and payload length of the frame whose header has been
    /// consumed but whose payload has not fully arrived.
    header: Option<(u8, usize)>,
}

impl Framer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk and append every now-complete message to `out`.
    pub fn feed(&mut self, chunk: &[u8], out: &mut Vec<BackendMessage>) -> Result<()> {
        self.buf.extend_from_slice(chunk);

        loop {
            if self.header.is_none() {
                if self.buf.len() < 5 {
                    return Ok(());
                }
                let code = self.buf[0];
                let len = i32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]);
                if len < 4 {
                    return Err(Error::Protocol(format!(
                        "frame length {len} below minimum for message {:?}",
                        code as char
                    )));
                }
                self.buf.drain(..5);
                self.header = Some((code, len as usize - 4));
            }

            let Some((code, payload_len)) = self.header else {
                return Ok(());
            };
            if self.buf.len() < payload_len {
                return Ok(());
            }

            let payload: Vec<u8> = self.buf.drain(..payload_len).collect();
            self.header = None;
            out.push(BackendMessage::parse(code, &payload)?);
        }
    }

    /// Bytes currently buffered but not yet framed.
    pub fn buffered(&self) -> usize {
        self.buf.len() + self.header.map_or(0, |_| 5)
    }
}
