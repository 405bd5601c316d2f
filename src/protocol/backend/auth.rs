//! Startup- and authentication-phase backend messages.

use crate::error::{Error, Result};
use crate::protocol::codec::{get_cstr, get_i32, get_u32};
use crate::protocol::types::TransactionStatus;

/// Authentication request type constants.
pub mod auth_type {
    pub const OK: i32 = 0;
    pub const CLEARTEXT_PASSWORD: i32 = 3;
    pub const MD5_PASSWORD: i32 = 5;
    pub const SASL: i32 = 10;
    pub const SASL_CONTINUE: i32 = 11;
    pub const SASL_FINAL: i32 = 12;
}

/// Authentication request from the server (message type `'R'`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthRequest {
    /// Authentication successful
    Ok,
    /// Cleartext password required
    CleartextPassword,
    /// MD5 password required, with the 4-byte salt
    Md5Password { salt: [u8; 4] },
    /// SASL authentication required, with the offered mechanisms
    Sasl { mechanisms: Vec<String> },
    /// SASL server-first-message
    SaslContinue { data: Vec<u8> },
    /// SASL server-final-message
    SaslFinal { data: Vec<u8> },
}

impl AuthRequest {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let (kind, rest) = get_i32(payload)?;

        match kind {
            auth_type::OK => Ok(AuthRequest::Ok),
            auth_type::CLEARTEXT_PASSWORD => Ok(AuthRequest::CleartextPassword),
            auth_type::MD5_PASSWORD => {
                let salt: [u8; 4] = rest
                    .get(..4)
                    .and_then(|b| b.try_into().ok())
                    .ok_or_else(|| Error::Protocol("Md5Password: missing salt".into()))?;
                Ok(AuthRequest::Md5Password { salt })
            }
            auth_type::SASL => {
                let mut mechanisms = Vec::new();
                let mut data = rest;
                while !data.is_empty() && data[0] != 0 {
                    let (mechanism, remaining) = get_cstr(data)?;
                    mechanisms.push(mechanism.to_string());
                    data = remaining;
                }
                Ok(AuthRequest::Sasl { mechanisms })
            }
            auth_type::SASL_CONTINUE => Ok(AuthRequest::SaslContinue {
                data: rest.to_vec(),
            }),
            auth_type::SASL_FINAL => Ok(AuthRequest::SaslFinal {
                data: rest.to_vec(),
            }),
            other => Err(Error::Protocol(format!(
                "unsupported authentication request: {other}"
            ))),
        }
    }
}

/// Parse a BackendKeyData payload into (process id, secret key).
pub fn parse_backend_key(payload: &[u8]) -> Result<(u32, u32)> {
    let (process_id, rest) = get_u32(payload)?;
    let (secret_key, _) = get_u32(rest)?;
    Ok((process_id, secret_key))
}

/// Parse a ParameterStatus payload into (name, value).
pub fn parse_parameter_status(payload: &[u8]) -> Result<(String, String)> {
    let (name, rest) = get_cstr(payload)?;
    let (value, _) = get_cstr(rest)?;
    Ok((name.to_string(), value.to_string()))
}

/// Parse a ReadyForQuery payload into the transaction status.
pub fn parse_ready_for_query(payload: &[u8]) -> Result<TransactionStatus> {
    match payload.first() {
        Some(&status) => TransactionStatus::from_byte(status).ok_or_else(|| {
            Error::Protocol(format!("ReadyForQuery: unknown status {:?}", status as char))
        }),
        None => Err(Error::Protocol("ReadyForQuery: empty payload".into())),
    }
}

/// Asynchronous notification delivered by `LISTEN`/`NOTIFY`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// PID of the notifying backend process
    pub process_id: u32,
    /// Channel name
    pub channel: String,
    /// Notification payload
    pub payload: String,
}

impl Notification {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let (process_id, rest) = get_u32(payload)?;
        let (channel, rest) = get_cstr(rest)?;
        let (body, _) = get_cstr(rest)?;
        Ok(Self {
            process_id,
            channel: channel.to_string(),
            payload: body.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_ok() {
        assert_eq!(
            AuthRequest::parse(&0_i32.to_be_bytes()).unwrap(),
            AuthRequest::Ok
        );
    }

    #[test]
    fn auth_md5_carries_salt() {
        let mut payload = 5_i32.to_be_bytes().to_vec();
        payload.extend_from_slice(&[1, 2, 3, 4]);
        assert_eq!(
            AuthRequest::parse(&payload).unwrap(),
            AuthRequest::Md5Password { salt: [1, 2, 3, 4] }
        );
    }

    #[test]
    fn auth_sasl_mechanisms() {
        let mut payload = 10_i32.to_be_bytes().to_vec();
        payload.extend_from_slice(b"SCRAM-SHA-256\0");
        payload.push(0);
        let AuthRequest::Sasl { mechanisms } = AuthRequest::parse(&payload).unwrap() else {
            panic!("expected Sasl");
        };
        assert_eq!(mechanisms, vec!["SCRAM-SHA-256"]);
    }

    #[test]
    fn backend_key() {
        let mut payload = 1234_u32.to_be_bytes().to_vec();
        payload.extend_from_slice(&5678_u32.to_be_bytes());
        assert_eq!(parse_backend_key(&payload).unwrap(), (1234, 5678));
    }

    #[test]
    fn ready_for_query_status() {
        assert_eq!(
            parse_ready_for_query(b"I").unwrap(),
            TransactionStatus::Idle
        );
        assert_eq!(
            parse_ready_for_query(b"T").unwrap(),
            TransactionStatus::InTransaction
        );
        assert!(parse_ready_for_query(b"?").is_err());
    }

    #[test]
    fn notification_fields() {
        let mut payload = 42_u32.to_be_bytes().to_vec();
        payload.extend_from_slice(b"events\0hello\0");
        let n = Notification::parse(&payload).unwrap();
        assert_eq!(n.process_id, 42);
        assert_eq!(n.channel, "events");
        assert_eq!(n.payload, "hello");
    }
}
