//! Error types for steady-postgres.

use std::collections::HashMap;
use thiserror::Error;

/// Result type for steady-postgres operations.
pub type Result<T> = core::result::Result<T, Error>;

/// PostgreSQL error field type codes.
pub mod field_type {
    pub const SEVERITY: u8 = b'S';
    pub const SEVERITY_V: u8 = b'V';
    pub const CODE: u8 = b'C';
    pub const MESSAGE: u8 = b'M';
    pub const DETAIL: u8 = b'D';
    pub const HINT: u8 = b'H';
    pub const POSITION: u8 = b'P';
    pub const WHERE: u8 = b'W';
    pub const SCHEMA: u8 = b's';
    pub const TABLE: u8 = b't';
    pub const COLUMN: u8 = b'c';
    pub const CONSTRAINT: u8 = b'n';
    pub const FILE: u8 = b'F';
    pub const LINE: u8 = b'L';
    pub const ROUTINE: u8 = b'R';
}

/// Error or notice reported by the PostgreSQL backend.
///
/// Wraps the field map of an `ErrorResponse`/`NoticeResponse` message with
/// typed accessors for the well-known fields.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerError(HashMap<u8, String>);

impl ServerError {
    pub fn new(fields: HashMap<u8, String>) -> Self {
        Self(fields)
    }

    /// Severity (localized): ERROR, FATAL, PANIC, WARNING, NOTICE, DEBUG, INFO, LOG
    pub fn severity(&self) -> &str {
        self.field(field_type::SEVERITY).unwrap_or_default()
    }

    /// Severity (non-localized, never translated)
    pub fn severity_v(&self) -> &str {
        self.field(field_type::SEVERITY_V).unwrap_or_default()
    }

    /// SQLSTATE error code (5 characters)
    pub fn code(&self) -> &str {
        self.field(field_type::CODE).unwrap_or_default()
    }

    /// Primary error message
    pub fn message(&self) -> &str {
        self.field(field_type::MESSAGE).unwrap_or_default()
    }

    /// Detailed error explanation
    pub fn detail(&self) -> Option<&str> {
        self.field(field_type::DETAIL)
    }

    /// Suggestion for fixing the error
    pub fn hint(&self) -> Option<&str> {
        self.field(field_type::HINT)
    }

    /// Cursor position in the query string (1-based)
    pub fn position(&self) -> Option<u32> {
        self.field(field_type::POSITION).and_then(|s| s.parse().ok())
    }

    /// Table name
    pub fn table(&self) -> Option<&str> {
        self.field(field_type::TABLE)
    }

    /// Column name
    pub fn column(&self) -> Option<&str> {
        self.field(field_type::COLUMN)
    }

    /// Constraint name
    pub fn constraint(&self) -> Option<&str> {
        self.field(field_type::CONSTRAINT)
    }

    /// Get a field by its raw type code.
    pub fn field(&self, field_type: u8) -> Option<&str> {
        self.0.get(&field_type).map(|s| s.as_str())
    }

    /// FATAL and PANIC responses terminate the connection.
    pub fn is_fatal(&self) -> bool {
        let sev = if self.severity_v().is_empty() {
            self.severity()
        } else {
            self.severity_v()
        };
        matches!(sev, "FATAL" | "PANIC")
    }
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {} (SQLSTATE {})",
            self.severity(),
            self.message(),
            self.code()
        )?;
        if let Some(detail) = self.detail() {
            write!(f, "\nDETAIL: {}", detail)?;
        }
        if let Some(hint) = self.hint() {
            write!(f, "\nHINT: {}", hint)?;
        }
        Ok(())
    }
}

/// Error type for steady-postgres.
#[derive(Debug, Error)]
pub enum Error {
    /// Error response from the backend
    #[error("PostgreSQL error: {0}")]
    Server(ServerError),

    /// Malformed message or unexpected response; the connection must close
    #[error("protocol error: {0}")]
    Protocol(String),

    /// I/O error on the underlying socket
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The server rejected the credentials during the handshake
    #[error("authentication failed: {0}")]
    Auth(String),

    /// TLS negotiation or handshake error
    #[cfg(feature = "tls")]
    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    /// Connect or handshake exceeded its time budget
    #[error("{0}")]
    Timeout(String),

    /// Operation attempted on a closed connection or pool
    #[error("{0}")]
    Closed(String),

    /// Declared Postgres type disagrees with the runtime value
    #[error("invalid type: {0}")]
    InvalidType(String),

    /// Value bytes or text do not form a valid instance of the type
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// Invalid connection options
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The owning transaction already failed; the query was discarded
    #[error("transaction aborted: {0}")]
    Transaction(String),

    /// Explicit transaction cancellation. Not a failure: `transaction()`
    /// converts this into [`TxOutcome::RolledBack`](crate::TxOutcome).
    #[error("transaction rolled back: {0}")]
    Rollback(String),
}

impl Error {
    pub(crate) fn closed() -> Self {
        Error::Closed("connection is closed".into())
    }

    pub(crate) fn cancelled() -> Self {
        Error::Closed("connection closed or query cancelled".into())
    }

    pub(crate) fn reopen() -> Self {
        Error::Closed("Attempting to reopen a closed connection".into())
    }

    pub(crate) fn pool_closed() -> Self {
        Error::Closed("pool is closed".into())
    }

    /// Returns true if the error means the connection cannot be used again.
    pub fn is_terminal(&self) -> bool {
        match self {
            Error::Io(_) | Error::Protocol(_) | Error::Timeout(_) | Error::Closed(_) => true,
            Error::Server(err) => err.is_fatal(),
            _ => false,
        }
    }

    /// Get the SQLSTATE code if this is a server error.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Server(err) => Some(err.code()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server_error(fields: &[(u8, &str)]) -> ServerError {
        ServerError::new(
            fields
                .iter()
                .map(|(code, value)| (*code, value.to_string()))
                .collect(),
        )
    }

    #[test]
    fn display_includes_message_and_code() {
        let err = server_error(&[
            (field_type::SEVERITY, "ERROR"),
            (field_type::CODE, "23505"),
            (field_type::MESSAGE, "duplicate key value violates unique constraint"),
        ]);
        let text = err.to_string();
        assert!(text.contains("duplicate key"));
        assert!(text.contains("23505"));
    }

    #[test]
    fn fatal_severity() {
        assert!(server_error(&[(field_type::SEVERITY_V, "FATAL")]).is_fatal());
        assert!(server_error(&[(field_type::SEVERITY, "PANIC")]).is_fatal());
        assert!(!server_error(&[(field_type::SEVERITY, "ERROR")]).is_fatal());
    }

    #[test]
    fn canned_errors() {
        assert!(Error::reopen().to_string().contains("Attempting to reopen"));
        assert!(Error::cancelled().to_string().contains("query cancelled"));
        assert!(Error::pool_closed().to_string().contains("pool is closed"));
    }
}
