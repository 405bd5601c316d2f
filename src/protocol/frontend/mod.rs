//! PostgreSQL frontend (client → server) messages.

pub mod auth;
pub mod extended;
pub mod simple;
pub mod startup;

pub use auth::{md5_password, write_password, write_sasl_initial_response, write_sasl_response};
pub use extended::{
    EncodedParam, write_bind, write_describe_statement, write_execute, write_parse, write_sync,
};
pub use simple::write_query;
pub use startup::{write_ssl_request, write_startup, write_terminate};

/// Frontend message type bytes.
pub mod msg_type {
    pub const PASSWORD: u8 = b'p';
    pub const QUERY: u8 = b'Q';
    pub const PARSE: u8 = b'P';
    pub const BIND: u8 = b'B';
    pub const DESCRIBE: u8 = b'D';
    pub const EXECUTE: u8 = b'E';
    pub const SYNC: u8 = b'S';
    pub const TERMINATE: u8 = b'X';
}
