//! PostgreSQL backend (server → client) messages.

pub mod auth;
pub mod error;
pub mod query;

pub use auth::{AuthRequest, Notification};
pub use query::FieldDescription;

use crate::error::{Result, ServerError};
use crate::protocol::types::{Oid, TransactionStatus};

/// Backend message type bytes.
pub mod msg_type {
    pub const AUTHENTICATION: u8 = b'R';
    pub const BACKEND_KEY_DATA: u8 = b'K';
    pub const PARAMETER_STATUS: u8 = b'S';
    pub const READY_FOR_QUERY: u8 = b'Z';
    pub const ROW_DESCRIPTION: u8 = b'T';
    pub const DATA_ROW: u8 = b'D';
    pub const COMMAND_COMPLETE: u8 = b'C';
    pub const EMPTY_QUERY_RESPONSE: u8 = b'I';
    pub const ERROR_RESPONSE: u8 = b'E';
    pub const NOTICE_RESPONSE: u8 = b'N';
    pub const NOTIFICATION_RESPONSE: u8 = b'A';
    pub const PARSE_COMPLETE: u8 = b'1';
    pub const BIND_COMPLETE: u8 = b'2';
    pub const CLOSE_COMPLETE: u8 = b'3';
    pub const PARAMETER_DESCRIPTION: u8 = b't';
    pub const NO_DATA: u8 = b'n';
}

/// A parsed message from the PostgreSQL backend.
///
/// The framer produces these in stream order. Unrecognized type codes become
/// [`BackendMessage::Unknown`] so the connection can log and skip them.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendMessage {
    Authentication(AuthRequest),
    ParameterStatus { name: String, value: String },
    BackendKeyData { process_id: u32, secret_key: u32 },
    ReadyForQuery(TransactionStatus),
    RowDescription(Vec<FieldDescription>),
    DataRow(Vec<Option<Vec<u8>>>),
    CommandComplete { rows_affected: u64 },
    EmptyQueryResponse,
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    ParameterDescription(Vec<Oid>),
    Error(ServerError),
    Notice(ServerError),
    Notification(Notification),
    Unknown { code: u8, payload: Vec<u8> },
}

impl BackendMessage {
    /// Construct the typed message for a complete frame.
    pub fn parse(code: u8, payload: &[u8]) -> Result<Self> {
        Ok(match code {
            msg_type::AUTHENTICATION => {
                BackendMessage::Authentication(AuthRequest::parse(payload)?)
            }
            msg_type::PARAMETER_STATUS => {
                let (name, value) = auth::parse_parameter_status(payload)?;
                BackendMessage::ParameterStatus { name, value }
            }
            msg_type::BACKEND_KEY_DATA => {
                let (process_id, secret_key) = auth::parse_backend_key(payload)?;
                BackendMessage::BackendKeyData {
                    process_id,
                    secret_key,
                }
            }
            msg_type::READY_FOR_QUERY => {
                BackendMessage::ReadyForQuery(auth::parse_ready_for_query(payload)?)
            }
            msg_type::ROW_DESCRIPTION => {
                BackendMessage::RowDescription(query::parse_row_description(payload)?)
            }
            msg_type::DATA_ROW => BackendMessage::DataRow(query::parse_data_row(payload)?),
            msg_type::COMMAND_COMPLETE => BackendMessage::CommandComplete {
                rows_affected: query::parse_command_complete(payload)?,
            },
            msg_type::EMPTY_QUERY_RESPONSE => BackendMessage::EmptyQueryResponse,
            msg_type::PARSE_COMPLETE => BackendMessage::ParseComplete,
            msg_type::BIND_COMPLETE => BackendMessage::BindComplete,
            msg_type::CLOSE_COMPLETE => BackendMessage::CloseComplete,
            msg_type::NO_DATA => BackendMessage::NoData,
            msg_type::PARAMETER_DESCRIPTION => {
                BackendMessage::ParameterDescription(query::parse_parameter_description(payload)?)
            }
            msg_type::ERROR_RESPONSE => BackendMessage::Error(error::parse_fields(payload)?),
            msg_type::NOTICE_RESPONSE => BackendMessage::Notice(error::parse_fields(payload)?),
            msg_type::NOTIFICATION_RESPONSE => {
                BackendMessage::Notification(Notification::parse(payload)?)
            }
            _ => BackendMessage::Unknown {
                code,
                payload: payload.to_vec(),
            },
        })
    }
}
