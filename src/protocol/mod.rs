//! PostgreSQL v3 wire protocol: message framing, parsing, and serialization.

pub mod backend;
pub mod codec;
pub mod framer;
pub mod frontend;
pub mod types;

pub use backend::{BackendMessage, FieldDescription, Notification};
pub use framer::Framer;
pub use types::{FormatCode, Oid, PgType, TransactionStatus};
