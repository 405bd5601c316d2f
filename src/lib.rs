//! A resilient, asynchronous PostgreSQL client.
//!
//! # Features
//!
//! - **Connection engine**: a single task per connection owns the socket,
//!   reassembles backend messages from the byte stream, and drives the
//!   protocol state machine through authentication, queries, and
//!   transactions
//! - **Queued queries**: at most one query is in flight per connection;
//!   the rest wait in FIFO order and complete in enqueue order
//! - **Prepared-statement reuse**: repeated statements skip Parse after the
//!   server confirms parameter types
//! - **Pooling**: a fixed-size pool with least-loaded selection, optional
//!   heartbeats, and exponential-backoff reconnect
//!
//! # Example
//!
//! ```no_run
//! use steady_postgres::{Config, Connection, PgValue};
//!
//! #[tokio::main]
//! async fn main() -> steady_postgres::Result<()> {
//!     let config = Config::new("localhost", 5432, "dart_test")
//!         .username("postgres")
//!         .password("secret");
//!
//!     let conn = Connection::connect(config).await?;
//!
//!     let rows = conn
//!         .query("SELECT id, name FROM users WHERE id = @id", &[("id", PgValue::Int4(1))])
//!         .await?;
//!     for row in &rows {
//!         println!("{:?}", row.values());
//!     }
//!
//!     conn.close().await;
//!     Ok(())
//! }
//! ```

mod config;
mod conn;
mod pool;
mod query;
mod value;

pub mod conversion;
pub mod protocol;
pub mod substitute;

mod error;

pub use config::Config;
pub use conn::{Connection, Transaction, TxOutcome};
pub use conversion::DecoderRegistry;
pub use error::{Error, Result, ServerError};
pub use pool::{Pool, PoolConfig, PooledConnection};
pub use protocol::backend::{FieldDescription, Notification};
pub use protocol::types::PgType;
pub use query::Row;
pub use substitute::{DefaultSubstitutor, Parameter, Substitutor};
pub use value::PgValue;
