//! Transaction context handed to `Connection::transaction` blocks.

use crate::error::{Error, Result};
use crate::query::{QueryOutput, Row};
use crate::value::PgValue;

use super::Connection;

/// How a transaction block ended.
#[derive(Debug, PartialEq)]
pub enum TxOutcome<T> {
    /// The block returned a value and `COMMIT` succeeded.
    Committed(T),
    /// The block cancelled itself; `ROLLBACK` was issued. Not an error.
    RolledBack(String),
}

impl<T> TxOutcome<T> {
    /// The committed value, if the block committed.
    pub fn committed(self) -> Option<T> {
        match self {
            TxOutcome::Committed(value) => Some(value),
            TxOutcome::RolledBack(_) => None,
        }
    }
}

/// Handle for issuing queries inside a transaction block.
///
/// Queries routed through this handle are pulled from the transaction's own
/// FIFO while the connection is in the transaction, keeping them ordered
/// against the enclosing `BEGIN`/`COMMIT`.
#[derive(Debug)]
pub struct Transaction {
    pub(crate) conn: Connection,
    pub(crate) id: u64,
}

impl Transaction {
    /// Extended-path query inside the transaction.
    pub async fn query(&self, sql: &str, params: &[(&str, PgValue)]) -> Result<Vec<Row>> {
        match self
            .conn
            .run(sql, params, false, true, Some(self.id), false, false)
            .await?
        {
            QueryOutput::Rows(rows) => Ok(rows),
            QueryOutput::Affected(_) => Ok(Vec::new()),
        }
    }

    /// Simple-path statement inside the transaction, returning the
    /// affected-row count.
    pub async fn execute(&self, sql: &str, params: &[(&str, PgValue)]) -> Result<u64> {
        match self
            .conn
            .run(sql, params, true, true, Some(self.id), false, false)
            .await?
        {
            QueryOutput::Affected(count) => Ok(count),
            QueryOutput::Rows(rows) => Ok(rows.len() as u64),
        }
    }

    /// Cancel the transaction: return the produced error from the block and
    /// the enclosing [`Connection::transaction`] resolves with
    /// [`TxOutcome::RolledBack`] instead of failing.
    pub fn cancel(&self, reason: impl Into<String>) -> Error {
        Error::Rollback(reason.into())
    }
}
