//! Connection lifecycle phases.

use crate::error::Error;
use crate::query::Query;

/// Where the connection is in its lifecycle.
///
/// The phase advances only on a parsed backend message, a caller command,
/// or a timer. `Closed` is both initial and terminal: a connection is
/// single-use and never reopens.
#[derive(Debug)]
pub(crate) enum Phase {
    /// Initial and terminal. Messages are ignored.
    Closed,
    /// TCP (and optional TLS) established, startup packet sent; waiting for
    /// the authentication request.
    SocketConnected,
    /// Credentials sent (password or an in-progress SASL exchange).
    Authenticating,
    /// AuthenticationOk received without a credential round-trip; draining
    /// settings until ReadyForQuery.
    Authenticated,
    /// Ready to dispatch from the main FIFO.
    Idle,
    /// Exactly one query in flight; accumulating its response group.
    Busy(Box<Query>),
    /// Inside a transaction block; dispatches from the transaction's FIFO.
    ReadyInTransaction,
    /// The transaction block failed; the next awake returns to
    /// `ReadyInTransaction` so the rollback can flow.
    TransactionFailure,
    /// A dispatch-time serialization failure, completed with its error on
    /// the next scheduler tick.
    DeferredFailure {
        query: Box<Query>,
        error: Error,
        in_transaction: bool,
    },
}

impl Phase {
    /// Phases during which the connect/auth handshake is still running.
    pub fn in_handshake(&self) -> bool {
        matches!(
            self,
            Phase::SocketConnected | Phase::Authenticating | Phase::Authenticated
        )
    }
}
