//! Connection facade: public operations over the connection engine task.

mod state;
mod stream;
mod task;
mod transaction;

pub use transaction::{Transaction, TxOutcome};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::protocol::backend::{FieldDescription, Notification};
use crate::query::{Query, QueryOutput, Row};
use crate::value::PgValue;

use task::{Command, ConnectionTask};

/// Capacity of the notification broadcast; a subscriber that lags beyond
/// this loses the oldest notifications.
const NOTIFICATION_BUFFER: usize = 128;

/// State shared between the facade handles and the engine task.
pub(crate) struct Shared {
    pub cmd_tx: mpsc::UnboundedSender<Command>,
    pub notify_tx: broadcast::Sender<Notification>,
    pub done_rx: watch::Receiver<bool>,
    /// Queries enqueued but not yet completed; the pool's load metric.
    pub pending: AtomicUsize,
    /// Set by the first `open()`; a connection is single-use.
    pub opened: AtomicBool,
    pub tx_counter: AtomicU64,
    pub settings: Mutex<HashMap<String, String>>,
    pub process_id: AtomicU32,
    pub secret_key: AtomicU32,
}

impl Shared {
    pub fn set_setting(&self, name: String, value: String) {
        self.settings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, value);
    }
}

/// An asynchronous PostgreSQL connection.
///
/// Cheap to clone; all clones drive the same underlying socket task. The
/// connection is single-use: once closed, it cannot be reopened.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// Create a connection in the closed state. Call [`open`](Self::open)
    /// to connect; queries enqueued before `open` completes simply wait.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: Config) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (notify_tx, _) = broadcast::channel(NOTIFICATION_BUFFER);
        let (done_tx, done_rx) = watch::channel(false);

        let shared = Arc::new(Shared {
            cmd_tx,
            notify_tx,
            done_rx,
            pending: AtomicUsize::new(0),
            opened: AtomicBool::new(false),
            tx_counter: AtomicU64::new(0),
            settings: Mutex::new(HashMap::new()),
            process_id: AtomicU32::new(0),
            secret_key: AtomicU32::new(0),
        });

        let task = ConnectionTask::new(config, Arc::clone(&shared), cmd_rx, done_tx);
        tokio::spawn(task.run());

        Self { shared }
    }

    /// Create and open a connection in one step.
    pub async fn connect(config: Config) -> Result<Self> {
        let conn = Self::new(config);
        conn.open().await?;
        Ok(conn)
    }

    /// Connect and authenticate. Single-shot: succeeds at most once, and
    /// any further call fails permanently.
    pub async fn open(&self) -> Result<()> {
        if self.shared.opened.swap(true, Ordering::AcqRel) {
            return Err(Error::reopen());
        }
        let (reply, completion) = oneshot::channel();
        self.shared
            .cmd_tx
            .send(Command::Open { reply })
            .map_err(|_| Error::reopen())?;
        completion.await.map_err(|_| Error::closed())?
    }

    /// Run a statement on the simple-query path and return the number of
    /// affected rows. Parameters are inlined as SQL literals.
    pub async fn execute(&self, sql: &str, params: &[(&str, PgValue)]) -> Result<u64> {
        match self.run(sql, params, true, true, None, false, false).await? {
            QueryOutput::Affected(count) => Ok(count),
            QueryOutput::Rows(rows) => Ok(rows.len() as u64),
        }
    }

    /// Run a statement on the extended path and return the decoded rows,
    /// using (and filling) the prepared-statement reuse cache.
    pub async fn query(&self, sql: &str, params: &[(&str, PgValue)]) -> Result<Vec<Row>> {
        self.query_with(sql, params, true).await
    }

    /// Like [`query`](Self::query), with explicit control over reuse.
    pub async fn query_with(
        &self,
        sql: &str,
        params: &[(&str, PgValue)],
        allow_reuse: bool,
    ) -> Result<Vec<Row>> {
        match self
            .run(sql, params, false, allow_reuse, None, false, false)
            .await?
        {
            QueryOutput::Rows(rows) => Ok(rows),
            QueryOutput::Affected(_) => Ok(Vec::new()),
        }
    }

    /// Run `block` inside a transaction.
    ///
    /// `BEGIN` is enqueued first; the block then issues queries through the
    /// provided [`Transaction`] handle. A block returning `Ok` commits; a
    /// block returning the error from [`Transaction::cancel`] rolls back
    /// and resolves with [`TxOutcome::RolledBack`]; any other error rolls
    /// back and propagates.
    pub async fn transaction<F, Fut, T>(&self, block: F) -> Result<TxOutcome<T>>
    where
        F: FnOnce(Transaction) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let id = self.shared.tx_counter.fetch_add(1, Ordering::AcqRel) + 1;
        self.run("BEGIN", &[], true, true, Some(id), true, true)
            .await?;

        let tx = Transaction {
            conn: self.clone(),
            id,
        };
        match block(tx).await {
            Ok(value) => {
                self.run("COMMIT", &[], true, true, Some(id), false, true)
                    .await?;
                Ok(TxOutcome::Committed(value))
            }
            Err(Error::Rollback(reason)) => {
                self.run("ROLLBACK", &[], true, true, Some(id), false, true)
                    .await?;
                Ok(TxOutcome::RolledBack(reason))
            }
            Err(err) => {
                let _ = self
                    .run("ROLLBACK", &[], true, true, Some(id), false, true)
                    .await;
                Err(err)
            }
        }
    }

    /// Close the connection, cancelling every pending query. Idempotent.
    pub async fn close(&self) {
        let _ = self.shared.cmd_tx.send(Command::Close);
        self.done().await;
    }

    /// Resolves once the connection has fully shut down, cleanly or not.
    pub async fn done(&self) {
        let mut done = self.shared.done_rx.clone();
        while !*done.borrow() {
            if done.changed().await.is_err() {
                break;
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.done_rx.borrow()
    }

    /// Subscribe to `LISTEN`/`NOTIFY` notifications, in backend order.
    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.shared.notify_tx.subscribe()
    }

    /// Number of enqueued-but-incomplete queries on this connection.
    pub fn pending_queries(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    /// Snapshot of the server parameter settings reported so far.
    pub fn settings(&self) -> HashMap<String, String> {
        self.shared
            .settings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Backend process ID, once assigned during the handshake.
    pub fn process_id(&self) -> Option<u32> {
        match self.shared.process_id.load(Ordering::Acquire) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Backend key data `(process id, secret key)`, once assigned during
    /// the handshake. Needed to issue an out-of-band CancelRequest.
    pub fn backend_key(&self) -> Option<(u32, u32)> {
        let pid = self.shared.process_id.load(Ordering::Acquire);
        match pid {
            0 => None,
            pid => Some((pid, self.shared.secret_key.load(Ordering::Acquire))),
        }
    }

    /// Resolve the table OIDs of result fields to relation names via
    /// `pg_class`.
    pub async fn resolve_table_names(
        &self,
        fields: &[FieldDescription],
    ) -> Result<HashMap<u32, String>> {
        let mut names = HashMap::new();
        for field in fields {
            if field.table_oid == 0 || names.contains_key(&field.table_oid) {
                continue;
            }
            let rows = self
                .query(
                    "SELECT relname FROM pg_class WHERE oid::int8 = @oid:bigInteger",
                    &[("oid", PgValue::Int8(i64::from(field.table_oid)))],
                )
                .await?;
            if let Some(row) = rows.first()
                && let Some(PgValue::Text(name)) = row.get(0)
            {
                names.insert(field.table_oid, name.clone());
            }
        }
        Ok(names)
    }

    pub(crate) fn same_as(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn run(
        &self,
        sql: &str,
        params: &[(&str, PgValue)],
        only_affected: bool,
        allow_reuse: bool,
        tx: Option<u64>,
        begins_tx: bool,
        tx_control: bool,
    ) -> Result<QueryOutput> {
        let values = params
            .iter()
            .map(|(name, value)| (name.to_string(), value.clone()))
            .collect();
        let (mut query, completion) = Query::new(sql, values, only_affected, allow_reuse);
        query.tx = tx;
        query.begins_tx = begins_tx;
        query.tx_control = tx_control;

        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        if self.shared.cmd_tx.send(Command::Enqueue(query)).is_err() {
            self.shared.pending.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::closed());
        }
        completion.await.map_err(|_| Error::cancelled())?
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("closed", &self.is_closed())
            .field("pending", &self.pending_queries())
            .finish()
    }
}
