//! Fixed-size connection pool with reconnect and health checks.

use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{Notify, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::config::Config;
use crate::conn::Connection;
use crate::error::{Error, Result};

/// Pool options: connection options plus the pool-specific knobs.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub conn: Config,

    /// Target number of live connections.
    pub size: usize,

    /// Ceiling for the exponential reconnect backoff.
    /// Default: 30 seconds
    pub max_retry_interval: Duration,

    /// When set, idle connections are probed with `SELECT 1` at this
    /// interval; failures evict (and replace) the connection.
    pub heartbeat_interval: Option<Duration>,
}

impl PoolConfig {
    pub fn new(conn: Config, size: usize) -> Self {
        Self {
            conn,
            size,
            max_retry_interval: Duration::from_secs(30),
            heartbeat_interval: None,
        }
    }

    pub fn max_retry_interval(mut self, interval: Duration) -> Self {
        self.max_retry_interval = interval;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }
}

/// A fixed-size set of connections multiplexed across callers.
///
/// `acquire` hands out the least-loaded live connection; dead connections
/// are replaced in the background with exponential backoff.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    cfg: PoolConfig,
    state: Mutex<PoolState>,
    /// Signalled on every release so `close` can wait for lent handles.
    released: Notify,
    opened: AtomicBool,
}

struct PoolState {
    available: Vec<Connection>,
    lent: usize,
    waiters: VecDeque<oneshot::Sender<Connection>>,
    failed_connects: u32,
    closed: bool,
}

impl Pool {
    pub fn new(cfg: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                cfg,
                state: Mutex::new(PoolState {
                    available: Vec::new(),
                    lent: 0,
                    waiters: VecDeque::new(),
                    failed_connects: 0,
                    closed: false,
                }),
                released: Notify::new(),
                opened: AtomicBool::new(false),
            }),
        }
    }

    /// Open the target number of connections concurrently.
    ///
    /// Connections that open successfully join the live set immediately;
    /// failures count toward the backoff and are retried in the background,
    /// so a pool can come up against a briefly unreachable server.
    pub async fn open(&self) -> Result<()> {
        if self.inner.opened.swap(true, Ordering::AcqRel) {
            return Err(Error::Config("pool is already open".into()));
        }

        let mut attempts = JoinSet::new();
        for _ in 0..self.inner.cfg.size {
            let cfg = self.inner.cfg.conn.clone();
            attempts.spawn(Connection::connect(cfg));
        }

        while let Some(outcome) = attempts.join_next().await {
            match outcome {
                Ok(Ok(conn)) => self.inner.adopt(conn),
                Ok(Err(err)) => {
                    warn!(%err, "pool connection failed to open");
                    self.inner.lock().failed_connects += 1;
                    self.inner.spawn_replacement();
                }
                Err(join_err) => {
                    warn!(%join_err, "pool connect task aborted");
                    self.inner.lock().failed_connects += 1;
                    self.inner.spawn_replacement();
                }
            }
        }

        if let Some(interval) = self.inner.cfg.heartbeat_interval {
            self.inner.spawn_heartbeat(interval);
        }
        Ok(())
    }

    /// Acquire a connection, waiting until one is released if the pool is
    /// fully lent out.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        self.acquire_inner(None).await
    }

    /// Acquire with a wait budget; expiry removes the waiter and fails
    /// with a timeout error.
    pub async fn acquire_timeout(&self, limit: Duration) -> Result<PooledConnection> {
        self.acquire_inner(Some(limit)).await
    }

    async fn acquire_inner(&self, limit: Option<Duration>) -> Result<PooledConnection> {
        let completion = {
            let mut state = self.inner.lock();
            if state.closed {
                return Err(Error::pool_closed());
            }
            state.available.retain(|conn| !conn.is_closed());
            if let Some(index) = least_loaded(&state.available) {
                let conn = state.available.swap_remove(index);
                state.lent += 1;
                return Ok(PooledConnection {
                    conn: Some(conn),
                    pool: Arc::clone(&self.inner),
                });
            }
            let (handoff, completion) = oneshot::channel();
            state.waiters.push_back(handoff);
            completion
        };

        let conn = match limit {
            None => completion.await.map_err(|_| Error::pool_closed())?,
            Some(limit) => match tokio::time::timeout(limit, completion).await {
                Ok(Ok(conn)) => conn,
                Ok(Err(_)) => return Err(Error::pool_closed()),
                // Dropping the receiver is the waiter removing itself; a
                // later handoff to it fails and moves on.
                Err(_) => {
                    return Err(Error::Timeout(
                        "Timed out waiting for a pool connection".into(),
                    ));
                }
            },
        };
        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
        })
    }

    /// Close the pool: fail new acquires, wait for lent connections to be
    /// released, then close everything.
    pub async fn close(&self) {
        {
            let mut state = self.inner.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            // Dropping the handoff ends pending acquires with a pool-closed
            // error.
            state.waiters.clear();
        }

        loop {
            let released = self.inner.released.notified();
            if self.inner.lock().lent == 0 {
                break;
            }
            released.await;
        }

        let available = std::mem::take(&mut self.inner.lock().available);
        for conn in available {
            conn.close().await;
        }
    }

    /// Live connections currently available for acquisition.
    pub fn idle_connections(&self) -> usize {
        self.inner.lock().available.len()
    }
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Register a live connection: watch for its death, then hand it to a
    /// waiter or the available set.
    fn adopt(self: &Arc<Self>, conn: Connection) {
        let inner = Arc::clone(self);
        let watched = conn.clone();
        tokio::spawn(async move {
            watched.done().await;
            inner.on_lost(&watched);
        });
        self.deliver(conn);
    }

    fn deliver(self: &Arc<Self>, mut conn: Connection) {
        let mut state = self.lock();
        if state.closed {
            drop(state);
            tokio::spawn(async move { conn.close().await });
            return;
        }
        while let Some(waiter) = state.waiters.pop_front() {
            match waiter.send(conn) {
                Ok(()) => {
                    state.lent += 1;
                    return;
                }
                // Waiter timed out and removed itself.
                Err(returned) => conn = returned,
            }
        }
        state.available.push(conn);
    }

    fn on_lost(self: &Arc<Self>, conn: &Connection) {
        let closed = {
            let mut state = self.lock();
            state.available.retain(|c| !c.same_as(conn));
            state.closed
        };
        if !closed {
            debug!("pool connection lost, scheduling replacement");
            self.spawn_replacement();
        }
    }

    /// Replace a dead connection after the backoff delay, retrying until
    /// the pool closes.
    fn spawn_replacement(self: &Arc<Self>) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let delay = {
                    let state = inner.lock();
                    if state.closed {
                        return;
                    }
                    retry_delay(
                        state.failed_connects,
                        inner.cfg.size,
                        inner.cfg.max_retry_interval,
                    )
                };
                tokio::time::sleep(delay).await;
                if inner.is_closed() {
                    return;
                }

                match Connection::connect(inner.cfg.conn.clone()).await {
                    Ok(conn) => {
                        inner.lock().failed_connects = 0;
                        inner.adopt(conn);
                        return;
                    }
                    Err(err) => {
                        warn!(%err, "pool reconnect failed");
                        inner.lock().failed_connects += 1;
                    }
                }
            }
        });
    }

    fn spawn_heartbeat(self: &Arc<Self>, interval: Duration) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if inner.is_closed() {
                    return;
                }
                let conns: Vec<Connection> = inner.lock().available.to_vec();
                for conn in conns {
                    if conn.execute("SELECT 1", &[]).await.is_err() && !conn.is_closed() {
                        warn!("pool heartbeat failed, evicting connection");
                        conn.close().await;
                    }
                }
            }
        });
    }

    fn release(self: &Arc<Self>, conn: Connection) {
        {
            let mut state = self.lock();
            state.lent = state.lent.saturating_sub(1);
        }
        self.released.notify_waiters();
        if !conn.is_closed() {
            self.deliver(conn);
        }
    }
}

/// Index of the live connection with the smallest pending-queue length.
fn least_loaded(conns: &[Connection]) -> Option<usize> {
    conns
        .iter()
        .enumerate()
        .min_by_key(|(_, conn)| conn.pending_queries())
        .map(|(index, _)| index)
}

/// Backoff before a reconnect attempt: `min(2^(failed / size) ms, cap)`.
/// `failed` accumulates across consecutive failures, so the delay grows
/// exponentially with whole rounds of failed replacements.
fn retry_delay(failed: u32, size: usize, cap: Duration) -> Duration {
    let size = size.max(1) as u32;
    let exponent = (failed / size).min(63);
    let millis = Duration::from_millis(1u64 << exponent);
    millis.min(cap)
}

/// A pooled connection handle; returns the connection on drop.
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<PoolInner>,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection").finish()
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn
            .as_ref()
            .unwrap_or_else(|| unreachable!("connection taken before drop"))
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_grows_per_round_of_failures() {
        let cap = Duration::from_secs(30);
        assert_eq!(retry_delay(0, 5, cap), Duration::from_millis(1));
        assert_eq!(retry_delay(4, 5, cap), Duration::from_millis(1));
        assert_eq!(retry_delay(5, 5, cap), Duration::from_millis(2));
        assert_eq!(retry_delay(50, 5, cap), Duration::from_millis(1024));
    }

    #[test]
    fn retry_delay_is_capped() {
        let cap = Duration::from_millis(250);
        assert_eq!(retry_delay(1000, 2, cap), cap);
        // Huge failure counts must not overflow the shift.
        assert_eq!(retry_delay(u32::MAX, 1, cap), cap);
    }

    #[test]
    fn pool_config_defaults() {
        let cfg = PoolConfig::new(Config::new("localhost", 5432, "dart_test"), 4);
        assert_eq!(cfg.size, 4);
        assert_eq!(cfg.max_retry_interval, Duration::from_secs(30));
        assert!(cfg.heartbeat_interval.is_none());
    }
}
