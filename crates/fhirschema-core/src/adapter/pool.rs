//! Blocking connection pool shared by scheduler workers and the lease heartbeat.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::connection::{Connection, ConnectionFactory};
use crate::error::{Error, Result};

/// Connections reserved on top of the worker count so the lease heartbeat
/// always finds a free connection.
pub const POOL_HEADROOM: usize = 2;

/// Default time to wait for a free connection.
pub const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 60;

/// Configuration for the connection pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of open connections.
    pub max_connections: usize,
    /// Timeout for acquiring a connection from the pool.
    pub acquire_timeout: Duration,
}

impl PoolConfig {
    /// Create a pool configuration.
    pub fn new(max_connections: usize) -> Self {
        Self {
            max_connections: max_connections.max(1),
            acquire_timeout: Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
        }
    }

    /// Size a pool for `workers` scheduler threads.
    ///
    /// The requested size is raised to `workers + POOL_HEADROOM` when smaller.
    pub fn for_workers(workers: usize, requested: usize) -> Self {
        let minimum = workers.max(1) + POOL_HEADROOM;
        if requested < minimum {
            tracing::info!(
                requested,
                minimum,
                "raising connection pool size above worker count"
            );
        }
        Self::new(requested.max(minimum))
    }

    /// Set the acquire timeout.
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new(1 + POOL_HEADROOM)
    }
}

struct PoolState {
    idle: Vec<Box<dyn Connection>>,
    open: usize,
}

struct PoolInner {
    factory: Arc<dyn ConnectionFactory>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl PoolInner {
    fn release(&self, mut conn: Box<dyn Connection>) {
        if conn.in_transaction() {
            if let Err(e) = conn.rollback() {
                tracing::warn!(error = %e, "discarding connection after failed rollback");
                self.discard();
                return;
            }
        }

        if !conn.is_healthy() {
            self.discard();
            return;
        }

        let mut state = self.state.lock();
        state.idle.push(conn);
        drop(state);
        self.available.notify_one();
    }

    fn discard(&self) {
        let mut state = self.state.lock();
        state.open = state.open.saturating_sub(1);
        drop(state);
        self.available.notify_one();
    }
}

/// A pool of blocking connections.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ConnectionPool")
            .field("target", &self.inner.factory.describe())
            .field("max_connections", &self.inner.config.max_connections)
            .field("open", &state.open)
            .field("idle", &state.idle.len())
            .finish()
    }
}

impl ConnectionPool {
    /// Create a pool. No connection is opened until the first acquire.
    pub fn new(factory: Arc<dyn ConnectionFactory>, config: PoolConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                factory,
                config,
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    open: 0,
                }),
                available: Condvar::new(),
            }),
        }
    }

    /// Maximum number of open connections.
    pub fn max_connections(&self) -> usize {
        self.inner.config.max_connections
    }

    /// Number of currently open connections (idle plus checked out).
    pub fn open_connections(&self) -> usize {
        self.inner.state.lock().open
    }

    /// Acquire a connection, waiting up to the configured timeout.
    pub fn acquire(&self) -> Result<PooledConnection> {
        let deadline = Instant::now() + self.inner.config.acquire_timeout;
        let mut state = self.inner.state.lock();

        loop {
            if let Some(conn) = state.idle.pop() {
                return Ok(PooledConnection {
                    conn: Some(conn),
                    pool: Arc::clone(&self.inner),
                });
            }

            if state.open < self.inner.config.max_connections {
                state.open += 1;
                drop(state);
                return match self.inner.factory.connect() {
                    Ok(conn) => Ok(PooledConnection {
                        conn: Some(conn),
                        pool: Arc::clone(&self.inner),
                    }),
                    Err(e) => {
                        self.inner.discard();
                        Err(e)
                    }
                };
            }

            if self
                .inner
                .available
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return Err(Error::DatabaseNotReady(format!(
                    "timed out after {:?} waiting for one of {} connections to {}",
                    self.inner.config.acquire_timeout,
                    self.inner.config.max_connections,
                    self.inner.factory.describe()
                )));
            }
        }
    }
}

/// A pooled connection that returns itself to the pool when dropped.
///
/// An open transaction is rolled back on return.
pub struct PooledConnection {
    conn: Option<Box<dyn Connection>>,
    pool: Arc<PoolInner>,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("target", &self.pool.factory.describe())
            .finish_non_exhaustive()
    }
}

impl Deref for PooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        self.conn
            .as_deref()
            .expect("pooled connection is present until dropped")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn
            .as_deref_mut()
            .expect("pooled connection is present until dropped")
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
    use crate::adapter::value::{DbRow, DbValue};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullConnection {
        in_tx: bool,
    }

    impl Connection for NullConnection {
        fn execute(&mut self, _sql: &str, _params: &[DbValue]) -> Result<u64> {
            Ok(0)
        }

        fn query(&mut self, _sql: &str, _params: &[DbValue]) -> Result<Vec<DbRow>> {
            Ok(Vec::new())
        }

        fn begin(&mut self) -> Result<()> {
            self.in_tx = true;
            Ok(())
        }

        fn commit(&mut self) -> Result<()> {
            self.in_tx = false;
            Ok(())
        }

        fn rollback(&mut self) -> Result<()> {
            self.in_tx = false;
            Ok(())
        }

        fn in_transaction(&self) -> bool {
            self.in_tx
        }
    }

    #[derive(Default)]
    struct CountingFactory {
        opened: AtomicUsize,
    }

    impl ConnectionFactory for CountingFactory {
        fn connect(&self) -> Result<Box<dyn Connection>> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(NullConnection { in_tx: false }))
        }

        fn describe(&self) -> String {
            "null".to_string()
        }
    }

    #[test]
    fn test_pool_reuses_connections() {
        let factory = Arc::new(CountingFactory::default());
        let pool = ConnectionPool::new(factory.clone(), PoolConfig::new(2));

        drop(pool.acquire().unwrap());
        drop(pool.acquire().unwrap());

        assert_eq!(factory.opened.load(Ordering::SeqCst), 1);
        assert_eq!(pool.open_connections(), 1);
    }

    #[test]
    fn test_pool_times_out_when_exhausted() {
        let factory = Arc::new(CountingFactory::default());
        let config = PoolConfig::new(1).with_acquire_timeout(Duration::from_millis(50));
        let pool = ConnectionPool::new(factory, config);

        let _held = pool.acquire().unwrap();
        let err = pool.acquire().unwrap_err();
        assert!(matches!(err, Error::DatabaseNotReady(_)));
    }

    #[test]
    fn test_open_transaction_rolled_back_on_return() {
        let factory = Arc::new(CountingFactory::default());
        let pool = ConnectionPool::new(factory, PoolConfig::new(1));

        {
            let mut conn = pool.acquire().unwrap();
            conn.begin().unwrap();
        }

        let conn = pool.acquire().unwrap();
        assert!(!conn.in_transaction());
    }

    #[test]
    fn test_for_workers_adds_headroom() {
        assert_eq!(PoolConfig::for_workers(4, 1).max_connections, 4 + POOL_HEADROOM);
        assert_eq!(PoolConfig::for_workers(4, 20).max_connections, 20);
    }
}
