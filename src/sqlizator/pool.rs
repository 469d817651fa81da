//! sqlizator connection pool.
//!
//! Connections are created on demand up to a fixed maximum. A connection
//! that failed at the transport or protocol level is never handed out
//! again, and its failure also flushes every idle connection: the server
//! may have restarted underneath all of them.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::connection::{query_param, Connection, ConnectionConfig, Row, Rows};
use super::registry::TypeRegistry;
use super::types::Value;
use crate::error::{Error, Result};

/// Default maximum number of connections.
pub const DEFAULT_MAX_SIZE: usize = 100;

/// A boxed future borrowing from its caller, as returned by transaction
/// bodies.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// ============================================================================
// Pool Configuration
// ============================================================================

/// Connection pool configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PoolConfig {
    /// Parameters for every connection the pool opens
    #[serde(flatten)]
    pub connection: ConnectionConfig,
    /// Maximum number of connections
    #[serde(default = "default_max_size", rename = "maxsize")]
    pub max_size: usize,
}

impl PoolConfig {
    /// Create a new pool configuration.
    pub fn new(connection: ConnectionConfig) -> Self {
        Self {
            connection,
            max_size: DEFAULT_MAX_SIZE,
        }
    }

    /// Set the maximum number of connections.
    pub fn max_size(mut self, max: usize) -> Self {
        self.max_size = max;
        self
    }

    /// Parse a pool URL.
    ///
    /// Format: `sqlizator://host:port/database?maxsize=N&timeout=SECS`
    pub fn from_url(url: &str) -> Result<Self> {
        let connection = ConnectionConfig::from_url(url)?;
        let query = url.split_once('?').map(|(_, q)| q);

        let max_size = match query_param(query, "maxsize") {
            Some(value) => value
                .parse::<usize>()
                .map_err(|_| Error::Config(format!("Expected integer, got {:?}", value)))?,
            None => DEFAULT_MAX_SIZE,
        };

        Ok(Self {
            connection,
            max_size,
        })
    }

    fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(Error::Config("maxsize must be at least 1".to_string()));
        }
        Ok(())
    }
}

fn default_max_size() -> usize {
    DEFAULT_MAX_SIZE
}

// ============================================================================
// Pooled Connection
// ============================================================================

/// A connection checked out from the pool.
///
/// When dropped, a healthy connection goes back to the idle queue. A closed
/// one, or one abandoned halfway through writing a request, is discarded; a
/// broken one is discarded together with every idle connection.
pub struct PooledConnection {
    /// The actual connection (None once handed back)
    conn: Option<Connection>,
    /// Reference back to the pool
    pool: Arc<PoolInner>,
    /// Set between BEGIN and COMMIT/ROLLBACK
    in_transaction: bool,
    /// Semaphore permit (controls pool size)
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Execute a command that returns no rows.
    pub async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<()> {
        self.connection_mut()?.execute(sql, params).await
    }

    /// Execute a query and return a cursor over its rows.
    pub async fn fetch(&mut self, sql: &str, params: &[Value]) -> Result<Rows<'_>> {
        self.connection_mut()?.fetch(sql, params).await
    }

    /// Run `body` inside BEGIN/COMMIT, rolling back if it fails.
    ///
    /// A failing ROLLBACK replaces the body's error. If the body's failure
    /// already closed the connection, no ROLLBACK is attempted.
    pub async fn transaction<T, F>(&mut self, body: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c mut Connection) -> BoxFuture<'c, Result<T>>,
    {
        self.execute("BEGIN", &[]).await?;
        self.in_transaction = true;

        let result = body(self.connection_mut()?).await;

        match result {
            Ok(value) => {
                self.execute("COMMIT", &[]).await?;
                self.in_transaction = false;
                Ok(value)
            }
            Err(err) => {
                if !self.is_closed() {
                    self.execute("ROLLBACK", &[]).await?;
                    self.in_transaction = false;
                }
                Err(err)
            }
        }
    }

    pub fn connection(&self) -> Result<&Connection> {
        self.conn.as_ref().ok_or(Error::ConnectionClosed)
    }

    pub fn connection_mut(&mut self) -> Result<&mut Connection> {
        self.conn.as_mut().ok_or(Error::ConnectionClosed)
    }

    /// Identifier of the underlying connection.
    pub fn id(&self) -> Option<u64> {
        self.conn.as_ref().map(Connection::id)
    }

    pub fn is_closed(&self) -> bool {
        self.conn.as_ref().map(Connection::is_closed).unwrap_or(true)
    }

    /// Check if the connection is healthy.
    pub fn is_healthy(&self) -> bool {
        self.conn
            .as_ref()
            .map(Connection::is_reusable)
            .unwrap_or(false)
    }

    /// Hand the connection back to the pool.
    pub fn release(self) {
        drop(self);
    }

    /// Close the connection instead of returning it to the pool.
    pub fn discard(mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.discard(conn);
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.reclaim(conn, self.in_transaction);
        }
    }
}

// ============================================================================
// Pool Inner
// ============================================================================

/// Internal pool state.
struct PoolInner {
    /// Pool configuration
    config: PoolConfig,
    /// Type registry shared by every connection
    registry: Arc<TypeRegistry>,
    /// Idle connections, oldest first
    idle_connections: Mutex<VecDeque<Connection>>,
    /// Live connections, idle or checked out
    size: AtomicUsize,
    /// Semaphore to limit checked-out connections
    semaphore: Arc<Semaphore>,
}

impl PoolInner {
    fn reclaim(&self, conn: Connection, in_transaction: bool) {
        if conn.is_broken() {
            self.discard(conn);
            self.purge_idle();
        } else if conn.is_closed() {
            self.discard(conn);
        } else if !conn.is_reusable() {
            tracing::warn!(id = conn.id(), "Connection dropped while sending a command");
            self.discard(conn);
        } else if in_transaction {
            tracing::warn!(id = conn.id(), "Connection dropped inside a transaction");
            self.discard(conn);
        } else {
            self.idle_connections.lock().push_back(conn);
        }
    }

    fn discard(&self, conn: Connection) {
        self.size.fetch_sub(1, Ordering::SeqCst);
        tracing::debug!(id = conn.id(), "Discarding connection");
        drop(conn);
    }

    /// Drop every idle connection. Dropping the socket closes it.
    fn purge_idle(&self) {
        let stale = std::mem::take(&mut *self.idle_connections.lock());
        if stale.is_empty() {
            return;
        }

        self.size.fetch_sub(stale.len(), Ordering::SeqCst);
        tracing::warn!(
            count = stale.len(),
            "Closing idle connections after a connection failure"
        );
    }
}

// ============================================================================
// Connection Pool
// ============================================================================

/// A sqlizator connection pool.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Create a new connection pool. No connection is opened until the
    /// first acquire.
    pub fn new(config: PoolConfig, registry: Arc<TypeRegistry>) -> Result<Self> {
        config.validate()?;
        tracing::debug!(
            host = %config.connection.host,
            port = config.connection.port,
            database = %config.connection.database,
            max_size = config.max_size,
            "Creating sqlizator pool"
        );

        let inner = Arc::new(PoolInner {
            semaphore: Arc::new(Semaphore::new(config.max_size)),
            config,
            registry,
            idle_connections: Mutex::new(VecDeque::new()),
            size: AtomicUsize::new(0),
        });

        Ok(Self { inner })
    }

    /// Get a connection from the pool.
    ///
    /// Waits without a deadline while every connection is checked out.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        // Blocks if the pool is exhausted
        let permit = Arc::clone(&self.inner.semaphore)
            .acquire_owned()
            .await
            .map_err(pool_closed)?;

        let idle = self.inner.idle_connections.lock().pop_front();

        let conn = match idle {
            Some(c) => c,
            None => self.create_connection().await?,
        };

        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
            in_transaction: false,
            _permit: permit,
        })
    }

    /// Execute a command on a pooled connection.
    #[tracing::instrument(skip(self, params))]
    pub async fn execute(&self, sql: &str, params: &[Value]) -> Result<()> {
        let mut conn = self.acquire().await?;
        conn.execute(sql, params).await
    }

    /// Execute a query on a pooled connection and read every row.
    #[tracing::instrument(skip(self, params))]
    pub async fn fetch_all(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let mut conn = self.acquire().await?;
        let rows = conn.fetch(sql, params).await?;
        rows.collect_rows().await
    }

    /// Run `body` in a transaction on a pooled connection.
    #[tracing::instrument(skip_all)]
    pub async fn transaction<T, F>(&self, body: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c mut Connection) -> BoxFuture<'c, Result<T>>,
    {
        let mut conn = self.acquire().await?;
        conn.transaction(body).await
    }

    /// Close every idle connection.
    ///
    /// Failures to close are logged and skipped. Checked-out connections are
    /// left alone.
    #[tracing::instrument(skip(self))]
    pub async fn close_all(&self) {
        loop {
            let next = self.inner.idle_connections.lock().pop_front();
            let Some(mut conn) = next else {
                break;
            };

            self.inner.size.fetch_sub(1, Ordering::SeqCst);
            if let Err(e) = conn.close().await {
                tracing::debug!(id = conn.id(), error = %e, "Failed to close idle connection");
            }
        }
    }

    /// Get the current number of idle connections.
    pub fn idle_count(&self) -> usize {
        self.inner.idle_connections.lock().len()
    }

    /// Get the number of live connections, idle or checked out.
    pub fn size(&self) -> usize {
        self.inner.size.load(Ordering::SeqCst)
    }

    pub fn max_size(&self) -> usize {
        self.inner.config.max_size
    }

    /// Get the pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Create a new connection with the pool's configuration.
    async fn create_connection(&self) -> Result<Connection> {
        let slot = ReservedSlot::new(&self.inner.size);
        tracing::debug!(
            size = slot.size(),
            max_size = self.inner.config.max_size,
            "Opening pooled connection"
        );

        let conn =
            Connection::connect(&self.inner.config.connection, Arc::clone(&self.inner.registry))
                .await?;
        slot.fill();
        Ok(conn)
    }
}

/// A place counted in the pool size before its connection exists. Given
/// back unless filled, so a failed or cancelled connect leaves the size
/// unchanged.
struct ReservedSlot<'a> {
    size: &'a AtomicUsize,
    filled: bool,
}

impl<'a> ReservedSlot<'a> {
    fn new(size: &'a AtomicUsize) -> Self {
        size.fetch_add(1, Ordering::SeqCst);
        Self {
            size,
            filled: false,
        }
    }

    fn size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    fn fill(mut self) {
        self.filled = true;
    }
}

impl Drop for ReservedSlot<'_> {
    fn drop(&mut self) {
        if !self.filled {
            self.size.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// The pool never closes its semaphore, so this only guards the API.
fn pool_closed(_: tokio::sync::AcquireError) -> Error {
    Error::ConnectionClosed
}
