//! Database backend contract and its sqlizator implementation.

use std::str::FromStr;
use std::sync::Arc;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::sqlizator::{
    BoxFuture, Connection, Pool, PoolConfig, PooledConnection, Row, TypeRegistry, Value,
};

/// Operations every database backend provides.
#[allow(async_fn_in_trait)]
pub trait Backend {
    /// Largest number of bound parameters a single statement may carry.
    const MAX_VARIABLE_NUMBER: usize = 999;

    /// Cursor returned by [`Backend::fetchiter`].
    type Rows;

    /// Connection handed to transaction bodies.
    type Connection;

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<()>;

    /// Run `sql` once per parameter set.
    async fn executemany(&self, sql: &str, seq_of_params: &[Vec<Value>]) -> Result<()>;

    async fn executescript(&self, sql: &str) -> Result<()>;

    /// First row of the result, if any.
    async fn fetchone(&self, sql: &str, params: &[Value]) -> Result<Option<Row>>;

    async fn fetchall(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Lazy cursor over the result.
    async fn fetchiter(&self, sql: &str, params: &[Value]) -> Result<Self::Rows>;

    async fn transaction<T, F>(&self, body: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c mut Self::Connection) -> BoxFuture<'c, Result<T>>;

    async fn close(&self);

    /// Drop every open connection and start over.
    async fn recreate(&self) -> Result<()>;
}

/// Known backend implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Sqlizator,
}

impl BackendKind {
    /// Open a backend of this kind.
    pub fn open(self, config: PoolConfig) -> Result<SqlizatorBackend> {
        match self {
            BackendKind::Sqlizator => SqlizatorBackend::new(config),
        }
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self> {
        match name {
            "sqlizator" => Ok(BackendKind::Sqlizator),
            other => Err(Error::Config(format!("Unknown backend: {}", other))),
        }
    }
}

/// Backend talking to a sqlizator server through a connection pool.
#[derive(Clone)]
pub struct SqlizatorBackend {
    pool: Pool,
}

impl SqlizatorBackend {
    /// Create a backend using the default type conversions.
    pub fn new(config: PoolConfig) -> Result<Self> {
        Self::with_registry(config, Arc::new(TypeRegistry::with_defaults()))
    }

    pub fn with_registry(config: PoolConfig, registry: Arc<TypeRegistry>) -> Result<Self> {
        Ok(Self {
            pool: Pool::new(config, registry)?,
        })
    }

    /// Create a backend from a `sqlizator://` URL.
    pub fn from_url(url: &str) -> Result<Self> {
        Self::new(PoolConfig::from_url(url)?)
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

impl Backend for SqlizatorBackend {
    type Rows = PooledRows;
    type Connection = Connection;

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<()> {
        self.pool.execute(sql, params).await
    }

    async fn executemany(&self, sql: &str, seq_of_params: &[Vec<Value>]) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        for params in seq_of_params {
            conn.execute(sql, params).await?;
        }
        Ok(())
    }

    async fn executescript(&self, sql: &str) -> Result<()> {
        self.pool.execute(sql, &[]).await
    }

    async fn fetchone(&self, sql: &str, params: &[Value]) -> Result<Option<Row>> {
        let mut conn = self.pool.acquire().await?;
        let mut rows = conn.fetch(sql, params).await?;
        // The rest of the reply is drained before the connection's next command
        let first = rows.next_row().await;
        first
    }

    async fn fetchall(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.pool.fetch_all(sql, params).await
    }

    async fn fetchiter(&self, sql: &str, params: &[Value]) -> Result<PooledRows> {
        let mut conn = self.pool.acquire().await?;
        conn.fetch(sql, params).await?;
        Ok(PooledRows { conn })
    }

    async fn transaction<T, F>(&self, body: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c mut Connection) -> BoxFuture<'c, Result<T>>,
    {
        self.pool.transaction(body).await
    }

    async fn close(&self) {
        self.pool.close_all().await
    }

    async fn recreate(&self) -> Result<()> {
        // No drop-database command exists on the wire
        self.pool.close_all().await;
        Ok(())
    }
}

/// Row cursor that holds its pooled connection until dropped.
pub struct PooledRows {
    conn: PooledConnection,
}

impl PooledRows {
    /// The next row, or `None` once the reply has terminated.
    pub async fn next_row(&mut self) -> Result<Option<Row>> {
        self.conn.connection_mut()?.next_row().await
    }

    /// Read every remaining row and give the connection back.
    pub async fn collect_rows(mut self) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next_row().await? {
            rows.push(row);
        }
        Ok(rows)
    }
}
