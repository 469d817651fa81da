//! Async client for sqlizator, a SQL server speaking MessagePack over TCP.
//!
//! ```no_run
//! use sqlizator_client::{Backend, SqlizatorBackend, Value};
//!
//! # async fn run() -> sqlizator_client::Result<()> {
//! let backend = SqlizatorBackend::from_url("sqlizator://localhost:8000/library?maxsize=10")?;
//! backend
//!     .execute("INSERT INTO books (title) VALUES (?)", &[Value::from("Dune")])
//!     .await?;
//! let rows = backend.fetchall("SELECT * FROM books", &[]).await?;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod error;
pub mod sqlizator;

pub use backend::{Backend, BackendKind, PooledRows, SqlizatorBackend};
pub use error::{Error, Result, TransportError};
pub use sqlizator::{
    BoxFuture, Connection, ConnectionConfig, Pool, PoolConfig, PooledConnection, Row, Rows,
    StatusCode, TypeRegistry, Value,
};
