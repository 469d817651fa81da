//! Client for the sqlizator MessagePack-over-TCP protocol.
//!
//! Architecture:
//! - `transport`: Stream socket with chunked, timeout-bounded reads
//! - `codec`: Streaming MessagePack frame decoding
//! - `protocol`: Request encoding and reply frame classification
//! - `types`: Parameter and column values
//! - `registry`: Per-client type conversions
//! - `connection`: Command/reply state machine
//! - `pool`: Bounded connection pool with failure purging

pub mod codec;
pub mod connection;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;


// Public API re-exports for library consumers
pub use connection::{Connection, ConnectionConfig, ReplyState, Row, Rows, SharedColumns};
pub use pool::{BoxFuture, Pool, PoolConfig, PooledConnection};
pub use protocol::{Column, Operation, StatusCode};
pub use registry::TypeRegistry;
pub use types::{Value, ValueKind};
