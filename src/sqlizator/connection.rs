//! sqlizator connection implementation.
//!
//! This module provides the connection type that handles:
//! - TCP connection establishment
//! - Sending commands and interpreting the reply stream
//! - Decoding rows through the shared type registry

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::ser::{Serialize, SerializeMap, Serializer};
use serde::Deserialize;

use super::codec::FrameDecoder;
use super::protocol::{Column, Frame, Operation, Request};
use super::registry::TypeRegistry;
use super::transport::Transport;
use super::types::Value;
use crate::error::{Error, Result, TransportError};

/// Default server port.
pub const DEFAULT_PORT: u16 = 8000;

/// Default socket timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Connection Configuration
// ============================================================================

/// sqlizator connection configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConnectionConfig {
    /// Hostname or IP address
    pub host: String,
    /// Port number (default: 8000)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Database name
    pub database: String,
    /// Socket read/write timeout, in seconds when deserialized
    #[serde(default = "default_timeout", deserialize_with = "deserialize_seconds")]
    pub timeout: Duration,
}

impl ConnectionConfig {
    pub fn new(host: &str, port: u16, database: &str) -> Self {
        Self {
            host: host.to_string(),
            port,
            database: database.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Set the socket timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Parse a connection URL.
    ///
    /// Format: `sqlizator://host:port/database?timeout=SECS`
    ///
    /// Unknown query parameters are ignored so pool URLs parse too.
    pub fn from_url(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix("sqlizator://")
            .ok_or_else(|| Error::Config(format!("Invalid URL scheme: {}", url)))?;

        let (location, query) = match rest.find('?') {
            Some(q_pos) => (&rest[..q_pos], Some(&rest[q_pos + 1..])),
            None => (rest, None),
        };

        let (host_port, database) = location
            .split_once('/')
            .ok_or_else(|| Error::Config(format!("Missing database name: {}", url)))?;
        if database.is_empty() {
            return Err(Error::Config(format!("Missing database name: {}", url)));
        }

        let (host, port) = match host_port.rfind(':') {
            Some(colon_pos) => {
                let port_str = &host_port[colon_pos + 1..];
                let port = port_str
                    .parse::<u16>()
                    .map_err(|_| Error::Config(format!("Invalid port: {}", port_str)))?;
                (&host_port[..colon_pos], port)
            }
            None => (host_port, DEFAULT_PORT),
        };
        if host.is_empty() {
            return Err(Error::Config(format!("Missing host: {}", url)));
        }

        let mut config = Self::new(host, port, database);
        if let Some(value) = query_param(query, "timeout") {
            let secs = value
                .parse::<f64>()
                .ok()
                .filter(|s| s.is_finite() && *s > 0.0)
                .ok_or_else(|| Error::Config(format!("Invalid timeout: {}", value)))?;
            config.timeout = Duration::from_secs_f64(secs);
        }

        Ok(config)
    }
}

/// Look up a `key=value` pair in a URL query string.
pub(crate) fn query_param<'a>(query: Option<&'a str>, key: &str) -> Option<&'a str> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

fn deserialize_seconds<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
}

// ============================================================================
// Rows
// ============================================================================

/// Column metadata shared by every row of one result.
pub type SharedColumns = Arc<Vec<Column>>;

/// A decoded result row, addressed by column name.
#[derive(Debug, Clone)]
pub struct Row {
    columns: SharedColumns,
    values: Vec<Value>,
}

impl Row {
    /// Value of the named column. With duplicate names the last one wins.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .zip(&self.values)
            .rev()
            .find(|(column, _)| column.name == name)
            .map(|(_, value)| value)
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns[..self.values.len()]
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The row as a name-to-value map.
    pub fn into_map(self) -> HashMap<String, Value> {
        self.columns
            .iter()
            .map(|column| column.name.clone())
            .zip(self.values)
            .collect()
    }

    fn as_map(&self) -> HashMap<&str, &Value> {
        self.columns
            .iter()
            .map(|column| column.name.as_str())
            .zip(&self.values)
            .collect()
    }
}

impl PartialEq for Row {
    fn eq(&self, other: &Self) -> bool {
        self.as_map() == other.as_map()
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.values.len()))?;
        for (column, value) in self.columns.iter().zip(&self.values) {
            map.serialize_entry(&column.name, value)?;
        }
        map.end()
    }
}

/// Lazy, single-pass cursor over the rows of a fetch.
///
/// Each step may read from the network. Rows already returned stay valid if
/// a later step fails.
pub struct Rows<'a> {
    conn: &'a mut Connection,
}

impl Rows<'_> {
    /// The next row, or `None` once the reply has terminated.
    pub async fn next_row(&mut self) -> Result<Option<Row>> {
        self.conn.next_row().await
    }

    /// Read every remaining row.
    pub async fn collect_rows(mut self) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        while let Some(row) = self.next_row().await? {
            rows.push(row);
        }
        Ok(rows)
    }
}

// ============================================================================
// Connection
// ============================================================================

/// Where the connection is in the command/reply cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyState {
    /// No command outstanding.
    Idle,
    /// A request is being written. Left set if the write is abandoned, in
    /// which case the stream holds a partial request.
    Sending,
    /// A command was sent and its terminating status has not been read.
    AwaitingReply,
}

/// A sqlizator connection.
///
/// One command may be outstanding at a time. Not shared between tasks.
pub struct Connection {
    /// Process-unique identifier
    id: u64,
    /// Socket (None once closed or invalidated)
    transport: Option<Transport>,
    /// Target database name
    database: String,
    /// Shared type conversion registry
    registry: Arc<TypeRegistry>,
    /// Partially received reply bytes
    decoder: FrameDecoder,
    /// Column metadata of the reply being read
    columns: Option<SharedColumns>,
    /// Current reply state
    state: ReplyState,
    /// Set when a transport or protocol failure invalidated the connection
    broken: bool,
}

impl Connection {
    /// Connect to a sqlizator server.
    pub async fn connect(config: &ConnectionConfig, registry: Arc<TypeRegistry>) -> Result<Self> {
        let transport = Transport::connect(&config.host, config.port, config.timeout).await?;
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(
            id,
            host = %config.host,
            port = config.port,
            database = %config.database,
            "Connected to sqlizator"
        );

        Ok(Self {
            id,
            transport: Some(transport),
            database: config.database.clone(),
            registry,
            decoder: FrameDecoder::new(),
            columns: None,
            state: ReplyState::Idle,
            broken: false,
        })
    }

    /// Execute a command that returns no rows.
    ///
    /// Returns once the terminating status has been read.
    pub async fn execute(&mut self, sql: &str, params: &[Value]) -> Result<()> {
        self.command(Operation::Execute, sql, params).await?;
        while let Some(row) = self.next_row().await? {
            tracing::trace!(id = self.id, columns = row.len(), "Discarding row of execute reply");
        }
        Ok(())
    }

    /// Execute a query and return a cursor over its rows.
    pub async fn fetch(&mut self, sql: &str, params: &[Value]) -> Result<Rows<'_>> {
        self.command(Operation::ExecuteAndFetch, sql, params).await?;
        Ok(Rows { conn: self })
    }

    /// Close the connection. Closing twice is an error.
    pub async fn close(&mut self) -> Result<()> {
        let transport = self.transport.take().ok_or(Error::ConnectionClosed)?;
        self.state = ReplyState::Idle;
        self.columns = None;
        self.decoder.clear();
        transport.close()?;
        Ok(())
    }

    /// Check if the connection is closed.
    pub fn is_closed(&self) -> bool {
        self.transport.is_none()
    }

    /// Check if the connection was invalidated by a transport or protocol
    /// failure.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Whether the connection can take another command: open, not broken,
    /// and not cut off in the middle of writing a request.
    pub fn is_reusable(&self) -> bool {
        !self.is_closed() && !self.broken && self.state != ReplyState::Sending
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn state(&self) -> ReplyState {
        self.state
    }

    /// The shared type registry.
    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    // ========================================================================
    // Reply interpretation
    // ========================================================================

    /// Advance the reply state machine to the next row.
    pub(crate) async fn next_row(&mut self) -> Result<Option<Row>> {
        loop {
            match self.state {
                ReplyState::Idle => return Ok(None),
                ReplyState::Sending => return Err(self.interrupted()),
                ReplyState::AwaitingReply => {}
            }

            let frame = self.read_frame().await?;
            match frame {
                Frame::Status(status) => {
                    self.state = ReplyState::Idle;
                    self.columns = None;
                    if !status.is_ok() {
                        tracing::debug!(
                            id = self.id,
                            code = %status.code,
                            message = ?status.message,
                            "Command failed"
                        );
                    }
                    status.into_result()?;
                    return Ok(None);
                }
                Frame::Columns(columns) => {
                    self.columns = Some(Arc::new(columns));
                }
                Frame::Row(values) => {
                    let columns = match &self.columns {
                        Some(columns) => Arc::clone(columns),
                        None => {
                            return Err(self.invalidate(Error::Protocol(
                                "Row received before column metadata".to_string(),
                            )))
                        }
                    };
                    return self.construct_row(columns, values).map(Some);
                }
            }
        }
    }

    fn construct_row(&self, columns: SharedColumns, data: Vec<rmpv::Value>) -> Result<Row> {
        let values = columns
            .iter()
            .zip(data)
            .map(|(column, raw)| {
                self.registry
                    .from_primitive(Value::from_wire(raw), column.type_name.as_deref())
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Row { columns, values })
    }

    /// Send a command, first draining whatever is left of an abandoned reply.
    async fn command(&mut self, operation: Operation, sql: &str, params: &[Value]) -> Result<()> {
        if self.transport.is_none() {
            return Err(Error::ConnectionClosed);
        }

        match self.state {
            ReplyState::Idle => {}
            ReplyState::Sending => return Err(self.interrupted()),
            ReplyState::AwaitingReply => self.drain_reply().await?,
        }

        let request = Request {
            operation,
            database: &self.database,
            query: sql,
            parameters: params,
        };
        let payload = request.encode(&self.registry)?;

        tracing::trace!(id = self.id, ?operation, sql, "Sending command");
        self.columns = None;
        self.state = ReplyState::Sending;
        self.send(&payload).await?;

        self.state = ReplyState::AwaitingReply;
        Ok(())
    }

    /// Read and discard the rest of the current reply.
    async fn drain_reply(&mut self) -> Result<()> {
        loop {
            match self.next_row().await {
                Ok(Some(_)) => {}
                Ok(None) => return Ok(()),
                Err(e) if e.is_fatal() => return Err(e),
                // a row that failed conversion; the reply goes on
                Err(_) if self.state == ReplyState::AwaitingReply => {}
                Err(e) => {
                    tracing::debug!(id = self.id, error = %e, "Discarded error of abandoned reply");
                    return Ok(());
                }
            }
        }
    }

    // ========================================================================
    // Private helpers
    // ========================================================================

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let transport = self.transport.as_mut().ok_or(Error::ConnectionClosed)?;
        match transport.send(data).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.invalidate(e.into())),
        }
    }

    /// Read the next complete frame of the reply.
    async fn read_frame(&mut self) -> Result<Frame> {
        match self.read_frame_inner().await {
            Ok(frame) => Ok(frame),
            Err(e) if e.is_fatal() => Err(self.invalidate(e)),
            Err(e) => Err(e),
        }
    }

    async fn read_frame_inner(&mut self) -> Result<Frame> {
        loop {
            if let Some(value) = self.decoder.next_value()? {
                return Frame::classify(value);
            }

            let transport = self.transport.as_mut().ok_or(Error::ConnectionClosed)?;
            let mut chunks = transport.receive();
            while let Some(chunk) = chunks.next_chunk().await? {
                self.decoder.feed(&chunk);
                if let Some(value) = self.decoder.next_value()? {
                    return Frame::classify(value);
                }
            }

            if chunks.peer_closed() {
                return Err(TransportError::PeerClosed.into());
            }
            // Short read without a complete frame: the reply continues in
            // the next message.
        }
    }

    /// Invalidate a connection whose last request was only partly written.
    fn interrupted(&mut self) -> Error {
        self.invalidate(Error::Protocol(
            "Previous command was interrupted while sending".to_string(),
        ))
    }

    /// Drop the transport after a fatal error and hand the error back.
    pub(crate) fn invalidate(&mut self, err: Error) -> Error {
        if self.transport.take().is_some() {
            tracing::warn!(id = self.id, error = %err, "Connection invalidated");
        }
        self.broken = true;
        self.state = ReplyState::Idle;
        self.columns = None;
        self.decoder.clear();
        err
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("database", &self.database)
            .field("state", &self.state)
            .field("closed", &self.is_closed())
            .field("broken", &self.broken)
            .finish()
    }
}
