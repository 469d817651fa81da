//! In-process sqlizator server for tests.
//!
//! Decodes each request, hands it to a handler and writes back whatever
//! frames the handler returns.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use super::codec::{encode, FrameDecoder};
use super::connection::ConnectionConfig;

/// A decoded request.
#[derive(Debug, Clone)]
pub(crate) struct Command {
    pub operation: i64,
    pub database: String,
    pub query: String,
    pub parameters: Vec<rmpv::Value>,
}

impl Command {
    fn parse(value: rmpv::Value) -> Self {
        let mut command = Command {
            operation: 0,
            database: String::new(),
            query: String::new(),
            parameters: Vec::new(),
        };

        if let rmpv::Value::Map(entries) = value {
            for (key, value) in entries {
                match (key.as_str(), value) {
                    (Some("operation"), v) => command.operation = v.as_i64().unwrap_or_default(),
                    (Some("database"), v) => {
                        command.database = v.as_str().unwrap_or_default().to_string()
                    }
                    (Some("query"), v) => command.query = v.as_str().unwrap_or_default().to_string(),
                    (Some("parameters"), rmpv::Value::Array(items)) => command.parameters = items,
                    _ => {}
                }
            }
        }
        command
    }
}

/// What the server does with a request.
pub(crate) enum Reply {
    /// Write the frames back in one write.
    Frames(Vec<rmpv::Value>),
    /// Write each piece separately with a pause in between.
    Pieces(Vec<Vec<u8>>),
    /// Close the socket without answering.
    Hangup,
    /// Never answer.
    Silent,
}

type Handler = dyn Fn(&Command) -> Reply + Send + Sync;

pub(crate) struct MockServer {
    port: u16,
    accepted: Arc<AtomicUsize>,
    commands: Arc<Mutex<Vec<Command>>>,
    task: JoinHandle<()>,
}

impl MockServer {
    pub async fn start<H>(handler: H) -> Self
    where
        H: Fn(&Command) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handler: Arc<Handler> = Arc::new(handler);
        let accepted = Arc::new(AtomicUsize::new(0));
        let commands = Arc::new(Mutex::new(Vec::new()));

        let task = {
            let accepted = Arc::clone(&accepted);
            let commands = Arc::clone(&commands);
            tokio::spawn(async move {
                while let Ok((socket, _)) = listener.accept().await {
                    accepted.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(socket, Arc::clone(&handler), Arc::clone(&commands)));
                }
            })
        };

        Self {
            port,
            accepted,
            commands,
            task,
        }
    }

    pub fn config(&self, database: &str) -> ConnectionConfig {
        ConnectionConfig::new("127.0.0.1", self.port, database).timeout(Duration::from_secs(2))
    }

    /// Number of connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<Command> {
        self.commands.lock().clone()
    }

    pub fn queries(&self) -> Vec<String> {
        self.commands().into_iter().map(|c| c.query).collect()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(mut socket: TcpStream, handler: Arc<Handler>, commands: Arc<Mutex<Vec<Command>>>) {
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; 4096];

    loop {
        let n = match socket.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        decoder.feed(&buf[..n]);

        while let Ok(Some(value)) = decoder.next_value() {
            let command = Command::parse(value);
            commands.lock().push(command.clone());

            match handler(&command) {
                Reply::Frames(frames) => {
                    let mut out = Vec::new();
                    for frame in &frames {
                        out.extend_from_slice(&encode(frame).unwrap());
                    }
                    if socket.write_all(&out).await.is_err() {
                        return;
                    }
                }
                Reply::Pieces(pieces) => {
                    for piece in pieces {
                        if socket.write_all(&piece).await.is_err() {
                            return;
                        }
                        tokio::time::sleep(Duration::from_millis(30)).await;
                    }
                }
                Reply::Hangup => return,
                Reply::Silent => {}
            }
        }
    }
}

// ============================================================================
// Frame builders
// ============================================================================

pub(crate) fn ok() -> rmpv::Value {
    rmpv::Value::Map(vec![(rmpv::Value::from("status"), rmpv::Value::from(0))])
}

pub(crate) fn error(code: i64, message: &str) -> rmpv::Value {
    rmpv::Value::Map(vec![
        (rmpv::Value::from("status"), rmpv::Value::from(code)),
        (rmpv::Value::from("message"), rmpv::Value::from(message)),
    ])
}

pub(crate) fn columns(names: &[(&str, &str)]) -> rmpv::Value {
    rmpv::Value::Array(
        names
            .iter()
            .map(|(name, type_name)| {
                rmpv::Value::Array(vec![
                    rmpv::Value::from(*name),
                    rmpv::Value::from(*type_name),
                ])
            })
            .collect(),
    )
}

pub(crate) fn row(values: Vec<rmpv::Value>) -> rmpv::Value {
    rmpv::Value::Array(values)
}
