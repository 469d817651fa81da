//! TCP transport for the sqlizator protocol.
//!
//! The protocol has no length prefix: a reply is read in fixed-size chunks
//! and a read shorter than the buffer is taken as the end of a message.

use std::future::Future;
use std::io;
use std::net::Shutdown;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::TransportError;

/// Size of a single socket read.
pub const RECV_BUFFER_SIZE: usize = 4096;

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

/// A single stream socket to one server endpoint.
#[derive(Debug)]
pub struct Transport {
    stream: TcpStream,
    timeout: Duration,
}

impl Transport {
    /// Open a stream to `host:port`. The timeout bounds the connect and
    /// every later read and write.
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> TransportResult<Self> {
        let stream = with_timeout(timeout, TcpStream::connect((host, port))).await?;
        stream.set_nodelay(true)?;

        Ok(Self { stream, timeout })
    }

    /// Write the whole buffer.
    pub async fn send(&mut self, data: &[u8]) -> TransportResult<()> {
        let timeout = self.timeout;
        with_timeout(timeout, self.stream.write_all(data)).await
    }

    /// Start reading a reply.
    pub fn receive(&mut self) -> Chunks<'_> {
        Chunks {
            transport: self,
            finished: false,
            peer_closed: false,
        }
    }

    /// Shut the stream down in both directions and release the socket.
    pub fn close(self) -> TransportResult<()> {
        let stream = self.stream.into_std()?;
        match stream.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            // The peer already tore the connection down
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// The fixed read/write timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn read_chunk(&mut self) -> TransportResult<Bytes> {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        let timeout = self.timeout;
        let n = with_timeout(timeout, self.stream.read(&mut buf)).await?;
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }
}

/// Lazy, finite sequence of raw chunks read from the socket.
///
/// Ends when the peer closes the stream or when a read comes back shorter
/// than [`RECV_BUFFER_SIZE`].
pub struct Chunks<'a> {
    transport: &'a mut Transport,
    finished: bool,
    peer_closed: bool,
}

impl Chunks<'_> {
    /// Read the next chunk, or `None` once the sequence has ended.
    pub async fn next_chunk(&mut self) -> TransportResult<Option<Bytes>> {
        if self.finished {
            return Ok(None);
        }

        let chunk = self.transport.read_chunk().await?;

        if chunk.is_empty() {
            self.finished = true;
            self.peer_closed = true;
            return Ok(None);
        }

        if chunk.len() < RECV_BUFFER_SIZE {
            self.finished = true;
        }

        Ok(Some(chunk))
    }

    /// Whether the sequence ended because the peer closed the stream.
    pub fn peer_closed(&self) -> bool {
        self.peer_closed
    }
}

async fn with_timeout<T, F>(timeout: Duration, fut: F) -> TransportResult<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(TransportError::Io),
        Err(_) => Err(TransportError::Timeout(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair() -> (Transport, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (client, accepted) = tokio::join!(
            Transport::connect("127.0.0.1", port, Duration::from_secs(2)),
            listener.accept()
        );
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_short_read_ends_sequence() {
        let (mut transport, mut server) = pair().await;
        server.write_all(b"hello").await.unwrap();

        let mut chunks = transport.receive();
        let chunk = chunks.next_chunk().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"hello");
        assert!(chunks.next_chunk().await.unwrap().is_none());
        assert!(!chunks.peer_closed());
    }

    #[tokio::test]
    async fn test_peer_close_ends_sequence() {
        let (mut transport, server) = pair().await;
        drop(server);

        let mut chunks = transport.receive();
        assert!(chunks.next_chunk().await.unwrap().is_none());
        assert!(chunks.peer_closed());
    }

    #[tokio::test]
    async fn test_full_buffer_keeps_reading() {
        let (mut transport, mut server) = pair().await;
        let payload = vec![7u8; RECV_BUFFER_SIZE + 10];
        server.write_all(&payload).await.unwrap();

        let mut received = Vec::new();
        loop {
            let mut chunks = transport.receive();
            while let Some(chunk) = chunks.next_chunk().await.unwrap() {
                received.extend_from_slice(&chunk);
            }
            if received.len() >= payload.len() {
                break;
            }
        }
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn test_read_timeout() {
        let (transport, _server) = pair().await;
        let mut transport = Transport {
            timeout: Duration::from_millis(50),
            ..transport
        };

        let err = transport.receive().next_chunk().await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_send_and_close() {
        let (mut transport, mut server) = pair().await;
        transport.send(b"ping").await.unwrap();
        transport.close().unwrap();

        let mut buf = Vec::new();
        server.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"ping");
    }

    #[tokio::test]
    async fn test_close_after_peer_hangup() {
        let (transport, server) = pair().await;
        drop(server);
        tokio::time::sleep(Duration::from_millis(20)).await;

        transport.close().unwrap();
    }
}
