//! Error types for the sqlizator client.
//!
//! Transport and protocol failures are fatal to the connection they occur
//! on; operational errors reported by the server are not.

use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::sqlizator::protocol::StatusCode;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The server answered with a non-OK status.
    #[error("[{code}] {message}")]
    Operational { code: StatusCode, message: String },

    #[error("Type conversion error: {0}")]
    Type(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection is closed")]
    ConnectionClosed,
}

impl Error {
    /// Whether the connection that produced this error can no longer be
    /// trusted and must not go back to the pool.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Protocol(_))
    }

    /// The server status code, for operational errors.
    pub fn code(&self) -> Option<StatusCode> {
        match self {
            Error::Operational { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Socket-level failures.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection closed by peer")]
    PeerClosed,
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Transport(TransportError::Io(err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
