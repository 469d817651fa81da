//! sqlizator wire protocol messages.
//!
//! A request is a single MessagePack map. A reply is a stream of top-level
//! values: an optional column metadata array, row arrays, and exactly one
//! status map that terminates it.

use std::fmt;

use bytes::BytesMut;

use super::codec;
use super::registry::TypeRegistry;
use super::types::Value;
use crate::error::{Error, Result};

// ============================================================================
// Protocol Constants
// ============================================================================

/// Message used when a failure status carries no message of its own.
pub const DEFAULT_MESSAGE: &str = "Unknown error.";

/// Server operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum Operation {
    Execute = 1,
    ExecuteAndFetch = 2,
}

/// Reply status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    UnknownError,
    DeserializationError,
    BadMessage,
    DatabaseNotFound,
    InvalidQuery,
    /// A code this client does not know about, kept verbatim.
    Other(i64),
}

impl StatusCode {
    pub fn as_i64(self) -> i64 {
        match self {
            StatusCode::Ok => 0,
            StatusCode::UnknownError => 1,
            StatusCode::DeserializationError => 2,
            StatusCode::BadMessage => 3,
            StatusCode::DatabaseNotFound => 4,
            StatusCode::InvalidQuery => 5,
            StatusCode::Other(code) => code,
        }
    }
}

impl From<i64> for StatusCode {
    fn from(code: i64) -> Self {
        match code {
            0 => StatusCode::Ok,
            1 => StatusCode::UnknownError,
            2 => StatusCode::DeserializationError,
            3 => StatusCode::BadMessage,
            4 => StatusCode::DatabaseNotFound,
            5 => StatusCode::InvalidQuery,
            other => StatusCode::Other(other),
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_i64())
    }
}

// ============================================================================
// Request
// ============================================================================

/// One command sent to the server.
#[derive(Debug, Clone)]
pub struct Request<'a> {
    pub operation: Operation,
    pub database: &'a str,
    pub query: &'a str,
    pub parameters: &'a [Value],
}

impl Request<'_> {
    /// Encode the request, passing every parameter through the registry.
    pub fn encode(&self, registry: &TypeRegistry) -> Result<BytesMut> {
        let parameters = self
            .parameters
            .iter()
            .map(|p| registry.encode_value(p))
            .collect::<Result<Vec<_>>>()?;

        let message = rmpv::Value::Map(vec![
            (
                rmpv::Value::from("operation"),
                rmpv::Value::from(self.operation as i64),
            ),
            (rmpv::Value::from("database"), rmpv::Value::from(self.database)),
            (rmpv::Value::from("query"), rmpv::Value::from(self.query)),
            (
                rmpv::Value::from("parameters"),
                rmpv::Value::Array(parameters),
            ),
        ]);

        codec::encode(&message)
    }
}

// ============================================================================
// Reply frames
// ============================================================================

/// A result column: its name and declared type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    /// `None` for expressions without a declared type.
    pub type_name: Option<String>,
}

/// The terminating status of a reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Status {
    pub code: StatusCode,
    pub message: Option<String>,
}

impl Status {
    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }

    /// `Ok` for an OK status, otherwise the operational error it describes.
    pub fn into_result(self) -> Result<()> {
        if self.is_ok() {
            return Ok(());
        }
        Err(Error::Operational {
            code: self.code,
            message: self.message.unwrap_or_else(|| DEFAULT_MESSAGE.to_string()),
        })
    }
}

/// One decoded top-level value of a reply.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Status(Status),
    Columns(Vec<Column>),
    Row(Vec<rmpv::Value>),
}

impl Frame {
    /// Classify a decoded value.
    ///
    /// Maps are status frames. Arrays are told apart by shape only: a
    /// non-empty array whose last element is itself an array is column
    /// metadata, anything else is a row. A row whose last column holds an
    /// array value is therefore read as metadata; the protocol carries no
    /// frame tag to disambiguate.
    pub fn classify(value: rmpv::Value) -> Result<Self> {
        match value {
            rmpv::Value::Map(entries) => Ok(Frame::Status(parse_status(entries)?)),
            rmpv::Value::Array(items) => {
                if matches!(items.last(), Some(rmpv::Value::Array(_))) {
                    Ok(Frame::Columns(parse_columns(items)?))
                } else {
                    Ok(Frame::Row(items))
                }
            }
            other => Err(Error::Protocol(format!(
                "Unexpected top-level frame: {}",
                other
            ))),
        }
    }
}

fn parse_status(entries: Vec<(rmpv::Value, rmpv::Value)>) -> Result<Status> {
    // A status map without a status key is an unknown error
    let mut code = StatusCode::UnknownError;
    let mut message = None;

    for (key, value) in entries {
        match key.as_str() {
            Some("status") => {
                let raw = value.as_i64().ok_or_else(|| {
                    Error::Protocol(format!("Invalid status code: {}", value))
                })?;
                code = StatusCode::from(raw);
            }
            Some("message") => {
                message = match value {
                    rmpv::Value::Nil => None,
                    rmpv::Value::String(s) => {
                        Some(s.into_str().unwrap_or_else(|| DEFAULT_MESSAGE.to_string()))
                    }
                    other => Some(other.to_string()),
                };
            }
            _ => {}
        }
    }

    Ok(Status { code, message })
}

fn parse_columns(items: Vec<rmpv::Value>) -> Result<Vec<Column>> {
    items
        .into_iter()
        .map(|item| {
            let pair = match item {
                rmpv::Value::Array(pair) if pair.len() == 2 => pair,
                other => {
                    return Err(Error::Protocol(format!(
                        "Invalid column description: {}",
                        other
                    )))
                }
            };

            let name = pair[0].as_str().ok_or_else(|| {
                Error::Protocol(format!("Invalid column name: {}", pair[0]))
            })?;
            let type_name = match &pair[1] {
                rmpv::Value::Nil => None,
                v => Some(
                    v.as_str()
                        .ok_or_else(|| Error::Protocol(format!("Invalid column type: {}", v)))?
                        .to_string(),
                ),
            };

            Ok(Column {
                name: name.to_string(),
                type_name,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlizator::codec::FrameDecoder;

    fn pair(name: &str, type_name: &str) -> rmpv::Value {
        rmpv::Value::Array(vec![rmpv::Value::from(name), rmpv::Value::from(type_name)])
    }

    #[test]
    fn test_request_encoding() {
        let registry = TypeRegistry::with_defaults();
        let params = [Value::Int(7), Value::from("x")];
        let request = Request {
            operation: Operation::ExecuteAndFetch,
            database: "main",
            query: "SELECT * FROM t WHERE a = ? AND b = ?",
            parameters: &params,
        };

        let encoded = request.encode(&registry).unwrap();
        let mut decoder = FrameDecoder::new();
        decoder.feed(&encoded);
        let decoded = decoder.next_value().unwrap().unwrap();

        let map = decoded.as_map().unwrap();
        let get = |key: &str| {
            map.iter()
                .find(|(k, _)| k.as_str() == Some(key))
                .map(|(_, v)| v.clone())
                .unwrap()
        };
        assert_eq!(get("operation"), rmpv::Value::from(2));
        assert_eq!(get("database"), rmpv::Value::from("main"));
        assert_eq!(
            get("parameters"),
            rmpv::Value::Array(vec![rmpv::Value::from(7), rmpv::Value::from("x")])
        );
    }

    #[test]
    fn test_status_classification() {
        let ok = rmpv::Value::Map(vec![(rmpv::Value::from("status"), rmpv::Value::from(0))]);
        assert_eq!(
            Frame::classify(ok).unwrap(),
            Frame::Status(Status {
                code: StatusCode::Ok,
                message: None
            })
        );

        let missing = rmpv::Value::Map(vec![]);
        match Frame::classify(missing).unwrap() {
            Frame::Status(status) => assert_eq!(status.code, StatusCode::UnknownError),
            other => panic!("Expected status, got {:?}", other),
        }
    }

    #[test]
    fn test_failure_status_defaults_message() {
        let status = Status {
            code: StatusCode::InvalidQuery,
            message: None,
        };
        let err = status.into_result().unwrap_err();
        assert_eq!(err.to_string(), "[5] Unknown error.");
        assert_eq!(err.code(), Some(StatusCode::InvalidQuery));
    }

    #[test]
    fn test_metadata_classification() {
        let meta = rmpv::Value::Array(vec![pair("id", "integer"), pair("created", "datetime")]);
        assert_eq!(
            Frame::classify(meta).unwrap(),
            Frame::Columns(vec![
                Column {
                    name: "id".to_string(),
                    type_name: Some("integer".to_string())
                },
                Column {
                    name: "created".to_string(),
                    type_name: Some("datetime".to_string())
                },
            ])
        );
    }

    #[test]
    fn test_untyped_column() {
        let meta = rmpv::Value::Array(vec![rmpv::Value::Array(vec![
            rmpv::Value::from("count(*)"),
            rmpv::Value::Nil,
        ])]);
        match Frame::classify(meta).unwrap() {
            Frame::Columns(columns) => assert_eq!(columns[0].type_name, None),
            other => panic!("Expected columns, got {:?}", other),
        }
    }

    #[test]
    fn test_row_classification() {
        let row = rmpv::Value::Array(vec![rmpv::Value::from(1), rmpv::Value::from("a")]);
        assert!(matches!(Frame::classify(row).unwrap(), Frame::Row(_)));

        let empty = rmpv::Value::Array(vec![]);
        assert_eq!(Frame::classify(empty).unwrap(), Frame::Row(vec![]));
    }

    #[test]
    fn test_row_ending_in_array_is_read_as_metadata() {
        // Shape inference cannot tell this row from metadata
        let row = rmpv::Value::Array(vec![
            rmpv::Value::from(1),
            rmpv::Value::Array(vec![rmpv::Value::from(2)]),
        ]);
        assert!(matches!(Frame::classify(row), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_scalar_frame_is_protocol_error() {
        assert!(matches!(
            Frame::classify(rmpv::Value::from(3)),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn test_status_code_round_trip() {
        for code in 0..=6 {
            assert_eq!(StatusCode::from(code).as_i64(), code);
        }
        assert_eq!(StatusCode::from(42), StatusCode::Other(42));
    }
}
