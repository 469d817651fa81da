//! Native values and their MessagePack wire representation.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};

use crate::error::{Error, Result};

// ============================================================================
// Values
// ============================================================================

/// A value sent as a query parameter or decoded from a result row.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    /// Unsigned integers that do not fit in `i64`.
    UInt(u64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    DateTime(DateTime<Utc>),
    /// A datetime without timezone; assumed to be UTC on the wire.
    NaiveDateTime(NaiveDateTime),
    Array(Vec<Value>),
    Map(Vec<(Value, Value)>),
}

/// The runtime kind of a [`Value`], used to key to-primitive converters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Null,
    Bool,
    Int,
    UInt,
    Float,
    Text,
    Bytes,
    DateTime,
    NaiveDateTime,
    Array,
    Map,
}

impl Value {
    #[inline]
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::UInt(_) => ValueKind::UInt,
            Value::Float(_) => ValueKind::Float,
            Value::Text(_) => ValueKind::Text,
            Value::Bytes(_) => ValueKind::Bytes,
            Value::DateTime(_) => ValueKind::DateTime,
            Value::NaiveDateTime(_) => ValueKind::NaiveDateTime,
            Value::Array(_) => ValueKind::Array,
            Value::Map(_) => ValueKind::Map,
        }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Truthiness as the server's result values use it: null, false, zero
    /// and empty containers are falsy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::UInt(u) => *u != 0,
            Value::Float(f) => *f != 0.0,
            Value::Text(s) => !s.is_empty(),
            Value::Bytes(b) => !b.is_empty(),
            Value::DateTime(_) | Value::NaiveDateTime(_) => true,
            Value::Array(items) => !items.is_empty(),
            Value::Map(items) => !items.is_empty(),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::UInt(u) => i64::try_from(*u).ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::DateTime(dt) => Some(*dt),
            _ => None,
        }
    }

    /// Convert to the wire representation, without any registry lookup.
    ///
    /// Datetimes have no wire form of their own; they must be converted by a
    /// registered to-primitive function first.
    pub fn to_wire(&self) -> Result<rmpv::Value> {
        Ok(match self {
            Value::Null => rmpv::Value::Nil,
            Value::Bool(b) => rmpv::Value::Boolean(*b),
            Value::Int(i) => rmpv::Value::from(*i),
            Value::UInt(u) => rmpv::Value::from(*u),
            Value::Float(f) => rmpv::Value::F64(*f),
            Value::Text(s) => rmpv::Value::from(s.as_str()),
            Value::Bytes(b) => rmpv::Value::Binary(b.clone()),
            Value::DateTime(_) | Value::NaiveDateTime(_) => {
                return Err(Error::Type(format!(
                    "No primitive conversion registered for {:?}",
                    self.kind()
                )))
            }
            Value::Array(items) => rmpv::Value::Array(
                items.iter().map(Value::to_wire).collect::<Result<Vec<_>>>()?,
            ),
            Value::Map(entries) => rmpv::Value::Map(
                entries
                    .iter()
                    .map(|(k, v)| Ok((k.to_wire()?, v.to_wire()?)))
                    .collect::<Result<Vec<_>>>()?,
            ),
        })
    }

    /// Convert a decoded wire value into a native value.
    ///
    /// Strings that are not valid UTF-8 come through as bytes.
    pub fn from_wire(value: rmpv::Value) -> Self {
        match value {
            rmpv::Value::Nil => Value::Null,
            rmpv::Value::Boolean(b) => Value::Bool(b),
            rmpv::Value::Integer(i) => match i.as_i64() {
                Some(v) => Value::Int(v),
                None => Value::UInt(i.as_u64().unwrap_or_default()),
            },
            rmpv::Value::F32(f) => Value::Float(f as f64),
            rmpv::Value::F64(f) => Value::Float(f),
            rmpv::Value::String(s) => {
                if s.is_str() {
                    Value::Text(s.into_str().unwrap_or_default())
                } else {
                    Value::Bytes(s.into_bytes())
                }
            }
            rmpv::Value::Binary(b) => Value::Bytes(b),
            rmpv::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from_wire).collect())
            }
            rmpv::Value::Map(entries) => Value::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (Value::from_wire(k), Value::from_wire(v)))
                    .collect(),
            ),
            rmpv::Value::Ext(_, data) => Value::Bytes(data),
        }
    }
}

// ============================================================================
// Conversions
// ============================================================================

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        match i64::try_from(v) {
            Ok(i) => Value::Int(i),
            Err(_) => Value::UInt(v),
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl<Tz: chrono::TimeZone> From<DateTime<Tz>> for Value {
    fn from(v: DateTime<Tz>) -> Self {
        Value::DateTime(v.with_timezone(&Utc))
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Value::NaiveDateTime(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::UInt(u) => serializer.serialize_u64(*u),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::Text(s) => serializer.serialize_str(s),
            Value::Bytes(b) => serializer.serialize_bytes(b),
            Value::DateTime(dt) => dt.serialize(serializer),
            Value::NaiveDateTime(dt) => dt.serialize(serializer),
            Value::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Map(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (k, v) in entries {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
        }
    }
}
