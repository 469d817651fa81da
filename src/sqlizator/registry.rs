//! Type conversion registry.
//!
//! Maps native value kinds to to-primitive converters applied before
//! encoding, and declared column type names to converters applied when rows
//! are decoded. A registry is built once at startup and shared read-only
//! through an `Arc` by every connection that uses it.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};

use super::types::{Value, ValueKind};
use crate::error::{Error, Result};

/// Column types decoded from UTC timestamps by the default registry.
pub const DATE_TYPES: [&str; 3] = ["date", "datetime", "timestamp"];

/// Column types normalised to text by the default registry.
pub const TEXT_TYPES: [&str; 2] = ["text", "varchar"];

type Converter = Box<dyn Fn(Value) -> Result<Value> + Send + Sync>;

#[derive(Default)]
pub struct TypeRegistry {
    to_primitive: HashMap<ValueKind, Converter>,
    from_primitive: HashMap<String, Converter>,
}

impl TypeRegistry {
    /// An empty registry: values go on and come off the wire untouched.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the datetime and text converters installed.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_to_primitive(ValueKind::DateTime, to_utc_timestamp);
        registry.register_to_primitive(ValueKind::NaiveDateTime, to_utc_timestamp);
        for type_name in DATE_TYPES {
            registry.register_from_primitive(type_name, from_utc_timestamp);
        }
        for type_name in TEXT_TYPES {
            registry.register_from_primitive(type_name, normalize_text);
        }
        registry
    }

    pub fn register_to_primitive<F>(&mut self, kind: ValueKind, f: F)
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.to_primitive.insert(kind, Box::new(f));
    }

    pub fn register_from_primitive<F>(&mut self, type_name: &str, f: F)
    where
        F: Fn(Value) -> Result<Value> + Send + Sync + 'static,
    {
        self.from_primitive.insert(type_name.to_string(), Box::new(f));
    }

    /// Apply the converter registered for the value's exact kind, if any.
    pub fn to_primitive(&self, value: Value) -> Result<Value> {
        match self.to_primitive.get(&value.kind()) {
            Some(convert) => convert(value),
            None => Ok(value),
        }
    }

    /// Apply the converter registered for a column type, if any.
    pub fn from_primitive(&self, value: Value, type_name: Option<&str>) -> Result<Value> {
        match type_name.and_then(|name| self.from_primitive.get(name)) {
            Some(convert) => convert(value),
            None => Ok(value),
        }
    }

    /// Convert a parameter into its wire form, applying to-primitive
    /// converters at every level of nesting.
    pub fn encode_value(&self, value: &Value) -> Result<rmpv::Value> {
        match self.to_primitive(value.clone())? {
            Value::Array(items) => Ok(rmpv::Value::Array(
                items
                    .iter()
                    .map(|item| self.encode_value(item))
                    .collect::<Result<Vec<_>>>()?,
            )),
            Value::Map(entries) => Ok(rmpv::Value::Map(
                entries
                    .iter()
                    .map(|(k, v)| Ok((self.encode_value(k)?, self.encode_value(v)?)))
                    .collect::<Result<Vec<_>>>()?,
            )),
            primitive => primitive.to_wire(),
        }
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("to_primitive", &self.to_primitive.keys().collect::<Vec<_>>())
            .field("from_primitive", &self.from_primitive.keys().collect::<Vec<_>>())
            .finish()
    }
}

// ============================================================================
// Default converters
// ============================================================================

/// Datetime to integer UTC seconds since the epoch. Sub-second precision is
/// dropped.
pub fn to_utc_timestamp(value: Value) -> Result<Value> {
    match value {
        Value::DateTime(dt) => Ok(Value::Int(dt.timestamp())),
        Value::NaiveDateTime(naive) => {
            tracing::warn!(
                datetime = %naive,
                "Naive datetime object passed. It is assumed that it's in UTC."
            );
            Ok(Value::Int(naive.and_utc().timestamp()))
        }
        other => Ok(other),
    }
}

/// UTC timestamp to an aware datetime. Falsy values are returned as-is.
pub fn from_utc_timestamp(value: Value) -> Result<Value> {
    if !value.is_truthy() {
        return Ok(value);
    }

    let seconds = match &value {
        Value::Int(i) => *i as f64,
        Value::UInt(u) => *u as f64,
        Value::Float(f) => *f,
        Value::Bool(_) => 1.0,
        Value::Text(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| Error::Type(format!("Invalid timestamp: {:?}", s)))?,
        Value::DateTime(_) => return Ok(value),
        other => {
            return Err(Error::Type(format!(
                "Cannot convert {:?} to a timestamp",
                other.kind()
            )))
        }
    };

    timestamp_to_datetime(seconds)
        .map(Value::DateTime)
        .ok_or_else(|| Error::Type(format!("Timestamp out of range: {}", seconds)))
}

fn timestamp_to_datetime(seconds: f64) -> Option<DateTime<Utc>> {
    if !seconds.is_finite() {
        return None;
    }
    let whole = seconds.floor();
    let nanos = ((seconds - whole) * 1e9).round().min(999_999_999.0) as u32;
    DateTime::from_timestamp(whole as i64, nanos)
}

/// Non-empty binary payloads in text columns become UTF-8 text.
pub fn normalize_text(value: Value) -> Result<Value> {
    match value {
        Value::Bytes(bytes) if !bytes.is_empty() => String::from_utf8(bytes)
            .map(Value::Text)
            .map_err(|e| Error::Type(format!("Invalid UTF-8 in TEXT: {}", e))),
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};
    use tracing_test::traced_test;

    #[test]
    fn test_datetime_round_trip() {
        let registry = TypeRegistry::with_defaults();
        let dt = Utc.with_ymd_and_hms(2014, 11, 5, 17, 30, 12).unwrap();

        let wire = registry.to_primitive(Value::from(dt)).unwrap();
        assert_eq!(wire, Value::Int(dt.timestamp()));

        let back = registry.from_primitive(wire, Some("datetime")).unwrap();
        assert_eq!(back.as_datetime(), Some(dt));
    }

    #[test]
    fn test_round_trip_truncates_to_the_second() {
        let registry = TypeRegistry::with_defaults();
        let dt = Utc
            .with_ymd_and_hms(2020, 1, 1, 0, 0, 1)
            .unwrap()
            .checked_add_signed(chrono::Duration::milliseconds(750))
            .unwrap();

        let wire = registry.to_primitive(Value::from(dt)).unwrap();
        let back = registry.from_primitive(wire, Some("timestamp")).unwrap();
        let back = back.as_datetime().unwrap();
        assert_eq!(back.timestamp(), dt.timestamp());
    }

    #[test]
    #[traced_test]
    fn test_naive_datetime_warns_and_assumes_utc() {
        let registry = TypeRegistry::with_defaults();
        let naive = NaiveDate::from_ymd_opt(2015, 6, 1)
            .unwrap()
            .and_hms_opt(8, 0, 0)
            .unwrap();

        let wire = registry.to_primitive(Value::from(naive)).unwrap();
        assert_eq!(wire, Value::Int(naive.and_utc().timestamp()));
        assert!(logs_contain("assumed that it's in UTC"));
    }

    #[test]
    fn test_falsy_timestamp_is_untouched() {
        let registry = TypeRegistry::with_defaults();
        assert_eq!(
            registry.from_primitive(Value::Int(0), Some("date")).unwrap(),
            Value::Int(0)
        );
        assert_eq!(
            registry.from_primitive(Value::Null, Some("date")).unwrap(),
            Value::Null
        );
    }

    #[test]
    fn test_fractional_and_string_timestamps() {
        let value = from_utc_timestamp(Value::Float(1.5)).unwrap();
        let dt = value.as_datetime().unwrap();
        assert_eq!(dt.timestamp(), 1);
        assert_eq!(dt.timestamp_subsec_millis(), 500);

        let value = from_utc_timestamp(Value::from("86400")).unwrap();
        assert_eq!(value.as_datetime().unwrap().timestamp(), 86400);

        assert!(matches!(
            from_utc_timestamp(Value::from("yesterday")),
            Err(Error::Type(_))
        ));
    }

    #[test]
    fn test_text_normalisation() {
        let registry = TypeRegistry::with_defaults();
        assert_eq!(
            registry
                .from_primitive(Value::Bytes(b"caf\xc3\xa9".to_vec()), Some("text"))
                .unwrap(),
            Value::Text("café".to_string())
        );
        assert_eq!(
            registry
                .from_primitive(Value::Bytes(Vec::new()), Some("varchar"))
                .unwrap(),
            Value::Bytes(Vec::new())
        );
    }

    #[test]
    fn test_unknown_type_and_missing_type_pass_through() {
        let registry = TypeRegistry::with_defaults();
        assert_eq!(
            registry.from_primitive(Value::Int(10), Some("integer")).unwrap(),
            Value::Int(10)
        );
        assert_eq!(
            registry.from_primitive(Value::Int(10), None).unwrap(),
            Value::Int(10)
        );
    }

    #[test]
    fn test_registries_are_independent() {
        let mut custom = TypeRegistry::new();
        custom.register_from_primitive("integer", |v| {
            Ok(Value::Int(v.as_i64().unwrap_or_default() * 2))
        });

        assert_eq!(
            custom.from_primitive(Value::Int(4), Some("integer")).unwrap(),
            Value::Int(8)
        );
        assert_eq!(
            TypeRegistry::with_defaults()
                .from_primitive(Value::Int(4), Some("integer"))
                .unwrap(),
            Value::Int(4)
        );
        // No datetime converter in an empty registry
        assert!(TypeRegistry::new()
            .encode_value(&Value::from(Utc::now()))
            .is_err());
    }

    #[test]
    fn test_nested_parameters_are_converted() {
        let registry = TypeRegistry::with_defaults();
        let dt = Utc.with_ymd_and_hms(2001, 9, 9, 1, 46, 40).unwrap();
        let wire = registry
            .encode_value(&Value::Array(vec![Value::from(dt), Value::Int(1)]))
            .unwrap();
        assert_eq!(
            wire,
            rmpv::Value::Array(vec![
                rmpv::Value::from(1_000_000_000i64),
                rmpv::Value::from(1)
            ])
        );
    }
}
