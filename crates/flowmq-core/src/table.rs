// User-owned metadata tables
//
// Handlers attach opaque key/value metadata to a flow. Values are restricted
// to a scalar set; anything else found on the wire survives decode and
// re-encode untouched but is rejected when a table crosses a validation
// boundary (SetMetadata, envelope validation).

use std::collections::BTreeMap;

use base64::prelude::{Engine, BASE64_STANDARD};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::{Result, WorkflowError};

/// A single metadata value
///
/// The supported scalar set mirrors what the wire format can carry without
/// ambiguity: null, booleans, 64-bit integers and floats, strings, byte
/// strings (base64 on the wire) and UTC timestamps (RFC 3339 on the wire).
/// `Other` carries any non-scalar JSON found on the wire so a decode→encode
/// round trip preserves it; validation rejects it.
#[derive(Debug, Clone, PartialEq)]
pub enum TableValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
    Other(Value),
}

impl Serialize for TableValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            TableValue::Null => serializer.serialize_unit(),
            TableValue::Bool(b) => serializer.serialize_bool(*b),
            TableValue::Int(i) => serializer.serialize_i64(*i),
            TableValue::Float(f) => serializer.serialize_f64(*f),
            TableValue::String(s) => serializer.serialize_str(s),
            TableValue::Bytes(b) => serializer.serialize_str(&BASE64_STANDARD.encode(b)),
            TableValue::Timestamp(ts) => serializer.serialize_str(&ts.to_rfc3339()),
            TableValue::Other(v) => v.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for TableValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Ok(TableValue::from(Value::deserialize(deserializer)?))
    }
}

impl From<Value> for TableValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => TableValue::Null,
            Value::Bool(b) => TableValue::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => TableValue::Int(i),
                None => match n.as_f64() {
                    Some(f) => TableValue::Float(f),
                    None => TableValue::Other(Value::Number(n)),
                },
            },
            Value::String(s) => TableValue::String(s),
            other => TableValue::Other(other),
        }
    }
}

impl From<bool> for TableValue {
    fn from(v: bool) -> Self {
        TableValue::Bool(v)
    }
}

impl From<i32> for TableValue {
    fn from(v: i32) -> Self {
        TableValue::Int(v.into())
    }
}

impl From<i64> for TableValue {
    fn from(v: i64) -> Self {
        TableValue::Int(v)
    }
}

impl From<f64> for TableValue {
    fn from(v: f64) -> Self {
        TableValue::Float(v)
    }
}

impl From<&str> for TableValue {
    fn from(v: &str) -> Self {
        TableValue::String(v.to_string())
    }
}

impl From<String> for TableValue {
    fn from(v: String) -> Self {
        TableValue::String(v)
    }
}

impl From<Vec<u8>> for TableValue {
    fn from(v: Vec<u8>) -> Self {
        TableValue::Bytes(v)
    }
}

impl From<DateTime<Utc>> for TableValue {
    fn from(v: DateTime<Utc>) -> Self {
        TableValue::Timestamp(v)
    }
}

/// Opaque key/value bag owned by the application
///
/// Stored verbatim on every state transition and merged shallowly
/// (last writer wins) when a handler returns more metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Table(BTreeMap<String, TableValue>);

impl Table {
    pub fn new() -> Self {
        Table(BTreeMap::new())
    }

    /// Fail if any value falls outside the supported scalar set.
    ///
    /// Checked element-wise so a nested table buried in a single key is
    /// caught before it reaches storage or the wire.
    pub fn validate(&self) -> Result<()> {
        for (key, value) in &self.0 {
            if let TableValue::Other(raw) = value {
                return Err(WorkflowError::metadata(format!(
                    "value for key {key:?} is not a supported scalar: {raw}"
                )));
            }
        }
        Ok(())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<TableValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&TableValue> {
        self.0.get(key)
    }

    /// Shallow merge: every entry of `other` overwrites an existing entry
    /// with the same key.
    pub fn merge(&mut self, other: Table) {
        for (key, value) in other.0 {
            self.0.insert(key, value);
        }
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TableValue)> {
        self.0.iter()
    }
}

impl From<BTreeMap<String, TableValue>> for Table {
    fn from(map: BTreeMap<String, TableValue>) -> Self {
        Table(map)
    }
}

impl FromIterator<(String, TableValue)> for Table {
    fn from_iter<T: IntoIterator<Item = (String, TableValue)>>(iter: T) -> Self {
        Table(iter.into_iter().collect())
    }
}
