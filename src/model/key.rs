use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::model::{DataType, Value};

/// One component of a cache key. Keys never contain nulls.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyValue {
    Bool(bool),
    Int(i64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

impl KeyValue {
    /// Coerce this component to the representation used for a column type, so
    /// that a key built from `"42"` and one built from `42` compare equal
    pub fn coerce(&self, data_type: DataType) -> KeyValue {
        match (data_type, self) {
            (DataType::Integer, KeyValue::Text(s)) => s
                .trim()
                .parse::<i64>()
                .map(KeyValue::Int)
                .unwrap_or_else(|_| self.clone()),
            (DataType::Integer, KeyValue::Bool(b)) => KeyValue::Int(i64::from(*b)),
            (DataType::String, KeyValue::Int(i)) => KeyValue::Text(i.to_string()),
            (DataType::String, KeyValue::Bool(b)) => KeyValue::Text(b.to_string()),
            (DataType::String, KeyValue::Timestamp(t)) => KeyValue::Text(t.to_rfc3339()),
            (DataType::Boolean, KeyValue::Int(i)) => KeyValue::Bool(*i != 0),
            (DataType::Boolean, KeyValue::Text(s)) => match s.to_ascii_lowercase().as_str() {
                "true" | "y" | "1" => KeyValue::Bool(true),
                "false" | "n" | "0" => KeyValue::Bool(false),
                _ => self.clone(),
            },
            (DataType::Timestamp, KeyValue::Text(s)) => DateTime::parse_from_rfc3339(s)
                .map(|t| KeyValue::Timestamp(t.with_timezone(&Utc)))
                .unwrap_or_else(|_| self.clone()),
            _ => self.clone(),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            KeyValue::Bool(b) => Value::Bool(*b),
            KeyValue::Int(i) => Value::Int(*i),
            KeyValue::Text(s) => Value::Text(s.clone()),
            KeyValue::Timestamp(t) => Value::Timestamp(*t),
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Bool(b) => write!(f, "{}", b),
            KeyValue::Int(i) => write!(f, "{}", i),
            KeyValue::Text(s) => write!(f, "{}", s),
            KeyValue::Timestamp(t) => write!(f, "{}", t.to_rfc3339()),
        }
    }
}

/// Key of a cached bean: a single value, or an ordered list of components for
/// compound primary keys and multi-column indices
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Key {
    Single(KeyValue),
    Compound(Vec<KeyValue>),
}

impl Key {
    /// Build a key from column values. Returns `None` if any component is null
    /// or cannot be used as a key.
    pub fn from_values(values: &[Value]) -> Option<Key> {
        let mut parts = Vec::with_capacity(values.len());
        for value in values {
            parts.push(value.to_key_value()?);
        }
        Self::from_parts(parts)
    }

    pub fn from_parts(mut parts: Vec<KeyValue>) -> Option<Key> {
        match parts.len() {
            0 => None,
            1 => parts.pop().map(Key::Single),
            _ => Some(Key::Compound(parts)),
        }
    }

    pub fn components(&self) -> &[KeyValue] {
        match self {
            Key::Single(value) => std::slice::from_ref(value),
            Key::Compound(values) => values,
        }
    }

    pub fn component(&self, index: usize) -> Option<&KeyValue> {
        self.components().get(index)
    }

    pub fn len(&self) -> usize {
        self.components().len()
    }

    pub fn is_empty(&self) -> bool {
        self.components().is_empty()
    }

    /// Coerce each component to the matching column type
    pub fn coerce(&self, types: &[Option<DataType>]) -> Key {
        let parts = self
            .components()
            .iter()
            .enumerate()
            .map(|(i, part)| match types.get(i).copied().flatten() {
                Some(data_type) => part.coerce(data_type),
                None => part.clone(),
            })
            .collect::<Vec<_>>();
        match self {
            Key::Single(_) if parts.len() == 1 => Key::Single(parts[0].clone()),
            _ => Key::Compound(parts),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Single(value) => write!(f, "{}", value),
            Key::Compound(values) => write!(f, "[{}]", values.iter().join(", ")),
        }
    }
}

impl From<i64> for Key {
    fn from(value: i64) -> Self {
        Key::Single(KeyValue::Int(value))
    }
}

impl From<i32> for Key {
    fn from(value: i32) -> Self {
        Key::Single(KeyValue::Int(i64::from(value)))
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Key::Single(KeyValue::Text(value.to_string()))
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Key::Single(KeyValue::Text(value))
    }
}

impl From<Vec<KeyValue>> for Key {
    fn from(values: Vec<KeyValue>) -> Self {
        if values.len() == 1 {
            Key::Single(values[0].clone())
        } else {
            Key::Compound(values)
        }
    }
}
