use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use crate::model::{BeanCollection, BeanRef, DataType, KeyValue};

/// A deferred value, resolved on first access
pub trait Load: Send + Sync {
    fn load(&self) -> Value;

    /// Drop any memoized result and group membership
    fn reset(&self) {}
}

/// Handle to a deferred property value
#[derive(Clone)]
pub struct LazyValue {
    id: Uuid,
    /// Type the value resolves to
    type_name: String,
    loader: Arc<dyn Load>,
}

impl LazyValue {
    pub fn new(type_name: impl Into<String>, loader: Arc<dyn Load>) -> Self {
        Self {
            id: Uuid::new_v4(),
            type_name: type_name.into(),
            loader,
        }
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Resolve the value. Loads may themselves resolve to another lazy value,
    /// which is followed.
    pub fn get(&self) -> Value {
        let mut value = self.loader.load();
        loop {
            match value {
                Value::Lazy(inner) => value = inner.loader.load(),
                other => return other,
            }
        }
    }

    pub fn reset(&self) {
        self.loader.reset();
    }
}

impl fmt::Debug for LazyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Lazy<{}>({})", self.type_name, self.id)
    }
}

/// Dynamically typed property or column value
#[derive(Clone, Debug, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Bean(BeanRef),
    Collection(BeanCollection),
    Lazy(LazyValue),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bean(&self) -> Option<&BeanRef> {
        match self {
            Value::Bean(bean) => Some(bean),
            _ => None,
        }
    }

    pub fn as_collection(&self) -> Option<&BeanCollection> {
        match self {
            Value::Collection(collection) => Some(collection),
            _ => None,
        }
    }

    /// Follow a lazy value to what it resolves to
    pub fn resolve(self) -> Value {
        match self {
            Value::Lazy(lazy) => lazy.get(),
            other => other,
        }
    }

    /// String form used when matching sub-class mapping rules
    pub fn to_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Bool(b) => Some(b.to_string()),
            Value::Int(i) => Some(i.to_string()),
            Value::Float(f) => Some(f.to_string()),
            Value::Text(s) => Some(s.clone()),
            Value::Timestamp(t) => Some(t.to_rfc3339()),
            Value::Bean(bean) => Some(bean.to_string()),
            Value::Collection(collection) => Some(format!("{:?}", collection)),
            Value::Lazy(lazy) => Some(format!("{:?}", lazy)),
        }
    }

    /// Component usable in a key. Integral floats are folded into integers so
    /// numeric keys compare the same whichever way the source typed them.
    pub fn to_key_value(&self) -> Option<KeyValue> {
        match self {
            Value::Bool(b) => Some(KeyValue::Bool(*b)),
            Value::Int(i) => Some(KeyValue::Int(*i)),
            Value::Float(f) if f.fract() == 0.0 => Some(KeyValue::Int(*f as i64)),
            Value::Float(f) => Some(KeyValue::Text(f.to_string())),
            Value::Text(s) => Some(KeyValue::Text(s.clone())),
            Value::Timestamp(t) => Some(KeyValue::Timestamp(*t)),
            _ => None,
        }
    }

    /// Convert a raw column value to the declared column type. Values that do
    /// not convert are passed through unchanged.
    pub fn coerce(self, data_type: DataType) -> Value {
        match (data_type, self) {
            (_, Value::Null) => Value::Null,
            (DataType::Integer, Value::Float(f)) if f.fract() == 0.0 => Value::Int(f as i64),
            (DataType::Integer, Value::Text(s)) => match s.trim().parse::<i64>() {
                Ok(i) => Value::Int(i),
                Err(_) => Value::Text(s),
            },
            (DataType::Integer, Value::Bool(b)) => Value::Int(i64::from(b)),
            (DataType::Number, Value::Int(i)) => Value::Float(i as f64),
            (DataType::Number, Value::Text(s)) => match s.trim().parse::<f64>() {
                Ok(f) => Value::Float(f),
                Err(_) => Value::Text(s),
            },
            (DataType::Boolean, Value::Int(i)) => Value::Bool(i != 0),
            (DataType::Boolean, Value::Text(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "y" | "yes" | "1" => Value::Bool(true),
                "false" | "n" | "no" | "0" => Value::Bool(false),
                _ => Value::Text(s),
            },
            (DataType::String, Value::Int(i)) => Value::Text(i.to_string()),
            (DataType::String, Value::Float(f)) => Value::Text(f.to_string()),
            (DataType::String, Value::Bool(b)) => Value::Text(b.to_string()),
            (DataType::Timestamp, Value::Text(s)) => match DateTime::parse_from_rfc3339(&s) {
                Ok(t) => Value::Timestamp(t.with_timezone(&Utc)),
                Err(_) => Value::Text(s),
            },
            (_, other) => other,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => *a as f64 == *b,
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Timestamp(a), Value::Timestamp(b)) => a == b,
            (Value::Bean(a), Value::Bean(b)) => Arc::ptr_eq(a, b),
            (Value::Collection(a), Value::Collection(b)) => a.same(b),
            (Value::Lazy(a), Value::Lazy(b)) => a.id == b.id,
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<BeanRef> for Value {
    fn from(value: BeanRef) -> Self {
        Value::Bean(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

/// What a store holds under a key. `Null` records that a lookup was made and
/// nothing exists, so the key is not loaded again.
#[derive(Clone, Debug)]
pub enum Cached {
    Null,
    Bean(BeanRef),
    Collection(BeanCollection),
}

impl Cached {
    pub fn is_null(&self) -> bool {
        matches!(self, Cached::Null)
    }

    pub fn as_bean(&self) -> Option<&BeanRef> {
        match self {
            Cached::Bean(bean) => Some(bean),
            _ => None,
        }
    }

    pub fn as_collection(&self) -> Option<&BeanCollection> {
        match self {
            Cached::Collection(collection) => Some(collection),
            _ => None,
        }
    }

    /// Stable identity of the cached object, if any
    pub fn identity(&self) -> Option<Uuid> {
        match self {
            Cached::Null => None,
            Cached::Bean(bean) => Some(bean.id().as_uuid()),
            Cached::Collection(collection) => Some(collection.id()),
        }
    }

    /// Same object (or both null)
    pub fn same(&self, other: &Cached) -> bool {
        match (self, other) {
            (Cached::Null, Cached::Null) => true,
            _ => self.identity().is_some() && self.identity() == other.identity(),
        }
    }

    /// Every bean reachable from this entry
    pub fn beans(&self) -> Vec<BeanRef> {
        match self {
            Cached::Null => Vec::new(),
            Cached::Bean(bean) => vec![bean.clone()],
            Cached::Collection(collection) => collection.to_vec(),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Cached::Null => Value::Null,
            Cached::Bean(bean) => Value::Bean(bean.clone()),
            Cached::Collection(collection) => Value::Collection(collection.clone()),
        }
    }

    pub fn type_name(&self) -> Option<&str> {
        match self {
            Cached::Null => None,
            Cached::Bean(bean) => Some(bean.type_name()),
            Cached::Collection(collection) => Some(collection.bean_type()),
        }
    }
}

impl From<BeanRef> for Cached {
    fn from(bean: BeanRef) -> Self {
        Cached::Bean(bean)
    }
}

impl From<Option<BeanRef>> for Cached {
    fn from(bean: Option<BeanRef>) -> Self {
        bean.map(Cached::Bean).unwrap_or(Cached::Null)
    }
}

impl From<BeanCollection> for Cached {
    fn from(collection: BeanCollection) -> Self {
        Cached::Collection(collection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Constant(i64);

    impl Load for Constant {
        fn load(&self) -> Value {
            Value::Int(self.0)
        }
    }

    #[test]
    fn test_column_coercion() {
        assert_eq!(Value::from("12").coerce(DataType::Integer), Value::Int(12));
        assert_eq!(Value::from("Y").coerce(DataType::Boolean), Value::Bool(true));
        assert_eq!(Value::Int(3).coerce(DataType::Number), Value::Float(3.0));
        assert_eq!(Value::Null.coerce(DataType::String), Value::Null);
        assert_eq!(
            Value::from("not a number").coerce(DataType::Integer),
            Value::from("not a number")
        );
    }

    #[test]
    fn test_integral_float_key_matches_integer_key() {
        assert_eq!(Value::Float(5.0).to_key_value(), Value::Int(5).to_key_value());
        assert_eq!(Value::Null.to_key_value(), None);
    }

    #[test]
    fn test_lazy_value_resolves() {
        let lazy = LazyValue::new("Number", Arc::new(Constant(9)));
        assert_eq!(Value::Lazy(lazy).resolve(), Value::Int(9));
    }
}
