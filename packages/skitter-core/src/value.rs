//! Runtime values exchanged between operations.
//!
//! `Value` is the self-describing type for records on ports, operation
//! state, configuration, and strategy deployment data. `Record` uses a
//! `BTreeMap` so serialization order is deterministic, which the wire
//! protocol relies on.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// A runtime value: a record on a port, operation state, or configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// Absent value. The initial state of stateless operations.
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    /// Binary data (not directly representable in JSON).
    Bytes(Vec<u8>),
    /// Ordered sequence of values.
    List(Vec<Value>),
    /// Named fields. Backs the `read_field`/`write_field` primitives.
    Record(BTreeMap<String, Value>),
}

impl Value {
    /// Builds a record value from `(name, value)` pairs.
    pub fn record<K, I>(fields: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Record(
            fields
                .into_iter()
                .map(|(k, v)| (k.into(), v))
                .collect::<BTreeMap<_, _>>(),
        )
    }

    #[must_use]
    pub fn is_nil(&self) -> bool {
        matches!(self, Value::Nil)
    }

    /// Returns the named field of a record value, if present.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Record(fields) => fields.get(name),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Numeric coercion: integers widen to floats.
    #[must_use]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            #[allow(clippy::cast_precision_loss)]
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_record(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Record(fields) => Some(fields),
            _ => None,
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Nil
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Record(fields) => {
                write!(f, "{{")?;
                for (i, (k, v)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_builder_and_field_access() {
        let v = Value::record([("total", Value::Int(60)), ("count", Value::Int(3))]);
        assert_eq!(v.field("total"), Some(&Value::Int(60)));
        assert_eq!(v.field("count"), Some(&Value::Int(3)));
        assert_eq!(v.field("missing"), None);
    }

    #[test]
    fn field_on_non_record_is_none() {
        assert_eq!(Value::Int(1).field("x"), None);
        assert_eq!(Value::Nil.field("x"), None);
    }

    #[test]
    fn as_float_widens_ints() {
        assert_eq!(Value::Int(10).as_float(), Some(10.0));
        assert_eq!(Value::Float(2.5).as_float(), Some(2.5));
        assert_eq!(Value::String("x".into()).as_float(), None);
    }

    #[test]
    fn display_is_readable() {
        let v = Value::record([
            ("label", Value::from("L")),
            ("items", Value::from(vec![Value::Int(1), Value::Int(2)])),
        ]);
        assert_eq!(format!("{v}"), "{items: [1, 2], label: \"L\"}");
    }

    #[test]
    fn msgpack_round_trip_is_lossless() {
        let v = Value::record([
            ("nil", Value::Nil),
            ("b", Value::Bool(true)),
            ("i", Value::Int(-7)),
            ("f", Value::Float(1.5)),
            ("s", Value::from("text")),
            ("bytes", Value::Bytes(vec![0xDE, 0xAD])),
            ("list", Value::from(vec![Value::Int(1), Value::Nil])),
        ]);
        let bytes = rmp_serde::to_vec_named(&v).unwrap();
        let decoded: Value = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(v, decoded);
    }

    #[test]
    fn record_serialization_is_deterministic() {
        let a = Value::record([("b", Value::Int(2)), ("a", Value::Int(1))]);
        let b = Value::record([("a", Value::Int(1)), ("b", Value::Int(2))]);
        assert_eq!(
            rmp_serde::to_vec_named(&a).unwrap(),
            rmp_serde::to_vec_named(&b).unwrap()
        );
    }
}
