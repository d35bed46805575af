//! Composite keys for pipeline records.
//!
//! A `Key` is an ordered mapping of identifier fields to scalar values; it names
//! exactly one unit of work at one pipeline stage. Downstream keys extend upstream
//! keys (foreign-key chaining), so projection onto an upstream table's key fields
//! is the fundamental operation when computing set differences between stages.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::error::FlowError;

/// Scalar value of one key field. Keys identify records, so only equality-safe
/// scalars are allowed here; floating-point payloads live in row payloads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyValue {
    Int(i64),
    Text(String),
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Int(v) => write!(f, "{}", v),
            KeyValue::Text(v) => write!(f, "{}", v),
        }
    }
}

impl From<i64> for KeyValue {
    fn from(v: i64) -> Self {
        KeyValue::Int(v)
    }
}

impl From<&str> for KeyValue {
    fn from(v: &str) -> Self {
        KeyValue::Text(v.to_string())
    }
}

impl From<String> for KeyValue {
    fn from(v: String) -> Self {
        KeyValue::Text(v)
    }
}

/// Ordered composite key: `(field, value)` pairs in table declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Key {
    fields: Vec<(String, KeyValue)>,
}

impl Key {
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    /// Builder-style append. Appending a field that already exists is a
    /// validation error at insert time, not here.
    pub fn with(mut self, field: &str, value: impl Into<KeyValue>) -> Self {
        self.fields.push((field.to_string(), value.into()));
        self
    }

    pub fn get(&self, field: &str) -> Option<&KeyValue> {
        self.fields
            .iter()
            .find(|(f, _)| f == field)
            .map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &KeyValue)> {
        self.fields.iter().map(|(f, v)| (f.as_str(), v))
    }

    /// Project onto the given fields, in the given order. Errors if any field is
    /// absent: projection is only meaningful along a foreign-key chain.
    pub fn project(&self, fields: &[&str]) -> Result<Key, FlowError> {
        let mut out = Key::new();
        for field in fields {
            match self.get(field) {
                Some(v) => out.fields.push((field.to_string(), v.clone())),
                None => {
                    return Err(FlowError::Validation(format!(
                        "key {} has no field '{}'",
                        self, field
                    )));
                }
            }
        }
        Ok(out)
    }

    /// True if `self` carries every field of `upstream` with an equal value.
    pub fn extends(&self, upstream: &Key) -> bool {
        upstream
            .iter()
            .all(|(field, value)| self.get(field) == Some(value))
    }

    /// Merge `other`'s fields into a copy of `self`, appending fields not already
    /// present. Used when part-table rows extend a master key.
    pub fn extended_with(&self, other: &Key) -> Key {
        let mut out = self.clone();
        for (field, value) in other.iter() {
            if out.get(field).is_none() {
                out.fields.push((field.to_string(), value.clone()));
            }
        }
        out
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (field, value)) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, "/")?;
            }
            write!(f, "{}={}", field, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_key() -> Key {
        Key::new().with("subject", "M123").with("session_id", 4)
    }

    #[test]
    fn project_preserves_field_order() {
        let key = session_key().with("fiber_id", 1);
        let projected = key.project(&["subject", "session_id"]).unwrap();
        assert_eq!(projected, session_key());
        assert!(key.project(&["probe_id"]).is_err());
    }

    #[test]
    fn downstream_extends_upstream() {
        let downstream = session_key().with("fiber_id", 2);
        assert!(downstream.extends(&session_key()));
        assert!(!session_key().extends(&downstream));
    }

    #[test]
    fn display_is_stable() {
        assert_eq!(session_key().to_string(), "subject=M123/session_id=4");
    }
}
