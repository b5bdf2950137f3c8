//! Document and Value types returned by aggregation stores
//!
//! - Value: JSON-like values plus DateTime and Binary
//! - Document: an ordered field map with dotted-path access
//! - Conversion to and from `serde_json::Value`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Name of the primary-key field
pub const ID_FIELD: &str = "_id";

/// Value type stored in documents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Value {
    /// Null value
    Null,
    /// Boolean value
    Bool(bool),
    /// 32-bit integer
    Int32(i32),
    /// 64-bit integer
    Int64(i64),
    /// 64-bit floating point
    Float64(f64),
    /// String value
    String(String),
    /// Binary data
    Binary(Vec<u8>),
    /// Array of values
    Array(Vec<Value>),
    /// Nested object
    Object(BTreeMap<String, Value>),
    /// DateTime with UTC timezone
    DateTime(DateTime<Utc>),
}

impl Value {
    /// Check if value is null
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Check if value is a number (int or float)
    pub fn is_number(&self) -> bool {
        matches!(self, Value::Int32(_) | Value::Int64(_) | Value::Float64(_))
    }

    /// Get as i64
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int32(i) => Some(*i as i64),
            Value::Int64(i) => Some(*i),
            _ => None,
        }
    }

    /// Get as f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int32(i) => Some(*i as f64),
            Value::Int64(i) => Some(*i as f64),
            Value::Float64(f) => Some(*f),
            _ => None,
        }
    }

    /// Get as string reference
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Get as array reference
    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(arr) => Some(arr),
            _ => None,
        }
    }

    /// Get as object reference
    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(obj) => Some(obj),
            _ => None,
        }
    }

    /// Approximate encoded size in bytes
    pub fn size_bytes(&self) -> usize {
        match self {
            Value::Null | Value::Bool(_) => 1,
            Value::Int32(_) => 4,
            Value::Int64(_) | Value::Float64(_) | Value::DateTime(_) => 8,
            Value::String(s) => s.len(),
            Value::Binary(b) => b.len(),
            Value::Array(arr) => arr.iter().map(|v| v.size_bytes()).sum::<usize>() + 8,
            Value::Object(obj) => {
                obj.iter()
                    .map(|(k, v)| k.len() + v.size_bytes())
                    .sum::<usize>()
                    + 8
            }
        }
    }

    /// Total order used by sorting and range comparisons.
    ///
    /// Numbers compare across integer and float representations. Values of
    /// different kinds order by kind rank (null < numbers < strings < objects
    /// < arrays < binary < bool < dates), the way document stores do.
    pub fn compare(&self, other: &Value) -> Ordering {
        if let (Some(a), Some(b)) = (self.as_f64(), other.as_f64()) {
            if let (Some(x), Some(y)) = (self.as_i64(), other.as_i64()) {
                return x.cmp(&y);
            }
            return a.partial_cmp(&b).unwrap_or(Ordering::Equal);
        }

        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Binary(a), Value::Binary(b)) => a.cmp(b),
            (Value::DateTime(a), Value::DateTime(b)) => a.cmp(b),
            (Value::Array(a), Value::Array(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    let ord = x.compare(y);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            (Value::Object(a), Value::Object(b)) => {
                for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
                    let ord = ka.cmp(kb).then_with(|| va.compare(vb));
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            _ => self.kind_rank().cmp(&other.kind_rank()),
        }
    }

    /// Equality with numeric cross-type semantics (`1 == 1.0`)
    pub fn loosely_equals(&self, other: &Value) -> bool {
        if self.is_number() && other.is_number() {
            return self.compare(other) == Ordering::Equal;
        }
        self == other
    }

    fn kind_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Int32(_) | Value::Int64(_) | Value::Float64(_) => 1,
            Value::String(_) => 2,
            Value::Object(_) => 3,
            Value::Array(_) => 4,
            Value::Binary(_) => 5,
            Value::Bool(_) => 6,
            Value::DateTime(_) => 7,
        }
    }

    /// Convert into a plain JSON value
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int32(i) => serde_json::Value::from(*i),
            Value::Int64(i) => serde_json::Value::from(*i),
            Value::Float64(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Binary(b) => serde_json::Value::Array(
                b.iter().map(|byte| serde_json::Value::from(*byte)).collect(),
            ),
            Value::Array(arr) => serde_json::Value::Array(arr.iter().map(Value::to_json).collect()),
            Value::Object(obj) => serde_json::Value::Object(
                obj.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Value::DateTime(dt) => serde_json::Value::String(dt.to_rfc3339()),
        }
    }
}

impl From<&serde_json::Value> for Value {
    fn from(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int64(i),
                None => Value::Float64(n.as_f64().unwrap_or(0.0)),
            },
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(arr) => Value::Array(arr.iter().map(Value::from).collect()),
            serde_json::Value::Object(obj) => {
                Value::Object(obj.iter().map(|(k, v)| (k.clone(), Value::from(v))).collect())
            }
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        Value::from(&json)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int32(i)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int64(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float64(f)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<Vec<Value>> for Value {
    fn from(arr: Vec<Value>) -> Self {
        Value::Array(arr)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(obj: BTreeMap<String, Value>) -> Self {
        Value::Object(obj)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(dt: DateTime<Utc>) -> Self {
        Value::DateTime(dt)
    }
}

/// A stored or computed document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Fields in key order; `_id` is an ordinary field
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

impl Document {
    /// Create an empty document
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a document from fields
    pub fn from_fields(fields: BTreeMap<String, Value>) -> Self {
        Self { fields }
    }

    /// Build a document from a JSON object; non-objects produce an empty document
    pub fn from_json(json: &serde_json::Value) -> Self {
        match Value::from(json) {
            Value::Object(fields) => Self { fields },
            _ => Self::new(),
        }
    }

    /// Convert to a JSON object
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.fields
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect(),
        )
    }

    /// Insert a top-level field
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.fields.insert(key.into(), value.into())
    }

    /// Get a top-level field
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Remove a top-level field
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.fields.remove(key)
    }

    /// Check if a top-level field exists
    pub fn contains_key(&self, key: &str) -> bool {
        self.fields.contains_key(key)
    }

    /// Get field by path (e.g., "author.profile.name")
    pub fn get_by_path(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.fields.get(parts.next()?)?;

        for part in parts {
            current = match current {
                Value::Object(obj) => obj.get(part)?,
                Value::Array(arr) => arr.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }

        Some(current)
    }

    /// Set field by path, creating intermediate objects
    pub fn set_by_path(&mut self, path: &str, value: Value) -> Result<(), DocumentError> {
        let parts: Vec<&str> = path.split('.').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(DocumentError::InvalidPath(path.to_string()));
        }

        let (last, parents) = match parts.split_last() {
            Some(split) => split,
            None => return Err(DocumentError::InvalidPath(path.to_string())),
        };

        let mut current = &mut self.fields;
        for part in parents {
            let entry = current
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(BTreeMap::new()));
            current = match entry {
                Value::Object(obj) => obj,
                _ => {
                    return Err(DocumentError::InvalidPath(format!(
                        "{} traverses a non-object at '{}'",
                        path, part
                    )))
                }
            };
        }

        current.insert(last.to_string(), value);
        Ok(())
    }

    /// Remove field by path
    pub fn remove_by_path(&mut self, path: &str) -> Option<Value> {
        let parts: Vec<&str> = path.split('.').collect();
        let (last, parents) = parts.split_last()?;

        let mut current = &mut self.fields;
        for part in parents {
            current = match current.get_mut(*part)? {
                Value::Object(obj) => obj,
                _ => return None,
            };
        }
        current.remove(*last)
    }

    /// Approximate document size in bytes
    pub fn size_bytes(&self) -> usize {
        self.fields
            .iter()
            .map(|(k, v)| k.len() + v.size_bytes())
            .sum()
    }
}

impl From<BTreeMap<String, Value>> for Document {
    fn from(fields: BTreeMap<String, Value>) -> Self {
        Self { fields }
    }
}

/// Document errors
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("Invalid field path: {0}")]
    InvalidPath(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get_by_path() {
        let doc = Document::from_json(&json!({
            "title": "Photosynthesis",
            "author": { "name": "Lin", "stats": { "likes": 12 } },
            "tags": ["biology", "plants"]
        }));

        assert_eq!(doc.get_by_path("title").and_then(|v| v.as_str()), Some("Photosynthesis"));
        assert_eq!(doc.get_by_path("author.stats.likes").and_then(|v| v.as_i64()), Some(12));
        assert_eq!(doc.get_by_path("tags.1").and_then(|v| v.as_str()), Some("plants"));
        assert!(doc.get_by_path("author.missing").is_none());
    }

    #[test]
    fn test_set_and_remove_by_path() {
        let mut doc = Document::new();
        doc.set_by_path("meta.views", Value::Int32(3)).unwrap();
        assert_eq!(doc.get_by_path("meta.views"), Some(&Value::Int32(3)));

        doc.insert("flat", 1i32);
        assert!(doc.set_by_path("flat.inner", Value::Null).is_err());
        assert!(doc.set_by_path("bad..path", Value::Null).is_err());

        assert_eq!(doc.remove_by_path("meta.views"), Some(Value::Int32(3)));
        assert!(doc.get_by_path("meta.views").is_none());
    }

    #[test]
    fn test_numeric_comparison_across_types() {
        assert_eq!(Value::Int32(5).compare(&Value::Float64(5.0)), Ordering::Equal);
        assert_eq!(Value::Int64(2).compare(&Value::Int32(10)), Ordering::Less);
        assert!(Value::Int32(1).loosely_equals(&Value::Float64(1.0)));
        assert_eq!(Value::Null.compare(&Value::Int32(0)), Ordering::Less);
        assert_eq!(
            Value::from("a").compare(&Value::Int32(100)),
            Ordering::Greater
        );
    }

    #[test]
    fn test_json_conversion() {
        let json = json!({ "a": 1, "b": 2.5, "c": [true, null] });
        let doc = Document::from_json(&json);
        assert_eq!(doc.get("a"), Some(&Value::Int64(1)));
        assert_eq!(doc.get("b"), Some(&Value::Float64(2.5)));
        assert_eq!(doc.to_json(), json);
    }
}
