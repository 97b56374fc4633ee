use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A string-keyed tree of [`Value`]s.
pub type Map = BTreeMap<String, Value>;

/// A dynamically typed value tree.
///
/// Record bodies, table rows and variant scalars are all built from this
/// one shape, which keeps the MessagePack and JSON codecs symmetric: the
/// enum is untagged, so it serializes as the plain value it wraps.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Array(Vec<Value>),
    Object(Map),
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
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Map> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Map> for Value {
    fn from(v: Map) -> Self {
        Value::Object(v)
    }
}

impl<V: Into<Value>> From<Vec<V>> for Value {
    fn from(v: Vec<V>) -> Self {
        Value::Array(v.into_iter().map(Into::into).collect())
    }
}

/// Recursively merge `patch` into `base`.
///
/// When both sides hold maps under the same key they merge key by key;
/// in every other case, including map-over-scalar and scalar-over-map,
/// the patch value overwrites the base value.
pub fn deep_merge(base: &mut Map, patch: Map) {
    for (key, incoming) in patch {
        match incoming {
            Value::Object(inner) => {
                if let Some(Value::Object(existing)) = base.get_mut(&key) {
                    deep_merge(existing, inner);
                } else {
                    base.insert(key, Value::Object(inner));
                }
            }
            other => {
                base.insert(key, other);
            }
        }
    }
}

/// Collect every value stored under `key` anywhere in the tree, direct
/// hits first, then hits inside nested maps.
pub fn search_in_map(map: &Map, key: &str) -> Vec<Value> {
    let mut results = Vec::new();
    if let Some(hit) = map.get(key) {
        results.push(hit.clone());
    }
    for value in map.values() {
        if let Value::Object(nested) = value {
            results.extend(search_in_map(nested, key));
        }
    }
    results
}

/// A row matches when every predicate key is present and deep-equal.
pub fn matches(row: &Map, predicate: &Map) -> bool {
    predicate
        .iter()
        .all(|(key, expected)| row.get(key) == Some(expected))
}
