use serde::{Deserialize, Serialize};

use super::pool::{Pool, Reusable};
use super::value::{self, deep_merge, Map, Value};
use super::{Kind, Payload};
use crate::error::Result;

static POOL: Pool<Record> = Pool::new();

/// A nested, schemaless record: one string-keyed tree of values.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    record: Map,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(record: Map) -> Self {
        Self { record }
    }

    /// Take a cleared record from the object pool.
    pub fn acquire() -> Self {
        POOL.acquire()
    }

    /// Return this record to the object pool.
    pub fn release(self) {
        POOL.release(self);
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.record.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.record.get(name)
    }

    pub fn size(&self) -> usize {
        self.record.len()
    }

    pub fn as_map(&self) -> &Map {
        &self.record
    }

    /// Recursively merge a patch into this record.
    pub fn deep_merge(&mut self, patch: Map) {
        deep_merge(&mut self.record, patch);
    }

    /// Every value stored under `key` anywhere in the tree.
    pub fn search(&self, key: &str) -> Vec<Value> {
        value::search_in_map(&self.record, key)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl Payload for Record {
    fn kind(&self) -> Kind {
        Kind::Record
    }

    fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }
}

impl Reusable for Record {
    fn clear(&mut self) {
        self.record.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, Value)]) -> Map {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_set_get() {
        let mut rec = Record::new();
        rec.set("name", "Alice".into());
        rec.set("age", Value::Int(25));

        assert_eq!(rec.get("name"), Some(&"Alice".into()));
        assert_eq!(rec.get("missing"), None);
        assert_eq!(rec.size(), 2);
    }

    #[test]
    fn test_deep_merge() {
        let mut rec = Record::from_map(map(&[(
            "profile",
            Value::Object(map(&[("city", "Kigali".into())])),
        )]));

        rec.deep_merge(map(&[(
            "profile",
            Value::Object(map(&[("zip", "00000".into())])),
        )]));

        let profile = rec.get("profile").unwrap().as_object().unwrap();
        assert_eq!(profile.len(), 2);
        assert_eq!(profile["city"], "Kigali".into());
    }

    #[test]
    fn test_search_includes_nested_hits() {
        let rec = Record::from_map(map(&[
            ("id", Value::Int(7)),
            ("left", Value::Object(map(&[("id", Value::Int(8))]))),
            ("right", Value::Object(map(&[("id", Value::Int(9))]))),
        ]));

        let hits = rec.search("id");
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0], Value::Int(7));
    }

    #[test]
    fn test_bytes_round_trip() {
        let rec = Record::from_map(map(&[
            ("name", "Bob".into()),
            ("scores", vec![Value::Int(1), Value::Int(2)].into()),
        ]));

        let back = Record::from_bytes(&rec.to_bytes().expect("encode")).expect("decode");
        assert_eq!(back, rec);
    }

    #[test]
    fn test_json_is_bare_map() {
        let rec = Record::from_map(map(&[("a", Value::Int(1))]));
        let json = String::from_utf8(rec.to_json().expect("to json")).unwrap();
        assert_eq!(json, r#"{"a":1}"#);
    }

    #[test]
    fn test_pool_round_trip_clears_state() {
        let mut rec = Record::acquire();
        rec.set("k", Value::Int(1));
        rec.release();

        let rec = Record::acquire();
        assert_eq!(rec.size(), 0);
    }
}
