use serde::{Deserialize, Serialize};

use super::pool::{Pool, Reusable};
use super::value::Value;
use super::{Kind, Payload};
use crate::error::{Error, Result};

static POOL: Pool<Variant> = Pool::new();

/// A tagged scalar: string, 64-bit integer, 64-bit float, bool or null.
///
/// Accessors are typed and return an error on mismatch rather than
/// panicking; the type predicates are total.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Variant {
    value: Value,
}

impl Default for Variant {
    fn default() -> Self {
        Self { value: Value::Null }
    }
}

impl Variant {
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
        }
    }

    /// Take a cleared variant from the object pool.
    pub fn acquire() -> Self {
        POOL.acquire()
    }

    /// Return this variant to the object pool.
    pub fn release(self) {
        POOL.release(self);
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn set(&mut self, value: impl Into<Value>) {
        self.value = value.into();
    }

    pub fn is_null(&self) -> bool {
        self.value.is_null()
    }

    pub fn is_string(&self) -> bool {
        matches!(self.value, Value::Str(_))
    }

    pub fn is_number(&self) -> bool {
        matches!(self.value, Value::Int(_) | Value::Float(_))
    }

    pub fn is_bool(&self) -> bool {
        matches!(self.value, Value::Bool(_))
    }

    pub fn as_str(&self) -> Result<&str> {
        self.value
            .as_str()
            .ok_or_else(|| self.type_error("string"))
    }

    pub fn as_i64(&self) -> Result<i64> {
        self.value
            .as_i64()
            .ok_or_else(|| self.type_error("integer"))
    }

    pub fn as_f64(&self) -> Result<f64> {
        self.value.as_f64().ok_or_else(|| self.type_error("float"))
    }

    pub fn as_bool(&self) -> Result<bool> {
        self.value.as_bool().ok_or_else(|| self.type_error("bool"))
    }

    /// Add a delta to an integer variant in place, returning the new value.
    pub fn add_i64(&mut self, delta: i64) -> Result<i64> {
        match &mut self.value {
            Value::Int(n) => {
                *n = n.wrapping_add(delta);
                Ok(*n)
            }
            _ => Err(self.type_error("integer")),
        }
    }

    /// Add a delta to a float variant in place, returning the new value.
    pub fn add_f64(&mut self, delta: f64) -> Result<f64> {
        match &mut self.value {
            Value::Float(n) => {
                *n += delta;
                Ok(*n)
            }
            _ => Err(self.type_error("float")),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    fn type_error(&self, wanted: &str) -> Error {
        Error::InvalidInput(format!("variant is not a {wanted}: {:?}", self.value))
    }
}

impl Payload for Variant {
    fn kind(&self) -> Kind {
        Kind::Variant
    }

    fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }
}

impl Reusable for Variant {
    fn clear(&mut self) {
        // Reset to the zero of the current tag so a recycled variant
        // keeps its shape but leaks no previous content.
        self.value = match self.value {
            Value::Str(_) => Value::Str(String::new()),
            Value::Int(_) => Value::Int(0),
            Value::Float(_) => Value::Float(0.0),
            Value::Bool(_) => Value::Bool(false),
            _ => Value::Null,
        };
    }
}
