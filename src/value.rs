//! Dynamically-typed payload values exchanged with the hub.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fmt::{self, Display};
use thiserror::Error;

/// A value carried in hub message arguments and results.
///
/// The wire representation is JSON with one extension: [`Value::Binary`]
/// serializes to a base64 string. There is no way to tell such a string apart
/// from a regular one on receive, so deserialization always yields
/// [`Value::String`] for it. That asymmetry is inherited from the protocol
/// and intentionally preserved.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<Value>),
    Object(HashMap<String, Value>),
    Binary(Vec<u8>),
}

/// Discriminant of a [`Value`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Null,
    Bool,
    Number,
    String,
    Array,
    Object,
    Binary,
}

/// An accessor was called for a kind other than the stored one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("expected a {expected} value, found {found}")]
pub struct TypeMismatch {
    pub expected: ValueKind,
    pub found: ValueKind,
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Number(_) => ValueKind::Number,
            Value::String(_) => ValueKind::String,
            Value::Array(_) => ValueKind::Array,
            Value::Object(_) => ValueKind::Object,
            Value::Binary(_) => ValueKind::Binary,
        }
    }

    /// Creates a binary value from raw bytes.
    pub fn binary(bytes: impl Into<Vec<u8>>) -> Value {
        Value::Binary(bytes.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn is_bool(&self) -> bool {
        matches!(self, Value::Bool(_))
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Value::Number(_))
    }

    pub fn is_string(&self) -> bool {
        matches!(self, Value::String(_))
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Value::Array(_))
    }

    pub fn is_object(&self) -> bool {
        matches!(self, Value::Object(_))
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, Value::Binary(_))
    }

    pub fn as_bool(&self) -> Result<bool, TypeMismatch> {
        match self {
            Value::Bool(value) => Ok(*value),
            other => Err(other.mismatch(ValueKind::Bool)),
        }
    }

    pub fn as_number(&self) -> Result<f64, TypeMismatch> {
        match self {
            Value::Number(value) => Ok(*value),
            other => Err(other.mismatch(ValueKind::Number)),
        }
    }

    pub fn as_string(&self) -> Result<&str, TypeMismatch> {
        match self {
            Value::String(value) => Ok(value),
            other => Err(other.mismatch(ValueKind::String)),
        }
    }

    pub fn as_array(&self) -> Result<&[Value], TypeMismatch> {
        match self {
            Value::Array(values) => Ok(values),
            other => Err(other.mismatch(ValueKind::Array)),
        }
    }

    pub fn as_object(&self) -> Result<&HashMap<String, Value>, TypeMismatch> {
        match self {
            Value::Object(values) => Ok(values),
            other => Err(other.mismatch(ValueKind::Object)),
        }
    }

    pub fn as_binary(&self) -> Result<&[u8], TypeMismatch> {
        match self {
            Value::Binary(bytes) => Ok(bytes),
            other => Err(other.mismatch(ValueKind::Binary)),
        }
    }

    fn mismatch(&self, expected: ValueKind) -> TypeMismatch {
        TypeMismatch {
            expected,
            found: self.kind(),
        }
    }
}

impl Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Null => "null",
            ValueKind::Bool => "boolean",
            ValueKind::Number => "number",
            ValueKind::String => "string",
            ValueKind::Array => "array",
            ValueKind::Object => "object",
            ValueKind::Binary => "binary",
        };
        write!(f, "{}", name)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<f32> for Value {
    fn from(value: f32) -> Self {
        Value::Number(value.into())
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Number(value.into())
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Number(value as f64)
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::Number(value.into())
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<Vec<Value>> for Value {
    fn from(values: Vec<Value>) -> Self {
        Value::Array(values)
    }
}

impl From<HashMap<String, Value>> for Value {
    fn from(values: HashMap<String, Value>) -> Self {
        Value::Object(values)
    }
}

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(value) => serializer.serialize_bool(*value),
            Value::Number(value) => serializer.serialize_f64(*value),
            Value::String(value) => serializer.serialize_str(value),
            Value::Array(values) => serializer.collect_seq(values),
            Value::Object(values) => serializer.collect_map(values),
            Value::Binary(bytes) => serializer.serialize_str(&base64::encode(bytes)),
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let json = serde_json::Value::deserialize(deserializer)?;
        Ok(json.into())
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(value) => Value::Bool(value),
            serde_json::Value::Number(value) => Value::Number(value.as_f64().unwrap_or_default()),
            serde_json::Value::String(value) => Value::String(value),
            serde_json::Value::Array(values) => {
                Value::Array(values.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(values) => Value::Object(
                values
                    .into_iter()
                    .map(|(key, value)| (key, Value::from(value)))
                    .collect(),
            ),
        }
    }
}
