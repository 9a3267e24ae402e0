//! Dynamically typed argument, item and result values.
//!
//! [`HubValue`] holds the MessagePack data model, a superset of JSON's:
//! 32-bit floats, binary blobs and extension types survive a decode/encode
//! cycle on the binary protocol untouched. The text protocol converts at its
//! edge with [`HubValue::from_json`] and [`HubValue::to_json`]:
//!
//! | MessagePack | JSON |
//! |---|---|
//! | float32 | number (widened to f64) |
//! | bin, ext | base64 string |
//! | map with non-string keys | object keyed by the key's JSON text |

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use rmpv::Value;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Number;

/// A hub value as decoded from either protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HubValue(Value);

impl HubValue {
    pub const NULL: HubValue = HubValue(Value::Nil);

    /// A binary blob: `bin` on the binary protocol, base64 text on JSON.
    pub fn binary(bytes: impl Into<Vec<u8>>) -> Self {
        Self(Value::Binary(bytes.into()))
    }

    pub fn from_json(value: serde_json::Value) -> Self {
        Self(json_to_msgpack(value))
    }

    pub fn to_json(&self) -> serde_json::Value {
        msgpack_to_json(&self.0)
    }

    /// Converts any serializable value through the JSON data model.
    pub fn from_serializable<T: Serialize>(value: &T) -> serde_json::Result<Self> {
        serde_json::to_value(value).map(Self::from_json)
    }

    /// Deserializes into `T` straight from the MessagePack model, so binary
    /// values reach byte visitors instead of failing as they would in JSON.
    pub fn to_typed<T: DeserializeOwned>(&self) -> Result<T, rmpv::ext::Error> {
        rmpv::ext::from_value(self.0.clone())
    }

    pub fn as_msgpack(&self) -> &Value {
        &self.0
    }

    pub fn into_msgpack(self) -> Value {
        self.0
    }

    pub fn is_null(&self) -> bool {
        self.0.is_nil()
    }

    pub fn is_string(&self) -> bool {
        self.0.is_str()
    }

    pub fn is_integer(&self) -> bool {
        self.0.is_i64() || self.0.is_u64()
    }

    pub fn is_number(&self) -> bool {
        matches!(self.0, Value::Integer(_) | Value::F32(_) | Value::F64(_))
    }

    pub fn is_bool(&self) -> bool {
        self.0.is_bool()
    }

    pub fn is_array(&self) -> bool {
        self.0.is_array()
    }

    pub fn is_map(&self) -> bool {
        self.0.is_map()
    }

    pub fn is_binary(&self) -> bool {
        self.0.is_bin()
    }

    pub fn as_str(&self) -> Option<&str> {
        self.0.as_str()
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.0.as_i64()
    }

    pub fn as_u64(&self) -> Option<u64> {
        self.0.as_u64()
    }

    /// Any number as f64, including integers.
    pub fn as_f64(&self) -> Option<f64> {
        match &self.0 {
            Value::Integer(n) => n.as_f64(),
            Value::F32(f) => Some(f64::from(*f)),
            Value::F64(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        self.0.as_bool()
    }

    /// The bytes of a binary value, or of a base64 string sent by a text
    /// protocol client.
    pub fn to_bytes(&self) -> Option<Vec<u8>> {
        match &self.0 {
            Value::Binary(bytes) => Some(bytes.clone()),
            Value::String(s) => s.as_str().and_then(|s| STANDARD.decode(s).ok()),
            _ => None,
        }
    }
}

impl Default for HubValue {
    fn default() -> Self {
        Self::NULL
    }
}

impl fmt::Display for HubValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<Value> for HubValue {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

impl From<serde_json::Value> for HubValue {
    fn from(value: serde_json::Value) -> Self {
        Self::from_json(value)
    }
}

impl From<&str> for HubValue {
    fn from(value: &str) -> Self {
        Self(Value::from(value))
    }
}

impl From<String> for HubValue {
    fn from(value: String) -> Self {
        Self(Value::from(value))
    }
}

impl From<bool> for HubValue {
    fn from(value: bool) -> Self {
        Self(Value::from(value))
    }
}

impl From<i64> for HubValue {
    fn from(value: i64) -> Self {
        Self(Value::from(value))
    }
}

impl From<u64> for HubValue {
    fn from(value: u64) -> Self {
        Self(Value::from(value))
    }
}

impl From<f64> for HubValue {
    fn from(value: f64) -> Self {
        Self(Value::F64(value))
    }
}

impl From<Vec<HubValue>> for HubValue {
    fn from(values: Vec<HubValue>) -> Self {
        Self(Value::Array(values.into_iter().map(|v| v.0).collect()))
    }
}

/// Compares through the JSON conversion, so `json!(..)` literals can be used
/// as expected values.
impl PartialEq<serde_json::Value> for HubValue {
    fn eq(&self, other: &serde_json::Value) -> bool {
        self.0 == json_to_msgpack(other.clone())
    }
}

fn json_to_msgpack(value: serde_json::Value) -> Value {
    use serde_json::Value as Json;

    match value {
        Json::Null => Value::Nil,
        Json::Bool(b) => Value::Boolean(b),
        Json::Number(n) => {
            if let Some(u) = n.as_u64() {
                Value::from(u)
            } else if let Some(i) = n.as_i64() {
                Value::from(i)
            } else {
                n.as_f64().map_or(Value::Nil, Value::F64)
            }
        }
        Json::String(s) => Value::from(s),
        Json::Array(items) => Value::Array(items.into_iter().map(json_to_msgpack).collect()),
        Json::Object(map) => Value::Map(
            map.into_iter()
                .map(|(k, v)| (Value::from(k), json_to_msgpack(v)))
                .collect(),
        ),
    }
}

fn msgpack_to_json(value: &Value) -> serde_json::Value {
    use serde_json::Value as Json;

    match value {
        Value::Nil => Json::Null,
        Value::Boolean(b) => Json::Bool(*b),
        Value::Integer(n) => match (n.as_u64(), n.as_i64()) {
            (Some(u), _) => Json::from(u),
            (None, Some(i)) => Json::from(i),
            (None, None) => Json::Null,
        },
        Value::F32(f) => Number::from_f64(f64::from(*f)).map_or(Json::Null, Json::Number),
        Value::F64(f) => Number::from_f64(*f).map_or(Json::Null, Json::Number),
        Value::String(s) => Json::String(match s.as_str() {
            Some(s) => s.to_owned(),
            None => String::from_utf8_lossy(s.as_bytes()).into_owned(),
        }),
        Value::Binary(bytes) => Json::String(STANDARD.encode(bytes)),
        Value::Array(items) => Json::Array(items.iter().map(msgpack_to_json).collect()),
        Value::Map(entries) => Json::Object(
            entries
                .iter()
                .map(|(k, v)| (json_key(k), msgpack_to_json(v)))
                .collect(),
        ),
        Value::Ext(_, data) => Json::String(STANDARD.encode(data)),
    }
}

fn json_key(key: &Value) -> String {
    match key.as_str() {
        Some(s) => s.to_owned(),
        None => msgpack_to_json(key).to_string(),
    }
}
