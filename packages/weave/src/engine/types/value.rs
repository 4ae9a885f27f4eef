use super::record::FastMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use smol_str::SmolStr;

/// Opaque field value as delivered by the backing store.
///
/// The aggregator never interprets field semantics beyond what predicates
/// and the sort contract reference. Untagged serde keeps the wire shape
/// plain JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Null,
    Bool(bool),
    Number(f64),
    Str(SmolStr),
    Array(Vec<FieldValue>),
    Object(FastMap<SmolStr, FieldValue>),
}

impl Default for FieldValue {
    fn default() -> Self {
        FieldValue::Null
    }
}

impl FieldValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&FastMap<SmolStr, FieldValue>> {
        match self {
            FieldValue::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<FieldValue>> {
        match self {
            FieldValue::Array(arr) => Some(arr),
            _ => None,
        }
    }

    /// Get nested value by key (for objects).
    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.as_object()?.get(&SmolStr::new(key))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Str(SmolStr::new(s))
    }
}

impl From<f64> for FieldValue {
    fn from(n: f64) -> Self {
        FieldValue::Number(n)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Bool(b)
    }
}

impl From<Value> for FieldValue {
    fn from(v: Value) -> Self {
        match v {
            Value::Null => FieldValue::Null,
            Value::Bool(b) => FieldValue::Bool(b),
            Value::Number(n) => FieldValue::Number(n.as_f64().unwrap_or(0.0)),
            Value::String(s) => FieldValue::Str(SmolStr::from(s)),
            Value::Array(arr) => {
                FieldValue::Array(arr.into_iter().map(FieldValue::from).collect())
            }
            Value::Object(obj) => FieldValue::Object(
                obj.into_iter()
                    .map(|(k, v)| (SmolStr::from(k), FieldValue::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<FieldValue> for Value {
    fn from(val: FieldValue) -> Self {
        match val {
            FieldValue::Null => Value::Null,
            FieldValue::Bool(b) => Value::Bool(b),
            FieldValue::Number(n) => json!(n),
            FieldValue::Str(s) => Value::String(s.to_string()),
            FieldValue::Array(arr) => Value::Array(arr.into_iter().map(|v| v.into()).collect()),
            FieldValue::Object(obj) => Value::Object(
                obj.into_iter()
                    .map(|(k, v)| (k.to_string(), v.into()))
                    .collect(),
            ),
        }
    }
}
