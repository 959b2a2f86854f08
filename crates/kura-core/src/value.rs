//! Structured values stored by a world, and their byte codec.
//!
//! Every input, result, failure cause and hook payload is a [`Value`].
//! Backends persist values through [`encode`] and [`decode`], which keep
//! [`Value::Bytes`] as raw octets so embedded NUL bytes and non-UTF-8 data
//! survive unchanged.

use crate::error::{Result, WorldError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A structured, serializable value.
///
/// # Examples
///
/// ```
/// use kura_core::Value;
///
/// let value = Value::map([
///     ("name", Value::from("report")),
///     ("blob", Value::from(vec![0u8, 159, 0, 255])),
/// ]);
/// let decoded = kura_core::value::decode_value(&kura_core::value::encode_value(&value).unwrap()).unwrap();
/// assert_eq!(decoded, value);
/// ```
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Builds a map value from key/value pairs.
    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Self {
        Value::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Returns the byte payload if this is a [`Value::Bytes`].
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Returns the text if this is a [`Value::Text`].
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    fn check_encodable(&self) -> Result<()> {
        match self {
            Value::Float(f) if !f.is_finite() => Err(WorldError::Codec(format!(
                "non-finite float {f} cannot be stored"
            ))),
            Value::List(items) => items.iter().try_for_each(Value::check_encodable),
            Value::Map(entries) => entries.values().try_for_each(Value::check_encodable),
            _ => Ok(()),
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
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value::Bytes(bytes)
    }
}

impl From<&[u8]> for Value {
    fn from(bytes: &[u8]) -> Self {
        Value::Bytes(bytes.to_vec())
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

/// Why a run failed.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FailureCause {
    pub message: String,
    pub stack: Option<String>,
    /// Arbitrary structured detail attached by the failing code.
    pub details: Value,
}

impl FailureCause {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
            details: Value::Null,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

/// Encodes any serializable record to the byte form backends persist.
pub fn encode<T: Serialize>(record: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(record).map_err(|e| WorldError::Codec(e.to_string()))
}

/// Decodes a record previously produced by [`encode`].
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| WorldError::Codec(e.to_string()))
}

/// Encodes a value, rejecting floats that cannot round-trip.
pub fn encode_value(value: &Value) -> Result<Vec<u8>> {
    value.check_encodable()?;
    encode(value)
}

pub fn decode_value(bytes: &[u8]) -> Result<Value> {
    decode(bytes)
}

/// Rejects values that could not be persisted byte-for-byte.
pub fn validate(value: &Value) -> Result<()> {
    value.check_encodable()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::Int),
            any::<f64>()
                .prop_filter("finite", |f| f.is_finite())
                .prop_map(Value::Float),
            ".*".prop_map(Value::Text),
            proptest::collection::vec(any::<u8>(), 0..64).prop_map(Value::Bytes),
        ];
        leaf.prop_recursive(6, 64, 8, |inner| {
            prop_oneof![
                proptest::collection::vec(inner.clone(), 0..8).prop_map(Value::List),
                proptest::collection::btree_map(".*", inner, 0..8).prop_map(Value::Map),
            ]
        })
    }

    proptest! {
        #[test]
        fn value_round_trips(value in arb_value()) {
            let bytes = encode_value(&value).unwrap();
            prop_assert_eq!(decode_value(&bytes).unwrap(), value);
        }
    }

    #[test]
    fn test_nul_bytes_survive() {
        let value = Value::map([
            ("raw", Value::from(vec![0u8, 0, 1, 0, 255, 0])),
            ("text", Value::from("a\0b\0")),
        ]);
        let decoded = decode_value(&encode_value(&value).unwrap()).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_deep_nesting_round_trips() {
        let mut value = Value::from(vec![0u8, 1, 2]);
        for depth in 0..20 {
            value = Value::map([(format!("level{depth}"), Value::List(vec![value]))]);
        }
        assert_eq!(decode_value(&encode_value(&value).unwrap()).unwrap(), value);
    }

    #[test]
    fn test_non_finite_float_rejected() {
        let value = Value::List(vec![Value::Float(f64::NAN)]);
        assert!(matches!(encode_value(&value), Err(WorldError::Codec(_))));
    }

    #[test]
    fn test_failure_cause_builder() {
        let cause = FailureCause::new("boom")
            .with_stack("at step")
            .with_details(Value::Int(7));
        let decoded: FailureCause = decode(&encode(&cause).unwrap()).unwrap();
        assert_eq!(decoded, cause);
    }
}
