//! Argument normalization and canonical JSON encoding.
//!
//! Values are plain `serde_json::Value`s. Identity only needs two things from
//! them: arguments must be an object, and the same logical value must always
//! encode to the same string no matter how its object keys were inserted.

use crate::error::{Error, Result};
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Normalizes query arguments.
///
/// `null` becomes the empty object; any other non-object value is rejected.
pub fn normalize_args(args: Value) -> Result<Value> {
    match args {
        Value::Null => Ok(Value::Object(Map::new())),
        Value::Object(_) => Ok(args),
        other => Err(Error::invalid_args(format!(
            "expected an object, got {}",
            type_name(&other)
        ))),
    }
}

/// Returns the JSON type name of a value, for error messages.
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Encodes a value as canonical JSON.
///
/// Object keys are sorted at every depth and no whitespace is emitted, so two
/// structurally equal values always produce the same bytes. Sorting does not
/// depend on `serde_json`'s `preserve_order` feature.
pub fn canonical_json(value: &Value) -> Result<String> {
    serde_json::to_string(&Canonical(value))
        .map_err(|e| Error::invalid_args(format!("not encodable as JSON: {}", e)))
}

/// Serializes the wrapped value with its object keys in sorted order.
struct Canonical<'a>(&'a Value);

impl Serialize for Canonical<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> core::result::Result<S::Ok, S::Error> {
        match self.0 {
            Value::Array(items) => serializer.collect_seq(items.iter().map(Canonical)),
            Value::Object(map) => {
                let sorted: BTreeMap<&str, Canonical<'_>> =
                    map.iter().map(|(k, v)| (k.as_str(), Canonical(v))).collect();
                serializer.collect_map(sorted)
            }
            scalar => scalar.serialize(serializer),
        }
    }
}
