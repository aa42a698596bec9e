//! Line codec
//!
//! One JSON object per line. Output is canonical: UTF-8, object keys in
//! sorted order at every nesting level, no insignificant whitespace, and the
//! newline added at the write site. serde_json's BTreeMap-backed `Map` gives
//! the sorted-key property directly; this module adds the strict-profile
//! checks (single object per line, duplicate-key rejection, nesting-depth
//! cap) that a plain `from_str` does not perform.

use std::fmt;

use serde::de::{self, Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};
use serde_json::{Map, Value};

use crate::config::ParseProfile;
use crate::error::{JsonltError, JsonltResult};

/// Maximum JSON nesting depth accepted in a line.
pub const MAX_NESTING_DEPTH: usize = 64;

/// Encode one object as a canonical line (without the trailing newline).
pub fn encode_line(object: &Map<String, Value>) -> JsonltResult<String> {
    serde_json::to_string(object).map_err(|e| JsonltError::Parse {
        path: None,
        line: 0,
        reason: format!("cannot serialize record: {}", e),
    })
}

/// Decode one line into an object.
///
/// Errors carry no location; callers attach the file path and 1-based line
/// number. Fails when the line is not valid JSON, is not a single object,
/// nests deeper than [`MAX_NESTING_DEPTH`], or (Strict) repeats a key at any
/// nesting level.
pub fn decode_line(line: &str, profile: ParseProfile) -> JsonltResult<Map<String, Value>> {
    let value: Value = match profile {
        ParseProfile::Strict => {
            serde_json::from_str::<CheckedValue>(line).map(|checked| checked.0)
        }
        ParseProfile::Lenient => serde_json::from_str(line),
    }
    .map_err(|e| {
        let msg = e.to_string();
        let reason = if msg.contains("duplicate key") {
            msg
        } else {
            format!("invalid JSON: {}", msg)
        };
        JsonltError::Parse { path: None, line: 0, reason }
    })?;

    let depth = nesting_depth(&value);
    if depth > MAX_NESTING_DEPTH {
        return Err(JsonltError::Limit {
            what: "nesting depth",
            actual: depth as u64,
            limit: MAX_NESTING_DEPTH as u64,
        });
    }

    match value {
        Value::Object(map) => Ok(map),
        other => Err(JsonltError::Parse {
            path: None,
            line: 0,
            reason: format!("expected JSON object, got {}", value_kind(&other)),
        }),
    }
}

/// Nesting depth of a JSON value: primitives and empty containers count 1.
pub fn nesting_depth(value: &Value) -> usize {
    match value {
        Value::Array(items) => 1 + items.iter().map(nesting_depth).max().unwrap_or(0),
        Value::Object(map) => 1 + map.values().map(nesting_depth).max().unwrap_or(0),
        _ => 1,
    }
}

pub(crate) fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// A `Value` whose deserialization rejects duplicate object keys.
///
/// serde_json silently keeps the last duplicate; the strict profile must
/// reject them, so this walks the input with its own visitor and fails on
/// the second insert of a key, at any nesting level.
struct CheckedValue(Value);

impl<'de> Deserialize<'de> for CheckedValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(CheckedValueVisitor)
    }
}

struct CheckedValueVisitor;

impl<'de> Visitor<'de> for CheckedValueVisitor {
    type Value = CheckedValue;

    fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str("any JSON value")
    }

    fn visit_bool<E>(self, v: bool) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(CheckedValue(Value::Bool(v)))
    }

    fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(CheckedValue(Value::from(v)))
    }

    fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(CheckedValue(Value::from(v)))
    }

    fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(CheckedValue(Value::from(v)))
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(CheckedValue(Value::String(v.to_owned())))
    }

    fn visit_string<E>(self, v: String) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(CheckedValue(Value::String(v)))
    }

    fn visit_unit<E>(self) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        Ok(CheckedValue(Value::Null))
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut items = Vec::new();
        while let Some(CheckedValue(item)) = seq.next_element()? {
            items.push(item);
        }
        Ok(CheckedValue(Value::Array(items)))
    }

    fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
    where
        A: MapAccess<'de>,
    {
        let mut object = Map::new();
        while let Some(key) = access.next_key::<String>()? {
            let CheckedValue(value) = access.next_value()?;
            if object.insert(key.clone(), value).is_some() {
                return Err(de::Error::custom(format!("duplicate key: '{}'", key)));
            }
        }
        Ok(CheckedValue(Value::Object(object)))
    }
}
