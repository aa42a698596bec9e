//! Records and tombstones
//!
//! A record is an arbitrary JSON object carrying its key fields. Top-level
//! `$`-prefixed names are reserved for the format: `$jsonlt` marks the
//! header line and `$deleted` marks a tombstone; anything else under `$` is
//! rejected on write.

use serde_json::{Map, Value};

use crate::codec::value_kind;

/// A record: an arbitrary JSON object. Dynamic by design, never a static
/// schema.
pub type Record = Map<String, Value>;
use crate::error::{JsonltError, JsonltResult};
use crate::key::{Key, KeyScalar, KeySpec};

/// Top-level field marking the header line.
pub const HEADER_FIELD: &str = "$jsonlt";

/// Top-level field marking a tombstone.
pub const DELETED_FIELD: &str = "$deleted";

/// True when the object is a tombstone: `$deleted` present and literally true.
pub fn is_tombstone(object: &Map<String, Value>) -> bool {
    object.get(DELETED_FIELD) == Some(&Value::Bool(true))
}

/// Validate a record for writing and extract its key.
///
/// Rejects any top-level `$`-prefixed field (records never carry reserved
/// names on the write path) and everything `KeySpec::extract_key` rejects.
pub fn validate_record(record: &Map<String, Value>, spec: &KeySpec) -> JsonltResult<Key> {
    for field in record.keys() {
        if field.starts_with('$') {
            return Err(JsonltError::InvalidKey {
                reason: format!("record contains reserved field name '{}'", field),
            });
        }
    }
    spec.extract_key(record)
}

/// Validate a replayed tombstone line and extract the key it deletes.
pub fn validate_tombstone(object: &Map<String, Value>, spec: &KeySpec) -> JsonltResult<Key> {
    match object.get(DELETED_FIELD) {
        Some(Value::Bool(true)) => {}
        Some(Value::Bool(false)) => {
            return Err(deleted_must_be_true("false"));
        }
        Some(other) => {
            return Err(deleted_must_be_true(value_kind(other)));
        }
        None => {
            return Err(JsonltError::Parse {
                path: None,
                line: 0,
                reason: format!("tombstone missing {} field", DELETED_FIELD),
            });
        }
    }
    spec.extract_key(object).map_err(|err| match err {
        JsonltError::InvalidKey { reason } if reason.starts_with("missing") => {
            JsonltError::InvalidKey { reason: format!("tombstone {}", reason) }
        }
        other => other,
    })
}

fn deleted_must_be_true(got: &str) -> JsonltError {
    JsonltError::Parse {
        path: None,
        line: 0,
        reason: format!("{} must be true, got {}", DELETED_FIELD, got),
    }
}

/// Build the tombstone object for a key: the key fields plus `$deleted`.
pub fn build_tombstone(key: &Key, spec: &KeySpec) -> JsonltResult<Map<String, Value>> {
    let mut object = Map::new();
    for (field, scalar) in spec.key_fields(key)? {
        let value = match scalar {
            KeyScalar::Int(v) => Value::from(*v),
            KeyScalar::Str(v) => Value::String(v.clone()),
        };
        object.insert(field.to_owned(), value);
    }
    object.insert(DELETED_FIELD.to_owned(), Value::Bool(true));
    Ok(object)
}
