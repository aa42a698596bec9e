//! Keys and key specifiers
//!
//! A key identifies a record within a table. Keys are strings, integers in
//! the double-precision-safe range, or tuples of those scalars. The key
//! specifier, fixed in the header at table creation, names the record
//! field(s) the key is extracted from.
//!
//! Canonical ordering: integers numerically, strings by code point, integer
//! before string when types differ, tuples componentwise with the shorter
//! tuple first. The materialized view iterates in this order.

use std::cmp::Ordering;
use std::fmt;

use serde_json::{Map, Value};

use crate::error::{JsonltError, JsonltResult};

/// Largest integer exactly representable as an IEEE double: 2^53 - 1.
pub const MAX_INTEGER_KEY: i64 = 9_007_199_254_740_991;

/// Smallest valid integer key: -(2^53) + 1.
pub const MIN_INTEGER_KEY: i64 = -MAX_INTEGER_KEY;

/// Maximum number of elements in a tuple key / compound key specifier.
pub const MAX_TUPLE_ELEMENTS: usize = 16;

/// One element of a key: an integer or a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyScalar {
    Int(i64),
    Str(String),
}

impl Ord for KeyScalar {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (KeyScalar::Int(a), KeyScalar::Int(b)) => a.cmp(b),
            // Byte-wise comparison of UTF-8 equals code-point order.
            (KeyScalar::Str(a), KeyScalar::Str(b)) => a.cmp(b),
            (KeyScalar::Int(_), KeyScalar::Str(_)) => Ordering::Less,
            (KeyScalar::Str(_), KeyScalar::Int(_)) => Ordering::Greater,
        }
    }
}

impl PartialOrd for KeyScalar {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<i64> for KeyScalar {
    fn from(v: i64) -> Self {
        KeyScalar::Int(v)
    }
}

impl From<&str> for KeyScalar {
    fn from(v: &str) -> Self {
        KeyScalar::Str(v.to_owned())
    }
}

impl From<String> for KeyScalar {
    fn from(v: String) -> Self {
        KeyScalar::Str(v)
    }
}

impl fmt::Display for KeyScalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyScalar::Int(v) => write!(f, "{}", v),
            KeyScalar::Str(v) => write!(f, "{:?}", v),
        }
    }
}

/// A canonical key: a single scalar or a tuple of two or more scalars.
///
/// `Key::tuple` normalizes one-element tuples to the scalar form, so two
/// keys are equal exactly when they identify the same record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    Scalar(KeyScalar),
    Tuple(Vec<KeyScalar>),
}

impl Key {
    /// Build a key from tuple components, normalizing the one-element case.
    pub fn tuple(mut elements: Vec<KeyScalar>) -> Key {
        if elements.len() == 1 {
            Key::Scalar(elements.remove(0))
        } else {
            Key::Tuple(elements)
        }
    }

    /// The key's components; a scalar behaves as a one-element tuple.
    pub fn components(&self) -> &[KeyScalar] {
        match self {
            Key::Scalar(s) => std::slice::from_ref(s),
            Key::Tuple(v) => v,
        }
    }

    /// Number of components.
    pub fn arity(&self) -> usize {
        self.components().len()
    }

    /// The key as a JSON value: scalar as itself, tuple as an array.
    pub fn to_value(&self) -> Value {
        fn scalar_value(s: &KeyScalar) -> Value {
            match s {
                KeyScalar::Int(v) => Value::from(*v),
                KeyScalar::Str(v) => Value::String(v.clone()),
            }
        }
        match self {
            Key::Scalar(s) => scalar_value(s),
            Key::Tuple(v) => Value::Array(v.iter().map(scalar_value).collect()),
        }
    }

    /// Byte length of the canonical JSON serialization of this key.
    pub fn serialized_len(&self) -> usize {
        // Canonical serialization of scalars and flat arrays cannot fail.
        serde_json::to_string(&self.to_value()).map(|s| s.len()).unwrap_or(0)
    }

    /// Reject key shapes that can never identify a record.
    pub fn validate_lookup(&self) -> JsonltResult<()> {
        if let Key::Tuple(elements) = self {
            if elements.is_empty() {
                return Err(JsonltError::InvalidKey {
                    reason: "empty tuple is not a valid key".to_string(),
                });
            }
            if elements.len() > MAX_TUPLE_ELEMENTS {
                return Err(JsonltError::InvalidKey {
                    reason: format!(
                        "tuple key with {} elements exceeds maximum of {}",
                        elements.len(),
                        MAX_TUPLE_ELEMENTS
                    ),
                });
            }
        }
        Ok(())
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        self.components().cmp(other.components())
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<i64> for Key {
    fn from(v: i64) -> Self {
        Key::Scalar(KeyScalar::Int(v))
    }
}

impl From<&str> for Key {
    fn from(v: &str) -> Self {
        Key::Scalar(KeyScalar::Str(v.to_owned()))
    }
}

impl From<String> for Key {
    fn from(v: String) -> Self {
        Key::Scalar(KeyScalar::Str(v))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Scalar(s) => write!(f, "{}", s),
            Key::Tuple(v) => {
                write!(f, "(")?;
                for (i, s) in v.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", s)?;
                }
                write!(f, ")")
            }
        }
    }
}

/// The key specifier: which record field(s) the key lives in.
///
/// A compound specifier always has 2..=16 distinct, non-empty field names;
/// a one-element compound normalizes to the single form at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySpec {
    Single(String),
    Compound(Vec<String>),
}

impl KeySpec {
    /// Build a specifier from field names, validating shape and normalizing
    /// the one-element case.
    pub fn from_fields(mut fields: Vec<String>) -> JsonltResult<KeySpec> {
        if fields.is_empty() {
            return Err(JsonltError::InvalidKey {
                reason: "key specifier cannot be empty".to_string(),
            });
        }
        if fields.len() > MAX_TUPLE_ELEMENTS {
            return Err(JsonltError::InvalidKey {
                reason: format!(
                    "key specifier with {} fields exceeds maximum of {} elements",
                    fields.len(),
                    MAX_TUPLE_ELEMENTS
                ),
            });
        }
        for field in &fields {
            if field.is_empty() {
                return Err(JsonltError::InvalidKey {
                    reason: "key specifier field names must be non-empty".to_string(),
                });
            }
        }
        for (i, field) in fields.iter().enumerate() {
            if fields[..i].contains(field) {
                return Err(JsonltError::InvalidKey {
                    reason: format!("key specifier contains duplicate field names: '{}'", field),
                });
            }
        }
        if fields.len() == 1 {
            Ok(KeySpec::Single(fields.remove(0)))
        } else {
            Ok(KeySpec::Compound(fields))
        }
    }

    /// Convenience constructor for a single-field specifier.
    pub fn single(field: impl Into<String>) -> JsonltResult<KeySpec> {
        KeySpec::from_fields(vec![field.into()])
    }

    /// The field names, in order.
    pub fn fields(&self) -> &[String] {
        match self {
            KeySpec::Single(f) => std::slice::from_ref(f),
            KeySpec::Compound(v) => v,
        }
    }

    /// The specifier as it appears in the header: a string or an array.
    pub fn to_value(&self) -> Value {
        match self {
            KeySpec::Single(f) => Value::String(f.clone()),
            KeySpec::Compound(v) => {
                Value::Array(v.iter().map(|f| Value::String(f.clone())).collect())
            }
        }
    }

    /// Extract the canonical key from a record.
    pub fn extract_key(&self, record: &Map<String, Value>) -> JsonltResult<Key> {
        let fields = self.fields();
        let mut elements = Vec::with_capacity(fields.len());
        for field in fields {
            let value = record.get(field).ok_or_else(|| JsonltError::InvalidKey {
                reason: format!("missing required key field '{}'", field),
            })?;
            elements.push(scalar_from_value(value, field)?);
        }
        Ok(Key::tuple(elements))
    }

    /// Check that a lookup/delete key has the arity this specifier demands.
    pub fn check_arity(&self, key: &Key) -> JsonltResult<()> {
        match (self, key) {
            (KeySpec::Single(_), Key::Scalar(_)) => Ok(()),
            (KeySpec::Single(_), Key::Tuple(elements)) => Err(JsonltError::InvalidKey {
                reason: format!(
                    "key arity mismatch: expected scalar key, got tuple of {}",
                    elements.len()
                ),
            }),
            (KeySpec::Compound(fields), Key::Tuple(elements)) if elements.len() == fields.len() => {
                Ok(())
            }
            (KeySpec::Compound(fields), key) => Err(JsonltError::InvalidKey {
                reason: format!(
                    "key arity mismatch: expected tuple of {} elements, got {}",
                    fields.len(),
                    key.arity()
                ),
            }),
        }
    }

    /// Pair the key components with the specifier's field names.
    ///
    /// Fails with an arity mismatch when the shapes disagree.
    pub fn key_fields<'a>(&'a self, key: &'a Key) -> JsonltResult<Vec<(&'a str, &'a KeyScalar)>> {
        self.check_arity(key)?;
        Ok(self
            .fields()
            .iter()
            .map(String::as_str)
            .zip(key.components().iter())
            .collect())
    }
}

impl fmt::Display for KeySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySpec::Single(field) => write!(f, "{:?}", field),
            KeySpec::Compound(v) => {
                write!(f, "(")?;
                for (i, field) in v.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{:?}", field)?;
                }
                write!(f, ")")
            }
        }
    }
}

/// Convert a key-field value to a key scalar.
///
/// Whole-number floats are accepted and converted; everything outside the
/// string/integer shapes is rejected with a field-specific message.
fn scalar_from_value(value: &Value, field: &str) -> JsonltResult<KeyScalar> {
    let invalid = |what: &str| JsonltError::InvalidKey {
        reason: format!("key field '{}' value is {}", field, what),
    };
    match value {
        Value::String(s) => Ok(KeyScalar::Str(s.clone())),
        Value::Number(n) => {
            let int = if let Some(i) = n.as_i64() {
                i
            } else if n.as_u64().is_some() {
                // Larger than i64::MAX, so certainly beyond 2^53 - 1.
                return Err(invalid("outside valid integer range"));
            } else {
                let f = n.as_f64().unwrap_or(f64::NAN);
                if !f.is_finite() {
                    return Err(invalid("Infinity or NaN"));
                }
                if f.fract() != 0.0 {
                    return Err(invalid("not an integer"));
                }
                if f < MIN_INTEGER_KEY as f64 || f > MAX_INTEGER_KEY as f64 {
                    return Err(invalid("outside valid integer range"));
                }
                f as i64
            };
            if !(MIN_INTEGER_KEY..=MAX_INTEGER_KEY).contains(&int) {
                return Err(invalid("outside valid integer range"));
            }
            Ok(KeyScalar::Int(int))
        }
        Value::Null => Err(invalid("null")),
        Value::Bool(_) => Err(invalid("boolean")),
        Value::Array(_) => Err(invalid("an array")),
        Value::Object(_) => Err(invalid("an object")),
    }
}
