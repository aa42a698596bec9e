//! The `$jsonlt` header line
//!
//! Line 1 of every table file is a descriptor object declaring the format
//! version and the key specifier, optionally with a schema reference
//! (`$schema` URL or inline `schema` object, mutually exclusive) and a
//! free-form `meta` object. The engine preserves schema and meta fields
//! across compaction but does not interpret them.

use serde_json::{Map, Value};

use crate::codec::{encode_line, value_kind};
use crate::config::ParseProfile;
use crate::error::{JsonltError, JsonltResult};
use crate::key::{KeySpec, MAX_TUPLE_ELEMENTS};
use crate::record::HEADER_FIELD;

/// The only supported format version.
pub const FORMAT_VERSION: i64 = 1;

/// Parsed contents of the header line.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub version: i64,
    pub key: Option<KeySpec>,
    pub schema_url: Option<String>,
    pub schema: Option<Map<String, Value>>,
    pub meta: Option<Map<String, Value>>,
}

impl Header {
    /// A fresh version-1 header for a new table.
    pub fn new(key: Option<KeySpec>) -> Header {
        Header { version: FORMAT_VERSION, key, schema_url: None, schema: None, meta: None }
    }

    /// The header as a canonical line (without the trailing newline).
    pub fn to_line(&self) -> JsonltResult<String> {
        let mut inner = Map::new();
        inner.insert("version".to_owned(), Value::from(self.version));
        if let Some(key) = &self.key {
            inner.insert("key".to_owned(), key.to_value());
        }
        if let Some(url) = &self.schema_url {
            inner.insert("$schema".to_owned(), Value::String(url.clone()));
        }
        if let Some(schema) = &self.schema {
            inner.insert("schema".to_owned(), Value::Object(schema.clone()));
        }
        if let Some(meta) = &self.meta {
            inner.insert("meta".to_owned(), Value::Object(meta.clone()));
        }
        let mut object = Map::new();
        object.insert(HEADER_FIELD.to_owned(), Value::Object(inner));
        encode_line(&object)
    }
}

/// True when the object is a header line (`$jsonlt` present).
pub fn is_header_line(object: &Map<String, Value>) -> bool {
    object.contains_key(HEADER_FIELD)
}

/// Validate and extract the header from a decoded line-1 object.
pub fn parse_header(object: &Map<String, Value>, profile: ParseProfile) -> JsonltResult<Header> {
    let inner = match object.get(HEADER_FIELD) {
        Some(Value::Object(inner)) => inner,
        Some(_) => {
            return Err(header_error(format!("{} value must be an object", HEADER_FIELD)));
        }
        None => {
            return Err(header_error(format!("header line missing {} field", HEADER_FIELD)));
        }
    };

    if profile == ParseProfile::Strict {
        for field in object.keys() {
            if field != HEADER_FIELD {
                return Err(header_error(format!(
                    "header line contains unexpected field '{}'",
                    field
                )));
            }
        }
        for field in inner.keys() {
            if !matches!(field.as_str(), "version" | "key" | "$schema" | "schema" | "meta") {
                return Err(header_error(format!("unknown header field '{}'", field)));
            }
        }
    }

    let version = match inner.get("version") {
        Some(Value::Number(n)) => n
            .as_i64()
            .ok_or_else(|| header_error("version must be an integer".to_owned()))?,
        Some(_) => return Err(header_error("version must be an integer".to_owned())),
        None => return Err(header_error("missing required 'version' field".to_owned())),
    };
    if version != FORMAT_VERSION {
        return Err(header_error(format!("unsupported version {}", version)));
    }

    let key = match inner.get("key") {
        None => None,
        Some(value) => Some(parse_key_specifier(value)?),
    };

    let schema_url = match inner.get("$schema") {
        None => None,
        Some(Value::String(url)) => Some(url.clone()),
        Some(_) => return Err(header_error("$schema must be a string".to_owned())),
    };

    let schema = match inner.get("schema") {
        None => None,
        Some(Value::Object(map)) => Some(map.clone()),
        Some(_) => return Err(header_error("schema must be an object".to_owned())),
    };

    if schema_url.is_some() && schema.is_some() {
        return Err(header_error("$schema and schema are mutually exclusive".to_owned()));
    }

    let meta = match inner.get("meta") {
        None => None,
        Some(Value::Object(map)) => Some(map.clone()),
        Some(_) => return Err(header_error("meta must be an object".to_owned())),
    };

    Ok(Header { version, key, schema_url, schema, meta })
}

fn parse_key_specifier(value: &Value) -> JsonltResult<KeySpec> {
    let fields = match value {
        Value::String(field) => vec![field.clone()],
        Value::Array(items) => {
            if items.is_empty() {
                return Err(header_error("key specifier cannot be an empty array".to_owned()));
            }
            if items.len() > MAX_TUPLE_ELEMENTS {
                return Err(header_error(format!(
                    "key specifier with {} fields exceeds maximum of {} elements",
                    items.len(),
                    MAX_TUPLE_ELEMENTS
                )));
            }
            let mut fields = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    Value::String(field) => fields.push(field.clone()),
                    _ => {
                        return Err(header_error(
                            "key specifier array must contain only strings".to_owned(),
                        ));
                    }
                }
            }
            fields
        }
        other => {
            return Err(header_error(format!(
                "key specifier must be a string or array of strings, got {}",
                value_kind(other)
            )));
        }
    };
    KeySpec::from_fields(fields).map_err(|err| match err {
        JsonltError::InvalidKey { reason } => header_error(reason),
        other => other,
    })
}

fn header_error(reason: String) -> JsonltError {
    JsonltError::Parse { path: None, line: 1, reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn parse(value: Value) -> JsonltResult<Header> {
        parse_header(&object(value), ParseProfile::Strict)
    }

    #[test]
    fn test_is_header_line() {
        assert!(is_header_line(&object(json!({"$jsonlt": {"version": 1}}))));
        assert!(!is_header_line(&object(json!({"id": "alice"}))));
        assert!(!is_header_line(&object(json!({"jsonlt": {"version": 1}}))));
        assert!(!is_header_line(&object(json!({}))));
    }

    #[test]
    fn test_minimal_header() {
        let header = parse(json!({"$jsonlt": {"version": 1}})).unwrap();
        assert_eq!(header.version, 1);
        assert_eq!(header.key, None);
        assert_eq!(header.schema_url, None);
        assert_eq!(header.schema, None);
        assert_eq!(header.meta, None);
    }

    #[test]
    fn test_key_parsing() {
        let header = parse(json!({"$jsonlt": {"version": 1, "key": "id"}})).unwrap();
        assert_eq!(header.key, Some(KeySpec::Single("id".to_string())));

        // One-element arrays normalize to the single form.
        let header = parse(json!({"$jsonlt": {"version": 1, "key": ["id"]}})).unwrap();
        assert_eq!(header.key, Some(KeySpec::Single("id".to_string())));

        let header = parse(json!({"$jsonlt": {"version": 1, "key": ["org", "id"]}})).unwrap();
        assert_eq!(
            header.key,
            Some(KeySpec::Compound(vec!["org".to_string(), "id".to_string()]))
        );
    }

    #[test]
    fn test_version_errors() {
        for (value, msg) in [
            (json!({"$jsonlt": {"key": "id"}}), "missing required 'version' field"),
            (json!({"$jsonlt": {"version": "1"}}), "version must be an integer"),
            (json!({"$jsonlt": {"version": 1.0}}), "version must be an integer"),
            (json!({"$jsonlt": {"version": true}}), "version must be an integer"),
            (json!({"$jsonlt": {"version": 0}}), "unsupported version 0"),
            (json!({"$jsonlt": {"version": 2}}), "unsupported version 2"),
            (json!({"$jsonlt": {"version": -1}}), "unsupported version -1"),
        ] {
            let err = parse(value).unwrap_err();
            assert!(err.to_string().contains(msg), "{}", err);
        }
    }

    #[test]
    fn test_structure_errors() {
        for value in [
            json!({"$jsonlt": "not an object"}),
            json!({"$jsonlt": [1, 2, 3]}),
            json!({"$jsonlt": null}),
        ] {
            let err = parse(value).unwrap_err();
            assert!(err.to_string().contains("$jsonlt value must be an object"), "{}", err);
        }
    }

    #[test]
    fn test_key_errors() {
        for (value, msg) in [
            (json!({"$jsonlt": {"version": 1, "key": 42}}), "must be a string or array"),
            (json!({"$jsonlt": {"version": 1, "key": []}}), "empty array"),
            (json!({"$jsonlt": {"version": 1, "key": ["id", 42]}}), "only strings"),
            (json!({"$jsonlt": {"version": 1, "key": ["id", "name", "id"]}}), "duplicate"),
        ] {
            let err = parse(value).unwrap_err();
            assert!(err.to_string().contains(msg), "{}", err);
        }
    }

    #[test]
    fn test_key_tuple_limit() {
        let fields: Vec<String> = (0..16).map(|i| format!("field{}", i)).collect();
        let header = parse(json!({"$jsonlt": {"version": 1, "key": fields}})).unwrap();
        assert_eq!(header.key.unwrap().fields().len(), 16);

        let fields: Vec<String> = (0..17).map(|i| format!("field{}", i)).collect();
        let err = parse(json!({"$jsonlt": {"version": 1, "key": fields}})).unwrap_err();
        assert!(err.to_string().contains("maximum of 16 elements"));
    }

    #[test]
    fn test_schema_fields() {
        let header = parse(
            json!({"$jsonlt": {"version": 1, "$schema": "https://example.com/schema.json"}}),
        )
        .unwrap();
        assert_eq!(header.schema_url.as_deref(), Some("https://example.com/schema.json"));
        assert_eq!(header.schema, None);

        let header =
            parse(json!({"$jsonlt": {"version": 1, "schema": {"type": "object"}}})).unwrap();
        assert_eq!(header.schema, Some(object(json!({"type": "object"}))));

        let err = parse(json!({"$jsonlt": {
            "version": 1,
            "$schema": "https://example.com/schema.json",
            "schema": {"type": "object"},
        }}))
        .unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));
    }

    #[test]
    fn test_schema_type_errors() {
        let err = parse(json!({"$jsonlt": {"version": 1, "$schema": 123}})).unwrap_err();
        assert!(err.to_string().contains("$schema must be a string"));
        let err = parse(json!({"$jsonlt": {"version": 1, "schema": "nope"}})).unwrap_err();
        assert!(err.to_string().contains("schema must be an object"));
    }

    #[test]
    fn test_meta_parsing() {
        let header =
            parse(json!({"$jsonlt": {"version": 1, "meta": {"created": "2025-01-15"}}})).unwrap();
        assert_eq!(header.meta, Some(object(json!({"created": "2025-01-15"}))));

        for value in [json!("x"), json!(["a"]), json!(42)] {
            let err = parse(json!({"$jsonlt": {"version": 1, "meta": value}})).unwrap_err();
            assert!(err.to_string().contains("meta must be an object"));
        }
    }

    #[test]
    fn test_strict_rejects_unknown_fields() {
        let err = parse(json!({"$jsonlt": {"version": 1, "extra": true}})).unwrap_err();
        assert!(err.to_string().contains("unknown header field 'extra'"));

        let err = parse(json!({"$jsonlt": {"version": 1}, "other": 1})).unwrap_err();
        assert!(err.to_string().contains("unexpected field 'other'"));
    }

    #[test]
    fn test_lenient_ignores_unknown_fields() {
        let header = parse_header(
            &object(json!({"$jsonlt": {"version": 1, "key": "id", "extra": true}, "other": 1})),
            ParseProfile::Lenient,
        )
        .unwrap();
        assert_eq!(header.key, Some(KeySpec::Single("id".to_string())));
    }

    #[test]
    fn test_serialize_minimal() {
        let header = Header::new(None);
        assert_eq!(header.to_line().unwrap(), r#"{"$jsonlt":{"version":1}}"#);
    }

    #[test]
    fn test_serialize_with_keys() {
        let header = Header::new(Some(KeySpec::single("id").unwrap()));
        assert_eq!(header.to_line().unwrap(), r#"{"$jsonlt":{"key":"id","version":1}}"#);

        let header = Header::new(Some(
            KeySpec::from_fields(vec!["org".to_string(), "id".to_string()]).unwrap(),
        ));
        assert_eq!(
            header.to_line().unwrap(),
            r#"{"$jsonlt":{"key":["org","id"],"version":1}}"#
        );
    }

    #[test]
    fn test_serialize_round_trip_with_meta() {
        let mut header = Header::new(Some(KeySpec::single("id").unwrap()));
        header.meta = Some(object(json!({"author": "test"})));
        let line = header.to_line().unwrap();
        assert!(line.contains(r#""meta":{"author":"test"}"#));

        let decoded =
            crate::codec::decode_line(&line, ParseProfile::Strict).unwrap();
        let parsed = parse_header(&decoded, ParseProfile::Strict).unwrap();
        assert_eq!(parsed, header);
    }
}
