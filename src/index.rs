//! Materialized index
//!
//! The index is the deterministic fold of the file: line 1 is the header,
//! every later line either sets its key (record) or removes it (tombstone),
//! and the latest line wins. Entries live in a BTreeMap keyed by canonical
//! key, so iteration order is the canonical order for free. Byte offsets of
//! the producing lines are retained for compaction and snapshot reasoning.
//!
//! A `FileCursor` fingerprints the on-disk file (size, mtime, plus an
//! in-memory generation counter bumped on local writes) so staleness checks
//! are one stat call.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::SystemTime;

use serde_json::{Map, Value};

use crate::codec::decode_line;
use crate::config::ParseProfile;
use crate::error::{JsonltError, JsonltResult};
use crate::header::{is_header_line, parse_header, Header};
use crate::key::{Key, KeySpec};
use crate::record::{validate_tombstone, DELETED_FIELD};

/// One live entry: the materialized record and where its line starts.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    pub record: Map<String, Value>,
    /// Byte offset of the line that produced this record.
    pub offset: u64,
}

/// The replayed view of a table file.
#[derive(Debug, Clone)]
pub struct Index {
    pub header: Option<Header>,
    /// The key specifier in effect: the supplied one, else the header's.
    pub spec: Option<KeySpec>,
    pub entries: BTreeMap<Key, IndexEntry>,
}

impl Index {
    /// An index over nothing (missing or empty file).
    pub fn empty(spec: Option<KeySpec>) -> Index {
        Index { header: None, spec, entries: BTreeMap::new() }
    }
}

/// Compact file-identity fingerprint used to detect external mutation.
///
/// `(size, mtime)` comes from stat; `generation` is bumped in memory on
/// every local write so a Table never mistakes its own same-second append
/// for an unchanged file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileCursor {
    pub size: u64,
    pub mtime: Option<SystemTime>,
    pub generation: u64,
}

impl FileCursor {
    /// Cursor for a file that does not exist.
    pub fn missing(generation: u64) -> FileCursor {
        FileCursor { size: 0, mtime: None, generation }
    }

    pub fn from_metadata(meta: &fs::Metadata, generation: u64) -> FileCursor {
        FileCursor { size: meta.len(), mtime: meta.modified().ok(), generation }
    }

    /// Whether the on-disk identity differs from this cursor.
    pub fn disk_changed(&self, meta: Option<&fs::Metadata>) -> bool {
        match meta {
            None => self.size != 0 || self.mtime.is_some(),
            Some(meta) => self.size != meta.len() || self.mtime != meta.modified().ok(),
        }
    }
}

/// Replay file content into an index.
///
/// `supplied` is the caller's key specifier; when absent the header's is
/// adopted. Per the format invariants, a non-empty file must carry a header
/// on line 1. All failures cite the 1-based line number; the caller's
/// cached index is never touched because the fold builds a fresh map.
pub fn build_index(
    bytes: &[u8],
    supplied: Option<&KeySpec>,
    profile: ParseProfile,
    path: Option<&Path>,
) -> JsonltResult<Index> {
    let mut header: Option<Header> = None;
    let mut spec: Option<KeySpec> = supplied.cloned();
    let mut entries: BTreeMap<Key, IndexEntry> = BTreeMap::new();

    for (line_no, offset, raw) in LineIter::new(bytes) {
        if raw.is_empty() {
            continue;
        }
        let text = decode_utf8(raw, line_no, path)?;
        let object = locate(decode_line(text, profile), path, line_no)?;

        if is_header_line(&object) {
            if line_no != 1 {
                return Err(JsonltError::Parse {
                    path: path.map(Path::to_path_buf),
                    line: line_no,
                    reason: "header must be on first line".to_owned(),
                });
            }
            let parsed = locate(parse_header(&object, profile), path, line_no)?;
            if spec.is_none() {
                spec = parsed.key.clone();
            }
            header = Some(parsed);
            continue;
        }

        if line_no == 1 {
            return Err(JsonltError::Parse {
                path: path.map(Path::to_path_buf),
                line: 1,
                reason: "missing header: first line must be a $jsonlt descriptor".to_owned(),
            });
        }

        let spec = spec.as_ref().ok_or_else(|| JsonltError::InvalidKey {
            reason: "no key specifier: not declared in the header and none supplied".to_owned(),
        })?;

        if object.contains_key(DELETED_FIELD) {
            let key = locate(validate_tombstone(&object, spec), path, line_no)?;
            entries.remove(&key);
        } else {
            locate(check_reserved_fields(&object, profile), path, line_no)?;
            let key = locate(spec.extract_key(&object), path, line_no)?;
            entries.insert(key, IndexEntry { record: object, offset });
        }
    }

    Ok(Index { header, spec, entries })
}

/// Parse a region of appended lines and collect the keys they touch.
///
/// Used by transaction commit to see which keys changed since its snapshot.
/// The region must consist of complete record/tombstone lines; anything
/// else (a header, a partial line from a rewrite) is an error, which the
/// caller treats as "the file did not simply grow".
pub fn scan_appended_keys(
    bytes: &[u8],
    spec: &KeySpec,
    profile: ParseProfile,
) -> JsonltResult<Vec<Key>> {
    let mut keys = Vec::new();
    for (line_no, _offset, raw) in LineIter::new(bytes) {
        if raw.is_empty() {
            continue;
        }
        let text = decode_utf8(raw, line_no, None)?;
        let object = decode_line(text, profile)?;
        if is_header_line(&object) {
            return Err(JsonltError::Parse {
                path: None,
                line: line_no,
                reason: "unexpected header in appended lines".to_owned(),
            });
        }
        let key = if object.contains_key(DELETED_FIELD) {
            validate_tombstone(&object, spec)?
        } else {
            spec.extract_key(&object)?
        };
        keys.push(key);
    }
    Ok(keys)
}

/// Strict profile rejects reserved `$` names other than `$deleted`.
fn check_reserved_fields(object: &Map<String, Value>, profile: ParseProfile) -> JsonltResult<()> {
    if profile == ParseProfile::Lenient {
        return Ok(());
    }
    for field in object.keys() {
        if field.starts_with('$') && field != DELETED_FIELD {
            return Err(JsonltError::Parse {
                path: None,
                line: 0,
                reason: format!("unknown reserved field '{}'", field),
            });
        }
    }
    Ok(())
}

fn decode_utf8<'a>(raw: &'a [u8], line_no: usize, path: Option<&Path>) -> JsonltResult<&'a str> {
    std::str::from_utf8(raw).map_err(|_| JsonltError::Parse {
        path: path.map(Path::to_path_buf),
        line: line_no,
        reason: "invalid UTF-8".to_owned(),
    })
}

/// Attach file/line context to location-free parse failures.
///
/// Key-shape violations found during replay are malformed-file problems,
/// so they surface as parse errors with the line number, per the failure
/// contract of index builds.
fn locate<T>(result: JsonltResult<T>, path: Option<&Path>, line_no: usize) -> JsonltResult<T> {
    result.map_err(|err| match err {
        JsonltError::Parse { reason, .. } => JsonltError::Parse {
            path: path.map(Path::to_path_buf),
            line: line_no,
            reason,
        },
        JsonltError::InvalidKey { reason } => JsonltError::Parse {
            path: path.map(Path::to_path_buf),
            line: line_no,
            reason,
        },
        other => other,
    })
}

/// Iterate `(line_number, byte_offset, line_without_terminator)`.
///
/// Strips a leading UTF-8 BOM, accepts both LF and CRLF, and yields a final
/// line that lacks its newline (truncation shows up as a JSON parse error
/// on that line).
struct LineIter<'a> {
    bytes: &'a [u8],
    pos: usize,
    line_no: usize,
}

impl<'a> LineIter<'a> {
    fn new(bytes: &'a [u8]) -> LineIter<'a> {
        let pos = if bytes.starts_with(b"\xef\xbb\xbf") { 3 } else { 0 };
        LineIter { bytes, pos, line_no: 0 }
    }
}

impl<'a> Iterator for LineIter<'a> {
    type Item = (usize, u64, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.bytes.len() {
            return None;
        }
        let offset = self.pos;
        let rest = &self.bytes[self.pos..];
        let (mut line, next_pos) = match rest.iter().position(|&b| b == b'\n') {
            Some(nl) => (&rest[..nl], self.pos + nl + 1),
            None => (rest, self.bytes.len()),
        };
        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }
        self.pos = next_pos;
        self.line_no += 1;
        Some((self.line_no, offset as u64, line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn id_spec() -> KeySpec {
        KeySpec::single("id").unwrap()
    }

    fn build(content: &str) -> JsonltResult<Index> {
        build_index(content.as_bytes(), Some(&id_spec()), ParseProfile::Strict, None)
    }

    const HEADER: &str = r#"{"$jsonlt":{"key":"id","version":1}}"#;

    #[test]
    fn test_empty_bytes() {
        let index = build("").unwrap();
        assert!(index.header.is_none());
        assert!(index.entries.is_empty());
    }

    #[test]
    fn test_header_only_file() {
        let index = build(&format!("{}\n", HEADER)).unwrap();
        let header = index.header.unwrap();
        assert_eq!(header.version, 1);
        assert_eq!(header.key, Some(id_spec()));
        assert!(index.entries.is_empty());
    }

    #[test]
    fn test_adopts_header_spec_when_none_supplied() {
        let content = format!("{}\n{{\"id\":\"alice\"}}\n", HEADER);
        let index = build_index(content.as_bytes(), None, ParseProfile::Strict, None).unwrap();
        assert_eq!(index.spec, Some(id_spec()));
        assert_eq!(index.entries.len(), 1);
    }

    #[test]
    fn test_headerless_file_rejected() {
        let err = build("{\"id\":1}\n").unwrap_err();
        assert!(err.to_string().contains("missing header"), "{}", err);
    }

    #[test]
    fn test_header_not_on_first_line_rejected() {
        let content = format!("{}\n{}\n", HEADER, HEADER);
        let err = build(&content).unwrap_err();
        assert!(err.to_string().contains("header must be on first line"));
    }

    #[test]
    fn test_last_line_wins() {
        let content = format!(
            "{}\n{}\n{}\n",
            HEADER,
            r#"{"id":"alice","role":"user"}"#,
            r#"{"id":"alice","role":"admin"}"#
        );
        let index = build(&content).unwrap();
        assert_eq!(index.entries.len(), 1);
        let entry = &index.entries[&Key::from("alice")];
        assert_eq!(entry.record.get("role"), Some(&json!("admin")));
    }

    #[test]
    fn test_tombstone_removes_key() {
        let content = format!(
            "{}\n{}\n{}\n",
            HEADER,
            r#"{"id":"alice","role":"admin"}"#,
            r#"{"$deleted":true,"id":"alice"}"#
        );
        let index = build(&content).unwrap();
        assert!(index.entries.is_empty());
    }

    #[test]
    fn test_tombstone_for_absent_key_is_noop() {
        let content = format!("{}\n{}\n", HEADER, r#"{"$deleted":true,"id":"ghost"}"#);
        let index = build(&content).unwrap();
        assert!(index.entries.is_empty());
    }

    #[test]
    fn test_upsert_after_tombstone() {
        let content = format!(
            "{}\n{}\n{}\n{}\n",
            HEADER,
            r#"{"id":"alice","role":"admin"}"#,
            r#"{"$deleted":true,"id":"alice"}"#,
            r#"{"id":"alice","role":"user"}"#
        );
        let index = build(&content).unwrap();
        let entry = &index.entries[&Key::from("alice")];
        assert_eq!(entry.record.get("role"), Some(&json!("user")));
    }

    #[test]
    fn test_entries_iterate_in_canonical_order() {
        let content = format!(
            "{}\n{}\n{}\n{}\n{}\n",
            HEADER,
            r#"{"id":"b"}"#,
            r#"{"id":2}"#,
            r#"{"id":"a"}"#,
            r#"{"id":1}"#
        );
        let index = build(&content).unwrap();
        let keys: Vec<Key> = index.entries.keys().cloned().collect();
        assert_eq!(
            keys,
            vec![Key::from(1), Key::from(2), Key::from("a"), Key::from("b")]
        );
    }

    #[test]
    fn test_offsets_recorded() {
        let content = format!("{}\n{}\n{}\n", HEADER, r#"{"id":"a"}"#, r#"{"id":"b"}"#);
        let index = build(&content).unwrap();
        let first = HEADER.len() as u64 + 1;
        assert_eq!(index.entries[&Key::from("a")].offset, first);
        assert_eq!(index.entries[&Key::from("b")].offset, first + 11);
    }

    #[test]
    fn test_truncated_line_cites_line_number() {
        let content = format!("{}\n{}\n{}", HEADER, r#"{"id":"b"}"#, r#"{"id":"c"#);
        let err = build(&content).unwrap_err();
        match err {
            JsonltError::Parse { line, reason, .. } => {
                assert_eq!(line, 3);
                assert!(reason.contains("invalid JSON"));
            }
            other => panic!("expected Parse error, got {}", other),
        }
    }

    #[test]
    fn test_invalid_utf8_cites_line_number() {
        let mut content = format!("{}\n", HEADER).into_bytes();
        content.extend_from_slice(b"{\"id\": \"\xff\xfe\"}\n");
        let err = build_index(&content, Some(&id_spec()), ParseProfile::Strict, None).unwrap_err();
        match err {
            JsonltError::Parse { line, reason, .. } => {
                assert_eq!(line, 2);
                assert!(reason.contains("invalid UTF-8"));
            }
            other => panic!("expected Parse error, got {}", other),
        }
    }

    #[test]
    fn test_missing_key_field_is_parse_error_with_line() {
        let content = format!("{}\n{}\n", HEADER, r#"{"name":"alice"}"#);
        let err = build(&content).unwrap_err();
        match err {
            JsonltError::Parse { line, reason, .. } => {
                assert_eq!(line, 2);
                assert!(reason.contains("missing required key field 'id'"));
            }
            other => panic!("expected Parse error, got {}", other),
        }
    }

    #[test]
    fn test_bom_stripped_and_crlf_normalized() {
        let mut content = b"\xef\xbb\xbf".to_vec();
        content.extend_from_slice(format!("{}\r\n{}\r\n", HEADER, r#"{"id":"a"}"#).as_bytes());
        let index = build_index(&content, Some(&id_spec()), ParseProfile::Strict, None).unwrap();
        assert_eq!(index.entries.len(), 1);
    }

    #[test]
    fn test_final_line_without_newline_accepted() {
        let content = format!("{}\n{}", HEADER, r#"{"id":"a"}"#);
        let index = build(&content).unwrap();
        assert_eq!(index.entries.len(), 1);
    }

    #[test]
    fn test_strict_rejects_unknown_reserved_field() {
        let content = format!("{}\n{}\n", HEADER, r#"{"$custom":1,"id":"a"}"#);
        let err = build(&content).unwrap_err();
        assert!(err.to_string().contains("unknown reserved field '$custom'"));

        let index =
            build_index(content.as_bytes(), Some(&id_spec()), ParseProfile::Lenient, None)
                .unwrap();
        assert_eq!(index.entries.len(), 1);
    }

    #[test]
    fn test_compound_key_fold() {
        let spec = KeySpec::from_fields(vec!["org".into(), "id".into()]).unwrap();
        let content = concat!(
            r#"{"$jsonlt":{"key":["org","id"],"version":1}}"#, "\n",
            r#"{"org":"acme","id":1,"name":"alice"}"#, "\n",
            r#"{"org":"acme","id":2,"name":"bob"}"#, "\n",
            r#"{"$deleted":true,"org":"acme","id":1}"#, "\n",
        );
        let index =
            build_index(content.as_bytes(), Some(&spec), ParseProfile::Strict, None).unwrap();
        assert_eq!(index.entries.len(), 1);
        assert!(index
            .entries
            .contains_key(&Key::Tuple(vec!["acme".into(), 2.into()])));
    }

    #[test]
    fn test_scan_appended_keys() {
        let appended = concat!(
            r#"{"id":"alice","v":1}"#, "\n",
            r#"{"$deleted":true,"id":"bob"}"#, "\n",
        );
        let keys =
            scan_appended_keys(appended.as_bytes(), &id_spec(), ParseProfile::Strict).unwrap();
        assert_eq!(keys, vec![Key::from("alice"), Key::from("bob")]);
    }

    #[test]
    fn test_scan_appended_keys_rejects_partial_lines() {
        // A rewrite can leave the old size pointing mid-line; the scan must
        // refuse to interpret that region.
        let garbage = br#"9}"{"id":"x"}"#;
        assert!(scan_appended_keys(garbage, &id_spec(), ParseProfile::Strict).is_err());
    }

    #[test]
    fn test_cursor_disk_changed() {
        let cursor = FileCursor::missing(0);
        assert!(!cursor.disk_changed(None));

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("t.jsonlt");
        std::fs::write(&path, b"{}\n").unwrap();
        let meta = std::fs::metadata(&path).unwrap();
        assert!(cursor.disk_changed(Some(&meta)));

        let cursor = FileCursor::from_metadata(&meta, 0);
        assert!(!cursor.disk_changed(Some(&meta)));
        assert!(cursor.disk_changed(None));
    }
}
