//! Error types for JSONLT operations
//!
//! All failures are represented by the JsonltError enum, which carries
//! enough context (paths, line numbers, keys) to diagnose a broken table
//! without re-reading the file.

use std::error::Error;
use std::fmt;
use std::io;
use std::path::PathBuf;

use serde_json::Map;
use serde_json::Value;

use crate::key::Key;

/// JSONLT error types with detailed context
#[derive(Debug)]
pub enum JsonltError {
    /// Malformed file: bad header, invalid UTF-8, invalid JSON line,
    /// duplicate keys within a line, or a record missing its key fields.
    Parse {
        /// The file the line came from, when known
        path: Option<PathBuf>,
        /// 1-based line number of the offending line (0 when not line-bound)
        line: usize,
        /// Description of what was wrong with the line
        reason: String,
    },

    /// Key value or shape does not conform to the table's key specifier
    InvalidKey {
        /// Description of the violation
        reason: String,
    },

    /// I/O operation failed
    File {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// Could not acquire the advisory file lock within the deadline
    Lock {
        /// Path of the file being locked
        path: PathBuf,
        /// Description of the failure
        message: String,
    },

    /// A configured size limit was exceeded
    Limit {
        /// Which limit was hit ("key length", "line length", ...)
        what: &'static str,
        /// Observed size
        actual: u64,
        /// Configured maximum
        limit: u64,
    },

    /// Operation on a finalized transaction, or a nested transaction attempt
    TransactionState {
        /// Description of the invalid state
        reason: String,
    },

    /// Commit aborted: a written key was mutated on disk after the snapshot
    Conflict {
        /// The key both sides touched
        key: Key,
        /// The record as of the transaction's snapshot (None = absent)
        expected: Option<Map<String, Value>>,
        /// The record currently on disk (None = deleted)
        actual: Option<Map<String, Value>>,
    },

    /// Delete of a key that is not present in the table
    MissingKey {
        /// The key that was not found
        key: Key,
    },
}

impl fmt::Display for JsonltError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JsonltError::Parse { path, line, reason } => {
                match (path, *line) {
                    (Some(path), 0) => write!(f, "parse error in {}: {}", path.display(), reason),
                    (Some(path), line) => {
                        write!(f, "parse error in {} at line {}: {}", path.display(), line, reason)
                    }
                    (None, 0) => write!(f, "parse error: {}", reason),
                    (None, line) => write!(f, "parse error at line {}: {}", line, reason),
                }
            }

            JsonltError::InvalidKey { reason } => write!(f, "invalid key: {}", reason),

            JsonltError::File { path, kind, message } => {
                if let Some(path) = path {
                    write!(f, "I/O error in {}: {} ({})", path.display(), message, kind)
                } else {
                    write!(f, "I/O error: {} ({})", message, kind)
                }
            }

            JsonltError::Lock { path, message } => {
                write!(f, "could not acquire file lock on {}: {}", path.display(), message)
            }

            JsonltError::Limit { what, actual, limit } => {
                write!(f, "{} {} exceeds maximum {}", what, actual, limit)
            }

            JsonltError::TransactionState { reason } => {
                write!(f, "invalid transaction state: {}", reason)
            }

            JsonltError::Conflict { key, .. } => {
                write!(f, "conflict detected: key {} was modified concurrently", key)
            }

            JsonltError::MissingKey { key } => write!(f, "key not found: {}", key),
        }
    }
}

impl Error for JsonltError {}

/// Convert std::io::Error to JsonltError::File
impl From<io::Error> for JsonltError {
    fn from(err: io::Error) -> Self {
        JsonltError::File {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for JSONLT operations
pub type JsonltResult<T> = Result<T, JsonltError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::Key;

    #[test]
    fn test_parse_error_display_includes_line() {
        let err = JsonltError::Parse {
            path: Some(PathBuf::from("/tmp/users.jsonlt")),
            line: 3,
            reason: "invalid JSON".to_string(),
        };
        let display = format!("{}", err);
        assert!(display.contains("line 3"));
        assert!(display.contains("users.jsonlt"));
        assert!(display.contains("invalid JSON"));
    }

    #[test]
    fn test_conflict_display_names_key() {
        let err = JsonltError::Conflict {
            key: Key::from("alice"),
            expected: None,
            actual: None,
        };
        let display = format!("{}", err);
        assert!(display.contains("conflict detected"));
        assert!(display.contains("alice"));
    }

    #[test]
    fn test_limit_display() {
        let err = JsonltError::Limit { what: "key length", actual: 1032, limit: 1024 };
        assert_eq!(format!("{}", err), "key length 1032 exceeds maximum 1024");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: JsonltError = io_err.into();
        match err {
            JsonltError::File { kind, .. } => assert_eq!(kind, io::ErrorKind::NotFound),
            _ => panic!("Expected File error"),
        }
    }
}
