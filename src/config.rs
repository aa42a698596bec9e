//! Table configuration
//!
//! Options are supplied at construction time; nothing is read from the
//! environment. The defaults match the format limits (1024-byte serialized
//! keys, 1 MiB encoded lines) with no whole-file cap.

use std::time::Duration;

/// Parser strictness toward unknown reserved fields and duplicate keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseProfile {
    /// Reject unknown header fields, unknown `$`-prefixed record fields,
    /// and duplicate keys within a line. Output is always strict.
    Strict,
    /// Accept and ignore unknown header fields and `$` names; duplicate
    /// keys within a line resolve last-wins.
    Lenient,
}

/// Construction options for a [`Table`](crate::Table).
#[derive(Debug, Clone)]
pub struct TableOptions {
    /// Deadline for advisory lock acquisition. None blocks indefinitely.
    pub lock_timeout: Option<Duration>,
    /// Maximum serialized key length in bytes.
    pub max_key_len: usize,
    /// Maximum encoded line length in bytes (checked before any write).
    pub max_line_len: usize,
    /// Maximum table file size in bytes. None means unlimited.
    pub max_file_size: Option<u64>,
    /// Re-stat the file before cached reads and rebuild when it changed.
    pub auto_reload: bool,
    /// Parser profile for reading existing files.
    pub profile: ParseProfile,
}

impl TableOptions {
    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.max_key_len == 0 || self.max_key_len > 64 * 1024 {
            return Err("max_key_len must be in [1, 64KiB]".into());
        }
        if self.max_line_len < self.max_key_len {
            return Err("max_line_len must be >= max_key_len".into());
        }
        if let Some(max) = self.max_file_size {
            if max < self.max_line_len as u64 {
                return Err("max_file_size must be >= max_line_len".into());
            }
        }
        Ok(())
    }
}

impl Default for TableOptions {
    fn default() -> Self {
        Self {
            lock_timeout: None,
            max_key_len: 1024,
            max_line_len: 1024 * 1024,
            max_file_size: None,
            auto_reload: true,
            profile: ParseProfile::Strict,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(TableOptions::default().validate().is_ok());
    }

    #[test]
    fn test_zero_key_len_rejected() {
        let mut opts = TableOptions::default();
        opts.max_key_len = 0;
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_line_len_smaller_than_key_len_rejected() {
        let mut opts = TableOptions::default();
        opts.max_line_len = opts.max_key_len - 1;
        assert!(opts.validate().is_err());
    }

    #[test]
    fn test_zero_lock_timeout_means_single_attempt() {
        let mut opts = TableOptions::default();
        opts.lock_timeout = Some(Duration::ZERO);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_file_size_below_line_len_rejected() {
        let mut opts = TableOptions::default();
        opts.max_file_size = Some(10);
        assert!(opts.validate().is_err());
    }
}
