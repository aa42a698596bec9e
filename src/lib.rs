//! JSONLT — append-only keyed-record storage on line-delimited JSON
//!
//! A table is one UTF-8 text file: a `$jsonlt` header on line 1 declaring
//! the key specifier and format version, then one JSON object per line.
//! Later lines supersede earlier lines with the same key; a `$deleted`
//! sentinel removes a key. Version-control diffs show only what changed
//! (lines appended), while readers get a materialized current-state view.
//!
//! # Architecture
//!
//! - **Read path**: cached in-memory index (BTreeMap in canonical key
//!   order), rebuilt under shared lock when a stat check says the file
//!   changed
//! - **Write path**: validate and encode in memory, then append one line
//!   under exclusive lock with durable sync
//! - **Transactions**: snapshot + buffered overlay, optimistic
//!   first-committer-wins conflict detection at commit
//! - **Compaction**: rewrite header + live records to a temp sibling and
//!   atomically rename it into place
//!
//! Cross-process coordination is a whole-file advisory lock and nothing
//! else; a single `Table` instance is also safe to share across threads.

pub mod codec;
pub mod config;
pub mod error;
pub mod header;
pub mod index;
pub mod key;
pub mod lock;
pub mod platform;
pub mod record;
pub mod table;
pub mod transaction;

// Re-export key types for convenience
pub use config::{ParseProfile, TableOptions};
pub use error::{JsonltError, JsonltResult};
pub use header::Header;
pub use key::{Key, KeyScalar, KeySpec, MAX_INTEGER_KEY, MAX_TUPLE_ELEMENTS, MIN_INTEGER_KEY};
pub use record::Record;
pub use table::Table;
pub use transaction::Transaction;
