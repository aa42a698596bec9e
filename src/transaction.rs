//! Snapshot-isolated transactions
//!
//! A transaction captures the materialized view and file cursor at creation
//! and buffers writes in memory, so it holds no file lock until commit.
//! Long-lived transactions never block readers or other writers. Reads are
//! served from an overlay: staged writes mask the snapshot, the snapshot
//! masks the disk. Repeated writes to one key coalesce, last wins.
//!
//! Concurrency control is optimistic, first-committer-wins. The conflict
//! surface is the union of the write-set with the intersection of read-set
//! and write-set; a key the transaction only read never conflicts, and a
//! blind write to a key conflicts like any other write.
//! Commit takes the exclusive lock, checks that surface against what
//! landed on disk after the snapshot, and either appends all buffered
//! operations as one contiguous fsync'd group in sorted-key order or fails
//! with a conflict error naming the key.
//!
//! `commit` and `abort` consume the transaction, so use-after-finalize is
//! unrepresentable; dropping an uncommitted transaction aborts it. Only one
//! transaction may be active per table at a time.

use std::collections::{BTreeMap, BTreeSet};

use hashbrown::HashSet;

use crate::codec::encode_line;
use crate::error::{JsonltError, JsonltResult};
use crate::index::FileCursor;
use crate::key::{Key, KeySpec};
use crate::record::{build_tombstone, validate_record, Record};
use crate::table::{check_key_len, check_line_len, Table};

/// A buffered operation on one key. Later writes to the same key replace
/// earlier ones.
#[derive(Debug, Clone)]
pub(crate) enum WriteOp {
    Put(Record),
    Delete,
}

/// A buffered, snapshot-isolated view over a [`Table`].
pub struct Transaction<'t> {
    table: &'t Table,
    snapshot: BTreeMap<Key, Record>,
    snapshot_cursor: FileCursor,
    read_set: HashSet<Key>,
    writes: BTreeMap<Key, WriteOp>,
    finished: bool,
}

impl<'t> Transaction<'t> {
    pub(crate) fn new(
        table: &'t Table,
        snapshot: BTreeMap<Key, Record>,
        snapshot_cursor: FileCursor,
    ) -> Transaction<'t> {
        Transaction {
            table,
            snapshot,
            snapshot_cursor,
            read_set: HashSet::new(),
            writes: BTreeMap::new(),
            finished: false,
        }
    }

    fn spec(&self) -> &KeySpec {
        self.table.key_spec()
    }

    /// Get the record for a key as of the snapshot plus this transaction's
    /// own writes. The key is recorded in the read-set.
    pub fn get(&mut self, key: impl Into<Key>) -> JsonltResult<Option<Record>> {
        let key = key.into();
        key.validate_lookup()?;
        self.read_set.insert(key.clone());
        Ok(self.overlay_get(&key).cloned())
    }

    /// Whether a key exists in the overlay view. Recorded as a read.
    pub fn has(&mut self, key: impl Into<Key>) -> JsonltResult<bool> {
        let key = key.into();
        key.validate_lookup()?;
        self.read_set.insert(key.clone());
        Ok(self.overlay_get(&key).is_some())
    }

    /// All records in canonical key order. Iteration reads every snapshot
    /// key.
    pub fn all(&mut self) -> JsonltResult<Vec<Record>> {
        self.register_snapshot_reads();
        Ok(self.overlay().into_values().cloned().collect())
    }

    /// All records in canonical key order. Alias of [`Transaction::all`].
    pub fn values(&mut self) -> JsonltResult<Vec<Record>> {
        self.all()
    }

    /// All keys in canonical order. Iteration reads every snapshot key.
    pub fn keys(&mut self) -> JsonltResult<Vec<Key>> {
        self.register_snapshot_reads();
        Ok(self.overlay().into_keys().cloned().collect())
    }

    /// All (key, record) pairs in canonical key order.
    pub fn items(&mut self) -> JsonltResult<Vec<(Key, Record)>> {
        self.register_snapshot_reads();
        Ok(self
            .overlay()
            .into_iter()
            .map(|(key, record)| (key.clone(), record.clone()))
            .collect())
    }

    /// Number of records in the overlay view.
    pub fn count(&mut self) -> JsonltResult<usize> {
        self.register_snapshot_reads();
        Ok(self.overlay().len())
    }

    /// True when the overlay view holds no records.
    pub fn is_empty(&mut self) -> JsonltResult<bool> {
        Ok(self.count()? == 0)
    }

    /// Records matching a predicate, in canonical key order.
    pub fn find<P>(&mut self, mut predicate: P, limit: Option<usize>) -> JsonltResult<Vec<Record>>
    where
        P: FnMut(&Record) -> bool,
    {
        self.register_snapshot_reads();
        let mut results = Vec::new();
        for record in self.overlay().into_values() {
            if predicate(record) {
                results.push(record.clone());
                if limit.is_some_and(|limit| results.len() >= limit) {
                    break;
                }
            }
        }
        Ok(results)
    }

    /// First record matching a predicate, in canonical key order.
    pub fn find_one<P>(&mut self, mut predicate: P) -> JsonltResult<Option<Record>>
    where
        P: FnMut(&Record) -> bool,
    {
        Ok(self.find(&mut predicate, Some(1))?.into_iter().next())
    }

    /// Stage an insert or update. Validated now; nothing touches the file
    /// until commit.
    pub fn put(&mut self, record: Record) -> JsonltResult<()> {
        let key = validate_record(&record, self.spec())?;
        check_key_len(&key, self.table.options())?;
        let line = encode_line(&record)?;
        check_line_len(&line, self.table.options())?;
        self.writes.insert(key, WriteOp::Put(record));
        Ok(())
    }

    /// Stage a delete. Returns whether the key existed in the overlay view.
    ///
    /// Unlike [`Table::delete`], deleting an absent key is legal here: the
    /// tombstone intent is recorded and written at commit.
    pub fn delete(&mut self, key: impl Into<Key>) -> JsonltResult<bool> {
        let key = key.into();
        self.spec().check_arity(&key)?;
        check_key_len(&key, self.table.options())?;
        let line = encode_line(&build_tombstone(&key, self.spec())?)?;
        check_line_len(&line, self.table.options())?;
        let existed = self.overlay_get(&key).is_some();
        self.writes.insert(key, WriteOp::Delete);
        Ok(existed)
    }

    /// Remove and return the record for a key; missing-key error if absent.
    pub fn pop(&mut self, key: impl Into<Key>) -> JsonltResult<Record> {
        let key = key.into();
        let record = self
            .get(key.clone())?
            .ok_or_else(|| JsonltError::MissingKey { key: key.clone() })?;
        self.delete(key)?;
        Ok(record)
    }

    /// Return the existing record for the record's key, staging an insert
    /// when the key is absent.
    pub fn set_default(&mut self, record: Record) -> JsonltResult<Record> {
        let key = validate_record(&record, self.spec())?;
        if let Some(existing) = self.get(key)? {
            return Ok(existing);
        }
        self.put(record.clone())?;
        Ok(record)
    }

    /// Stage a put for every record in the iterator, in order.
    pub fn update<I>(&mut self, records: I) -> JsonltResult<()>
    where
        I: IntoIterator<Item = Record>,
    {
        for record in records {
            self.put(record)?;
        }
        Ok(())
    }

    /// Commit the buffered writes.
    ///
    /// Aborts with a conflict error when a key in the conflict surface
    /// (write-set ∪ (read-set ∩ write-set)) was mutated on disk after the
    /// snapshot; the first committer wins. A transaction with no writes
    /// commits trivially without taking the lock.
    pub fn commit(mut self) -> JsonltResult<()> {
        self.finished = true;
        let candidates: BTreeSet<Key> = self
            .writes
            .keys()
            .cloned()
            .chain(
                self.read_set
                    .iter()
                    .filter(|key| self.writes.contains_key(*key))
                    .cloned(),
            )
            .collect();
        let result = self.table.commit_transaction(
            &self.snapshot,
            self.snapshot_cursor,
            &self.writes,
            &candidates,
        );
        self.table.end_transaction();
        result
    }

    /// Discard the buffered writes without touching the file.
    pub fn abort(mut self) {
        self.finished = true;
        self.table.end_transaction();
    }

    fn overlay_get(&self, key: &Key) -> Option<&Record> {
        match self.writes.get(key) {
            Some(WriteOp::Put(record)) => Some(record),
            Some(WriteOp::Delete) => None,
            None => self.snapshot.get(key),
        }
    }

    /// The merged view: snapshot with staged writes applied, in canonical
    /// key order.
    fn overlay(&self) -> BTreeMap<&Key, &Record> {
        let mut view: BTreeMap<&Key, &Record> = self.snapshot.iter().collect();
        for (key, op) in &self.writes {
            match op {
                WriteOp::Put(record) => {
                    view.insert(key, record);
                }
                WriteOp::Delete => {
                    view.remove(key);
                }
            }
        }
        view
    }

    fn register_snapshot_reads(&mut self) {
        for key in self.snapshot.keys() {
            self.read_set.insert(key.clone());
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        // An uncommitted transaction aborts: buffers are discarded and the
        // table accepts a new transaction.
        if !self.finished {
            self.table.end_transaction();
        }
    }
}

impl std::fmt::Debug for Transaction<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("table", &self.table.path())
            .field("staged_writes", &self.writes.len())
            .finish()
    }
}
