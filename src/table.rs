//! The table: public entry point of the engine.
//!
//! A `Table` owns a path, a fixed key specifier, and a cached materialized
//! index guarded by a mutex, so one instance is safe to share across
//! threads. Across processes the only coordination is the advisory file
//! lock: reads take it shared, every mutation takes it exclusive.
//!
//! WRITE ORDERING (the fundamental contract):
//! 1. validate and encode in memory; limit errors fire before any byte moves
//! 2. exclusive lock, re-stat, rebuild the index if the file changed
//! 3. append, durable_sync
//! 4. only then patch the cached index and cursor
//!
//! If the append fails, the cached index is never modified.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::codec::encode_line;
use crate::config::TableOptions;
use crate::error::{JsonltError, JsonltResult};
use crate::header::Header;
use crate::index::{build_index, scan_appended_keys, FileCursor, IndexEntry};
use crate::key::{Key, KeySpec};
use crate::lock::FileLock;
use crate::platform::{durable_sync, LockMode};
use crate::record::{build_tombstone, validate_record, Record};
use crate::transaction::{Transaction, WriteOp};

/// Cached state behind the table's mutex.
struct TableInner {
    header: Header,
    entries: BTreeMap<Key, IndexEntry>,
    cursor: FileCursor,
    tx_active: bool,
}

/// An append-only keyed-record table backed by one JSON Lines file.
pub struct Table {
    path: PathBuf,
    spec: KeySpec,
    options: TableOptions,
    inner: Mutex<TableInner>,
}

impl Table {
    /// Open an existing table or create a new one with default options.
    ///
    /// An existing file must carry a header; a supplied key specifier must
    /// match the header's (the header's is adopted when none is supplied).
    /// Creating a new table requires a key specifier and writes the header
    /// immediately, under exclusive lock.
    pub fn open<P: AsRef<Path>>(path: P, key: Option<KeySpec>) -> JsonltResult<Table> {
        Table::open_with_options(path, key, TableOptions::default())
    }

    /// `open` with explicit options.
    pub fn open_with_options<P: AsRef<Path>>(
        path: P,
        key: Option<KeySpec>,
        options: TableOptions,
    ) -> JsonltResult<Table> {
        let path = path.as_ref().to_path_buf();
        match fs::metadata(&path) {
            Ok(meta) if meta.len() > 0 => Table::open_existing(path, key, options),
            Ok(_) => Table::create_new(path, key, options),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Table::create_new(path, key, options)
            }
            Err(err) => Err(file_error(&path, &err, "cannot stat table file")),
        }
    }

    /// Atomically create a new table file with an initial batch of records.
    ///
    /// Records are validated up front (errors name the offending index),
    /// duplicate keys in the batch are rejected, and the file is written
    /// complete to a temp sibling and renamed into place, in canonical key
    /// order. Fails if the path already holds a non-empty file.
    pub fn from_records<P: AsRef<Path>>(
        path: P,
        records: Vec<Record>,
        key: KeySpec,
    ) -> JsonltResult<Table> {
        Table::from_records_with_options(path, records, key, TableOptions::default())
    }

    /// `from_records` with explicit options.
    pub fn from_records_with_options<P: AsRef<Path>>(
        path: P,
        records: Vec<Record>,
        key: KeySpec,
        options: TableOptions,
    ) -> JsonltResult<Table> {
        let path = path.as_ref().to_path_buf();

        match fs::metadata(&path) {
            Ok(meta) if meta.len() > 0 => {
                return Err(JsonltError::File {
                    path: Some(path),
                    kind: io::ErrorKind::AlreadyExists,
                    message: "file already exists with content".to_owned(),
                });
            }
            _ => {}
        }

        let mut entries: BTreeMap<Key, Record> = BTreeMap::new();
        for (i, record) in records.into_iter().enumerate() {
            let at = |err: JsonltError| match err {
                JsonltError::InvalidKey { reason } => JsonltError::InvalidKey {
                    reason: format!("record at index {}: {}", i, reason),
                },
                other => other,
            };
            let record_key = validate_record(&record, &key).map_err(at)?;
            check_key_len(&record_key, &options)?;
            let line = encode_line(&record)?;
            check_line_len(&line, &options)?;
            if entries.insert(record_key.clone(), record).is_some() {
                return Err(JsonltError::InvalidKey {
                    reason: format!("record at index {}: duplicate key {}", i, record_key),
                });
            }
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|err| file_error(parent, &err, "cannot create parent directory"))?;
            }
        }

        let header = Header::new(Some(key.clone()));
        let mut lines = vec![header.to_line()?];
        for record in entries.values() {
            lines.push(encode_line(record)?);
        }
        let meta = write_atomic(&path, &lines)?;

        // Offsets are cumulative over the lines just written.
        let mut offset = lines[0].len() as u64 + 1;
        let mut indexed: BTreeMap<Key, IndexEntry> = BTreeMap::new();
        for ((record_key, record), line) in entries.into_iter().zip(lines[1..].iter()) {
            indexed.insert(record_key, IndexEntry { record, offset });
            offset += line.len() as u64 + 1;
        }

        Ok(Table {
            path,
            spec: key,
            options,
            inner: Mutex::new(TableInner {
                header,
                entries: indexed,
                cursor: FileCursor::from_metadata(&meta, 0),
                tx_active: false,
            }),
        })
    }

    fn open_existing(
        path: PathBuf,
        key: Option<KeySpec>,
        options: TableOptions,
    ) -> JsonltResult<Table> {
        let file = File::open(&path)
            .map_err(|err| file_error(&path, &err, "cannot read table file"))?;
        let mut lock = FileLock::acquire(file, &path, LockMode::Shared, options.lock_timeout)?;
        let meta = lock
            .file()
            .metadata()
            .map_err(|err| file_error(&path, &err, "cannot stat table file"))?;
        check_read_size(meta.len(), &options)?;

        let mut bytes = Vec::with_capacity(meta.len() as usize);
        lock.file_mut()
            .read_to_end(&mut bytes)
            .map_err(|err| file_error(&path, &err, "cannot read table file"))?;

        let index = build_index(&bytes, key.as_ref(), options.profile, Some(&path))?;

        let header_key = index.header.as_ref().and_then(|h| h.key.clone());
        let spec = match (key, header_key) {
            (Some(supplied), Some(declared)) => {
                if supplied != declared {
                    return Err(JsonltError::InvalidKey {
                        reason: format!(
                            "key specifier mismatch: file declares {}, caller supplied {}",
                            declared, supplied
                        ),
                    });
                }
                supplied
            }
            (Some(supplied), None) => supplied,
            (None, Some(declared)) => declared,
            (None, None) => {
                return Err(JsonltError::InvalidKey {
                    reason: "no key specifier: not declared in the header and none supplied"
                        .to_owned(),
                });
            }
        };

        let header = index
            .header
            .unwrap_or_else(|| Header::new(Some(spec.clone())));

        Ok(Table {
            path,
            spec,
            options,
            inner: Mutex::new(TableInner {
                header,
                entries: index.entries,
                cursor: FileCursor::from_metadata(&meta, 0),
                tx_active: false,
            }),
        })
    }

    fn create_new(
        path: PathBuf,
        key: Option<KeySpec>,
        options: TableOptions,
    ) -> JsonltResult<Table> {
        let spec = key.ok_or_else(|| JsonltError::InvalidKey {
            reason: "no key specifier: required to create a new table".to_owned(),
        })?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|err| file_error(&path, &err, "cannot create table file"))?;
        let mut lock = FileLock::acquire(file, &path, LockMode::Exclusive, options.lock_timeout)?;
        let meta = lock
            .file()
            .metadata()
            .map_err(|err| file_error(&path, &err, "cannot stat table file"))?;
        if meta.len() > 0 {
            // Another process created the table between stat and lock.
            drop(lock);
            return Table::open_existing(path, Some(spec), options);
        }

        let header = Header::new(Some(spec.clone()));
        let line = format!("{}\n", header.to_line()?);
        lock.file_mut()
            .write_all(line.as_bytes())
            .map_err(|err| file_error(&path, &err, "cannot write header"))?;
        durable_sync(lock.file()).map_err(|err| file_error(&path, &err, "cannot sync header"))?;

        let cursor = cursor_after_write(lock.file(), line.len() as u64, 0);
        Ok(Table {
            path,
            spec,
            options,
            inner: Mutex::new(TableInner {
                header,
                entries: BTreeMap::new(),
                cursor,
                tx_active: false,
            }),
        })
    }

    /// The table file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The key specifier in effect (immutable for the table's lifetime).
    pub fn key_spec(&self) -> &KeySpec {
        &self.spec
    }

    /// The current header, including any schema/meta fields.
    pub fn header(&self) -> Header {
        self.inner.lock().header.clone()
    }

    /// Get the current record for a key, or None.
    pub fn get(&self, key: impl Into<Key>) -> JsonltResult<Option<Record>> {
        let key = key.into();
        key.validate_lookup()?;
        let mut inner = self.inner.lock();
        self.refresh_if_stale(&mut inner)?;
        Ok(inner.entries.get(&key).map(|entry| entry.record.clone()))
    }

    /// Whether a key currently exists.
    pub fn has(&self, key: impl Into<Key>) -> JsonltResult<bool> {
        let key = key.into();
        key.validate_lookup()?;
        let mut inner = self.inner.lock();
        self.refresh_if_stale(&mut inner)?;
        Ok(inner.entries.contains_key(&key))
    }

    /// All records in canonical key order (a snapshot, not a live view).
    pub fn all(&self) -> JsonltResult<Vec<Record>> {
        let mut inner = self.inner.lock();
        self.refresh_if_stale(&mut inner)?;
        Ok(inner.entries.values().map(|entry| entry.record.clone()).collect())
    }

    /// All records in canonical key order. Alias of [`Table::all`].
    pub fn values(&self) -> JsonltResult<Vec<Record>> {
        self.all()
    }

    /// All keys in canonical order.
    pub fn keys(&self) -> JsonltResult<Vec<Key>> {
        let mut inner = self.inner.lock();
        self.refresh_if_stale(&mut inner)?;
        Ok(inner.entries.keys().cloned().collect())
    }

    /// All (key, record) pairs in canonical key order.
    pub fn items(&self) -> JsonltResult<Vec<(Key, Record)>> {
        let mut inner = self.inner.lock();
        self.refresh_if_stale(&mut inner)?;
        Ok(inner
            .entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.record.clone()))
            .collect())
    }

    /// Number of live records.
    pub fn count(&self) -> JsonltResult<usize> {
        let mut inner = self.inner.lock();
        self.refresh_if_stale(&mut inner)?;
        Ok(inner.entries.len())
    }

    /// True when the table holds no records.
    pub fn is_empty(&self) -> JsonltResult<bool> {
        Ok(self.count()? == 0)
    }

    /// Records matching a predicate, in canonical key order, stopping at
    /// `limit` when set. A linear scan over the materialized view.
    pub fn find<P>(&self, mut predicate: P, limit: Option<usize>) -> JsonltResult<Vec<Record>>
    where
        P: FnMut(&Record) -> bool,
    {
        let mut inner = self.inner.lock();
        self.refresh_if_stale(&mut inner)?;
        let mut results = Vec::new();
        for entry in inner.entries.values() {
            if predicate(&entry.record) {
                results.push(entry.record.clone());
                if limit.is_some_and(|limit| results.len() >= limit) {
                    break;
                }
            }
        }
        Ok(results)
    }

    /// First record matching a predicate, in canonical key order.
    pub fn find_one<P>(&self, mut predicate: P) -> JsonltResult<Option<Record>>
    where
        P: FnMut(&Record) -> bool,
    {
        Ok(self.find(&mut predicate, Some(1))?.into_iter().next())
    }

    /// Insert or update a record. One appended line either way; the
    /// difference is only whether the key already existed.
    pub fn put(&self, record: Record) -> JsonltResult<()> {
        let key = validate_record(&record, &self.spec)?;
        check_key_len(&key, &self.options)?;
        let line = encode_line(&record)?;
        check_line_len(&line, &self.options)?;

        let mut inner = self.inner.lock();
        let mut lock = self.lock_for_append()?;
        let meta = self.stat_locked(lock.file())?;
        if self.stale_under_lock(&inner, &meta) {
            self.rebuild_from_file(&mut inner, lock.file_mut())?;
        }

        let mut payload = String::new();
        if meta.len() == 0 {
            payload.push_str(&inner.header.to_line()?);
            payload.push('\n');
        }
        let offset = meta.len() + payload.len() as u64;
        payload.push_str(&line);
        payload.push('\n');
        check_write_size(meta.len() + payload.len() as u64, &self.options)?;

        self.append_payload(lock.file_mut(), &payload)?;

        inner.entries.insert(key, IndexEntry { record, offset });
        inner.cursor = cursor_after_write(
            lock.file(),
            meta.len() + payload.len() as u64,
            inner.cursor.generation + 1,
        );
        Ok(())
    }

    /// Delete a key by appending a tombstone.
    ///
    /// Deleting a key that is not present is a missing-key error.
    pub fn delete(&self, key: impl Into<Key>) -> JsonltResult<()> {
        let key = key.into();
        self.spec.check_arity(&key)?;
        check_key_len(&key, &self.options)?;
        let tombstone = build_tombstone(&key, &self.spec)?;
        let line = encode_line(&tombstone)?;
        check_line_len(&line, &self.options)?;

        let mut inner = self.inner.lock();
        let mut lock = self.lock_for_append()?;
        let meta = self.stat_locked(lock.file())?;
        if self.stale_under_lock(&inner, &meta) {
            self.rebuild_from_file(&mut inner, lock.file_mut())?;
        }

        if !inner.entries.contains_key(&key) {
            return Err(JsonltError::MissingKey { key });
        }

        let payload = format!("{}\n", line);
        check_write_size(meta.len() + payload.len() as u64, &self.options)?;
        self.append_payload(lock.file_mut(), &payload)?;

        inner.entries.remove(&key);
        inner.cursor = cursor_after_write(
            lock.file(),
            meta.len() + payload.len() as u64,
            inner.cursor.generation + 1,
        );
        Ok(())
    }

    /// Remove and return the record for a key.
    ///
    /// Sugar over get + delete; a missing key is a missing-key error.
    pub fn pop(&self, key: impl Into<Key>) -> JsonltResult<Record> {
        let key = key.into();
        let record = self
            .get(key.clone())?
            .ok_or_else(|| JsonltError::MissingKey { key: key.clone() })?;
        self.delete(key)?;
        Ok(record)
    }

    /// Return the existing record for the record's key, inserting the given
    /// record when the key is absent.
    pub fn set_default(&self, record: Record) -> JsonltResult<Record> {
        let key = validate_record(&record, &self.spec)?;
        if let Some(existing) = self.get(key)? {
            return Ok(existing);
        }
        self.put(record.clone())?;
        Ok(record)
    }

    /// Put every record in the iterator, in order.
    pub fn update<I>(&self, records: I) -> JsonltResult<()>
    where
        I: IntoIterator<Item = Record>,
    {
        for record in records {
            self.put(record)?;
        }
        Ok(())
    }

    /// Rewrite the file as header + live records in canonical key order.
    ///
    /// Tombstones and superseded lines vanish. The rewrite goes to a `.tmp`
    /// sibling which is synced and atomically renamed over the original, so
    /// a crash leaves either the old file or the new one, never a mix.
    pub fn compact(&self) -> JsonltResult<()> {
        let (old_size, new_size) = self.rewrite(false)?;
        eprintln!(
            "[COMPACTION] {} : {} -> {} bytes",
            self.path.display(),
            old_size,
            new_size
        );
        Ok(())
    }

    /// Rewrite the file as just the header, dropping every record.
    pub fn clear(&self) -> JsonltResult<()> {
        self.rewrite(true)?;
        Ok(())
    }

    /// Drop the cached index and rebuild it from the file now.
    pub fn reload(&self) -> JsonltResult<()> {
        let mut inner = self.inner.lock();
        self.rebuild(&mut inner)
    }

    /// Begin a snapshot-isolated transaction.
    ///
    /// Only one transaction may be active per table; a second attempt is a
    /// transaction-state error. The transaction holds no file lock until
    /// commit.
    pub fn transaction(&self) -> JsonltResult<Transaction<'_>> {
        let mut inner = self.inner.lock();
        if inner.tx_active {
            return Err(JsonltError::TransactionState {
                reason: "a transaction is already active on this table".to_owned(),
            });
        }
        self.refresh_if_stale(&mut inner)?;
        let snapshot: BTreeMap<Key, Record> = inner
            .entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.record.clone()))
            .collect();
        let cursor = inner.cursor;
        inner.tx_active = true;
        Ok(Transaction::new(self, snapshot, cursor))
    }

    /// Flush a transaction's buffered writes as one contiguous line group.
    ///
    /// Called with the snapshot taken at transaction creation and the
    /// conflict-candidate keys (the write-set joined with the
    /// observed-then-written keys). Under the exclusive lock: detect
    /// conflicts against the candidates, then append every buffered
    /// operation in sorted-key order and patch the index.
    pub(crate) fn commit_transaction(
        &self,
        snapshot: &BTreeMap<Key, Record>,
        snapshot_cursor: FileCursor,
        writes: &BTreeMap<Key, WriteOp>,
        candidates: &BTreeSet<Key>,
    ) -> JsonltResult<()> {
        if writes.is_empty() {
            return Ok(());
        }

        let mut lines: Vec<String> = Vec::with_capacity(writes.len());
        for (key, op) in writes {
            let line = match op {
                WriteOp::Put(record) => encode_line(record)?,
                WriteOp::Delete => encode_line(&build_tombstone(key, &self.spec)?)?,
            };
            check_line_len(&line, &self.options)?;
            lines.push(line);
        }

        let mut inner = self.inner.lock();
        let mut lock = self.lock_for_append()?;
        let meta = self.stat_locked(lock.file())?;

        let changed = inner.cursor.generation != snapshot_cursor.generation
            || snapshot_cursor.disk_changed(Some(&meta));
        if changed {
            self.rebuild_from_file(&mut inner, lock.file_mut())?;
            if let Some(key) =
                self.detect_conflict(&inner, snapshot, snapshot_cursor, &meta, lock.file_mut(), candidates)?
            {
                return Err(JsonltError::Conflict {
                    expected: snapshot.get(&key).cloned(),
                    actual: inner.entries.get(&key).map(|entry| entry.record.clone()),
                    key,
                });
            }
        }

        let mut payload = String::new();
        if meta.len() == 0 {
            payload.push_str(&inner.header.to_line()?);
            payload.push('\n');
        }
        let mut offsets = Vec::with_capacity(lines.len());
        for line in &lines {
            offsets.push(meta.len() + payload.len() as u64);
            payload.push_str(line);
            payload.push('\n');
        }
        check_write_size(meta.len() + payload.len() as u64, &self.options)?;

        self.append_payload(lock.file_mut(), &payload)?;

        for ((key, op), offset) in writes.iter().zip(offsets) {
            match op {
                WriteOp::Put(record) => {
                    inner
                        .entries
                        .insert(key.clone(), IndexEntry { record: record.clone(), offset });
                }
                WriteOp::Delete => {
                    inner.entries.remove(key);
                }
            }
        }
        inner.cursor = cursor_after_write(
            lock.file(),
            meta.len() + payload.len() as u64,
            inner.cursor.generation + 1,
        );
        Ok(())
    }

    /// Find the first candidate key mutated on disk since the snapshot.
    ///
    /// Fast path: when the file strictly grew and the appended region parses
    /// as whole lines, intersect the keys those lines touch with the
    /// candidates. When the file was rewritten instead (compaction, clear,
    /// an external replace), the old size is not a line boundary of the new
    /// content, so fall back to comparing each candidate key's current
    /// materialized value against its snapshot value.
    fn detect_conflict(
        &self,
        inner: &TableInner,
        snapshot: &BTreeMap<Key, Record>,
        snapshot_cursor: FileCursor,
        meta: &fs::Metadata,
        file: &mut File,
        candidates: &BTreeSet<Key>,
    ) -> JsonltResult<Option<Key>> {
        if meta.len() > snapshot_cursor.size {
            let mut region = vec![0u8; (meta.len() - snapshot_cursor.size) as usize];
            let readable = file
                .seek(SeekFrom::Start(snapshot_cursor.size))
                .and_then(|_| file.read_exact(&mut region));
            if readable.is_ok() {
                if let Ok(keys) = scan_appended_keys(&region, &self.spec, self.options.profile) {
                    return Ok(keys.into_iter().find(|key| candidates.contains(key)));
                }
            }
        }
        Ok(candidates
            .iter()
            .find(|key| {
                let current = inner.entries.get(*key).map(|entry| &entry.record);
                current != snapshot.get(*key)
            })
            .cloned())
    }

    /// Clear the active-transaction flag. Called when a transaction
    /// finalizes by commit, abort, or drop.
    pub(crate) fn end_transaction(&self) {
        self.inner.lock().tx_active = false;
    }

    pub(crate) fn options(&self) -> &TableOptions {
        &self.options
    }

    /// Rewrite the file atomically: header plus (unless `drop_records`) the
    /// live records in canonical order. Returns (old_size, new_size).
    fn rewrite(&self, drop_records: bool) -> JsonltResult<(u64, u64)> {
        let mut inner = self.inner.lock();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.path)
            .map_err(|err| file_error(&self.path, &err, "cannot open table file"))?;
        let mut lock = FileLock::acquire(
            file,
            &self.path,
            LockMode::Exclusive,
            self.options.lock_timeout,
        )?;
        let meta = self.stat_locked(lock.file())?;
        // Re-read under the lock so externally updated header fields (meta,
        // schema) survive the rewrite.
        self.rebuild_from_file(&mut inner, lock.file_mut())?;
        let old_size = meta.len();

        if drop_records {
            inner.entries.clear();
        }

        let mut lines = vec![inner.header.to_line()?];
        for entry in inner.entries.values() {
            lines.push(encode_line(&entry.record)?);
        }
        let new_meta = write_atomic(&self.path, &lines)?;

        // Offsets moved: every live line now sits behind the header.
        let mut offset = lines[0].len() as u64 + 1;
        for (entry, line) in inner.entries.values_mut().zip(lines[1..].iter()) {
            entry.offset = offset;
            offset += line.len() as u64 + 1;
        }
        inner.cursor = FileCursor::from_metadata(&new_meta, inner.cursor.generation + 1);
        Ok((old_size, new_meta.len()))
    }

    /// Stat-based staleness check before a cached read.
    fn refresh_if_stale(&self, inner: &mut TableInner) -> JsonltResult<()> {
        if !self.options.auto_reload {
            return Ok(());
        }
        match fs::metadata(&self.path) {
            Ok(meta) => {
                if inner.cursor.disk_changed(Some(&meta)) {
                    self.rebuild(inner)?;
                }
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                if inner.cursor.disk_changed(None) {
                    inner.entries.clear();
                    inner.cursor = FileCursor::missing(inner.cursor.generation + 1);
                }
                Ok(())
            }
            Err(err) => Err(file_error(&self.path, &err, "cannot stat table file")),
        }
    }

    /// Rebuild the cached index by reading the file under shared lock.
    fn rebuild(&self, inner: &mut TableInner) -> JsonltResult<()> {
        match File::open(&self.path) {
            Ok(file) => {
                let mut lock =
                    FileLock::acquire(file, &self.path, LockMode::Shared, self.options.lock_timeout)?;
                self.rebuild_from_file(inner, lock.file_mut())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                inner.entries.clear();
                inner.cursor = FileCursor::missing(inner.cursor.generation + 1);
                Ok(())
            }
            Err(err) => Err(file_error(&self.path, &err, "cannot read table file")),
        }
    }

    /// Rebuild the cached index from an already-locked file handle.
    ///
    /// On failure the cached index is untouched: the fold builds a fresh
    /// map and only a successful build is swapped in.
    fn rebuild_from_file(&self, inner: &mut TableInner, file: &mut File) -> JsonltResult<()> {
        let meta = self.stat_locked(file)?;
        check_read_size(meta.len(), &self.options)?;
        file.seek(SeekFrom::Start(0))
            .map_err(|err| file_error(&self.path, &err, "cannot read table file"))?;
        let mut bytes = Vec::with_capacity(meta.len() as usize);
        file.read_to_end(&mut bytes)
            .map_err(|err| file_error(&self.path, &err, "cannot read table file"))?;

        let index = build_index(&bytes, Some(&self.spec), self.options.profile, Some(&self.path))?;
        if let Some(declared) = index.header.as_ref().and_then(|h| h.key.as_ref()) {
            if *declared != self.spec {
                return Err(JsonltError::InvalidKey {
                    reason: format!(
                        "key specifier mismatch: file declares {}, table uses {}",
                        declared, self.spec
                    ),
                });
            }
        }

        inner.entries = index.entries;
        if let Some(header) = index.header {
            inner.header = header;
        }
        inner.cursor = FileCursor::from_metadata(&meta, inner.cursor.generation + 1);
        Ok(())
    }

    /// Whether the locked file differs from the cached cursor.
    fn stale_under_lock(&self, inner: &TableInner, meta: &fs::Metadata) -> bool {
        inner.cursor.disk_changed(Some(meta))
    }

    fn lock_for_append(&self) -> JsonltResult<FileLock> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&self.path)
            .map_err(|err| file_error(&self.path, &err, "cannot open table file"))?;
        FileLock::acquire(file, &self.path, LockMode::Exclusive, self.options.lock_timeout)
    }

    fn append_payload(&self, file: &mut File, payload: &str) -> JsonltResult<()> {
        file.write_all(payload.as_bytes())
            .map_err(|err| file_error(&self.path, &err, "cannot append to file"))?;
        durable_sync(file).map_err(|err| file_error(&self.path, &err, "cannot sync file"))
    }

    fn stat_locked(&self, file: &File) -> JsonltResult<fs::Metadata> {
        file.metadata()
            .map_err(|err| file_error(&self.path, &err, "cannot stat table file"))
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("path", &self.path)
            .field("key", &self.spec)
            .finish()
    }
}

/// Write lines (each getting its newline) to a `.tmp` sibling, sync it, and
/// atomically rename it over the destination. Returns the new metadata.
fn write_atomic(path: &Path, lines: &[String]) -> JsonltResult<fs::Metadata> {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    let tmp_path = path.with_file_name(name);

    let mut content = String::new();
    for line in lines {
        content.push_str(line);
        content.push('\n');
    }

    {
        let mut tmp = File::create(&tmp_path)
            .map_err(|err| file_error(&tmp_path, &err, "cannot write file atomically"))?;
        tmp.write_all(content.as_bytes())
            .map_err(|err| file_error(&tmp_path, &err, "cannot write file atomically"))?;
        durable_sync(&tmp).map_err(|err| file_error(&tmp_path, &err, "cannot sync temp file"))?;
    }

    fs::rename(&tmp_path, path)
        .map_err(|err| file_error(path, &err, "cannot rename temp file into place"))?;

    // Persist the rename itself.
    #[cfg(unix)]
    {
        if let Some(parent) = path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = durable_sync(&dir);
            }
        }
    }

    fs::metadata(path).map_err(|err| file_error(path, &err, "cannot stat table file"))
}

/// Cursor after a successful write of `expected_size` total bytes.
///
/// A failed post-write stat must not fail the operation (the data is on
/// disk); it degrades to a cursor with no mtime, which forces a rebuild on
/// the next read.
fn cursor_after_write(file: &File, expected_size: u64, generation: u64) -> FileCursor {
    match file.metadata() {
        Ok(meta) => FileCursor::from_metadata(&meta, generation),
        Err(_) => FileCursor { size: expected_size, mtime: None, generation },
    }
}

fn file_error(path: &Path, err: &io::Error, what: &str) -> JsonltError {
    JsonltError::File {
        path: Some(path.to_path_buf()),
        kind: err.kind(),
        message: format!("{}: {}", what, err),
    }
}

fn check_read_size(len: u64, options: &TableOptions) -> JsonltResult<()> {
    if let Some(max) = options.max_file_size {
        if len > max {
            return Err(JsonltError::Limit { what: "file size", actual: len, limit: max });
        }
    }
    Ok(())
}

fn check_write_size(projected: u64, options: &TableOptions) -> JsonltResult<()> {
    if let Some(max) = options.max_file_size {
        if projected > max {
            return Err(JsonltError::Limit { what: "file size", actual: projected, limit: max });
        }
    }
    Ok(())
}

pub(crate) fn check_key_len(key: &Key, options: &TableOptions) -> JsonltResult<()> {
    let len = key.serialized_len();
    if len > options.max_key_len {
        return Err(JsonltError::Limit {
            what: "key length",
            actual: len as u64,
            limit: options.max_key_len as u64,
        });
    }
    Ok(())
}

pub(crate) fn check_line_len(line: &str, options: &TableOptions) -> JsonltResult<()> {
    if line.len() + 1 > options.max_line_len {
        return Err(JsonltError::Limit {
            what: "line length",
            actual: line.len() as u64 + 1,
            limit: options.max_line_len as u64,
        });
    }
    Ok(())
}
