//! Persistent backing for buckets and the range record.
//!
//! The index persists into a transactional key/value store keyed by signed
//! 64-bit integers: key `-1` holds the serialized [`Range`] and every key at
//! or above zero is a bucket keyed by its first VLSN. The store is an
//! external collaborator; this module defines the cursor contract the index
//! needs and ships [`MemKv`], an in-process implementation used by the
//! server binary and the tests.
//!
//! On-disk buckets are immutable except for tail truncation, which rewrites
//! the straddling bucket in place. Buckets are strictly ordered by first
//! VLSN and never overlap; a violation discovered while reading is an
//! integrity failure that invalidates the environment.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::index::bucket::{BucketIntegrityError, GhostBucket, IndexBucket};
use crate::index::protect::DeletionCoordinator;
use crate::index::range::{Range, RangeCodecError};
use crate::types::{Lsn, Vlsn};

/// Store key of the persisted range record.
pub const RANGE_KEY: i64 = -1;

/// Byte offset where records begin in a log file, after the file header.
pub const FILE_HEADER_SIZE: u32 = 64;

/// Cursor over the key space, scoped to a transaction.
///
/// Mirrors the primitives the underlying store must provide: range search,
/// bidirectional iteration, in-place update, and delete-at-cursor.
pub trait Cursor {
    /// Position at the least key `>= key`. Returns that record.
    fn search_key_range(&mut self, key: i64) -> Result<Option<(i64, Vec<u8>)>, StoreError>;

    /// Step to the next record.
    fn next(&mut self) -> Result<Option<(i64, Vec<u8>)>, StoreError>;

    /// Step to the previous record.
    fn prev(&mut self) -> Result<Option<(i64, Vec<u8>)>, StoreError>;

    /// Position at the greatest key.
    fn last(&mut self) -> Result<Option<(i64, Vec<u8>)>, StoreError>;

    /// Replace the value at the cursor position.
    fn put_current(&mut self, value: &[u8]) -> Result<(), StoreError>;

    /// Delete the record at the cursor position. The cursor stays positioned
    /// between its neighbors, so `next`/`prev` continue from there.
    fn delete(&mut self) -> Result<(), StoreError>;
}

/// A transaction over the backing store.
pub trait StoreTxn {
    /// Cursor type scoped to this transaction.
    type Cursor<'a>: Cursor
    where
        Self: 'a;

    /// Open a cursor.
    fn cursor(&mut self) -> Self::Cursor<'_>;

    /// Insert or replace a record.
    fn put(&mut self, key: i64, value: &[u8]) -> Result<(), StoreError>;

    /// Read a record.
    fn get(&self, key: i64) -> Result<Option<Vec<u8>>, StoreError>;

    /// Commit the transaction.
    fn commit(self) -> Result<(), StoreError>;
}

/// The transactional key/value store contract.
pub trait KvStore {
    /// Transaction type.
    type Txn: StoreTxn;

    /// Begin a transaction.
    fn begin(&self) -> Result<Self::Txn, StoreError>;

    /// Make committed state durable.
    fn sync(&self) -> Result<(), StoreError>;
}

/// In-process transactional store over a `BTreeMap`.
///
/// Transactions stage a full copy and publish it on commit, which is plenty
/// for the single-flusher discipline the index imposes.
#[derive(Debug, Default, Clone)]
pub struct MemKv {
    inner: Arc<Mutex<BTreeMap<i64, Vec<u8>>>>,
}

impl MemKv {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemKv {
    type Txn = MemTxn;

    fn begin(&self) -> Result<MemTxn, StoreError> {
        let staged = self
            .inner
            .lock()
            .map_err(|_| StoreError::Backend("store mutex poisoned".to_string()))?
            .clone();
        Ok(MemTxn {
            target: Arc::clone(&self.inner),
            staged,
        })
    }

    fn sync(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// A staged-copy transaction over [`MemKv`].
#[derive(Debug)]
pub struct MemTxn {
    target: Arc<Mutex<BTreeMap<i64, Vec<u8>>>>,
    staged: BTreeMap<i64, Vec<u8>>,
}

impl StoreTxn for MemTxn {
    type Cursor<'a> = MemCursor<'a>;

    fn cursor(&mut self) -> MemCursor<'_> {
        MemCursor {
            map: &mut self.staged,
            position: None,
        }
    }

    fn put(&mut self, key: i64, value: &[u8]) -> Result<(), StoreError> {
        self.staged.insert(key, value.to_vec());
        Ok(())
    }

    fn get(&self, key: i64) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.staged.get(&key).cloned())
    }

    fn commit(self) -> Result<(), StoreError> {
        let mut target = self
            .target
            .lock()
            .map_err(|_| StoreError::Backend("store mutex poisoned".to_string()))?;
        *target = self.staged;
        Ok(())
    }
}

/// Cursor over a staged [`MemTxn`] map.
///
/// `position` is the key of the current record; after a delete it names the
/// deleted key so iteration resumes between the old neighbors.
#[derive(Debug)]
pub struct MemCursor<'a> {
    map: &'a mut BTreeMap<i64, Vec<u8>>,
    position: Option<i64>,
}

impl Cursor for MemCursor<'_> {
    fn search_key_range(&mut self, key: i64) -> Result<Option<(i64, Vec<u8>)>, StoreError> {
        let found = self.map.range(key..).next().map(|(k, v)| (*k, v.clone()));
        self.position = found.as_ref().map(|(k, _)| *k);
        Ok(found)
    }

    fn next(&mut self) -> Result<Option<(i64, Vec<u8>)>, StoreError> {
        let found = match self.position {
            Some(at) => self
                .map
                .range((std::ops::Bound::Excluded(at), std::ops::Bound::Unbounded))
                .next()
                .map(|(k, v)| (*k, v.clone())),
            None => self.map.iter().next().map(|(k, v)| (*k, v.clone())),
        };
        if let Some((k, _)) = &found {
            self.position = Some(*k);
        }
        Ok(found)
    }

    fn prev(&mut self) -> Result<Option<(i64, Vec<u8>)>, StoreError> {
        let found = match self.position {
            Some(at) => self
                .map
                .range(..at)
                .next_back()
                .map(|(k, v)| (*k, v.clone())),
            None => self.map.iter().next_back().map(|(k, v)| (*k, v.clone())),
        };
        if let Some((k, _)) = &found {
            self.position = Some(*k);
        }
        Ok(found)
    }

    fn last(&mut self) -> Result<Option<(i64, Vec<u8>)>, StoreError> {
        let found = self.map.iter().next_back().map(|(k, v)| (*k, v.clone()));
        self.position = found.as_ref().map(|(k, _)| *k);
        Ok(found)
    }

    fn put_current(&mut self, value: &[u8]) -> Result<(), StoreError> {
        let at = self.position.ok_or_else(|| {
            StoreError::Backend("put_current with unpositioned cursor".to_string())
        })?;
        if !self.map.contains_key(&at) {
            return Err(StoreError::Backend(
                "put_current at deleted record".to_string(),
            ));
        }
        self.map.insert(at, value.to_vec());
        Ok(())
    }

    fn delete(&mut self) -> Result<(), StoreError> {
        let at = self.position.ok_or_else(|| {
            StoreError::Backend("delete with unpositioned cursor".to_string())
        })?;
        self.map.remove(&at);
        Ok(())
    }
}

/// Index-shaped persistence over any [`KvStore`].
#[derive(Debug)]
pub struct BucketDb<S: KvStore> {
    store: S,
}

impl<S: KvStore> BucketDb<S> {
    /// Wrap a store.
    pub const fn new(store: S) -> Self {
        Self { store }
    }

    /// Access the underlying store.
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Begin a transaction on the underlying store.
    pub fn begin(&self) -> Result<S::Txn, StoreError> {
        self.store.begin()
    }

    /// Make committed state durable.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.store.sync()
    }

    /// Read the persisted range record, if one was ever flushed.
    pub fn read_range(&self) -> Result<Option<Range>, StoreError> {
        let txn = self.store.begin()?;
        let Some(bytes) = txn.get(RANGE_KEY)? else {
            return Ok(None);
        };
        Ok(Some(Range::from_bytes(&bytes).map_err(IntegrityError::Range)?))
    }

    /// Write the range record under an open transaction.
    pub fn write_range(txn: &mut S::Txn, range: Range) -> Result<(), StoreError> {
        txn.put(RANGE_KEY, &range.to_bytes())
    }

    /// Write a bucket under an open transaction, keyed by its first VLSN.
    pub fn write_bucket(txn: &mut S::Txn, bucket: &IndexBucket) -> Result<(), StoreError> {
        let key = key_of(bucket.first())?;
        txn.put(key, &bucket.to_bytes())
    }

    /// Highest VLSN present on disk, or NULL when no buckets were flushed.
    pub fn last_on_disk(&self) -> Result<Vlsn, StoreError> {
        let mut txn = self.store.begin()?;
        let mut cursor = txn.cursor();
        match cursor.last()? {
            Some((key, bytes)) if key >= 0 => {
                let bucket = decode(key, &bytes)?;
                Ok(bucket.last())
            }
            _ => Ok(Vlsn::NULL),
        }
    }

    /// On-disk flavor of the GTE bucket lookup: the bucket owning `vlsn`, or
    /// the nearest bucket past it.
    pub fn gte_bucket(&self, vlsn: Vlsn) -> Result<Option<IndexBucket>, StoreError> {
        let mut txn = self.store.begin()?;
        let mut cursor = txn.cursor();
        let key = key_of(vlsn)?;

        if let Some((found_key, bytes)) = cursor.search_key_range(key)? {
            if found_key == key {
                return Ok(Some(decode(found_key, &bytes)?));
            }
            // Look at the bucket starting below vlsn first; it may own it.
            if let Some((prev_key, prev_bytes)) = cursor.prev()?
                && prev_key >= 0
            {
                let bucket = decode(prev_key, &prev_bytes)?;
                if bucket.owns(vlsn) {
                    return Ok(Some(bucket));
                }
            }
            return Ok(Some(decode(found_key, &bytes)?));
        }

        // Nothing at or past vlsn; the last bucket may still own it.
        match cursor.last()? {
            Some((last_key, bytes)) if last_key >= 0 => {
                let bucket = decode(last_key, &bytes)?;
                Ok(bucket.owns(vlsn).then_some(bucket))
            }
            _ => Ok(None),
        }
    }

    /// On-disk flavor of the LTE bucket lookup: the bucket with the greatest
    /// first VLSN at or below `vlsn`.
    pub fn lte_bucket(&self, vlsn: Vlsn) -> Result<Option<IndexBucket>, StoreError> {
        let mut txn = self.store.begin()?;
        let mut cursor = txn.cursor();
        let key = key_of(vlsn)?;

        match cursor.search_key_range(key)? {
            Some((found_key, bytes)) if found_key == key => Ok(Some(decode(found_key, &bytes)?)),
            Some(_) => match cursor.prev()? {
                Some((prev_key, bytes)) if prev_key >= 0 => Ok(Some(decode(prev_key, &bytes)?)),
                _ => Ok(None),
            },
            None => match cursor.last()? {
                Some((last_key, bytes)) if last_key >= 0 => Ok(Some(decode(last_key, &bytes)?)),
                _ => Ok(None),
            },
        }
    }

    /// Delete every bucket at or below `delete_end` under `txn`.
    ///
    /// Returns false without mutating when the bucket owning `delete_end`
    /// maps files past `delete_file` that are still pinned by a protection
    /// holder; the caller retries once the holder releases. When the first
    /// surviving bucket starts past `delete_end + 1`, a ghost anchored there
    /// bridges the gap, covering from the start of the following file and
    /// bounded by the survivor's first mapping.
    pub fn prune_head(
        txn: &mut S::Txn,
        delete_end: Vlsn,
        delete_file: u32,
        coordinator: &DeletionCoordinator,
    ) -> Result<bool, StoreError> {
        let mut cursor = txn.cursor();
        let key = key_of(delete_end)?;

        // Position at the bucket owning delete_end, or the one just below.
        let target = match cursor.search_key_range(key)? {
            Some((found_key, bytes)) if found_key == key => Some((found_key, bytes)),
            Some(_) => cursor.prev()?.filter(|&(k, _)| k >= 0),
            None => cursor.last()?.filter(|&(k, _)| k >= 0),
        };
        let Some((target_key, bytes)) = target else {
            return Ok(true);
        };
        let bucket = decode(target_key, &bytes)?;
        if bucket.follows(delete_end) {
            // Everything on disk already starts past the deletion point.
            return Ok(true);
        }

        let bucket_file = match &bucket {
            IndexBucket::Real(b) => b.file(),
            IndexBucket::Ghost(g) => g.covering_lsn().file(),
        };
        if bucket_file > delete_file && !coordinator.deletable(bucket_file) {
            tracing::debug!(
                %delete_end,
                delete_file,
                bucket_file,
                "head prune deferred: straddling bucket still protected"
            );
            return Ok(false);
        }

        // Delete this bucket and everything before it, sparing the range key.
        cursor.delete()?;
        while let Some((k, _)) = cursor.prev()? {
            if k < 0 {
                break;
            }
            cursor.delete()?;
        }

        drop(cursor);

        // Bridge a gap to the first survivor with a ghost.
        let mut cursor = txn.cursor();
        let survivor = cursor.search_key_range(0)?;
        if let Some((survivor_key, survivor_bytes)) = survivor {
            let survivor_bucket = decode(survivor_key, &survivor_bytes)?;
            let anchor = delete_end.next();
            if survivor_bucket.first() > anchor {
                let covering = Lsn::new(delete_file + 1, FILE_HEADER_SIZE);
                let bounding = survivor_bucket
                    .gte_lsn(survivor_bucket.first())
                    .unwrap_or(Lsn::NULL);
                let ghost = IndexBucket::Ghost(GhostBucket::new(anchor, covering, bounding));
                drop(cursor);
                txn.put(key_of(anchor)?, &ghost.to_bytes())?;
            }
        }
        Ok(true)
    }

    /// Remove every mapping at or past `delete_start` under `txn`.
    ///
    /// A bucket straddling the deletion point is rewritten in place with its
    /// tail removed, capped at `last_lsn` when provided. Returns the highest
    /// VLSN still on disk afterwards.
    pub fn prune_tail(
        txn: &mut S::Txn,
        delete_start: Vlsn,
        last_lsn: Option<Lsn>,
    ) -> Result<Vlsn, StoreError> {
        let mut cursor = txn.cursor();
        let key = key_of(delete_start)?;

        // Position at the bucket owning delete_start, or the one just above.
        let positioned = match cursor.search_key_range(key)? {
            Some(found) => {
                // A bucket just below may straddle the deletion point.
                if found.0 > key {
                    let straddler = match cursor.prev()? {
                        Some((prev_key, prev_bytes)) if prev_key >= 0 => {
                            let prev_bucket = decode(prev_key, &prev_bytes)?;
                            (!prev_bucket.precedes(delete_start))
                                .then_some((prev_key, prev_bytes))
                        }
                        _ => None,
                    };
                    if straddler.is_some() {
                        straddler
                    } else {
                        // Step back up to the found bucket.
                        cursor.search_key_range(found.0)?;
                        Some(found)
                    }
                } else {
                    Some(found)
                }
            }
            None => match cursor.last()? {
                Some((last_key, last_bytes)) if last_key >= 0 => {
                    let last_bucket = decode(last_key, &last_bytes)?;
                    if last_bucket.precedes(delete_start) {
                        None
                    } else {
                        Some((last_key, last_bytes))
                    }
                }
                _ => None,
            },
        };

        let Some((first_key, first_bytes)) = positioned else {
            // Nothing at or past delete_start; the disk tail stands.
            drop(cursor);
            return last_bucket_vlsn(txn);
        };

        let bucket = decode(first_key, &first_bytes)?;
        if bucket.follows(delete_start) || matches!(bucket, IndexBucket::Ghost(_)) {
            // Whole bucket is going away.
            cursor.delete()?;
        } else if let IndexBucket::Real(mut real) = bucket {
            real.remove_from_tail(delete_start, last_lsn);
            if real.is_empty() {
                cursor.delete()?;
            } else {
                cursor.put_current(&IndexBucket::Real(real).to_bytes())?;
            }
        }

        // Delete every subsequent bucket.
        while let Some((k, _)) = cursor.next()? {
            debug_assert!(k >= 0, "range key ordered after buckets");
            cursor.delete()?;
        }
        drop(cursor);
        last_bucket_vlsn(txn)
    }
}

fn last_bucket_vlsn<T: StoreTxn>(txn: &mut T) -> Result<Vlsn, StoreError> {
    let mut cursor = txn.cursor();
    match cursor.last()? {
        Some((key, bytes)) if key >= 0 => Ok(decode(key, &bytes)?.last()),
        _ => Ok(Vlsn::NULL),
    }
}

fn decode(key: i64, bytes: &[u8]) -> Result<IndexBucket, StoreError> {
    let key = u64::try_from(key).map_err(|_| IntegrityError::NegativeBucketKey(key))?;
    let bucket = IndexBucket::from_bytes(Vlsn::new(key), bytes).map_err(IntegrityError::Bucket)?;
    Ok(bucket)
}

fn key_of(vlsn: Vlsn) -> Result<i64, StoreError> {
    i64::try_from(vlsn.sequence()).map_err(|_| IntegrityError::KeyOverflow(vlsn).into())
}

/// On-disk state that cannot be trusted.
#[derive(Debug)]
pub enum IntegrityError {
    /// A bucket record failed deserialization or its own checks.
    Bucket(BucketIntegrityError),
    /// The range record failed deserialization.
    Range(RangeCodecError),
    /// A bucket record sits under a negative key.
    NegativeBucketKey(i64),
    /// A VLSN does not fit the signed key space.
    KeyOverflow(Vlsn),
    /// Adjacent persistent buckets overlap.
    Overlap { upper_first: Vlsn, lower_last: Vlsn },
}

impl std::fmt::Display for IntegrityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bucket(e) => write!(f, "bucket integrity: {e}"),
            Self::Range(e) => write!(f, "range integrity: {e}"),
            Self::NegativeBucketKey(k) => write!(f, "bucket record under negative key {k}"),
            Self::KeyOverflow(v) => write!(f, "VLSN {v} exceeds the store key space"),
            Self::Overlap {
                upper_first,
                lower_last,
            } => write!(
                f,
                "persistent buckets overlap: {upper_first} begins at or before {lower_last}"
            ),
        }
    }
}

impl std::error::Error for IntegrityError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Bucket(e) => Some(e),
            Self::Range(e) => Some(e),
            _ => None,
        }
    }
}

/// Failures from the backing store.
#[derive(Debug)]
pub enum StoreError {
    /// The on-disk index is corrupt; the environment must be invalidated.
    Integrity(IntegrityError),
    /// Backend-specific failure.
    Backend(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Integrity(e) => write!(f, "store integrity error: {e}"),
            Self::Backend(msg) => write!(f, "store backend error: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Integrity(e) => Some(e),
            Self::Backend(_) => None,
        }
    }
}

impl From<IntegrityError> for StoreError {
    fn from(e: IntegrityError) -> Self {
        Self::Integrity(e)
    }
}
