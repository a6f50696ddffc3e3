//! The VLSN index facade.
//!
//! This is the rendezvous point between log writers, feeders streaming the
//! log downstream, the checkpointer, the cleaner, and replica syncup. It owns
//! the in-memory [`Tracker`], the persistent [`BucketDb`], the await latch,
//! the log item cache, and the file-deletion bound, and enforces the lock
//! hierarchy across them:
//!
//! 1. the index mutex (latch install, truncation and flush initiation,
//!    recovery merge), then
//! 2. the flush lock (the write path to the backing store), then
//! 3. the tracker mutex (cache mutation and range publication).
//!
//! Range reads never lock: the range cell is read directly. `put` never
//! blocks on I/O; only `wait_for_vlsn` parks.
//!
//! Fatal contradictions (invariant violations, on-disk corruption) poison
//! the index: every later operation fails fast with the recorded cause until
//! the environment is reopened.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::index::bucket::{BucketPolicy, IndexBucket};
use crate::index::item_cache::LogItemCache;
use crate::index::latch::{AwaitLatch, LatchWait};
use crate::index::protect::{DeletionCoordinator, FileBound, ProtectedFileRange};
use crate::index::range::{Range, RangeCell};
use crate::index::store::{BucketDb, KvStore, StoreError, StoreTxn};
use crate::index::tracker::{Tracker, TrackerViolation};
use crate::types::{EntryType, LogEntry, Lsn, Vlsn};

/// Tuning knobs for the index.
#[derive(Debug, Clone, Copy)]
pub struct IndexConfig {
    /// Target interval, in VLSNs, between retained bucket mappings.
    pub stride: u32,
    /// Cap on retained mappings per bucket.
    pub max_mappings: usize,
    /// Cap on the physical byte span of a bucket.
    pub max_distance: u64,
    /// Capacity of the log item cache.
    pub log_cache_size: usize,
    /// Total budget for [`VlsnIndex::await_consistency`].
    pub wait_consistency: Duration,
    /// Minimum number of VLSNs head truncation must preserve.
    pub min_index_size: u64,
    /// Ceiling on durable commits hard recovery may discard.
    pub rollback_txn_limit: usize,
    /// Forbid hard recovery from discarding any durable commit.
    pub rollback_disabled: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            stride: 10,
            max_mappings: 1000,
            max_distance: 100 * 1024 * 1024,
            log_cache_size: 32,
            wait_consistency: Duration::from_secs(30),
            min_index_size: 50,
            rollback_txn_limit: 10,
            rollback_disabled: false,
        }
    }
}

impl IndexConfig {
    /// The bucket retention policy slice of this configuration.
    #[must_use]
    pub const fn bucket_policy(&self) -> BucketPolicy {
        BucketPolicy {
            stride: self.stride,
            max_mappings: self.max_mappings,
            max_distance: self.max_distance,
        }
    }
}

/// Whether this node allocates VLSNs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    /// The node assigns new VLSNs and stamps durable-txn VLSNs.
    Master,
    /// The node replays the stream; allocation requests fail.
    Replica,
}

/// Durability requested from a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    /// Commit only.
    NoSync,
    /// Commit, then fsync the backing store.
    Sync,
}

/// Index operation failures.
#[derive(Debug)]
pub enum IndexError {
    /// A replica asked for a new VLSN.
    NotMaster,
    /// Detected contradiction; the environment is invalidated.
    InvariantViolation(String),
    /// `wait_for_vlsn` exceeded its deadline.
    Timeout,
    /// The await latch was terminated by shutdown or a role change.
    Poisoned,
    /// Backing store failure; integrity flavors invalidate the environment.
    Store(StoreError),
    /// The environment was invalidated earlier; the original cause is replayed.
    Fatal(String),
}

impl std::fmt::Display for IndexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotMaster => write!(f, "VLSN allocation requires the master role"),
            Self::InvariantViolation(msg) => write!(f, "index invariant violated: {msg}"),
            Self::Timeout => write!(f, "timed out waiting for VLSN"),
            Self::Poisoned => write!(f, "wait latch terminated"),
            Self::Store(e) => write!(f, "index store failure: {e}"),
            Self::Fatal(cause) => write!(f, "index environment invalidated: {cause}"),
        }
    }
}

impl std::error::Error for IndexError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TrackerViolation> for IndexError {
    fn from(e: TrackerViolation) -> Self {
        Self::InvariantViolation(e.0)
    }
}

/// Sequencing state checked on every master-side log append.
#[derive(Debug)]
struct Sequencer {
    /// VLSN of the last logged entry; appends must be contiguous.
    prev_logged: Vlsn,
    /// VLSN of the last commit or abort entry.
    prev_txn_end: Vlsn,
    /// Durable-txn VLSN stamped onto commit and abort entries.
    durable: Vlsn,
    /// Leadership term of the last commit or abort entry.
    term: u64,
}

#[derive(Debug, Default)]
struct FatalState {
    cause: Mutex<Option<String>>,
}

impl FatalState {
    fn check(&self) -> Result<(), IndexError> {
        match self.cause.lock() {
            Ok(guard) => match guard.as_ref() {
                Some(cause) => Err(IndexError::Fatal(cause.clone())),
                None => Ok(()),
            },
            Err(_) => Err(IndexError::Fatal("fatal-state mutex poisoned".to_string())),
        }
    }

    fn record(&self, cause: &str) {
        if let Ok(mut guard) = self.cause.lock()
            && guard.is_none()
        {
            tracing::error!(cause, "index environment invalidated");
            *guard = Some(cause.to_string());
        }
    }
}

/// The public surface of the replication log index.
#[derive(Debug)]
pub struct VlsnIndex<S: KvStore> {
    config: IndexConfig,
    db: BucketDb<S>,
    /// Outermost lock: latch install, truncation and flush initiation, merge.
    state: Mutex<IndexState>,
    /// Write path to the backing store; ordered strictly inside `state`.
    flush_lock: Mutex<()>,
    /// Cache mutation and range publication; innermost.
    tracker: Mutex<Tracker>,
    /// Lock-free range reads.
    range_cell: Arc<RangeCell>,
    item_cache: LogItemCache,
    coordinator: Arc<DeletionCoordinator>,
    /// The index's own file-deletion lower bound.
    file_bound: FileBound,
    /// Master-only VLSN allocator; holds the latest allocated sequence.
    allocator: Option<AtomicU64>,
    sequencer: Mutex<Sequencer>,
    fatal: FatalState,
}

#[derive(Debug, Default)]
struct IndexState {
    latch: Option<Arc<AwaitLatch>>,
}

impl<S: KvStore> VlsnIndex<S> {
    /// Open the index over `store`, installing the recovered tracker.
    ///
    /// The store's tail must already be pruned to agree with the recovered
    /// log; `recovery` carries the mappings found by scanning the log past
    /// the flushed tail, or an empty tracker on a clean open.
    pub fn open(
        store: S,
        config: IndexConfig,
        role: NodeRole,
        recovery: Tracker,
    ) -> Result<Self, IndexError> {
        let db = BucketDb::new(store);
        let disk_range = db.read_range().map_err(IndexError::Store)?;
        let last_on_disk = db.last_on_disk().map_err(IndexError::Store)?;

        let mut tracker = Tracker::new(
            config.bucket_policy(),
            disk_range.unwrap_or(Range::EMPTY),
            last_on_disk,
        );
        tracker.merge(last_on_disk, recovery)?;
        let range = tracker.range();
        let range_cell = tracker.range_cell();

        let coordinator = DeletionCoordinator::new();
        let first_file = match tracker.lte_bucket(range.first) {
            Some(bucket) => bucket_file(&bucket),
            None => db
                .gte_bucket(range.first)
                .map_err(IndexError::Store)?
                .map_or(0, |b| bucket_file(&b)),
        };
        let file_bound = coordinator.register("vlsn-index", first_file);

        let allocator = match role {
            NodeRole::Master => Some(AtomicU64::new(range.last.sequence())),
            NodeRole::Replica => None,
        };
        let sequencer = Sequencer {
            prev_logged: range.last,
            prev_txn_end: range.last_txn_end,
            durable: if range.is_empty() {
                Vlsn::UNINITIALIZED
            } else {
                Vlsn::NULL
            },
            term: 0,
        };

        tracing::info!(
            first = %range.first,
            last = %range.last,
            %last_on_disk,
            ?role,
            "VLSN index opened"
        );
        Ok(Self {
            config,
            db,
            state: Mutex::new(IndexState::default()),
            flush_lock: Mutex::new(()),
            tracker: Mutex::new(tracker),
            range_cell,
            item_cache: LogItemCache::new(config.log_cache_size),
            coordinator,
            file_bound,
            allocator,
            sequencer: Mutex::new(sequencer),
            fatal: FatalState::default(),
        })
    }

    /// The index configuration.
    #[must_use]
    pub const fn config(&self) -> &IndexConfig {
        &self.config
    }

    /// Lock-free range snapshot.
    #[must_use]
    pub fn range(&self) -> Range {
        self.range_cell.get()
    }

    /// The deletion coordinator shared with the cleaner and the feeders.
    #[must_use]
    pub fn coordinator(&self) -> Arc<DeletionCoordinator> {
        Arc::clone(&self.coordinator)
    }

    /// Record a (vlsn, lsn) mapping for an entry of `kind`.
    ///
    /// Non-blocking: no logging, no I/O. `cached_item` lands in the log item
    /// cache for feeders running near the stream head. Waiters parked on a
    /// VLSN at or below `vlsn` are woken.
    pub fn put(
        &self,
        vlsn: Vlsn,
        lsn: Lsn,
        kind: EntryType,
        cached_item: Option<Arc<LogEntry>>,
    ) -> Result<(), IndexError> {
        self.fatal.check()?;
        {
            let mut tracker = self.lock_tracker()?;
            tracker.track(vlsn, lsn, kind);
        }
        if let Some(item) = cached_item {
            self.item_cache.put(item);
        }

        // Signal outside the tracker mutex; the latch has its own lock.
        let latch = {
            let state = self.lock_state()?;
            state.latch.as_ref().map(Arc::clone)
        };
        if let Some(latch) = latch
            && latch.count_down(vlsn)
        {
            let mut state = self.lock_state()?;
            if state
                .latch
                .as_ref()
                .is_some_and(|held| Arc::ptr_eq(held, &latch))
            {
                state.latch = None;
            }
        }
        Ok(())
    }

    /// Allocate the next VLSN. Master only.
    pub fn bump(&self) -> Result<Vlsn, IndexError> {
        self.fatal.check()?;
        let allocator = self.allocator.as_ref().ok_or(IndexError::NotMaster)?;
        Ok(Vlsn::new(allocator.fetch_add(1, Ordering::SeqCst) + 1))
    }

    /// The most recently allocated VLSN. Master only.
    pub fn latest_allocated(&self) -> Result<Vlsn, IndexError> {
        let allocator = self.allocator.as_ref().ok_or(IndexError::NotMaster)?;
        Ok(Vlsn::new(allocator.load(Ordering::SeqCst)))
    }

    /// Roll back the allocator after an aborted allocation. Master only.
    pub fn regress_allocator(&self, to: Vlsn) -> Result<(), IndexError> {
        let allocator = self.allocator.as_ref().ok_or(IndexError::NotMaster)?;
        allocator.store(to.sequence(), Ordering::SeqCst);
        Ok(())
    }

    /// Record quorum acknowledgment up to `vlsn`; later commit and abort
    /// entries are stamped with it.
    pub fn advance_durable(&self, vlsn: Vlsn) -> Result<(), IndexError> {
        self.fatal.check()?;
        let mut sequencer = self.lock_sequencer()?;
        if sequencer.durable == Vlsn::UNINITIALIZED || sequencer.durable < vlsn {
            sequencer.durable = vlsn;
        }
        Ok(())
    }

    /// Assign a VLSN to an entry under the log write latch, enforcing the
    /// master sequencing invariants: contiguous VLSNs, increasing txn-end
    /// VLSNs, non-decreasing durable-txn VLSNs, non-decreasing terms.
    pub fn assign_vlsn_for_log(&self, entry: &mut LogEntry) -> Result<Vlsn, IndexError> {
        self.fatal.check()?;
        let vlsn = self.bump()?;
        let mut sequencer = self.lock_sequencer()?;

        if !sequencer.prev_logged.is_null() && sequencer.prev_logged.next() != vlsn {
            return Err(self.invalidate(format!(
                "log append out of sequence: {} follows {}",
                vlsn, sequencer.prev_logged
            )));
        }
        sequencer.prev_logged = vlsn;
        entry.vlsn = vlsn;

        if entry.kind.is_txn_end() {
            if !sequencer.prev_txn_end.is_null() && vlsn <= sequencer.prev_txn_end {
                return Err(self.invalidate(format!(
                    "txn-end VLSN {vlsn} not past {}",
                    sequencer.prev_txn_end
                )));
            }
            sequencer.prev_txn_end = vlsn;

            if entry.term < sequencer.term {
                return Err(self.invalidate(format!(
                    "txn-end term {} regressed below {}",
                    entry.term, sequencer.term
                )));
            }
            sequencer.term = entry.term;
            entry.dtvlsn = sequencer.durable;
        }
        Ok(vlsn)
    }

    /// Block until `vlsn` is present in the range, up to `timeout`.
    ///
    /// Only one outstanding wait VLSN is permitted; concurrent callers must
    /// serialize on sequential VLSNs.
    pub fn wait_for_vlsn(&self, vlsn: Vlsn, timeout: Duration) -> Result<(), IndexError> {
        self.fatal.check()?;
        if self.range_cell.get().last >= vlsn {
            return Ok(());
        }

        let latch = {
            let mut state = self.lock_state()?;
            // Recheck under the mutex; a put may have raced us here.
            if self.range_cell.get().last >= vlsn {
                return Ok(());
            }
            match state.latch.as_ref() {
                None => {
                    let latch = Arc::new(AwaitLatch::new(vlsn));
                    state.latch = Some(Arc::clone(&latch));
                    latch
                }
                Some(existing) if existing.target() == vlsn => Arc::clone(existing),
                Some(existing) => {
                    return Err(self.invalidate(format!(
                        "wait for {vlsn} while a latch targets {}",
                        existing.target()
                    )));
                }
            }
        };

        match latch.wait(timeout) {
            LatchWait::Released => Ok(()),
            LatchWait::TimedOut => Err(IndexError::Timeout),
            LatchWait::Poisoned => Err(IndexError::Poisoned),
        }
    }

    /// Wake all waiters with a poisoned latch; used on shutdown and on a
    /// replica-to-master transition.
    pub fn terminate_waiters(&self) {
        if let Ok(mut state) = self.state.lock()
            && let Some(latch) = state.latch.take()
        {
            latch.terminate();
        }
    }

    /// Cached entry lookup for feeders near the stream head.
    #[must_use]
    pub fn cached_entry(&self, vlsn: Vlsn) -> Option<Arc<LogEntry>> {
        self.item_cache.get(vlsn)
    }

    /// Drop cached entries matching `predicate`; used by tail truncation.
    pub fn clear_cached<F: Fn(&LogEntry) -> bool>(&self, predicate: F) {
        self.item_cache.clear(predicate);
    }

    /// The bucket owning `vlsn`, or the nearest bucket past it.
    ///
    /// Every VLSN inside the range resolves to a bucket; failing to find one
    /// is a contradiction and invalidates the environment.
    pub fn gte_bucket(&self, vlsn: Vlsn) -> Result<Option<Arc<IndexBucket>>, IndexError> {
        self.fatal.check()?;
        let from_cache = {
            let tracker = self.lock_tracker()?;
            tracker.gte_bucket(vlsn)
        };
        if let Some(bucket) = from_cache {
            return Ok(Some(bucket));
        }
        let from_disk = self.store_result(self.db.gte_bucket(vlsn))?;
        self.require_if_in_range(vlsn, from_disk.map(Arc::new), "GTE")
    }

    /// The bucket with the greatest first VLSN at or below `vlsn`.
    pub fn lte_bucket(&self, vlsn: Vlsn) -> Result<Option<Arc<IndexBucket>>, IndexError> {
        self.fatal.check()?;
        let from_cache = {
            let tracker = self.lock_tracker()?;
            tracker.lte_bucket(vlsn)
        };
        if let Some(bucket) = from_cache {
            return Ok(Some(bucket));
        }
        let from_disk = self.store_result(self.db.lte_bucket(vlsn))?;
        self.require_if_in_range(vlsn, from_disk.map(Arc::new), "LTE")
    }

    /// Truncate the index head after the cleaner picked a deletion point:
    /// every VLSN at or below `delete_end` lives in files at or below
    /// `delete_file`, which the cleaner wants to delete.
    ///
    /// On success the store is pruned and fsynced before returning, so file
    /// deletion can proceed. Returns false when the preconditions refuse the
    /// truncation; the cleaner retries later.
    pub fn try_truncate_from_head(
        &self,
        delete_end: Vlsn,
        delete_file: u32,
    ) -> Result<bool, IndexError> {
        self.fatal.check()?;
        let _state = self.lock_state()?;
        let _flush = self.lock_flush()?;

        {
            let mut tracker = self.lock_tracker()?;
            if !tracker.truncate_from_head(delete_end, delete_file, self.config.min_index_size) {
                return Ok(false);
            }
        }
        self.file_bound.advance(delete_file + 1);

        let pruned = self.store_result((|| {
            let mut txn = self.db.begin()?;
            let pruned =
                BucketDb::<S>::prune_head(&mut txn, delete_end, delete_file, &self.coordinator)?;
            if pruned {
                BucketDb::<S>::write_range(&mut txn, self.range_cell.get())?;
                txn.commit()?;
                self.db.sync()?;
            }
            Ok(pruned)
        })())?;
        if !pruned {
            tracing::debug!(%delete_end, delete_file, "store head prune deferred");
        }
        Ok(true)
    }

    /// Pick a head-truncation point that frees at least `bytes_needed` from
    /// the listed `(file, size)` pairs, then truncate. The last syncable
    /// entry and the configured minimum index size are preserved.
    pub fn try_free_space(
        &self,
        bytes_needed: u64,
        files: &[(u32, u64)],
    ) -> Result<bool, IndexError> {
        let Some((delete_end, delete_file)) = self.truncation_candidate(bytes_needed, files)?
        else {
            return Ok(false);
        };
        self.try_truncate_from_head(delete_end, delete_file)
    }

    /// Truncate the index tail during replica syncup. The replication stream
    /// must be quiescent.
    ///
    /// `prev_lsn` is the position of the entry at `delete_start - 1`. The
    /// store is pruned and the surviving cache flushed synchronously.
    pub fn truncate_from_tail(&self, delete_start: Vlsn, prev_lsn: Lsn) -> Result<(), IndexError> {
        self.fatal.check()?;
        let _state = self.lock_state()?;
        let _flush = self.lock_flush()?;
        let mut tracker = self.lock_tracker()?;

        tracker
            .truncate_from_tail(delete_start, prev_lsn)
            .map_err(|e| self.invalidate(e.0))?;
        self.item_cache.clear(|e| e.vlsn >= delete_start);

        let new_last_on_disk = self.store_result((|| {
            let mut txn = self.db.begin()?;
            let cap = (!prev_lsn.is_null()).then_some(prev_lsn);
            let new_last = BucketDb::<S>::prune_tail(&mut txn, delete_start, cap)?;
            txn.commit()?;
            Ok(new_last)
        })())?;

        // The store prune may have been unable to cap the straddling bucket
        // (the capping position can live in another file). The new range end
        // must keep an exact mapping somewhere; install one if neither tier
        // has it.
        let range = self.range_cell.get();
        if !range.is_empty()
            && new_last_on_disk != range.last
            && tracker.lsn_lookup(range.last).is_none()
        {
            tracker
                .install_end_mapping(range.last, prev_lsn)
                .map_err(|e| self.invalidate(e.0))?;
        }

        // Flush the surviving cache synchronously before the stream resumes.
        self.store_result((|| {
            let mut txn = self.db.begin()?;
            tracker.flush_into(|bucket| BucketDb::<S>::write_bucket(&mut txn, bucket))?;
            BucketDb::<S>::write_range(&mut txn, range)?;
            txn.commit()?;
            self.db.sync()?;
            Ok(())
        })())?;

        tracker.mark_flushed();
        tracker.set_last_on_disk(new_last_on_disk.max_real(range.last));
        Ok(())
    }

    /// Freeze the files backing the current range head for the caller's
    /// lifetime, typically for the duration of a syncup or a backup.
    pub fn protect_range_head(&self, owner: &str) -> ProtectedFileRange {
        self.coordinator.register(owner, self.file_bound.current())
    }

    /// Flush the bucket cache and range record to the backing store.
    pub fn flush_to_store(&self, durability: Durability) -> Result<(), IndexError> {
        self.fatal.check()?;
        let _state = self.lock_state()?;
        let _flush = self.lock_flush()?;
        let mut tracker = self.lock_tracker()?;

        self.store_result((|| {
            let mut txn = self.db.begin()?;
            tracker.flush_into(|bucket| BucketDb::<S>::write_bucket(&mut txn, bucket))?;
            BucketDb::<S>::write_range(&mut txn, self.range_cell.get())?;
            txn.commit()?;
            if durability == Durability::Sync {
                self.db.sync()?;
            }
            Ok(())
        })())?;
        tracker.mark_flushed();
        tracing::debug!(range = ?self.range_cell.get(), "index flushed");
        Ok(())
    }

    /// Block until every VLSN allocated before this call is present in the
    /// range, so a checkpoint can flush a consistent picture. Master only.
    ///
    /// The latch waits for one value at a time, so this loops over
    /// sequential VLSNs, shrinking the goal if allocations were rolled back.
    pub fn await_consistency(&self) -> Result<(), IndexError> {
        self.fatal.check()?;
        let mut goal = self.latest_allocated()?;
        let deadline = Instant::now() + self.config.wait_consistency;

        loop {
            let range = self.range_cell.get();
            if goal.is_null() || range.last >= goal {
                return Ok(());
            }

            let allocated = self.latest_allocated()?;
            if allocated < goal {
                // An allocation was rolled back. Regressing below what the
                // range already covers can never happen.
                if allocated < range.last {
                    return Err(self.invalidate(format!(
                        "allocator regressed to {allocated} below range end {}",
                        range.last
                    )));
                }
                goal = allocated;
                continue;
            }

            let next = if range.last.is_null() {
                Vlsn::FIRST
            } else {
                range.last.next()
            };
            let now = Instant::now();
            if now >= deadline {
                return Err(IndexError::Timeout);
            }
            self.wait_for_vlsn(next, deadline - now)?;
        }
    }

    fn truncation_candidate(
        &self,
        bytes_needed: u64,
        files: &[(u32, u64)],
    ) -> Result<Option<(Vlsn, u32)>, IndexError> {
        let range = self.range_cell.get();
        if range.is_empty() || files.is_empty() {
            return Ok(None);
        }

        // Truncation may never consume the last syncable entry or leave
        // fewer than min_index_size VLSNs behind.
        let floor = range.last_sync.max_real(Vlsn::new(
            range.last.sequence().saturating_sub(self.config.min_index_size),
        ));

        let mut freed = 0u64;
        let mut candidate = None;
        for &(file, size) in files {
            // The last VLSN wholly inside files <= file is one short of the
            // first mapping in a later file.
            let Some(boundary) = self.first_vlsn_past_file(file)? else {
                break;
            };
            let delete_end = boundary.prev();
            if delete_end.is_null() || !range.contains(delete_end) || delete_end >= floor {
                break;
            }
            freed += size;
            candidate = Some((delete_end, file));
            if freed >= bytes_needed {
                break;
            }
        }
        // The candidate may free less than requested; a partial reclaim
        // still helps the cleaner.
        Ok(candidate)
    }

    /// First VLSN mapped past `file`, walking disk then cache buckets.
    fn first_vlsn_past_file(&self, file: u32) -> Result<Option<Vlsn>, IndexError> {
        let mut probe = self.range_cell.get().first;
        loop {
            let Some(bucket) = self.gte_bucket(probe)? else {
                return Ok(None);
            };
            if bucket_file(&bucket) > file {
                return Ok(Some(bucket.first()));
            }
            let last = bucket.last();
            if last >= self.range_cell.get().last {
                return Ok(None);
            }
            probe = last.next();
        }
    }

    fn require_if_in_range(
        &self,
        vlsn: Vlsn,
        bucket: Option<Arc<IndexBucket>>,
        what: &str,
    ) -> Result<Option<Arc<IndexBucket>>, IndexError> {
        if bucket.is_none() && self.range_cell.get().contains(vlsn) {
            return Err(self.invalidate(format!(
                "no {what} bucket for {vlsn} inside range {:?}",
                self.range_cell.get()
            )));
        }
        Ok(bucket)
    }

    fn invalidate(&self, cause: String) -> IndexError {
        self.fatal.record(&cause);
        IndexError::InvariantViolation(cause)
    }

    fn store_result<T>(&self, result: Result<T, StoreError>) -> Result<T, IndexError> {
        result.map_err(|e| {
            if matches!(e, StoreError::Integrity(_)) {
                self.fatal.record(&e.to_string());
            }
            IndexError::Store(e)
        })
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, IndexState>, IndexError> {
        self.state
            .lock()
            .map_err(|_| IndexError::Fatal("index mutex poisoned".to_string()))
    }

    fn lock_flush(&self) -> Result<MutexGuard<'_, ()>, IndexError> {
        self.flush_lock
            .lock()
            .map_err(|_| IndexError::Fatal("flush lock poisoned".to_string()))
    }

    fn lock_tracker(&self) -> Result<MutexGuard<'_, Tracker>, IndexError> {
        self.tracker
            .lock()
            .map_err(|_| IndexError::Fatal("tracker mutex poisoned".to_string()))
    }

    fn lock_sequencer(&self) -> Result<MutexGuard<'_, Sequencer>, IndexError> {
        self.sequencer
            .lock()
            .map_err(|_| IndexError::Fatal("sequencer mutex poisoned".to_string()))
    }
}

fn bucket_file(bucket: &IndexBucket) -> u32 {
    match bucket {
        IndexBucket::Real(b) => b.file(),
        IndexBucket::Ghost(g) => g.covering_lsn().file(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::store::MemKv;
    use crate::testing::{empty_tracker, open_master};

    fn put_range(index: &VlsnIndex<MemKv>, vlsns: std::ops::RangeInclusive<u64>, file: u32) {
        for v in vlsns {
            #[allow(clippy::cast_possible_truncation)]
            let offset = 100 * v as u32;
            index
                .put(Vlsn::new(v), Lsn::new(file, offset), EntryType::Insert, None)
                .unwrap();
        }
    }

    #[test]
    fn test_sequential_puts_scenario() {
        let index = open_master(IndexConfig::default());
        put_range(&index, 1..=3, 1);

        let range = index.range();
        assert_eq!(range.first, Vlsn::new(1));
        assert_eq!(range.last, Vlsn::new(3));
        assert_eq!(range.last_sync, Vlsn::NULL);
        assert_eq!(range.last_txn_end, Vlsn::NULL);

        let bucket = index.gte_bucket(Vlsn::new(2)).unwrap().unwrap();
        assert_eq!(bucket.lsn(Vlsn::new(2)), Some(Lsn::new(1, 200)));
        assert!(index
            .lte_bucket(Vlsn::new(3))
            .unwrap()
            .unwrap()
            .owns(Vlsn::new(3)));
    }

    #[test]
    fn test_out_of_order_scenario() {
        let index = open_master(IndexConfig::default());
        index
            .put(Vlsn::new(1), Lsn::new(1, 100), EntryType::Insert, None)
            .unwrap();
        index
            .put(Vlsn::new(3), Lsn::new(1, 300), EntryType::Insert, None)
            .unwrap();

        assert_eq!(index.range().last, Vlsn::new(3));
        let bucket = index.gte_bucket(Vlsn::new(2)).unwrap().unwrap();
        assert_eq!(bucket.lsn(Vlsn::new(2)), None);

        index
            .put(Vlsn::new(2), Lsn::new(1, 200), EntryType::Insert, None)
            .unwrap();
        assert_eq!(index.range().last, Vlsn::new(3));
        let bucket = index.gte_bucket(Vlsn::new(2)).unwrap().unwrap();
        assert_eq!(bucket.lsn(Vlsn::new(2)), None);

        // A waiter for 3 returns immediately.
        index
            .wait_for_vlsn(Vlsn::new(3), Duration::from_millis(1))
            .unwrap();
    }

    #[test]
    fn test_flush_and_truncate_head_scenario() {
        let config = IndexConfig {
            min_index_size: 2,
            ..IndexConfig::default()
        };
        let index = open_master(config);
        // Files 1 and 2 hold VLSNs 1..=5 and 6..=10.
        put_range(&index, 1..=5, 1);
        put_range(&index, 6..=10, 2);
        index.flush_to_store(Durability::Sync).unwrap();

        assert!(index.try_truncate_from_head(Vlsn::new(5), 1).unwrap());
        let range = index.range();
        assert_eq!(range.first, Vlsn::new(6));
        assert_eq!(range.last, Vlsn::new(10));

        // Every surviving VLSN still resolves to a bucket.
        for v in 6..=10u64 {
            assert!(index.gte_bucket(Vlsn::new(v)).unwrap().is_some());
        }
        // Files at or below 1 became deletable; file 2 is still pinned.
        assert!(index.coordinator().deletable(1));
        assert!(!index.coordinator().deletable(2));
    }

    #[test]
    fn test_truncate_head_preconditions_refused() {
        let config = IndexConfig {
            min_index_size: 8,
            ..IndexConfig::default()
        };
        let index = open_master(config);
        put_range(&index, 1..=10, 1);
        // Only 10 VLSNs exist and 8 must be preserved.
        assert!(!index.try_truncate_from_head(Vlsn::new(5), 1).unwrap());
    }

    #[test]
    fn test_put_after_flush_opens_new_bucket() {
        let index = open_master(IndexConfig::default());
        put_range(&index, 1..=4, 1);
        index.flush_to_store(Durability::NoSync).unwrap();

        // Boundary: the next contiguous put with an empty cache.
        index
            .put(Vlsn::new(5), Lsn::new(1, 500), EntryType::Insert, None)
            .unwrap();
        assert_eq!(index.range().last, Vlsn::new(5));
        let bucket = index.gte_bucket(Vlsn::new(5)).unwrap().unwrap();
        assert_eq!(bucket.first(), Vlsn::new(5));
        assert_eq!(bucket.lsn(Vlsn::new(5)), Some(Lsn::new(1, 500)));
    }

    #[test]
    fn test_laggard_put_before_flushed_tail_updates_range_only() {
        let index = open_master(IndexConfig::default());
        put_range(&index, 1..=4, 1);
        index.flush_to_store(Durability::NoSync).unwrap();

        // Boundary: a put landing before the tracked head mutates no bucket.
        index
            .put(Vlsn::new(3), Lsn::new(1, 333), EntryType::TxnCommit, None)
            .unwrap();
        assert_eq!(index.range().last_txn_end, Vlsn::new(3));
        let bucket = index.gte_bucket(Vlsn::new(3)).unwrap().unwrap();
        assert_eq!(bucket.lsn(Vlsn::new(3)), Some(Lsn::new(1, 300)));
    }

    #[test]
    fn test_wait_for_vlsn_times_out() {
        let index = open_master(IndexConfig::default());
        put_range(&index, 1..=2, 1);
        assert!(matches!(
            index.wait_for_vlsn(Vlsn::new(5), Duration::from_millis(10)),
            Err(IndexError::Timeout)
        ));
    }

    #[test]
    fn test_wait_for_vlsn_released_by_put() {
        let index = Arc::new(open_master(IndexConfig::default()));
        put_range(&index, 1..=2, 1);

        let waiter = {
            let index = Arc::clone(&index);
            std::thread::spawn(move || index.wait_for_vlsn(Vlsn::new(3), Duration::from_secs(10)))
        };
        std::thread::sleep(Duration::from_millis(20));
        index
            .put(Vlsn::new(3), Lsn::new(1, 300), EntryType::Insert, None)
            .unwrap();
        waiter.join().unwrap().unwrap();
    }

    #[test]
    fn test_second_waiter_with_other_target_is_invariant_violation() {
        let index = Arc::new(open_master(IndexConfig::default()));
        put_range(&index, 1..=2, 1);

        let parked = {
            let index = Arc::clone(&index);
            std::thread::spawn(move || index.wait_for_vlsn(Vlsn::new(3), Duration::from_secs(10)))
        };
        std::thread::sleep(Duration::from_millis(20));
        assert!(matches!(
            index.wait_for_vlsn(Vlsn::new(7), Duration::from_millis(10)),
            Err(IndexError::InvariantViolation(_))
        ));
        // The environment is now poisoned; release the parked waiter.
        index.terminate_waiters();
        assert!(matches!(
            parked.join().unwrap(),
            Err(IndexError::Poisoned)
        ));
    }

    #[test]
    fn test_fatal_state_fails_fast() {
        let index = open_master(IndexConfig::default());
        put_range(&index, 1..=2, 1);
        let _ = index.invalidate("test-induced failure".to_string());
        assert!(matches!(
            index.put(Vlsn::new(3), Lsn::new(1, 300), EntryType::Insert, None),
            Err(IndexError::Fatal(_))
        ));
        assert!(matches!(
            index.gte_bucket(Vlsn::new(1)),
            Err(IndexError::Fatal(_))
        ));
    }

    #[test]
    fn test_replica_cannot_allocate() {
        let index = VlsnIndex::open(
            MemKv::new(),
            IndexConfig::default(),
            NodeRole::Replica,
            empty_tracker(IndexConfig::default()),
        )
        .unwrap();
        assert!(matches!(index.bump(), Err(IndexError::NotMaster)));
        // Replay-side puts still work.
        index
            .put(Vlsn::new(1), Lsn::new(1, 100), EntryType::Insert, None)
            .unwrap();
        assert_eq!(index.range().last, Vlsn::new(1));
    }

    #[test]
    fn test_assign_vlsn_sequencing() {
        let index = open_master(IndexConfig::default());
        let mut insert = LogEntry::new(EntryType::Insert, 1, Vlsn::NULL, vec![1]);
        assert_eq!(index.assign_vlsn_for_log(&mut insert).unwrap(), Vlsn::new(1));
        index
            .put(insert.vlsn, Lsn::new(1, 100), insert.kind, None)
            .unwrap();

        let mut commit = LogEntry::new(EntryType::TxnCommit, 1, Vlsn::NULL, Vec::new());
        assert_eq!(index.assign_vlsn_for_log(&mut commit).unwrap(), Vlsn::new(2));
        // Fresh store: the durable-txn VLSN starts uninitialized.
        assert_eq!(commit.dtvlsn, Vlsn::UNINITIALIZED);
        index
            .put(commit.vlsn, Lsn::new(1, 200), commit.kind, None)
            .unwrap();

        index.advance_durable(Vlsn::new(2)).unwrap();
        let mut commit2 = LogEntry::new(EntryType::TxnCommit, 1, Vlsn::NULL, Vec::new());
        index.assign_vlsn_for_log(&mut commit2).unwrap();
        assert_eq!(commit2.dtvlsn, Vlsn::new(2));
    }

    #[test]
    fn test_assign_vlsn_rejects_term_regression() {
        let index = open_master(IndexConfig::default());
        let mut commit = LogEntry::new(EntryType::TxnCommit, 5, Vlsn::NULL, Vec::new());
        index.assign_vlsn_for_log(&mut commit).unwrap();

        let mut stale = LogEntry::new(EntryType::TxnCommit, 4, Vlsn::NULL, Vec::new());
        assert!(matches!(
            index.assign_vlsn_for_log(&mut stale),
            Err(IndexError::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_await_consistency_scenario() {
        let index = Arc::new(open_master(IndexConfig::default()));
        put_range(&index, 1..=2, 1);
        // Allocate 3 and 4 without logging them yet.
        assert_eq!(index.bump().unwrap(), Vlsn::new(3));
        assert_eq!(index.bump().unwrap(), Vlsn::new(4));

        let checkpointer = {
            let index = Arc::clone(&index);
            std::thread::spawn(move || index.await_consistency())
        };
        std::thread::sleep(Duration::from_millis(20));
        index
            .put(Vlsn::new(3), Lsn::new(1, 300), EntryType::Insert, None)
            .unwrap();
        std::thread::sleep(Duration::from_millis(10));
        index
            .put(Vlsn::new(4), Lsn::new(1, 400), EntryType::Insert, None)
            .unwrap();
        checkpointer.join().unwrap().unwrap();
    }

    #[test]
    fn test_await_consistency_goal_reduction() {
        let config = IndexConfig {
            wait_consistency: Duration::from_millis(300),
            ..IndexConfig::default()
        };
        let index = Arc::new(open_master(config));
        put_range(&index, 1..=2, 1);
        assert_eq!(index.bump().unwrap(), Vlsn::new(3));
        assert_eq!(index.bump().unwrap(), Vlsn::new(4));

        let checkpointer = {
            let index = Arc::clone(&index);
            std::thread::spawn(move || index.await_consistency())
        };
        std::thread::sleep(Duration::from_millis(20));
        // The allocation of 4 aborts; 3 still arrives.
        index.regress_allocator(Vlsn::new(3)).unwrap();
        index
            .put(Vlsn::new(3), Lsn::new(1, 300), EntryType::Insert, None)
            .unwrap();
        checkpointer.join().unwrap().unwrap();
    }

    #[test]
    fn test_flush_is_idempotent() {
        let index = open_master(IndexConfig::default());
        put_range(&index, 1..=6, 1);
        index.flush_to_store(Durability::Sync).unwrap();
        let after_first = index.range();
        // No intervening puts: the second flush only rewrites the range.
        index.flush_to_store(Durability::Sync).unwrap();
        assert_eq!(index.range(), after_first);
        for v in 1..=6u64 {
            assert!(index.gte_bucket(Vlsn::new(v)).unwrap().is_some());
        }
    }

    #[test]
    fn test_truncate_head_survives_reopen() {
        let config = IndexConfig {
            min_index_size: 2,
            ..IndexConfig::default()
        };
        let store = MemKv::new();
        {
            let index = VlsnIndex::open(
                store.clone(),
                config,
                NodeRole::Master,
                empty_tracker(config),
            )
            .unwrap();
            put_range(&index, 1..=5, 1);
            put_range(&index, 6..=10, 2);
            index.flush_to_store(Durability::Sync).unwrap();
            assert!(index.try_truncate_from_head(Vlsn::new(5), 1).unwrap());
        }

        // The pruned range record is what a restart sees.
        let reopened = VlsnIndex::open(
            store,
            config,
            NodeRole::Replica,
            empty_tracker(config),
        )
        .unwrap();
        let range = reopened.range();
        assert_eq!(range.first, Vlsn::new(6));
        assert_eq!(range.last, Vlsn::new(10));
        for v in 6..=10u64 {
            assert!(reopened.gte_bucket(Vlsn::new(v)).unwrap().is_some());
        }
    }

    #[test]
    fn test_reopen_merges_recovery_tracker() {
        let config = IndexConfig::default();
        let store = MemKv::new();
        {
            let index = VlsnIndex::open(
                store.clone(),
                config,
                NodeRole::Master,
                empty_tracker(config),
            )
            .unwrap();
            put_range(&index, 1..=6, 1);
            index.flush_to_store(Durability::Sync).unwrap();
        }

        // Recovery scanned the log tail and found two entries past the
        // flushed state.
        let mut recovery = empty_tracker(config);
        recovery.track(Vlsn::new(7), Lsn::new(1, 700), EntryType::Insert);
        recovery.track(Vlsn::new(8), Lsn::new(1, 800), EntryType::TxnCommit);

        let index = VlsnIndex::open(store, config, NodeRole::Replica, recovery).unwrap();
        let range = index.range();
        assert_eq!(range.first, Vlsn::new(1));
        assert_eq!(range.last, Vlsn::new(8));
        assert_eq!(range.last_txn_end, Vlsn::new(8));
        let bucket = index.gte_bucket(Vlsn::new(8)).unwrap().unwrap();
        assert_eq!(bucket.lsn(Vlsn::new(8)), Some(Lsn::new(1, 800)));
    }

    #[test]
    fn test_truncate_from_tail_full_path() {
        let config = IndexConfig {
            stride: 3,
            ..IndexConfig::default()
        };
        let index = open_master(config);
        put_range(&index, 10..=16, 1);
        index.flush_to_store(Durability::Sync).unwrap();
        put_range(&index, 18..=20, 2);

        index
            .truncate_from_tail(Vlsn::new(18), Lsn::new(1, 1700))
            .unwrap();
        let range = index.range();
        assert_eq!(range.last, Vlsn::new(17));
        // The range end keeps an exact mapping.
        let bucket = index.lte_bucket(Vlsn::new(17)).unwrap().unwrap();
        assert_eq!(bucket.lsn(Vlsn::new(17)), Some(Lsn::new(1, 1700)));
        // Nothing past the new end resolves.
        assert!(index.gte_bucket(Vlsn::new(18)).unwrap().is_none());
    }

    #[test]
    fn test_protect_range_head_blocks_cleaner() {
        let config = IndexConfig {
            min_index_size: 2,
            ..IndexConfig::default()
        };
        let index = open_master(config);
        put_range(&index, 1..=5, 1);
        put_range(&index, 6..=10, 2);
        index.flush_to_store(Durability::Sync).unwrap();

        let guard = index.protect_range_head("syncup");
        assert!(index.try_truncate_from_head(Vlsn::new(5), 1).unwrap());
        // The index moved on, but the protected range still pins file 1.
        assert!(!index.coordinator().deletable(1));
        drop(guard);
        assert!(index.coordinator().deletable(1));
    }
}
