//! In-memory bucket cache and the single mutation point of the index.
//!
//! All writers funnel through [`Tracker::track`]; the tracker decides whether
//! a mapping lands in the current bucket, rolls the current bucket over, or
//! is absorbed as a range-only update. Readers obtain closed buckets as
//! shared references and never see the current bucket mid-mutation: lookups
//! clone a snapshot of it.
//!
//! The tracker also carries the truncation and recovery-merge logic that
//! operates purely on the in-memory cache; the facade pairs those with the
//! matching store pruning.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::index::bucket::{Bucket, BucketPolicy, GhostBucket, IndexBucket, PutOutcome};
use crate::index::range::{Range, RangeCell};
use crate::index::store::FILE_HEADER_SIZE;
use crate::types::{EntryType, Lsn, Vlsn};

/// Contradictions detected while mutating the cache. These invalidate the
/// environment.
#[derive(Debug)]
pub struct TrackerViolation(pub String);

impl std::fmt::Display for TrackerViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tracker invariant violated: {}", self.0)
    }
}

impl std::error::Error for TrackerViolation {}

/// The in-memory side of the VLSN index.
#[derive(Debug)]
pub struct Tracker {
    policy: BucketPolicy,
    /// Closed buckets keyed by first VLSN.
    buckets: BTreeMap<u64, Arc<IndexBucket>>,
    /// The sole mutable bucket, exclusively owned.
    current: Option<Bucket>,
    /// Highest VLSN already persisted. Mappings at or below arrive as
    /// laggards and only update the range; on-disk buckets stay immutable.
    last_on_disk: Vlsn,
    /// Lock-free publication point for the range.
    range_cell: Arc<RangeCell>,
    /// Set when the persisted range record must be rewritten even though the
    /// bucket cache is empty.
    dirty: bool,
}

impl Tracker {
    /// Create a tracker over an existing range and on-disk high point.
    #[must_use]
    pub fn new(policy: BucketPolicy, range: Range, last_on_disk: Vlsn) -> Self {
        Self {
            policy,
            buckets: BTreeMap::new(),
            current: None,
            last_on_disk,
            range_cell: Arc::new(RangeCell::new(range)),
            dirty: false,
        }
    }

    /// The current range snapshot.
    #[must_use]
    pub fn range(&self) -> Range {
        self.range_cell.get()
    }

    /// Shared handle to the range cell for lock-free readers.
    #[must_use]
    pub fn range_cell(&self) -> Arc<RangeCell> {
        Arc::clone(&self.range_cell)
    }

    /// Highest VLSN already persisted.
    #[must_use]
    pub const fn last_on_disk(&self) -> Vlsn {
        self.last_on_disk
    }

    /// Record a pruned or freshly flushed on-disk high point.
    pub const fn set_last_on_disk(&mut self, vlsn: Vlsn) {
        self.last_on_disk = vlsn;
    }

    /// Lowest VLSN covered by the cache, NULL when the cache is empty.
    #[must_use]
    pub fn first_tracked(&self) -> Vlsn {
        let cached = self
            .buckets
            .keys()
            .next()
            .copied()
            .map_or(Vlsn::NULL, Vlsn::new);
        let current = self.current.as_ref().map_or(Vlsn::NULL, Bucket::first);
        cached.min_real(current)
    }

    /// Whether the next flush has anything to write.
    #[must_use]
    pub fn needs_flush(&self) -> bool {
        self.dirty || self.current.is_some() || !self.buckets.is_empty()
    }

    /// Observe a (vlsn, lsn) mapping of an entry of `kind`.
    ///
    /// Laggard mappings, mappings that would rewrite an already closed or
    /// flushed bucket, are absorbed: the range still advances so sync and
    /// txn-end information is never lost, but no bucket mutates.
    pub fn track(&mut self, vlsn: Vlsn, lsn: Lsn, kind: EntryType) {
        if vlsn <= self.last_on_disk {
            tracing::debug!(%vlsn, %lsn, "laggard mapping below the flushed tail");
            self.advance_range(vlsn, kind);
            return;
        }

        let Some(current) = self.current.as_mut() else {
            self.current = Some(Bucket::new(vlsn, lsn, self.policy.stride));
            self.advance_range(vlsn, kind);
            return;
        };

        if current.follows(vlsn) {
            // Earlier than the current bucket; accepting it would mean
            // rewriting a closed bucket.
            tracing::debug!(%vlsn, "laggard mapping behind the current bucket");
            self.advance_range(vlsn, kind);
            return;
        }

        match current.put(vlsn, lsn, &self.policy) {
            PutOutcome::Added => {}
            PutOutcome::Covered => {
                tracing::debug!(%vlsn, "mapping already covered by the current bucket");
            }
            PutOutcome::Full => {
                let closed = self.current.take().map(IndexBucket::Real);
                if let Some(closed) = closed {
                    self.buckets
                        .insert(closed.first().sequence(), Arc::new(closed));
                }
                // A fresh bucket rooted at the mapping cannot refuse it.
                self.current = Some(Bucket::new(vlsn, lsn, self.policy.stride));
            }
        }
        self.advance_range(vlsn, kind);
    }

    /// The cached bucket owning `vlsn`, or the nearest cached bucket past it.
    ///
    /// Returns `None` when `vlsn` is at or below the flushed tail; the caller
    /// must consult the backing store instead.
    #[must_use]
    pub fn gte_bucket(&self, vlsn: Vlsn) -> Option<Arc<IndexBucket>> {
        if !self.last_on_disk.is_null() && vlsn <= self.last_on_disk {
            return None;
        }
        // Greatest first key at or below vlsn, if it owns the value.
        if let Some(bucket) = self.lte_candidate(vlsn)
            && bucket.owns(vlsn)
        {
            return Some(bucket);
        }
        // Otherwise the least first key past vlsn.
        let from_cache = self
            .buckets
            .range(vlsn.sequence()..)
            .next()
            .map(|(_, b)| Arc::clone(b));
        if from_cache.is_some() {
            return from_cache;
        }
        self.current
            .as_ref()
            .filter(|c| c.first() >= vlsn)
            .map(|c| Arc::new(IndexBucket::Real(c.clone())))
    }

    /// The cached bucket with the greatest first VLSN at or below `vlsn`.
    ///
    /// Returns `None` when `vlsn` precedes the cache; the caller must consult
    /// the backing store.
    #[must_use]
    pub fn lte_bucket(&self, vlsn: Vlsn) -> Option<Arc<IndexBucket>> {
        let first_tracked = self.first_tracked();
        if first_tracked.is_null() || vlsn < first_tracked {
            return None;
        }
        self.lte_candidate(vlsn)
    }

    /// Write the cache and range under `txn`. Call [`Tracker::mark_flushed`]
    /// once the transaction commits.
    pub fn flush_into<T, E>(&mut self, mut write_bucket: T) -> Result<(), E>
    where
        T: FnMut(&IndexBucket) -> Result<(), E>,
    {
        if let Some(current) = self.current.take() {
            self.buckets
                .insert(current.first().sequence(), Arc::new(IndexBucket::Real(current)));
        }
        for bucket in self.buckets.values() {
            write_bucket(bucket)?;
        }
        Ok(())
    }

    /// Clear the cache after a successful flush commit.
    pub fn mark_flushed(&mut self) {
        self.buckets.clear();
        self.current = None;
        self.dirty = false;
        let last = self.range().last;
        if !last.is_null() {
            self.last_on_disk = last;
        }
    }

    /// Truncate the cache from the head, in step with log-file deletion.
    ///
    /// Fails when the deletion point would consume the last syncable entry
    /// and leave fewer than `min_index_size` VLSNs behind.
    pub fn truncate_from_head(
        &mut self,
        delete_end: Vlsn,
        delete_file: u32,
        min_index_size: u64,
    ) -> bool {
        let range = self.range();
        if range.is_empty() || delete_end < range.first {
            return false;
        }
        let floor = range
            .last_sync
            .max_real(Vlsn::new(range.last.sequence().saturating_sub(min_index_size)));
        if floor.is_null() || delete_end >= floor {
            return false;
        }

        // Drop cache buckets that fall entirely below the deletion point.
        self.buckets = std::mem::take(&mut self.buckets)
            .into_iter()
            .filter(|(_, b)| !b_last_at_or_below(b, delete_end))
            .collect();
        if self
            .current
            .as_ref()
            .is_some_and(|c| c.last() <= delete_end)
        {
            self.current = None;
        }

        // A cache-side ghost is only correct when the whole span below the
        // anchor was cache-resident; otherwise the store prune places the
        // ghost relative to the surviving on-disk buckets.
        let anchor = delete_end.next();
        let next_first = self.first_tracked();
        if (self.last_on_disk.is_null() || self.last_on_disk < anchor)
            && !next_first.is_null()
            && next_first > anchor
        {
            let bounding = self
                .buckets
                .values()
                .next()
                .and_then(|b| b.gte_lsn(b.first()))
                .or_else(|| self.current.as_ref().and_then(|c| c.gte_lsn(c.first())))
                .unwrap_or(Lsn::NULL);
            let ghost = GhostBucket::new(anchor, Lsn::new(delete_file + 1, FILE_HEADER_SIZE), bounding);
            self.buckets
                .insert(anchor.sequence(), Arc::new(IndexBucket::Ghost(ghost)));
        }

        self.range_cell.set(range.shorten_from_head(delete_end));
        self.dirty = true;
        tracing::info!(%delete_end, delete_file, "index head truncated");
        true
    }

    /// Truncate the cache from the tail during replica syncup. The stream
    /// must be quiescent: no concurrent track calls.
    ///
    /// `prev_lsn` is the position of the entry at `delete_start - 1`, used to
    /// cap a straddling bucket and to guarantee the new range end keeps an
    /// exact mapping.
    pub fn truncate_from_tail(
        &mut self,
        delete_start: Vlsn,
        prev_lsn: Lsn,
    ) -> Result<(), TrackerViolation> {
        let range = self.range();
        let new_range = range.shorten_from_end(delete_start);
        let cap = (!prev_lsn.is_null()).then_some(prev_lsn);

        // Remove cache buckets entirely at or past the deletion point, and
        // cut back a straddling one.
        self.buckets = std::mem::take(&mut self.buckets)
            .into_iter()
            .filter(|(first, _)| Vlsn::new(*first) < delete_start)
            .map(|(first, bucket)| {
                if bucket.precedes(delete_start) {
                    return Ok((first, bucket));
                }
                match bucket.as_ref() {
                    IndexBucket::Real(real) => {
                        let mut cut = real.clone();
                        cut.remove_from_tail(delete_start, cap);
                        Ok((first, Arc::new(IndexBucket::Real(cut))))
                    }
                    IndexBucket::Ghost(_) => Err(TrackerViolation(format!(
                        "ghost bucket straddles tail truncation at {delete_start}"
                    ))),
                }
            })
            .collect::<Result<_, _>>()?;
        self.buckets.retain(|_, b| match b.as_ref() {
            IndexBucket::Real(real) => !real.is_empty(),
            IndexBucket::Ghost(_) => true,
        });

        if let Some(mut current) = self.current.take()
            && current.first() < delete_start
        {
            if !current.precedes(delete_start) {
                current.remove_from_tail(delete_start, cap);
            }
            if !current.is_empty() {
                self.current = Some(current);
            }
        }

        self.range_cell.set(new_range);
        self.dirty = true;

        // The range end must keep an exact mapping. When the new end is at
        // or below the flushed tail, the store prune caps it in place; only
        // a cache-territory end needs a fresh bucket here.
        if !new_range.is_empty()
            && new_range.last > self.last_on_disk
            && self.lsn_lookup(new_range.last).is_none()
        {
            if prev_lsn.is_null() {
                return Err(TrackerViolation(format!(
                    "no mapping available for truncated range end {}",
                    new_range.last
                )));
            }
            if let Some(current) = self.current.take() {
                self.buckets
                    .insert(current.first().sequence(), Arc::new(IndexBucket::Real(current)));
            }
            self.current = Some(Bucket::new(new_range.last, prev_lsn, self.policy.stride));
        }
        tracing::info!(%delete_start, "index tail truncated");
        Ok(())
    }

    /// Merge a recovery tracker over this one. Called once at startup, after
    /// the store tail was pruned to `last_on_disk`.
    ///
    /// Recovery's buckets supersede any cached coverage they overlap, and
    /// recovery's view of the stream tail becomes the truth; only the range
    /// head survives from the pre-recovery state.
    pub fn merge(&mut self, last_on_disk: Vlsn, recovery: Self) -> Result<(), TrackerViolation> {
        self.last_on_disk = last_on_disk;
        let mine = self.range();
        let theirs = recovery.range();

        let recovery_first = recovery.first_tracked();
        if !recovery_first.is_null() {
            // Recovery owns everything from its start onward.
            self.buckets
                .retain(|first, _| Vlsn::new(*first) < recovery_first);
            let straddler = self
                .buckets
                .iter()
                .next_back()
                .filter(|(_, b)| !b.precedes(recovery_first))
                .map(|(k, b)| (*k, Arc::clone(b)));
            if let Some((first, bucket)) = straddler {
                let IndexBucket::Real(real) = bucket.as_ref() else {
                    return Err(TrackerViolation(format!(
                        "ghost bucket straddles recovery start {recovery_first}"
                    )));
                };
                let mut cut = real.clone();
                cut.remove_from_tail(recovery_first, None);
                if cut.is_empty() {
                    self.buckets.remove(&first);
                } else {
                    self.buckets.insert(first, Arc::new(IndexBucket::Real(cut)));
                }
            }
            if let Some(mut current) = self.current.take()
                && current.first() < recovery_first
            {
                if !current.precedes(recovery_first) {
                    current.remove_from_tail(recovery_first, None);
                }
                if !current.is_empty() {
                    self.buckets
                        .insert(current.first().sequence(), Arc::new(IndexBucket::Real(current)));
                }
            }
            self.buckets.extend(recovery.buckets);
            self.current = recovery.current;
        }

        let merged = if theirs.is_empty() {
            // Nothing recovered past the flushed tail; the pruned disk state
            // is the whole truth.
            if !last_on_disk.is_null() && mine.last > last_on_disk {
                mine.shorten_from_end(last_on_disk.next())
            } else {
                mine
            }
        } else {
            let clamp = |v: Vlsn| if v > theirs.last { Vlsn::NULL } else { v };
            Range {
                first: mine.first.min_real(theirs.first),
                last: theirs.last,
                last_sync: theirs.last_sync.max_real(clamp(mine.last_sync)),
                last_txn_end: theirs.last_txn_end.max_real(clamp(mine.last_txn_end)),
            }
        };
        self.range_cell.set(merged);
        self.dirty = true;
        Ok(())
    }

    /// Concatenate a recovery tracker that is strictly past this one.
    pub fn append(&mut self, recovery: Self) -> Result<(), TrackerViolation> {
        let recovery_first = recovery.first_tracked();
        let range = self.range();
        let high = self.last_on_disk.max_real(range.last);
        if !recovery_first.is_null() && !high.is_null() && recovery_first <= high {
            return Err(TrackerViolation(format!(
                "recovery tracker starting at {recovery_first} overlaps tail {high}"
            )));
        }
        if let Some(current) = self.current.take() {
            self.buckets
                .insert(current.first().sequence(), Arc::new(IndexBucket::Real(current)));
        }
        self.buckets.extend(recovery.buckets);
        self.current = recovery.current;

        let other = recovery.range_cell.get();
        if !other.is_empty() {
            let merged = Range {
                first: range.first.min_real(other.first),
                last: range.last.max_real(other.last),
                last_sync: range.last_sync.max_real(other.last_sync),
                last_txn_end: range.last_txn_end.max_real(other.last_txn_end),
            };
            self.range_cell.set(merged);
        }
        self.dirty = true;
        Ok(())
    }

    /// Install a fresh current bucket mapping `vlsn` to `lsn`, for a range
    /// end left without an exact mapping after a tail truncation.
    pub fn install_end_mapping(&mut self, vlsn: Vlsn, lsn: Lsn) -> Result<(), TrackerViolation> {
        if lsn.is_null() {
            return Err(TrackerViolation(format!(
                "no mapping available for truncated range end {vlsn}"
            )));
        }
        if let Some(current) = self.current.take() {
            self.buckets
                .insert(current.first().sequence(), Arc::new(IndexBucket::Real(current)));
        }
        self.current = Some(Bucket::new(vlsn, lsn, self.policy.stride));
        self.dirty = true;
        Ok(())
    }

    /// Exact LSN lookup across the cache.
    #[must_use]
    pub fn lsn_lookup(&self, vlsn: Vlsn) -> Option<Lsn> {
        if let Some(current) = self.current.as_ref()
            && current.owns(vlsn)
        {
            return current.lsn(vlsn);
        }
        self.lte_candidate(vlsn)
            .filter(|b| b.owns(vlsn))
            .and_then(|b| b.lsn(vlsn))
    }

    fn advance_range(&mut self, vlsn: Vlsn, kind: EntryType) {
        let range = self.range();
        // A mapping below the range head arrives only after that territory
        // was truncated away; re-expanding the range would claim coverage
        // that no longer exists, and sync markers may never sit below first.
        if !range.is_empty() && vlsn < range.first {
            tracing::debug!(%vlsn, first = %range.first, "dropping mapping below the range head");
            return;
        }
        self.range_cell.set(range.advance(vlsn, kind));
    }

    /// Greatest first key at or below `vlsn`, across closed buckets and the
    /// current bucket.
    fn lte_candidate(&self, vlsn: Vlsn) -> Option<Arc<IndexBucket>> {
        let cached = self
            .buckets
            .range(..=vlsn.sequence())
            .next_back()
            .map(|(_, b)| b);
        match self.current.as_ref() {
            Some(current) if current.first() <= vlsn => {
                // The current bucket always has the greatest first key.
                Some(Arc::new(IndexBucket::Real(current.clone())))
            }
            _ => cached.map(Arc::clone),
        }
    }
}

fn b_last_at_or_below(bucket: &IndexBucket, vlsn: Vlsn) -> bool {
    bucket.last() <= vlsn
}
