//! Sparse VLSN-to-LSN mapping buckets.
//!
//! A bucket covers a contiguous run of VLSNs within a single log file and
//! retains a mapping roughly every `stride` VLSNs, so lookups resolve to a
//! nearby physical position rather than an exact one. The tracker owns at
//! most one mutable "current" bucket; every other bucket is closed and
//! immutable.
//!
//! # Persisted Format
//!
//! ```text
//! +----------+--------------------------------------------+
//! | 0        | tag (1 byte): 0 = bucket, 1 = ghost        |
//! | 1-8      | first vlsn (8 bytes, big-endian)           |
//! | bucket:  | last vlsn (8), file (8), stride (4), n (4) |
//! |          | then n x (vlsn: 8, file offset: 4)         |
//! | ghost:   | covering lsn (8), bounding lsn (8)         |
//! | trailing | CRC32 checksum (4 bytes)                   |
//! +----------+--------------------------------------------+
//! ```

use crate::types::{Lsn, Vlsn};

/// Persisted record tag for a regular bucket.
const TAG_BUCKET: u8 = 0;
/// Persisted record tag for a ghost bucket.
const TAG_GHOST: u8 = 1;

const CHECKSUM_SIZE: usize = 4;

/// Retention and closure limits for the current bucket.
#[derive(Debug, Clone, Copy)]
pub struct BucketPolicy {
    /// Target interval, in VLSNs, between retained mappings.
    pub stride: u32,
    /// Maximum number of retained mappings per bucket.
    pub max_mappings: usize,
    /// Maximum byte span between the first and last LSN of a bucket.
    pub max_distance: u64,
}

impl Default for BucketPolicy {
    fn default() -> Self {
        Self {
            stride: 10,
            max_mappings: 1000,
            max_distance: 100 * 1024 * 1024,
        }
    }
}

/// Outcome of offering a mapping to the current bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The mapping was accepted.
    Added,
    /// The VLSN is at or below the bucket's last VLSN; nothing was mutated.
    Covered,
    /// A closure rule fired; the bucket is full and nothing was mutated.
    Full,
}

/// A sparse mapping over a contiguous VLSN run within one log file.
///
/// # Invariants
///
/// - `first <= last`.
/// - Retained entries are strictly increasing in both VLSN and offset, and
///   all lie in `[first, last]`.
/// - The final retained entry always maps `last` exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bucket {
    first: Vlsn,
    last: Vlsn,
    file: u32,
    stride: u32,
    /// Retained mappings as (vlsn, offset within `file`).
    entries: Vec<(Vlsn, u32)>,
    /// VLSN of the newest stride-retained entry. When the final element of
    /// `entries` is newer than this, it is a provisional last mapping that
    /// gets replaced as the bucket grows.
    last_retained: Vlsn,
}

impl Bucket {
    /// Open a new bucket rooted at the given mapping.
    #[must_use]
    pub fn new(vlsn: Vlsn, lsn: Lsn, stride: u32) -> Self {
        Self {
            first: vlsn,
            last: vlsn,
            file: lsn.file(),
            stride,
            entries: vec![(vlsn, lsn.offset())],
            last_retained: vlsn,
        }
    }

    /// Lowest VLSN covered by this bucket.
    #[must_use]
    pub const fn first(&self) -> Vlsn {
        self.first
    }

    /// Highest VLSN covered by this bucket.
    #[must_use]
    pub const fn last(&self) -> Vlsn {
        self.last
    }

    /// The log file all of this bucket's positions fall in.
    #[must_use]
    pub const fn file(&self) -> u32 {
        self.file
    }

    /// Number of retained mappings.
    #[must_use]
    pub const fn mapping_count(&self) -> usize {
        self.entries.len()
    }

    /// Whether all mappings were removed by a tail truncation.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `vlsn` falls within `[first, last]`.
    #[must_use]
    pub fn owns(&self, vlsn: Vlsn) -> bool {
        self.first <= vlsn && vlsn <= self.last
    }

    /// Whether `vlsn` is past this bucket.
    #[must_use]
    pub fn precedes(&self, vlsn: Vlsn) -> bool {
        vlsn > self.last
    }

    /// Whether `vlsn` is before this bucket.
    #[must_use]
    pub fn follows(&self, vlsn: Vlsn) -> bool {
        vlsn < self.first
    }

    /// Offer a mapping to this bucket. Only valid on the current bucket.
    ///
    /// The mapping is rejected with [`PutOutcome::Covered`] when `vlsn` is
    /// not past `last`, and with [`PutOutcome::Full`] when a closure rule
    /// fires: the retained-mapping cap, the byte-span cap, or a file
    /// boundary cross. A full bucket is left untouched so the caller can
    /// reoffer the mapping to a fresh bucket.
    pub fn put(&mut self, vlsn: Vlsn, lsn: Lsn, policy: &BucketPolicy) -> PutOutcome {
        if vlsn <= self.last {
            return PutOutcome::Covered;
        }
        if lsn.file() != self.file {
            return PutOutcome::Full;
        }
        let first_offset = self.entries.first().map_or(0, |&(_, off)| off);
        if u64::from(lsn.offset().saturating_sub(first_offset)) > policy.max_distance {
            return PutOutcome::Full;
        }

        let retain = vlsn.sequence() >= self.last_retained.sequence() + u64::from(self.stride);
        if retain && self.retained_count() >= policy.max_mappings {
            return PutOutcome::Full;
        }

        // Replace a provisional last mapping rather than stacking them up.
        if self
            .entries
            .last()
            .is_some_and(|&(v, _)| v > self.last_retained)
        {
            self.entries.pop();
        }
        self.entries.push((vlsn, lsn.offset()));
        if retain {
            self.last_retained = vlsn;
        }
        self.last = vlsn;
        PutOutcome::Added
    }

    /// Exact lookup. Returns `None` when no mapping is retained for `vlsn`.
    #[must_use]
    pub fn lsn(&self, vlsn: Vlsn) -> Option<Lsn> {
        self.entries
            .binary_search_by_key(&vlsn, |&(v, _)| v)
            .ok()
            .map(|i| Lsn::new(self.file, self.entries[i].1))
    }

    /// Greatest retained LSN whose VLSN is `<= vlsn`.
    #[must_use]
    pub fn lte_lsn(&self, vlsn: Vlsn) -> Option<Lsn> {
        if vlsn < self.first {
            return None;
        }
        let idx = match self.entries.binary_search_by_key(&vlsn, |&(v, _)| v) {
            Ok(i) => i,
            Err(0) => return None,
            Err(i) => i - 1,
        };
        Some(Lsn::new(self.file, self.entries[idx].1))
    }

    /// Least retained LSN whose VLSN is `>= vlsn`.
    #[must_use]
    pub fn gte_lsn(&self, vlsn: Vlsn) -> Option<Lsn> {
        let idx = match self.entries.binary_search_by_key(&vlsn, |&(v, _)| v) {
            Ok(i) => i,
            Err(i) => i,
        };
        self.entries
            .get(idx)
            .map(|&(_, off)| Lsn::new(self.file, off))
    }

    /// Drop all mappings at or past `delete_start`.
    ///
    /// With a capping LSN, the mapping `(delete_start - 1, capping)` is
    /// installed so the bucket keeps an exact last mapping. The capping LSN
    /// must fall in this bucket's file; otherwise it is unusable and the
    /// uncapped path is taken. Without a cap, the bucket is also cut back
    /// past its highest surviving retained mapping, because the VLSNs between
    /// that mapping and `delete_start` no longer have a trustworthy position.
    pub fn remove_from_tail(&mut self, delete_start: Vlsn, capping_lsn: Option<Lsn>) {
        self.entries.retain(|&(v, _)| v < delete_start);

        let cap = capping_lsn.filter(|l| !l.is_null() && l.file() == self.file);
        if let Some(cap) = cap {
            let capped_vlsn = delete_start.prev();
            if self.entries.last().is_none_or(|&(v, _)| v < capped_vlsn) {
                self.entries.push((capped_vlsn, cap.offset()));
            }
            self.last = capped_vlsn;
            self.last_retained = capped_vlsn;
            if self.first > self.last {
                self.entries.clear();
            }
            return;
        }

        // No cap: cut back past the highest surviving retained mapping.
        if let Some(&(high, _)) = self.entries.last() {
            self.entries.retain(|&(v, _)| v < high);
        }
        match self.entries.last() {
            Some(&(v, _)) => {
                self.last = v;
                self.last_retained = v;
            }
            None => {
                self.last = Vlsn::NULL;
                self.last_retained = Vlsn::NULL;
            }
        }
    }

    /// Serialize this bucket to its persisted record form.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(29 + self.entries.len() * 12 + CHECKSUM_SIZE);
        bytes.push(TAG_BUCKET);
        bytes.extend_from_slice(&self.first.sequence().to_be_bytes());
        bytes.extend_from_slice(&self.last.sequence().to_be_bytes());
        bytes.extend_from_slice(&u64::from(self.file).to_be_bytes());
        bytes.extend_from_slice(&self.stride.to_be_bytes());
        #[allow(clippy::cast_possible_truncation)] // mapping count is policy-capped
        bytes.extend_from_slice(&(self.entries.len() as u32).to_be_bytes());
        for &(vlsn, offset) in &self.entries {
            bytes.extend_from_slice(&vlsn.sequence().to_be_bytes());
            bytes.extend_from_slice(&offset.to_be_bytes());
        }
        let checksum = crc32fast::hash(&bytes);
        bytes.extend_from_slice(&checksum.to_be_bytes());
        bytes
    }

    fn retained_count(&self) -> usize {
        let provisional = usize::from(
            self.entries
                .last()
                .is_some_and(|&(v, _)| v > self.last_retained),
        );
        self.entries.len() - provisional
    }
}

/// Placeholder bucket anchoring the start of the range when head truncation
/// left a gap before the first real mapping.
///
/// Ghosts answer LTE and GTE queries with their covering and bounding LSNs
/// but never resolve an exact lookup; callers must tolerate `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GhostBucket {
    first: Vlsn,
    covering_lsn: Lsn,
    bounding_lsn: Lsn,
}

impl GhostBucket {
    /// Create a ghost anchored at `first`.
    #[must_use]
    pub const fn new(first: Vlsn, covering_lsn: Lsn, bounding_lsn: Lsn) -> Self {
        Self {
            first,
            covering_lsn,
            bounding_lsn,
        }
    }

    /// The VLSN this ghost anchors.
    #[must_use]
    pub const fn first(&self) -> Vlsn {
        self.first
    }

    /// LSN known to be at or before the anchored VLSN.
    #[must_use]
    pub const fn covering_lsn(&self) -> Lsn {
        self.covering_lsn
    }

    /// LSN known to be past the anchored VLSN.
    #[must_use]
    pub const fn bounding_lsn(&self) -> Lsn {
        self.bounding_lsn
    }

    /// Serialize this ghost to its persisted record form.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(25 + CHECKSUM_SIZE);
        bytes.push(TAG_GHOST);
        bytes.extend_from_slice(&self.first.sequence().to_be_bytes());
        bytes.extend_from_slice(&self.covering_lsn.packed().to_be_bytes());
        bytes.extend_from_slice(&self.bounding_lsn.packed().to_be_bytes());
        let checksum = crc32fast::hash(&bytes);
        bytes.extend_from_slice(&checksum.to_be_bytes());
        bytes
    }
}

/// A cache or store slot: either a real bucket or a ghost placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexBucket {
    /// A real sparse mapping.
    Real(Bucket),
    /// A truncation-gap placeholder.
    Ghost(GhostBucket),
}

impl IndexBucket {
    /// Lowest VLSN covered.
    #[must_use]
    pub const fn first(&self) -> Vlsn {
        match self {
            Self::Real(b) => b.first(),
            Self::Ghost(g) => g.first(),
        }
    }

    /// Highest VLSN covered. A ghost covers only its anchor.
    #[must_use]
    pub const fn last(&self) -> Vlsn {
        match self {
            Self::Real(b) => b.last(),
            Self::Ghost(g) => g.first(),
        }
    }

    /// Whether `vlsn` falls within this bucket's coverage.
    #[must_use]
    pub fn owns(&self, vlsn: Vlsn) -> bool {
        self.first() <= vlsn && vlsn <= self.last()
    }

    /// Whether `vlsn` is past this bucket.
    #[must_use]
    pub fn precedes(&self, vlsn: Vlsn) -> bool {
        vlsn > self.last()
    }

    /// Whether `vlsn` is before this bucket.
    #[must_use]
    pub fn follows(&self, vlsn: Vlsn) -> bool {
        vlsn < self.first()
    }

    /// Exact lookup; always `None` on a ghost.
    #[must_use]
    pub fn lsn(&self, vlsn: Vlsn) -> Option<Lsn> {
        match self {
            Self::Real(b) => b.lsn(vlsn),
            Self::Ghost(_) => None,
        }
    }

    /// Greatest known LSN at or before `vlsn`.
    #[must_use]
    pub fn lte_lsn(&self, vlsn: Vlsn) -> Option<Lsn> {
        match self {
            Self::Real(b) => b.lte_lsn(vlsn),
            Self::Ghost(g) => (vlsn >= g.first()).then_some(g.covering_lsn()),
        }
    }

    /// Least known LSN at or past `vlsn`.
    #[must_use]
    pub fn gte_lsn(&self, vlsn: Vlsn) -> Option<Lsn> {
        match self {
            Self::Real(b) => b.gte_lsn(vlsn),
            Self::Ghost(g) => (vlsn <= g.first()).then_some(g.bounding_lsn()),
        }
    }

    /// Serialize to the persisted record form.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Real(b) => b.to_bytes(),
            Self::Ghost(g) => g.to_bytes(),
        }
    }

    /// Deserialize a persisted record.
    ///
    /// `key` is the store key the record was read under; a mismatch against
    /// the record's first VLSN is an integrity failure.
    pub fn from_bytes(key: Vlsn, bytes: &[u8]) -> Result<Self, BucketIntegrityError> {
        if bytes.len() < 1 + 8 + CHECKSUM_SIZE {
            return Err(BucketIntegrityError::Truncated);
        }
        let stored = u32::from_be_bytes([
            bytes[bytes.len() - 4],
            bytes[bytes.len() - 3],
            bytes[bytes.len() - 2],
            bytes[bytes.len() - 1],
        ]);
        let computed = crc32fast::hash(&bytes[..bytes.len() - CHECKSUM_SIZE]);
        if stored != computed {
            return Err(BucketIntegrityError::ChecksumMismatch {
                expected: stored,
                actual: computed,
            });
        }
        let body = &bytes[..bytes.len() - CHECKSUM_SIZE];

        let first = Vlsn::new(u64::from_be_bytes(read8(body, 1)?));
        if first != key {
            return Err(BucketIntegrityError::KeyMismatch { key, first });
        }

        match body[0] {
            TAG_BUCKET => {
                if body.len() < 33 {
                    return Err(BucketIntegrityError::Truncated);
                }
                let last = Vlsn::new(u64::from_be_bytes(read8(body, 9)?));
                let file64 = u64::from_be_bytes(read8(body, 17)?);
                let file = u32::try_from(file64)
                    .map_err(|_| BucketIntegrityError::BadFileNumber(file64))?;
                let stride = u32::from_be_bytes([body[25], body[26], body[27], body[28]]);
                let n = u32::from_be_bytes([body[29], body[30], body[31], body[32]]) as usize;
                if body.len() != 33 + n * 12 {
                    return Err(BucketIntegrityError::Truncated);
                }
                if first > last {
                    return Err(BucketIntegrityError::InvertedRange { first, last });
                }
                let mut entries = Vec::with_capacity(n);
                for i in 0..n {
                    let at = 33 + i * 12;
                    let vlsn = Vlsn::new(u64::from_be_bytes(read8(body, at)?));
                    let offset =
                        u32::from_be_bytes([body[at + 8], body[at + 9], body[at + 10], body[at + 11]]);
                    if let Some(&(prev, prev_off)) = entries.last()
                        && (vlsn <= prev || offset <= prev_off)
                    {
                        return Err(BucketIntegrityError::UnorderedEntries { at: vlsn });
                    }
                    if vlsn < first || vlsn > last {
                        return Err(BucketIntegrityError::EntryOutOfRange { at: vlsn });
                    }
                    entries.push((vlsn, offset));
                }
                let last_retained = entries.last().map_or(Vlsn::NULL, |&(v, _)| v);
                Ok(Self::Real(Bucket {
                    first,
                    last,
                    file,
                    stride,
                    entries,
                    last_retained,
                }))
            }
            TAG_GHOST => {
                if body.len() != 25 {
                    return Err(BucketIntegrityError::Truncated);
                }
                let covering = Lsn::from_packed(u64::from_be_bytes(read8(body, 9)?));
                let bounding = Lsn::from_packed(u64::from_be_bytes(read8(body, 17)?));
                Ok(Self::Ghost(GhostBucket::new(first, covering, bounding)))
            }
            tag => Err(BucketIntegrityError::UnknownTag(tag)),
        }
    }
}

/// Integrity failures while deserializing a persisted bucket record.
///
/// These invalidate the environment; the on-disk index cannot be trusted.
#[derive(Debug)]
pub enum BucketIntegrityError {
    /// Record shorter than its declared layout.
    Truncated,
    /// Unknown record tag byte.
    UnknownTag(u8),
    /// Checksum mismatch.
    ChecksumMismatch { expected: u32, actual: u32 },
    /// The record's first VLSN does not match the key it was stored under.
    KeyMismatch { key: Vlsn, first: Vlsn },
    /// File number does not fit the 32-bit LSN component.
    BadFileNumber(u64),
    /// `first > last`.
    InvertedRange { first: Vlsn, last: Vlsn },
    /// Retained entries are not strictly increasing.
    UnorderedEntries { at: Vlsn },
    /// A retained entry lies outside `[first, last]`.
    EntryOutOfRange { at: Vlsn },
}

impl std::fmt::Display for BucketIntegrityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated => write!(f, "truncated bucket record"),
            Self::UnknownTag(t) => write!(f, "unknown bucket record tag: 0x{t:02x}"),
            Self::ChecksumMismatch { expected, actual } => write!(
                f,
                "bucket checksum mismatch: expected 0x{expected:08x}, got 0x{actual:08x}"
            ),
            Self::KeyMismatch { key, first } => {
                write!(f, "bucket stored under {key} but begins at {first}")
            }
            Self::BadFileNumber(n) => write!(f, "bucket file number out of range: {n}"),
            Self::InvertedRange { first, last } => {
                write!(f, "bucket range inverted: {first} > {last}")
            }
            Self::UnorderedEntries { at } => write!(f, "bucket entries unordered at {at}"),
            Self::EntryOutOfRange { at } => write!(f, "bucket entry out of range at {at}"),
        }
    }
}

impl std::error::Error for BucketIntegrityError {}

fn read8(bytes: &[u8], at: usize) -> Result<[u8; 8], BucketIntegrityError> {
    let mut out = [0u8; 8];
    let slice = bytes
        .get(at..at + 8)
        .ok_or(BucketIntegrityError::Truncated)?;
    out.copy_from_slice(slice);
    Ok(out)
}
