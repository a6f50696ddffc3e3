//! Virtual log sequence numbers.
//!
//! A VLSN identifies a record's position in the replication stream. VLSNs are
//! assigned by the master, start at 1, and are strictly contiguous: every
//! record in the stream has exactly one VLSN and no VLSN is skipped.
//!
//! # Sentinels
//!
//! - [`Vlsn::NULL`] means "no VLSN". It is also the on-disk and wire encoding
//!   of an absent value.
//! - [`Vlsn::UNINITIALIZED`] is the durable-txn VLSN of a freshly created
//!   store, before any quorum acknowledgment exists.
//! - [`Vlsn::INVALID`] marks an in-memory field that has not been assigned
//!   yet. It is never serialized.
//!
//! Arithmetic (`next`/`prev`) is only defined on real sequence values.

use std::fmt;

/// A virtual log sequence number.
///
/// # Invariants
///
/// - Real values are in `1..=MAX_SEQUENCE`.
/// - Ordering is the ordering of the underlying sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Vlsn(u64);

impl Vlsn {
    /// "No VLSN". Also the serialized encoding of an absent value.
    pub const NULL: Self = Self(0);

    /// The first VLSN ever assigned in a replication group.
    pub const FIRST: Self = Self(1);

    /// Durable-txn VLSN of a newly created store.
    pub const UNINITIALIZED: Self = Self(u64::MAX);

    /// Marker for an unassigned in-memory field. Never serialized.
    pub const INVALID: Self = Self(u64::MAX - 1);

    /// Largest assignable sequence value.
    pub const MAX_SEQUENCE: u64 = u64::MAX - 2;

    /// Create a VLSN from a raw sequence number.
    ///
    /// A sequence of 0 yields [`Vlsn::NULL`].
    #[must_use]
    pub const fn new(sequence: u64) -> Self {
        Self(sequence)
    }

    /// Get the raw sequence number.
    #[must_use]
    pub const fn sequence(self) -> u64 {
        self.0
    }

    /// Whether this is the NULL sentinel.
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == Self::NULL.0
    }

    /// Whether this is a real, assignable sequence value (not a sentinel).
    #[must_use]
    pub const fn is_real(self) -> bool {
        self.0 >= 1 && self.0 <= Self::MAX_SEQUENCE
    }

    /// The VLSN immediately after this one.
    ///
    /// Only defined on real values.
    #[must_use]
    pub fn next(self) -> Self {
        debug_assert!(self.is_real(), "next() on sentinel VLSN");
        Self(self.0 + 1)
    }

    /// The VLSN immediately before this one.
    ///
    /// `prev(FIRST)` is NULL. Only defined on real values.
    #[must_use]
    pub fn prev(self) -> Self {
        debug_assert!(self.is_real(), "prev() on sentinel VLSN");
        Self(self.0 - 1)
    }

    /// Pick the larger of two VLSNs, treating NULL as smaller than anything.
    #[must_use]
    pub fn max_real(self, other: Self) -> Self {
        if self.is_null() {
            other
        } else if other.is_null() {
            self
        } else {
            self.max(other)
        }
    }

    /// Pick the smaller of two VLSNs, treating NULL as larger than anything.
    #[must_use]
    pub fn min_real(self, other: Self) -> Self {
        if self.is_null() {
            other
        } else if other.is_null() {
            self
        } else {
            self.min(other)
        }
    }
}

impl fmt::Display for Vlsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::NULL => write!(f, "v:null"),
            Self::UNINITIALIZED => write!(f, "v:uninit"),
            Self::INVALID => write!(f, "v:invalid"),
            Self(seq) => write!(f, "v:{seq}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinels_are_distinct() {
        assert_ne!(Vlsn::NULL, Vlsn::UNINITIALIZED);
        assert_ne!(Vlsn::NULL, Vlsn::INVALID);
        assert_ne!(Vlsn::INVALID, Vlsn::UNINITIALIZED);
    }

    #[test]
    fn test_real_values() {
        assert!(!Vlsn::NULL.is_real());
        assert!(!Vlsn::INVALID.is_real());
        assert!(!Vlsn::UNINITIALIZED.is_real());
        assert!(Vlsn::FIRST.is_real());
        assert!(Vlsn::new(12345).is_real());
    }

    #[test]
    fn test_next_prev() {
        let v = Vlsn::new(10);
        assert_eq!(v.next(), Vlsn::new(11));
        assert_eq!(v.prev(), Vlsn::new(9));
        assert_eq!(Vlsn::FIRST.prev(), Vlsn::NULL);
    }

    #[test]
    fn test_max_min_real() {
        let a = Vlsn::new(3);
        let b = Vlsn::new(7);
        assert_eq!(a.max_real(b), b);
        assert_eq!(a.min_real(b), a);
        assert_eq!(Vlsn::NULL.max_real(a), a);
        assert_eq!(a.max_real(Vlsn::NULL), a);
        assert_eq!(Vlsn::NULL.min_real(a), a);
        assert_eq!(Vlsn::NULL.max_real(Vlsn::NULL), Vlsn::NULL);
    }

    #[test]
    fn test_ordering() {
        assert!(Vlsn::new(1) < Vlsn::new(2));
        assert!(Vlsn::NULL < Vlsn::FIRST);
    }

    #[test]
    fn test_display() {
        assert_eq!(Vlsn::new(42).to_string(), "v:42");
        assert_eq!(Vlsn::NULL.to_string(), "v:null");
    }
}
