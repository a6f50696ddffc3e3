//! Invariant checks for the simulated index.
//!
//! After every workload step the checker re-derives what must hold from the
//! index's own public surface:
//!
//! - contiguity: every VLSN in the range resolves to a bucket from both
//!   directions,
//! - endpoint coverage: the range start is anchored and the range end keeps
//!   an exact mapping,
//! - monotone positions: exact lookups never decrease as VLSNs grow,
//! - disjointness: walking the buckets front to back never overlaps.

use crate::index::store::KvStore;
use crate::index::vlsn_index::{IndexError, VlsnIndex};
use crate::types::{Lsn, Vlsn};

/// A broken invariant, with enough context to replay the failure.
#[derive(Debug)]
pub struct InvariantFailure {
    /// Which invariant broke.
    pub what: &'static str,
    /// The VLSN the check was probing.
    pub at: Vlsn,
}

impl std::fmt::Display for InvariantFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invariant {} failed at {}", self.what, self.at)
    }
}

/// Check every invariant over the current index state.
pub fn check<S: KvStore>(index: &VlsnIndex<S>) -> Result<(), Box<InvariantFailure>> {
    let range = index.range();
    if range.is_empty() {
        return Ok(());
    }

    let mut prev_lsn = Lsn::NULL;
    let mut prev_bucket_last = Vlsn::NULL;
    let mut walk = range.first;

    for seq in range.first.sequence()..=range.last.sequence() {
        let vlsn = Vlsn::new(seq);

        // Contiguity from both lookup directions.
        let gte = lookup(index.gte_bucket(vlsn), "gte-lookup", vlsn)?;
        let Some(gte) = gte else {
            return Err(fail("gte-coverage", vlsn));
        };
        if gte.precedes(vlsn) {
            return Err(fail("gte-position", vlsn));
        }
        let lte = lookup(index.lte_bucket(vlsn), "lte-lookup", vlsn)?;
        let Some(lte) = lte else {
            return Err(fail("lte-coverage", vlsn));
        };
        if lte.follows(vlsn) {
            return Err(fail("lte-position", vlsn));
        }

        // Monotone positions across every retained mapping.
        if let Some(lsn) = gte.lsn(vlsn) {
            if !prev_lsn.is_null() && lsn <= prev_lsn {
                return Err(fail("monotone-lsn", vlsn));
            }
            prev_lsn = lsn;
        }

        // Disjointness along the bucket walk.
        if vlsn == walk {
            if !prev_bucket_last.is_null() && gte.first() <= prev_bucket_last {
                return Err(fail("bucket-overlap", vlsn));
            }
            prev_bucket_last = gte.last();
            walk = if gte.last() >= range.last {
                Vlsn::NULL
            } else {
                gte.last().next()
            };
        }
    }

    // The range end always keeps an exact mapping.
    let end = lookup(index.lte_bucket(range.last), "end-lookup", range.last)?;
    let exact = end.is_some_and(|b| b.lsn(range.last).is_some());
    if !exact {
        return Err(fail("end-mapping", range.last));
    }
    Ok(())
}

fn lookup<T>(
    result: Result<T, IndexError>,
    what: &'static str,
    at: Vlsn,
) -> Result<T, Box<InvariantFailure>> {
    result.map_err(|_| fail(what, at))
}

fn fail(what: &'static str, at: Vlsn) -> Box<InvariantFailure> {
    Box::new(InvariantFailure { what, at })
}
