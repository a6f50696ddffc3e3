//! Shared constructors for tests.

use crate::index::store::MemKv;
use crate::index::tracker::Tracker;
use crate::index::vlsn_index::{IndexConfig, NodeRole, VlsnIndex};
use crate::index::Range;
use crate::types::Vlsn;

/// A tracker with no cached buckets, as a clean open would produce.
#[must_use]
pub fn empty_tracker(config: IndexConfig) -> Tracker {
    Tracker::new(config.bucket_policy(), Range::EMPTY, Vlsn::NULL)
}

/// Open a fresh master-side index over an in-memory store.
#[must_use]
#[allow(clippy::missing_panics_doc)]
pub fn open_master(config: IndexConfig) -> VlsnIndex<MemKv> {
    #[allow(clippy::expect_used)]
    VlsnIndex::open(
        MemKv::new(),
        config,
        NodeRole::Master,
        empty_tracker(config),
    )
    .expect("open in-memory index")
}
