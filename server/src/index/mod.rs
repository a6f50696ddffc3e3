//! The replication log index.
//!
//! Maps virtual log sequence numbers (VLSNs) to physical log positions and
//! maintains the contiguous range of the replication stream present on this
//! node. The index is a two-tier structure:
//!
//! - an in-memory [`Tracker`] holding the newest buckets and the current
//!   range, mutated by log writers,
//! - a persistent [`store::BucketDb`] of flushed buckets, pruned from both
//!   ends as the log is cleaned or the tail is rolled back.
//!
//! Feeders block on the [`latch::AwaitLatch`] for VLSNs that have not been
//! logged yet and read hot entries from the [`item_cache::LogItemCache`].
//! Log file deletion is fenced through the [`protect::DeletionCoordinator`].

pub mod bucket;
pub mod item_cache;
pub mod latch;
pub mod protect;
pub mod range;
pub mod store;
pub mod tracker;
pub mod vlsn_index;

pub use bucket::{Bucket, BucketPolicy, GhostBucket, IndexBucket};
pub use range::{Range, RangeCell};
pub use store::{BucketDb, Cursor, KvStore, MemKv, StoreError, StoreTxn};
pub use tracker::Tracker;
pub use vlsn_index::{Durability, IndexConfig, IndexError, NodeRole, VlsnIndex};
