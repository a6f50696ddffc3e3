#![cfg_attr(test, allow(clippy::disallowed_methods))]
// Forbid unwrap() in production code to prevent panics from corrupt data.
// Test code is allowed to use unwrap() for convenience.
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
// Life of a mapping:
// 1. The log writer appends an entry and gets a (vlsn, lsn) pair
// 2. index.put records the mapping in the tracker's current bucket
// 3. The range advances; waiters parked on the VLSN wake up
// 4. The checkpointer flushes closed buckets to the backing store
// 5. The cleaner truncates old mappings from the head as files age out
// 6. Replica syncup truncates from the tail after a matchpoint search
//
// System components:
//  - VLSN index (tracker + buckets + persistent backing)
//  - File-deletion coordination between index, cleaner, and backups
//  - Wire protocol for syncup and log file transfer
//  - Log file feeder with disconnect leases

pub mod config;
pub mod index;
pub mod replication;
pub mod simulation;
#[cfg(test)]
mod testing;
pub mod types;

pub use index::{Durability, IndexConfig, NodeRole, VlsnIndex};
