//! File deletion protection.
//!
//! The log cleaner may only delete a log file once nothing references it: the
//! index must no longer map any VLSN into it, no syncup is scanning it, and
//! no backup client is mid-transfer. Each interested party registers a lower
//! bound with the [`DeletionCoordinator`]; a file is deletable only when every
//! registered bound exceeds its file number.
//!
//! Bounds are RAII handles. The index's own bound advances as the range head
//! is truncated; a [`ProtectedFileRange`] is simply a bound that never
//! advances, pinning the files below it until dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Coordinates file-deletion lower bounds across holders.
#[derive(Debug, Default)]
pub struct DeletionCoordinator {
    state: Mutex<CoordinatorState>,
}

#[derive(Debug, Default)]
struct CoordinatorState {
    next_id: u64,
    bounds: HashMap<u64, NamedBound>,
}

#[derive(Debug)]
struct NamedBound {
    owner: String,
    bound: u32,
}

impl DeletionCoordinator {
    /// Create a coordinator with no registered bounds.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a lower bound on behalf of `owner`: files numbered below
    /// `bound` are deletable as far as this holder is concerned.
    #[must_use]
    pub fn register(self: &Arc<Self>, owner: &str, bound: u32) -> FileBound {
        let id = {
            let Ok(mut state) = self.state.lock() else {
                // A poisoned registry cannot grant protection; fail closed by
                // handing out a handle that protects everything.
                return FileBound {
                    coordinator: Arc::clone(self),
                    id: u64::MAX,
                };
            };
            let id = state.next_id;
            state.next_id += 1;
            state.bounds.insert(
                id,
                NamedBound {
                    owner: owner.to_string(),
                    bound,
                },
            );
            tracing::debug!(owner, bound, "registered file-deletion bound");
            id
        };
        FileBound {
            coordinator: Arc::clone(self),
            id,
        }
    }

    /// Whether `file` may be deleted: every registered bound must exceed it.
    #[must_use]
    pub fn deletable(&self, file: u32) -> bool {
        let Ok(state) = self.state.lock() else {
            return false;
        };
        state.bounds.values().all(|b| b.bound > file)
    }

    /// The most restrictive registered bound, if any holder exists.
    #[must_use]
    pub fn lowest_bound(&self) -> Option<u32> {
        let Ok(state) = self.state.lock() else {
            return Some(0);
        };
        state.bounds.values().map(|b| b.bound).min()
    }

    fn advance(&self, id: u64, bound: u32) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        let Some(entry) = state.bounds.get_mut(&id) else {
            return false;
        };
        if bound < entry.bound {
            tracing::warn!(
                owner = %entry.owner,
                current = entry.bound,
                requested = bound,
                "refusing to retract file-deletion bound"
            );
            return false;
        }
        entry.bound = bound;
        true
    }

    fn bound_of(&self, id: u64) -> u32 {
        let Ok(state) = self.state.lock() else {
            return 0;
        };
        state.bounds.get(&id).map_or(0, |b| b.bound)
    }

    fn unregister(&self, id: u64) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if let Some(removed) = state.bounds.remove(&id) {
            tracing::debug!(owner = %removed.owner, "released file-deletion bound");
        }
    }
}

/// A registered lower bound. Dropping the handle releases it.
#[derive(Debug)]
pub struct FileBound {
    coordinator: Arc<DeletionCoordinator>,
    id: u64,
}

impl FileBound {
    /// Advance this bound: files below `bound` become deletable for this
    /// holder. Retraction is refused.
    pub fn advance(&self, bound: u32) -> bool {
        self.coordinator.advance(self.id, bound)
    }

    /// The current bound value.
    #[must_use]
    pub fn current(&self) -> u32 {
        self.coordinator.bound_of(self.id)
    }
}

impl Drop for FileBound {
    fn drop(&mut self) {
        self.coordinator.unregister(self.id);
    }
}

/// A frozen bound pinning every file at or above its registration point for
/// the holder's lifetime. Used by syncup and backup clients.
pub type ProtectedFileRange = FileBound;
