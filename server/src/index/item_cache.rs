//! Bounded cache of the most recent log entries, keyed by VLSN.
//!
//! Feeders streaming near the head of the log hit this cache and skip the
//! bucket lookup and log fetch entirely. The cache is a best-effort
//! optimization: get and put never block, and a contended slot simply counts
//! as a miss.

use std::sync::{Arc, Mutex};

use crate::types::{LogEntry, Vlsn};

/// Fixed-capacity associative cache of recent entries.
///
/// Slots are addressed by `vlsn % capacity`, so the cache naturally holds a
/// window of the newest entries while the stream advances.
#[derive(Debug)]
pub struct LogItemCache {
    slots: Vec<Mutex<Option<Arc<LogEntry>>>>,
}

impl LogItemCache {
    /// Create a cache with `capacity` slots. A zero capacity disables the
    /// cache; every lookup misses.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || Mutex::new(None));
        Self { slots }
    }

    /// Number of slots.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Fetch the entry cached for `vlsn`, without blocking.
    #[must_use]
    pub fn get(&self, vlsn: Vlsn) -> Option<Arc<LogEntry>> {
        let slot = self.slot(vlsn)?;
        let guard = slot.try_lock().ok()?;
        guard.as_ref().filter(|e| e.vlsn == vlsn).map(Arc::clone)
    }

    /// Cache an entry, without blocking. An older entry in the slot is
    /// replaced; a newer one is kept.
    pub fn put(&self, entry: Arc<LogEntry>) {
        let Some(slot) = self.slot(entry.vlsn) else {
            return;
        };
        let Ok(mut guard) = slot.try_lock() else {
            return;
        };
        if guard.as_ref().is_none_or(|held| held.vlsn <= entry.vlsn) {
            *guard = Some(entry);
        }
    }

    /// Drop every cached entry matching `predicate`.
    pub fn clear<F: Fn(&LogEntry) -> bool>(&self, predicate: F) {
        for slot in &self.slots {
            let Ok(mut guard) = slot.lock() else {
                continue;
            };
            if guard.as_ref().is_some_and(|e| predicate(e)) {
                *guard = None;
            }
        }
    }

    fn slot(&self, vlsn: Vlsn) -> Option<&Mutex<Option<Arc<LogEntry>>>> {
        if self.slots.is_empty() {
            return None;
        }
        #[allow(clippy::cast_possible_truncation)] // modulo capacity fits usize
        let idx = (vlsn.sequence() % self.slots.len() as u64) as usize;
        self.slots.get(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EntryType;

    fn entry(vlsn: u64) -> Arc<LogEntry> {
        Arc::new(LogEntry::new(
            EntryType::Insert,
            1,
            Vlsn::new(vlsn),
            vec![vlsn as u8],
        ))
    }

    #[test]
    fn test_get_put() {
        let cache = LogItemCache::new(8);
        assert!(cache.get(Vlsn::new(3)).is_none());
        cache.put(entry(3));
        assert_eq!(cache.get(Vlsn::new(3)).unwrap().vlsn, Vlsn::new(3));
    }

    #[test]
    fn test_newer_entry_wins_slot() {
        let cache = LogItemCache::new(8);
        cache.put(entry(3));
        cache.put(entry(11)); // same slot, newer
        assert!(cache.get(Vlsn::new(3)).is_none());
        assert_eq!(cache.get(Vlsn::new(11)).unwrap().vlsn, Vlsn::new(11));
        cache.put(entry(3)); // older entry does not displace a newer one
        assert_eq!(cache.get(Vlsn::new(11)).unwrap().vlsn, Vlsn::new(11));
    }

    #[test]
    fn test_clear_predicate() {
        let cache = LogItemCache::new(8);
        for v in 1..=8 {
            cache.put(entry(v));
        }
        cache.clear(|e| e.vlsn >= Vlsn::new(5));
        assert!(cache.get(Vlsn::new(4)).is_some());
        assert!(cache.get(Vlsn::new(5)).is_none());
        assert!(cache.get(Vlsn::new(8)).is_none());
    }

    #[test]
    fn test_zero_capacity_is_inert() {
        let cache = LogItemCache::new(0);
        cache.put(entry(1));
        assert!(cache.get(Vlsn::new(1)).is_none());
    }
}
