//! Single-target gate for readers waiting on a future VLSN.
//!
//! A feeder that has consumed the stream up to `range.last` parks here until
//! the writer observes the next VLSN. The latch is single-shot: once released
//! or terminated it stays that way, and the index installs a fresh latch for
//! the next wait.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::types::Vlsn;

/// How a wait on the latch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchWait {
    /// The target VLSN (or a later one) arrived.
    Released,
    /// The deadline passed first.
    TimedOut,
    /// The latch was terminated by shutdown or a role change.
    Poisoned,
}

#[derive(Debug, Clone, Copy)]
struct LatchState {
    released: bool,
    poisoned: bool,
}

/// A single-shot count-down gate parameterized by a target VLSN.
#[derive(Debug)]
pub struct AwaitLatch {
    target: Vlsn,
    state: Mutex<LatchState>,
    cond: Condvar,
}

impl AwaitLatch {
    /// Create a latch waiting for `target`.
    #[must_use]
    pub fn new(target: Vlsn) -> Self {
        Self {
            target,
            state: Mutex::new(LatchState {
                released: false,
                poisoned: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// The VLSN this latch waits for.
    #[must_use]
    pub const fn target(&self) -> Vlsn {
        self.target
    }

    /// Release the latch iff `arrived` reaches the target.
    ///
    /// Returns whether the latch is now (or already was) released.
    pub fn count_down(&self, arrived: Vlsn) -> bool {
        if arrived < self.target {
            return false;
        }
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        if !state.released {
            state.released = true;
            self.cond.notify_all();
        }
        true
    }

    /// Release unconditionally and mark the latch poisoned, so waiters can
    /// tell shutdown apart from an ordinary wake.
    pub fn terminate(&self) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        state.released = true;
        state.poisoned = true;
        self.cond.notify_all();
    }

    /// Block until release, poisoning, or the timeout.
    #[must_use]
    pub fn wait(&self, timeout: Duration) -> LatchWait {
        let deadline = Instant::now() + timeout;
        let Ok(mut state) = self.state.lock() else {
            return LatchWait::Poisoned;
        };
        loop {
            if state.poisoned {
                return LatchWait::Poisoned;
            }
            if state.released {
                return LatchWait::Released;
            }
            let now = Instant::now();
            if now >= deadline {
                return LatchWait::TimedOut;
            }
            let (guard, result) = match self.cond.wait_timeout(state, deadline - now) {
                Ok(pair) => pair,
                Err(_) => return LatchWait::Poisoned,
            };
            state = guard;
            if result.timed_out() && !state.released {
                return LatchWait::TimedOut;
            }
        }
    }
}
