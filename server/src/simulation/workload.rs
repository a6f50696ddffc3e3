//! Workload generator for deterministic index simulation.
//!
//! Generates a random but reproducible stream of index operations: mostly
//! sequential puts with occasional VLSN skips, laggard arrivals, commit
//! markers, file rolls, flushes, and truncations from both ends. A shadow
//! log of every mapping ever issued lets the driver supply truthful
//! `prev_lsn` values for tail truncations.

// Simulation code legitimately needs cloning for test data
#![allow(clippy::disallowed_methods)]

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::types::{EntryType, Lsn, Vlsn};

/// Configuration for workload generation.
#[derive(Debug, Clone, Copy)]
pub struct WorkloadConfig {
    /// Probability a put is a commit marker (0.0 - 1.0).
    pub commit_rate: f64,
    /// Probability a put skips a VLSN, leaving a laggard to arrive later.
    pub skip_rate: f64,
    /// Probability the log rolls to a new file before a put.
    pub file_roll_rate: f64,
    /// Probability of a flush between puts.
    pub flush_rate: f64,
    /// Probability of a head truncation attempt between puts.
    pub truncate_head_rate: f64,
    /// Probability of a tail truncation between puts.
    pub truncate_tail_rate: f64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            commit_rate: 0.2,
            skip_rate: 0.05,
            file_roll_rate: 0.03,
            flush_rate: 0.05,
            truncate_head_rate: 0.02,
            truncate_tail_rate: 0.01,
        }
    }
}

/// One step of the simulated workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Record a mapping.
    Put {
        /// VLSN of the entry.
        vlsn: Vlsn,
        /// Position of the entry.
        lsn: Lsn,
        /// Entry type.
        kind: EntryType,
    },
    /// Flush the index to its store.
    Flush,
    /// Try a head truncation at the given point.
    TruncateHead {
        /// Deletion point.
        delete_end: Vlsn,
        /// File the cleaner wants gone.
        delete_file: u32,
    },
    /// Truncate the tail back to before `delete_start`.
    TruncateTail {
        /// Deletion start.
        delete_start: Vlsn,
        /// Position of the entry just below.
        prev_lsn: Lsn,
    },
}

/// Generator of reproducible workload steps.
#[derive(Debug)]
pub struct WorkloadGenerator {
    config: WorkloadConfig,
    rng: StdRng,
    /// Next VLSN to issue.
    next_vlsn: u64,
    /// VLSNs skipped earlier, waiting to arrive as laggards.
    pending: Vec<u64>,
    /// Current log file and write offset.
    file: u32,
    offset: u32,
    /// Every mapping ever issued, as (vlsn, lsn, kind).
    shadow: Vec<(Vlsn, Lsn, EntryType)>,
}

impl WorkloadGenerator {
    /// Create a generator from a seed.
    #[must_use]
    pub fn new(seed: u64, config: WorkloadConfig) -> Self {
        Self {
            config,
            rng: StdRng::seed_from_u64(seed),
            next_vlsn: 1,
            pending: Vec::new(),
            file: 1,
            offset: 64,
            shadow: Vec::new(),
        }
    }

    /// The shadow log of every mapping issued so far.
    #[must_use]
    pub fn shadow(&self) -> &[(Vlsn, Lsn, EntryType)] {
        &self.shadow
    }

    /// Produce the next step.
    pub fn next_step(&mut self) -> Step {
        if self.rng.random::<f64>() < self.config.flush_rate {
            return Step::Flush;
        }
        if self.rng.random::<f64>() < self.config.truncate_head_rate
            && let Some(step) = self.head_truncation()
        {
            return step;
        }
        if self.rng.random::<f64>() < self.config.truncate_tail_rate
            && let Some(step) = self.tail_truncation()
        {
            return step;
        }
        self.put_step()
    }

    fn put_step(&mut self) -> Step {
        if self.rng.random::<f64>() < self.config.file_roll_rate {
            self.file += 1;
            self.offset = 64;
        }

        // Laggards arrive before brand-new skips pile up too high.
        let vlsn = if !self.pending.is_empty() && self.rng.random::<f64>() < 0.5 {
            self.pending.swap_remove(self.rng.random_range(0..self.pending.len()))
        } else {
            let mut vlsn = self.next_vlsn;
            if self.rng.random::<f64>() < self.config.skip_rate {
                self.pending.push(vlsn);
                vlsn += 1;
                self.next_vlsn = vlsn;
            }
            self.next_vlsn += 1;
            vlsn
        };

        let kind = if self.rng.random::<f64>() < self.config.commit_rate {
            EntryType::TxnCommit
        } else {
            EntryType::Insert
        };
        let lsn = Lsn::new(self.file, self.offset);
        self.offset += self.rng.random_range(32..256);

        let step = Step::Put { vlsn: Vlsn::new(vlsn), lsn, kind };
        self.shadow.push((Vlsn::new(vlsn), lsn, kind));
        step
    }

    fn head_truncation(&mut self) -> Option<Step> {
        // The cleaner always deletes whole files: pick a closed file and cut
        // at the last VLSN mapped at or below it.
        let mut files: Vec<u32> = self
            .shadow
            .iter()
            .map(|(_, l, _)| l.file())
            .filter(|&f| f < self.file)
            .collect();
        files.sort_unstable();
        files.dedup();
        if files.is_empty() {
            return None;
        }
        let delete_file = files[self.rng.random_range(0..files.len())];
        let delete_end = self
            .shadow
            .iter()
            .filter(|(_, l, _)| l.file() <= delete_file)
            .map(|(v, _, _)| *v)
            .max()?;
        Some(Step::TruncateHead {
            delete_end,
            delete_file,
        })
    }

    fn tail_truncation(&mut self) -> Option<Step> {
        // The tail cut needs the exact position of the entry just below it.
        let issued_last = self.next_vlsn.saturating_sub(1);
        if issued_last < 3 {
            return None;
        }
        let low = issued_last.saturating_sub(5).max(2);
        let delete_start = self.rng.random_range(low..=issued_last);
        let prev = delete_start - 1;
        let prev_lsn = self
            .shadow
            .iter()
            .find(|(v, _, _)| v.sequence() == prev)
            .map(|(_, l, _)| *l)?;
        // Rewind the generator so the stream resumes contiguously.
        self.next_vlsn = delete_start;
        self.pending.retain(|&v| v < delete_start);
        self.shadow.retain(|(v, _, _)| v.sequence() < delete_start);
        Some(Step::TruncateTail {
            delete_start: Vlsn::new(delete_start),
            prev_lsn,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_stream() {
        let mut a = WorkloadGenerator::new(7, WorkloadConfig::default());
        let mut b = WorkloadGenerator::new(7, WorkloadConfig::default());
        for _ in 0..200 {
            assert_eq!(a.next_step(), b.next_step());
        }
    }

    #[test]
    fn test_different_seeds_diverge() {
        let mut a = WorkloadGenerator::new(1, WorkloadConfig::default());
        let mut b = WorkloadGenerator::new(2, WorkloadConfig::default());
        let diverged = (0..200).any(|_| a.next_step() != b.next_step());
        assert!(diverged);
    }

    #[test]
    fn test_puts_cover_contiguous_vlsns() {
        let config = WorkloadConfig {
            truncate_head_rate: 0.0,
            truncate_tail_rate: 0.0,
            flush_rate: 0.0,
            ..WorkloadConfig::default()
        };
        let mut generator = WorkloadGenerator::new(42, config);
        let mut seen = std::collections::BTreeSet::new();
        for _ in 0..500 {
            if let Step::Put { vlsn, .. } = generator.next_step() {
                assert!(seen.insert(vlsn), "duplicate put for {vlsn}");
            }
        }
        // Pending laggards account for any holes in the issued prefix.
        let issued: Vec<u64> = seen.iter().map(|v| v.sequence()).collect();
        let max = *issued.last().unwrap();
        let missing: Vec<u64> = (1..=max)
            .filter(|v| !seen.contains(&Vlsn::new(*v)))
            .collect();
        assert!(
            missing
                .iter()
                .all(|v| generator.pending.contains(v)),
            "missing VLSNs are not pending laggards: {missing:?}"
        );
    }
}
