//! Deterministic simulation of the index under a randomized workload.
//!
//! A seeded [`workload::WorkloadGenerator`] drives an index through puts,
//! flushes, and truncations; [`invariants::check`] re-verifies the index
//! contract after every step. Failures reproduce from the seed alone.

pub mod invariants;
pub mod workload;

pub use invariants::InvariantFailure;
pub use workload::{Step, WorkloadConfig, WorkloadGenerator};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::vlsn_index::{Durability, IndexConfig};
    use crate::testing::open_master;

    fn run_seed(seed: u64, steps: usize) {
        let config = IndexConfig {
            stride: 3,
            max_mappings: 8,
            min_index_size: 4,
            ..IndexConfig::default()
        };
        let index = open_master(config);
        let mut generator = WorkloadGenerator::new(seed, WorkloadConfig::default());

        for step_num in 0..steps {
            let step = generator.next_step();
            match step {
                Step::Put { vlsn, lsn, kind } => {
                    index.put(vlsn, lsn, kind, None).unwrap();
                }
                Step::Flush => index.flush_to_store(Durability::NoSync).unwrap(),
                Step::TruncateHead {
                    delete_end,
                    delete_file,
                } => {
                    // Refusals are legitimate; the preconditions decide.
                    let _ = index.try_truncate_from_head(delete_end, delete_file).unwrap();
                }
                Step::TruncateTail {
                    delete_start,
                    prev_lsn,
                } => {
                    index.truncate_from_tail(delete_start, prev_lsn).unwrap();
                }
            }
            if let Err(failure) = invariants::check(&index) {
                panic!("seed {seed} step {step_num} ({step:?}): {failure}");
            }
        }
    }

    #[test]
    fn test_simulated_workload_seed_1() {
        run_seed(1, 400);
    }

    #[test]
    fn test_simulated_workload_seed_42() {
        run_seed(42, 400);
    }

    #[test]
    fn test_simulated_workload_seed_2024() {
        run_seed(2024, 400);
    }
}
