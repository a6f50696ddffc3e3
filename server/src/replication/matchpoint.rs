//! Replica-feeder syncup: matchpoint search and rollback classification.
//!
//! When a replica reconnects, it must find the greatest VLSN where its log
//! byte-matches the feeder's log, then cut its own tail back to that point.
//! The search walks backward over the local syncable entries, asking the
//! remote peer for its entry at each candidate and comparing the serialized
//! bytes.
//!
//! The backward scan reports cleaned-file gaps as a value, not an error: a
//! [`ScanOutcome::Gap`] carries the VLSN where scanning can resume. Falling
//! off the contiguous range means the peers have diverged beyond repair and
//! the node needs a network restore.
//!
//! Once a matchpoint is found, [`classify`] decides between a normal
//! rollback, a hard recovery (log truncation plus re-recovery), a network
//! restore, or refusing the rollback outright when too many durable commits
//! would be lost.

use crate::index::range::Range;
use crate::index::store::KvStore;
use crate::index::vlsn_index::{IndexError, VlsnIndex};
use crate::replication::wire::WireError;
use crate::types::{LogEntry, Lsn, PositionedEntry, Vlsn};

/// Upper bound on candidate hops per search, a guard against a peer that
/// keeps proposing alternates.
const MAX_SEARCH_STEPS: usize = 10_000;

/// A remote peer that can serve entries for matchpoint comparison.
pub trait RemotePeer {
    /// Ask for the peer's entry at `vlsn`.
    fn request_entry(&mut self, vlsn: Vlsn) -> Result<PeerResponse, SyncupError>;

    /// Echo a keep-alive ping.
    fn echo_ping(&mut self) -> Result<(), SyncupError>;
}

/// The peer's answer to an entry request.
#[derive(Debug, Clone)]
pub enum PeerResponse {
    /// The peer's entry at the requested VLSN.
    Entry(LogEntry),
    /// The peer has no entry there.
    NotFound,
    /// The peer proposes an earlier candidate of its own.
    AlternateMatchpoint(LogEntry),
    /// Keep-alive; must be echoed and the request retried.
    Ping,
}

/// Backward scanner over the local log.
pub trait LogScanner {
    /// The local entry at exactly `vlsn`.
    fn entry_at(&mut self, vlsn: Vlsn) -> Result<ScanOutcome, SyncupError>;

    /// The nearest syncable entry strictly before `vlsn`.
    fn prev_syncable(&mut self, before: Vlsn) -> Result<ScanOutcome, SyncupError>;

    /// Statistics for the span `(to, from]`, gathered while scanning back.
    fn scan_stats(&mut self, from: Vlsn, to: Vlsn) -> Result<ScanStats, SyncupError>;
}

/// One step of a backward scan.
#[derive(Debug, Clone)]
pub enum ScanOutcome {
    /// The entry, with its physical position.
    Entry(PositionedEntry),
    /// The scan hit a cleaned-files gap; resume at or below `reposition`.
    Gap {
        /// Highest VLSN below the gap.
        reposition: Vlsn,
    },
    /// The scan fell off the contiguous range.
    OffRange,
}

/// What a backward scan passed over between the stream tail and a
/// matchpoint.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScanStats {
    /// Transaction commits passed.
    pub passed_commits: usize,
    /// Commits known durable (acknowledged by a quorum) passed.
    pub passed_durable_commits: usize,
    /// Whether the span crosses a cleaned-files gap.
    pub crossed_cleaner_gap: bool,
    /// Whether truncating the span would cross a checkpoint end whose
    /// backing files were already deleted.
    pub crossed_checkpoint_with_deleted_files: bool,
}

/// A located matchpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Matchpoint {
    /// The greatest VLSN where both logs byte-match.
    pub vlsn: Vlsn,
    /// Local position of the matching entry.
    pub lsn: Lsn,
    /// Byte offset just past the matching entry, where truncation cuts.
    pub truncation_offset: u64,
}

/// Limits on what hard recovery may discard.
#[derive(Debug, Clone, Copy)]
pub struct RollbackPolicy {
    /// Ceiling on durable commits a hard recovery may discard.
    pub txn_limit: usize,
    /// Forbid discarding any durable commit.
    pub disabled: bool,
}

/// The action syncup must take after the matchpoint search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// Nothing usable on either side; drop the whole local stream.
    RollbackAll,
    /// Truncate the tail back to the matchpoint and resume the stream.
    Rollback(Matchpoint),
    /// Truncate the physical log at the matchpoint and re-run recovery.
    HardRecovery(Matchpoint),
    /// The local log cannot be reconciled; copy files from another node.
    NetworkRestore,
}

/// Find the greatest VLSN where the local and remote logs byte-match.
///
/// Returns `Ok(None)` when the local range is empty and there is nothing to
/// compare. Divergence beyond the contiguous local range surfaces as
/// [`SyncupError::NetworkRestoreRequired`].
pub fn search<P: RemotePeer, L: LogScanner>(
    peer: &mut P,
    scanner: &mut L,
    range: Range,
) -> Result<Option<Matchpoint>, SyncupError> {
    if range.is_empty() {
        return Ok(None);
    }

    let mut candidate = if range.last_sync.is_null() {
        // No syncable entry survived; the bootstrap entry is the last hope.
        Vlsn::FIRST
    } else {
        range.last_sync
    };

    for _ in 0..MAX_SEARCH_STEPS {
        let local = match scanner.entry_at(candidate)? {
            ScanOutcome::Entry(local) => local,
            ScanOutcome::Gap { reposition } => {
                tracing::debug!(%candidate, %reposition, "matchpoint scan crossed cleaned gap");
                candidate = prev_syncable_vlsn(scanner, reposition.next())?
                    .ok_or(SyncupError::NetworkRestoreRequired)?;
                continue;
            }
            ScanOutcome::OffRange => return Err(SyncupError::NetworkRestoreRequired),
        };

        let response = loop {
            match peer.request_entry(candidate)? {
                PeerResponse::Ping => peer.echo_ping()?,
                other => break other,
            }
        };

        match response {
            PeerResponse::Entry(remote) => {
                if local.entry.byte_matches(&remote) {
                    let size = local.entry.serialized_size() as u64;
                    tracing::info!(%candidate, lsn = %local.lsn, "matchpoint found");
                    return Ok(Some(Matchpoint {
                        vlsn: candidate,
                        lsn: local.lsn,
                        truncation_offset: u64::from(local.lsn.offset()) + size,
                    }));
                }
                candidate = prev_syncable_vlsn(scanner, candidate)?
                    .ok_or(SyncupError::NetworkRestoreRequired)?;
            }
            PeerResponse::NotFound => {
                candidate = prev_syncable_vlsn(scanner, candidate)?
                    .ok_or(SyncupError::NetworkRestoreRequired)?;
            }
            PeerResponse::AlternateMatchpoint(remote) => {
                if remote.vlsn >= candidate || !remote.vlsn.is_real() {
                    return Err(SyncupError::NetworkRestoreRequired);
                }
                tracing::debug!(proposed = %remote.vlsn, "peer proposed alternate matchpoint");
                candidate = remote.vlsn;
            }
            PeerResponse::Ping => unreachable!("pings are echoed above"),
        }
    }
    Err(SyncupError::NetworkRestoreRequired)
}

fn prev_syncable_vlsn<L: LogScanner>(
    scanner: &mut L,
    before: Vlsn,
) -> Result<Option<Vlsn>, SyncupError> {
    match scanner.prev_syncable(before)? {
        ScanOutcome::Entry(entry) => Ok(Some(entry.entry.vlsn)),
        ScanOutcome::Gap { reposition } => prev_syncable_vlsn(scanner, reposition.next()),
        ScanOutcome::OffRange => Ok(None),
    }
}

/// Classify the recovery required after a matchpoint search.
///
/// `first_active_lsn` is the lowest physical position recovery still needs;
/// truncating below it cannot be replayed and forces a restore. The restore
/// rows are evaluated before the rollback limit: a node that cannot
/// physically truncate has no use for a limit error.
pub fn classify(
    range: Range,
    matchpoint: Option<Matchpoint>,
    stats: &ScanStats,
    policy: RollbackPolicy,
    first_active_lsn: Lsn,
) -> Result<RecoveryAction, SyncupError> {
    let last_txn_end = range.last_txn_end;

    let Some(matchpoint) = matchpoint else {
        if last_txn_end.is_null() && range.last_sync.is_null() {
            return Ok(RecoveryAction::RollbackAll);
        }
        return Ok(RecoveryAction::NetworkRestore);
    };

    if last_txn_end.is_null() || last_txn_end <= matchpoint.vlsn {
        // No committed work is being discarded.
        return Ok(RecoveryAction::Rollback(matchpoint));
    }

    if stats.crossed_cleaner_gap || stats.crossed_checkpoint_with_deleted_files {
        return Ok(RecoveryAction::NetworkRestore);
    }
    if !first_active_lsn.is_null() && matchpoint.lsn < first_active_lsn {
        return Ok(RecoveryAction::NetworkRestore);
    }
    if policy.disabled && stats.passed_durable_commits > 0 {
        return Err(SyncupError::RollbackProhibited {
            passed: stats.passed_durable_commits,
            limit: 0,
        });
    }
    if stats.passed_durable_commits > policy.txn_limit {
        return Err(SyncupError::RollbackProhibited {
            passed: stats.passed_durable_commits,
            limit: policy.txn_limit,
        });
    }
    Ok(RecoveryAction::HardRecovery(matchpoint))
}

/// Cut the index tail back to `matchpoint` after syncup settled on it.
///
/// The stream must be quiescent. Replaying the feed from the next VLSN
/// restores the replica to the feeder's state.
pub fn rollback_to<S: KvStore>(
    index: &VlsnIndex<S>,
    matchpoint: Matchpoint,
) -> Result<(), IndexError> {
    index.truncate_from_tail(matchpoint.vlsn.next(), matchpoint.lsn)
}

/// Syncup failures.
#[derive(Debug)]
pub enum SyncupError {
    /// The local log cannot be reconciled with the feeder.
    NetworkRestoreRequired,
    /// Hard recovery would discard more durable commits than allowed.
    RollbackProhibited {
        /// Durable commits that would be lost.
        passed: usize,
        /// Configured ceiling.
        limit: usize,
    },
    /// Protocol failure.
    Wire(WireError),
    /// Index failure.
    Index(IndexError),
}

impl std::fmt::Display for SyncupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NetworkRestoreRequired => {
                write!(f, "local log cannot be reconciled; network restore required")
            }
            Self::RollbackProhibited { passed, limit } => write!(
                f,
                "rollback would discard {passed} durable commits (limit {limit})"
            ),
            Self::Wire(e) => write!(f, "syncup protocol failure: {e}"),
            Self::Index(e) => write!(f, "syncup index failure: {e}"),
        }
    }
}

impl std::error::Error for SyncupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Wire(e) => Some(e),
            Self::Index(e) => Some(e),
            _ => None,
        }
    }
}

impl From<WireError> for SyncupError {
    fn from(e: WireError) -> Self {
        Self::Wire(e)
    }
}

impl From<IndexError> for SyncupError {
    fn from(e: IndexError) -> Self {
        Self::Index(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EntryType;
    use std::collections::BTreeMap;

    /// Scanner over an in-memory log, with an optional cleaned gap.
    struct FakeScanner {
        entries: BTreeMap<u64, PositionedEntry>,
        /// VLSNs inside a cleaned-files gap.
        gap: Option<(u64, u64)>,
        lowest: u64,
    }

    impl FakeScanner {
        fn new(entries: Vec<LogEntry>) -> Self {
            let lowest = entries.iter().map(|e| e.vlsn.sequence()).min().unwrap_or(1);
            let entries = entries
                .into_iter()
                .map(|entry| {
                    let seq = entry.vlsn.sequence();
                    #[allow(clippy::cast_possible_truncation)]
                    let lsn = Lsn::new(1, 100 * seq as u32);
                    (seq, PositionedEntry { entry, lsn })
                })
                .collect();
            Self {
                entries,
                gap: None,
                lowest,
            }
        }

        fn in_gap(&self, vlsn: u64) -> bool {
            self.gap.is_some_and(|(lo, hi)| vlsn >= lo && vlsn <= hi)
        }
    }

    impl LogScanner for FakeScanner {
        fn entry_at(&mut self, vlsn: Vlsn) -> Result<ScanOutcome, SyncupError> {
            if self.in_gap(vlsn.sequence()) {
                let (lo, _) = self.gap.unwrap();
                return Ok(ScanOutcome::Gap {
                    reposition: Vlsn::new(lo - 1),
                });
            }
            if vlsn.sequence() < self.lowest {
                return Ok(ScanOutcome::OffRange);
            }
            Ok(self
                .entries
                .get(&vlsn.sequence())
                .cloned()
                .map_or(ScanOutcome::OffRange, ScanOutcome::Entry))
        }

        fn prev_syncable(&mut self, before: Vlsn) -> Result<ScanOutcome, SyncupError> {
            let mut seq = before.sequence();
            loop {
                if seq <= self.lowest {
                    return Ok(ScanOutcome::OffRange);
                }
                seq -= 1;
                if self.in_gap(seq) {
                    let (lo, _) = self.gap.unwrap();
                    return Ok(ScanOutcome::Gap {
                        reposition: Vlsn::new(lo - 1),
                    });
                }
                if let Some(found) = self.entries.get(&seq)
                    && found.entry.kind.is_syncable()
                {
                    return Ok(ScanOutcome::Entry(found.clone()));
                }
            }
        }

        fn scan_stats(&mut self, from: Vlsn, to: Vlsn) -> Result<ScanStats, SyncupError> {
            let mut stats = ScanStats::default();
            for (&seq, positioned) in self.entries.range(to.sequence() + 1..=from.sequence()) {
                if positioned.entry.kind == EntryType::TxnCommit {
                    stats.passed_commits += 1;
                    stats.passed_durable_commits += 1;
                }
                if self.in_gap(seq) {
                    stats.crossed_cleaner_gap = true;
                }
            }
            Ok(stats)
        }
    }

    /// Peer whose log mirrors the local one up to a divergence point.
    struct FakePeer {
        entries: BTreeMap<u64, LogEntry>,
        pings_before_reply: usize,
        pings_echoed: usize,
    }

    impl RemotePeer for FakePeer {
        fn request_entry(&mut self, vlsn: Vlsn) -> Result<PeerResponse, SyncupError> {
            if self.pings_before_reply > 0 {
                self.pings_before_reply -= 1;
                return Ok(PeerResponse::Ping);
            }
            Ok(self
                .entries
                .get(&vlsn.sequence())
                .cloned()
                .map_or(PeerResponse::NotFound, PeerResponse::Entry))
        }

        fn echo_ping(&mut self) -> Result<(), SyncupError> {
            self.pings_echoed += 1;
            Ok(())
        }
    }

    fn commit(vlsn: u64, term: u64) -> LogEntry {
        LogEntry::new(EntryType::TxnCommit, term, Vlsn::new(vlsn), vec![])
    }

    fn insert(vlsn: u64) -> LogEntry {
        LogEntry::new(EntryType::Insert, 1, Vlsn::new(vlsn), vec![0xab])
    }

    fn shared_log() -> Vec<LogEntry> {
        vec![
            insert(1),
            commit(2, 1),
            insert(3),
            commit(4, 1),
            insert(5),
            commit(6, 1),
        ]
    }

    fn range_of(entries: &[LogEntry]) -> Range {
        let mut range = Range::EMPTY;
        for e in entries {
            range = range.advance(e.vlsn, e.kind);
        }
        range
    }

    fn policy() -> RollbackPolicy {
        RollbackPolicy {
            txn_limit: 10,
            disabled: false,
        }
    }

    #[test]
    fn test_matchpoint_at_shared_tail() {
        let log = shared_log();
        let mut scanner = FakeScanner::new(log.clone());
        let mut peer = FakePeer {
            entries: log.iter().map(|e| (e.vlsn.sequence(), e.clone())).collect(),
            pings_before_reply: 0,
            pings_echoed: 0,
        };
        let found = search(&mut peer, &mut scanner, range_of(&log))
            .unwrap()
            .unwrap();
        assert_eq!(found.vlsn, Vlsn::new(6));
        assert_eq!(found.lsn, Lsn::new(1, 600));
    }

    #[test]
    fn test_matchpoint_walks_back_past_divergence() {
        let local = shared_log();
        // The peer diverged at VLSN 5: its entries 5 and 6 differ.
        let mut remote: BTreeMap<u64, LogEntry> = local
            .iter()
            .map(|e| (e.vlsn.sequence(), e.clone()))
            .collect();
        remote.insert(5, LogEntry::new(EntryType::Delete, 2, Vlsn::new(5), vec![9]));
        remote.insert(6, commit(6, 2));

        let mut scanner = FakeScanner::new(local.clone());
        let mut peer = FakePeer {
            entries: remote,
            pings_before_reply: 0,
            pings_echoed: 0,
        };
        let found = search(&mut peer, &mut scanner, range_of(&local))
            .unwrap()
            .unwrap();
        assert_eq!(found.vlsn, Vlsn::new(4));
    }

    #[test]
    fn test_matchpoint_echoes_pings() {
        let log = shared_log();
        let mut scanner = FakeScanner::new(log.clone());
        let mut peer = FakePeer {
            entries: log.iter().map(|e| (e.vlsn.sequence(), e.clone())).collect(),
            pings_before_reply: 3,
            pings_echoed: 0,
        };
        let found = search(&mut peer, &mut scanner, range_of(&log)).unwrap();
        assert!(found.is_some());
        assert_eq!(peer.pings_echoed, 3);
    }

    #[test]
    fn test_scan_gap_repositions() {
        let log = shared_log();
        let mut scanner = FakeScanner::new(log.clone());
        // VLSNs 5..6 fell to the cleaner; the scan must reposition below.
        scanner.gap = Some((5, 6));
        let mut peer = FakePeer {
            entries: log.iter().map(|e| (e.vlsn.sequence(), e.clone())).collect(),
            pings_before_reply: 0,
            pings_echoed: 0,
        };
        let found = search(&mut peer, &mut scanner, range_of(&log))
            .unwrap()
            .unwrap();
        assert_eq!(found.vlsn, Vlsn::new(4));
    }

    #[test]
    fn test_peer_far_ahead_requires_restore() {
        // Local kept nothing syncable and the peer has no entry 1.
        let log = vec![insert(1)];
        let mut scanner = FakeScanner::new(log.clone());
        let mut range = range_of(&log);
        range.last_sync = Vlsn::NULL;
        let mut peer = FakePeer {
            entries: BTreeMap::new(),
            pings_before_reply: 0,
            pings_echoed: 0,
        };
        assert!(matches!(
            search(&mut peer, &mut scanner, range),
            Err(SyncupError::NetworkRestoreRequired)
        ));
    }

    #[test]
    fn test_classify_rollback_everything() {
        let action = classify(Range::EMPTY, None, &ScanStats::default(), policy(), Lsn::NULL)
            .unwrap();
        assert_eq!(action, RecoveryAction::RollbackAll);
    }

    #[test]
    fn test_classify_rollback_without_txn_end() {
        let mut range = Range::EMPTY;
        range.first = Vlsn::new(1);
        range.last = Vlsn::new(6);
        range.last_sync = Vlsn::new(6);
        let m = Matchpoint {
            vlsn: Vlsn::new(4),
            lsn: Lsn::new(1, 400),
            truncation_offset: 450,
        };
        let action = classify(range, Some(m), &ScanStats::default(), policy(), Lsn::NULL).unwrap();
        assert_eq!(action, RecoveryAction::Rollback(m));
    }

    #[test]
    fn test_classify_no_matchpoint_with_commits_restores() {
        let log = shared_log();
        let action = classify(
            range_of(&log),
            None,
            &ScanStats::default(),
            policy(),
            Lsn::NULL,
        )
        .unwrap();
        assert_eq!(action, RecoveryAction::NetworkRestore);
    }

    #[test]
    fn test_classify_normal_rollback_when_no_commits_passed() {
        let log = shared_log();
        let m = Matchpoint {
            vlsn: Vlsn::new(6),
            lsn: Lsn::new(1, 600),
            truncation_offset: 650,
        };
        let action = classify(
            range_of(&log),
            Some(m),
            &ScanStats::default(),
            policy(),
            Lsn::NULL,
        )
        .unwrap();
        assert_eq!(action, RecoveryAction::Rollback(m));
    }

    #[test]
    fn test_classify_hard_recovery() {
        let log = shared_log();
        let m = Matchpoint {
            vlsn: Vlsn::new(4),
            lsn: Lsn::new(1, 400),
            truncation_offset: 450,
        };
        let stats = ScanStats {
            passed_commits: 1,
            passed_durable_commits: 1,
            ..ScanStats::default()
        };
        let action = classify(range_of(&log), Some(m), &stats, policy(), Lsn::NULL).unwrap();
        assert_eq!(action, RecoveryAction::HardRecovery(m));
    }

    #[test]
    fn test_classify_prohibited_beyond_limit() {
        // Scenario: matchpoint at 900, last at 1000, 50 durable commits
        // passed, limit 10.
        let mut range = Range::EMPTY;
        range.first = Vlsn::new(1);
        range.last = Vlsn::new(1000);
        range.last_sync = Vlsn::new(1000);
        range.last_txn_end = Vlsn::new(1000);
        let m = Matchpoint {
            vlsn: Vlsn::new(900),
            lsn: Lsn::new(4, 9000),
            truncation_offset: 9050,
        };
        let stats = ScanStats {
            passed_commits: 50,
            passed_durable_commits: 50,
            ..ScanStats::default()
        };
        assert!(matches!(
            classify(range, Some(m), &stats, policy(), Lsn::NULL),
            Err(SyncupError::RollbackProhibited {
                passed: 50,
                limit: 10
            })
        ));
    }

    #[test]
    fn test_classify_gap_beats_prohibited() {
        let log = shared_log();
        let m = Matchpoint {
            vlsn: Vlsn::new(2),
            lsn: Lsn::new(1, 200),
            truncation_offset: 250,
        };
        let stats = ScanStats {
            passed_commits: 50,
            passed_durable_commits: 50,
            crossed_cleaner_gap: true,
            ..ScanStats::default()
        };
        let action = classify(range_of(&log), Some(m), &stats, policy(), Lsn::NULL).unwrap();
        assert_eq!(action, RecoveryAction::NetworkRestore);
    }

    #[test]
    fn test_classify_first_active_beats_prohibited() {
        let log = shared_log();
        let m = Matchpoint {
            vlsn: Vlsn::new(2),
            lsn: Lsn::new(1, 200),
            truncation_offset: 250,
        };
        let stats = ScanStats {
            passed_commits: 50,
            passed_durable_commits: 50,
            ..ScanStats::default()
        };
        // Recovery still needs positions from (1, 300) onward.
        let action =
            classify(range_of(&log), Some(m), &stats, policy(), Lsn::new(1, 300)).unwrap();
        assert_eq!(action, RecoveryAction::NetworkRestore);
    }

    #[test]
    fn test_classify_disabled_rollback() {
        let log = shared_log();
        let m = Matchpoint {
            vlsn: Vlsn::new(4),
            lsn: Lsn::new(1, 400),
            truncation_offset: 450,
        };
        let stats = ScanStats {
            passed_commits: 1,
            passed_durable_commits: 1,
            ..ScanStats::default()
        };
        let p = RollbackPolicy {
            txn_limit: 10,
            disabled: true,
        };
        assert!(matches!(
            classify(range_of(&log), Some(m), &stats, p, Lsn::NULL),
            Err(SyncupError::RollbackProhibited { .. })
        ));
    }

    #[test]
    fn test_rollback_then_replay_restores_feed() {
        use crate::index::vlsn_index::IndexConfig;
        use crate::testing::open_master;
        use crate::types::EntryType;

        let index = open_master(IndexConfig::default());
        for v in 1..=6u64 {
            index
                .put(
                    Vlsn::new(v),
                    Lsn::new(1, 100 * u32::try_from(v).unwrap()),
                    EntryType::Insert,
                    None,
                )
                .unwrap();
        }

        let m = Matchpoint {
            vlsn: Vlsn::new(4),
            lsn: Lsn::new(1, 400),
            truncation_offset: 450,
        };
        rollback_to(&index, m).unwrap();
        assert_eq!(index.range().last, Vlsn::new(4));

        // Replaying the feed from the matchpoint restores the tail.
        for v in 5..=6u64 {
            index
                .put(
                    Vlsn::new(v),
                    Lsn::new(2, 100 * u32::try_from(v).unwrap()),
                    EntryType::Insert,
                    None,
                )
                .unwrap();
        }
        assert_eq!(index.range().last, Vlsn::new(6));
        let bucket = index.gte_bucket(Vlsn::new(5)).unwrap().unwrap();
        assert_eq!(bucket.lsn(Vlsn::new(5)), Some(Lsn::new(2, 500)));
    }
}
