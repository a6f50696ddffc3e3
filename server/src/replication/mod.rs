//! Replication stream plumbing: the wire protocol, the replica-feeder
//! syncup matchpoint search, and the log file feeder.

pub mod feeder;
pub mod matchpoint;
pub mod wire;

pub use feeder::{FeederConfig, FeederError, FeederManager, LogDirectory};
pub use matchpoint::{
    LogScanner, Matchpoint, PeerResponse, RecoveryAction, RemotePeer, RollbackPolicy,
    ScanOutcome, ScanStats, SyncupError,
};
pub use wire::{Message, WireError};
