//! Replicated log entry types and the serialized record format.
//!
//! Every record in the replication stream carries a fixed header followed by
//! an opaque item payload produced by the log layer. Two nodes agree on a
//! matchpoint when the full serialized record bytes at a VLSN are identical.
//!
//! # Record Format
//!
//! ```text
//! +----------+-----------------------------------------------+
//! | 0        | entry_type (1 byte)                           |
//! | 1-8      | term (8 bytes, big-endian)                    |
//! | 9-16     | vlsn (8 bytes)                                |
//! | 17-24    | durable-txn vlsn (8 bytes, NULL unless txn end)|
//! | 25-28    | item_size (4 bytes)                           |
//! | 29-N     | item bytes (opaque)                           |
//! | N+1-N+4  | CRC32 checksum (4 bytes)                      |
//! +----------+-----------------------------------------------+
//! ```
//!
//! All integers are canonical big-endian.

use crate::types::lsn::Lsn;
use crate::types::vlsn::Vlsn;

/// Record header size before the item payload.
/// type (1) + term (8) + vlsn (8) + dtvlsn (8) + item_size (4) = 29 bytes
const ENTRY_HEADER_SIZE: usize = 29;

/// CRC32 checksum size at the end of a record.
const CHECKSUM_SIZE: usize = 4;

/// Replicated entry types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EntryType {
    /// Record insert.
    Insert = 0x01,
    /// Record update.
    Update = 0x02,
    /// Record delete.
    Delete = 0x03,
    /// Transaction commit marker.
    TxnCommit = 0x04,
    /// Transaction abort marker.
    TxnAbort = 0x05,
    /// Standalone matchpoint marker written outside any transaction.
    Matchpoint = 0x06,
}

impl EntryType {
    /// Whether this entry type can serve as a replication matchpoint.
    #[must_use]
    pub const fn is_syncable(self) -> bool {
        matches!(self, Self::TxnCommit | Self::TxnAbort | Self::Matchpoint)
    }

    /// Whether this entry ends a transaction.
    #[must_use]
    pub const fn is_txn_end(self) -> bool {
        matches!(self, Self::TxnCommit | Self::TxnAbort)
    }
}

impl TryFrom<u8> for EntryType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Insert),
            0x02 => Ok(Self::Update),
            0x03 => Ok(Self::Delete),
            0x04 => Ok(Self::TxnCommit),
            0x05 => Ok(Self::TxnAbort),
            0x06 => Ok(Self::Matchpoint),
            _ => Err(value),
        }
    }
}

/// A complete replicated log entry as it travels on the wire and sits in the
/// log item cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Entry type.
    pub kind: EntryType,
    /// Leadership term of the master that wrote this entry.
    pub term: u64,
    /// VLSN assigned to this entry.
    pub vlsn: Vlsn,
    /// Durable-txn VLSN stamped onto commit and abort entries.
    /// NULL for all other entry types.
    pub dtvlsn: Vlsn,
    /// Opaque item payload produced by the log layer.
    pub item: Vec<u8>,
}

impl LogEntry {
    /// Create a new entry. The durable-txn VLSN starts NULL and is stamped
    /// by the sequencer for commit and abort entries.
    #[must_use]
    pub const fn new(kind: EntryType, term: u64, vlsn: Vlsn, item: Vec<u8>) -> Self {
        Self {
            kind,
            term,
            vlsn,
            dtvlsn: Vlsn::NULL,
            item,
        }
    }

    /// Total serialized size of this entry.
    #[must_use]
    pub fn serialized_size(&self) -> usize {
        ENTRY_HEADER_SIZE + self.item.len() + CHECKSUM_SIZE
    }

    /// Serialize this entry to bytes.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.serialized_size());
        bytes.push(self.kind as u8);
        bytes.extend_from_slice(&self.term.to_be_bytes());
        bytes.extend_from_slice(&self.vlsn.sequence().to_be_bytes());
        bytes.extend_from_slice(&self.dtvlsn.sequence().to_be_bytes());
        #[allow(clippy::cast_possible_truncation)] // item length is bounded by the wire limit
        bytes.extend_from_slice(&(self.item.len() as u32).to_be_bytes());
        bytes.extend_from_slice(&self.item);
        let checksum = crc32fast::hash(&bytes);
        bytes.extend_from_slice(&checksum.to_be_bytes());
        bytes
    }

    /// Deserialize an entry from bytes.
    ///
    /// Returns the entry and the number of bytes consumed.
    pub fn from_bytes(bytes: &[u8]) -> Result<(Self, usize), EntryError> {
        if bytes.len() < ENTRY_HEADER_SIZE + CHECKSUM_SIZE {
            return Err(EntryError::Truncated);
        }

        let kind = EntryType::try_from(bytes[0]).map_err(EntryError::InvalidType)?;
        let term = u64::from_be_bytes(read8(bytes, 1));
        let vlsn = Vlsn::new(u64::from_be_bytes(read8(bytes, 9)));
        let dtvlsn = Vlsn::new(u64::from_be_bytes(read8(bytes, 17)));
        let item_size =
            u32::from_be_bytes([bytes[25], bytes[26], bytes[27], bytes[28]]) as usize;

        let total = ENTRY_HEADER_SIZE + item_size + CHECKSUM_SIZE;
        if bytes.len() < total {
            return Err(EntryError::Truncated);
        }

        let stored = u32::from_be_bytes([
            bytes[total - 4],
            bytes[total - 3],
            bytes[total - 2],
            bytes[total - 1],
        ]);
        let computed = crc32fast::hash(&bytes[..total - CHECKSUM_SIZE]);
        if stored != computed {
            return Err(EntryError::ChecksumMismatch {
                expected: stored,
                actual: computed,
            });
        }

        let item = bytes[ENTRY_HEADER_SIZE..ENTRY_HEADER_SIZE + item_size].to_vec();
        Ok((
            Self {
                kind,
                term,
                vlsn,
                dtvlsn,
                item,
            },
            total,
        ))
    }

    /// Whether two entries byte-match, the matchpoint criterion.
    #[must_use]
    pub fn byte_matches(&self, other: &Self) -> bool {
        self == other
    }
}

/// An entry paired with its physical position, as produced by log scans.
#[derive(Debug, Clone)]
pub struct PositionedEntry {
    /// The entry.
    pub entry: LogEntry,
    /// Physical position of the entry in the local log.
    pub lsn: Lsn,
}

/// Errors from entry deserialization.
#[derive(Debug)]
pub enum EntryError {
    /// Fewer bytes than the declared record size.
    Truncated,
    /// Unknown entry type byte.
    InvalidType(u8),
    /// Checksum mismatch.
    ChecksumMismatch { expected: u32, actual: u32 },
}

impl std::fmt::Display for EntryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated => write!(f, "truncated log entry"),
            Self::InvalidType(t) => write!(f, "invalid entry type: 0x{t:02x}"),
            Self::ChecksumMismatch { expected, actual } => write!(
                f,
                "entry checksum mismatch: expected 0x{expected:08x}, got 0x{actual:08x}"
            ),
        }
    }
}

impl std::error::Error for EntryError {}

fn read8(bytes: &[u8], at: usize) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(&bytes[at..at + 8]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_roundtrip() {
        let entry = LogEntry::new(EntryType::Insert, 3, Vlsn::new(42), b"payload".to_vec());
        let bytes = entry.to_bytes();
        let (decoded, consumed) = LogEntry::from_bytes(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, entry);
    }

    #[test]
    fn test_commit_carries_dtvlsn() {
        let mut entry = LogEntry::new(EntryType::TxnCommit, 1, Vlsn::new(10), Vec::new());
        entry.dtvlsn = Vlsn::new(8);
        let bytes = entry.to_bytes();
        let (decoded, _) = LogEntry::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.dtvlsn, Vlsn::new(8));
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let entry = LogEntry::new(EntryType::Update, 1, Vlsn::new(5), b"x".to_vec());
        let mut bytes = entry.to_bytes();
        bytes[10] ^= 0xFF;
        assert!(matches!(
            LogEntry::from_bytes(&bytes),
            Err(EntryError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_truncated_entry() {
        let entry = LogEntry::new(EntryType::Delete, 1, Vlsn::new(5), b"abcdef".to_vec());
        let bytes = entry.to_bytes();
        assert!(matches!(
            LogEntry::from_bytes(&bytes[..bytes.len() - 3]),
            Err(EntryError::Truncated)
        ));
    }

    #[test]
    fn test_syncable_classification() {
        assert!(EntryType::TxnCommit.is_syncable());
        assert!(EntryType::TxnAbort.is_syncable());
        assert!(EntryType::Matchpoint.is_syncable());
        assert!(!EntryType::Insert.is_syncable());
        assert!(EntryType::TxnCommit.is_txn_end());
        assert!(!EntryType::Matchpoint.is_txn_end());
    }

    #[test]
    fn test_byte_match() {
        let a = LogEntry::new(EntryType::TxnCommit, 2, Vlsn::new(9), b"c".to_vec());
        let b = LogEntry::new(EntryType::TxnCommit, 2, Vlsn::new(9), b"c".to_vec());
        let c = LogEntry::new(EntryType::TxnCommit, 3, Vlsn::new(9), b"c".to_vec());
        assert!(a.byte_matches(&b));
        assert!(!a.byte_matches(&c));
    }
}
