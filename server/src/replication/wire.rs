//! Wire protocol for syncup and log streaming.
//!
//! Fixed big-endian framing: every message is a 6-byte header, the operation
//! code (2 bytes) and the body size (4 bytes, signed), followed by the body.
//! Strings are length-prefixed UTF-8; integers are canonical big-endian.
//!
//! The syncup ops carry whole serialized log entries so the peers can
//! byte-compare candidate matchpoints. The file ops implement the log file
//! feeder used for network restore and backups.

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::types::{EntryError, LogEntry, Vlsn};

/// Frame header size: op (2) + body size (4).
pub const HEADER_SIZE: usize = 6;

/// Default cap on a message body.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 8 * 1024 * 1024;

const OP_ENTRY_REQUEST: u16 = 1;
const OP_ENTRY: u16 = 2;
const OP_ENTRY_NOT_FOUND: u16 = 3;
const OP_ALTERNATE_MATCHPOINT: u16 = 4;
const OP_START_STREAM: u16 = 5;
const OP_RESTORE_REQUEST: u16 = 6;
const OP_RESTORE_RESPONSE: u16 = 7;
const OP_SYNCUP_PING: u16 = 8;
const OP_FILE_LIST_REQUEST: u16 = 9;
const OP_FILE_LIST_RESPONSE: u16 = 10;
const OP_FILE_REQUEST: u16 = 11;
const OP_FILE_START: u16 = 12;
const OP_FILE_END: u16 = 13;
const OP_DONE: u16 = 14;

/// A protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Ask the peer for its entry at a VLSN.
    EntryRequest {
        /// Requested VLSN.
        vlsn: Vlsn,
    },
    /// The peer's entry at the requested VLSN.
    Entry {
        /// The serialized entry.
        entry: LogEntry,
    },
    /// The peer has no entry at the requested VLSN.
    EntryNotFound,
    /// The peer proposes an earlier matchpoint candidate of its own.
    AlternateMatchpoint {
        /// The peer's candidate entry.
        entry: LogEntry,
    },
    /// Start streaming entries at a VLSN.
    StartStream {
        /// First VLSN to stream.
        from_vlsn: Vlsn,
        /// Opaque feeder filter.
        filter_bytes: Vec<u8>,
    },
    /// The node cannot reconcile its log and asks for restore providers.
    RestoreRequest {
        /// The node's last VLSN.
        vlsn: Vlsn,
    },
    /// Nodes willing to serve log files for a restore.
    RestoreResponse {
        /// Provider addresses as host:port strings.
        providers: Vec<String>,
    },
    /// Keep-alive during a long syncup scan; must be echoed.
    SyncupPing,
    /// Announce a restore client and ask for the servable file set.
    FileListRequest {
        /// Stable client identifier, used to key the lease.
        client_id: String,
    },
    /// File numbers available for transfer.
    FileListResponse {
        /// Servable log file numbers.
        files: Vec<u64>,
    },
    /// Request one log file.
    FileRequest {
        /// Log file number.
        file_num: u64,
    },
    /// Transfer begins; raw file bytes follow outside the framing.
    FileStart {
        /// Log file number.
        file_num: u64,
        /// File length in bytes.
        length: u64,
        /// CRC32 of the file contents.
        checksum: u32,
    },
    /// Transfer of one file finished.
    FileEnd {
        /// CRC32 of the bytes sent.
        checksum: u32,
    },
    /// The client is finished.
    Done,
}

impl Message {
    /// The operation code of this message.
    #[must_use]
    pub const fn op(&self) -> u16 {
        match self {
            Self::EntryRequest { .. } => OP_ENTRY_REQUEST,
            Self::Entry { .. } => OP_ENTRY,
            Self::EntryNotFound => OP_ENTRY_NOT_FOUND,
            Self::AlternateMatchpoint { .. } => OP_ALTERNATE_MATCHPOINT,
            Self::StartStream { .. } => OP_START_STREAM,
            Self::RestoreRequest { .. } => OP_RESTORE_REQUEST,
            Self::RestoreResponse { .. } => OP_RESTORE_RESPONSE,
            Self::SyncupPing => OP_SYNCUP_PING,
            Self::FileListRequest { .. } => OP_FILE_LIST_REQUEST,
            Self::FileListResponse { .. } => OP_FILE_LIST_RESPONSE,
            Self::FileRequest { .. } => OP_FILE_REQUEST,
            Self::FileStart { .. } => OP_FILE_START,
            Self::FileEnd { .. } => OP_FILE_END,
            Self::Done => OP_DONE,
        }
    }

    /// Serialize the body of this message.
    #[must_use]
    pub fn body(&self) -> Vec<u8> {
        let mut body = Vec::new();
        match self {
            Self::EntryRequest { vlsn } | Self::RestoreRequest { vlsn } => {
                body.extend_from_slice(&vlsn.sequence().to_be_bytes());
            }
            Self::Entry { entry } | Self::AlternateMatchpoint { entry } => {
                body.extend_from_slice(&entry.to_bytes());
            }
            Self::EntryNotFound | Self::SyncupPing | Self::Done => {}
            Self::StartStream {
                from_vlsn,
                filter_bytes,
            } => {
                body.extend_from_slice(&from_vlsn.sequence().to_be_bytes());
                put_bytes(&mut body, filter_bytes);
            }
            Self::RestoreResponse { providers } => {
                put_count(&mut body, providers.len());
                for provider in providers {
                    put_string(&mut body, provider);
                }
            }
            Self::FileListRequest { client_id } => {
                put_string(&mut body, client_id);
            }
            Self::FileListResponse { files } => {
                put_count(&mut body, files.len());
                for file in files {
                    body.extend_from_slice(&file.to_be_bytes());
                }
            }
            Self::FileRequest { file_num } => {
                body.extend_from_slice(&file_num.to_be_bytes());
            }
            Self::FileStart {
                file_num,
                length,
                checksum,
            } => {
                body.extend_from_slice(&file_num.to_be_bytes());
                body.extend_from_slice(&length.to_be_bytes());
                body.extend_from_slice(&checksum.to_be_bytes());
            }
            Self::FileEnd { checksum } => {
                body.extend_from_slice(&checksum.to_be_bytes());
            }
        }
        body
    }

    /// Serialize the full frame: header plus body.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let body = self.body();
        let mut frame = Vec::with_capacity(HEADER_SIZE + body.len());
        frame.extend_from_slice(&self.op().to_be_bytes());
        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        frame.extend_from_slice(&(body.len() as i32).to_be_bytes());
        frame.extend_from_slice(&body);
        frame
    }

    /// Decode a message from an operation code and body.
    pub fn decode(op: u16, body: &[u8]) -> Result<Self, WireError> {
        let mut reader = BodyReader { body, at: 0 };
        let message = match op {
            OP_ENTRY_REQUEST => Self::EntryRequest {
                vlsn: Vlsn::new(reader.u64()?),
            },
            OP_ENTRY => Self::Entry {
                entry: reader.entry()?,
            },
            OP_ENTRY_NOT_FOUND => Self::EntryNotFound,
            OP_ALTERNATE_MATCHPOINT => Self::AlternateMatchpoint {
                entry: reader.entry()?,
            },
            OP_START_STREAM => Self::StartStream {
                from_vlsn: Vlsn::new(reader.u64()?),
                filter_bytes: reader.bytes()?,
            },
            OP_RESTORE_REQUEST => Self::RestoreRequest {
                vlsn: Vlsn::new(reader.u64()?),
            },
            OP_RESTORE_RESPONSE => {
                let count = reader.count()?;
                let mut providers = Vec::with_capacity(count);
                for _ in 0..count {
                    providers.push(reader.string()?);
                }
                Self::RestoreResponse { providers }
            }
            OP_SYNCUP_PING => Self::SyncupPing,
            OP_FILE_LIST_REQUEST => Self::FileListRequest {
                client_id: reader.string()?,
            },
            OP_FILE_LIST_RESPONSE => {
                let count = reader.count()?;
                let mut files = Vec::with_capacity(count);
                for _ in 0..count {
                    files.push(reader.u64()?);
                }
                Self::FileListResponse { files }
            }
            OP_FILE_REQUEST => Self::FileRequest {
                file_num: reader.u64()?,
            },
            OP_FILE_START => Self::FileStart {
                file_num: reader.u64()?,
                length: reader.u64()?,
                checksum: reader.u32()?,
            },
            OP_FILE_END => Self::FileEnd {
                checksum: reader.u32()?,
            },
            _ => return Err(WireError::UnknownOp(op)),
        };
        if reader.at != body.len() {
            return Err(WireError::TrailingBytes {
                op,
                extra: body.len() - reader.at,
            });
        }
        Ok(message)
    }
}

/// Read one message from `reader`, enforcing `max_body`.
pub async fn read_message<R>(reader: &mut R, max_body: usize) -> Result<Message, WireError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header).await?;
    let op = u16::from_be_bytes([header[0], header[1]]);
    let declared = i32::from_be_bytes([header[2], header[3], header[4], header[5]]);
    let size = usize::try_from(declared).map_err(|_| WireError::BadBodySize(declared))?;
    if size > max_body {
        return Err(WireError::BodyTooLarge {
            size,
            limit: max_body,
        });
    }
    let mut body = vec![0u8; size];
    reader.read_exact(&mut body).await?;
    Message::decode(op, &body)
}

/// Write one message to `writer`.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> Result<(), WireError>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    writer.write_all(&message.encode()).await?;
    writer.flush().await?;
    Ok(())
}

struct BodyReader<'a> {
    body: &'a [u8],
    at: usize,
}

impl BodyReader<'_> {
    fn take(&mut self, n: usize) -> Result<&[u8], WireError> {
        let slice = self
            .body
            .get(self.at..self.at + n)
            .ok_or(WireError::Truncated)?;
        self.at += n;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32, WireError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn u64(&mut self) -> Result<u64, WireError> {
        let bytes = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(buf))
    }

    fn count(&mut self) -> Result<usize, WireError> {
        Ok(self.u32()? as usize)
    }

    fn bytes(&mut self) -> Result<Vec<u8>, WireError> {
        let len = self.count()?;
        Ok(self.take(len)?.to_vec())
    }

    fn string(&mut self) -> Result<String, WireError> {
        let raw = self.bytes()?;
        String::from_utf8(raw).map_err(|_| WireError::BadString)
    }

    fn entry(&mut self) -> Result<LogEntry, WireError> {
        let remaining = &self.body[self.at..];
        let (entry, consumed) = LogEntry::from_bytes(remaining).map_err(WireError::Entry)?;
        self.at += consumed;
        Ok(entry)
    }
}

fn put_count(body: &mut Vec<u8>, count: usize) {
    #[allow(clippy::cast_possible_truncation)] // counts are protocol-bounded
    body.extend_from_slice(&(count as u32).to_be_bytes());
}

fn put_bytes(body: &mut Vec<u8>, bytes: &[u8]) {
    put_count(body, bytes.len());
    body.extend_from_slice(bytes);
}

fn put_string(body: &mut Vec<u8>, s: &str) {
    put_bytes(body, s.as_bytes());
}

/// Protocol failures.
#[derive(Debug)]
pub enum WireError {
    /// Unknown operation code.
    UnknownOp(u16),
    /// Negative body size in the header.
    BadBodySize(i32),
    /// Body exceeds the configured cap.
    BodyTooLarge { size: usize, limit: usize },
    /// Body shorter than its fields require.
    Truncated,
    /// Body longer than its fields require.
    TrailingBytes { op: u16, extra: usize },
    /// Length-prefixed string is not UTF-8.
    BadString,
    /// Embedded log entry failed to decode.
    Entry(EntryError),
    /// Transport failure.
    Io(std::io::Error),
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownOp(op) => write!(f, "unknown protocol op {op}"),
            Self::BadBodySize(size) => write!(f, "negative message body size {size}"),
            Self::BodyTooLarge { size, limit } => {
                write!(f, "message body of {size} bytes exceeds limit of {limit}")
            }
            Self::Truncated => write!(f, "truncated message body"),
            Self::TrailingBytes { op, extra } => {
                write!(f, "message op {op} carries {extra} trailing bytes")
            }
            Self::BadString => write!(f, "message string is not valid UTF-8"),
            Self::Entry(e) => write!(f, "embedded entry: {e}"),
            Self::Io(e) => write!(f, "transport: {e}"),
        }
    }
}

impl std::error::Error for WireError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Entry(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for WireError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
