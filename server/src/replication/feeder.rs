//! Log file feeder.
//!
//! Serves log file dumps to restoring nodes and backup clients. Each
//! connection gets its own worker task that alternates, via `select`,
//! between client requests and a periodic keep-alive ping.
//!
//! A connected client holds a backup handle (a frozen file-deletion bound)
//! so the cleaner cannot delete files mid-transfer. On disconnect the handle
//! is not released immediately: a lease keyed by the client id keeps it
//! alive for a configurable duration, so a client that reconnects resumes
//! without the file set shifting under it. Expired leases release the handle
//! and the cleaner moves on.
//!
//! File checksums are memoized per file number and recomputed only when the
//! file's length or modification time changes.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};

use crate::index::protect::ProtectedFileRange;
use crate::index::store::KvStore;
use crate::index::vlsn_index::VlsnIndex;
use crate::replication::wire::{self, Message, WireError};

/// Feeder tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct FeederConfig {
    /// How long a disconnected client's backup handle survives.
    pub lease_duration: Duration,
    /// Cap on a single protocol message body.
    pub max_message_size: usize,
    /// Keep-alive interval on idle connections.
    pub ping_interval: Duration,
}

impl Default for FeederConfig {
    fn default() -> Self {
        Self {
            lease_duration: Duration::from_secs(60),
            max_message_size: wire::DEFAULT_MAX_MESSAGE_SIZE,
            ping_interval: Duration::from_secs(5),
        }
    }
}

/// Size of chunks when streaming file contents.
const CHUNK_SIZE: usize = 64 * 1024;

/// A directory of numbered log files, named `<hex file number>.log`.
#[derive(Debug, Clone)]
pub struct LogDirectory {
    dir: PathBuf,
}

impl LogDirectory {
    /// Wrap a directory path.
    #[must_use]
    pub const fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// Path of one log file.
    #[must_use]
    pub fn path_of(&self, file_num: u64) -> PathBuf {
        self.dir.join(format!("{file_num:08x}.log"))
    }

    /// Enumerate log file numbers in ascending order.
    pub fn list_files(&self) -> io::Result<Vec<u64>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(stem) = name.strip_suffix(".log")
                && let Ok(num) = u64::from_str_radix(stem, 16)
            {
                files.push(num);
            }
        }
        files.sort_unstable();
        Ok(files)
    }
}

#[derive(Debug, Clone, Copy)]
struct CachedChecksum {
    length: u64,
    modified: Option<SystemTime>,
    checksum: u32,
}

/// Memoized (file number -> checksum), invalidated when the file changes.
#[derive(Debug, Default)]
struct ChecksumCache {
    entries: Mutex<HashMap<u64, CachedChecksum>>,
}

impl ChecksumCache {
    /// Checksum and length of a file, recomputing only when stale.
    fn of(&self, path: &Path, file_num: u64) -> io::Result<(u32, u64)> {
        let metadata = std::fs::metadata(path)?;
        let length = metadata.len();
        let modified = metadata.modified().ok();

        if let Ok(cache) = self.entries.lock()
            && let Some(held) = cache.get(&file_num)
            && held.length == length
            && held.modified == modified
        {
            return Ok((held.checksum, length));
        }

        let contents = std::fs::read(path)?;
        let checksum = crc32fast::hash(&contents);
        if let Ok(mut cache) = self.entries.lock() {
            cache.insert(
                file_num,
                CachedChecksum {
                    length,
                    modified,
                    checksum,
                },
            );
        }
        Ok((checksum, length))
    }
}

struct Lease {
    expires_at: Instant,
    protection: ProtectedFileRange,
}

/// Accepts restore and backup connections and hands each to a worker task.
pub struct FeederManager<S: KvStore> {
    config: FeederConfig,
    dir: LogDirectory,
    index: Arc<VlsnIndex<S>>,
    leases: Mutex<HashMap<String, Lease>>,
    checksums: ChecksumCache,
}

impl<S: KvStore + Send + Sync + 'static> FeederManager<S> {
    /// Create a manager serving `dir` on behalf of `index`.
    #[must_use]
    pub fn new(config: FeederConfig, dir: LogDirectory, index: Arc<VlsnIndex<S>>) -> Arc<Self> {
        Arc::new(Self {
            config,
            dir,
            index,
            leases: Mutex::new(HashMap::new()),
            checksums: ChecksumCache::default(),
        })
    }

    /// Accept connections until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        let mut sweep = tokio::time::interval(self.config.lease_duration / 2);
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            tracing::debug!(%peer, "feeder connection accepted");
                            let manager = Arc::clone(&self);
                            tokio::spawn(async move {
                                if let Err(e) = manager.handle_connection(stream).await {
                                    tracing::warn!(%peer, error = %e, "feeder connection failed");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "feeder accept failed");
                            return;
                        }
                    }
                }
                _ = sweep.tick() => self.sweep_leases(),
            }
        }
    }

    /// Number of live leases; expired ones are swept first.
    #[must_use]
    pub fn lease_count(&self) -> usize {
        self.sweep_leases();
        self.leases.lock().map_or(0, |leases| leases.len())
    }

    /// Release every lease whose duration ran out.
    pub fn sweep_leases(&self) {
        let Ok(mut leases) = self.leases.lock() else {
            return;
        };
        let now = Instant::now();
        leases.retain(|client_id, lease| {
            let live = lease.expires_at > now;
            if !live {
                tracing::info!(client_id, "backup lease expired");
            }
            live
        });
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream) -> Result<(), FeederError> {
        let (mut reader, mut writer) = stream.into_split();
        let max = self.config.max_message_size;

        // The handshake names the client so its lease can be found.
        let client_id = match wire::read_message(&mut reader, max).await? {
            Message::FileListRequest { client_id } => client_id,
            other => {
                return Err(FeederError::UnexpectedMessage {
                    expected: "FileListRequest",
                    got: other.op(),
                });
            }
        };

        // Reconnects take over their lease; new clients freeze the file set
        // from the current range head.
        let protection = self.take_lease(&client_id).unwrap_or_else(|| {
            self.index.protect_range_head(&format!("backup:{client_id}"))
        });
        tracing::info!(client_id, "backup client connected");

        let files = self.dir.list_files()?;
        wire::write_message(&mut writer, &Message::FileListResponse { files }).await?;

        // Frames are pumped into a channel so the worker can select between
        // requests and the ping timer without cancelling a half-read frame.
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<Message, WireError>>(8);
        let pump = tokio::spawn(async move {
            loop {
                match wire::read_message(&mut reader, max).await {
                    Ok(message) => {
                        if tx.send(Ok(message)).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                }
            }
        });

        let outcome = self.request_loop(&client_id, rx, &mut writer).await;
        pump.abort();
        match outcome {
            Ok(()) => {
                // Clean finish: the backup handle is released right away.
                tracing::info!(client_id, "backup client finished");
                drop(protection);
                Ok(())
            }
            Err(e) => {
                // Keep the file set frozen until the lease runs out.
                self.install_lease(&client_id, protection);
                Err(e)
            }
        }
    }

    async fn request_loop(
        &self,
        client_id: &str,
        mut requests: tokio::sync::mpsc::Receiver<Result<Message, WireError>>,
        writer: &mut OwnedWriteHalf,
    ) -> Result<(), FeederError> {
        let mut ping = tokio::time::interval(self.config.ping_interval);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping.reset();

        loop {
            tokio::select! {
                received = requests.recv() => {
                    match received.transpose()? {
                        Some(Message::FileRequest { file_num }) => {
                            self.send_file(writer, file_num).await?;
                        }
                        Some(Message::SyncupPing) => {
                            wire::write_message(writer, &Message::SyncupPing).await?;
                        }
                        Some(Message::Done) => return Ok(()),
                        Some(other) => {
                            return Err(FeederError::UnexpectedMessage {
                                expected: "FileRequest or Done",
                                got: other.op(),
                            });
                        }
                        None => return Err(FeederError::Wire(WireError::Io(
                            io::Error::new(io::ErrorKind::UnexpectedEof, "client disconnected"),
                        ))),
                    }
                }
                _ = ping.tick() => {
                    tracing::trace!(client_id, "feeder keep-alive");
                    wire::write_message(writer, &Message::SyncupPing).await?;
                }
            }
        }
    }

    async fn send_file(
        &self,
        writer: &mut OwnedWriteHalf,
        file_num: u64,
    ) -> Result<(), FeederError> {
        let path = self.dir.path_of(file_num);
        if !path.exists() {
            return Err(FeederError::UnknownFile(file_num));
        }
        let (checksum, length) = self.checksums.of(&path, file_num)?;
        wire::write_message(
            writer,
            &Message::FileStart {
                file_num,
                length,
                checksum,
            },
        )
        .await?;

        let mut file = tokio::fs::File::open(&path).await?;
        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut sent = 0u64;
        loop {
            let n = file.read(&mut buffer).await?;
            if n == 0 {
                break;
            }
            tokio::io::AsyncWriteExt::write_all(writer, &buffer[..n]).await?;
            sent += n as u64;
        }
        if sent != length {
            // The file changed mid-transfer; the checksum no longer holds.
            return Err(FeederError::FileChanged(file_num));
        }
        wire::write_message(writer, &Message::FileEnd { checksum }).await?;
        tracing::debug!(file_num, length, "log file served");
        Ok(())
    }

    fn take_lease(&self, client_id: &str) -> Option<ProtectedFileRange> {
        let mut leases = self.leases.lock().ok()?;
        let lease = leases.remove(client_id)?;
        if lease.expires_at > Instant::now() {
            tracing::info!(client_id, "backup lease renewed");
            Some(lease.protection)
        } else {
            None
        }
    }

    fn install_lease(&self, client_id: &str, protection: ProtectedFileRange) {
        let Ok(mut leases) = self.leases.lock() else {
            return;
        };
        tracing::info!(client_id, "backup lease installed");
        leases.insert(
            client_id.to_string(),
            Lease {
                expires_at: Instant::now() + self.config.lease_duration,
                protection,
            },
        );
    }
}

/// Feeder failures.
#[derive(Debug)]
pub enum FeederError {
    /// Protocol failure or disconnect.
    Wire(WireError),
    /// Filesystem failure.
    Io(io::Error),
    /// A file was requested that this node does not have.
    UnknownFile(u64),
    /// A file changed while it was being streamed.
    FileChanged(u64),
    /// The client broke the request protocol.
    UnexpectedMessage {
        /// What the protocol state allowed.
        expected: &'static str,
        /// Operation code actually received.
        got: u16,
    },
}

impl std::fmt::Display for FeederError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Wire(e) => write!(f, "feeder protocol failure: {e}"),
            Self::Io(e) => write!(f, "feeder I/O failure: {e}"),
            Self::UnknownFile(n) => write!(f, "unknown log file {n:08x}"),
            Self::FileChanged(n) => write!(f, "log file {n:08x} changed during transfer"),
            Self::UnexpectedMessage { expected, got } => {
                write!(f, "expected {expected}, got op {got}")
            }
        }
    }
}

impl std::error::Error for FeederError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Wire(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<WireError> for FeederError {
    fn from(e: WireError) -> Self {
        Self::Wire(e)
    }
}

impl From<io::Error> for FeederError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}
