//! The replicated append-only log the wiki is stored in.
//!
//! The log itself (conflict resolution, linking of entries, gossip) is provided by an external
//! implementation of [`LogStore`] and [`ReplicatedLog`]. This module only defines the interface
//! the rest of the crate consumes, plus [`LogHandle`], which tracks whether an opened log has
//! exchanged heads with at least one peer.
//!
//! Event delivery through [`ReplicatedLog::subscribe`] is best effort. During a sync burst an
//! implementation may report only some of the received entries; the only complete view of a
//! log is [`ReplicatedLog::entries`].

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use snafu::Snafu;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::task::AbortOnDropHandle;
use tracing::{Instrument, debug, error_span, trace};

use crate::ids::{LogAddress, PeerId};

/// Errors reported by a log implementation.
#[allow(missing_docs)]
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[non_exhaustive]
pub enum LogError {
    #[snafu(display("Log {address} is closed"))]
    Closed { address: LogAddress },
    #[snafu(display("Node is offline"))]
    Offline {},
    #[snafu(display("Log implementation error"))]
    Other {
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
}

impl LogError {
    /// Wraps an error from a log implementation.
    pub fn from_err<T: std::error::Error + Send + Sync + 'static>(source: T) -> Self {
        Self::Other {
            source: Box::new(source),
        }
    }
}

/// Digest identifying a [`LogEntry`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryHash([u8; 32]);

impl EntryHash {
    /// Creates a hash from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Format a short representation, for logging.
    pub fn fmt_short(&self) -> String {
        data_encoding::HEXLOWER.encode(&self.0[..5])
    }
}

impl std::fmt::Debug for EntryHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EntryHash({})", self.fmt_short())
    }
}

/// An entry of a replicated log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Identifies the entry across replicas.
    pub hash: EntryHash,
    /// The node that appended the entry.
    pub writer: PeerId,
    /// Opaque entry content.
    pub payload: Bytes,
}

impl LogEntry {
    /// Creates the `seq`-th entry appended by `writer`.
    pub fn new(writer: PeerId, seq: u64, payload: Bytes) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(writer.as_bytes());
        hasher.update(&seq.to_be_bytes());
        hasher.update(&payload);
        Self {
            hash: EntryHash(*hasher.finalize().as_bytes()),
            writer,
            payload,
        }
    }
}

/// Events emitted by an open log.
#[derive(Debug, Clone, strum::Display)]
pub enum LogEvent {
    /// An entry was received from another replica.
    EntryAppended(LogEntry),
    /// A peer holding the same log exchanged heads with us.
    PeerJoined(PeerId),
    /// A peer holding the same log went away.
    PeerLeft(PeerId),
}

/// Opens replicated logs.
pub trait LogStore: Send + Sync + 'static {
    /// The handle type of an open log.
    type Log: ReplicatedLog;

    /// Opens the log called `name`, creating it if it does not exist yet.
    fn open(&self, name: &str) -> impl Future<Output = Result<Self::Log, LogError>> + Send;

    /// Opens the log at `address`, creating an empty local replica if needed.
    fn open_address(
        &self,
        address: &LogAddress,
    ) -> impl Future<Output = Result<Self::Log, LogError>> + Send;
}

/// An open replica of a log.
pub trait ReplicatedLog: Clone + Send + Sync + 'static {
    /// The stable address of this log.
    fn address(&self) -> LogAddress;

    /// Appends an entry. It is replicated to other holders eventually.
    fn append(&self, payload: Bytes) -> impl Future<Output = Result<LogEntry, LogError>> + Send;

    /// All entries of the local replica, in log order.
    fn entries(&self) -> impl Future<Output = Result<Vec<LogEntry>, LogError>> + Send;

    /// Subscribes to events of this log.
    fn subscribe(&self) -> broadcast::Receiver<LogEvent>;

    /// Peers currently exchanging heads for this log.
    fn peers(&self) -> Vec<PeerId>;

    /// Stops replicating this log.
    fn close(&self) -> impl Future<Output = Result<(), LogError>> + Send;
}

/// Bounds for waiting until a log has synced with a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncOptions {
    /// How often to check the sync flag.
    pub poll_interval: Duration,
    /// Give up after this long.
    pub timeout: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            timeout: Duration::from_secs(60),
        }
    }
}

/// How [`open_and_maybe_sync`] treats a freshly opened log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// The log is new, there is nobody to sync with.
    Create,
    /// Wait (bounded) for the first exchange of heads with a peer.
    WaitForSync(SyncOptions),
}

/// What to open in [`open_and_maybe_sync`].
#[derive(Debug, Clone, Copy)]
pub enum LogTarget<'a> {
    /// A log by name.
    Name(&'a str),
    /// A log by address.
    Address(&'a LogAddress),
}

/// An open log together with its sync state.
#[derive(Clone)]
pub struct LogHandle<L> {
    log: L,
    synced: Arc<AtomicBool>,
    _watcher: Arc<AbortOnDropHandle<()>>,
}

impl<L: ReplicatedLog> std::fmt::Debug for LogHandle<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogHandle")
            .field("address", &self.log.address())
            .field("synced", &self.is_synced())
            .finish_non_exhaustive()
    }
}

impl<L: ReplicatedLog> LogHandle<L> {
    /// Wraps an open log and starts watching it for peers joining.
    pub fn new(log: L) -> Self {
        let synced = Arc::new(AtomicBool::new(false));
        let mut events = log.subscribe();
        // A join may have happened before we subscribed.
        if !log.peers().is_empty() {
            synced.store(true, Ordering::Relaxed);
        }
        let address = log.address();
        let watcher = tokio::task::spawn({
            let synced = synced.clone();
            async move {
                loop {
                    match events.recv().await {
                        Ok(LogEvent::PeerJoined(peer)) => {
                            debug!(peer = %peer.fmt_short(), "peer joined");
                            synced.store(true, Ordering::Relaxed);
                        }
                        Ok(LogEvent::PeerLeft(peer)) => {
                            debug!(peer = %peer.fmt_short(), "peer left");
                        }
                        Ok(LogEvent::EntryAppended(_)) => {}
                        Err(RecvError::Lagged(n)) => trace!("sync watcher lagged by {n}"),
                        Err(RecvError::Closed) => break,
                    }
                }
            }
            .instrument(error_span!("log", address = %address.fmt_short()))
        });
        Self {
            log,
            synced,
            _watcher: Arc::new(AbortOnDropHandle::new(watcher)),
        }
    }

    /// The wrapped log.
    pub fn log(&self) -> &L {
        &self.log
    }

    /// The address of the wrapped log.
    pub fn address(&self) -> LogAddress {
        self.log.address()
    }

    /// Whether the log has exchanged heads with at least one peer.
    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Relaxed)
    }

    /// Polls the sync flag until it is set or `opts.timeout` elapses.
    ///
    /// Returns `false` on timeout.
    pub async fn wait_for_sync(&self, opts: SyncOptions) -> bool {
        let wait = async {
            while !self.is_synced() {
                tokio::time::sleep(opts.poll_interval).await;
            }
        };
        match tokio::time::timeout(opts.timeout, wait).await {
            Ok(()) => true,
            Err(_) => {
                debug!(address = %self.address(), "timeout waiting for log to sync");
                false
            }
        }
    }
}

/// Opens a log and, depending on `mode`, waits for it to sync.
///
/// Returns the handle and whether the log synced. Logs opened with [`SyncMode::Create`] report
/// `false`.
pub async fn open_and_maybe_sync<S: LogStore>(
    store: &S,
    target: LogTarget<'_>,
    mode: SyncMode,
) -> Result<(LogHandle<S::Log>, bool), LogError> {
    let log = match target {
        LogTarget::Name(name) => store.open(name).await?,
        LogTarget::Address(address) => store.open_address(address).await?,
    };
    let handle = LogHandle::new(log);
    let synced = match mode {
        SyncMode::Create => false,
        SyncMode::WaitForSync(opts) => handle.wait_for_sync(opts).await,
    };
    debug!(address = %handle.address(), synced, "log opened");
    Ok((handle, synced))
}
