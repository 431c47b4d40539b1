//! Relay plumbing shared by downloads and streams.
//!
//! An upload connection pushes chunks into a bounded channel; the download
//! response body drains it. The bound gives natural backpressure: a slow
//! downloader stalls the uploader instead of buffering the file in memory.

use bytes::Bytes;
use futures_util::Stream;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;

/// Chunks buffered between uploader and downloader before the uploader
/// stalls.
const CHANNEL_DEPTH: usize = 32;

/// Lifecycle of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    /// Registered, waiting for the hosting peer to connect an upload.
    Pending,
    /// Bytes are flowing.
    Active,
    /// The upload stream ended naturally and everything was delivered.
    Finished,
    /// Failed; no retry possible.
    Errored,
    /// Cancelled by the hosting peer, a cascading removal, or quota
    /// enforcement.
    Cancelled,
    /// The downloader's connection dropped while the transfer was
    /// outstanding.
    PeerReset,
}

impl TransferStatus {
    /// Whether the transfer can never carry bytes again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Finished | Self::Errored | Self::Cancelled | Self::PeerReset
        )
    }
}

/// How an upload connection ended, mapped to an HTTP status by the routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Every byte reached the downloader.
    Finished,
    /// The upload connection broke before the declared size was reached;
    /// the transfer is back to pending and a fresh upload may resume it.
    Paused,
    /// The upload failed after delivering the declared size, or the
    /// transfer was already doomed.
    Errored,
    /// Quota enforcement aborted both sides.
    QuotaExceeded,
    /// The hosting peer cancelled mid-upload.
    Cancelled,
    /// The downloader closed its connection mid-upload.
    DownloaderGone,
}

/// Sending half of a relay channel, held by the upload handler.
pub type ChunkSender = mpsc::Sender<Result<Bytes, io::Error>>;

/// Response body that drains a relay channel.
///
/// Holds a [`oneshot::Sender`] purely for its drop side effect: when the
/// HTTP stack drops the body because the downloader went away, the paired
/// receiver fires and the watcher task tears the transfer down.
pub struct RelayBody {
    rx: mpsc::Receiver<Result<Bytes, io::Error>>,
    _closed: oneshot::Sender<()>,
}

impl Stream for RelayBody {
    type Item = Result<Bytes, io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl std::fmt::Debug for RelayBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayBody").finish_non_exhaustive()
    }
}

/// Create the uploader/downloader pipe for one transfer.
///
/// Returns the chunk sender, the response body, and a receiver that fires
/// when the body is dropped before the channel is drained.
pub fn relay_channel() -> (ChunkSender, RelayBody, oneshot::Receiver<()>) {
    let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
    let (closed_tx, closed_rx) = oneshot::channel();
    (
        tx,
        RelayBody {
            rx,
            _closed: closed_tx,
        },
        closed_rx,
    )
}

/// Abort the downloader side of a pipe with a connection error.
///
/// Spawned rather than awaited so callers holding locks never block on a
/// full channel.
pub fn send_abort(sink: ChunkSender) {
    tokio::spawn(async move {
        let _ = sink
            .send(Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "transfer aborted",
            )))
            .await;
    });
}

/// Aborts its task when dropped. Used for grace timers and key expiry so a
/// superseding event implicitly cancels the pending one.
#[derive(Debug)]
pub struct TaskGuard(AbortHandle);

impl TaskGuard {
    /// Wrap an abort handle.
    pub fn new(handle: AbortHandle) -> Self {
        Self(handle)
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}
