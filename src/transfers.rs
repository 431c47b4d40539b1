//! Transfer registry and relay pump.
//!
//! A transfer pairs one downloader's HTTP response with the hosting peer's
//! upload connection. Downloads and streams live in separate maps but share
//! the [`Transfer`] machinery; redirect keys are tracked here too, each with
//! its own expiry task.

use crate::config::KeysConfig;
use crate::error::TokenError;
use crate::limits::TransferQuota;
use crate::peer::lock;
use crate::pipe::{
    relay_channel, send_abort, ChunkSender, RelayBody, TaskGuard, TransferStatus, UploadOutcome,
};
use crate::token;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::{Stream, StreamExt};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

/// Whether a transfer is a one-shot download or a ranged stream request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    /// Full-file download.
    Download,
    /// One chunk of a ranged stream.
    Stream,
}

struct TransferState {
    status: TransferStatus,
    bytes: u64,
    /// Kept across a pause so a fresh upload resumes into the same
    /// downloader response. Cleared on any terminal state.
    sink: Option<ChunkSender>,
}

/// One in-flight relay between a downloader and a hosting peer.
pub struct Transfer {
    id: String,
    peer_id: String,
    file_token: String,
    /// IP the hosting peer connected from; relayed bytes are charged to
    /// this address's quota.
    provider_ip: IpAddr,
    /// Bytes this transfer must deliver. The declared file size for
    /// downloads, the range length for streams.
    size: u64,
    state: Mutex<TransferState>,
}

impl std::fmt::Debug for Transfer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transfer")
            .field("id", &self.id)
            .field("peer_id", &self.peer_id)
            .field("size", &self.size)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Transfer {
    /// Transfer id, sent to the peer so it can address its upload.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Id of the hosting peer.
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Token of the file being relayed.
    pub fn file_token(&self) -> &str {
        &self.file_token
    }

    /// IP of the hosting peer, the side whose quota this transfer counts
    /// against.
    pub fn provider_ip(&self) -> IpAddr {
        self.provider_ip
    }

    /// Bytes this transfer must deliver.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Current status.
    pub fn status(&self) -> TransferStatus {
        lock(&self.state).status
    }

    /// Bytes delivered so far.
    pub fn bytes(&self) -> u64 {
        lock(&self.state).bytes
    }

    /// Force the transfer into a terminal state, aborting the downloader
    /// side. Returns false if it was already terminal.
    fn abort_with(&self, status: TransferStatus) -> bool {
        let mut state = lock(&self.state);
        if state.status.is_terminal() {
            return false;
        }
        state.status = status;
        if let Some(sink) = state.sink.take() {
            send_abort(sink);
        }
        true
    }
}

/// Redirect key entry. Dropping the guard cancels the expiry task, so
/// consuming a key never races its own expiry.
struct RedirectKey {
    file_token: String,
    _expiry: TaskGuard,
}

/// Result of attaching an upload connection to a transfer.
#[derive(Debug)]
pub enum AcceptUpload {
    /// No such transfer.
    NotFound,
    /// Another upload connection is already pumping this transfer.
    AlreadyActive,
    /// The upload ran; `relayed` counts bytes delivered by this connection.
    Done {
        /// How the upload ended.
        outcome: UploadOutcome,
        /// Bytes this connection delivered.
        relayed: u64,
    },
}

/// All in-flight transfers and outstanding redirect keys.
pub struct TransferRegistry {
    downloads: DashMap<String, Arc<Transfer>>,
    streams: DashMap<String, Arc<Transfer>>,
    download_keys: Arc<DashMap<String, RedirectKey>>,
    stream_keys: Arc<DashMap<String, RedirectKey>>,
    keys: KeysConfig,
    internal_id_size: usize,
}

impl std::fmt::Debug for TransferRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferRegistry")
            .field("downloads", &self.downloads.len())
            .field("streams", &self.streams.len())
            .field("download_keys", &self.download_keys.len())
            .field("stream_keys", &self.stream_keys.len())
            .finish_non_exhaustive()
    }
}

impl TransferRegistry {
    /// Create an empty registry.
    pub fn new(keys: KeysConfig, internal_id_size: usize) -> Self {
        Self {
            downloads: DashMap::new(),
            streams: DashMap::new(),
            download_keys: Arc::new(DashMap::new()),
            stream_keys: Arc::new(DashMap::new()),
            keys,
            internal_id_size,
        }
    }

    fn map(&self, kind: TransferKind) -> &DashMap<String, Arc<Transfer>> {
        match kind {
            TransferKind::Download => &self.downloads,
            TransferKind::Stream => &self.streams,
        }
    }

    /// Register a transfer and build its relay pipe.
    ///
    /// Returns the transfer, the response body for the downloader, and a
    /// receiver that fires when the downloader drops the body early.
    pub fn register(
        &self,
        kind: TransferKind,
        peer_id: &str,
        file_token: &str,
        provider_ip: IpAddr,
        size: u64,
    ) -> Result<(Arc<Transfer>, RelayBody, oneshot::Receiver<()>), TokenError> {
        let id = token::generate(self.internal_id_size)?;
        let (sink, body, closed) = relay_channel();
        let transfer = Arc::new(Transfer {
            id: id.clone(),
            peer_id: peer_id.to_string(),
            file_token: file_token.to_string(),
            provider_ip,
            size,
            state: Mutex::new(TransferState {
                status: TransferStatus::Pending,
                bytes: 0,
                sink: Some(sink),
            }),
        });
        self.map(kind).insert(id, Arc::clone(&transfer));
        Ok((transfer, body, closed))
    }

    /// Look up a transfer by id.
    pub fn get(&self, kind: TransferKind, transfer_id: &str) -> Option<Arc<Transfer>> {
        self.map(kind).get(transfer_id).map(|t| Arc::clone(&t))
    }

    /// Drop a transfer from the registry without touching its state.
    pub fn discard(&self, kind: TransferKind, transfer_id: &str) {
        self.map(kind).remove(transfer_id);
    }

    /// Cancel a transfer on behalf of its hosting peer. The downloader's
    /// connection is torn down abruptly. Returns false if the transfer is
    /// unknown or already terminal.
    pub fn cancel(&self, kind: TransferKind, transfer_id: &str) -> Option<Arc<Transfer>> {
        let transfer = self.get(kind, transfer_id)?;
        if !transfer.abort_with(TransferStatus::Cancelled) {
            return None;
        }
        self.discard(kind, transfer_id);
        Some(transfer)
    }

    /// Mark the downloader of a transfer as gone. Returns the transfer if
    /// it had not already ended.
    pub fn downloader_gone(&self, kind: TransferKind, transfer_id: &str) -> Option<Arc<Transfer>> {
        let transfer = self.get(kind, transfer_id)?;
        if !transfer.abort_with(TransferStatus::PeerReset) {
            return None;
        }
        self.discard(kind, transfer_id);
        Some(transfer)
    }

    /// Cancel every transfer of a withdrawn file. Downloaders are aborted;
    /// returns how many transfers were torn down.
    pub fn cancel_for_file(&self, file_token: &str) -> usize {
        let mut cancelled = 0;
        for map in [&self.downloads, &self.streams] {
            let affected: Vec<String> = map
                .iter()
                .filter(|entry| entry.value().file_token == file_token)
                .map(|entry| entry.key().clone())
                .collect();
            for id in affected {
                if let Some(transfer) = map.remove(&id).map(|(_, t)| t) {
                    if transfer.abort_with(TransferStatus::Cancelled) {
                        cancelled += 1;
                    }
                }
            }
        }
        cancelled
    }

    /// Cancel every transfer sourced by a departing peer.
    ///
    /// Returns the affected transfers per kind so the caller can account
    /// for them; their downloaders are aborted here.
    pub fn cancel_for_peer(&self, peer_id: &str) -> (Vec<Arc<Transfer>>, Vec<Arc<Transfer>>) {
        let collect = |map: &DashMap<String, Arc<Transfer>>| {
            let affected: Vec<Arc<Transfer>> = map
                .iter()
                .filter(|entry| entry.value().peer_id == peer_id)
                .map(|entry| Arc::clone(entry.value()))
                .collect();
            for transfer in &affected {
                transfer.abort_with(TransferStatus::Cancelled);
                map.remove(transfer.id());
            }
            affected
        };
        (collect(&self.downloads), collect(&self.streams))
    }

    fn create_key(
        &self,
        keys: &Arc<DashMap<String, RedirectKey>>,
        size: usize,
        file_token: &str,
    ) -> Result<String, TokenError> {
        let key = token::generate_secure(size)?;
        let max_age = Duration::from_secs(self.keys.download_key_max_age_secs);
        let expiry = {
            let keys = Arc::clone(keys);
            let key = key.clone();
            tokio::spawn(async move {
                tokio::time::sleep(max_age).await;
                keys.remove(&key);
            })
        };
        keys.insert(
            key.clone(),
            RedirectKey {
                file_token: file_token.to_string(),
                _expiry: TaskGuard::new(expiry.abort_handle()),
            },
        );
        Ok(key)
    }

    /// Mint a one-time download redirect key for a file.
    pub fn create_download_key(&self, file_token: &str) -> Result<String, TokenError> {
        self.create_key(&self.download_keys, self.keys.download_key_size, file_token)
    }

    /// Redeem a download key. At most one caller gets the file token; the
    /// key is gone afterwards.
    pub fn consume_download_key(&self, key: &str) -> Option<String> {
        self.download_keys.remove(key).map(|(_, k)| k.file_token)
    }

    /// Mint a stream redirect key for a file.
    pub fn create_stream_key(&self, file_token: &str) -> Result<String, TokenError> {
        self.create_key(&self.stream_keys, self.keys.stream_key_size, file_token)
    }

    /// Validate a stream key against its file without consuming it;
    /// scrubbing players reuse the same key for successive ranges.
    pub fn check_stream_key(&self, key: &str, file_token: &str) -> bool {
        self.stream_keys
            .get(key)
            .is_some_and(|k| k.file_token == file_token)
    }

    /// In-flight download count.
    pub fn download_count(&self) -> usize {
        self.downloads.len()
    }

    /// In-flight stream count.
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Outstanding redirect keys of both kinds.
    pub fn key_count(&self) -> usize {
        self.download_keys.len() + self.stream_keys.len()
    }

    /// Drop transfers stuck in a terminal state. Returns how many were
    /// removed.
    pub fn reap(&self) -> usize {
        let mut removed = 0;
        for map in [&self.downloads, &self.streams] {
            let before = map.len();
            map.retain(|_, transfer| !transfer.status().is_terminal());
            removed += before - map.len();
        }
        removed
    }

    #[cfg(test)]
    pub(crate) fn insert_for_test(&self, kind: TransferKind, transfer: Arc<Transfer>) {
        self.map(kind).insert(transfer.id().to_string(), transfer);
    }

    /// Attach an upload connection's body to a transfer and pump its
    /// chunks to the downloader.
    ///
    /// Every chunk is accounted against the hosting peer's byte quota;
    /// exceeding it aborts both sides. A natural end of the body finishes
    /// the transfer whatever the declared size says; a broken body before
    /// `size` bytes pauses the transfer so a fresh upload can resume it.
    pub async fn accept_upload<S, E>(
        &self,
        kind: TransferKind,
        transfer_id: &str,
        mut body: S,
        quota: &TransferQuota,
    ) -> AcceptUpload
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin,
        E: std::fmt::Display,
    {
        let Some(transfer) = self.get(kind, transfer_id) else {
            return AcceptUpload::NotFound;
        };

        let sink = {
            let mut state = lock(&transfer.state);
            match state.status {
                TransferStatus::Pending => {}
                TransferStatus::Active => return AcceptUpload::AlreadyActive,
                TransferStatus::Cancelled | TransferStatus::PeerReset => {
                    return AcceptUpload::Done {
                        outcome: UploadOutcome::Cancelled,
                        relayed: 0,
                    }
                }
                TransferStatus::Finished | TransferStatus::Errored => {
                    return AcceptUpload::Done {
                        outcome: UploadOutcome::Errored,
                        relayed: 0,
                    }
                }
            }
            match state.sink.clone() {
                Some(sink) => {
                    state.status = TransferStatus::Active;
                    sink
                }
                None => {
                    return AcceptUpload::Done {
                        outcome: UploadOutcome::Errored,
                        relayed: 0,
                    }
                }
            }
        };

        let mut relayed: u64 = 0;
        let outcome = loop {
            match body.next().await {
                Some(Ok(chunk)) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    if transfer.status().is_terminal() {
                        break UploadOutcome::Cancelled;
                    }
                    let len = chunk.len() as u64;
                    if quota.record(transfer.provider_ip, len) {
                        transfer.abort_with(TransferStatus::Cancelled);
                        break UploadOutcome::QuotaExceeded;
                    }
                    if sink.send(Ok(chunk)).await.is_err() {
                        transfer.abort_with(TransferStatus::PeerReset);
                        break UploadOutcome::DownloaderGone;
                    }
                    relayed += len;
                    lock(&transfer.state).bytes += len;
                }
                Some(Err(err)) => {
                    debug!(transfer = %transfer.id, %err, "upload body broke off");
                    if transfer.status().is_terminal() {
                        break UploadOutcome::Cancelled;
                    }
                    // A broken connection short of the declared size is a
                    // retryable pause, not a failure.
                    if transfer.bytes() < transfer.size {
                        lock(&transfer.state).status = TransferStatus::Pending;
                        break UploadOutcome::Paused;
                    }
                    transfer.abort_with(TransferStatus::Errored);
                    break UploadOutcome::Errored;
                }
                None => {
                    if transfer.status().is_terminal() {
                        break UploadOutcome::Cancelled;
                    }
                    // Completion follows the stream's natural end, never a
                    // comparison against the declared size.
                    let mut state = lock(&transfer.state);
                    state.status = TransferStatus::Finished;
                    // Dropping the stored sink ends the downloader's body
                    // cleanly.
                    state.sink = None;
                    break UploadOutcome::Finished;
                }
            }
        };

        if !matches!(outcome, UploadOutcome::Paused) {
            self.discard(kind, transfer_id);
        }
        AcceptUpload::Done { outcome, relayed }
    }
}
