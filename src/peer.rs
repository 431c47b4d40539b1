//! Connected peer state.
//!
//! A [`Peer`] is one browser holding files: its control-channel link, its
//! file catalog, its settings, and its session restoration key. All fields
//! sit behind std mutexes; nothing here awaits while holding a lock.

use crate::config::KeysConfig;
use crate::error::TokenError;
use crate::pipe::TaskGuard;
use crate::protocol::{FileDeclaration, FileSummary, RefreshedFile, ServerEnvelope};
use crate::token;
use axum::extract::ws::Message;
use serde::Serialize;
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Lock a mutex, recovering the guard if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Per-peer behavior flags.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PeerSettings {
    /// Keep one download token valid across uses. When false, a file's
    /// token rotates after every consumed download key.
    pub reusable_download_keys: bool,
    /// Drop the peer immediately on disconnect instead of granting the
    /// restoration grace period.
    pub strict_session: bool,
    /// Permit ranged stream requests against this peer's files.
    pub allow_streaming: bool,
}

impl Default for PeerSettings {
    fn default() -> Self {
        Self {
            reusable_download_keys: true,
            strict_session: false,
            allow_streaming: true,
        }
    }
}

/// A file in a peer's catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostedFile {
    /// Current public token. Rotates on refresh.
    pub token: String,
    /// Display name as declared by the peer.
    pub name: String,
    /// Declared size in bytes.
    pub size: u64,
}

/// Control-channel attachment state.
enum Link {
    /// The writer half of a live WebSocket session.
    Connected(mpsc::UnboundedSender<Message>),
    /// Disconnected within the grace period. Dropping the guard cancels
    /// the pending removal.
    Waiting(TaskGuard),
}

/// One registered peer.
pub struct Peer {
    id: String,
    ip: IpAddr,
    link: Mutex<Link>,
    files: Mutex<Vec<HostedFile>>,
    settings: Mutex<PeerSettings>,
    session_key: Mutex<Option<String>>,
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("ip", &self.ip)
            .field("files", &lock(&self.files).len())
            .finish_non_exhaustive()
    }
}

impl Peer {
    /// Create a peer attached to a live control channel.
    pub fn new(id: String, ip: IpAddr, tx: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            id,
            ip,
            link: Mutex::new(Link::Connected(tx)),
            files: Mutex::new(Vec::new()),
            settings: Mutex::new(PeerSettings::default()),
            session_key: Mutex::new(None),
        }
    }

    /// Internal correlation id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Client IP the control channel was opened from.
    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    /// Current settings snapshot.
    pub fn settings(&self) -> PeerSettings {
        *lock(&self.settings)
    }

    /// Apply a settings patch; absent fields are untouched.
    pub fn apply_settings(&self, patch: crate::protocol::SettingsPatch) {
        let mut settings = lock(&self.settings);
        if let Some(v) = patch.reusable_download_keys {
            settings.reusable_download_keys = v;
        }
        if let Some(v) = patch.strict_session {
            settings.strict_session = v;
        }
        if let Some(v) = patch.allow_streaming {
            settings.allow_streaming = v;
        }
    }

    /// Mint and store a fresh session restoration key, invalidating any
    /// previous one.
    pub fn mint_session_key(&self, keys: &KeysConfig) -> Result<String, TokenError> {
        let key = token::generate_secure(keys.session_key_size)?;
        *lock(&self.session_key) = Some(key.clone());
        Ok(key)
    }

    /// Whether `candidate` matches this peer's current session key.
    pub fn matches_session_key(&self, candidate: &str) -> bool {
        lock(&self.session_key)
            .as_deref()
            .is_some_and(|key| key == candidate)
    }

    /// Attach a live control channel, discarding any pending grace timer.
    pub fn attach(&self, tx: mpsc::UnboundedSender<Message>) {
        *lock(&self.link) = Link::Connected(tx);
    }

    /// Detach into the grace period; the guard's task removes the peer
    /// when it fires.
    pub fn detach(&self, grace: TaskGuard) {
        *lock(&self.link) = Link::Waiting(grace);
    }

    /// Whether the peer is disconnected and waiting for restoration.
    pub fn is_waiting(&self) -> bool {
        matches!(*lock(&self.link), Link::Waiting(_))
    }

    /// Push an envelope to the peer. Silently dropped while the peer is
    /// within its grace period.
    pub fn send(&self, envelope: &ServerEnvelope) {
        let text = match serde_json::to_string(envelope) {
            Ok(text) => text,
            Err(err) => {
                warn!(peer = %self.id, %err, "failed to encode control message");
                return;
            }
        };
        match &*lock(&self.link) {
            Link::Connected(tx) => {
                if tx.send(Message::Text(text)).is_err() {
                    debug!(peer = %self.id, "control channel writer is gone");
                }
            }
            Link::Waiting(_) => {
                debug!(peer = %self.id, "dropping message for disconnected peer");
            }
        }
    }

    /// Register declared files, minting a token each. Returns the
    /// summaries to echo back to the peer.
    pub fn accept_files(
        &self,
        declared: Vec<FileDeclaration>,
        keys: &KeysConfig,
    ) -> Result<Vec<FileSummary>, TokenError> {
        let mut summaries = Vec::with_capacity(declared.len());
        let mut files = lock(&self.files);
        for decl in declared {
            let file_token = token::generate_secure(keys.file_key_size)?;
            summaries.push(FileSummary {
                id: file_token.clone(),
                name: decl.name.clone(),
            });
            files.push(HostedFile {
                token: file_token,
                name: decl.name,
                size: decl.size,
            });
        }
        Ok(summaries)
    }

    /// Look up a hosted file by its current token.
    pub fn find_file(&self, file_token: &str) -> Option<HostedFile> {
        lock(&self.files)
            .iter()
            .find(|f| f.token == file_token)
            .cloned()
    }

    /// Withdraw a file. Returns whether it existed.
    pub fn remove_file(&self, file_token: &str) -> bool {
        let mut files = lock(&self.files);
        let before = files.len();
        files.retain(|f| f.token != file_token);
        files.len() != before
    }

    /// Rotate one file's token. Returns the old/new pair if it existed.
    pub fn rotate_file(
        &self,
        file_token: &str,
        keys: &KeysConfig,
    ) -> Result<Option<RefreshedFile>, TokenError> {
        let mut files = lock(&self.files);
        let Some(file) = files.iter_mut().find(|f| f.token == file_token) else {
            return Ok(None);
        };
        let new_token = token::generate_secure(keys.file_key_size)?;
        let old_token = std::mem::replace(&mut file.token, new_token.clone());
        Ok(Some(RefreshedFile {
            id: old_token,
            new_id: new_token,
        }))
    }

    /// Rotate every file token this peer holds.
    pub fn rotate_all_files(&self, keys: &KeysConfig) -> Result<Vec<RefreshedFile>, TokenError> {
        let mut files = lock(&self.files);
        let mut rotated = Vec::with_capacity(files.len());
        for file in files.iter_mut() {
            let new_token = token::generate_secure(keys.file_key_size)?;
            let old_token = std::mem::replace(&mut file.token, new_token.clone());
            rotated.push(RefreshedFile {
                id: old_token,
                new_id: new_token,
            });
        }
        Ok(rotated)
    }

    /// Snapshot of the catalog as sent in a restore reply.
    pub fn file_summaries(&self) -> Vec<FileSummary> {
        lock(&self.files)
            .iter()
            .map(|f| FileSummary {
                id: f.token.clone(),
                name: f.name.clone(),
            })
            .collect()
    }

    /// Number of hosted files.
    pub fn file_count(&self) -> usize {
        lock(&self.files).len()
    }
}
