//! Health endpoint.

use crate::server::Relay;
use axum::extract::State;
use axum::Json;
use serde::Serialize;
use std::sync::Arc;

/// Health snapshot.
#[derive(Debug, Serialize)]
pub struct Health {
    /// Always "ok" while the process answers.
    pub status: &'static str,
    /// Registered peers.
    pub peers: usize,
    /// Hosted files across all peers.
    pub files: usize,
    /// In-flight downloads.
    pub downloads: usize,
    /// In-flight streams.
    pub streams: usize,
}

/// `GET /health`.
pub async fn handler(State(relay): State<Arc<Relay>>) -> Json<Health> {
    Json(Health {
        status: "ok",
        peers: relay.peers.len(),
        files: relay.peers.file_count(),
        downloads: relay.transfers.download_count(),
        streams: relay.transfers.stream_count(),
    })
}
