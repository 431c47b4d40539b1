//! Download routes.
//!
//! Fetching a file is a two-step redirect dance: `GET /file/{token}` mints
//! a one-time download key and redirects to `GET /file/{token}/{key}`,
//! which redeems the key, registers the transfer, and holds the response
//! open until the hosting peer has pushed every byte. The peer uploads via
//! `POST /file/{token}/{transfer}`.

use crate::pipe::UploadOutcome;
use crate::protocol::ServerEnvelope;
use crate::server::{Relay, RelayMetrics};
use crate::transfers::{AcceptUpload, TransferKind};
use axum::body::Body;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Longest filename emitted in a Content-Disposition header.
const MAX_FILENAME_LEN: usize = 100;

/// Reduce a declared filename to a header-safe form.
///
/// Whitespace runs collapse to a single underscore, anything outside
/// `[A-Za-z0-9_.-]` is dropped, leading dots are stripped, and the result
/// is capped. A name with nothing left falls back to a digest of the
/// original so two different names stay distinguishable.
pub fn serialize_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len().min(MAX_FILENAME_LEN));
    let mut pending_space = false;
    for c in name.chars() {
        if c.is_whitespace() {
            pending_space = !out.is_empty();
            continue;
        }
        if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
            if pending_space {
                out.push('_');
                pending_space = false;
            }
            out.push(c);
        }
    }
    let trimmed = out.trim_start_matches('.');
    let capped: String = trimmed.chars().take(MAX_FILENAME_LEN).collect();
    if capped.is_empty() {
        let digest = Sha256::digest(name.as_bytes());
        return hex::encode(&digest[..8]);
    }
    capped
}

/// `GET /file/{token}`: mint a one-time key and redirect to it.
pub async fn request(
    State(relay): State<Arc<Relay>>,
    Path(file_token): Path<String>,
) -> Response {
    if relay.peers.resolve_file(&file_token).is_none() {
        return StatusCode::NOT_FOUND.into_response();
    }
    let key = match relay.transfers.create_download_key(&file_token) {
        Ok(key) => key,
        Err(err) => {
            debug!(%err, "failed to mint download key");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    Redirect::to(&format!("/file/{file_token}/{key}")).into_response()
}

/// `GET /file/{token}/{key}`: redeem the key and relay the file.
pub async fn fetch(
    State(relay): State<Arc<Relay>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path((file_token, key)): Path<(String, String)>,
) -> Response {
    // At most one request ever gets the token back; replays are gone.
    match relay.transfers.consume_download_key(&key) {
        Some(bound) if bound == file_token => {}
        _ => return StatusCode::GONE.into_response(),
    }
    let Some((peer, file)) = relay.peers.resolve_file(&file_token) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    // Quota is charged to the hosting side; an over-limit peer serves
    // nobody until its window resets.
    if relay.quota.check(peer.ip()) {
        RelayMetrics::incr(&relay.metrics.rate_limit_hits);
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }

    let (transfer, body, closed) = match relay.transfers.register(
        TransferKind::Download,
        peer.id(),
        &file_token,
        peer.ip(),
        file.size,
    ) {
        Ok(parts) => parts,
        Err(err) => {
            debug!(%err, "failed to register download");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    RelayMetrics::incr(&relay.metrics.downloads_total);
    relay.watch_downloader(TransferKind::Download, transfer.id().to_string(), closed);

    peer.send(&ServerEnvelope::FileRequest {
        download_id: transfer.id().to_string(),
        file_id: file_token.clone(),
    });
    info!(
        transfer = %transfer.id(),
        file = %file_token,
        requester = %addr.ip(),
        "download started"
    );

    // Single-use tokens rotate as soon as their key is redeemed.
    if !peer.settings().reusable_download_keys {
        match peer.rotate_file(&file_token, &relay.config().keys) {
            Ok(Some(pair)) => peer.send(&ServerEnvelope::RefreshFiles(vec![pair])),
            Ok(None) => {}
            Err(err) => debug!(%err, "failed to rotate file token"),
        }
    }

    Response::builder()
        .status(StatusCode::OK)
        .header(
            header::CONTENT_TYPE,
            mime_guess::from_path(&file.name)
                .first_or_octet_stream()
                .as_ref(),
        )
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", serialize_filename(&file.name)),
        )
        .body(Body::from_stream(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// `POST /file/{token}/{transfer}`: peer-side upload connection.
pub async fn upload(
    State(relay): State<Arc<Relay>>,
    Path((file_token, transfer_id)): Path<(String, String)>,
    body: Body,
) -> Response {
    let Some(transfer) = relay.transfers.get(TransferKind::Download, &transfer_id) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    if transfer.file_token() != file_token {
        return StatusCode::BAD_REQUEST.into_response();
    }

    let result = relay
        .transfers
        .accept_upload(
            TransferKind::Download,
            &transfer_id,
            body.into_data_stream(),
            &relay.quota,
        )
        .await;

    finish_upload(&relay, &transfer, result)
}

/// Map an upload result onto a response, updating metrics and notifying
/// the hosting peer where needed. Shared with the stream routes.
pub fn finish_upload(
    relay: &Arc<Relay>,
    transfer: &crate::transfers::Transfer,
    result: AcceptUpload,
) -> Response {
    let (outcome, relayed) = match result {
        AcceptUpload::Done { outcome, relayed } => (outcome, relayed),
        AcceptUpload::AlreadyActive => {
            warn!(transfer = %transfer.id(), "second upload for an active transfer");
            return StatusCode::BAD_REQUEST.into_response();
        }
        AcceptUpload::NotFound => return StatusCode::BAD_REQUEST.into_response(),
    };
    RelayMetrics::add(&relay.metrics.bytes_relayed, relayed);

    match outcome {
        UploadOutcome::Finished => {
            info!(transfer = %transfer.id(), relayed, "transfer finished");
            StatusCode::OK.into_response()
        }
        UploadOutcome::Paused => {
            debug!(transfer = %transfer.id(), relayed, "transfer paused");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
        UploadOutcome::Errored => {
            RelayMetrics::incr(&relay.metrics.errors_total);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
        UploadOutcome::DownloaderGone => {
            RelayMetrics::incr(&relay.metrics.errors_total);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
        UploadOutcome::Cancelled => StatusCode::GONE.into_response(),
        UploadOutcome::QuotaExceeded => {
            relay.notify_rate_limited(transfer.peer_id(), transfer.provider_ip());
            StatusCode::TOO_MANY_REQUESTS.into_response()
        }
    }
}
