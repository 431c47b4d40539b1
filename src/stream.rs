//! Stream routes.
//!
//! Streams serve byte ranges for media playback. Unlike download keys, a
//! stream key survives redemption: a scrubbing player re-requests the same
//! redirect URL with different `Range` headers until the key expires. Every
//! response is capped to the configured media chunk size.

use crate::download::finish_upload;
use crate::protocol::ServerEnvelope;
use crate::range::{default_range, parse_byte_range};
use crate::server::{Relay, RelayMetrics};
use crate::transfers::TransferKind;
use axum::body::Body;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, info};

/// `GET /stream/{token}`: mint a stream key and redirect to it.
///
/// Media elements follow redirects transparently, so the player ends up
/// issuing its ranged requests against the keyed URL.
pub async fn request(
    State(relay): State<Arc<Relay>>,
    Path(file_token): Path<String>,
) -> Response {
    let Some((peer, _)) = relay.peers.resolve_file(&file_token) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if !peer.settings().allow_streaming {
        return StatusCode::FORBIDDEN.into_response();
    }
    let key = match relay.transfers.create_stream_key(&file_token) {
        Ok(key) => key,
        Err(err) => {
            debug!(%err, "failed to mint stream key");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    Response::builder()
        .status(StatusCode::FOUND)
        .header(header::LOCATION, format!("/stream/{file_token}/{key}"))
        .body(Body::empty())
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// `GET /stream/{token}/{key}`: serve one chunk of the file.
pub async fn fetch(
    State(relay): State<Arc<Relay>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path((file_token, key)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    if !relay.transfers.check_stream_key(&key, &file_token) {
        return StatusCode::GONE.into_response();
    }
    let Some((peer, file)) = relay.peers.resolve_file(&file_token) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if !peer.settings().allow_streaming {
        return StatusCode::FORBIDDEN.into_response();
    }

    if relay.quota.check(peer.ip()) {
        RelayMetrics::incr(&relay.metrics.rate_limit_hits);
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }

    let chunk = relay.config().server.media_chunk_size;
    let range_header = headers
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok());
    let range = match range_header {
        Some(value) => parse_byte_range(value, file.size, chunk),
        None => default_range(file.size, chunk),
    };
    let Some((start, end)) = range else {
        return StatusCode::RANGE_NOT_SATISFIABLE.into_response();
    };
    let length = end - start + 1;

    let (transfer, body, closed) = match relay.transfers.register(
        TransferKind::Stream,
        peer.id(),
        &file_token,
        peer.ip(),
        length,
    ) {
        Ok(parts) => parts,
        Err(err) => {
            debug!(%err, "failed to register stream");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };
    RelayMetrics::incr(&relay.metrics.streams_total);
    relay.watch_downloader(TransferKind::Stream, transfer.id().to_string(), closed);

    peer.send(&ServerEnvelope::StreamRequest {
        stream_key: key,
        stream_id: transfer.id().to_string(),
        file_id: file_token.clone(),
        range: [start, end],
    });
    info!(
        transfer = %transfer.id(),
        file = %file_token,
        requester = %addr.ip(),
        start,
        end,
        "stream started"
    );

    // Partial status only when the client actually asked for a range.
    let mut builder = Response::builder()
        .header(
            header::CONTENT_TYPE,
            mime_guess::from_path(&file.name)
                .first_or_octet_stream()
                .as_ref(),
        )
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_LENGTH, length);
    builder = if range_header.is_some() {
        builder.status(StatusCode::PARTIAL_CONTENT).header(
            header::CONTENT_RANGE,
            format!("bytes {start}-{end}/{}", file.size),
        )
    } else {
        builder.status(StatusCode::OK)
    };
    builder
        .body(Body::from_stream(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// `POST /stream/{token}/{transfer}`: peer-side upload of one chunk.
///
/// A missing transfer answers 204 rather than an error: scrubbing players
/// abandon chunks constantly and the peer's upload often loses that race.
pub async fn upload(
    State(relay): State<Arc<Relay>>,
    Path((file_token, transfer_id)): Path<(String, String)>,
    body: Body,
) -> Response {
    let Some(transfer) = relay.transfers.get(TransferKind::Stream, &transfer_id) else {
        return StatusCode::NO_CONTENT.into_response();
    };
    if transfer.file_token() != file_token {
        return StatusCode::BAD_REQUEST.into_response();
    }

    let result = relay
        .transfers
        .accept_upload(
            TransferKind::Stream,
            &transfer_id,
            body.into_data_stream(),
            &relay.quota,
        )
        .await;

    finish_upload(&relay, &transfer, result)
}
