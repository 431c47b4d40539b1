//! Control-channel WebSocket sessions.
//!
//! Each peer holds one long-lived WebSocket. A dedicated writer task owns
//! the socket's sink; everything that wants to talk to the peer goes
//! through the unbounded channel stored on the [`Peer`]. The read loop
//! decodes envelopes and dispatches them, flattening `bulk` frames through
//! a work queue so nesting costs no stack.

use crate::peer::Peer;
use crate::protocol::{ClientEnvelope, ServerEnvelope, PING, PONG};
use crate::server::{Relay, RelayMetrics};
use crate::transfers::TransferKind;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// `GET /ws`: upgrade to a control channel.
pub async fn handler(
    State(relay): State<Arc<Relay>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let ip = client_ip(&headers, addr);
    if relay.connections.check(ip).is_err() {
        RelayMetrics::incr(&relay.metrics.rate_limit_hits);
        debug!(%ip, "control connection rate limited");
        return StatusCode::TOO_MANY_REQUESTS.into_response();
    }
    ws.on_upgrade(move |socket| session(relay, socket, ip))
}

/// Resolve the peer's address, trusting the first `X-Forwarded-For` entry
/// when a fronting proxy supplied one.
fn client_ip(headers: &HeaderMap, addr: SocketAddr) -> IpAddr {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or_else(|| addr.ip())
}

async fn session(relay: Arc<Relay>, socket: WebSocket, ip: IpAddr) {
    let (mut sink, mut source) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    let mut peer = match relay.register_peer(ip, tx.clone()) {
        Ok(peer) => peer,
        Err(err) => {
            warn!(%err, "failed to register peer");
            drop(tx);
            writer.abort();
            return;
        }
    };

    while let Some(frame) = source.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                if text == PING {
                    let _ = tx.send(Message::Text(PONG.to_string()));
                    continue;
                }
                match serde_json::from_str::<ClientEnvelope>(&text) {
                    Ok(envelope) => {
                        if let Some(restored) = dispatch(&relay, &peer, &tx, envelope) {
                            peer = restored;
                        }
                    }
                    Err(err) => {
                        warn!(peer = %peer.id(), %err, "unreadable control frame");
                    }
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            // Axum answers protocol pings itself; binary frames carry
            // nothing on this channel.
            Ok(_) => {}
        }
    }

    relay.peer_disconnected(peer.id());
    drop(tx);
    let _ = writer.await;
}

/// Dispatch one envelope, flattening nested `bulk` frames depth-first.
///
/// Returns the replacement peer handle when a `restore-session` swapped
/// this connection onto an older identity.
fn dispatch(
    relay: &Arc<Relay>,
    peer: &Arc<Peer>,
    tx: &mpsc::UnboundedSender<Message>,
    envelope: ClientEnvelope,
) -> Option<Arc<Peer>> {
    let mut current = Arc::clone(peer);
    let mut swapped = false;
    let mut queue = VecDeque::new();
    queue.push_back(envelope);

    while let Some(envelope) = queue.pop_front() {
        match envelope {
            ClientEnvelope::Bulk(items) => {
                for item in items.into_iter().rev() {
                    queue.push_front(item);
                }
            }
            ClientEnvelope::CreateSession => match current.mint_session_key(&relay.config().keys) {
                Ok(key) => current.send(&ServerEnvelope::NewSession(key)),
                Err(err) => warn!(peer = %current.id(), %err, "failed to mint session key"),
            },
            ClientEnvelope::RestoreSession { key } => {
                match restore(relay, &current, tx, &key) {
                    Some(restored) => {
                        current = restored;
                        swapped = true;
                    }
                    None => {
                        // Nothing to restore: hand out a fresh session
                        // so the client can start over.
                        debug!(peer = %current.id(), "session restore failed");
                        if let Ok(key) = current.mint_session_key(&relay.config().keys) {
                            current.send(&ServerEnvelope::NewSession(key));
                        }
                    }
                }
            }
            ClientEnvelope::RegisterFiles(declared) => {
                match current.accept_files(declared, &relay.config().keys) {
                    Ok(summaries) => current.send(&ServerEnvelope::RegisterFiles(summaries)),
                    Err(err) => warn!(peer = %current.id(), %err, "failed to register files"),
                }
            }
            ClientEnvelope::RefreshFiles(tokens) => {
                let mut rotated = Vec::with_capacity(tokens.len());
                for token in &tokens {
                    match current.rotate_file(token, &relay.config().keys) {
                        Ok(Some(pair)) => {
                            // The old token is dead; so are its transfers.
                            relay.transfers.cancel_for_file(token);
                            rotated.push(pair);
                        }
                        Ok(None) => debug!(peer = %current.id(), token, "refresh of unknown file"),
                        Err(err) => warn!(peer = %current.id(), %err, "failed to rotate file"),
                    }
                }
                current.send(&ServerEnvelope::RefreshFiles(rotated));
            }
            ClientEnvelope::RefreshAllFiles => {
                match current.rotate_all_files(&relay.config().keys) {
                    Ok(rotated) => {
                        for pair in &rotated {
                            relay.transfers.cancel_for_file(&pair.id);
                        }
                        current.send(&ServerEnvelope::RefreshFiles(rotated));
                    }
                    Err(err) => warn!(peer = %current.id(), %err, "failed to rotate files"),
                }
            }
            ClientEnvelope::RemoveFiles(tokens) => {
                for token in &tokens {
                    if current.remove_file(token) {
                        relay.transfers.cancel_for_file(token);
                    } else {
                        debug!(peer = %current.id(), token, "removal of unknown file");
                    }
                }
            }
            ClientEnvelope::CancelRequests(ids) => {
                for id in &ids {
                    if relay.transfers.cancel(TransferKind::Download, id).is_none() {
                        warn!(peer = %current.id(), id, "cancel of unknown download");
                    }
                }
            }
            ClientEnvelope::CancelStreams(ids) => {
                for id in &ids {
                    if relay.transfers.cancel(TransferKind::Stream, id).is_none() {
                        warn!(peer = %current.id(), id, "cancel of unknown stream");
                    }
                }
            }
            ClientEnvelope::Settings(request) => {
                current.apply_settings(request.patch);
                if let Some(id) = request.id {
                    current.send(&ServerEnvelope::Response {
                        id,
                        ok: true,
                        data: None,
                    });
                }
            }
        }
    }

    swapped.then_some(current)
}

/// Move this connection onto a disconnected peer whose session key
/// matches. The throwaway identity minted at connect time is dropped and
/// the restored peer gets a replacement key plus its current state.
fn restore(
    relay: &Arc<Relay>,
    current: &Arc<Peer>,
    tx: &mpsc::UnboundedSender<Message>,
    key: &str,
) -> Option<Arc<Peer>> {
    let restored = relay.peers.find_restorable(key)?;
    relay.drop_peer(current.id());
    restored.attach(tx.clone());

    let new_key = match restored.mint_session_key(&relay.config().keys) {
        Ok(key) => key,
        Err(err) => {
            warn!(peer = %restored.id(), %err, "failed to re-key restored session");
            return Some(restored);
        }
    };
    restored.send(&ServerEnvelope::RestoreSession {
        key: new_key,
        settings: restored.settings(),
        files: restored.file_summaries(),
    });
    debug!(peer = %restored.id(), "session restored");
    Some(restored)
}
