//! Relay coordinator and server entry point.
//!
//! [`Relay`] ties the peer registry, the transfer registry, and the rate
//! guards together and is shared as axum state. [`run`] builds it from
//! configuration, wires the router, and serves until shutdown.

use crate::cleanup;
use crate::config::Config;
use crate::error::{RelayError, TokenError};
use crate::http;
use crate::limits::{ConnectionLimits, TransferQuota};
use crate::peer::Peer;
use crate::peers::PeerRegistry;
use crate::pipe::TaskGuard;
use crate::protocol::ServerEnvelope;
use crate::token;
use crate::transfers::{TransferKind, TransferRegistry};
use axum::extract::ws::Message;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

/// Monotonic counters exposed on the metrics endpoint.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    /// Peers registered since startup.
    pub peers_total: AtomicU64,
    /// Download transfers registered since startup.
    pub downloads_total: AtomicU64,
    /// Stream transfers registered since startup.
    pub streams_total: AtomicU64,
    /// Bytes relayed between uploaders and downloaders.
    pub bytes_relayed: AtomicU64,
    /// Requests rejected by a rate or quota guard.
    pub rate_limit_hits: AtomicU64,
    /// Transfers that ended in an error state.
    pub errors_total: AtomicU64,
}

impl RelayMetrics {
    /// Bump a counter.
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Add to a counter.
    pub fn add(counter: &AtomicU64, amount: u64) {
        counter.fetch_add(amount, Ordering::Relaxed);
    }
}

/// Shared relay state.
pub struct Relay {
    config: Config,
    /// Registered peers.
    pub peers: PeerRegistry,
    /// In-flight transfers and redirect keys.
    pub transfers: TransferRegistry,
    /// Per-IP transferred-byte quota.
    pub quota: TransferQuota,
    /// Per-IP control-connection limiter.
    pub connections: ConnectionLimits,
    /// Counters for the metrics endpoint.
    pub metrics: RelayMetrics,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("peers", &self.peers.len())
            .field("downloads", &self.transfers.download_count())
            .field("streams", &self.transfers.stream_count())
            .finish_non_exhaustive()
    }
}

impl Relay {
    /// Build the relay from configuration.
    pub fn new(config: Config) -> Arc<Self> {
        let transfers = TransferRegistry::new(config.keys.clone(), config.server.internal_id_size);
        let quota = TransferQuota::new(
            config.limits.transfer_limit_bytes,
            Duration::from_secs(config.limits.transfer_limit_reset_secs),
        );
        let connections = ConnectionLimits::new(&config.limits);
        Arc::new(Self {
            config,
            peers: PeerRegistry::new(),
            transfers,
            quota,
            connections,
            metrics: RelayMetrics::default(),
        })
    }

    /// Server configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Register a freshly connected peer.
    pub fn register_peer(
        &self,
        ip: IpAddr,
        tx: mpsc::UnboundedSender<Message>,
    ) -> Result<Arc<Peer>, TokenError> {
        let id = token::generate(self.config.server.internal_id_size)?;
        let peer = Arc::new(Peer::new(id, ip, tx));
        self.peers.insert(Arc::clone(&peer));
        RelayMetrics::incr(&self.metrics.peers_total);
        info!(peer = %peer.id(), %ip, "peer registered");
        Ok(peer)
    }

    /// Remove a peer for good: its files become unreachable and every
    /// transfer it hosts is reset.
    pub fn drop_peer(&self, peer_id: &str) {
        let (downloads, streams) = self.transfers.cancel_for_peer(peer_id);
        if !downloads.is_empty() || !streams.is_empty() {
            debug!(
                peer = peer_id,
                downloads = downloads.len(),
                streams = streams.len(),
                "cancelled transfers of departing peer"
            );
        }
        if self.peers.remove(peer_id).is_some() {
            info!(peer = peer_id, "peer removed");
        }
    }

    /// Handle a control-channel disconnect.
    ///
    /// Strict-session peers are dropped immediately. Everyone else gets
    /// the configured grace period to redeem their session key; the timer
    /// is cancelled by a successful restore.
    pub fn peer_disconnected(self: &Arc<Self>, peer_id: &str) {
        let Some(peer) = self.peers.get(peer_id) else {
            return;
        };
        if peer.settings().strict_session {
            self.drop_peer(peer_id);
            return;
        }
        let grace = Duration::from_secs(self.config.limits.disconnect_grace_secs);
        let relay = Arc::clone(self);
        let id = peer_id.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            debug!(peer = %id, "grace period elapsed");
            relay.drop_peer(&id);
        });
        peer.detach(TaskGuard::new(timer.abort_handle()));
        debug!(peer = peer_id, grace_secs = grace.as_secs(), "peer detached");
    }

    /// Watch the downloader side of a transfer.
    ///
    /// The receiver fires when the HTTP stack drops the response body. If
    /// the transfer has not already ended, the downloader walked away: the
    /// transfer is torn down and the hosting peer is told.
    pub fn watch_downloader(
        self: &Arc<Self>,
        kind: TransferKind,
        transfer_id: String,
        closed: oneshot::Receiver<()>,
    ) {
        let relay = Arc::clone(self);
        tokio::spawn(async move {
            let _ = closed.await;
            let Some(transfer) = relay.transfers.downloader_gone(kind, &transfer_id) else {
                return;
            };
            debug!(transfer = %transfer_id, "downloader disconnected");
            if let Some(peer) = relay.peers.get(transfer.peer_id()) {
                let envelope = match kind {
                    TransferKind::Download => ServerEnvelope::DownloadCancelled(transfer_id),
                    TransferKind::Stream => ServerEnvelope::StreamCancelled(transfer_id),
                };
                peer.send(&envelope);
            }
        });
    }

    /// Tell a peer its quota tripped, with the time left until the window
    /// resets.
    pub fn notify_rate_limited(&self, peer_id: &str, provider_ip: IpAddr) {
        RelayMetrics::incr(&self.metrics.rate_limit_hits);
        let Some(peer) = self.peers.get(peer_id) else {
            return;
        };
        let remaining_ms = self
            .quota
            .remaining_window(provider_ip)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        peer.send(&ServerEnvelope::RateLimited { remaining_ms });
    }
}

/// Run the relay server until the process is stopped.
pub async fn run(config: Config) -> Result<(), RelayError> {
    let bind_address = config.server.bind_address.clone();
    let relay = Relay::new(config);

    if relay.config().cleanup.enabled {
        cleanup::spawn(Arc::clone(&relay));
    }

    let app = http::router(Arc::clone(&relay));
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    info!(%bind_address, "relay listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const IP: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn relay() -> Arc<Relay> {
        Relay::new(Config::default())
    }

    fn channel() -> mpsc::UnboundedSender<Message> {
        mpsc::unbounded_channel().0
    }

    #[tokio::test]
    async fn registers_and_drops_peers() {
        let relay = relay();
        let peer = relay.register_peer(IP, channel()).unwrap();
        assert_eq!(relay.peers.len(), 1);
        assert_eq!(relay.metrics.peers_total.load(Ordering::Relaxed), 1);

        relay.drop_peer(peer.id());
        assert!(relay.peers.is_empty());
    }

    #[tokio::test]
    async fn dropping_a_peer_resets_its_transfers() {
        let relay = relay();
        let peer = relay.register_peer(IP, channel()).unwrap();
        let (transfer, _body, _closed) = relay
            .transfers
            .register(TransferKind::Download, peer.id(), "f1", IP, 10)
            .unwrap();

        relay.drop_peer(peer.id());
        assert_eq!(transfer.status(), crate::pipe::TransferStatus::Cancelled);
        assert_eq!(relay.transfers.download_count(), 0);
    }

    #[tokio::test]
    async fn strict_session_peers_are_dropped_immediately() {
        let relay = relay();
        let peer = relay.register_peer(IP, channel()).unwrap();
        peer.apply_settings(crate::protocol::SettingsPatch {
            strict_session: Some(true),
            ..Default::default()
        });

        relay.peer_disconnected(peer.id());
        assert!(relay.peers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn grace_period_keeps_the_peer_until_it_elapses() {
        let relay = relay();
        let peer = relay.register_peer(IP, channel()).unwrap();

        relay.peer_disconnected(peer.id());
        assert_eq!(relay.peers.len(), 1);
        assert!(peer.is_waiting());

        tokio::time::sleep(Duration::from_secs(31)).await;
        tokio::task::yield_now().await;
        assert!(relay.peers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reattaching_cancels_the_grace_timer() {
        let relay = relay();
        let peer = relay.register_peer(IP, channel()).unwrap();

        relay.peer_disconnected(peer.id());
        peer.attach(channel());

        tokio::time::sleep(Duration::from_secs(120)).await;
        tokio::task::yield_now().await;
        assert_eq!(relay.peers.len(), 1);
    }

    #[tokio::test]
    async fn watcher_notifies_the_peer_when_the_downloader_leaves() {
        let relay = relay();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let peer = relay.register_peer(IP, tx).unwrap();
        let (transfer, body, closed) = relay
            .transfers
            .register(TransferKind::Download, peer.id(), "f1", IP, 10)
            .unwrap();

        relay.watch_downloader(TransferKind::Download, transfer.id().to_string(), closed);
        drop(body);

        let msg = rx.recv().await.unwrap();
        match msg {
            Message::Text(text) => assert!(text.contains("download-cancelled")),
            other => panic!("expected text frame, got {other:?}"),
        }
        assert_eq!(relay.transfers.download_count(), 0);
    }

    #[tokio::test]
    async fn watcher_is_silent_after_a_finished_transfer() {
        let relay = relay();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let peer = relay.register_peer(IP, tx).unwrap();
        let (transfer, body, closed) = relay
            .transfers
            .register(TransferKind::Download, peer.id(), "f1", IP, 0)
            .unwrap();

        // The transfer ends before the body is dropped.
        relay
            .transfers
            .discard(TransferKind::Download, transfer.id());
        relay.watch_downloader(TransferKind::Download, transfer.id().to_string(), closed);
        drop(body);

        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }
}
