//! Prometheus text-format metrics endpoint.

use crate::server::Relay;
use axum::extract::State;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// `GET /metrics`.
pub async fn handler(State(relay): State<Arc<Relay>>) -> String {
    let m = &relay.metrics;
    format!(
        "# HELP peerbeam_peers_total Peers registered since startup\n\
         # TYPE peerbeam_peers_total counter\n\
         peerbeam_peers_total {}\n\
         # HELP peerbeam_downloads_total Download transfers registered since startup\n\
         # TYPE peerbeam_downloads_total counter\n\
         peerbeam_downloads_total {}\n\
         # HELP peerbeam_streams_total Stream transfers registered since startup\n\
         # TYPE peerbeam_streams_total counter\n\
         peerbeam_streams_total {}\n\
         # HELP peerbeam_bytes_relayed_total Bytes relayed between peers\n\
         # TYPE peerbeam_bytes_relayed_total counter\n\
         peerbeam_bytes_relayed_total {}\n\
         # HELP peerbeam_rate_limit_hits_total Requests rejected by rate or quota guards\n\
         # TYPE peerbeam_rate_limit_hits_total counter\n\
         peerbeam_rate_limit_hits_total {}\n\
         # HELP peerbeam_transfer_errors_total Transfers that ended in an error\n\
         # TYPE peerbeam_transfer_errors_total counter\n\
         peerbeam_transfer_errors_total {}\n\
         # HELP peerbeam_peers_connected Currently registered peers\n\
         # TYPE peerbeam_peers_connected gauge\n\
         peerbeam_peers_connected {}\n\
         # HELP peerbeam_files_hosted Files currently hosted across peers\n\
         # TYPE peerbeam_files_hosted gauge\n\
         peerbeam_files_hosted {}\n\
         # HELP peerbeam_downloads_active In-flight download transfers\n\
         # TYPE peerbeam_downloads_active gauge\n\
         peerbeam_downloads_active {}\n\
         # HELP peerbeam_streams_active In-flight stream transfers\n\
         # TYPE peerbeam_streams_active gauge\n\
         peerbeam_streams_active {}\n\
         # HELP peerbeam_redirect_keys Outstanding redirect keys\n\
         # TYPE peerbeam_redirect_keys gauge\n\
         peerbeam_redirect_keys {}\n\
         # HELP peerbeam_quota_ips_tracked IPs with byte-quota accounting\n\
         # TYPE peerbeam_quota_ips_tracked gauge\n\
         peerbeam_quota_ips_tracked {}\n",
        m.peers_total.load(Ordering::Relaxed),
        m.downloads_total.load(Ordering::Relaxed),
        m.streams_total.load(Ordering::Relaxed),
        m.bytes_relayed.load(Ordering::Relaxed),
        m.rate_limit_hits.load(Ordering::Relaxed),
        m.errors_total.load(Ordering::Relaxed),
        relay.peers.len(),
        relay.peers.file_count(),
        relay.transfers.download_count(),
        relay.transfers.stream_count(),
        relay.transfers.key_count(),
        relay.quota.tracked(),
    )
}
