//! Periodic housekeeping.
//!
//! Most state cleans itself up through guards and expiry tasks; this loop
//! sweeps what is left: quota entries whose window elapsed, stale limiter
//! keys, and transfers stranded in a terminal state.

use crate::server::Relay;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Spawn the cleanup loop.
pub fn spawn(relay: Arc<Relay>) -> JoinHandle<()> {
    let interval = Duration::from_secs(relay.config().cleanup.interval_secs);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let quota = relay.quota.reap();
            let transfers = relay.transfers.reap();
            relay.connections.shrink();
            if quota > 0 || transfers > 0 {
                debug!(quota, transfers, "cleanup pass");
            }
        }
    })
}
