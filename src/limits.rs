//! Rate limiting for peerbeam.
//!
//! Two independent guards:
//! - [`TransferQuota`] accounts relayed bytes per client IP within a rolling
//!   reset window. Exceeding it aborts the offending transfer.
//! - [`ConnectionLimits`] caps control-connection attempts per IP using the
//!   governor crate's keyed rate limiters backed by DashMap.

use crate::config::LimitsConfig;
use dashmap::DashMap;
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-IP byte accounting entry.
#[derive(Debug, Clone, Copy)]
struct QuotaEntry {
    bytes: u64,
    window_start: Instant,
}

/// Per-IP transferred-byte quota with a rolling reset window.
///
/// Entries reset lazily once the window has elapsed; [`TransferQuota::reap`]
/// removes stale entries so the map stays bounded.
pub struct TransferQuota {
    entries: DashMap<IpAddr, QuotaEntry>,
    limit: u64,
    window: Duration,
}

impl std::fmt::Debug for TransferQuota {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferQuota")
            .field("limit", &self.limit)
            .field("window", &self.window)
            .field("tracked", &self.entries.len())
            .finish()
    }
}

impl TransferQuota {
    /// Create a quota guard.
    pub fn new(limit: u64, window: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            limit,
            window,
        }
    }

    /// Account `amount` transferred bytes against `ip` and report whether
    /// the IP is now over its quota.
    pub fn record(&self, ip: IpAddr, amount: u64) -> bool {
        let now = Instant::now();
        let mut entry = self.entries.entry(ip).or_insert(QuotaEntry {
            bytes: 0,
            window_start: now,
        });

        if now.duration_since(entry.window_start) > self.window {
            entry.bytes = 0;
            entry.window_start = now;
        }

        entry.bytes = entry.bytes.saturating_add(amount);
        entry.bytes > self.limit
    }

    /// Check whether `ip` is currently over its quota, resetting lazily if
    /// the window has elapsed.
    pub fn check(&self, ip: IpAddr) -> bool {
        let Some(entry) = self.entries.get(&ip).map(|e| *e) else {
            return false;
        };

        if entry.window_start.elapsed() > self.window {
            self.entries.remove(&ip);
            return false;
        }

        entry.bytes > self.limit
    }

    /// Time until the current window for `ip` resets, if it is tracked.
    pub fn remaining_window(&self, ip: IpAddr) -> Option<Duration> {
        let entry = self.entries.get(&ip).map(|e| *e)?;
        self.window.checked_sub(entry.window_start.elapsed())
    }

    /// Remove entries whose window has elapsed. Returns how many were
    /// removed.
    pub fn reap(&self) -> usize {
        let before = self.entries.len();
        let window = self.window;
        self.entries
            .retain(|_, entry| entry.window_start.elapsed() <= window);
        before - self.entries.len()
    }

    /// Number of IPs currently tracked.
    pub fn tracked(&self) -> usize {
        self.entries.len()
    }
}

/// Type alias for a keyed rate limiter using DashMap.
type KeyedLimiter<K> = RateLimiter<
    K,
    DashMap<K, InMemoryState>,
    DefaultClock,
    NoOpMiddleware<governor::clock::QuantaInstant>,
>;

/// Control-connection attempt limiter, keyed by client IP.
#[derive(Clone)]
pub struct ConnectionLimits {
    limiter: Arc<KeyedLimiter<IpAddr>>,
}

impl std::fmt::Debug for ConnectionLimits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionLimits")
            .field("limiter", &"KeyedLimiter<IpAddr>")
            .finish()
    }
}

impl ConnectionLimits {
    /// Create the limiter from configuration.
    ///
    /// # Panics
    ///
    /// Panics if `connections_per_minute` is zero.
    pub fn new(config: &LimitsConfig) -> Self {
        let per_minute = NonZeroU32::new(config.connections_per_minute)
            .expect("connections_per_minute must be > 0");
        Self {
            limiter: Arc::new(RateLimiter::keyed(Quota::per_minute(per_minute))),
        }
    }

    /// Check whether a connection attempt from `ip` is allowed.
    pub fn check(&self, ip: IpAddr) -> Result<(), RateLimitError> {
        self.limiter
            .check_key(&ip)
            .map_err(|_| RateLimitError::ConnectionLimitExceeded)
    }

    /// Number of tracked keys (for metrics).
    pub fn tracked(&self) -> usize {
        self.limiter.len()
    }

    /// Evict stale entries from the keyed limiter. Idle clients leave
    /// entries behind; call periodically from the cleanup task.
    pub fn shrink(&self) {
        self.limiter.retain_recent();
    }
}

/// Rate limit error types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    /// Too many connection attempts from this IP.
    ConnectionLimitExceeded,
}

impl std::fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionLimitExceeded => write!(f, "connection rate limit exceeded"),
        }
    }
}

impl std::error::Error for RateLimitError {}
