//! Per-host bandwidth throttling.
//!
//! Implements a token bucket measured in bytes. Every fetcher targeting the
//! same host shares one bucket, so aggregate throughput respects the ceiling
//! no matter how many fragments are in flight.
//!
//! `acquire` reserves tokens under a short `parking_lot` critical section and
//! sleeps *after* releasing the lock. The bucket may go into debt: each caller
//! is told how long to wait until its reservation is covered, so waiters are
//! released in the order they reserved.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::trace;

/// Throttle configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Default ceiling per host in bytes per second. `None` = unlimited.
    pub rate_limit_bytes_per_sec: Option<u64>,
    /// Bucket capacity in bytes. Defaults to a tenth of the rate (at least 16 KiB).
    pub burst_bytes: Option<u64>,
    /// Host-specific ceilings that override the default.
    pub per_host: BTreeMap<String, u64>,
}

impl ThrottleConfig {
    pub fn limited(bytes_per_sec: u64) -> Self {
        Self {
            rate_limit_bytes_per_sec: Some(bytes_per_sec),
            ..Default::default()
        }
    }

    fn rate_for(&self, host: &str) -> Option<u64> {
        self.per_host
            .get(host)
            .copied()
            .or(self.rate_limit_bytes_per_sec)
            .filter(|rate| *rate > 0)
    }

    fn burst_for(&self, rate: u64) -> u64 {
        self.burst_bytes.unwrap_or_else(|| (rate / 10).max(16 * 1024))
    }
}

/// Token bucket state for one host.
#[derive(Debug)]
struct TokenBucket {
    /// Bytes per second.
    rate: f64,
    capacity: f64,
    /// Available tokens. Negative while reservations are outstanding.
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(rate: u64, capacity: u64, now: Instant) -> Self {
        Self {
            rate: rate as f64,
            capacity: capacity as f64,
            tokens: capacity as f64,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Reserve `bytes` and return how long the caller must wait before using them.
    fn reserve(&mut self, bytes: u64, now: Instant) -> Duration {
        self.refill(now);
        self.tokens -= bytes as f64;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.rate)
        }
    }
}

#[derive(Debug)]
struct ThrottleInner {
    config: ThrottleConfig,
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

/// Shared, reference-counted rate limiter handle.
///
/// Cloning is cheap; clones share bucket state. Independent instances never
/// interfere with each other, which keeps tests isolated.
#[derive(Debug, Clone)]
pub struct Throttle {
    inner: Arc<ThrottleInner>,
}

impl Throttle {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            inner: Arc::new(ThrottleInner {
                config,
                buckets: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(ThrottleConfig::default())
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.inner.config
    }

    /// Whether any limit applies to `host`.
    pub fn is_limited(&self, host: &str) -> bool {
        self.inner.config.rate_for(host).is_some()
    }

    /// Block until `byte_count` bytes may be transferred from `host`.
    ///
    /// Returns the time spent waiting. Cancel-safe: the lock is never held
    /// across the sleep. A dropped future still consumes its reservation.
    pub async fn acquire(&self, host: &str, byte_count: u64) -> Duration {
        let wait = self.reserve(host, byte_count);
        if !wait.is_zero() {
            trace!(host, byte_count, wait_ms = wait.as_millis() as u64, "throttled");
            tokio::time::sleep(wait).await;
        }
        wait
    }

    fn reserve(&self, host: &str, byte_count: u64) -> Duration {
        let Some(rate) = self.inner.config.rate_for(host) else {
            return Duration::ZERO;
        };
        let now = Instant::now();
        let mut buckets = self.inner.buckets.lock();
        let bucket = buckets.entry(host.to_string()).or_insert_with(|| {
            TokenBucket::new(rate, self.inner.config.burst_for(rate), now)
        });
        bucket.reserve(byte_count, now)
    }
}

impl Default for Throttle {
    fn default() -> Self {
        Self::unlimited()
    }
}
