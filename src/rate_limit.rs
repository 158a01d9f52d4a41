//! Per-sender token-bucket admission control.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::{DashMap, mapref::entry::Entry};
use tracing::{debug, warn};

use crate::config::RateLimitConfig;
use crate::metrics::rate_limit as rate_limit_metrics;

const CLEANUP_EVERY_REQUESTS: u64 = 512;

/// A single sender's bucket.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    capacity: f64,
    /// Tokens per second.
    refill_rate: f64,
}

impl TokenBucket {
    fn full(capacity: f64, refill_rate: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
            capacity,
            refill_rate,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }

    fn try_take(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Whether the bucket has refilled to capacity, i.e. is indistinguishable from a fresh one.
    fn is_refilled(&self, now: Instant) -> bool {
        if self.refill_rate <= 0.0 {
            return false;
        }
        let missing = self.capacity - self.tokens;
        let refill_time = Duration::from_secs_f64((missing / self.refill_rate).max(0.0));
        now.saturating_duration_since(self.last_refill) >= refill_time
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }
}

/// Token buckets keyed by sender. Each bucket is mutated under its
/// DashMap entry lock.
pub struct RateLimiter {
    capacity: f64,
    refill_rate: f64,
    buckets: DashMap<String, TokenBucket>,
    requests_seen: AtomicU64,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        if config.burst == 0 {
            warn!("Rate limit burst is zero; every message will be rejected");
        }
        Self {
            capacity: f64::from(config.burst),
            refill_rate: f64::from(config.per_minute) / 60.0,
            buckets: DashMap::new(),
            requests_seen: AtomicU64::new(0),
        }
    }

    /// Consume one token for `sender`. Returns `false` when the bucket is empty.
    pub fn allow(&self, sender: &str) -> bool {
        self.allow_at(sender, Instant::now())
    }

    pub fn allow_at(&self, sender: &str, now: Instant) -> bool {
        let allowed = match self.buckets.entry(sender.to_string()) {
            Entry::Occupied(mut occupied) => occupied.get_mut().try_take(now),
            Entry::Vacant(vacant) => {
                let mut bucket = TokenBucket::full(self.capacity, self.refill_rate, now);
                let allowed = bucket.try_take(now);
                vacant.insert(bucket);
                allowed
            }
        };

        if !allowed {
            metrics::counter!(rate_limit_metrics::REJECTIONS_TOTAL).increment(1);
            debug!(sender, "Rate limit exceeded");
        }

        self.cleanup_if_needed(now);
        allowed
    }

    /// Tokens currently available to `sender`, after refill. Unknown senders have a full bucket.
    pub fn remaining(&self, sender: &str) -> f64 {
        let now = Instant::now();
        match self.buckets.get_mut(sender) {
            Some(mut bucket) => {
                bucket.refill(now);
                bucket.tokens()
            }
            None => self.capacity,
        }
    }

    /// Drop buckets that have fully refilled. Returns how many were removed.
    pub fn prune(&self, now: Instant) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| !bucket.is_refilled(now));
        before.saturating_sub(self.buckets.len())
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    fn cleanup_if_needed(&self, now: Instant) {
        let seen = self.requests_seen.fetch_add(1, Ordering::Relaxed) + 1;
        if seen % CLEANUP_EVERY_REQUESTS == 0 {
            self.prune(now);
        }
    }
}
