//! Per-sender sliding-window rate limiter. Timestamps are evicted lazily on
//! each check; there is no background sweep.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

/// Snapshot of the configured limits, for the status readout.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct RateLimitSnapshot {
    pub max_per_window: usize,
    pub window_secs: u64,
    pub active_senders: usize,
}

pub struct RateLimiter {
    max_per_window: usize,
    window: Duration,
    buckets: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(max_per_window: usize, window: Duration) -> Self {
        Self {
            max_per_window,
            window,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Record one attempt for `sender` and report whether it is within the
    /// window budget. Expired entries for that sender are dropped first.
    pub fn check(&self, sender: &str, now: Instant) -> bool {
        let mut buckets = self.buckets.lock().expect("rate limiter lock poisoned");
        let bucket = buckets.entry(sender.to_string()).or_default();
        while let Some(oldest) = bucket.front() {
            if now.duration_since(*oldest) >= self.window {
                bucket.pop_front();
            } else {
                break;
            }
        }
        if bucket.len() >= self.max_per_window {
            tracing::debug!(sender, "rate limit exceeded");
            return false;
        }
        bucket.push_back(now);
        true
    }

    pub fn snapshot(&self) -> RateLimitSnapshot {
        let buckets = self.buckets.lock().expect("rate limiter lock poisoned");
        RateLimitSnapshot {
            max_per_window: self.max_per_window,
            window_secs: self.window.as_secs(),
            active_senders: buckets.len(),
        }
    }
}
