//! Per-key sliding-window rate limiter for the `/api/v1` surface.
//!
//! Each API key keeps the timestamps of its requests inside the window;
//! a request is allowed while the count is below the limit. Time is
//! passed in milliseconds so tests control the clock; the middleware
//! layer feeds wall-clock time.

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window_ms: u64,
}

impl RateLimitConfig {
    pub fn per_minute(max_requests: u32) -> Self {
        Self {
            max_requests,
            window_ms: 60_000,
        }
    }
}

/// Outcome of a rate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    /// Rejected; retry after this many milliseconds.
    Limited { retry_after_ms: u64 },
}

pub struct SlidingWindowLimiter {
    config: RateLimitConfig,
    hits: RwLock<HashMap<String, VecDeque<u64>>>,
}

impl SlidingWindowLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            hits: RwLock::new(HashMap::new()),
        }
    }

    /// Record a request at `now_ms` and decide whether it is allowed.
    pub fn check(&self, key: &str, now_ms: u64) -> RateDecision {
        let mut hits = self.hits.write();
        let window = hits.entry(key.to_string()).or_default();

        let window_start = now_ms.saturating_sub(self.config.window_ms);
        while matches!(window.front(), Some(&t) if t <= window_start) {
            window.pop_front();
        }

        if window.len() < self.config.max_requests as usize {
            window.push_back(now_ms);
            return RateDecision::Allowed;
        }

        // the oldest hit leaving the window frees a slot
        let retry_after_ms = window
            .front()
            .map(|&oldest| (oldest + self.config.window_ms).saturating_sub(now_ms))
            .unwrap_or(self.config.window_ms);
        RateDecision::Limited { retry_after_ms }
    }

    /// Drop windows with no recent hits. Called opportunistically; the
    /// limiter stays correct without it.
    pub fn prune(&self, now_ms: u64) {
        let window_start = now_ms.saturating_sub(self.config.window_ms);
        self.hits
            .write()
            .retain(|_, window| matches!(window.back(), Some(&t) if t > window_start));
    }
}
