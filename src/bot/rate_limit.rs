//! Per-sender sliding-window rate limiting.
//!
//! Each sender keeps the timestamps of its admitted requests inside the trailing
//! window. A request is admitted while fewer than `max_requests` remain after pruning;
//! a refused request records nothing, so hammering the bot does not extend the
//! lock-out. Pruning is lazy, and [`RateLimiter::forget_idle`] evicts senders whose
//! window has emptied.

use chrono::{DateTime, Duration, Utc};
use log::trace;
use std::collections::{HashMap, VecDeque};

pub const DEFAULT_WINDOW_SECS: u64 = 360;
pub const DEFAULT_MAX_REQUESTS: usize = 3;

#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    max_requests: usize,
    entries: HashMap<String, VecDeque<DateTime<Utc>>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(std::time::Duration::from_secs(DEFAULT_WINDOW_SECS), DEFAULT_MAX_REQUESTS)
    }
}

impl RateLimiter {
    pub fn new(window: std::time::Duration, max_requests: usize) -> Self {
        Self {
            window: Duration::from_std(window).unwrap_or(Duration::seconds(DEFAULT_WINDOW_SECS as i64)),
            max_requests,
            entries: HashMap::new(),
        }
    }

    /// Record a request from `sender` at `now` if the quota allows it.
    pub fn admit(&mut self, sender: &str, now: DateTime<Utc>) -> bool {
        let window = self.window;
        let stamps = self.entries.entry(sender.to_string()).or_default();
        while stamps.front().is_some_and(|t| now - *t >= window) {
            stamps.pop_front();
        }
        if stamps.len() >= self.max_requests {
            trace!("{} over quota ({} in window)", sender, stamps.len());
            return false;
        }
        stamps.push_back(now);
        true
    }

    /// Requests from `sender` still inside the window at `now`.
    pub fn recent(&self, sender: &str, now: DateTime<Utc>) -> usize {
        self.entries
            .get(sender)
            .map(|s| s.iter().filter(|t| now - **t < self.window).count())
            .unwrap_or(0)
    }

    /// Drop senders with no request inside the window. Returns how many were evicted.
    pub fn forget_idle(&mut self, now: DateTime<Utc>) -> usize {
        let window = self.window;
        let before = self.entries.len();
        self.entries
            .retain(|_, stamps| stamps.back().is_some_and(|t| now - *t < window));
        before - self.entries.len()
    }

    /// Number of senders currently tracked.
    pub fn tracked(&self) -> usize {
        self.entries.len()
    }
}
