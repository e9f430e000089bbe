//! Responder logic: everything between an inbound text and the reply line.
//!
//! - [`trigger`] decides what a message asks for
//! - [`rate_limit`] keeps each sender to a small quota
//! - [`format`] renders the compact reply line
//! - [`stats`] counts pings and pongs
//! - [`dispatcher`] glues the above to the transport
//!
//! Time and randomness are injected ([`Clock`], `RngCore`) so the whole path is
//! deterministic under test.

macro_rules! sec_log {
    ($($arg:tt)*) => { log::warn!(target: "security", $($arg)*); };
}
pub(crate) use sec_log;

pub mod dispatcher;
pub mod format;
pub mod rate_limit;
pub mod stats;
pub mod trigger;

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};

pub use dispatcher::{DispatcherSettings, MessageDispatcher, Outcome, ReplySink};
pub use format::{ResponseFields, ResponseFormatter};
pub use rate_limit::RateLimiter;
pub use stats::{StatsCounter, StatsSnapshot};
pub use trigger::{Intent, TriggerClassifier};

/// Source of wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Hand-driven clock for tests and replays. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn set(&self, t: DateTime<Utc>) {
        if let Ok(mut now) = self.now.lock() {
            *now = t;
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.lock() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}
