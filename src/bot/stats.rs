//! In-memory reply statistics. Reset on restart.

use serde::Serialize;

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub pings_received: u64,
    pub pongs_sent: u64,
    pub max_distance_km: f64,
    /// Who or where the maximum distance came from.
    pub max_distance_label: Option<String>,
}

#[derive(Debug, Default)]
pub struct StatsCounter {
    inner: StatsSnapshot,
}

impl StatsCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_ping(&mut self) {
        self.inner.pings_received += 1;
    }

    /// Count a delivered reply. Returns the new pong total.
    pub fn record_pong(&mut self) -> u64 {
        self.inner.pongs_sent += 1;
        self.inner.pongs_sent
    }

    /// Raise the high-water mark. Returns true when `km` set a new record.
    pub fn observe_distance(&mut self, km: f64, label: impl Into<String>) -> bool {
        if km.is_finite() && km > self.inner.max_distance_km {
            self.inner.max_distance_km = km;
            self.inner.max_distance_label = Some(label.into());
            true
        } else {
            false
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        self.inner.clone()
    }
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} pings, {} pongs sent, max distance: {:.1}km ({})",
            self.pings_received,
            self.pongs_sent,
            self.max_distance_km,
            self.max_distance_label.as_deref().unwrap_or("N/A")
        )
    }
}
