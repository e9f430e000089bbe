//! Test utilities & fixtures shared by the integration tests.
#![allow(dead_code)] // each test binary uses a different subset

use chrono::{DateTime, TimeZone, Utc};
use std::sync::{Arc, Mutex};

use volley::bot::format::ResponseFormatter;
use volley::bot::{DispatcherSettings, ManualClock, MessageDispatcher, ReplySink};
use volley::geo::{DistanceResolver, GeoPoint, MemoryLocationTable};
use volley::transport::{InboundMessage, ReplyTarget, SignalReport, TransportError};

/// Home position used across tests (Hamburg-Altona).
pub const HOME: GeoPoint = GeoPoint::new(53.5503, 9.9352);

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
}

/// Small location table: two Hamburg postal codes, one Berlin, plus prefixes.
pub fn location_table() -> MemoryLocationTable {
    MemoryLocationTable::new()
        .with_postal("22765", "Hamburg", 53.5544, 9.9284)
        .with_postal("20095", "Hamburg", 53.5511, 9.9937)
        .with_postal("10115", "Berlin", 52.5323, 13.3846)
        .with_prefix("040", "20095")
        .with_prefix("030", "10115")
}

pub fn resolver() -> DistanceResolver {
    DistanceResolver::new(Some(HOME), Arc::new(location_table()))
}

/// Reply sink that records every send and can be told to fail.
#[derive(Default)]
pub struct RecordingSink {
    pub sent: Mutex<Vec<(ReplyTarget, String)>>,
    pub fail: Mutex<bool>,
}

impl RecordingSink {
    pub fn failing() -> Self {
        let sink = Self::default();
        *sink.fail.lock().unwrap() = true;
        sink
    }

    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }

    pub fn sent(&self) -> Vec<(ReplyTarget, String)> {
        self.sent.lock().unwrap().clone()
    }
}

impl ReplySink for RecordingSink {
    async fn send_reply(&self, target: ReplyTarget, text: String) -> Result<(), TransportError> {
        if *self.fail.lock().unwrap() {
            return Err(TransportError::NotConnected);
        }
        self.sent.lock().unwrap().push((target, text));
        Ok(())
    }
}

pub fn direct(sender: &str, text: &str) -> InboundMessage {
    InboundMessage {
        sender: sender.to_string(),
        sender_name: None,
        text: text.to_string(),
        channel: None,
        signal: SignalReport {
            snr: Some(6.25),
            rssi: Some(-97.0),
            hops: Some(255),
            route: Vec::new(),
        },
        origin: None,
        sent_at: None,
    }
}

pub fn channel(sender: &str, text: &str, idx: u8) -> InboundMessage {
    InboundMessage {
        sender: sender.to_string(),
        sender_name: Some(sender.to_string()),
        text: text.to_string(),
        channel: Some(idx),
        signal: SignalReport {
            snr: Some(-3.5),
            rssi: Some(-110.0),
            hops: Some(2),
            route: vec!["a1".to_string(), "7f".to_string()],
        },
        origin: None,
        sent_at: None,
    }
}

/// Dispatcher with a manual clock at [`t0`], seeded emoji picks and the test table.
pub fn dispatcher(settings: DispatcherSettings) -> (MessageDispatcher, ManualClock) {
    let clock = ManualClock::new(t0());
    let d = MessageDispatcher::new(settings, resolver())
        .with_formatter(ResponseFormatter::seeded(11))
        .with_clock(Arc::new(clock.clone()));
    (d, clock)
}
