//! # Transport contract
//!
//! The dispatcher never talks to a radio directly. A [`Connector`] produces a live
//! [`Link`]; the [`supervisor`] owns that link, restarts it after faults and exposes a
//! small send surface ([`supervisor::SupervisorHandle`]) plus a stream of
//! [`TransportEvent`]s.
//!
//! The MeshCore implementation lives in [`crate::meshcore`]; tests plug in scripted
//! links through the same traits.

pub mod supervisor;

use serde::Serialize;
use std::fmt;
use std::future::Future;

use crate::geo::GeoPoint;

/// Hop count value radios use for "no route / direct".
pub const DIRECT_HOPS: u8 = 0xFF;

/// Transport faults and send failures.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,

    #[error("timed out waiting for the radio")]
    Timeout,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("radio rejected command (code {0})")]
    Rejected(u8),

    #[error("unknown contact {0}")]
    UnknownContact(String),

    #[error("transport closed")]
    Closed,
}

impl TransportError {
    /// Faults after which the link can no longer be trusted and must be rebuilt.
    pub fn is_link_fault(&self) -> bool {
        matches!(
            self,
            TransportError::Io(_) | TransportError::Protocol(_) | TransportError::Closed
        )
    }
}

/// Signal metrics observed for one inbound packet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignalReport {
    pub snr: Option<f32>,
    pub rssi: Option<f32>,
    pub hops: Option<u8>,
    /// Hop identifiers in path order (short public-key prefixes, lowercase hex).
    pub route: Vec<String>,
}

/// One received text message.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Stable sender key: public-key prefix for direct messages, advertised name on channels.
    pub sender: String,
    /// Human readable sender name, when known.
    pub sender_name: Option<String>,
    pub text: String,
    /// Channel index; `None` for a direct message.
    pub channel: Option<u8>,
    pub signal: SignalReport,
    /// Sender's advertised position, when known.
    pub origin: Option<GeoPoint>,
    /// Sender-side timestamp (unix seconds).
    pub sent_at: Option<u32>,
}

impl InboundMessage {
    pub fn is_direct(&self) -> bool {
        self.channel.is_none()
    }

    /// Where a reply to this message goes.
    pub fn reply_target(&self) -> ReplyTarget {
        match self.channel {
            Some(idx) => ReplyTarget::Channel(idx),
            None => ReplyTarget::Direct(self.sender.clone()),
        }
    }

    /// Display label: the advertised name when known, else the sender key.
    pub fn display_name(&self) -> &str {
        self.sender_name.as_deref().unwrap_or(&self.sender)
    }
}

/// Destination of an outbound text.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ReplyTarget {
    Channel(u8),
    /// Public-key prefix of the contact (hex).
    Direct(String),
}

impl fmt::Display for ReplyTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplyTarget::Channel(idx) => write!(f, "channel {}", idx),
            ReplyTarget::Direct(key) => write!(f, "contact {}", key),
        }
    }
}

/// What the radio reports about itself after the handshake.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub name: String,
    pub public_key: String,
    pub position: Option<GeoPoint>,
    pub contacts: usize,
}

/// Events delivered from the supervisor to the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A link finished its handshake.
    Ready(DeviceInfo),
    /// An inbound text message.
    Message(InboundMessage),
    /// The link dropped; the supervisor is backing off.
    Lost,
}

/// A live connection to a radio.
///
/// `next_frame` must be cancel-safe: the supervisor races it against outbound
/// requests. Everything that talks back to the radio happens in `process` or `send`,
/// which always run to completion.
pub trait Link: Send {
    type Frame: Send;

    /// Wait for the next raw frame. `None` means the peer closed the link.
    fn next_frame(&mut self) -> impl Future<Output = Option<Self::Frame>> + Send;

    /// Interpret one frame, possibly exchanging follow-up commands with the radio.
    fn process(
        &mut self,
        frame: Self::Frame,
    ) -> impl Future<Output = Result<Option<InboundMessage>, TransportError>> + Send;

    /// Send one text.
    fn send(
        &mut self,
        target: &ReplyTarget,
        text: &str,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Release the link.
    fn close(&mut self) -> impl Future<Output = ()> + Send;

    fn device_info(&self) -> Option<DeviceInfo>;
}

/// Opens links. Called again after every fault.
pub trait Connector: Send + 'static {
    type Link: Link + 'static;

    /// Human readable target for log lines (`/dev/ttyUSB0`, `10.0.0.5:4000`).
    fn describe(&self) -> String;

    fn connect(&mut self) -> impl Future<Output = Result<Self::Link, TransportError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(channel: Option<u8>) -> InboundMessage {
        InboundMessage {
            sender: "a1b2c3d4e5f6".into(),
            sender_name: None,
            text: "ping".into(),
            channel,
            signal: SignalReport::default(),
            origin: None,
            sent_at: None,
        }
    }

    #[test]
    fn reply_target_follows_origin() {
        assert_eq!(msg(Some(1)).reply_target(), ReplyTarget::Channel(1));
        assert_eq!(
            msg(None).reply_target(),
            ReplyTarget::Direct("a1b2c3d4e5f6".into())
        );
    }

    #[test]
    fn link_faults() {
        assert!(TransportError::Closed.is_link_fault());
        assert!(TransportError::Protocol("bad".into()).is_link_fault());
        assert!(!TransportError::Timeout.is_link_fault());
        assert!(!TransportError::NotConnected.is_link_fault());
        assert!(!TransportError::Rejected(1).is_link_fault());
    }
}
