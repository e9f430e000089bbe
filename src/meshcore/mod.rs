//! MeshCore companion radio support.
//!
//! A companion radio exposes a binary command/response protocol over USB serial or
//! TCP. This module provides:
//!
//! - [`framer`]: the `>`/`<` length-prefixed frame codec
//! - [`packet`]: command encoders and response/push decoders
//! - [`link`]: a [`crate::transport::Link`] implementation plus serial/TCP connectors
//!
//! Serial support is behind the default `serial` feature.

pub mod framer;
pub mod link;
pub mod packet;
#[cfg(feature = "serial")]
pub mod serial;

use std::fmt;

pub use link::{MeshCoreConnector, MeshCoreLink, TcpConnector};
#[cfg(feature = "serial")]
pub use link::SerialConnector;

/// Default companion TCP port (WiFi firmware builds).
pub const DEFAULT_TCP_PORT: u16 = 5000;

/// Where the radio is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Serial { port: String, baud_rate: u32 },
    Tcp(String),
}

impl Target {
    /// Parse a TCP target, adding the default port when missing.
    pub fn tcp(addr: &str) -> Self {
        if addr.contains(':') {
            Target::Tcp(addr.to_string())
        } else {
            Target::Tcp(format!("{}:{}", addr, DEFAULT_TCP_PORT))
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Serial { port, baud_rate } => write!(f, "{} @ {} baud", port, baud_rate),
            Target::Tcp(addr) => write!(f, "tcp://{}", addr),
        }
    }
}
