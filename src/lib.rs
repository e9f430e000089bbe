//! # Volley - compact ping responder for MeshCore networks
//!
//! Volley sits on a MeshCore companion radio and answers short trigger messages
//! (`ping`, a postal code, a phone prefix, `info`, `stats`) with one line of link
//! metadata: UTC time, SNR, RSSI, hop count, the observed route and, when the
//! request carries a location, the great-circle distance to the bot.
//!
//! Replies are kept well below the radio's text limit so a busy channel is not
//! flooded, and every requester is held to a small sliding-window quota.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use volley::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     println!("Listening on channel {}", config.connection.channel);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`bot`] - trigger classification, rate limiting, reply formatting and the dispatcher
//! - [`geo`] - haversine distance and the read-only location tables
//! - [`transport`] - transport contract and the reconnecting [`transport::supervisor`]
//! - [`meshcore`] - MeshCore companion protocol codec and serial/TCP links
//! - [`config`] - TOML configuration with defaults and validation
//! - [`logutil`] - single-line log escaping and UTF-8 safe truncation
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐  TransportEvent   ┌─────────────────┐
//! │   Connection    │──────────────────→│    Message      │
//! │   Supervisor    │←──────────────────│   Dispatcher    │
//! └─────────────────┘   send request    └─────────────────┘
//!          │                                     │
//! ┌─────────────────┐                   ┌─────────────────┐
//! │  MeshCore link  │                   │ Location tables │
//! │  (serial / TCP) │                   │    (SQLite)     │
//! └─────────────────┘                   └─────────────────┘
//! ```

pub mod bot;
pub mod config;
pub mod geo;
pub mod logutil;
pub mod meshcore;
pub mod transport;
