//! # Configuration
//!
//! Volley reads a single TOML file. Every section and field has a default, so an empty
//! file is a valid configuration; only the radio target must be supplied somewhere
//! (file or command line).
//!
//! ## Sections
//!
//! - [`ConnectionConfig`] - serial port or TCP address, channel to serve
//! - [`BotConfig`] - trigger words, info text, repeater key, telemetry allow-list, home position
//! - [`RateLimitConfig`] - sliding-window quota per sender
//! - [`LookupConfig`] - location database path
//! - [`ReconnectConfig`] - backoff and timeouts for the connection supervisor
//! - [`LoggingConfig`] - level and optional log files
//!
//! ## Example
//!
//! ```toml
//! [connection]
//! serial = "/dev/ttyUSB0"
//! channel = 1
//!
//! [bot]
//! repeater_key = "7f"
//! telemetry_keys = ["a1b2c3d4e5f6"]
//!
//! [rate_limit]
//! window_secs = 360
//! max_requests = 3
//! ```
//!
//! Command-line flags override the file: CLI args > config file > defaults.

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::fs;

use crate::bot::format::DEFAULT_INFO_TEXT;
use crate::bot::rate_limit::{DEFAULT_MAX_REQUESTS, DEFAULT_WINDOW_SECS};
use crate::bot::trigger::{DEFAULT_INFO_WORDS, DEFAULT_TELEMETRY_WORDS, DEFAULT_TRIGGER_WORDS};
use crate::geo::GeoPoint;
use crate::meshcore::Target;
use crate::transport::supervisor::{Backoff, SupervisorConfig};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub bot: BotConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub lookup: LookupConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Serial device of the companion radio. Takes precedence over `tcp`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    /// `host[:port]` of a WiFi companion radio.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp: Option<String>,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Channel index answered by the bot.
    #[serde(default = "default_channel")]
    pub channel: u8,
}

fn default_baud_rate() -> u32 {
    115200
}

/// Channel index answered when none is configured.
pub const DEFAULT_CHANNEL: u8 = 1;

/// Shortest telemetry key prefix accepted (hex digits).
pub const MIN_TELEMETRY_KEY_HEX: usize = 8;

fn default_channel() -> u8 {
    DEFAULT_CHANNEL
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            serial: None,
            tcp: None,
            baud_rate: default_baud_rate(),
            channel: default_channel(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    #[serde(default = "default_trigger_words")]
    pub trigger_words: Vec<String>,
    #[serde(default = "default_info_words")]
    pub info_words: Vec<String>,
    #[serde(default = "default_telemetry_words")]
    pub telemetry_words: Vec<String>,
    #[serde(default = "default_info_text")]
    pub info_text: String,
    /// Hop id of the preferred repeater; routes through it are labelled `via:`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeater_key: Option<String>,
    /// Public keys (or prefixes) allowed to query telemetry. Empty allows everyone.
    #[serde(default)]
    pub telemetry_keys: Vec<String>,
    /// Home position; falls back to the radio's advertised position when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home_latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home_longitude: Option<f64>,
}

fn words(list: &[&str]) -> Vec<String> {
    list.iter().map(|w| w.to_string()).collect()
}

fn default_trigger_words() -> Vec<String> {
    words(DEFAULT_TRIGGER_WORDS)
}

fn default_info_words() -> Vec<String> {
    words(DEFAULT_INFO_WORDS)
}

fn default_telemetry_words() -> Vec<String> {
    words(DEFAULT_TELEMETRY_WORDS)
}

fn default_info_text() -> String {
    DEFAULT_INFO_TEXT.to_string()
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            trigger_words: default_trigger_words(),
            info_words: default_info_words(),
            telemetry_words: default_telemetry_words(),
            info_text: default_info_text(),
            repeater_key: None,
            telemetry_keys: Vec::new(),
            home_latitude: None,
            home_longitude: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_max_requests")]
    pub max_requests: usize,
}

fn default_window_secs() -> u64 {
    DEFAULT_WINDOW_SECS
}

fn default_max_requests() -> usize {
    DEFAULT_MAX_REQUESTS
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            max_requests: default_max_requests(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupConfig {
    /// SQLite file with the `zipcodes` table.
    #[serde(default = "default_database")]
    pub database: String,
}

fn default_database() -> String {
    "zipcodes.db".to_string()
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    /// How long the radio gets to answer a single command.
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_multiplier() -> u32 {
    2
}

fn default_connect_timeout_ms() -> u64 {
    15_000
}

fn default_send_timeout_ms() -> u64 {
    10_000
}

fn default_response_timeout_ms() -> u64 {
    5_000
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            connect_timeout_ms: default_connect_timeout_ms(),
            send_timeout_ms: default_send_timeout_ms(),
            response_timeout_ms: default_response_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    /// Separate file for `security` target lines (denied telemetry requests).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_file: Option<String>,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            file: None,
            security_file: None,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to defaults. A file that exists
    /// but does not parse or validate is an error, never silently replaced.
    pub async fn load_or_default(path: &str) -> Result<Self> {
        if fs::try_exists(path).await.unwrap_or(false) {
            Self::load(path).await
        } else {
            Ok(Self::default())
        }
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let mut config = Config::default();
        config.connection.serial = Some("/dev/ttyUSB0".to_string());
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    /// Reject values that would make the bot misbehave rather than fail loudly later.
    pub fn validate(&self) -> Result<()> {
        let r = &self.reconnect;
        if r.initial_delay_ms == 0 {
            bail!("reconnect.initial_delay_ms must be greater than 0");
        }
        if r.max_delay_ms < r.initial_delay_ms {
            bail!("reconnect.max_delay_ms must be >= reconnect.initial_delay_ms");
        }
        if r.multiplier == 0 {
            bail!("reconnect.multiplier must be at least 1");
        }
        if r.connect_timeout_ms == 0 || r.send_timeout_ms == 0 || r.response_timeout_ms == 0 {
            bail!("reconnect timeouts must be greater than 0");
        }
        if self.rate_limit.window_secs == 0 {
            bail!("rate_limit.window_secs must be greater than 0");
        }
        if self.connection.baud_rate == 0 {
            bail!("connection.baud_rate must be greater than 0");
        }
        match (self.bot.home_latitude, self.bot.home_longitude) {
            (Some(lat), Some(lon)) => {
                if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
                    bail!("bot.home_latitude/home_longitude out of range");
                }
            }
            (None, None) => {}
            _ => bail!("bot.home_latitude and bot.home_longitude must be set together"),
        }
        if let Some(key) = &self.bot.repeater_key {
            if !key.trim().chars().all(|c| c.is_ascii_hexdigit()) {
                bail!("bot.repeater_key must be hex");
            }
        }
        for key in &self.bot.telemetry_keys {
            let key = key.trim();
            if !key.chars().all(|c| c.is_ascii_hexdigit()) {
                bail!("bot.telemetry_keys entries must be hex public keys or prefixes");
            }
            if key.len() < MIN_TELEMETRY_KEY_HEX {
                bail!(
                    "bot.telemetry_keys entry '{}' is too short (at least {} hex digits)",
                    key,
                    MIN_TELEMETRY_KEY_HEX
                );
            }
        }
        Ok(())
    }

    /// The radio to talk to. Serial wins when both are set.
    pub fn transport_target(&self) -> Result<Target> {
        if let Some(port) = self.connection.serial.as_deref().filter(|p| !p.is_empty()) {
            return Ok(Target::Serial {
                port: port.to_string(),
                baud_rate: self.connection.baud_rate,
            });
        }
        if let Some(addr) = self.connection.tcp.as_deref().filter(|a| !a.is_empty()) {
            return Ok(Target::tcp(addr));
        }
        Err(anyhow!(
            "No radio configured: set connection.serial or connection.tcp (or pass --serial/--tcp)"
        ))
    }

    pub fn home_position(&self) -> Option<GeoPoint> {
        match (self.bot.home_latitude, self.bot.home_longitude) {
            (Some(lat), Some(lon)) => Some(GeoPoint::new(lat, lon)).filter(|p| !p.is_unset()),
            _ => None,
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        let r = &self.reconnect;
        SupervisorConfig {
            backoff: Backoff::new(
                Duration::from_millis(r.initial_delay_ms),
                Duration::from_millis(r.max_delay_ms),
                r.multiplier,
            ),
            connect_timeout: Duration::from_millis(r.connect_timeout_ms),
            send_timeout: Duration::from_millis(r.send_timeout_ms),
        }
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.reconnect.response_timeout_ms)
    }
}
