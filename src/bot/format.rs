//! Reply line construction.
//!
//! Channel replies mention the requester using MeshCore's `@[name]` syntax, direct
//! replies don't:
//!
//! ```text
//! @[Alice] 🏐 14:03:27Z,snr:7.5dB,rssi:-92.0dBm,hops:2,route:a1.7f,dist:12.3km
//! 🎾 14:03:27Z,snr:7.5dB,rssi:-92.0dBm,direct,dist:12.3km
//! ```
//!
//! Every field is optional and simply left out when unknown. Lines are capped at
//! [`MAX_REPLY_BYTES`]: the route goes first, then the line is cut on a char boundary.

use chrono::{DateTime, NaiveTime, Utc};
use rand::seq::SliceRandom;
use rand::{RngCore, SeedableRng};

use crate::logutil::truncate_utf8;
use crate::transport::DIRECT_HOPS;

/// Upper bound for one reply, well below the radio's text payload limit.
pub const MAX_REPLY_BYTES: usize = 140;

pub const EMOJIS: &[&str] = &["🏉", "🏀", "🎾", "🏈", "⚽️", "🎱", "🥎", "⚾️", "🏐"];

pub const DEFAULT_INFO_TEXT: &str =
    "Volley ping bot. Send: ping, zipcode (22767), or prefix (040). https://github.com/gretel/volley 73 DO2THX";

/// Optional pieces of a reply.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseFields {
    /// Requester mentioned on channel replies.
    pub sender: Option<String>,
    pub emoji: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    pub snr: Option<f32>,
    pub rssi: Option<f32>,
    pub hops: Option<u8>,
    pub route: Vec<String>,
    pub distance_km: Option<f64>,
}

pub struct ResponseFormatter {
    rng: Box<dyn RngCore + Send>,
}

impl Default for ResponseFormatter {
    fn default() -> Self {
        Self::new(Box::new(rand::rngs::StdRng::from_entropy()))
    }
}

impl std::fmt::Debug for ResponseFormatter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ResponseFormatter")
    }
}

impl ResponseFormatter {
    pub fn new(rng: Box<dyn RngCore + Send>) -> Self {
        Self { rng }
    }

    pub fn seeded(seed: u64) -> Self {
        Self::new(Box::new(rand::rngs::StdRng::seed_from_u64(seed)))
    }

    /// Uniform pick from [`EMOJIS`].
    pub fn pick_emoji(&mut self) -> &'static str {
        EMOJIS.choose(&mut self.rng).copied().unwrap_or("🏐")
    }

    /// Render a ping reply.
    ///
    /// `is_direct` (or a hop count of 255) prints `direct` instead of hops and route.
    /// `used_repeater_path` labels the route `via:` instead of `route:`.
    pub fn format(
        &self,
        fields: &ResponseFields,
        is_direct: bool,
        used_repeater_path: bool,
    ) -> String {
        let line = render(fields, is_direct, used_repeater_path, true);
        if line.len() <= MAX_REPLY_BYTES {
            return line;
        }
        let line = render(fields, is_direct, used_repeater_path, false);
        truncate_utf8(&line, MAX_REPLY_BYTES).to_string()
    }

    pub fn format_telemetry(
        &mut self,
        pings: u64,
        pongs: u64,
        max_distance_km: f64,
        label: Option<&str>,
    ) -> String {
        let line = format!(
            "{} Telemetry: {} pings, {} pongs, max dist: {:.1}km ({})",
            self.pick_emoji(),
            pings,
            pongs,
            max_distance_km,
            label.unwrap_or("N/A")
        );
        truncate_utf8(&line, MAX_REPLY_BYTES).to_string()
    }
}

fn render(fields: &ResponseFields, is_direct: bool, via: bool, with_route: bool) -> String {
    let mut head: Vec<String> = Vec::new();
    if !is_direct {
        if let Some(sender) = &fields.sender {
            head.push(format!("@[{}]", sender));
        }
    }
    if let Some(emoji) = &fields.emoji {
        head.push(emoji.clone());
    }

    let mut tail: Vec<String> = Vec::new();
    if let Some(ts) = fields.timestamp {
        tail.push(ts.format("%H:%M:%SZ").to_string());
    }
    if let Some(snr) = fields.snr {
        tail.push(format!("snr:{:.1}dB", snr));
    }
    if let Some(rssi) = fields.rssi {
        tail.push(format!("rssi:{:.1}dBm", rssi));
    }
    if is_direct || fields.hops == Some(DIRECT_HOPS) {
        tail.push("direct".to_string());
    } else {
        if let Some(hops) = fields.hops {
            tail.push(format!("hops:{}", hops));
        }
        if with_route && !fields.route.is_empty() {
            let label = if via { "via" } else { "route" };
            tail.push(format!("{}:{}", label, fields.route.join(".")));
        }
    }
    if let Some(km) = fields.distance_km {
        tail.push(format!("dist:{:.1}km", km));
    }

    let mut line = head.join(" ");
    if !tail.is_empty() {
        if !line.is_empty() {
            line.push(' ');
        }
        line.push_str(&tail.join(","));
    }
    line
}

/// A reply line taken apart again.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedReply {
    pub sender: Option<String>,
    pub emoji: Option<String>,
    pub time: Option<NaiveTime>,
    pub snr: Option<f32>,
    pub rssi: Option<f32>,
    pub hops: Option<u8>,
    pub direct: bool,
    pub route: Vec<String>,
    pub via: bool,
    pub distance_km: Option<f64>,
}

/// Parse a ping reply. Returns `None` for lines that don't follow the reply grammar
/// (telemetry and info lines included).
pub fn parse_reply(line: &str) -> Option<ParsedReply> {
    let line = line.trim();
    let mut out = ParsedReply::default();
    let (head, tail) = match line.rsplit_once(' ') {
        Some((head, tail)) => (Some(head), tail),
        None => (None, line),
    };

    if let Some(head) = head {
        match head.strip_prefix("@[") {
            Some(rest) => {
                let (sender, emoji) = rest.rsplit_once("] ")?;
                out.sender = Some(sender.to_string());
                out.emoji = Some(emoji.to_string());
            }
            None if head.contains(' ') => return None,
            None => out.emoji = Some(head.to_string()),
        }
    }

    for item in tail.split(',') {
        if item == "direct" {
            out.direct = true;
        } else if let Some(v) = item.strip_prefix("snr:") {
            out.snr = Some(v.strip_suffix("dB")?.parse().ok()?);
        } else if let Some(v) = item.strip_prefix("rssi:") {
            out.rssi = Some(v.strip_suffix("dBm")?.parse().ok()?);
        } else if let Some(v) = item.strip_prefix("hops:") {
            out.hops = Some(v.parse().ok()?);
        } else if let Some(v) = item.strip_prefix("route:") {
            out.route = v.split('.').map(str::to_string).collect();
        } else if let Some(v) = item.strip_prefix("via:") {
            out.route = v.split('.').map(str::to_string).collect();
            out.via = true;
        } else if let Some(v) = item.strip_prefix("dist:") {
            out.distance_km = Some(v.strip_suffix("km")?.parse().ok()?);
        } else if let Some(v) = item.strip_suffix('Z') {
            out.time = Some(NaiveTime::parse_from_str(v, "%H:%M:%S").ok()?);
        } else {
            return None;
        }
    }
    Some(out)
}
