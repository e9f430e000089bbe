//! Message dispatcher: the single path every inbound message takes.
//!
//! ```text
//! TransportEvent::Message
//!   → channel filter → classify → count ping → rate limit → (telemetry auth)
//!   → resolve distance → format → send → count pong / record distance
//! ```
//!
//! The dispatcher owns the rate limiter and the stats counter outright and handles one
//! event to completion before taking the next, so neither needs locking. Both outlive
//! transport outages: the supervisor only ever rebuilds the link.
//!
//! Nothing here is fatal. Refusals and lookup misses are silent; send failures are
//! logged and the message is dropped.

use log::{debug, info, trace, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use super::format::{ResponseFields, ResponseFormatter, DEFAULT_INFO_TEXT};
use super::rate_limit::RateLimiter;
use super::stats::{StatsCounter, StatsSnapshot};
use super::trigger::{Intent, TriggerClassifier};
use super::{sec_log, Clock, SystemClock};
use crate::config::{Config, DEFAULT_CHANNEL};
use crate::geo::{DistanceQuery, DistanceResolver, DistanceResult};
use crate::logutil::escape_log;
use crate::meshcore::packet::KEY_PREFIX_LEN;
use crate::transport::supervisor::SupervisorHandle;
use crate::transport::{InboundMessage, ReplyTarget, TransportError, TransportEvent};

/// Stats are logged after every this many pongs.
const STATS_LOG_EVERY: u64 = 10;

/// Where replies go. Implemented by the supervisor handle and by test sinks.
pub trait ReplySink: Send + Sync {
    fn send_reply(
        &self,
        target: ReplyTarget,
        text: String,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;
}

impl ReplySink for SupervisorHandle {
    async fn send_reply(&self, target: ReplyTarget, text: String) -> Result<(), TransportError> {
        self.send(target, text).await
    }
}

/// Dispatcher knobs that don't belong to a sub-component.
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    /// Only this channel is answered; direct messages always are.
    pub channel: u8,
    /// Hop id (public-key prefix) of the preferred repeater, lowercase.
    pub repeater_key: Option<String>,
    /// Keys allowed to query telemetry, lowercase. A direct sender passes when its id
    /// starts with one of them. Empty means anyone.
    pub telemetry_keys: Vec<String>,
    pub info_text: String,
    pub housekeeping: Duration,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            channel: DEFAULT_CHANNEL,
            repeater_key: None,
            telemetry_keys: Vec::new(),
            info_text: DEFAULT_INFO_TEXT.to_string(),
            housekeeping: Duration::from_secs(60),
        }
    }
}

impl DispatcherSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            channel: config.connection.channel,
            repeater_key: config
                .bot
                .repeater_key
                .as_deref()
                .map(|k| k.trim().to_lowercase())
                .filter(|k| !k.is_empty()),
            telemetry_keys: config
                .bot
                .telemetry_keys
                .iter()
                .map(|k| sender_id(&k.trim().to_lowercase()).to_string())
                .filter(|k| !k.is_empty())
                .collect(),
            info_text: config.bot.info_text.clone(),
            housekeeping: Duration::from_secs(60),
        }
    }
}

/// Direct senders are identified by a public-key prefix; longer configured keys are
/// cut to that length so they can be matched against it.
fn sender_id(key: &str) -> &str {
    key.get(..KEY_PREFIX_LEN * 2).unwrap_or(key)
}

/// What happened to one inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Not addressed to us, or no trigger.
    Ignored,
    /// Sender over quota.
    Throttled,
    /// Telemetry requested by a key outside the allow-list.
    Unauthorized,
    Replied(String),
    SendFailed(String),
}

pub struct MessageDispatcher {
    settings: DispatcherSettings,
    classifier: TriggerClassifier,
    limiter: RateLimiter,
    resolver: DistanceResolver,
    formatter: ResponseFormatter,
    stats: StatsCounter,
    clock: Arc<dyn Clock>,
}

impl MessageDispatcher {
    pub fn new(settings: DispatcherSettings, resolver: DistanceResolver) -> Self {
        Self {
            settings,
            classifier: TriggerClassifier::default(),
            limiter: RateLimiter::default(),
            resolver,
            formatter: ResponseFormatter::default(),
            stats: StatsCounter::new(),
            clock: Arc::new(SystemClock),
        }
    }

    /// Build everything from configuration.
    pub fn from_config(config: &Config, resolver: DistanceResolver) -> Self {
        let bot = &config.bot;
        Self::new(DispatcherSettings::from_config(config), resolver)
            .with_classifier(TriggerClassifier::new(
                &bot.trigger_words,
                &bot.info_words,
                &bot.telemetry_words,
            ))
            .with_rate_limiter(RateLimiter::new(
                Duration::from_secs(config.rate_limit.window_secs),
                config.rate_limit.max_requests,
            ))
    }

    pub fn with_classifier(mut self, classifier: TriggerClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn with_formatter(mut self, formatter: ResponseFormatter) -> Self {
        self.formatter = formatter;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn resolver(&self) -> &DistanceResolver {
        &self.resolver
    }

    /// Process events until the stream ends or `shutdown` resolves.
    pub async fn run<S, F>(
        &mut self,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        sink: &S,
        shutdown: F,
    ) where
        S: ReplySink,
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut housekeeping = tokio::time::interval(self.settings.housekeeping);
        housekeeping.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    debug!("Dispatcher received shutdown");
                    break;
                }
                _ = housekeeping.tick() => {
                    let evicted = self.limiter.forget_idle(self.clock.now());
                    if evicted > 0 {
                        trace!("Rate limiter: evicted {} idle senders, {} tracked", evicted, self.limiter.tracked());
                    }
                }
                event = events.recv() => match event {
                    Some(event) => {
                        self.on_event(event, sink).await;
                    }
                    None => {
                        debug!("Transport event stream ended");
                        break;
                    }
                },
            }
        }
    }

    /// Handle one transport event. Returns the outcome for message events.
    pub async fn on_event<S: ReplySink>(
        &mut self,
        event: TransportEvent,
        sink: &S,
    ) -> Option<Outcome> {
        match event {
            TransportEvent::Ready(device) => {
                info!(
                    "Radio ready: {} ({} contacts)",
                    escape_log(&device.name),
                    device.contacts
                );
                if self.resolver.home().is_none() {
                    match device.position {
                        Some(pos) => {
                            info!("Using radio position {} as home", pos);
                            self.resolver.set_home(pos);
                        }
                        None => warn!("No home position configured or advertised; distances disabled"),
                    }
                }
                None
            }
            TransportEvent::Lost => {
                info!("Transport lost; {}", self.stats.snapshot());
                None
            }
            TransportEvent::Message(msg) => Some(self.handle_message(&msg, sink).await),
        }
    }

    pub async fn handle_message<S: ReplySink>(
        &mut self,
        msg: &InboundMessage,
        sink: &S,
    ) -> Outcome {
        if let Some(ch) = msg.channel {
            if ch != self.settings.channel {
                trace!("Ignoring message on channel {}", ch);
                return Outcome::Ignored;
            }
        }

        let intent = self.classifier.classify(&msg.text);
        debug!(
            "From {} ({}): '{}' -> {}",
            escape_log(msg.display_name()),
            if msg.is_direct() { "direct" } else { "channel" },
            escape_log(&msg.text),
            intent
        );

        match intent {
            Intent::None => return Outcome::Ignored,
            Intent::Info => {
                info!("Info request from {}", escape_log(msg.display_name()));
                let text = self.settings.info_text.clone();
                return self.deliver(msg, text, sink).await;
            }
            _ => {}
        }

        self.stats.record_ping();
        let now = self.clock.now();
        if !self.limiter.admit(&msg.sender, now) {
            debug!("Rate limited {}", escape_log(&msg.sender));
            return Outcome::Throttled;
        }

        let (text, distance) = match &intent {
            Intent::Telemetry => {
                if !self.telemetry_allowed(msg) {
                    sec_log!(
                        "Telemetry denied for {} ({})",
                        escape_log(&msg.sender),
                        if msg.is_direct() { "direct" } else { "channel" }
                    );
                    return Outcome::Unauthorized;
                }
                let snap = self.stats.snapshot();
                let text = self.formatter.format_telemetry(
                    snap.pings_received,
                    snap.pongs_sent,
                    snap.max_distance_km,
                    snap.max_distance_label.as_deref(),
                );
                (text, DistanceResult::unresolved())
            }
            _ => {
                let distance = self.resolve_distance(&intent, msg);
                let fields = ResponseFields {
                    sender: Some(msg.display_name().to_string()),
                    emoji: Some(self.formatter.pick_emoji().to_string()),
                    timestamp: Some(now),
                    snr: msg.signal.snr,
                    rssi: msg.signal.rssi,
                    hops: msg.signal.hops,
                    route: msg.signal.route.clone(),
                    distance_km: distance.distance_km,
                };
                let via = self.via_repeater(&msg.signal.route);
                (self.formatter.format(&fields, msg.is_direct(), via), distance)
            }
        };

        let outcome = self.deliver(msg, text, sink).await;
        if let Outcome::Replied(_) = outcome {
            let pongs = self.stats.record_pong();
            if let Some(km) = distance.distance_km {
                let label = distance
                    .place
                    .clone()
                    .unwrap_or_else(|| msg.display_name().to_string());
                if self.stats.observe_distance(km, label) {
                    info!("New max distance: {:.1}km", km);
                }
            }
            if pongs % STATS_LOG_EVERY == 0 {
                info!("Stats: {}", self.stats.snapshot());
            }
        }
        outcome
    }

    async fn deliver<S: ReplySink>(&self, msg: &InboundMessage, text: String, sink: &S) -> Outcome {
        let target = msg.reply_target();
        info!("Reply to {}: {}", target, escape_log(&text));
        match sink.send_reply(target, text.clone()).await {
            Ok(()) => Outcome::Replied(text),
            Err(e) => {
                warn!("Failed to reply to {}: {}", escape_log(msg.display_name()), e);
                Outcome::SendFailed(e.to_string())
            }
        }
    }

    fn resolve_distance(&self, intent: &Intent, msg: &InboundMessage) -> DistanceResult {
        let result = match intent {
            Intent::Zipcode(code) => self.resolver.resolve(DistanceQuery::Zipcode(code)),
            Intent::PhonePrefix(prefix) => self.resolver.resolve(DistanceQuery::PhonePrefix(prefix)),
            Intent::Ping if msg.is_direct() => match msg.origin {
                Some(origin) => self.resolver.resolve(DistanceQuery::Gps(origin)),
                None => DistanceResult::unresolved(),
            },
            _ => DistanceResult::unresolved(),
        };
        if let Some(km) = result.distance_km {
            debug!(
                "Distance {:.1}km via {:?} ({})",
                km,
                result.method,
                result.place.as_deref().unwrap_or("-")
            );
        }
        result
    }

    fn via_repeater(&self, route: &[String]) -> bool {
        let Some(key) = &self.settings.repeater_key else {
            return false;
        };
        route
            .iter()
            .any(|hop| !hop.is_empty() && key.starts_with(&hop.to_lowercase()))
    }

    /// Allow-list check. Channel senders are only names, so they never pass a
    /// configured list.
    fn telemetry_allowed(&self, msg: &InboundMessage) -> bool {
        if self.settings.telemetry_keys.is_empty() {
            return true;
        }
        if !msg.is_direct() {
            return false;
        }
        let sender = msg.sender.to_lowercase();
        self.settings
            .telemetry_keys
            .iter()
            .map(|k| sender_id(k))
            .any(|k| !k.is_empty() && sender.starts_with(k))
    }

    pub fn log_final_stats(&self) {
        let snap = self.stats.snapshot();
        info!("Final statistics:");
        info!("  Pings received: {}", snap.pings_received);
        info!("  Pongs sent: {}", snap.pongs_sent);
        if snap.max_distance_km > 0.0 {
            info!(
                "  Max distance: {:.1}km ({})",
                snap.max_distance_km,
                snap.max_distance_label.as_deref().unwrap_or("N/A")
            );
        }
    }
}
