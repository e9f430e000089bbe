//! A live MeshCore companion connection.
//!
//! The byte stream is split: a reader task turns incoming bytes into decoded
//! [`Packet`]s and queues them on an unbounded channel, while the link keeps the write
//! half. Waiting for a frame is therefore a plain channel receive, which keeps
//! [`Link::next_frame`] cancel-safe.
//!
//! Command/response exchanges (contact refresh, message sync, sends) run inside
//! `process`/`send` and stash any unrelated packet that arrives meanwhile in a backlog,
//! which `next_frame` drains before reading the channel again.

use log::{debug, info, trace, warn};
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};

use super::framer::{encode_frame, FrameDecoder};
use super::packet::{self, Contact, MessageSource, Packet, RxLog, TextMessage, KEY_PREFIX_LEN};
use super::Target;
use crate::logutil::{escape_log, hex};
use crate::transport::{
    Connector, DeviceInfo, InboundMessage, Link, ReplyTarget, SignalReport, TransportError,
};

/// Default time to wait for the radio to answer a command.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

type KeyPrefix = [u8; KEY_PREFIX_LEN];

pub struct MeshCoreLink {
    writer: Box<dyn AsyncWrite + Unpin + Send>,
    packets: mpsc::UnboundedReceiver<Packet>,
    backlog: VecDeque<Packet>,
    reader: JoinHandle<()>,
    contacts: HashMap<KeyPrefix, Contact>,
    self_info: packet::SelfInfo,
    /// Signal figures of the most recent reception; kept until overwritten.
    last_snr: Option<f32>,
    last_rssi: Option<f32>,
    /// Route of the most recent reception; consumed by the next message.
    pending_route: Option<Vec<String>>,
    response_timeout: Duration,
    /// A send is between writing its frame and reading the radio's answer.
    send_in_flight: bool,
    /// Sends whose SENT/OK/ERR is still due but nobody waits for any more.
    abandoned_sends: usize,
    /// Keeps transport resources (serial bridge threads) alive for the link's lifetime.
    guard: Option<Box<dyn Any + Send>>,
}

impl MeshCoreLink {
    /// Run the companion handshake over `stream`: APP_START, contact download, then
    /// queue a sync so messages stored while we were away get delivered.
    pub async fn establish<S>(
        stream: S,
        guard: Option<Box<dyn Any + Send>>,
        response_timeout: Duration,
    ) -> Result<Self, TransportError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, packets) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_packets(read_half, tx));

        let mut link = MeshCoreLink {
            writer: Box::new(write_half),
            packets,
            backlog: VecDeque::new(),
            reader,
            contacts: HashMap::new(),
            self_info: packet::SelfInfo {
                public_key: [0; 32],
                position: crate::geo::GeoPoint::new(0.0, 0.0),
                name: String::new(),
            },
            last_snr: None,
            last_rssi: None,
            pending_route: None,
            response_timeout,
            send_in_flight: false,
            abandoned_sends: 0,
            guard,
        };

        link.write(&packet::app_start()).await?;
        match link.await_response(|p| matches!(p, Packet::SelfInfo(_))).await? {
            Packet::SelfInfo(info) => link.self_info = info,
            other => {
                return Err(TransportError::Protocol(format!(
                    "unexpected handshake reply {:?}",
                    other
                )))
            }
        }
        info!(
            "Radio '{}' ({}) position {}",
            link.self_info.name,
            hex(&link.self_info.public_key[..KEY_PREFIX_LEN]),
            link.self_info.position
        );

        link.refresh_contacts().await?;
        link.backlog.push_back(Packet::MessageWaiting);
        Ok(link)
    }

    pub fn contact_count(&self) -> usize {
        self.contacts.len()
    }

    async fn write(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        trace!("TX {}", hex(payload));
        self.writer.write_all(&encode_frame(payload)).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Wait for the first packet accepted by `accept` (or an ERR). Everything else is
    /// kept for `next_frame`.
    async fn await_response(
        &mut self,
        accept: fn(&Packet) -> bool,
    ) -> Result<Packet, TransportError> {
        let deadline = Instant::now() + self.response_timeout;
        loop {
            let packet = match timeout_at(deadline, self.packets.recv()).await {
                Ok(Some(p)) => p,
                Ok(None) => return Err(TransportError::Closed),
                Err(_) => return Err(TransportError::Timeout),
            };
            if self.discard_abandoned(&packet) {
                continue;
            }
            if let Packet::Err(code) = packet {
                return Err(TransportError::Rejected(code));
            }
            if accept(&packet) {
                return Ok(packet);
            }
            trace!("Deferring {:?} while awaiting response", packet);
            self.backlog.push_back(packet);
        }
    }

    /// A send that was cancelled after writing its frame leaves an answer behind.
    fn reap_cancelled_send(&mut self) {
        if self.send_in_flight {
            self.send_in_flight = false;
            self.abandoned_sends += 1;
        }
    }

    /// Swallow the answer owed to an abandoned send so it is not taken for the
    /// answer of a later command.
    fn discard_abandoned(&mut self, packet: &Packet) -> bool {
        if self.abandoned_sends == 0
            || !matches!(packet, Packet::Sent { .. } | Packet::Ok | Packet::Err(_))
        {
            return false;
        }
        self.abandoned_sends -= 1;
        debug!("Discarding answer to an abandoned send: {:?}", packet);
        true
    }

    async fn refresh_contacts(&mut self) -> Result<(), TransportError> {
        self.write(&packet::get_contacts()).await?;
        let mut contacts = HashMap::new();
        loop {
            let p = self
                .await_response(|p| {
                    matches!(
                        p,
                        Packet::ContactsStart(_) | Packet::Contact(_) | Packet::EndOfContacts
                    )
                })
                .await?;
            match p {
                Packet::Contact(c) => {
                    contacts.insert(c.prefix(), c);
                }
                Packet::EndOfContacts => break,
                _ => {}
            }
        }
        debug!("Contact table refreshed: {} entries", contacts.len());
        self.contacts = contacts;
        Ok(())
    }

    /// Fetch one stored message. Re-queues another fetch until the radio runs dry.
    async fn sync_next(&mut self) -> Result<Option<InboundMessage>, TransportError> {
        self.write(&packet::sync_next_message()).await?;
        let p = match self
            .await_response(|p| matches!(p, Packet::Message(_) | Packet::NoMoreMessages))
            .await
        {
            Ok(p) => p,
            Err(TransportError::Rejected(code)) => {
                debug!("Message sync rejected (code {})", code);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        match p {
            Packet::Message(m) => {
                self.backlog.push_back(Packet::MessageWaiting);
                Ok(Some(self.to_inbound(m).await))
            }
            _ => Ok(None),
        }
    }

    async fn contact_for(&mut self, prefix: &KeyPrefix) -> Option<Contact> {
        if let Some(c) = self.contacts.get(prefix) {
            return Some(c.clone());
        }
        debug!("Contact {} not cached, refreshing contacts", hex(prefix));
        if let Err(e) = self.refresh_contacts().await {
            warn!("Contact refresh failed: {}", e);
        }
        self.contacts.get(prefix).cloned()
    }

    async fn to_inbound(&mut self, m: TextMessage) -> InboundMessage {
        let signal = SignalReport {
            snr: m.snr.or(self.last_snr),
            rssi: self.last_rssi,
            hops: Some(m.path_len),
            route: self.pending_route.take().unwrap_or_default(),
        };
        match m.source {
            MessageSource::Channel(idx) => {
                let (sender, text) = match m.text.split_once(':') {
                    Some((name, body)) if !name.trim().is_empty() => {
                        (name.trim().to_string(), body.trim().to_string())
                    }
                    _ => ("unknown".to_string(), m.text.trim().to_string()),
                };
                InboundMessage {
                    sender_name: Some(sender.clone()),
                    sender,
                    text,
                    channel: Some(idx),
                    signal,
                    origin: None,
                    sent_at: Some(m.timestamp),
                }
            }
            MessageSource::Contact(prefix) => {
                let contact = self.contact_for(&prefix).await;
                InboundMessage {
                    sender: hex(&prefix),
                    sender_name: contact.as_ref().map(|c| c.name.clone()),
                    text: m.text.trim().to_string(),
                    channel: None,
                    signal,
                    origin: contact.map(|c| c.position).filter(|p| !p.is_unset()),
                    sent_at: Some(m.timestamp),
                }
            }
        }
    }

    fn remember_rx(&mut self, log: RxLog) {
        self.last_snr = Some(log.snr);
        self.last_rssi = Some(log.rssi);
        self.pending_route = log.route().map(|(_, hops)| hops);
        trace!(
            "RX snr {:.1} rssi {:.0} route {:?}",
            log.snr,
            log.rssi,
            self.pending_route
        );
    }
}

impl Link for MeshCoreLink {
    type Frame = Packet;

    async fn next_frame(&mut self) -> Option<Packet> {
        if let Some(p) = self.backlog.pop_front() {
            return Some(p);
        }
        self.packets.recv().await
    }

    async fn process(&mut self, frame: Packet) -> Result<Option<InboundMessage>, TransportError> {
        self.reap_cancelled_send();
        if self.discard_abandoned(&frame) {
            return Ok(None);
        }
        match frame {
            Packet::MessageWaiting => self.sync_next().await,
            Packet::Message(m) => Ok(Some(self.to_inbound(m).await)),
            Packet::RxLog(log) => {
                self.remember_rx(log);
                Ok(None)
            }
            Packet::Advert(key) | Packet::PathUpdated(key) => {
                debug!("Advert/path update from {}", hex(&key[..KEY_PREFIX_LEN]));
                Ok(None)
            }
            Packet::SendConfirmed(ack) => {
                debug!("Delivery confirmed (ack {:08x})", ack);
                Ok(None)
            }
            Packet::Unknown(code) => {
                trace!("Ignoring unknown packet 0x{:02x}", code);
                Ok(None)
            }
            other => {
                trace!("Ignoring stale response {:?}", other);
                Ok(None)
            }
        }
    }

    async fn send(&mut self, target: &ReplyTarget, text: &str) -> Result<(), TransportError> {
        self.reap_cancelled_send();
        let now = chrono::Utc::now().timestamp().max(0) as u32;
        let payload = match target {
            ReplyTarget::Channel(idx) => packet::send_channel_text(*idx, now, text),
            ReplyTarget::Direct(key) => {
                let prefix = parse_prefix(key)
                    .ok_or_else(|| TransportError::UnknownContact(key.clone()))?;
                if self.contact_for(&prefix).await.is_none() {
                    return Err(TransportError::UnknownContact(key.clone()));
                }
                packet::send_text(&prefix, now, text)
            }
        };
        debug!("Sending to {}: {}", target, escape_log(text));
        self.send_in_flight = true;
        self.write(&payload).await?;
        let result = self
            .await_response(|p| matches!(p, Packet::Sent { .. } | Packet::Ok))
            .await;
        self.send_in_flight = false;
        if matches!(result, Err(TransportError::Timeout)) {
            // the radio may still answer
            self.abandoned_sends += 1;
        }
        result.map(|_| ())
    }

    async fn close(&mut self) {
        self.reader.abort();
        let _ = self.writer.shutdown().await;
        self.guard.take();
    }

    fn device_info(&self) -> Option<DeviceInfo> {
        Some(DeviceInfo {
            name: self.self_info.name.clone(),
            public_key: hex(&self.self_info.public_key),
            position: Some(self.self_info.position).filter(|p| !p.is_unset()),
            contacts: self.contacts.len(),
        })
    }
}

impl Drop for MeshCoreLink {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_packets<R>(mut reader: R, tx: mpsc::UnboundedSender<Packet>)
where
    R: AsyncRead + Unpin,
{
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 512];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                debug!("Radio stream closed");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                warn!("Radio read error: {}", e);
                break;
            }
        };
        decoder.push(&buf[..n]);
        while let Some(frame) = decoder.next_frame() {
            trace!("RX {}", hex(&frame));
            match packet::decode(&frame) {
                Ok(p) => {
                    if tx.send(p).is_err() {
                        return;
                    }
                }
                Err(e) => debug!("Dropping malformed frame: {}", e),
            }
        }
    }
}

/// Parse a 12-digit hex public-key prefix.
fn parse_prefix(key: &str) -> Option<KeyPrefix> {
    if key.len() < KEY_PREFIX_LEN * 2 || !key.is_ascii() {
        return None;
    }
    let mut out = [0u8; KEY_PREFIX_LEN];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&key[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(out)
}

/// Companion radio reachable over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
    response_timeout: Duration,
}

impl TcpConnector {
    pub fn new(addr: impl Into<String>, response_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            response_timeout,
        }
    }
}

impl Connector for TcpConnector {
    type Link = MeshCoreLink;

    fn describe(&self) -> String {
        format!("tcp://{}", self.addr)
    }

    async fn connect(&mut self) -> Result<MeshCoreLink, TransportError> {
        debug!("Connecting to {}", self.addr);
        let stream = TcpStream::connect(&self.addr).await?;
        let _ = stream.set_nodelay(true);
        MeshCoreLink::establish(stream, None, self.response_timeout).await
    }
}

/// Companion radio on a USB serial port.
#[cfg(feature = "serial")]
#[derive(Debug, Clone)]
pub struct SerialConnector {
    port: String,
    baud_rate: u32,
    response_timeout: Duration,
}

#[cfg(feature = "serial")]
impl SerialConnector {
    pub fn new(port: impl Into<String>, baud_rate: u32, response_timeout: Duration) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            response_timeout,
        }
    }
}

#[cfg(feature = "serial")]
impl Connector for SerialConnector {
    type Link = MeshCoreLink;

    fn describe(&self) -> String {
        format!("{} @ {} baud", self.port, self.baud_rate)
    }

    async fn connect(&mut self) -> Result<MeshCoreLink, TransportError> {
        let (stream, guard) = super::serial::open(&self.port, self.baud_rate).await?;
        MeshCoreLink::establish(stream, Some(Box::new(guard)), self.response_timeout).await
    }
}

/// Connector chosen from configuration.
#[derive(Debug, Clone)]
pub enum MeshCoreConnector {
    Tcp(TcpConnector),
    #[cfg(feature = "serial")]
    Serial(SerialConnector),
}

impl MeshCoreConnector {
    pub fn from_target(target: &Target, response_timeout: Duration) -> anyhow::Result<Self> {
        match target {
            Target::Tcp(addr) => Ok(Self::Tcp(TcpConnector::new(addr.clone(), response_timeout))),
            #[cfg(feature = "serial")]
            Target::Serial { port, baud_rate } => Ok(Self::Serial(SerialConnector::new(
                port.clone(),
                *baud_rate,
                response_timeout,
            ))),
            #[cfg(not(feature = "serial"))]
            Target::Serial { port, .. } => Err(anyhow::anyhow!(
                "serial port {} requested but serial support is not compiled in",
                port
            )),
        }
    }
}

impl Connector for MeshCoreConnector {
    type Link = MeshCoreLink;

    fn describe(&self) -> String {
        match self {
            Self::Tcp(c) => c.describe(),
            #[cfg(feature = "serial")]
            Self::Serial(c) => c.describe(),
        }
    }

    async fn connect(&mut self) -> Result<MeshCoreLink, TransportError> {
        match self {
            Self::Tcp(c) => c.connect().await,
            #[cfg(feature = "serial")]
            Self::Serial(c) => c.connect().await,
        }
    }
}
