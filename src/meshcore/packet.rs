//! MeshCore companion packet layouts.
//!
//! Every frame payload starts with a one-byte code. Codes below `0x80` answer a command;
//! codes from `0x80` up are unsolicited pushes. Only the packets Volley needs are decoded
//! in full; anything else surfaces as [`Packet::Unknown`] and is ignored by the link.

use bytes::{BufMut, BytesMut};

use crate::geo::GeoPoint;

pub const CMD_APP_START: u8 = 1;
pub const CMD_SEND_TXT_MSG: u8 = 2;
pub const CMD_SEND_CHANNEL_TXT_MSG: u8 = 3;
pub const CMD_GET_CONTACTS: u8 = 4;
pub const CMD_SYNC_NEXT_MESSAGE: u8 = 10;

pub const RESP_OK: u8 = 0;
pub const RESP_ERR: u8 = 1;
pub const RESP_CONTACTS_START: u8 = 2;
pub const RESP_CONTACT: u8 = 3;
pub const RESP_END_OF_CONTACTS: u8 = 4;
pub const RESP_SELF_INFO: u8 = 5;
pub const RESP_SENT: u8 = 6;
pub const RESP_CONTACT_MSG_RECV: u8 = 7;
pub const RESP_CHANNEL_MSG_RECV: u8 = 8;
pub const RESP_NO_MORE_MESSAGES: u8 = 10;
pub const RESP_CONTACT_MSG_RECV_V3: u8 = 16;
pub const RESP_CHANNEL_MSG_RECV_V3: u8 = 17;

pub const PUSH_ADVERT: u8 = 0x80;
pub const PUSH_PATH_UPDATED: u8 = 0x81;
pub const PUSH_SEND_CONFIRMED: u8 = 0x82;
pub const PUSH_MSG_WAITING: u8 = 0x83;
pub const PUSH_LOG_RX_DATA: u8 = 0x88;

/// Protocol version announced in APP_START.
pub const APP_PROTOCOL_VERSION: u8 = 3;
/// Application name announced in APP_START.
pub const APP_NAME: &str = "volley";

/// Length of the public-key prefix used to address contacts.
pub const KEY_PREFIX_LEN: usize = 6;

const TXT_TYPE_SIGNED: u8 = 2;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("empty frame")]
    Empty,
    #[error("truncated 0x{code:02x} frame ({len} bytes)")]
    Truncated { code: u8, len: usize },
}

/// The radio's own identity, reported after APP_START.
#[derive(Debug, Clone, PartialEq)]
pub struct SelfInfo {
    pub public_key: [u8; 32],
    pub position: GeoPoint,
    pub name: String,
}

/// One entry of the radio's contact table.
#[derive(Debug, Clone, PartialEq)]
pub struct Contact {
    pub public_key: [u8; 32],
    pub kind: u8,
    pub name: String,
    pub position: GeoPoint,
}

impl Contact {
    pub fn prefix(&self) -> [u8; KEY_PREFIX_LEN] {
        let mut p = [0u8; KEY_PREFIX_LEN];
        p.copy_from_slice(&self.public_key[..KEY_PREFIX_LEN]);
        p
    }
}

/// A received direct or channel text.
#[derive(Debug, Clone, PartialEq)]
pub struct TextMessage {
    /// Sender key prefix for direct messages, channel index for channel messages.
    pub source: MessageSource,
    pub path_len: u8,
    pub timestamp: u32,
    pub text: String,
    /// Only present in the v3 layouts.
    pub snr: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageSource {
    Contact([u8; KEY_PREFIX_LEN]),
    Channel(u8),
}

/// Raw packet observation pushed by the radio for every reception.
#[derive(Debug, Clone, PartialEq)]
pub struct RxLog {
    pub snr: f32,
    pub rssi: f32,
    pub raw: Vec<u8>,
}

impl RxLog {
    /// Hop count and hop ids from the raw over-the-air packet:
    /// `header, path_len, path[path_len], ...`. `None` if the packet is too short.
    pub fn route(&self) -> Option<(u8, Vec<String>)> {
        let path_len = *self.raw.get(1)?;
        let path = self.raw.get(2..2 + path_len as usize)?;
        Some((path_len, path.iter().map(|b| format!("{:02x}", b)).collect()))
    }
}

/// Decoded radio → app payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Ok,
    Err(u8),
    ContactsStart(u32),
    Contact(Contact),
    EndOfContacts,
    SelfInfo(SelfInfo),
    Sent { flood: bool, expected_ack: u32, timeout_ms: u32 },
    Message(TextMessage),
    NoMoreMessages,
    Advert([u8; 32]),
    PathUpdated([u8; 32]),
    SendConfirmed(u32),
    MessageWaiting,
    RxLog(RxLog),
    Unknown(u8),
}

struct Reader<'a> {
    code: u8,
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { code: data[0], data, pos: 1 }
    }

    fn truncated(&self) -> PacketError {
        PacketError::Truncated {
            code: self.code,
            len: self.data.len(),
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], PacketError> {
        let end = self.pos.checked_add(n).ok_or_else(|| self.truncated())?;
        let out = self.data.get(self.pos..end).ok_or_else(|| self.truncated())?;
        self.pos = end;
        Ok(out)
    }

    fn skip(&mut self, n: usize) -> Result<(), PacketError> {
        self.take(n).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8, PacketError> {
        Ok(self.take(1)?[0])
    }

    fn i8(&mut self) -> Result<i8, PacketError> {
        Ok(self.u8()? as i8)
    }

    fn u32(&mut self) -> Result<u32, PacketError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> Result<i32, PacketError> {
        Ok(self.u32()? as i32)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], PacketError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn rest(&mut self) -> &'a [u8] {
        let out = &self.data[self.pos.min(self.data.len())..];
        self.pos = self.data.len();
        out
    }

    fn rest_text(&mut self) -> String {
        c_string(self.rest())
    }
}

/// Text up to the first NUL, lossily decoded.
fn c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// Decode one frame payload.
pub fn decode(payload: &[u8]) -> Result<Packet, PacketError> {
    if payload.is_empty() {
        return Err(PacketError::Empty);
    }
    let mut r = Reader::new(payload);
    let packet = match r.code {
        RESP_OK => Packet::Ok,
        RESP_ERR => Packet::Err(r.data.get(1).copied().unwrap_or(0)),
        RESP_CONTACTS_START => Packet::ContactsStart(r.u32().unwrap_or(0)),
        RESP_CONTACT => {
            let public_key = r.array::<32>()?;
            let kind = r.u8()?;
            let _flags = r.u8()?;
            let _out_path_len = r.i8()?;
            r.skip(64)?;
            let name = c_string(r.take(32)?);
            let _last_advert = r.u32()?;
            let lat = r.i32()?;
            let lon = r.i32()?;
            Packet::Contact(Contact {
                public_key,
                kind,
                name,
                position: GeoPoint::from_micro_degrees(lat, lon),
            })
        }
        RESP_END_OF_CONTACTS => Packet::EndOfContacts,
        RESP_SELF_INFO => {
            let _adv_type = r.u8()?;
            let _tx_power = r.u8()?;
            let _max_tx_power = r.u8()?;
            let public_key = r.array::<32>()?;
            let lat = r.i32()?;
            let lon = r.i32()?;
            // multi-acks, advert policy, telemetry modes, manual-add, radio params
            r.skip(14)?;
            Packet::SelfInfo(SelfInfo {
                public_key,
                position: GeoPoint::from_micro_degrees(lat, lon),
                name: r.rest_text(),
            })
        }
        RESP_SENT => Packet::Sent {
            flood: r.u8()? != 0,
            expected_ack: r.u32()?,
            timeout_ms: r.u32()?,
        },
        RESP_CONTACT_MSG_RECV | RESP_CONTACT_MSG_RECV_V3 => {
            let snr = if r.code == RESP_CONTACT_MSG_RECV_V3 {
                let snr = r.i8()? as f32 / 4.0;
                r.skip(2)?;
                Some(snr)
            } else {
                None
            };
            let prefix = r.array::<KEY_PREFIX_LEN>()?;
            let path_len = r.u8()?;
            let txt_type = r.u8()?;
            let timestamp = r.u32()?;
            if txt_type == TXT_TYPE_SIGNED {
                r.skip(4)?;
            }
            Packet::Message(TextMessage {
                source: MessageSource::Contact(prefix),
                path_len,
                timestamp,
                text: r.rest_text(),
                snr,
            })
        }
        RESP_CHANNEL_MSG_RECV | RESP_CHANNEL_MSG_RECV_V3 => {
            let snr = if r.code == RESP_CHANNEL_MSG_RECV_V3 {
                let snr = r.i8()? as f32 / 4.0;
                r.skip(2)?;
                Some(snr)
            } else {
                None
            };
            let channel = r.u8()?;
            let path_len = r.u8()?;
            let _txt_type = r.u8()?;
            let timestamp = r.u32()?;
            Packet::Message(TextMessage {
                source: MessageSource::Channel(channel),
                path_len,
                timestamp,
                text: r.rest_text(),
                snr,
            })
        }
        RESP_NO_MORE_MESSAGES => Packet::NoMoreMessages,
        PUSH_ADVERT => Packet::Advert(r.array::<32>()?),
        PUSH_PATH_UPDATED => Packet::PathUpdated(r.array::<32>()?),
        PUSH_SEND_CONFIRMED => Packet::SendConfirmed(r.u32()?),
        PUSH_MSG_WAITING => Packet::MessageWaiting,
        PUSH_LOG_RX_DATA => {
            let snr = r.i8()? as f32 / 4.0;
            let rssi = r.i8()? as f32;
            Packet::RxLog(RxLog {
                snr,
                rssi,
                raw: r.rest().to_vec(),
            })
        }
        other => Packet::Unknown(other),
    };
    Ok(packet)
}

pub fn app_start() -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + APP_NAME.len());
    out.push(CMD_APP_START);
    out.push(APP_PROTOCOL_VERSION);
    out.extend_from_slice(&[b' '; 6]);
    out.extend_from_slice(APP_NAME.as_bytes());
    out
}

pub fn get_contacts() -> Vec<u8> {
    vec![CMD_GET_CONTACTS]
}

pub fn sync_next_message() -> Vec<u8> {
    vec![CMD_SYNC_NEXT_MESSAGE]
}

/// Direct text to the contact whose key starts with `prefix`.
pub fn send_text(prefix: &[u8; KEY_PREFIX_LEN], timestamp: u32, text: &str) -> Vec<u8> {
    let mut out = BytesMut::with_capacity(13 + text.len());
    out.put_u8(CMD_SEND_TXT_MSG);
    out.put_u8(0); // plain text
    out.put_u8(0); // attempt
    out.put_u32_le(timestamp);
    out.put_slice(prefix);
    out.put_slice(text.as_bytes());
    out.to_vec()
}

pub fn send_channel_text(channel: u8, timestamp: u32, text: &str) -> Vec<u8> {
    let mut out = BytesMut::with_capacity(7 + text.len());
    out.put_u8(CMD_SEND_CHANNEL_TXT_MSG);
    out.put_u8(0);
    out.put_u8(channel);
    out.put_u32_le(timestamp);
    out.put_slice(text.as_bytes());
    out.to_vec()
}
