//! Length-prefixed framer for the MeshCore companion serial/TCP link.
//!
//! Frames on the wire look like:
//!
//!   `<marker><u16 little-endian length><payload>`
//!
//! where the marker is `>` for radio → app and `<` for app → radio. The decoder is
//! incremental: feed it arbitrary chunks and pull out whole payloads. Garbage between
//! frames (boot banners, debug text) is skipped by resynchronising on the marker.
use bytes::{Buf, BufMut, BytesMut};

/// Marker of frames sent by the radio.
pub const INBOUND_MARKER: u8 = b'>';
/// Marker of frames sent to the radio.
pub const OUTBOUND_MARKER: u8 = b'<';
/// Largest payload the companion firmware produces.
pub const MAX_FRAME_SIZE: usize = 300;

const HEADER_LEN: usize = 3;

/// Incremental decoder for radio → app frames.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    skipped: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(1024),
            skipped: 0,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes discarded while hunting for a frame marker.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Extract the next complete payload, if any.
    ///
    /// A zero or oversized length is treated as a false marker: one byte is dropped and
    /// the scan continues.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.buf.iter().position(|&b| b == INBOUND_MARKER) {
                Some(0) => {}
                Some(n) => {
                    self.buf.advance(n);
                    self.skipped += n;
                }
                None => {
                    self.skipped += self.buf.len();
                    self.buf.clear();
                    return None;
                }
            }
            if self.buf.len() < HEADER_LEN {
                return None;
            }
            let len = u16::from_le_bytes([self.buf[1], self.buf[2]]) as usize;
            if len == 0 || len > MAX_FRAME_SIZE {
                self.buf.advance(1);
                self.skipped += 1;
                continue;
            }
            if self.buf.len() < HEADER_LEN + len {
                return None;
            }
            self.buf.advance(HEADER_LEN);
            return Some(self.buf.split_to(len).to_vec());
        }
    }
}

/// Wrap a command payload for sending to the radio.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = BytesMut::with_capacity(payload.len() + HEADER_LEN);
    out.put_u8(OUTBOUND_MARKER);
    out.put_u16_le(payload.len() as u16);
    out.put_slice(payload);
    out.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inbound(payload: &[u8]) -> Vec<u8> {
        let mut v = vec![INBOUND_MARKER];
        v.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        v.extend_from_slice(payload);
        v
    }

    #[test]
    fn split_chunks_reassemble() {
        let wire = inbound(&[5, 1, 2, 3]);
        let mut dec = FrameDecoder::new();
        dec.push(&wire[..2]);
        assert!(dec.next_frame().is_none());
        dec.push(&wire[2..]);
        assert_eq!(dec.next_frame(), Some(vec![5, 1, 2, 3]));
        assert!(dec.next_frame().is_none());
    }

    #[test]
    fn skips_boot_noise() {
        let mut wire = b"ESP-ROM:esp32s3\r\n".to_vec();
        wire.extend(inbound(&[0]));
        wire.extend(inbound(&[10]));
        let mut dec = FrameDecoder::new();
        dec.push(&wire);
        assert_eq!(dec.next_frame(), Some(vec![0]));
        assert_eq!(dec.next_frame(), Some(vec![10]));
        assert!(dec.skipped() > 0);
    }

    #[test]
    fn bogus_length_resyncs() {
        // '>' followed by a huge length, then a real frame
        let mut wire = vec![INBOUND_MARKER, 0xFF, 0xFF];
        wire.extend(inbound(&[0x83]));
        let mut dec = FrameDecoder::new();
        dec.push(&wire);
        assert_eq!(dec.next_frame(), Some(vec![0x83]));
    }

    #[test]
    fn encode_uses_outbound_marker() {
        assert_eq!(encode_frame(&[4]), vec![b'<', 1, 0, 4]);
    }
}
