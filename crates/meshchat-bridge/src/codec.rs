//! Wire framing for the peripheral serial link
//!
//! Every frame is a 4-byte ASCII tag, a little-endian `u16` payload length
//! and the payload itself:
//!
//! ```text
//! +------+------+------+------+--------+--------+-------------------+
//! | tag0 | tag1 | tag2 | tag3 | len lo | len hi | payload (len B)   |
//! +------+------+------+------+--------+--------+-------------------+
//! ```
//!
//! Payloads are UTF-8 text (plain lines or JSON objects) and never exceed
//! [`MAX_PAYLOAD`] bytes. The free functions here are pure; the receive
//! side uses the buffered [`FrameDecoder`], which skips misaligned bytes up
//! to the next inbound tag instead of dropping everything it holds.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use tracing::{debug, trace};

use crate::error::{BridgeError, Result};

/// Maximum payload size carried by one frame
pub const MAX_PAYLOAD: usize = 60_000;

/// Size of the tag field
pub const TAG_LEN: usize = 4;

/// Size of the length field
pub const LENGTH_LEN: usize = 2;

/// Size of the full frame header (tag + length)
pub const HEADER_LEN: usize = TAG_LEN + LENGTH_LEN;

/// Which way a frame travels on the serial link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Core to peripheral
    ToPeripheral,
    /// Peripheral to core
    FromPeripheral,
}

/// Known frame tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameTag {
    /// `TXTP` - plain text line for the display
    TextOut,
    /// `JCTL` - structured control payload (JSON object)
    ControlOut,
    /// `TXIN` - text or command line typed on the peripheral
    TextIn,
    /// `EVNT` - legacy structured event from the peripheral (JSON object)
    EventIn,
}

impl FrameTag {
    /// All known tags
    pub const ALL: [FrameTag; 4] = [
        FrameTag::TextOut,
        FrameTag::ControlOut,
        FrameTag::TextIn,
        FrameTag::EventIn,
    ];

    /// Raw tag bytes as they appear on the wire
    pub const fn as_bytes(self) -> &'static [u8; TAG_LEN] {
        match self {
            FrameTag::TextOut => b"TXTP",
            FrameTag::ControlOut => b"JCTL",
            FrameTag::TextIn => b"TXIN",
            FrameTag::EventIn => b"EVNT",
        }
    }

    /// Match raw bytes against the known tags
    pub fn from_bytes(raw: &[u8; TAG_LEN]) -> Option<Self> {
        Self::ALL.into_iter().find(|tag| tag.as_bytes() == raw)
    }

    /// Direction this tag is valid for
    pub fn direction(self) -> Direction {
        match self {
            FrameTag::TextOut | FrameTag::ControlOut => Direction::ToPeripheral,
            FrameTag::TextIn | FrameTag::EventIn => Direction::FromPeripheral,
        }
    }

    /// Whether the core accepts this tag on its receive side
    pub fn is_inbound(self) -> bool {
        self.direction() == Direction::FromPeripheral
    }
}

impl fmt::Display for FrameTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Tags are ASCII literals
        let raw = self.as_bytes();
        write!(
            f,
            "{}{}{}{}",
            raw[0] as char, raw[1] as char, raw[2] as char, raw[3] as char
        )
    }
}

/// A decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame purpose
    pub tag: FrameTag,
    /// Raw payload bytes
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame from a tag and payload
    pub fn new(tag: FrameTag, payload: impl Into<Bytes>) -> Self {
        Self {
            tag,
            payload: payload.into(),
        }
    }

    /// Payload decoded as text (lossy, whitespace trimmed)
    pub fn text(&self) -> String {
        decode_text(&self.payload)
    }

    /// Encode this frame for the wire
    pub fn encode(&self) -> Result<Bytes> {
        encode(self.tag, &self.payload)
    }
}

/// Encode a tag and payload into wire bytes
///
/// Fails with [`BridgeError::PayloadTooLarge`] if the payload exceeds
/// [`MAX_PAYLOAD`].
pub fn encode(tag: FrameTag, payload: &[u8]) -> Result<Bytes> {
    if payload.len() > MAX_PAYLOAD {
        return Err(BridgeError::PayloadTooLarge {
            size: payload.len(),
            max: MAX_PAYLOAD,
        });
    }

    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_slice(tag.as_bytes());
    buf.put_u16_le(payload.len() as u16);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Extract the raw 4-byte tag from a header slice
///
/// Only the length is checked; matching against known tags is left to
/// [`FrameTag::from_bytes`] so the caller can decide how to resync.
pub fn decode_header(bytes: &[u8]) -> Result<[u8; TAG_LEN]> {
    bytes
        .get(..TAG_LEN)
        .and_then(|raw| <[u8; TAG_LEN]>::try_from(raw).ok())
        .ok_or(BridgeError::Truncated {
            need: TAG_LEN,
            have: bytes.len(),
        })
}

/// Decode and validate a little-endian length field
///
/// Zero-length and oversized frames are rejected.
pub fn decode_length(bytes: [u8; LENGTH_LEN]) -> Result<usize> {
    let length = u16::from_le_bytes(bytes) as usize;
    if length == 0 || length > MAX_PAYLOAD {
        return Err(BridgeError::InvalidLength { length });
    }
    Ok(length)
}

/// Decode one complete frame from the front of `bytes`
///
/// Returns the frame and the number of bytes consumed. Empty payloads are
/// accepted here so that every encodable frame decodes; the live inbound
/// path rejects them through [`decode_length`].
pub fn decode(bytes: &[u8]) -> Result<(Frame, usize)> {
    let raw = decode_header(bytes)?;
    let tag = FrameTag::from_bytes(&raw).ok_or(BridgeError::UnknownTag { tag: raw })?;

    if bytes.len() < HEADER_LEN {
        return Err(BridgeError::Truncated {
            need: HEADER_LEN,
            have: bytes.len(),
        });
    }
    let length = u16::from_le_bytes([bytes[TAG_LEN], bytes[TAG_LEN + 1]]) as usize;
    if length > MAX_PAYLOAD {
        return Err(BridgeError::InvalidLength { length });
    }

    let total = HEADER_LEN + length;
    if bytes.len() < total {
        return Err(BridgeError::Truncated {
            need: total,
            have: bytes.len(),
        });
    }

    let payload = Bytes::copy_from_slice(&bytes[HEADER_LEN..total]);
    Ok((Frame { tag, payload }, total))
}

/// Decode a payload as UTF-8, replacing invalid sequences, and trim it
pub fn decode_text(payload: &[u8]) -> String {
    String::from_utf8_lossy(payload).trim().to_string()
}

/// Truncate text to at most `max` bytes without splitting a character
pub fn truncate_utf8(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// One step of [`FrameDecoder::next_step`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeStep {
    /// A complete inbound frame
    Frame(Frame),
    /// The buffer holds no complete frame yet
    NeedMore,
    /// Misaligned bytes were skipped
    Resynced {
        /// Bytes dropped from the front of the buffer
        skipped: usize,
        /// No candidate tag was left, the whole buffer was dropped
        exhausted: bool,
    },
}

/// Receive-side frame decoder over a growing byte buffer
///
/// Bytes read from the transport are appended with [`extend`](Self::extend)
/// and frames are pulled out with [`next_step`](Self::next_step). When the
/// front of the buffer is not an inbound tag, or carries an invalid length,
/// the decoder advances to the next position that starts (or may start) an
/// inbound tag, so a valid frame right behind garbage survives.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    /// Create an empty decoder
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(HEADER_LEN + 1024),
        }
    }

    /// Append received bytes
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet decoded
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Drop everything buffered, returning the number of bytes lost
    pub fn clear(&mut self) -> usize {
        let lost = self.buf.len();
        self.buf.clear();
        lost
    }

    /// Try to take the next frame from the front of the buffer
    pub fn next_step(&mut self) -> DecodeStep {
        if self.buf.len() < TAG_LEN {
            return self.check_partial_tag();
        }

        let raw = [self.buf[0], self.buf[1], self.buf[2], self.buf[3]];
        let tag = match FrameTag::from_bytes(&raw) {
            Some(tag) if tag.is_inbound() => tag,
            _ => {
                debug!(tag = ?raw, "Unexpected frame tag");
                return self.skip_to_tag(1);
            }
        };

        if self.buf.len() < HEADER_LEN {
            return DecodeStep::NeedMore;
        }
        let length = match decode_length([self.buf[TAG_LEN], self.buf[TAG_LEN + 1]]) {
            Ok(length) => length,
            Err(e) => {
                debug!(%tag, error = %e, "Rejected frame header");
                return self.skip_to_tag(1);
            }
        };

        let total = HEADER_LEN + length;
        if self.buf.len() < total {
            trace!(have = self.buf.len(), need = total, "Waiting for complete frame");
            return DecodeStep::NeedMore;
        }

        let mut frame = self.buf.split_to(total);
        frame.advance(HEADER_LEN);
        DecodeStep::Frame(Frame::new(tag, frame.freeze()))
    }

    /// A short buffer must at least be the start of an inbound tag
    fn check_partial_tag(&mut self) -> DecodeStep {
        if self.buf.is_empty() || starts_inbound_tag(&self.buf) {
            DecodeStep::NeedMore
        } else {
            self.skip_to_tag(1)
        }
    }

    /// Advance to the first candidate tag at or after `from`
    fn skip_to_tag(&mut self, from: usize) -> DecodeStep {
        let found = (from..self.buf.len()).find(|&pos| starts_inbound_tag(&self.buf[pos..]));
        match found {
            Some(pos) => {
                self.buf.advance(pos);
                DecodeStep::Resynced {
                    skipped: pos,
                    exhausted: false,
                }
            }
            None => DecodeStep::Resynced {
                skipped: self.clear(),
                exhausted: true,
            },
        }
    }
}

/// Whether `bytes` begins with an inbound tag, or with a prefix of one
/// when fewer than [`TAG_LEN`] bytes are available
fn starts_inbound_tag(bytes: &[u8]) -> bool {
    let n = bytes.len().min(TAG_LEN);
    FrameTag::ALL
        .into_iter()
        .filter(|tag| tag.is_inbound())
        .any(|tag| tag.as_bytes()[..n] == bytes[..n])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let framed = encode(FrameTag::TextOut, b"hello").unwrap();

        assert_eq!(&framed[..4], b"TXTP");
        assert_eq!(u16::from_le_bytes([framed[4], framed[5]]), 5);
        assert_eq!(&framed[6..], b"hello");
    }

    #[test]
    fn test_round_trip_all_tags() {
        for tag in FrameTag::ALL {
            for len in [0usize, 1, 255, 256, 4096, MAX_PAYLOAD] {
                let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
                let framed = encode(tag, &payload).unwrap();
                let (frame, used) = decode(&framed).unwrap();
                assert_eq!(frame.tag, tag);
                assert_eq!(frame.payload.as_ref(), payload.as_slice());
                assert_eq!(used, framed.len());
            }
        }
    }

    #[test]
    fn test_payload_too_large() {
        let payload = vec![b'x'; MAX_PAYLOAD + 1];
        let err = encode(FrameTag::TextOut, &payload).unwrap_err();
        assert!(matches!(
            err,
            BridgeError::PayloadTooLarge {
                size: 60_001,
                max: 60_000
            }
        ));
    }

    #[test]
    fn test_decode_header() {
        assert_eq!(decode_header(b"TXINxx").unwrap(), *b"TXIN");
        assert!(matches!(
            decode_header(b"TX"),
            Err(BridgeError::Truncated { need: 4, have: 2 })
        ));
    }

    #[test]
    fn test_tag_lookup() {
        assert_eq!(FrameTag::from_bytes(b"EVNT"), Some(FrameTag::EventIn));
        assert_eq!(FrameTag::from_bytes(b"txin"), None);
        assert!(FrameTag::TextIn.is_inbound());
        assert!(!FrameTag::ControlOut.is_inbound());
        assert_eq!(FrameTag::ControlOut.to_string(), "JCTL");
    }

    #[test]
    fn test_decode_length_bounds() {
        assert!(decode_length([0, 0]).is_err());
        assert_eq!(decode_length([1, 0]).unwrap(), 1);
        assert_eq!(decode_length(60_000u16.to_le_bytes()).unwrap(), 60_000);
        assert!(matches!(
            decode_length(60_001u16.to_le_bytes()),
            Err(BridgeError::InvalidLength { length: 60_001 })
        ));
    }

    #[test]
    fn test_decode_rejects_unknown_tag() {
        let mut framed = encode(FrameTag::TextIn, b"hi").unwrap().to_vec();
        framed[0] = b'Z';
        assert!(decode(&framed).unwrap_err().is_desync());
    }

    #[test]
    fn test_decode_partial_frame() {
        let framed = encode(FrameTag::TextIn, b"partial").unwrap();
        let err = decode(&framed[..8]).unwrap_err();
        assert!(matches!(err, BridgeError::Truncated { need: 13, have: 8 }));
    }

    #[test]
    fn test_decode_text_replaces_invalid_utf8() {
        let text = decode_text(b"  caf\xC3\xA9 \xFF\n");
        assert_eq!(text, "caf\u{e9} \u{FFFD}");
    }

    #[test]
    fn test_truncate_utf8_on_char_boundary() {
        assert_eq!(truncate_utf8("hello", 10), "hello");
        assert_eq!(truncate_utf8("hello", 3), "hel");
        // 'é' is two bytes; cutting inside it backs off to the boundary
        assert_eq!(truncate_utf8("caf\u{e9}", 4), "caf");
    }

    fn drain(decoder: &mut FrameDecoder) -> Vec<DecodeStep> {
        let mut steps = Vec::new();
        loop {
            match decoder.next_step() {
                DecodeStep::NeedMore => return steps,
                step => steps.push(step),
            }
        }
    }

    #[test]
    fn test_decoder_recovers_frame_behind_garbage() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(b"\x00\xffgarbage!");
        decoder.extend(&encode(FrameTag::TextIn, b"hello").unwrap());

        let steps = drain(&mut decoder);
        assert_eq!(
            steps,
            vec![
                DecodeStep::Resynced {
                    skipped: 10,
                    exhausted: false
                },
                DecodeStep::Frame(Frame::new(FrameTag::TextIn, &b"hello"[..])),
            ]
        );
        assert!(decoder.is_empty());
    }

    #[test]
    fn test_decoder_split_delivery() {
        let framed = encode(FrameTag::EventIn, br#"{"text":"hi"}"#).unwrap();
        let mut decoder = FrameDecoder::new();

        for chunk in framed.chunks(3) {
            assert!(drain(&mut decoder).is_empty());
            decoder.extend(chunk);
        }
        let steps = drain(&mut decoder);
        assert!(matches!(&steps[..], [DecodeStep::Frame(f)] if f.tag == FrameTag::EventIn));
    }

    #[test]
    fn test_decoder_bad_length_skips_to_next_tag() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(b"TXIN\x00\x00");
        decoder.extend(&encode(FrameTag::TextIn, b"ok").unwrap());

        let steps = drain(&mut decoder);
        assert_eq!(steps.len(), 2);
        assert!(matches!(
            steps[0],
            DecodeStep::Resynced {
                skipped: 6,
                exhausted: false
            }
        ));
        assert!(matches!(&steps[1], DecodeStep::Frame(f) if f.text() == "ok"));
    }

    #[test]
    fn test_decoder_exhausted_without_candidate() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(b"TXTP\x04\x00echo");

        assert_eq!(
            drain(&mut decoder),
            vec![DecodeStep::Resynced {
                skipped: 10,
                exhausted: true
            }]
        );
        assert!(decoder.is_empty());
    }

    #[test]
    fn test_decoder_keeps_partial_tag() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(b"junkTX");

        assert_eq!(
            drain(&mut decoder),
            vec![DecodeStep::Resynced {
                skipped: 4,
                exhausted: false
            }]
        );
        assert_eq!(decoder.buffered(), 2);

        decoder.extend(b"IN\x01\x00!");
        assert!(matches!(&drain(&mut decoder)[..], [DecodeStep::Frame(f)] if f.text() == "!"));
    }
}
