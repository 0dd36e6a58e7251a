//! Wire format for the reel stream.
//!
//! Every message starts with a fixed 7 byte header:
//!
//! ```text
//! magic (u16) | message type (u8) | payload length (u32)
//! ```
//!
//! All multi-byte integers on the wire are little-endian, including the width
//! and height carried in the preamble of an IMAGE payload. The magic `0xABCD`
//! therefore appears on the wire as `CD AB`.

pub mod reader;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

pub use reader::{ProtocolError, ProtocolReader, ReaderStats};

use crate::session::Resolution;

pub const MAGIC: u16 = 0xABCD;
pub const MAGIC_BYTES: [u8; 2] = MAGIC.to_le_bytes();
pub const HEADER_LEN: usize = 7;
pub const IMAGE_PREAMBLE_LEN: usize = 5;
pub const DEFAULT_MAX_PAYLOAD_LEN: u32 = 16 * 1024 * 1024;

pub type StreamId = u8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Image,
    Object,
    Mesh,
    Unknown(u8),
}

impl MessageType {
    pub fn from_wire(value: u8) -> Self {
        match value {
            0 => MessageType::Image,
            1 => MessageType::Object,
            2 => MessageType::Mesh,
            other => MessageType::Unknown(other),
        }
    }

    pub fn to_wire(self) -> u8 {
        match self {
            MessageType::Image => 0,
            MessageType::Object => 1,
            MessageType::Mesh => 2,
            MessageType::Unknown(other) => other,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            MessageType::Image => "image",
            MessageType::Object => "object",
            MessageType::Mesh => "mesh",
            MessageType::Unknown(_) => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: u16,
    pub message_type: u8,
    pub payload_length: u32,
}

impl FrameHeader {
    pub fn new(message_type: MessageType, payload_length: u32) -> Self {
        Self {
            magic: MAGIC,
            message_type: message_type.to_wire(),
            payload_length,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..2].copy_from_slice(&self.magic.to_le_bytes());
        buf[2] = self.message_type;
        buf[3..7].copy_from_slice(&self.payload_length.to_le_bytes());
        buf
    }

    /// Parses the raw header bytes. The magic is not validated here; the
    /// reader resynchronizes on it before a header is ever assembled.
    pub fn decode(bytes: &[u8; HEADER_LEN]) -> Self {
        Self {
            magic: u16::from_le_bytes([bytes[0], bytes[1]]),
            message_type: bytes[2],
            payload_length: u32::from_le_bytes([bytes[3], bytes[4], bytes[5], bytes[6]]),
        }
    }

    pub fn has_valid_magic(&self) -> bool {
        self.magic == MAGIC
    }

    pub fn kind(&self) -> MessageType {
        MessageType::from_wire(self.message_type)
    }
}

/// One complete frame as read off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub message_type: MessageType,
    pub payload: Bytes,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("image payload too short: {0} bytes, need at least {IMAGE_PREAMBLE_LEN}")]
    TooShort(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePayload {
    pub stream_id: StreamId,
    pub width: u16,
    pub height: u16,
    pub compressed: Bytes,
}

impl ImagePayload {
    /// Splits an IMAGE payload into its preamble and compressed data. The
    /// compressed slice shares the payload's allocation.
    pub fn parse(payload: &Bytes) -> Result<Self, PayloadError> {
        if payload.len() < IMAGE_PREAMBLE_LEN {
            return Err(PayloadError::TooShort(payload.len()));
        }
        Ok(Self {
            stream_id: payload[0],
            width: u16::from_le_bytes([payload[1], payload[2]]),
            height: u16::from_le_bytes([payload[3], payload[4]]),
            compressed: payload.slice(IMAGE_PREAMBLE_LEN..),
        })
    }

    pub fn resolution(&self) -> Resolution {
        Resolution::new(u32::from(self.width), u32::from(self.height))
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(IMAGE_PREAMBLE_LEN + self.compressed.len());
        buf.put_u8(self.stream_id);
        buf.put_u16_le(self.width);
        buf.put_u16_le(self.height);
        buf.extend_from_slice(&self.compressed);
        buf.freeze()
    }
}

/// Encodes a full frame (header plus payload).
pub fn encode_message(message_type: MessageType, payload: &[u8]) -> Result<Bytes, ProtocolError> {
    let len = u32::try_from(payload.len())
        .map_err(|_| ProtocolError::PayloadTooLarge(payload.len() as u64))?;
    let header = FrameHeader::new(message_type, len);
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    Ok(buf.freeze())
}

pub fn encode_image(image: &ImagePayload) -> Result<Bytes, ProtocolError> {
    encode_message(MessageType::Image, &image.encode())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        for (kind, len) in [
            (MessageType::Image, 9u32),
            (MessageType::Object, 0),
            (MessageType::Mesh, u32::MAX),
            (MessageType::Unknown(0x7f), 4096),
        ] {
            let header = FrameHeader::new(kind, len);
            let decoded = FrameHeader::decode(&header.encode());
            assert_eq!(decoded, header);
            assert!(decoded.has_valid_magic());
            assert_eq!(decoded.kind(), kind);
        }
    }

    #[test]
    fn header_is_little_endian() {
        let bytes = FrameHeader::new(MessageType::Image, 9).encode();
        assert_eq!(bytes, [0xCD, 0xAB, 0x00, 0x09, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn image_payload_splits_preamble() {
        let payload = Bytes::from_static(&[0x01, 0x80, 0x02, 0xE0, 0x01, 1, 2, 3, 4]);
        let image = ImagePayload::parse(&payload).expect("parse");
        assert_eq!(image.stream_id, 1);
        assert_eq!(image.width, 640);
        assert_eq!(image.height, 480);
        assert_eq!(image.compressed.as_ref(), &[1, 2, 3, 4]);
        assert_eq!(image.compressed.len(), payload.len() - IMAGE_PREAMBLE_LEN);
        assert_eq!(image.encode(), payload);
    }

    #[test]
    fn image_payload_rejects_short_preamble() {
        let payload = Bytes::from_static(&[0x01, 0x80, 0x02]);
        assert_eq!(ImagePayload::parse(&payload), Err(PayloadError::TooShort(3)));
    }

    #[test]
    fn unknown_types_keep_their_wire_value() {
        assert_eq!(MessageType::from_wire(9), MessageType::Unknown(9));
        assert_eq!(MessageType::Unknown(9).to_wire(), 9);
        assert_eq!(MessageType::from_wire(2), MessageType::Mesh);
    }
}
