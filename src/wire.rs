//! Wire-format codecs
//!
//! A data object's content is `SegmentData := SegmentMetaHeader ||
//! SegmentPayload`. The payload of segment 0 begins with a [`FrameHeader`];
//! parity payloads begin with the frame packet length so a recovered tail
//! shard can be trimmed.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::WireError;
use crate::name::FrameClass;

/// Video frame header marker
pub const VIDEO_HEADER_MARKER: u16 = 0xf4d4;
/// Video frame body marker
pub const VIDEO_BODY_MARKER: u16 = 0xfb0d;
/// Audio markers, recognized for classification only
pub const AUDIO_HEADER_MARKER: u16 = 0xa4a4;
pub const AUDIO_BODY_MARKER: u16 = 0xabad;

/// Per-segment metadata stamped by the producer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SegmentMetaHeader {
    /// Nonce echoed from the matching pending interest, 0 if none
    pub nonce: u32,
    /// Producer time when the matched interest arrived, 0 if none
    pub interest_arrival_ms: u64,
    /// Producer publish time minus interest arrival, 0 if none
    pub generation_delay_ms: u32,
}

impl SegmentMetaHeader {
    pub const SIZE: usize = 16;

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.nonce);
        buf.put_u64_le(self.interest_arrival_ms);
        buf.put_u32_le(self.generation_delay_ms);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, WireError> {
        if buf.remaining() < Self::SIZE {
            return Err(WireError::Truncated {
                need: Self::SIZE,
                have: buf.remaining(),
            });
        }
        Ok(Self {
            nonce: buf.get_u32_le(),
            interest_arrival_ms: buf.get_u64_le(),
            generation_delay_ms: buf.get_u32_le(),
        })
    }
}

/// Segment content framing: meta header followed by the payload slice
pub struct SegmentData;

impl SegmentData {
    pub fn pack(meta: &SegmentMetaHeader, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(SegmentMetaHeader::SIZE + payload.len());
        meta.encode(&mut buf);
        buf.put_slice(payload);
        buf.freeze()
    }

    pub fn unpack(content: &Bytes) -> Result<(SegmentMetaHeader, Bytes), WireError> {
        let mut cursor = content.clone();
        let meta = SegmentMetaHeader::decode(&mut cursor)?;
        Ok((meta, content.slice(SegmentMetaHeader::SIZE..)))
    }
}

/// Header prepended to every encoded video frame before segmentation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameHeader {
    pub encoded_width: u32,
    pub encoded_height: u32,
    /// Codec timestamp (90 kHz units for VP8/VP9)
    pub timestamp: u32,
    /// Producer capture time, unix milliseconds
    pub capture_time_ms: i64,
    pub frame_type: FrameClass,
    pub complete: bool,
    /// Producer packet production rate at publish time
    pub packet_rate: f64,
    /// Producer publish time, unix milliseconds; playout paces on deltas
    /// of this field
    pub producer_timestamp_ms: i64,
}

impl FrameHeader {
    pub const SIZE: usize = 42;

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16_le(VIDEO_HEADER_MARKER);
        buf.put_u32_le(self.encoded_width);
        buf.put_u32_le(self.encoded_height);
        buf.put_u32_le(self.timestamp);
        buf.put_i64_le(self.capture_time_ms);
        buf.put_u8(if self.frame_type.is_key() { 1 } else { 0 });
        buf.put_u8(if self.complete { 1 } else { 0 });
        buf.put_f64_le(self.packet_rate);
        buf.put_i64_le(self.producer_timestamp_ms);
        buf.put_u16_le(VIDEO_BODY_MARKER);
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self, WireError> {
        if buf.remaining() < Self::SIZE {
            return Err(WireError::Truncated {
                need: Self::SIZE,
                have: buf.remaining(),
            });
        }
        let marker = buf.get_u16_le();
        if marker != VIDEO_HEADER_MARKER {
            return Err(WireError::BadHeaderMarker(marker));
        }
        let encoded_width = buf.get_u32_le();
        let encoded_height = buf.get_u32_le();
        let timestamp = buf.get_u32_le();
        let capture_time_ms = buf.get_i64_le();
        let frame_type = if buf.get_u8() != 0 {
            FrameClass::Key
        } else {
            FrameClass::Delta
        };
        let complete = buf.get_u8() != 0;
        let packet_rate = buf.get_f64_le();
        let producer_timestamp_ms = buf.get_i64_le();
        let body_marker = buf.get_u16_le();
        if body_marker != VIDEO_BODY_MARKER {
            return Err(WireError::BadBodyMarker(body_marker));
        }
        Ok(Self {
            encoded_width,
            encoded_height,
            timestamp,
            capture_time_ms,
            frame_type,
            complete,
            packet_rate,
            producer_timestamp_ms,
        })
    }

    /// True when the first payload bytes carry a video frame header
    pub fn is_video(payload: &[u8]) -> bool {
        payload.len() >= 2 && u16::from_le_bytes([payload[0], payload[1]]) == VIDEO_HEADER_MARKER
    }

    /// True when the first payload bytes carry an audio header
    pub fn is_audio(payload: &[u8]) -> bool {
        payload.len() >= 2 && u16::from_le_bytes([payload[0], payload[1]]) == AUDIO_HEADER_MARKER
    }
}

/// Whole-frame packet: header followed by the opaque codec bytes
pub struct FramePacket;

impl FramePacket {
    pub fn pack(header: &FrameHeader, codec_payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(FrameHeader::SIZE + codec_payload.len());
        header.encode(&mut buf);
        buf.put_slice(codec_payload);
        buf.freeze()
    }

    pub fn unpack(packet: &Bytes) -> Result<(FrameHeader, Bytes), WireError> {
        let mut cursor = packet.clone();
        let header = FrameHeader::decode(&mut cursor)?;
        Ok((header, packet.slice(FrameHeader::SIZE..)))
    }
}

/// Parity segment payload: frame packet length followed by the parity shard
pub struct ParityPayload;

impl ParityPayload {
    pub const LEN_PREFIX: usize = 4;

    pub fn pack(frame_len: u32, shard: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::LEN_PREFIX + shard.len());
        buf.put_u32_le(frame_len);
        buf.put_slice(shard);
        buf.freeze()
    }

    pub fn unpack(payload: &Bytes) -> Result<(u32, Bytes), WireError> {
        if payload.len() < Self::LEN_PREFIX {
            return Err(WireError::Truncated {
                need: Self::LEN_PREFIX,
                have: payload.len(),
            });
        }
        let frame_len = u32::from_le_bytes(payload[..4].try_into().unwrap());
        Ok((frame_len, payload.slice(Self::LEN_PREFIX..)))
    }
}

/// CRC-32 (IEEE) of a byte slice
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = !0u32;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xedb8_8320 & mask);
        }
    }
    !crc
}
