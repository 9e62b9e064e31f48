//! Frame encoding/decoding for the tunnel protocol
//!
//! Frame format:
//! ```text
//! +--------+--------+--------+--------+
//! |   Channel ID    |     Length      |
//! +--------+--------+--------+--------+
//! |              Payload              |
//! +--------+--------+--------+--------+
//! ```
//!
//! Both header fields are big endian. A zero length is a close signal for
//! the channel and carries no payload.

use super::TunnelError;
use bytes::{BufMut, Bytes, BytesMut};

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 4;

/// Maximum payload size
pub const MAX_PAYLOAD_SIZE: usize = u16::MAX as usize;

/// Logical channel identifier
pub type ChannelId = u16;

/// Decoded frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub channel_id: ChannelId,
    pub length: u16,
}

impl FrameHeader {
    /// Decode a 4-byte header
    pub fn decode(buf: [u8; FRAME_HEADER_SIZE]) -> Self {
        Self {
            channel_id: u16::from_be_bytes([buf[0], buf[1]]),
            length: u16::from_be_bytes([buf[2], buf[3]]),
        }
    }

    /// Encode to 4 bytes
    pub fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        let id = self.channel_id.to_be_bytes();
        let len = self.length.to_be_bytes();
        [id[0], id[1], len[0], len[1]]
    }

    /// Whether this header is a close signal
    pub fn is_close(&self) -> bool {
        self.length == 0
    }
}

/// A protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub channel_id: ChannelId,
    pub payload: Bytes,
}

impl Frame {
    /// Create a data frame
    pub fn data(channel_id: ChannelId, payload: Bytes) -> Self {
        Self { channel_id, payload }
    }

    /// Create a close frame
    pub fn close(channel_id: ChannelId) -> Self {
        Self {
            channel_id,
            payload: Bytes::new(),
        }
    }

    /// Whether this frame is a close signal
    pub fn is_close(&self) -> bool {
        self.payload.is_empty()
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Result<BytesMut, TunnelError> {
        let len = self.payload.len();
        if len > MAX_PAYLOAD_SIZE {
            return Err(TunnelError::FrameTooLarge(len, MAX_PAYLOAD_SIZE));
        }

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + len);
        buf.put_u16(self.channel_id);
        buf.put_u16(len as u16);
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }
}

/// Encode `payload` as a frame for `channel_id`
pub fn encode_frame(channel_id: ChannelId, payload: &[u8]) -> Result<BytesMut, TunnelError> {
    Frame::data(channel_id, Bytes::copy_from_slice(payload)).encode()
}

/// Write the header into the first 4 bytes of `buf`, framing the rest as payload
///
/// Lets a reader fill `buf[FRAME_HEADER_SIZE..]` directly and send without
/// copying.
pub fn write_header_in_place(buf: &mut [u8], channel_id: ChannelId) -> Result<(), TunnelError> {
    if buf.len() < FRAME_HEADER_SIZE {
        return Err(TunnelError::InvalidFrame(format!(
            "buffer of {} bytes has no room for a header",
            buf.len()
        )));
    }
    let payload_len = buf.len() - FRAME_HEADER_SIZE;
    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(TunnelError::FrameTooLarge(payload_len, MAX_PAYLOAD_SIZE));
    }

    let header = FrameHeader {
        channel_id,
        length: payload_len as u16,
    };
    buf[..FRAME_HEADER_SIZE].copy_from_slice(&header.encode());
    Ok(())
}
