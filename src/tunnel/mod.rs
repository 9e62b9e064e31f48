//! Tunnel layer - channel multiplexing over the physical connection
//!
//! Provides:
//! - Frame encoding/decoding
//! - The 65,536-slot channel pool
//! - Per-channel SOCKS5 handshake and relay
//! - The dispatcher reading frames off the wire

mod channel;
mod dispatcher;
mod frame;
mod pool;
mod relay;

pub use channel::{ChannelState, ChannelWriter, LogicalChannel};
pub use crate::transport::Lease;
pub use dispatcher::Dispatcher;
pub use frame::{
    encode_frame, write_header_in_place, ChannelId, Frame, FrameHeader, FRAME_HEADER_SIZE,
    MAX_PAYLOAD_SIZE,
};
pub use pool::{ChannelHandle, ChannelPool, FreeList};
pub use relay::RelayEnd;

use std::time::Duration;
use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Frame too large: {0} > {1}")]
    FrameTooLarge(usize, usize),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Connect to {0} timed out")]
    ConnectTimeout(String),

    #[error("Connect to {addr} failed: {source}")]
    ConnectFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Proxy error: {0}")]
    Proxy(#[from] crate::proxy::ProxyError),

    #[error("Transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),
}

/// Number of addressable channels
pub const MAX_CHANNELS: usize = 1 << 16;

/// Default destination connect timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Default destination read timeout
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Default relay buffer, including the reserved header bytes
pub const DEFAULT_RELAY_BUFFER_SIZE: usize = 4096;

/// Per-channel tunables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSettings {
    /// Bound on opening the destination session
    pub connect_timeout: Duration,
    /// Bound on one destination read in the relay loop
    pub read_timeout: Duration,
    /// Relay buffer size; the first `FRAME_HEADER_SIZE` bytes hold the header
    pub relay_buffer_size: usize,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            relay_buffer_size: DEFAULT_RELAY_BUFFER_SIZE,
        }
    }
}
