//! # xtunnel
//!
//! A single-connection tunnel multiplexer. One obfuscated TCP connection from a
//! peer carries up to 65,536 logical channels; each channel negotiates a SOCKS5
//! CONNECT and is then relayed to its destination.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Logical Channels                     │
//! │     (SOCKS5 greeting → CONNECT → relay, per id)      │
//! ├─────────────────────────────────────────────────────┤
//! │              Channel Pool / Dispatcher               │
//! │   (65,536-slot table, free list, frame routing)      │
//! ├─────────────────────────────────────────────────────┤
//! │                    Frame Codec                       │
//! │        (u16 channel id, u16 length, payload)         │
//! ├─────────────────────────────────────────────────────┤
//! │               Obfuscated Transport                   │
//! │      (XOR byte transform, serialized writes)         │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod obfuscation;
pub mod proxy;
pub mod transport;
pub mod tunnel;

pub use config::Config;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default listen port
pub const DEFAULT_PORT: u16 = 2011;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] proxy::ProxyError),

    #[error("Configuration error: {0}")]
    Config(String),
}
