//! SOCKS5 negotiation carried inside logical channels
//!
//! Provides:
//! - Greeting validation
//! - CONNECT request parsing
//! - Fixed reply payloads

mod socks5;

pub use socks5::{
    parse_connect_request, parse_greeting, AddressType, ConnectRequest, AUTH_REPLY,
    CONNECT_SUCCESS_REPLY, SOCKS_VERSION,
};

use std::fmt;
use thiserror::Error;

/// Proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Invalid SOCKS version: {0}")]
    InvalidSocksVersion(u8),

    #[error("Empty SOCKS message")]
    EmptyMessage,

    #[error("Malformed CONNECT request: {0}")]
    MalformedRequest(String),

    #[error("Unresolvable destination (address type {0:#04x})")]
    Unresolvable(u8),
}

/// Proxy target address
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// IPv4 address and port
    Ipv4([u8; 4], u16),
    /// Domain name and port
    Domain(String, u16),
    /// Address type this tunnel does not resolve; connecting always fails
    Unsupported(u8),
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Ipv4(ip, port) => {
                write!(f, "{}.{}.{}.{}:{}", ip[0], ip[1], ip[2], ip[3], port)
            }
            Address::Domain(domain, port) => write!(f, "{}:{}", domain, port),
            Address::Unsupported(atyp) => write!(f, "<unsupported atyp {:#04x}>", atyp),
        }
    }
}
