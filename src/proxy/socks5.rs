//! SOCKS5 messages (RFC 1928 subset: no-auth CONNECT)
//!
//! Each message arrives as one frame payload, so parsing works on whole
//! slices rather than on a byte stream.

use super::{Address, ProxyError};

/// SOCKS5 version
pub const SOCKS_VERSION: u8 = 0x05;

/// Method selection reply ("no authentication"), as carried in the frame payload
pub const AUTH_REPLY: [u8; 6] = [0x00, 0x00, 0x00, 0x00, SOCKS_VERSION, 0x00];

/// CONNECT success reply with zeroed bound address and port
pub const CONNECT_SUCCESS_REPLY: [u8; 14] = [
    0x00, 0x00, 0x00, 0x00, SOCKS_VERSION, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// Offset of the address type byte in a CONNECT request
const ATYP_OFFSET: usize = 3;

/// Address types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AddressType {
    Ipv4 = 0x01,
    Domain = 0x03,
}

impl TryFrom<u8> for AddressType {
    type Error = ProxyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(AddressType::Ipv4),
            0x03 => Ok(AddressType::Domain),
            _ => Err(ProxyError::Unresolvable(value)),
        }
    }
}

/// A parsed CONNECT request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub command: u8,
    pub address: Address,
}

/// Validate a greeting; only the version byte is checked
pub fn parse_greeting(payload: &[u8]) -> Result<(), ProxyError> {
    match payload.first() {
        None => Err(ProxyError::EmptyMessage),
        Some(&SOCKS_VERSION) => Ok(()),
        Some(&other) => Err(ProxyError::InvalidSocksVersion(other)),
    }
}

/// Parse `05 cmd 00 atyp addr... port`
///
/// Unknown address types yield [`Address::Unsupported`] rather than an error
/// so the caller goes through the normal connect-failure path. For domains the
/// port is always the last two bytes of the message.
pub fn parse_connect_request(payload: &[u8]) -> Result<ConnectRequest, ProxyError> {
    if payload.is_empty() {
        return Err(ProxyError::EmptyMessage);
    }
    if payload.len() <= ATYP_OFFSET {
        return Err(ProxyError::MalformedRequest(format!(
            "{} bytes, no address type",
            payload.len()
        )));
    }

    let command = payload[1];
    let atyp = payload[ATYP_OFFSET];

    let address = match AddressType::try_from(atyp) {
        Ok(AddressType::Ipv4) => {
            let body = &payload[ATYP_OFFSET + 1..];
            if body.len() < 6 {
                return Err(ProxyError::MalformedRequest(format!(
                    "IPv4 address needs 6 bytes, got {}",
                    body.len()
                )));
            }
            let ip = [body[0], body[1], body[2], body[3]];
            Address::Ipv4(ip, u16::from_be_bytes([body[4], body[5]]))
        }
        Ok(AddressType::Domain) => {
            // prefix + length byte + port
            let n = payload.len();
            if n < ATYP_OFFSET + 2 + 2 {
                return Err(ProxyError::MalformedRequest(format!(
                    "domain request too short: {} bytes",
                    n
                )));
            }
            let host = String::from_utf8_lossy(&payload[ATYP_OFFSET + 2..n - 2]).to_string();
            Address::Domain(host, u16::from_be_bytes([payload[n - 2], payload[n - 1]]))
        }
        Err(_) => Address::Unsupported(atyp),
    };

    Ok(ConnectRequest { command, address })
}
