/// Core types shared between the metadata cache and the routing layer
pub mod connection;

use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// A destination endpoint as host (name or literal address) plus TCP port.
///
/// The host is kept as a string because metadata may hand out DNS names;
/// resolution happens at connect time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TcpAddress {
    pub addr: String,
    pub port: u16,
}

impl TcpAddress {
    pub fn new(addr: impl Into<String>, port: u16) -> Self {
        Self {
            addr: addr.into(),
            port,
        }
    }

    /// Valid means usable as a connect target: non-empty host and a port.
    pub fn is_valid(&self) -> bool {
        !self.addr.trim().is_empty() && self.port > 0
    }
}

impl fmt::Display for TcpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.addr.contains(':') {
            write!(f, "[{}]:{}", self.addr, self.port)
        } else {
            write!(f, "{}:{}", self.addr, self.port)
        }
    }
}

/// Split `host[:port]` into its parts. Bracketed IPv6 literals are
/// supported; a missing port yields 0 so the caller can apply its default.
pub fn split_addr_port(value: &str) -> Result<(String, u16), AddrParseError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(AddrParseError::EmptyAddress);
    }

    if let Some(rest) = value.strip_prefix('[') {
        // [2001:db8::1]:3306 or [2001:db8::1]
        let end = rest.find(']').ok_or(AddrParseError::InvalidAddress)?;
        let host = rest[..end].to_string();
        let tail = &rest[end + 1..];
        if tail.is_empty() {
            return Ok((host, 0));
        }
        let port = tail
            .strip_prefix(':')
            .ok_or(AddrParseError::InvalidAddress)?;
        return Ok((host, parse_port(port)?));
    }

    match value.rfind(':') {
        // more than one ':' means an unbracketed IPv6 literal without port
        Some(_) if value.matches(':').count() > 1 => Ok((value.to_string(), 0)),
        Some(pos) => {
            let host = value[..pos].to_string();
            if host.is_empty() {
                return Err(AddrParseError::EmptyAddress);
            }
            Ok((host, parse_port(&value[pos + 1..])?))
        }
        None => Ok((value.to_string(), 0)),
    }
}

fn parse_port(value: &str) -> Result<u16, AddrParseError> {
    let number: u64 = value
        .parse()
        .map_err(|_| AddrParseError::InvalidPort(value.to_string()))?;
    if number == 0 || number > u64::from(u16::MAX) {
        return Err(AddrParseError::ImpossiblePort(number));
    }
    Ok(number as u16)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddrParseError {
    #[error("empty address")]
    EmptyAddress,

    #[error("invalid address")]
    InvalidAddress,

    #[error("invalid TCP port: '{0}' is not a number")]
    InvalidPort(String),

    #[error("invalid TCP port: impossible port number ({0})")]
    ImpossiblePort(u64),
}

/// Canonical 16-byte key for a client address, used by error accounting.
/// IPv4 addresses are mapped into the low bytes of the IPv6 form.
pub fn client_ip_array(addr: &SocketAddr) -> [u8; 16] {
    match addr.ip() {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}
