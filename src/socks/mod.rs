//! SOCKS address codec and compact address keys
//!
//! The Shadowsocks wire format prefixes every stream and datagram with a
//! SOCKS address: `ATYP ‖ ADDR ‖ PORT`. This module parses and encodes that
//! header and provides [`AddrKey`], a compact tagged union used to key the
//! UDP subscription tables. IP keys store fixed byte arrays so they are
//! copyable and hashable without allocation; only domain keys allocate, once
//! per distinct domain.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use crate::error::ProtocolError;

/// ATYP byte for IPv4 addresses
pub const ATYP_IPV4: u8 = 0x01;
/// ATYP byte for domain names
pub const ATYP_DOMAIN: u8 = 0x03;
/// ATYP byte for IPv6 addresses
pub const ATYP_IPV6: u8 = 0x04;

/// Maximum serialized length of a SOCKS address (domain form)
pub const MAX_ADDR_LEN: usize = 1 + 1 + 255 + 2;

/// Compact key identifying a SOCKS-addressable endpoint.
///
/// Used as the subscription key in the UDP session multiplexer and as the
/// canonical address type on the data path. `Eq`/`Hash` compare the raw
/// bytes, so `1.2.3.4:53` and a domain resolving to it are distinct keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AddrKey {
    /// IPv4 address and port
    V4([u8; 4], u16),
    /// IPv6 address and port
    V6([u8; 16], u16),
    /// Domain name (as sent on the wire, case preserved) and port
    Domain(Arc<str>, u16),
}

impl AddrKey {
    /// Build a key from a `host:port` string.
    ///
    /// IPv6 hosts must be bracketed (`[2001:db8::1]:443`). Returns `None`
    /// when the string has no port, the port does not parse, or the domain
    /// is empty or longer than 255 bytes.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        // Fast path: a full socket address.
        if let Ok(sa) = s.parse::<SocketAddr>() {
            return Some(Self::from(sa));
        }

        let (host, port) = s.rsplit_once(':')?;
        let port: u16 = port.parse().ok()?;
        Self::from_host_port(host, port)
    }

    /// Build a key from separate host and port.
    #[must_use]
    pub fn from_host_port(host: &str, port: u16) -> Option<Self> {
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(v4) = host.parse::<Ipv4Addr>() {
            return Some(Self::V4(v4.octets(), port));
        }
        if let Ok(v6) = host.parse::<Ipv6Addr>() {
            return Some(Self::V6(v6.octets(), port));
        }
        if host.is_empty() || host.len() > 255 {
            return None;
        }
        Some(Self::Domain(Arc::from(host), port))
    }

    /// The port component of the key
    #[must_use]
    pub fn port(&self) -> u16 {
        match self {
            Self::V4(_, p) | Self::V6(_, p) | Self::Domain(_, p) => *p,
        }
    }

    /// The host component rendered as a string (no brackets, no port)
    #[must_use]
    pub fn host_string(&self) -> String {
        match self {
            Self::V4(octets, _) => Ipv4Addr::from(*octets).to_string(),
            Self::V6(octets, _) => Ipv6Addr::from(*octets).to_string(),
            Self::Domain(d, _) => d.to_string(),
        }
    }

    /// Serialized length of the SOCKS encoding of this key
    #[must_use]
    pub fn serialized_len(&self) -> usize {
        match self {
            Self::V4(..) => 1 + 4 + 2,
            Self::V6(..) => 1 + 16 + 2,
            Self::Domain(d, _) => 1 + 1 + d.len() + 2,
        }
    }

    /// Append the SOCKS encoding `ATYP ‖ ADDR ‖ PORT` to `out`
    pub fn write_to(&self, out: &mut Vec<u8>) {
        match self {
            Self::V4(octets, port) => {
                out.push(ATYP_IPV4);
                out.extend_from_slice(octets);
                out.extend_from_slice(&port.to_be_bytes());
            }
            Self::V6(octets, port) => {
                out.push(ATYP_IPV6);
                out.extend_from_slice(octets);
                out.extend_from_slice(&port.to_be_bytes());
            }
            Self::Domain(d, port) => {
                out.push(ATYP_DOMAIN);
                out.push(d.len() as u8);
                out.extend_from_slice(d.as_bytes());
                out.extend_from_slice(&port.to_be_bytes());
            }
        }
    }

    /// The SOCKS encoding as a fresh buffer
    #[must_use]
    pub fn to_socks_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.serialized_len());
        self.write_to(&mut out);
        out
    }

    /// Convert to a socket address, if the key is an IP form
    #[must_use]
    pub fn to_socket_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::V4(octets, port) => {
                Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::from(*octets)), *port))
            }
            Self::V6(octets, port) => {
                Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(*octets)), *port))
            }
            Self::Domain(..) => None,
        }
    }
}

impl From<SocketAddr> for AddrKey {
    fn from(sa: SocketAddr) -> Self {
        match sa.ip() {
            IpAddr::V4(ip) => Self::V4(ip.octets(), sa.port()),
            IpAddr::V6(ip) => Self::V6(ip.octets(), sa.port()),
        }
    }
}

impl fmt::Display for AddrKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4(octets, port) => write!(f, "{}:{port}", Ipv4Addr::from(*octets)),
            Self::V6(octets, port) => write!(f, "[{}]:{port}", Ipv6Addr::from(*octets)),
            Self::Domain(d, port) => write!(f, "{d}:{port}"),
        }
    }
}

/// Parse a SOCKS address starting at `buf[off]` (the ATYP byte).
///
/// Returns the parsed key and the offset of the first byte after the port.
///
/// # Errors
///
/// Returns [`ProtocolError::ShortAddress`] when the buffer ends inside the
/// address and [`ProtocolError::BadAtyp`] on an unknown ATYP byte.
pub fn parse_addr(buf: &[u8], off: usize) -> Result<(AddrKey, usize), ProtocolError> {
    let atyp = *buf.get(off).ok_or(ProtocolError::ShortAddress)?;
    let mut off = off + 1;

    let key = match atyp {
        ATYP_IPV4 => {
            if buf.len() < off + 4 + 2 {
                return Err(ProtocolError::ShortAddress);
            }
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&buf[off..off + 4]);
            off += 4;
            let port = u16::from_be_bytes([buf[off], buf[off + 1]]);
            off += 2;
            AddrKey::V4(octets, port)
        }
        ATYP_DOMAIN => {
            let len = *buf.get(off).ok_or(ProtocolError::ShortAddress)? as usize;
            off += 1;
            if buf.len() < off + len + 2 {
                return Err(ProtocolError::ShortAddress);
            }
            let domain = std::str::from_utf8(&buf[off..off + len])
                .map_err(|_| ProtocolError::BadDatagram("domain not utf-8"))?;
            off += len;
            let port = u16::from_be_bytes([buf[off], buf[off + 1]]);
            off += 2;
            AddrKey::Domain(Arc::from(domain), port)
        }
        ATYP_IPV6 => {
            if buf.len() < off + 16 + 2 {
                return Err(ProtocolError::ShortAddress);
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[off..off + 16]);
            off += 16;
            let port = u16::from_be_bytes([buf[off], buf[off + 1]]);
            off += 2;
            AddrKey::V6(octets, port)
        }
        other => return Err(ProtocolError::BadAtyp(other)),
    };

    Ok((key, off))
}

/// Encode a `host:port` string as a SOCKS address.
///
/// # Errors
///
/// Returns [`ProtocolError::AddressNotSupported`] when the string is not a
/// valid SOCKS-addressable form.
pub fn encode_addr(dst: &str) -> Result<Vec<u8>, ProtocolError> {
    let key =
        AddrKey::parse(dst).ok_or_else(|| ProtocolError::AddressNotSupported(dst.to_string()))?;
    Ok(key.to_socks_bytes())
}
