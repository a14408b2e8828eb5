//! Shadowsocks AEAD codecs over WebSocket transports
//!
//! Upstreams speak the classic Shadowsocks AEAD protocol; this module
//! adapts the `shadowsocks` crate's codecs to our WebSocket channels. TCP
//! connections wrap the byte-stream adapter with `ProxyClientStream`, which
//! writes the SOCKS-encoded target address once and encrypts everything
//! after it. UDP datagrams are sealed and opened one at a time:
//! `salt ‖ AEAD(addr ‖ payload)` per datagram, one datagram per binary
//! WebSocket frame.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use rand::RngCore;
use shadowsocks::config::{ServerConfig, ServerType};
use shadowsocks::context::{Context as SsContext, SharedContext};
use shadowsocks::crypto::v1::Cipher;
use shadowsocks::crypto::CipherKind;
use shadowsocks::relay::socks5::Address;
use shadowsocks::relay::tcprelay::ProxyClientStream;

pub use shadowsocks::relay::tcprelay::ProxyClientStream as SsClientStream;
use shadowsocks::ServerAddr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::ProtocolError;
use crate::socks::AddrKey;

/// Errors from cipher construction
#[derive(Debug, Error)]
pub enum CipherError {
    /// Unknown or unsupported method name
    #[error("unsupported cipher method: {0}")]
    InvalidMethod(String),

    /// Password rejected for the chosen method
    #[error("invalid secret: {0}")]
    InvalidSecret(String),
}

/// Supported Shadowsocks encryption methods.
///
/// The classic AEAD set, plus `plain` for tests and trusted links.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SsMethod {
    /// aes-128-gcm
    Aes128Gcm,
    /// aes-256-gcm
    Aes256Gcm,
    /// chacha20-ietf-poly1305
    Chacha20IetfPoly1305,
    /// No encryption
    Plain,
}

impl SsMethod {
    /// Parse a method name as it appears in configuration
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::InvalidMethod`] for unknown names.
    pub fn parse(s: &str) -> Result<Self, CipherError> {
        match s.to_ascii_lowercase().as_str() {
            "aes-128-gcm" => Ok(Self::Aes128Gcm),
            "aes-256-gcm" => Ok(Self::Aes256Gcm),
            "chacha20-ietf-poly1305" => Ok(Self::Chacha20IetfPoly1305),
            "plain" | "none" => Ok(Self::Plain),
            other => Err(CipherError::InvalidMethod(other.to_string())),
        }
    }

    /// The method name as written in configuration
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Aes128Gcm => "aes-128-gcm",
            Self::Aes256Gcm => "aes-256-gcm",
            Self::Chacha20IetfPoly1305 => "chacha20-ietf-poly1305",
            Self::Plain => "plain",
        }
    }

    const fn cipher_kind(self) -> CipherKind {
        match self {
            Self::Aes128Gcm => CipherKind::AES_128_GCM,
            Self::Aes256Gcm => CipherKind::AES_256_GCM,
            Self::Chacha20IetfPoly1305 => CipherKind::CHACHA20_POLY1305,
            Self::Plain => CipherKind::NONE,
        }
    }
}

impl fmt::Display for SsMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A ready-to-use Shadowsocks cipher for one upstream.
///
/// Cheap to clone; the derived key and crypto context are shared.
#[derive(Clone)]
pub struct SsCipher {
    context: SharedContext,
    config: Arc<ServerConfig>,
}

impl fmt::Debug for SsCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SsCipher")
            .field("method", &self.config.method())
            .finish_non_exhaustive()
    }
}

/// Select a cipher by method name and derive its key from `secret`.
///
/// # Errors
///
/// Returns [`CipherError`] when the method is unknown or the secret is
/// rejected for it.
pub fn pick_cipher(method: &str, secret: &str) -> Result<SsCipher, CipherError> {
    let method = SsMethod::parse(method)?;
    // The codec never dials this address itself; transports are provided by
    // the caller, so the configured endpoint is a placeholder.
    let addr = ServerAddr::SocketAddr(SocketAddr::from(([0, 0, 0, 0], 0)));
    let config = ServerConfig::new(addr, secret.to_string(), method.cipher_kind())
        .map_err(|e| CipherError::InvalidSecret(e.to_string()))?;
    Ok(SsCipher {
        context: SsContext::new_shared(ServerType::Local),
        config: Arc::new(config),
    })
}

impl SsCipher {
    /// The negotiated cipher kind
    #[must_use]
    pub fn method(&self) -> CipherKind {
        self.config.method()
    }

    /// Wrap a byte stream with the stream cipher, targeting `dst`.
    ///
    /// The SOCKS-encoded destination is written once, ahead of the first
    /// payload bytes, exactly as a Shadowsocks TCP client does.
    pub fn stream_conn<S>(&self, stream: S, dst: &AddrKey) -> ProxyClientStream<S>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        ProxyClientStream::from_stream(
            self.context.clone(),
            stream,
            &self.config,
            addr_to_ss(dst),
        )
    }

    /// Seal one datagram: `salt ‖ AEAD(addr ‖ payload ‖ tag)`.
    #[must_use]
    pub fn seal_packet(&self, dst: &AddrKey, payload: &[u8]) -> Vec<u8> {
        let kind = self.config.method();
        let salt_len = kind.salt_len();
        let tag_len = kind.tag_len();

        let mut salt = vec![0u8; salt_len];
        rand::thread_rng().fill_bytes(&mut salt);

        let mut buf = Vec::with_capacity(salt_len + dst.serialized_len() + payload.len() + tag_len);
        buf.extend_from_slice(&salt);
        dst.write_to(&mut buf);
        buf.extend_from_slice(payload);
        buf.resize(buf.len() + tag_len, 0);

        let mut cipher = Cipher::new(kind, self.config.key(), &salt);
        cipher.encrypt_packet(&mut buf[salt_len..]);
        buf
    }

    /// Open one datagram in place, returning the source address and the
    /// decrypted payload.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::BadDatagram`] when the packet is too short
    /// or fails authentication, and an address error when the plaintext does
    /// not start with a valid SOCKS address.
    pub fn open_packet<'a>(
        &self,
        pkt: &'a mut [u8],
    ) -> Result<(AddrKey, &'a [u8]), ProtocolError> {
        let kind = self.config.method();
        let salt_len = kind.salt_len();
        let tag_len = kind.tag_len();

        if pkt.len() < salt_len + tag_len {
            return Err(ProtocolError::BadDatagram("short packet"));
        }
        let (salt, data) = pkt.split_at_mut(salt_len);
        let mut cipher = Cipher::new(kind, self.config.key(), salt);
        if !cipher.decrypt_packet(data) {
            return Err(ProtocolError::BadDatagram("authentication failed"));
        }
        let plain = &data[..data.len() - tag_len];
        let (from, off) = crate::socks::parse_addr(plain, 0)?;
        Ok((from, &plain[off..]))
    }
}

fn addr_to_ss(key: &AddrKey) -> Address {
    use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
    match key {
        AddrKey::V4(octets, port) => Address::SocketAddress(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::from(*octets)),
            *port,
        )),
        AddrKey::V6(octets, port) => Address::SocketAddress(SocketAddr::new(
            IpAddr::V6(Ipv6Addr::from(*octets)),
            *port,
        )),
        AddrKey::Domain(d, port) => Address::DomainNameAddress(d.to_string(), *port),
    }
}
