//! Error types for ws-relay
//!
//! Errors are categorized by subsystem. Probe and standby failures are
//! absorbed into upstream state and never surface through these types;
//! everything a caller can observe is defined here.

use std::io;

use thiserror::Error;

/// Top-level error type for ws-relay
#[derive(Debug, Error)]
pub enum WsRelayError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Upstream selection errors
    #[error("Selection error: {0}")]
    Select(#[from] SelectError),

    /// WebSocket transport errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Active probe errors
    #[error("Probe error: {0}")]
    Probe(#[from] ProbeError),

    /// UDP flow-table errors
    #[error("Flow error: {0}")]
    Flow(#[from] FlowError),

    /// Wire-format errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Cooperative shutdown
    #[error("Operation cancelled")]
    Cancelled,

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// YAML parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

/// Upstream selection errors
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SelectError {
    /// No candidate satisfies health and cooldown constraints
    #[error("no healthy upstreams")]
    NoHealthyUpstream,
}

/// WebSocket transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// Endpoint URL could not be parsed
    #[error("invalid endpoint URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// DNS resolution failed
    #[error("DNS resolution failed for {addr}: {reason}")]
    Dns { addr: String, reason: String },

    /// TCP or TLS connection failed
    #[error("dial {addr} failed: {reason}")]
    Dial { addr: String, reason: String },

    /// Dial or handshake exceeded its deadline
    #[error("dial {addr}: timeout after {timeout_ms}ms")]
    Timeout { addr: String, timeout_ms: u64 },

    /// WebSocket upgrade handshake failed or was rejected
    #[error("websocket handshake failed: {0}")]
    Handshake(String),

    /// The URL requested a transport family this build does not carry
    #[error("transport family {family} not supported by this build")]
    FamilyUnsupported { family: &'static str },

    /// Frame read/write failed on an established connection
    #[error("websocket i/o: {0}")]
    Ws(String),

    /// The peer closed the connection
    #[error("websocket closed")]
    Closed,
}

impl TransportError {
    /// True if the connection never became usable (as opposed to dying later)
    #[must_use]
    pub fn is_dial_failure(&self) -> bool {
        !matches!(self, Self::Ws(_) | Self::Closed)
    }
}

/// Active probe errors, tagged by probe stage
#[derive(Debug, Error)]
pub enum ProbeError {
    /// WebSocket handshake to the endpoint failed
    #[error("liveness probe: {0}")]
    Liveness(TransportError),

    /// Shadowsocks stream opened but the HTTP exchange failed
    #[error("tcp quality probe: {0}")]
    TcpQuality(String),

    /// Encrypted datagram channel opened but the DNS exchange failed
    #[error("udp quality probe: {0}")]
    UdpQuality(String),
}

/// UDP flow-table errors
#[derive(Debug, Error)]
pub enum FlowError {
    /// Whole-table port-session limit reached
    #[error("udp port session limit reached: {limit}")]
    TableFull { limit: usize },

    /// Per-port destination limit reached
    #[error("udp destination limit reached for port session: {limit}")]
    DestinationsFull { limit: usize },

    /// No upstream available for the new session
    #[error(transparent)]
    Select(#[from] SelectError),

    /// Session creation or send failed
    #[error("udp session: {0}")]
    Session(String),
}

/// Wire-format errors (SOCKS addresses, datagram framing)
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Buffer ended before the address was complete
    #[error("short socks address")]
    ShortAddress,

    /// Unknown ATYP byte
    #[error("bad socks address type: {0:#04x}")]
    BadAtyp(u8),

    /// Address string is not SOCKS-addressable
    #[error("address not representable: {0}")]
    AddressNotSupported(String),

    /// Datagram failed authentication or was malformed
    #[error("bad datagram: {0}")]
    BadDatagram(&'static str),
}
