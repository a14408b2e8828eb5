//! WebSocket transport layer
//!
//! Upstream endpoints are WebSocket URLs. The balancer and data path only
//! ever hold the abstract connection capability defined here — read a frame,
//! write a frame, close — so the concrete handshake family (HTTP/1.1
//! Upgrade today; Extended CONNECT variants are selected by URL hints) stays
//! an implementation detail of the dialer.
//!
//! Frame-oriented connections can be split into independent read and write
//! halves; the byte-stream and datagram adapters in [`stream`] and
//! [`packet`] are built on those halves.

mod hints;
mod packet;
mod stream;
#[cfg(test)]
pub(crate) mod testing;
mod websocket;

use async_trait::async_trait;

pub use self::hints::TransportHints;
pub use self::packet::{WsPacketReader, WsPacketWriter};
pub use self::stream::WsByteStream;
pub use self::websocket::{dial_ws, DIAL_BUDGET};

use crate::error::TransportError;

/// WebSocket close code for normal closure (RFC 6455 §7.4.1)
pub const CLOSE_NORMAL: u16 = 1000;

/// A single WebSocket frame, as seen by the data path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsFrame {
    /// Text frame (treated as opaque bytes on the data path)
    Text(Vec<u8>),
    /// Binary frame; one frame carries one datagram on packet channels
    Binary(Vec<u8>),
    /// Ping with its application payload
    Ping(Vec<u8>),
    /// Pong with its application payload
    Pong(Vec<u8>),
    /// Close, with optional code and reason
    Close(Option<(u16, String)>),
}

/// Abstract WebSocket connection capability.
///
/// The balancer holds standby connections as `Box<dyn WsConn>`; probes and
/// the standby liveness check run against this trait so tests can inject
/// scripted connections.
#[async_trait]
pub trait WsConn: Send {
    /// Read the next frame. Returns [`TransportError::Closed`] once the peer
    /// has closed and no more frames will arrive.
    async fn read(&mut self) -> Result<WsFrame, TransportError>;

    /// Write one frame.
    async fn write(&mut self, frame: WsFrame) -> Result<(), TransportError>;

    /// Close the connection with the given code and reason. Idempotent.
    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError>;

    /// Split into independently usable write and read halves.
    fn split(self: Box<Self>) -> (Box<dyn WsWriteHalf>, Box<dyn WsReadHalf>);
}

impl std::fmt::Debug for dyn WsConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn WsConn")
    }
}

/// Write half of a split connection
#[async_trait]
pub trait WsWriteHalf: Send {
    /// Write one frame.
    async fn write(&mut self, frame: WsFrame) -> Result<(), TransportError>;

    /// Send a close frame and flush it. Idempotent.
    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError>;
}

/// Read half of a split connection
#[async_trait]
pub trait WsReadHalf: Send {
    /// Read the next frame. Returns [`TransportError::Closed`] at end of
    /// stream.
    async fn read(&mut self) -> Result<WsFrame, TransportError>;
}
