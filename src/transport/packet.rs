//! Datagram adapter over a WebSocket connection
//!
//! One binary WebSocket frame carries exactly one datagram. The write side
//! is shared between many flows, so it lives behind an async mutex taken
//! only for the duration of a single frame; the read side is owned by one
//! session read loop.

use tokio::sync::Mutex;

use super::{WsFrame, WsReadHalf, WsWriteHalf, CLOSE_NORMAL};
use crate::error::TransportError;

/// Shared datagram write half
pub struct WsPacketWriter {
    half: Mutex<Box<dyn WsWriteHalf>>,
}

impl WsPacketWriter {
    /// Wrap a write half for shared datagram sending
    #[must_use]
    pub fn new(half: Box<dyn WsWriteHalf>) -> Self {
        Self {
            half: Mutex::new(half),
        }
    }

    /// Send one datagram as a single binary frame.
    ///
    /// # Errors
    ///
    /// Returns the transport error from the underlying write.
    pub async fn send(&self, datagram: Vec<u8>) -> Result<(), TransportError> {
        let mut half = self.half.lock().await;
        half.write(WsFrame::Binary(datagram)).await
    }

    /// Close the channel with a normal-closure frame.
    pub async fn close(&self, reason: &str) {
        let mut half = self.half.lock().await;
        let _ = half.close(CLOSE_NORMAL, reason).await;
    }
}

/// Exclusive datagram read half
pub struct WsPacketReader {
    half: Box<dyn WsReadHalf>,
}

impl WsPacketReader {
    /// Wrap a read half for datagram receiving
    #[must_use]
    pub fn new(half: Box<dyn WsReadHalf>) -> Self {
        Self { half }
    }

    /// Receive the next datagram, skipping control frames.
    ///
    /// Returns `None` once the peer has closed the channel.
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        loop {
            match self.half.read().await {
                Ok(WsFrame::Binary(data)) => return Ok(Some(data)),
                Ok(WsFrame::Close(_)) => return Ok(None),
                Ok(_) => continue,
                Err(TransportError::Closed) => return Ok(None),
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    struct ScriptedRead {
        frames: VecDeque<WsFrame>,
    }

    #[async_trait]
    impl WsReadHalf for ScriptedRead {
        async fn read(&mut self) -> Result<WsFrame, TransportError> {
            self.frames.pop_front().ok_or(TransportError::Closed)
        }
    }

    #[tokio::test]
    async fn test_recv_skips_non_binary() {
        let mut reader = WsPacketReader::new(Box::new(ScriptedRead {
            frames: vec![
                WsFrame::Ping(vec![1]),
                WsFrame::Text(b"ignored".to_vec()),
                WsFrame::Binary(vec![9, 9]),
            ]
            .into(),
        }));
        assert_eq!(reader.recv().await.unwrap(), Some(vec![9, 9]));
        assert_eq!(reader.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_recv_close_frame_ends_stream() {
        let mut reader = WsPacketReader::new(Box::new(ScriptedRead {
            frames: vec![WsFrame::Close(Some((1000, String::new())))].into(),
        }));
        assert_eq!(reader.recv().await.unwrap(), None);
    }
}
