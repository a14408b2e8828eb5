//! In-memory WebSocket connections for tests
//!
//! A [`ChannelWs`] reads frames from an unbounded channel held by the test
//! and records every written frame, so probe, standby, and session logic can
//! be exercised without sockets.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use super::{WsConn, WsFrame, WsReadHalf, WsWriteHalf};
use crate::error::TransportError;

/// Handle the test keeps to drive a [`ChannelWs`]
pub(crate) struct ChannelWsHandle {
    /// Feed frames that the connection's reader will observe
    pub tx: UnboundedSender<WsFrame>,
    /// Every frame written by the code under test, including closes
    pub written: Arc<Mutex<Vec<WsFrame>>>,
}

/// Create an in-memory connection and its driving handle
pub(crate) fn channel_ws() -> (ChannelWsHandle, ChannelWs) {
    let (tx, rx) = mpsc::unbounded_channel();
    let written = Arc::new(Mutex::new(Vec::new()));
    (
        ChannelWsHandle {
            tx,
            written: written.clone(),
        },
        ChannelWs { rx, written },
    )
}

/// Scripted in-memory WebSocket connection
pub(crate) struct ChannelWs {
    rx: UnboundedReceiver<WsFrame>,
    written: Arc<Mutex<Vec<WsFrame>>>,
}

#[async_trait]
impl WsConn for ChannelWs {
    async fn read(&mut self) -> Result<WsFrame, TransportError> {
        self.rx.recv().await.ok_or(TransportError::Closed)
    }

    async fn write(&mut self, frame: WsFrame) -> Result<(), TransportError> {
        self.written.lock().unwrap().push(frame);
        Ok(())
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        self.written
            .lock()
            .unwrap()
            .push(WsFrame::Close(Some((code, reason.to_string()))));
        Ok(())
    }

    fn split(self: Box<Self>) -> (Box<dyn WsWriteHalf>, Box<dyn WsReadHalf>) {
        (
            Box::new(ChannelWrite {
                written: self.written,
                closed: false,
            }),
            Box::new(ChannelRead { rx: self.rx }),
        )
    }
}

struct ChannelWrite {
    written: Arc<Mutex<Vec<WsFrame>>>,
    closed: bool,
}

#[async_trait]
impl WsWriteHalf for ChannelWrite {
    async fn write(&mut self, frame: WsFrame) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.written.lock().unwrap().push(frame);
        Ok(())
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        if !self.closed {
            self.closed = true;
            self.written
                .lock()
                .unwrap()
                .push(WsFrame::Close(Some((code, reason.to_string()))));
        }
        Ok(())
    }
}

struct ChannelRead {
    rx: UnboundedReceiver<WsFrame>,
}

#[async_trait]
impl WsReadHalf for ChannelRead {
    async fn read(&mut self) -> Result<WsFrame, TransportError> {
        self.rx.recv().await.ok_or(TransportError::Closed)
    }
}
