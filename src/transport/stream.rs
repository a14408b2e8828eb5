//! Byte-stream adapter over a WebSocket connection
//!
//! Presents a split WebSocket connection as `AsyncRead + AsyncWrite` so the
//! Shadowsocks stream cipher can wrap it like any TCP socket. One binary
//! frame carries one write; reads drain frames into an internal buffer.
//!
//! WebSocket has no half-close, so `poll_shutdown` translates the stream
//! half-close into a normal-closure close frame (code 1000).

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::{WsFrame, WsReadHalf, WsWriteHalf, CLOSE_NORMAL};
use crate::error::TransportError;

type ReadFut =
    Pin<Box<dyn Future<Output = (Box<dyn WsReadHalf>, Result<WsFrame, TransportError>)> + Send>>;
type WriteFut =
    Pin<Box<dyn Future<Output = (Box<dyn WsWriteHalf>, Result<(), TransportError>)> + Send>>;

enum ReadState {
    Idle(Box<dyn WsReadHalf>),
    Pending(ReadFut),
    Eof,
}

enum WriteState {
    Idle(Box<dyn WsWriteHalf>),
    Writing(WriteFut, usize),
    Closing(WriteFut),
    Closed,
}

/// `AsyncRead + AsyncWrite` view of a WebSocket connection
pub struct WsByteStream {
    read: ReadState,
    write: WriteState,
    read_buffer: BytesMut,
}

impl WsByteStream {
    /// Wrap split connection halves into a byte stream
    #[must_use]
    pub fn new(write: Box<dyn WsWriteHalf>, read: Box<dyn WsReadHalf>) -> Self {
        Self {
            read: ReadState::Idle(read),
            write: WriteState::Idle(write),
            read_buffer: BytesMut::with_capacity(8192),
        }
    }
}

fn io_err(e: TransportError) -> io::Error {
    match e {
        TransportError::Closed => io::Error::new(io::ErrorKind::UnexpectedEof, e),
        other => io::Error::other(other),
    }
}

impl AsyncRead for WsByteStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;

        loop {
            if !this.read_buffer.is_empty() {
                let n = this.read_buffer.len().min(buf.remaining());
                buf.put_slice(&this.read_buffer[..n]);
                this.read_buffer.advance(n);
                return Poll::Ready(Ok(()));
            }

            match std::mem::replace(&mut this.read, ReadState::Eof) {
                ReadState::Idle(mut half) => {
                    let fut = Box::pin(async move {
                        let result = half.read().await;
                        (half, result)
                    });
                    this.read = ReadState::Pending(fut);
                }
                ReadState::Pending(mut fut) => match fut.as_mut().poll(cx) {
                    Poll::Pending => {
                        this.read = ReadState::Pending(fut);
                        return Poll::Pending;
                    }
                    Poll::Ready((half, Ok(frame))) => {
                        this.read = ReadState::Idle(half);
                        match frame {
                            WsFrame::Binary(data) | WsFrame::Text(data) => {
                                this.read_buffer.extend_from_slice(&data);
                            }
                            // Control frames carry no stream bytes; pongs are
                            // answered by the transport layer itself.
                            WsFrame::Ping(_) | WsFrame::Pong(_) => {}
                            WsFrame::Close(_) => {
                                this.read = ReadState::Eof;
                                return Poll::Ready(Ok(()));
                            }
                        }
                    }
                    Poll::Ready((_, Err(TransportError::Closed))) => {
                        this.read = ReadState::Eof;
                        return Poll::Ready(Ok(()));
                    }
                    Poll::Ready((_, Err(e))) => {
                        this.read = ReadState::Eof;
                        return Poll::Ready(Err(io_err(e)));
                    }
                },
                ReadState::Eof => return Poll::Ready(Ok(())),
            }
        }
    }
}

impl WsByteStream {
    /// Drive any in-flight write or close future to completion. Leaves the
    /// state `Idle` (frame written) or `Closed` (close finished / error).
    ///
    /// Returns the completed frame length when a data write finished.
    fn drive_write(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<Option<usize>>> {
        match &mut self.write {
            WriteState::Idle(_) | WriteState::Closed => Poll::Ready(Ok(None)),
            WriteState::Writing(fut, len) => {
                let len = *len;
                match fut.as_mut().poll(cx) {
                    Poll::Pending => Poll::Pending,
                    Poll::Ready((half, Ok(()))) => {
                        self.write = WriteState::Idle(half);
                        Poll::Ready(Ok(Some(len)))
                    }
                    Poll::Ready((_, Err(e))) => {
                        self.write = WriteState::Closed;
                        Poll::Ready(Err(io_err(e)))
                    }
                }
            }
            WriteState::Closing(fut) => match fut.as_mut().poll(cx) {
                Poll::Pending => Poll::Pending,
                // A failed close still leaves the stream closed.
                Poll::Ready((_, _)) => {
                    self.write = WriteState::Closed;
                    Poll::Ready(Ok(None))
                }
            },
        }
    }
}

impl AsyncWrite for WsByteStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;

        // Finish any previous frame first; its length is the accepted count
        // for the buffer the caller has been re-submitting.
        let had_pending = matches!(this.write, WriteState::Writing(..));
        match this.drive_write(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Ready(Ok(Some(len))) if had_pending => return Poll::Ready(Ok(len)),
            Poll::Ready(Ok(_)) => {}
        }

        let half = match std::mem::replace(&mut this.write, WriteState::Closed) {
            WriteState::Idle(half) => half,
            _ => {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "websocket write half closed",
                )));
            }
        };

        let data = buf.to_vec();
        let len = data.len();
        let mut half = half;
        let fut = Box::pin(async move {
            let result = half.write(WsFrame::Binary(data)).await;
            (half, result)
        });
        this.write = WriteState::Writing(fut, len);

        // Poll once so uncontended writes complete without an extra wakeup.
        match this.drive_write(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Ready(Ok(_)) => Poll::Ready(Ok(len)),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Frame writes flush as they complete; just drive any pending one.
        match self.drive_write(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Ready(Ok(_)) => Poll::Ready(Ok(())),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            match this.drive_write(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Ready(Ok(_)) => {}
            }
            match std::mem::replace(&mut this.write, WriteState::Closed) {
                WriteState::Idle(mut half) => {
                    let fut = Box::pin(async move {
                        let result = half.close(CLOSE_NORMAL, "").await;
                        (half, result)
                    });
                    this.write = WriteState::Closing(fut);
                }
                WriteState::Closed => return Poll::Ready(Ok(())),
                other => {
                    // Still in flight; keep driving.
                    this.write = other;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct ScriptedRead {
        frames: VecDeque<WsFrame>,
    }

    #[async_trait]
    impl WsReadHalf for ScriptedRead {
        async fn read(&mut self) -> Result<WsFrame, TransportError> {
            self.frames.pop_front().ok_or(TransportError::Closed)
        }
    }

    struct RecordingWrite {
        frames: Arc<Mutex<Vec<WsFrame>>>,
    }

    #[async_trait]
    impl WsWriteHalf for RecordingWrite {
        async fn write(&mut self, frame: WsFrame) -> Result<(), TransportError> {
            self.frames.lock().unwrap().push(frame);
            Ok(())
        }

        async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
            self.frames
                .lock()
                .unwrap()
                .push(WsFrame::Close(Some((code, reason.to_string()))));
            Ok(())
        }
    }

    fn stream_with(
        frames: Vec<WsFrame>,
    ) -> (WsByteStream, Arc<Mutex<Vec<WsFrame>>>) {
        let written = Arc::new(Mutex::new(Vec::new()));
        let stream = WsByteStream::new(
            Box::new(RecordingWrite {
                frames: written.clone(),
            }),
            Box::new(ScriptedRead {
                frames: frames.into(),
            }),
        );
        (stream, written)
    }

    #[tokio::test]
    async fn test_read_concatenates_binary_frames() {
        let (mut stream, _) = stream_with(vec![
            WsFrame::Binary(b"hello ".to_vec()),
            WsFrame::Binary(b"world".to_vec()),
        ]);
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn test_read_skips_control_frames() {
        let (mut stream, _) = stream_with(vec![
            WsFrame::Ping(b"p".to_vec()),
            WsFrame::Binary(b"data".to_vec()),
            WsFrame::Pong(Vec::new()),
        ]);
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"data");
    }

    #[tokio::test]
    async fn test_close_frame_is_eof() {
        let (mut stream, _) = stream_with(vec![
            WsFrame::Binary(b"tail".to_vec()),
            WsFrame::Close(Some((1000, String::new()))),
            WsFrame::Binary(b"never".to_vec()),
        ]);
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"tail");
    }

    #[tokio::test]
    async fn test_partial_reads_drain_buffer() {
        let (mut stream, _) = stream_with(vec![WsFrame::Binary(b"abcdef".to_vec())]);
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abcd");
        let mut rest = [0u8; 2];
        stream.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"ef");
    }

    #[tokio::test]
    async fn test_writes_become_binary_frames() {
        let (mut stream, written) = stream_with(vec![]);
        stream.write_all(b"one").await.unwrap();
        stream.write_all(b"two").await.unwrap();
        stream.flush().await.unwrap();
        let frames = written.lock().unwrap();
        assert_eq!(
            *frames,
            vec![
                WsFrame::Binary(b"one".to_vec()),
                WsFrame::Binary(b"two".to_vec()),
            ]
        );
    }

    #[tokio::test]
    async fn test_shutdown_sends_normal_closure() {
        let (mut stream, written) = stream_with(vec![]);
        stream.write_all(b"bye").await.unwrap();
        stream.shutdown().await.unwrap();
        let frames = written.lock().unwrap();
        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[1], WsFrame::Close(Some((1000, _)))));
    }

    #[tokio::test]
    async fn test_write_after_shutdown_fails() {
        let (mut stream, _) = stream_with(vec![]);
        stream.shutdown().await.unwrap();
        assert!(stream.write_all(b"late").await.is_err());
    }
}
