//! Bidirectional copy between two async streams
//!
//! Used on every TCP data path: local endpoint on one side, encrypted
//! upstream stream on the other. When one direction reaches EOF its writer
//! is shut down so the half-close propagates (the WebSocket side translates
//! that into a normal-closure close frame, since WebSocket has no
//! half-close). The copy completes when both directions have finished; the
//! first non-EOF error is returned.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// Bytes moved by a completed bidirectional copy
#[derive(Debug, Clone, Copy, Default)]
pub struct CopyResult {
    /// Bytes copied from `a` to `b`
    pub a_to_b: u64,
    /// Bytes copied from `b` to `a`
    pub b_to_a: u64,
}

impl CopyResult {
    /// Total bytes moved in both directions
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.a_to_b + self.b_to_a
    }
}

struct TransferState {
    buf: Box<[u8]>,
    pos: usize,
    cap: usize,
    read_done: bool,
    write_done: bool,
    bytes: u64,
    error: Option<io::Error>,
}

impl TransferState {
    fn new() -> Self {
        Self {
            buf: vec![0u8; COPY_BUFFER_SIZE].into_boxed_slice(),
            pos: 0,
            cap: 0,
            read_done: false,
            write_done: false,
            bytes: 0,
            error: None,
        }
    }

    fn done(&self) -> bool {
        self.write_done || self.error.is_some()
    }

    fn poll_transfer<R, W>(
        &mut self,
        cx: &mut Context<'_>,
        mut reader: Pin<&mut R>,
        mut writer: Pin<&mut W>,
    ) -> Poll<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        loop {
            if self.pos < self.cap {
                match writer.as_mut().poll_write(cx, &self.buf[self.pos..self.cap]) {
                    Poll::Ready(Ok(0)) => {
                        self.error = Some(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "write zero bytes",
                        ));
                        return Poll::Ready(());
                    }
                    Poll::Ready(Ok(n)) => {
                        self.pos += n;
                        self.bytes += n as u64;
                        if self.pos == self.cap {
                            self.pos = 0;
                            self.cap = 0;
                        }
                    }
                    Poll::Ready(Err(e)) => {
                        self.error = Some(e);
                        return Poll::Ready(());
                    }
                    Poll::Pending => return Poll::Pending,
                }
            } else if self.read_done {
                if !self.write_done {
                    match writer.as_mut().poll_flush(cx) {
                        Poll::Ready(Ok(())) => {}
                        Poll::Ready(Err(e)) => {
                            self.error = Some(e);
                            return Poll::Ready(());
                        }
                        Poll::Pending => return Poll::Pending,
                    }
                    match writer.as_mut().poll_shutdown(cx) {
                        Poll::Ready(Ok(())) => self.write_done = true,
                        Poll::Ready(Err(e)) => {
                            self.error = Some(e);
                            return Poll::Ready(());
                        }
                        Poll::Pending => return Poll::Pending,
                    }
                }
                return Poll::Ready(());
            } else {
                let mut read_buf = ReadBuf::new(&mut self.buf);
                match reader.as_mut().poll_read(cx, &mut read_buf) {
                    Poll::Ready(Ok(())) => {
                        let n = read_buf.filled().len();
                        if n == 0 {
                            self.read_done = true;
                        } else {
                            self.cap = n;
                        }
                    }
                    Poll::Ready(Err(e)) => {
                        self.error = Some(e);
                        return Poll::Ready(());
                    }
                    Poll::Pending => return Poll::Pending,
                }
            }
        }
    }
}

struct CopyBidirectional<'a, A, B>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    a: &'a mut A,
    b: &'a mut B,
    a_to_b: TransferState,
    b_to_a: TransferState,
}

impl<A, B> std::future::Future for CopyBidirectional<'_, A, B>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    type Output = io::Result<CopyResult>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;

        let a_to_b_ready = this.a_to_b.done()
            || this
                .a_to_b
                .poll_transfer(cx, Pin::new(&mut this.a), Pin::new(&mut this.b))
                .is_ready();
        let b_to_a_ready = this.b_to_a.done()
            || this
                .b_to_a
                .poll_transfer(cx, Pin::new(&mut this.b), Pin::new(&mut this.a))
                .is_ready();

        if a_to_b_ready && b_to_a_ready {
            let result = CopyResult {
                a_to_b: this.a_to_b.bytes,
                b_to_a: this.b_to_a.bytes,
            };
            if let Some(e) = this.a_to_b.error.take().or_else(|| this.b_to_a.error.take()) {
                return Poll::Ready(Err(e));
            }
            Poll::Ready(Ok(result))
        } else {
            Poll::Pending
        }
    }
}

/// Copy bytes in both directions until both sides finish.
///
/// EOF on one side shuts down the opposite writer; the function returns once
/// both directions have completed. The first error other than EOF is
/// surfaced after both directions stop.
///
/// # Errors
///
/// Returns the first read/write error seen in either direction.
pub async fn copy_bidirectional<A, B>(a: &mut A, b: &mut B) -> io::Result<CopyResult>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    CopyBidirectional {
        a,
        b,
        a_to_b: TransferState::new(),
        b_to_a: TransferState::new(),
    }
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_copy_both_directions() {
        let (mut client, mut client_far) = duplex(64);
        let (mut server, mut server_far) = duplex(64);

        let copier = tokio::spawn(async move {
            copy_bidirectional(&mut client_far, &mut server_far).await
        });

        client.write_all(b"request").await.unwrap();
        client.shutdown().await.unwrap();

        let mut seen = vec![0u8; 7];
        server.read_exact(&mut seen).await.unwrap();
        assert_eq!(&seen, b"request");

        server.write_all(b"response!").await.unwrap();
        server.shutdown().await.unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, b"response!");

        let result = copier.await.unwrap().unwrap();
        assert_eq!(result.a_to_b, 7);
        assert_eq!(result.b_to_a, 9);
        assert_eq!(result.total(), 16);
    }

    #[tokio::test]
    async fn test_eof_propagates_as_shutdown() {
        let (mut client, mut client_far) = duplex(64);
        let (mut server, mut server_far) = duplex(64);

        let copier = tokio::spawn(async move {
            copy_bidirectional(&mut client_far, &mut server_far).await
        });

        // Client closes immediately; server must observe EOF even though it
        // never wrote anything back yet.
        client.shutdown().await.unwrap();
        let mut buf = Vec::new();
        server.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());

        server.shutdown().await.unwrap();
        let result = copier.await.unwrap().unwrap();
        assert_eq!(result.total(), 0);
    }
}
