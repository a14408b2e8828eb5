//! One multiplexed UDP session over an encrypted WebSocket channel
//!
//! A session owns one encrypted datagram channel to one upstream and serves
//! many destinations at once. Consumers subscribe by source address and get
//! a bounded queue of reply payloads; the read loop decrypts each incoming
//! datagram, parses the leading SOCKS address, and routes the payload to the
//! matching queue without blocking (overflow drops the packet, never the
//! loop). Payload buffers come from a free-list and return to it when the
//! consumer drops them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::WsRelayError;
use crate::io::{PacketBuf, PacketBufferPool};
use crate::shadowsocks::SsCipher;
use crate::socks::AddrKey;
use crate::transport::{WsConn, WsPacketReader, WsPacketWriter};

/// Reply-queue depth per subscription
pub const SUBSCRIPTION_QUEUE_CAPACITY: usize = 128;

/// A multiplexed UDP session bound to one upstream
pub struct UdpSession {
    name: String,
    cipher: SsCipher,
    cancel: CancellationToken,
    writer: WsPacketWriter,
    subs: Arc<Mutex<HashMap<AddrKey, mpsc::Sender<PacketBuf>>>>,
    closed: AtomicBool,
}

impl UdpSession {
    /// Wrap an established datagram channel and start its read loop
    #[must_use]
    pub fn start(name: String, cipher: SsCipher, conn: Box<dyn WsConn>) -> Arc<Self> {
        let (write, read) = conn.split();
        let cancel = CancellationToken::new();
        let subs: Arc<Mutex<HashMap<AddrKey, mpsc::Sender<PacketBuf>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let session = Arc::new(Self {
            name,
            cipher: cipher.clone(),
            cancel: cancel.clone(),
            writer: WsPacketWriter::new(write),
            subs: subs.clone(),
            closed: AtomicBool::new(false),
        });

        let pool = Arc::new(PacketBufferPool::with_defaults());
        let reader = WsPacketReader::new(read);
        let loop_name = session.name.clone();
        tokio::spawn(read_loop(loop_name, cipher, reader, subs, pool, cancel));

        session
    }

    /// Subscribe to replies whose source equals `from`.
    ///
    /// Returns the queue receiver, creating the queue if needed. An
    /// unparseable address or a closed session yields an already-closed
    /// receiver.
    #[must_use]
    pub fn subscribe(&self, from: &str) -> mpsc::Receiver<PacketBuf> {
        let Some(key) = AddrKey::parse(from) else {
            let (_, rx) = mpsc::channel(1);
            return rx;
        };

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_QUEUE_CAPACITY);
        {
            let mut subs = self.subs.lock();
            // Checked under the lock so a racing close() cannot leave a
            // queue behind that no read loop will ever serve.
            if self.closed.load(Ordering::Acquire) {
                return rx;
            }
            subs.insert(key, tx);
        }
        rx
    }

    /// Drop the subscription for `from`. Calling twice is a no-op.
    pub fn unsubscribe(&self, from: &str) {
        if let Some(key) = AddrKey::parse(from) {
            self.subs.lock().remove(&key);
        }
    }

    /// Send one datagram to `dst` through the encrypted channel.
    ///
    /// Empty payloads are silently accepted.
    ///
    /// # Errors
    ///
    /// Returns a protocol error when `dst` is not SOCKS-addressable and a
    /// transport error when the channel write fails.
    pub async fn send(&self, dst: &str, payload: &[u8]) -> Result<(), WsRelayError> {
        if payload.is_empty() {
            return Ok(());
        }
        let key = AddrKey::parse(dst).ok_or_else(|| {
            WsRelayError::from(crate::error::ProtocolError::AddressNotSupported(
                dst.to_string(),
            ))
        })?;
        let sealed = self.cipher.seal_packet(&key, payload);
        self.writer.send(sealed).await?;
        Ok(())
    }

    /// Close the session: stop the read loop, close the channel, and close
    /// every subscription queue. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(upstream = %self.name, "closing udp session");
        self.cancel.cancel();
        self.writer.close("close").await;
        // Dropping the senders closes every subscriber's queue.
        self.subs.lock().clear();
    }

    /// Number of live subscriptions (for tests and introspection)
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subs.lock().len()
    }
}

/// Decrypt incoming datagrams and fan them out to subscribers
async fn read_loop(
    name: String,
    cipher: SsCipher,
    mut reader: WsPacketReader,
    subs: Arc<Mutex<HashMap<AddrKey, mpsc::Sender<PacketBuf>>>>,
    pool: Arc<PacketBufferPool>,
    cancel: CancellationToken,
) {
    loop {
        let datagram = tokio::select! {
            () = cancel.cancelled() => return,
            result = reader.recv() => match result {
                Ok(Some(datagram)) => datagram,
                Ok(None) => {
                    debug!(upstream = %name, "udp channel closed by peer");
                    return;
                }
                Err(e) => {
                    debug!(upstream = %name, error = %e, "udp channel read failed");
                    return;
                }
            },
        };

        let mut datagram = datagram;
        let (from, payload) = match cipher.open_packet(&mut datagram) {
            Ok(parsed) => parsed,
            Err(e) => {
                trace!(upstream = %name, error = %e, "dropping undecodable datagram");
                continue;
            }
        };

        // Lock only for the lookup; the copy and enqueue run on a clone of
        // the sender.
        let sender = subs.lock().get(&from).cloned();
        let Some(sender) = sender else {
            trace!(upstream = %name, from = %from, "no subscription; discarding");
            continue;
        };

        let buf = pool.copy_from(payload);
        if sender.try_send(buf).is_err() {
            // Queue full or subscriber gone; dropping keeps the loop
            // non-blocking.
            trace!(upstream = %name, from = %from, "subscription queue overflow");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shadowsocks::pick_cipher;
    use crate::transport::testing::{channel_ws, ChannelWsHandle};
    use crate::transport::WsFrame;

    fn test_session() -> (ChannelWsHandle, Arc<UdpSession>, SsCipher) {
        let cipher = pick_cipher("aes-256-gcm", "session-secret").unwrap();
        let (handle, conn) = channel_ws();
        let session = UdpSession::start("up".into(), cipher.clone(), Box::new(conn));
        (handle, session, cipher)
    }

    /// Seal a reply as the upstream would: source address plus payload.
    fn sealed_reply(cipher: &SsCipher, from: &str, payload: &[u8]) -> WsFrame {
        let key = AddrKey::parse(from).unwrap();
        WsFrame::Binary(cipher.seal_packet(&key, payload))
    }

    #[tokio::test]
    async fn test_subscription_receives_in_arrival_order() {
        let (handle, session, cipher) = test_session();

        let mut rx = session.subscribe("1.1.1.1:53");
        handle
            .tx
            .send(sealed_reply(&cipher, "1.1.1.1:53", b"first"))
            .unwrap();
        handle
            .tx
            .send(sealed_reply(&cipher, "1.1.1.1:53", b"second"))
            .unwrap();

        let a = rx.recv().await.unwrap();
        let b = rx.recv().await.unwrap();
        assert_eq!(&*a, b"first");
        assert_eq!(&*b, b"second");
    }

    #[tokio::test]
    async fn test_unmatched_source_is_discarded() {
        let (handle, session, cipher) = test_session();

        let mut rx = session.subscribe("1.1.1.1:53");
        handle
            .tx
            .send(sealed_reply(&cipher, "9.9.9.9:53", b"stranger"))
            .unwrap();
        handle
            .tx
            .send(sealed_reply(&cipher, "1.1.1.1:53", b"mine"))
            .unwrap();

        let got = rx.recv().await.unwrap();
        assert_eq!(&*got, b"mine");
    }

    #[tokio::test]
    async fn test_two_destinations_fan_out() {
        let (handle, session, cipher) = test_session();

        let mut rx_a = session.subscribe("1.1.1.1:53");
        let mut rx_b = session.subscribe("8.8.8.8:53");
        assert_eq!(session.subscription_count(), 2);

        handle
            .tx
            .send(sealed_reply(&cipher, "8.8.8.8:53", b"for-b"))
            .unwrap();
        handle
            .tx
            .send(sealed_reply(&cipher, "1.1.1.1:53", b"for-a"))
            .unwrap();

        assert_eq!(&*rx_a.recv().await.unwrap(), b"for-a");
        assert_eq!(&*rx_b.recv().await.unwrap(), b"for-b");
    }

    #[tokio::test]
    async fn test_send_seals_one_frame_per_datagram() {
        let (handle, session, cipher) = test_session();

        session.send("example.com:443", b"hello").await.unwrap();

        let written = handle.written.lock().unwrap();
        assert_eq!(written.len(), 1);
        let WsFrame::Binary(sealed) = &written[0] else {
            panic!("expected a binary frame");
        };
        let mut sealed = sealed.clone();
        let (dst, payload) = cipher.open_packet(&mut sealed).unwrap();
        assert_eq!(dst, AddrKey::parse("example.com:443").unwrap());
        assert_eq!(payload, b"hello");
    }

    #[tokio::test]
    async fn test_send_rejects_bad_destination() {
        let (_handle, session, _cipher) = test_session();
        let err = session.send("not-an-address", b"x").await.unwrap_err();
        assert!(matches!(err, WsRelayError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_send_empty_payload_is_noop() {
        let (handle, session, _cipher) = test_session();
        session.send("1.2.3.4:5", b"").await.unwrap();
        assert!(handle.written.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_bad_address_returns_closed_receiver() {
        let (_handle, session, _cipher) = test_session();
        let mut rx = session.subscribe("no-port-here");
        assert!(rx.recv().await.is_none());
        assert_eq!(session.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_closes_queue_and_is_idempotent() {
        let (_handle, session, _cipher) = test_session();

        let mut rx = session.subscribe("1.1.1.1:53");
        session.unsubscribe("1.1.1.1:53");
        assert!(rx.recv().await.is_none(), "queue closes on unsubscribe");

        // Second call is a no-op.
        session.unsubscribe("1.1.1.1:53");
        assert_eq!(session.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_close_clears_subscriptions_and_closes_channel() {
        let (handle, session, _cipher) = test_session();

        let mut rx = session.subscribe("1.1.1.1:53");
        session.close().await;

        assert!(rx.recv().await.is_none());
        assert_eq!(session.subscription_count(), 0);
        assert!(handle
            .written
            .lock()
            .unwrap()
            .iter()
            .any(|f| matches!(f, WsFrame::Close(Some((1000, _))))));

        // Close is idempotent and late subscribers get a dead receiver.
        session.close().await;
        let mut late = session.subscribe("1.1.1.1:53");
        assert!(late.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_overflow_drops_instead_of_blocking() {
        let (handle, session, cipher) = test_session();

        let mut rx = session.subscribe("1.1.1.1:53");
        // Overfill the queue without draining it.
        for i in 0..(SUBSCRIPTION_QUEUE_CAPACITY + 32) {
            handle
                .tx
                .send(sealed_reply(&cipher, "1.1.1.1:53", &i.to_be_bytes()))
                .unwrap();
        }
        // A later packet for another destination must still be deliverable:
        // the read loop did not block on the full queue.
        let mut rx_b = session.subscribe("2.2.2.2:53");
        handle
            .tx
            .send(sealed_reply(&cipher, "2.2.2.2:53", b"alive"))
            .unwrap();
        assert_eq!(&*rx_b.recv().await.unwrap(), b"alive");

        // The first queue holds at most its capacity.
        let mut drained = 0;
        while rx.try_recv().is_ok() {
            drained += 1;
        }
        assert!(drained <= SUBSCRIPTION_QUEUE_CAPACITY);
        assert!(drained > 0);
    }
}
