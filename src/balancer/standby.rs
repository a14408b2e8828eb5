//! Warm-standby connections
//!
//! The standby manager keeps at most one pre-opened TCP-capable WebSocket
//! for each of the current top-N upstreams, so a data-path dial can skip the
//! handshake entirely. Idle CONNECT streams are sometimes closed silently by
//! servers; handing such a stale connection to a new tunnel loses the first
//! bytes. Before a standby is handed over it must answer a ping within
//! [`ALIVE_CHECK_TIMEOUT`], otherwise it is discarded and a fresh dial takes
//! its place.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::time::{interval, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::upstream::{Proto, Upstream};
use super::Balancer;
use crate::error::TransportError;
use crate::transport::{WsConn, WsFrame, CLOSE_NORMAL};

/// Hard cap on the standby liveness verification
pub const ALIVE_CHECK_TIMEOUT: Duration = Duration::from_millis(1200);

/// Verify that an idle WebSocket still answers.
///
/// Sends a ping with an opaque payload and reads until a pong (empty or
/// echoing the payload), answering peer pings along the way. Any other
/// resolution means the connection is not usable.
pub(crate) async fn ws_alive_check(conn: &mut dyn WsConn) -> bool {
    let payload = format!("ws-keepalive-{:016x}", rand::thread_rng().gen::<u64>()).into_bytes();
    if conn.write(WsFrame::Ping(payload.clone())).await.is_err() {
        return false;
    }
    loop {
        match conn.read().await {
            Ok(WsFrame::Pong(data)) => return data.is_empty() || data == payload,
            Ok(WsFrame::Ping(data)) => {
                // Keep the peer happy while we wait for our pong.
                let _ = conn.write(WsFrame::Pong(data)).await;
            }
            Ok(WsFrame::Close(_)) | Err(_) => return false,
            Ok(_) => {}
        }
    }
}

impl Balancer {
    /// Maintain warm standbys until cancelled.
    ///
    /// Each tick recomputes the top-N upstreams by TCP score, drains the
    /// standby slot of everything that fell out of the set, and tops up the
    /// rest concurrently. On cancellation every standby is closed with a
    /// normal-closure frame.
    pub async fn run_warm_standby(self: Arc<Self>, cancel: CancellationToken) {
        let mut tick = interval(self.sel.warm_standby_interval());

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    for upstream in &self.pool {
                        let taken = upstream.standby.lock().take();
                        if let Some(mut conn) = taken {
                            let _ = conn.close(CLOSE_NORMAL, "shutdown").await;
                        }
                    }
                    debug!("warm-standby manager stopped");
                    return;
                }
                _ = tick.tick() => {
                    let n = self.sel.warm_standby_n;
                    if n == 0 {
                        continue;
                    }
                    let top = self.top_n(Instant::now(), n);

                    // Upstreams that fell out of the top set lose their slot.
                    for upstream in &self.pool {
                        if top.iter().any(|t| Arc::ptr_eq(t, upstream)) {
                            continue;
                        }
                        let taken = upstream.standby.lock().take();
                        if let Some(mut conn) = taken {
                            trace!(upstream = upstream.name(), "closing evicted standby");
                            tokio::spawn(async move {
                                let _ = conn.close(CLOSE_NORMAL, "standby-evicted").await;
                            });
                        }
                    }

                    for upstream in top {
                        let balancer = self.clone();
                        tokio::spawn(async move {
                            balancer.ensure_standby(&upstream).await;
                        });
                    }
                }
            }
        }
    }

    /// Make sure `upstream` holds a pre-opened TCP WebSocket, if it should.
    ///
    /// Unhealthy or cooling upstreams get their slot drained instead.
    /// Standby dial failures are advisory and never demote the upstream.
    pub(crate) async fn ensure_standby(&self, upstream: &Arc<Upstream>) {
        if !upstream.eligible(Proto::Tcp, Instant::now()) {
            let taken = upstream.standby.lock().take();
            if let Some(mut conn) = taken {
                let _ = conn.close(CLOSE_NORMAL, "standby-reset").await;
            }
            return;
        }

        if upstream.standby.lock().is_some() {
            return;
        }

        let dial = timeout(
            self.hc.timeout(),
            self.dial_ws_limited(upstream.endpoint(Proto::Tcp)),
        )
        .await;
        let conn = match dial {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                trace!(upstream = upstream.name(), error = %e, "standby dial failed");
                return;
            }
            Err(_) => {
                trace!(upstream = upstream.name(), "standby dial timed out");
                return;
            }
        };

        // Another task may have raced us here; the loser's connection is
        // closed rather than leaked.
        let duplicate = {
            let mut slot = upstream.standby.lock();
            if slot.is_some() {
                Some(conn)
            } else {
                *slot = Some(conn);
                None
            }
        };
        if let Some(mut conn) = duplicate {
            let _ = conn.close(CLOSE_NORMAL, "duplicate-standby").await;
        }
    }

    /// Take a ready TCP WebSocket for `upstream`.
    ///
    /// A present standby is taken out of the slot and verified with the
    /// ping/pong liveness check; if it fails or none is present, a fresh
    /// dial runs under the dial-concurrency bound.
    ///
    /// # Errors
    ///
    /// Returns the dial error when no usable connection could be obtained.
    pub async fn acquire_tcp_ws(
        &self,
        upstream: &Arc<Upstream>,
    ) -> Result<Box<dyn WsConn>, TransportError> {
        let taken = upstream.standby.lock().take();
        if let Some(mut conn) = taken {
            let usable = timeout(ALIVE_CHECK_TIMEOUT, ws_alive_check(conn.as_mut()))
                .await
                .unwrap_or(false);
            if usable {
                trace!(upstream = upstream.name(), "reusing warm standby");
                return Ok(conn);
            }
            debug!(upstream = upstream.name(), "standby failed alive check");
            let _ = conn.close(CLOSE_NORMAL, "stale-standby").await;
        }

        self.dial_ws_limited(upstream.endpoint(Proto::Tcp)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HealthcheckConfig, ProbeConfig, SelectionConfig, UpstreamConfig};
    use crate::transport::testing::channel_ws;

    fn test_balancer() -> Arc<Balancer> {
        Balancer::new(
            vec![UpstreamConfig {
                name: "u1".into(),
                weight: 1,
                tcp_wss: "ws://127.0.0.1:1/tcp".into(),
                udp_wss: "ws://127.0.0.1:1/udp".into(),
                cipher: "aes-256-gcm".into(),
                secret: "s".into(),
            }],
            HealthcheckConfig::default(),
            SelectionConfig::default(),
            ProbeConfig::default(),
            0,
        )
        .unwrap()
    }

    fn mark_tcp_healthy(upstream: &Arc<Upstream>) {
        let mut pair = upstream.health.lock();
        pair.tcp.healthy = true;
        pair.tcp.rtt_ewma = Duration::from_millis(10);
        pair.tcp.last_check = Some(Instant::now());
    }

    #[tokio::test]
    async fn test_alive_check_accepts_echoed_pong() {
        let (handle, conn) = channel_ws();
        let mut conn: Box<dyn WsConn> = Box::new(conn);

        // Peer pings first, then answers our ping with an empty pong.
        handle.tx.send(WsFrame::Ping(b"peer-ping".to_vec())).unwrap();
        handle.tx.send(WsFrame::Pong(Vec::new())).unwrap();

        assert!(ws_alive_check(conn.as_mut()).await);

        let written = handle.written.lock().unwrap();
        assert_eq!(written.len(), 2);
        assert!(
            matches!(&written[0], WsFrame::Ping(p) if p.starts_with(b"ws-keepalive-")),
            "first write must be our ping"
        );
        assert_eq!(written[1], WsFrame::Pong(b"peer-ping".to_vec()));
    }

    #[tokio::test]
    async fn test_alive_check_accepts_matching_payload() {
        let (handle, conn) = channel_ws();
        let mut conn: Box<dyn WsConn> = Box::new(conn);

        let written = handle.written.clone();
        let tx = handle.tx.clone();
        // Echo our own ping payload back as the pong.
        let echo = tokio::spawn(async move {
            loop {
                let ping = written.lock().unwrap().first().cloned();
                if let Some(WsFrame::Ping(payload)) = ping {
                    tx.send(WsFrame::Pong(payload)).unwrap();
                    return;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        });

        assert!(ws_alive_check(conn.as_mut()).await);
        echo.await.unwrap();
    }

    #[tokio::test]
    async fn test_alive_check_rejects_close() {
        let (handle, conn) = channel_ws();
        let mut conn: Box<dyn WsConn> = Box::new(conn);
        handle.tx.send(WsFrame::Close(None)).unwrap();
        assert!(!ws_alive_check(conn.as_mut()).await);
    }

    #[tokio::test]
    async fn test_alive_check_rejects_mismatched_pong() {
        let (handle, conn) = channel_ws();
        let mut conn: Box<dyn WsConn> = Box::new(conn);
        handle.tx.send(WsFrame::Pong(b"unrelated".to_vec())).unwrap();
        assert!(!ws_alive_check(conn.as_mut()).await);
    }

    #[tokio::test]
    async fn test_acquire_takes_standby_and_clears_slot() {
        let balancer = test_balancer();
        let upstream = balancer.pool()[0].clone();
        mark_tcp_healthy(&upstream);

        let (handle, conn) = channel_ws();
        handle.tx.send(WsFrame::Pong(Vec::new())).unwrap();
        *upstream.standby.lock() = Some(Box::new(conn));

        let acquired = balancer.acquire_tcp_ws(&upstream).await;
        assert!(acquired.is_ok(), "verified standby must be handed over");
        assert!(
            upstream.standby.lock().is_none(),
            "slot must be empty after takeover"
        );

        // Second call has no standby and must fall through to a fresh dial,
        // which fails against the closed port.
        let fresh = balancer.acquire_tcp_ws(&upstream).await;
        assert!(fresh.is_err());
    }

    #[tokio::test]
    async fn test_acquire_discards_dead_standby() {
        let balancer = test_balancer();
        let upstream = balancer.pool()[0].clone();
        mark_tcp_healthy(&upstream);

        let (handle, conn) = channel_ws();
        handle.tx.send(WsFrame::Close(None)).unwrap();
        *upstream.standby.lock() = Some(Box::new(conn));

        let result = balancer.acquire_tcp_ws(&upstream).await;
        assert!(result.is_err(), "dead standby falls back to a failing dial");

        // The stale connection was closed, not leaked.
        let written = handle.written.lock().unwrap();
        assert!(written
            .iter()
            .any(|f| matches!(f, WsFrame::Close(Some((1000, r))) if r == "stale-standby")));
    }

    #[tokio::test]
    async fn test_ensure_standby_drains_when_unhealthy() {
        let balancer = test_balancer();
        let upstream = balancer.pool()[0].clone();
        // Not healthy: any parked standby must be drained.

        let (handle, conn) = channel_ws();
        *upstream.standby.lock() = Some(Box::new(conn));

        balancer.ensure_standby(&upstream).await;

        assert!(upstream.standby.lock().is_none());
        let written = handle.written.lock().unwrap();
        assert!(written
            .iter()
            .any(|f| matches!(f, WsFrame::Close(Some((1000, r))) if r == "standby-reset")));
    }

    #[tokio::test]
    async fn test_ensure_standby_keeps_existing() {
        let balancer = test_balancer();
        let upstream = balancer.pool()[0].clone();
        mark_tcp_healthy(&upstream);

        let (handle, conn) = channel_ws();
        *upstream.standby.lock() = Some(Box::new(conn));

        balancer.ensure_standby(&upstream).await;

        // The existing connection is untouched: present and never closed.
        assert!(upstream.standby.lock().is_some());
        assert!(handle.written.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_standby_invariant_at_most_one() {
        let balancer = test_balancer();
        let upstream = balancer.pool()[0].clone();
        mark_tcp_healthy(&upstream);

        // Simulate the install race: slot already filled while a second
        // dial completed.
        let (_h1, first) = channel_ws();
        *upstream.standby.lock() = Some(Box::new(first));

        let (h2, second) = channel_ws();
        let second: Box<dyn WsConn> = Box::new(second);
        let duplicate = {
            let mut slot = upstream.standby.lock();
            if slot.is_some() {
                Some(second)
            } else {
                *slot = Some(second);
                None
            }
        };
        if let Some(mut conn) = duplicate {
            let _ = conn.close(CLOSE_NORMAL, "duplicate-standby").await;
        }

        assert!(upstream.standby.lock().is_some());
        let written = h2.written.lock().unwrap();
        assert!(written
            .iter()
            .any(|f| matches!(f, WsFrame::Close(Some((1000, r))) if r == "duplicate-standby")));
    }
}
