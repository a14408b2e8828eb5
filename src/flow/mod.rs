//! L3 flow table
//!
//! Maps flows handed over by the external userspace network stack onto
//! upstream data paths. TCP flows are one dial plus a bidirectional copy.
//! UDP flows share state at two levels: a *port session* — one UDP session
//! keyed by the tunneled source endpoint, shared by every destination that
//! source talks to — and per-destination entries inside it. Both levels are
//! bounded and expire on idleness.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::balancer::{Balancer, Upstream};
use crate::config::TunConfig;
use crate::error::{FlowError, WsRelayError};
use crate::io::copy_bidirectional;
use crate::udp::UdpSession;

/// Key of a port session: address family, tunneled source IP, source port
pub type PortKey = SocketAddr;

/// A per-flow UDP endpoint provided by the external network stack
#[async_trait]
pub trait L3Datagram: Send + Sync {
    /// Receive one payload from the tunneled flow
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Send one payload back into the tunneled flow
    async fn send(&self, payload: &[u8]) -> io::Result<usize>;
}

struct PortSession {
    upstream: Arc<Upstream>,
    session: Arc<UdpSession>,
    last_seen: Mutex<Instant>,
    /// Destination string → last activity
    flows: Mutex<HashMap<String, Instant>>,
}

impl std::fmt::Debug for PortSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortSession").finish_non_exhaustive()
    }
}

impl PortSession {
    fn touch(&self) {
        *self.last_seen.lock() = Instant::now();
    }
}

/// Table of active port sessions
pub struct FlowTable {
    balancer: Arc<Balancer>,
    config: TunConfig,
    ports: Mutex<HashMap<PortKey, Arc<PortSession>>>,
}

impl FlowTable {
    /// Create an empty flow table
    #[must_use]
    pub fn new(balancer: Arc<Balancer>, config: TunConfig) -> Arc<Self> {
        Arc::new(Self {
            balancer,
            config,
            ports: Mutex::new(HashMap::new()),
        })
    }

    /// Number of live port sessions
    #[must_use]
    pub fn port_session_count(&self) -> usize {
        self.ports.lock().len()
    }

    /// Forward one TCP flow to `dst` through the best upstream.
    ///
    /// Dial failures are reported back to the balancer before surfacing.
    ///
    /// # Errors
    ///
    /// Returns selection errors, dial errors, and the first copy error.
    pub async fn forward_tcp<S>(&self, stream: &mut S, dst: &str) -> Result<(), WsRelayError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let upstream = self.balancer.pick_tcp()?;
        let mut encrypted = match self
            .balancer
            .dial_tcp_through_upstream(&upstream, dst)
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                self.balancer
                    .report_tcp_failure(&upstream, &e.to_string());
                return Err(e);
            }
        };

        trace!(upstream = upstream.name(), dst, "tcp flow established");
        copy_bidirectional(stream, &mut encrypted).await?;
        Ok(())
    }

    /// Forward one UDP flow: copy payloads from the L3 endpoint into the
    /// shared session and pump replies back until idle-GC, cancellation, or
    /// an error ends it.
    ///
    /// # Errors
    ///
    /// Returns [`FlowError`] when a table bound is hit or no upstream is
    /// available.
    pub async fn forward_udp(
        self: &Arc<Self>,
        cancel: CancellationToken,
        endpoint: Arc<dyn L3Datagram>,
        key: PortKey,
        dst: String,
    ) -> Result<(), WsRelayError> {
        let port = self.get_or_create(key).await?;

        // Register the destination, respecting the per-port bound.
        {
            let mut flows = port.flows.lock();
            if !flows.contains_key(&dst) && flows.len() >= self.config.udp_max_dst_per_port {
                return Err(FlowError::DestinationsFull {
                    limit: self.config.udp_max_dst_per_port,
                }
                .into());
            }
            flows.insert(dst.clone(), Instant::now());
        }

        let rx = port.session.subscribe(&dst);

        // Reply pump: subscription → L3 endpoint. Exits when the
        // subscription closes (unsubscribe or session close) or on cancel,
        // and always unsubscribes on the way out.
        let reply_task = {
            let port = port.clone();
            let endpoint = endpoint.clone();
            let dst = dst.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut rx = rx;
                loop {
                    let payload = tokio::select! {
                        () = cancel.cancelled() => break,
                        payload = rx.recv() => match payload {
                            Some(payload) => payload,
                            None => break,
                        },
                    };
                    if endpoint.send(&payload).await.is_err() {
                        break;
                    }
                    port.touch();
                    port.flows.lock().insert(dst.clone(), Instant::now());
                }
                port.session.unsubscribe(&dst);
            })
        };

        // Request pump: L3 endpoint → session.
        let mut buf = vec![0u8; 65535];
        let result = loop {
            let n = tokio::select! {
                () = cancel.cancelled() => break Ok(()),
                n = endpoint.recv(&mut buf) => match n {
                    Ok(n) => n,
                    Err(_) => break Ok(()),
                },
            };

            if let Err(e) = port.session.send(&dst, &buf[..n]).await {
                self.balancer
                    .report_udp_failure(&port.upstream, &e.to_string());
                break Err(e);
            }
            port.touch();
            port.flows.lock().insert(dst.clone(), Instant::now());
        };

        // Tear down this destination; the port session itself stays for
        // other flows until idle GC collects it.
        port.flows.lock().remove(&dst);
        port.session.unsubscribe(&dst);
        let _ = reply_task.await;

        result
    }

    /// Get or create the port session for `key`, enforcing the table bound
    /// before any session is created. A rejection leaves the table
    /// untouched.
    async fn get_or_create(self: &Arc<Self>, key: PortKey) -> Result<Arc<PortSession>, FlowError> {
        {
            let ports = self.ports.lock();
            if let Some(port) = ports.get(&key) {
                port.touch();
                return Ok(port.clone());
            }
            if ports.len() >= self.config.udp_max_flows {
                return Err(FlowError::TableFull {
                    limit: self.config.udp_max_flows,
                });
            }
        }

        let upstream = self.balancer.pick_udp()?;
        let session = match self.balancer.new_udp_session(&upstream).await {
            Ok(session) => session,
            Err(e) => {
                self.balancer
                    .report_udp_failure(&upstream, &e.to_string());
                return Err(FlowError::Session(e.to_string()));
            }
        };

        let port = Arc::new(PortSession {
            upstream,
            session,
            last_seen: Mutex::new(Instant::now()),
            flows: Mutex::new(HashMap::new()),
        });

        // Re-check under the lock: another flow may have won the race, or
        // the table may have filled while we were dialing.
        let (result, surplus) = {
            let mut ports = self.ports.lock();
            if let Some(existing) = ports.get(&key) {
                existing.touch();
                (Ok(existing.clone()), Some(port))
            } else if ports.len() >= self.config.udp_max_flows {
                (
                    Err(FlowError::TableFull {
                        limit: self.config.udp_max_flows,
                    }),
                    Some(port),
                )
            } else {
                ports.insert(key, port.clone());
                (Ok(port), None)
            }
        };
        if let Some(surplus) = surplus {
            surplus.session.close().await;
        }
        result
    }

    /// Run the idle garbage collector until cancelled.
    ///
    /// Cancellation closes every remaining session.
    pub async fn run_gc(self: Arc<Self>, cancel: CancellationToken) {
        let mut tick = interval(self.config.udp_gc_interval());
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    let drained: Vec<_> = self.ports.lock().drain().collect();
                    for (_, port) in drained {
                        port.session.close().await;
                    }
                    debug!("udp flow gc stopped");
                    return;
                }
                _ = tick.tick() => self.gc_once().await,
            }
        }
    }

    /// One garbage-collection pass over both levels of the table
    pub async fn gc_once(&self) {
        let now = Instant::now();
        let flow_idle = self.config.udp_flow_idle_timeout();
        let port_idle = self.config.udp_idle_timeout();

        let mut expired = Vec::new();
        {
            let mut ports = self.ports.lock();
            ports.retain(|key, port| {
                // Drop idle destinations inside the session first.
                {
                    let mut flows = port.flows.lock();
                    flows.retain(|dst, last| {
                        if now.saturating_duration_since(*last) > flow_idle {
                            port.session.unsubscribe(dst);
                            false
                        } else {
                            true
                        }
                    });
                }

                let idle = now.saturating_duration_since(*port.last_seen.lock());
                if idle > port_idle {
                    trace!(key = %key, "port session expired");
                    expired.push(port.clone());
                    false
                } else {
                    true
                }
            });
        }

        for port in expired {
            port.session.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HealthcheckConfig, ProbeConfig, SelectionConfig, UpstreamConfig};
    use crate::shadowsocks::pick_cipher;
    use crate::transport::testing::channel_ws;
    use crate::transport::WsFrame;
    use std::time::Duration;

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

    fn in_memory_session(table: &Arc<FlowTable>, key: PortKey) -> Arc<PortSession> {
        let cipher = pick_cipher("aes-256-gcm", "s").unwrap();
        let (_handle, conn) = channel_ws();
        let session = UdpSession::start("u1".into(), cipher, Box::new(conn));
        let port = Arc::new(PortSession {
            upstream: table.balancer.pool()[0].clone(),
            session,
            last_seen: Mutex::new(Instant::now()),
            flows: Mutex::new(HashMap::new()),
        });
        table.ports.lock().insert(key, port.clone());
        port
    }

    fn tun_config() -> TunConfig {
        TunConfig::default()
    }

    #[tokio::test]
    async fn test_table_full_rejects_without_mutation() {
        let mut config = tun_config();
        config.udp_max_flows = 1;
        let table = FlowTable::new(test_balancer(), config);

        in_memory_session(&table, "10.0.0.1:5000".parse().unwrap());
        assert_eq!(table.port_session_count(), 1);

        let err = table
            .get_or_create("10.0.0.2:6000".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::TableFull { limit: 1 }));
        assert_eq!(table.port_session_count(), 1, "rejection must not mutate");
    }

    #[tokio::test]
    async fn test_existing_port_session_is_shared() {
        let table = FlowTable::new(test_balancer(), tun_config());
        let key: PortKey = "10.0.0.1:5000".parse().unwrap();
        let created = in_memory_session(&table, key);

        let fetched = table.get_or_create(key).await.unwrap();
        assert!(Arc::ptr_eq(&created, &fetched));
        assert_eq!(table.port_session_count(), 1);
    }

    #[tokio::test]
    async fn test_create_fails_without_healthy_upstream() {
        // No upstream is healthy, so session creation must fail with a
        // selection error and leave the table empty.
        let table = FlowTable::new(test_balancer(), tun_config());
        let err = table
            .get_or_create("10.0.0.1:5000".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Select(_)));
        assert_eq!(table.port_session_count(), 0);
    }

    #[tokio::test]
    async fn test_gc_prunes_idle_destinations() {
        let mut config = tun_config();
        config.udp_flow_idle_timeout_secs = 0;
        config.udp_idle_timeout_secs = 3600;
        let table = FlowTable::new(test_balancer(), config);
        let port = in_memory_session(&table, "10.0.0.1:5000".parse().unwrap());

        let _rx = port.session.subscribe("1.1.1.1:53");
        port.flows
            .lock()
            .insert("1.1.1.1:53".into(), Instant::now() - Duration::from_secs(5));

        table.gc_once().await;

        assert!(port.flows.lock().is_empty(), "idle destination pruned");
        assert_eq!(port.session.subscription_count(), 0, "and unsubscribed");
        assert_eq!(table.port_session_count(), 1, "port session survives");
    }

    #[tokio::test]
    async fn test_gc_expires_idle_port_sessions() {
        let mut config = tun_config();
        config.udp_idle_timeout_secs = 0;
        let table = FlowTable::new(test_balancer(), config);
        let port = in_memory_session(&table, "10.0.0.1:5000".parse().unwrap());
        *port.last_seen.lock() = Instant::now() - Duration::from_secs(5);

        table.gc_once().await;

        assert_eq!(table.port_session_count(), 0);
        // The expired session was closed: late subscribers get a closed
        // receiver.
        let mut rx = port.session.subscribe("1.1.1.1:53");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_per_port_destination_bound() {
        let mut config = tun_config();
        config.udp_max_dst_per_port = 2;
        let table = FlowTable::new(test_balancer(), config);
        let key: PortKey = "10.0.0.1:5000".parse().unwrap();
        let port = in_memory_session(&table, key);
        port.flows.lock().insert("1.1.1.1:1".into(), Instant::now());
        port.flows.lock().insert("1.1.1.1:2".into(), Instant::now());

        struct NoopEndpoint;
        #[async_trait]
        impl L3Datagram for NoopEndpoint {
            async fn recv(&self, _buf: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::WouldBlock, "idle"))
            }
            async fn send(&self, payload: &[u8]) -> io::Result<usize> {
                Ok(payload.len())
            }
        }

        let err = table
            .forward_udp(
                CancellationToken::new(),
                Arc::new(NoopEndpoint),
                key,
                "1.1.1.1:3".into(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            WsRelayError::Flow(FlowError::DestinationsFull { limit: 2 })
        ));
        assert_eq!(port.flows.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_forward_udp_round_trip() {
        let table = FlowTable::new(test_balancer(), tun_config());
        let key: PortKey = "10.0.0.1:5000".parse().unwrap();

        // Build the port session around an in-memory channel we control.
        let cipher = pick_cipher("aes-256-gcm", "s").unwrap();
        let (handle, conn) = channel_ws();
        let session = UdpSession::start("u1".into(), cipher.clone(), Box::new(conn));
        let port = Arc::new(PortSession {
            upstream: table.balancer.pool()[0].clone(),
            session,
            last_seen: Mutex::new(Instant::now()),
            flows: Mutex::new(HashMap::new()),
        });
        table.ports.lock().insert(key, port.clone());

        // Endpoint that emits one payload, then idles until cancelled.
        struct OneShot {
            sent: tokio::sync::Mutex<bool>,
            received: Arc<std::sync::Mutex<Vec<Vec<u8>>>>,
        }
        #[async_trait]
        impl L3Datagram for OneShot {
            async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
                let mut sent = self.sent.lock().await;
                if *sent {
                    // Idle forever; the flow ends by cancellation.
                    std::future::pending::<()>().await;
                    unreachable!()
                }
                *sent = true;
                buf[..4].copy_from_slice(b"ping");
                Ok(4)
            }
            async fn send(&self, payload: &[u8]) -> io::Result<usize> {
                self.received.lock().unwrap().push(payload.to_vec());
                Ok(payload.len())
            }
        }

        let received = Arc::new(std::sync::Mutex::new(Vec::new()));
        let endpoint = Arc::new(OneShot {
            sent: tokio::sync::Mutex::new(false),
            received: received.clone(),
        });

        let cancel = CancellationToken::new();
        let flow = {
            let table = table.clone();
            let cancel = cancel.clone();
            let endpoint = endpoint.clone();
            tokio::spawn(async move {
                table
                    .forward_udp(cancel, endpoint, key, "1.1.1.1:53".into())
                    .await
            })
        };

        // Wait for the outbound datagram to hit the channel.
        let sealed = loop {
            let found = handle.written.lock().unwrap().iter().find_map(|f| {
                if let WsFrame::Binary(b) = f {
                    Some(b.clone())
                } else {
                    None
                }
            });
            if let Some(b) = found {
                break b;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        let mut sealed_copy = sealed.clone();
        let (dst, payload) = cipher.open_packet(&mut sealed_copy).unwrap();
        assert_eq!(dst.to_string(), "1.1.1.1:53");
        assert_eq!(payload, b"ping");

        // Feed a reply from that destination; it must reach the endpoint.
        let reply_key = crate::socks::AddrKey::parse("1.1.1.1:53").unwrap();
        handle
            .tx
            .send(WsFrame::Binary(cipher.seal_packet(&reply_key, b"pong")))
            .unwrap();
        loop {
            if !received.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(received.lock().unwrap()[0], b"pong");

        // Cancel; the flow must clean up its destination entry.
        cancel.cancel();
        flow.await.unwrap().unwrap();
        assert!(port.flows.lock().is_empty());
        assert_eq!(port.session.subscription_count(), 0);
    }
}
