//! Local SOCKS5 inbound
//!
//! Minimal RFC 1928 server: no-auth handshake, CONNECT, and UDP ASSOCIATE.
//! CONNECT streams go through the balancer's best TCP upstream; each UDP
//! association gets its own multiplexed session on the best UDP upstream,
//! with one subscription per destination the client talks to. Fragmented
//! UDP requests (FRAG != 0) are not supported and are dropped.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::balancer::Balancer;
use crate::error::{ProtocolError, WsRelayError};
use crate::io::copy_bidirectional;
use crate::socks::{AddrKey, ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6};
use crate::udp::UdpSession;

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const CMD_CONNECT: u8 = 0x01;
const CMD_UDP_ASSOCIATE: u8 = 0x03;

const REP_SUCCEEDED: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;

/// Accept SOCKS5 clients on `listen` until cancelled.
///
/// # Errors
///
/// Returns the bind error; per-client failures are logged and absorbed.
pub async fn run_socks5(
    listen: &str,
    balancer: Arc<Balancer>,
    cancel: CancellationToken,
) -> Result<(), WsRelayError> {
    let listener = TcpListener::bind(listen).await?;
    info!(addr = listen, "socks5 inbound listening");

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                debug!("socks5 inbound stopped");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "socks5 accept failed");
                        continue;
                    }
                };
                let balancer = balancer.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, balancer, cancel).await {
                        debug!(peer = %peer, error = %e, "socks5 client finished with error");
                    }
                });
            }
        }
    }
}

async fn handle_client(
    mut stream: TcpStream,
    balancer: Arc<Balancer>,
    cancel: CancellationToken,
) -> Result<(), WsRelayError> {
    // Greeting: VER NMETHODS METHODS...
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(ProtocolError::BadDatagram("bad socks version").into());
    }
    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods).await?;
    stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;

    // Request: VER CMD RSV ATYP ADDR PORT
    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    if request[0] != SOCKS_VERSION {
        return Err(ProtocolError::BadDatagram("bad socks version").into());
    }
    let dst = read_addr(&mut stream, request[3]).await?;

    match request[1] {
        CMD_CONNECT => handle_connect(stream, balancer, &dst).await,
        CMD_UDP_ASSOCIATE => handle_udp_associate(stream, balancer, cancel).await,
        other => {
            trace!(cmd = other, "rejecting unsupported socks command");
            write_reply(&mut stream, REP_COMMAND_NOT_SUPPORTED).await?;
            Ok(())
        }
    }
}

/// Read the ADDR and PORT fields that follow an ATYP byte
async fn read_addr(stream: &mut TcpStream, atyp: u8) -> Result<AddrKey, WsRelayError> {
    let mut encoded = vec![atyp];
    match atyp {
        ATYP_IPV4 => {
            let mut rest = [0u8; 4 + 2];
            stream.read_exact(&mut rest).await?;
            encoded.extend_from_slice(&rest);
        }
        ATYP_IPV6 => {
            let mut rest = [0u8; 16 + 2];
            stream.read_exact(&mut rest).await?;
            encoded.extend_from_slice(&rest);
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            encoded.push(len[0]);
            let mut rest = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut rest).await?;
            encoded.extend_from_slice(&rest);
        }
        other => return Err(ProtocolError::BadAtyp(other).into()),
    }
    let (key, _) = crate::socks::parse_addr(&encoded, 0)?;
    Ok(key)
}

async fn write_reply(stream: &mut TcpStream, rep: u8) -> std::io::Result<()> {
    stream
        .write_all(&[SOCKS_VERSION, rep, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await
}

async fn write_reply_with_addr(stream: &mut TcpStream, bound: SocketAddr) -> std::io::Result<()> {
    let mut reply = vec![SOCKS_VERSION, REP_SUCCEEDED, 0x00];
    AddrKey::from(bound).write_to(&mut reply);
    stream.write_all(&reply).await
}

async fn handle_connect(
    mut stream: TcpStream,
    balancer: Arc<Balancer>,
    dst: &AddrKey,
) -> Result<(), WsRelayError> {
    let dst = dst.to_string();
    let upstream = match balancer.pick_tcp() {
        Ok(upstream) => upstream,
        Err(e) => {
            write_reply(&mut stream, REP_GENERAL_FAILURE).await?;
            return Err(e.into());
        }
    };

    let mut encrypted = match balancer.dial_tcp_through_upstream(&upstream, &dst).await {
        Ok(encrypted) => encrypted,
        Err(e) => {
            balancer.report_tcp_failure(&upstream, &e.to_string());
            write_reply(&mut stream, REP_GENERAL_FAILURE).await?;
            return Err(e);
        }
    };

    write_reply(&mut stream, REP_SUCCEEDED).await?;
    trace!(upstream = upstream.name(), dst, "socks5 connect established");

    copy_bidirectional(&mut stream, &mut encrypted).await?;
    Ok(())
}

async fn handle_udp_associate(
    mut stream: TcpStream,
    balancer: Arc<Balancer>,
    cancel: CancellationToken,
) -> Result<(), WsRelayError> {
    let upstream = match balancer.pick_udp() {
        Ok(upstream) => upstream,
        Err(e) => {
            write_reply(&mut stream, REP_GENERAL_FAILURE).await?;
            return Err(e.into());
        }
    };
    let session = match balancer.new_udp_session(&upstream).await {
        Ok(session) => session,
        Err(e) => {
            balancer.report_udp_failure(&upstream, &e.to_string());
            write_reply(&mut stream, REP_GENERAL_FAILURE).await?;
            return Err(e);
        }
    };

    let socket = match UdpSocket::bind(("0.0.0.0", 0)).await {
        Ok(socket) => Arc::new(socket),
        Err(e) => {
            session.close().await;
            write_reply(&mut stream, REP_GENERAL_FAILURE).await?;
            return Err(e.into());
        }
    };
    let mut bound = socket.local_addr()?;
    // Advertise the address the client reached us on.
    bound.set_ip(stream.local_addr()?.ip());
    write_reply_with_addr(&mut stream, bound).await?;
    trace!(upstream = upstream.name(), relay = %bound, "udp association open");

    let relay_cancel = cancel.child_token();
    let relay = tokio::spawn(relay_udp(
        socket,
        session.clone(),
        balancer.clone(),
        upstream.clone(),
        relay_cancel.clone(),
    ));

    // The association lives as long as the control connection.
    let mut drain = [0u8; 256];
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            n = stream.read(&mut drain) => match n {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            },
        }
    }

    relay_cancel.cancel();
    let _ = relay.await;
    session.close().await;
    Ok(())
}

/// SOCKS5 UDP request/response framing:
/// `RSV(2) ‖ FRAG(1) ‖ ATYP ‖ DST.ADDR ‖ DST.PORT ‖ DATA`
async fn relay_udp(
    socket: Arc<UdpSocket>,
    session: Arc<UdpSession>,
    balancer: Arc<Balancer>,
    upstream: Arc<crate::balancer::Upstream>,
    cancel: CancellationToken,
) {
    let peer: Arc<Mutex<Option<SocketAddr>>> = Arc::new(Mutex::new(None));
    let mut subscribed: HashSet<String> = HashSet::new();
    let mut buf = vec![0u8; 65535];

    loop {
        let (n, from) = tokio::select! {
            () = cancel.cancelled() => return,
            received = socket.recv_from(&mut buf) => match received {
                Ok(pair) => pair,
                Err(_) => return,
            },
        };

        {
            let mut peer = peer.lock();
            if peer.is_none() {
                *peer = Some(from);
            }
        }

        let pkt = &buf[..n];
        if pkt.len() < 7 || pkt[0] != 0 || pkt[1] != 0 {
            continue;
        }
        if pkt[2] != 0 {
            // Fragmentation unsupported.
            continue;
        }
        let Ok((dst_key, off)) = crate::socks::parse_addr(pkt, 3) else {
            continue;
        };
        let dst = dst_key.to_string();

        if subscribed.insert(dst.clone()) {
            let rx = session.subscribe(&dst);
            tokio::spawn(pump_replies(
                rx,
                socket.clone(),
                peer.clone(),
                dst_key,
                cancel.clone(),
            ));
        }

        if let Err(e) = session.send(&dst, &pkt[off..]).await {
            balancer.report_udp_failure(&upstream, &e.to_string());
            return;
        }
    }
}

/// Deliver one destination's replies back to the client as SOCKS5 UDP
/// responses
async fn pump_replies(
    mut rx: tokio::sync::mpsc::Receiver<crate::io::PacketBuf>,
    socket: Arc<UdpSocket>,
    peer: Arc<Mutex<Option<SocketAddr>>>,
    from: AddrKey,
    cancel: CancellationToken,
) {
    let mut header = vec![0u8, 0u8, 0u8];
    from.write_to(&mut header);

    loop {
        let payload = tokio::select! {
            () = cancel.cancelled() => return,
            payload = rx.recv() => match payload {
                Some(payload) => payload,
                None => return,
            },
        };

        let Some(client) = *peer.lock() else {
            continue;
        };
        let mut response = Vec::with_capacity(header.len() + payload.len());
        response.extend_from_slice(&header);
        response.extend_from_slice(&payload);
        let _ = socket.send_to(&response, client).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HealthcheckConfig, ProbeConfig, SelectionConfig, UpstreamConfig};

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

    async fn spawn_server() -> (SocketAddr, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let cancel = CancellationToken::new();
        let balancer = test_balancer();
        {
            let cancel = cancel.clone();
            let addr = addr.to_string();
            tokio::spawn(async move { run_socks5(&addr, balancer, cancel).await });
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        (addr, cancel)
    }

    #[tokio::test]
    async fn test_handshake_and_connect_failure_reply() {
        let (addr, cancel) = spawn_server().await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [0x05, 0x00]);

        // CONNECT to 1.2.3.4:80 with no healthy upstream: general failure.
        client
            .write_all(&[0x05, 0x01, 0x00, 0x01, 1, 2, 3, 4, 0, 80])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[0], 0x05);
        assert_eq!(reply[1], REP_GENERAL_FAILURE);

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_unsupported_command_reply() {
        let (addr, cancel) = spawn_server().await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();

        // BIND (0x02) is not supported.
        client
            .write_all(&[0x05, 0x02, 0x00, 0x01, 127, 0, 0, 1, 0, 80])
            .await
            .unwrap();
        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply[1], REP_COMMAND_NOT_SUPPORTED);

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_bad_version_drops_connection() {
        let (addr, cancel) = spawn_server().await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[0x04, 0x01, 0x00]).await.unwrap();
        let mut buf = [0u8; 2];
        // Server closes without a method selection.
        assert!(client.read_exact(&mut buf).await.is_err());

        cancel.cancel();
    }
}
