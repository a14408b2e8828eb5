//! WebSocket dialer
//!
//! Dials `ws://`/`wss://` endpoints with the classic HTTP/1.1 Upgrade
//! handshake. The TCP socket is created explicitly so the configured fwmark
//! can be stamped before the connection is attempted, TLS uses rustls with
//! the webpki root store, and the whole dial is bounded by a budget
//! independent of the caller's probe timeouts.
//!
//! Transport-family hints in the URL query are honored as far as this build
//! carries the family: `h2=1`/`h3=1` fall back to HTTP/1.1 with a debug log;
//! `h2=only`/`h3=only` fail fast rather than silently downgrading.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::handshake::client::generate_key;
use tokio_tungstenite::tungstenite::http::Request;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;
use url::Url;

use super::hints::TransportHints;
use super::{WsConn, WsFrame, WsReadHalf, WsWriteHalf};
use crate::error::TransportError;
use crate::metrics;
use crate::net::set_socket_mark;

/// Budget for a complete dial: TCP connect + TLS + WebSocket upgrade
pub const DIAL_BUDGET: Duration = Duration::from_secs(10);

type WsPlain = WebSocketStream<TcpStream>;
type WsTls = WebSocketStream<tokio_rustls::client::TlsStream<TcpStream>>;

enum Inner {
    Plain(WsPlain),
    Tls(WsTls),
}

enum InnerSink {
    Plain(SplitSink<WsPlain, Message>),
    Tls(SplitSink<WsTls, Message>),
}

enum InnerStream {
    Plain(SplitStream<WsPlain>),
    Tls(SplitStream<WsTls>),
}

/// A dialed WebSocket connection (HTTP/1.1 Upgrade family)
pub struct TungsteniteConn {
    inner: Inner,
    closed: bool,
}

fn to_message(frame: WsFrame) -> Message {
    match frame {
        WsFrame::Text(data) => Message::Text(String::from_utf8_lossy(&data).into_owned()),
        WsFrame::Binary(data) => Message::Binary(data),
        WsFrame::Ping(data) => Message::Ping(data),
        WsFrame::Pong(data) => Message::Pong(data),
        WsFrame::Close(body) => Message::Close(body.map(|(code, reason)| CloseFrame {
            code: CloseCode::from(code),
            reason: reason.into(),
        })),
    }
}

fn from_message(msg: Message) -> WsFrame {
    match msg {
        Message::Text(text) => WsFrame::Text(text.into_bytes()),
        Message::Binary(data) => WsFrame::Binary(data),
        Message::Ping(data) => WsFrame::Ping(data),
        Message::Pong(data) => WsFrame::Pong(data),
        Message::Close(frame) => WsFrame::Close(
            frame.map(|f| (u16::from(f.code), f.reason.into_owned())),
        ),
        // Raw frames are not surfaced by tungstenite on the read path in
        // message mode; treat one defensively as an empty binary message.
        Message::Frame(_) => WsFrame::Binary(Vec::new()),
    }
}

fn ws_err(e: &tokio_tungstenite::tungstenite::Error) -> TransportError {
    use tokio_tungstenite::tungstenite::Error;
    match e {
        Error::ConnectionClosed | Error::AlreadyClosed => TransportError::Closed,
        other => TransportError::Ws(other.to_string()),
    }
}

macro_rules! next_frame {
    ($stream:expr) => {
        match $stream.next().await {
            Some(Ok(msg)) => {
                metrics::observe_ws_frame("rx", msg.len());
                Ok(from_message(msg))
            }
            Some(Err(e)) => Err(ws_err(&e)),
            None => Err(TransportError::Closed),
        }
    };
}

macro_rules! send_frame {
    ($sink:expr, $frame:expr) => {{
        let msg = to_message($frame);
        metrics::observe_ws_frame("tx", msg.len());
        $sink.send(msg).await.map_err(|e| ws_err(&e))
    }};
}

#[async_trait]
impl WsConn for TungsteniteConn {
    async fn read(&mut self) -> Result<WsFrame, TransportError> {
        match &mut self.inner {
            Inner::Plain(s) => next_frame!(s),
            Inner::Tls(s) => next_frame!(s),
        }
    }

    async fn write(&mut self, frame: WsFrame) -> Result<(), TransportError> {
        match &mut self.inner {
            Inner::Plain(s) => send_frame!(s, frame),
            Inner::Tls(s) => send_frame!(s, frame),
        }
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let frame = Some(CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        });
        let res = match &mut self.inner {
            Inner::Plain(s) => s.close(frame).await,
            Inner::Tls(s) => s.close(frame).await,
        };
        match res {
            Ok(()) => Ok(()),
            Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed) => Ok(()),
            Err(e) => Err(ws_err(&e)),
        }
    }

    fn split(self: Box<Self>) -> (Box<dyn WsWriteHalf>, Box<dyn WsReadHalf>) {
        match self.inner {
            Inner::Plain(s) => {
                let (sink, stream) = s.split();
                (
                    Box::new(TungsteniteWrite {
                        inner: InnerSink::Plain(sink),
                        closed: false,
                    }),
                    Box::new(TungsteniteRead {
                        inner: InnerStream::Plain(stream),
                    }),
                )
            }
            Inner::Tls(s) => {
                let (sink, stream) = s.split();
                (
                    Box::new(TungsteniteWrite {
                        inner: InnerSink::Tls(sink),
                        closed: false,
                    }),
                    Box::new(TungsteniteRead {
                        inner: InnerStream::Tls(stream),
                    }),
                )
            }
        }
    }
}

struct TungsteniteWrite {
    inner: InnerSink,
    closed: bool,
}

#[async_trait]
impl WsWriteHalf for TungsteniteWrite {
    async fn write(&mut self, frame: WsFrame) -> Result<(), TransportError> {
        match &mut self.inner {
            InnerSink::Plain(s) => send_frame!(s, frame),
            InnerSink::Tls(s) => send_frame!(s, frame),
        }
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let msg = Message::Close(Some(CloseFrame {
            code: CloseCode::from(code),
            reason: reason.to_string().into(),
        }));
        let res = match &mut self.inner {
            InnerSink::Plain(s) => s.send(msg).await,
            InnerSink::Tls(s) => s.send(msg).await,
        };
        match res {
            Ok(())
            | Err(tokio_tungstenite::tungstenite::Error::ConnectionClosed
            | tokio_tungstenite::tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(ws_err(&e)),
        }
    }
}

struct TungsteniteRead {
    inner: InnerStream,
}

#[async_trait]
impl WsReadHalf for TungsteniteRead {
    async fn read(&mut self) -> Result<WsFrame, TransportError> {
        match &mut self.inner {
            InnerStream::Plain(s) => next_frame!(s),
            InnerStream::Tls(s) => next_frame!(s),
        }
    }
}

/// Dial a WebSocket endpoint, honoring URL transport hints.
///
/// The configured `fwmark` is stamped on the socket before connecting
/// (Linux only). The whole dial is bounded by [`DIAL_BUDGET`] unless the
/// caller imposes a shorter timeout around this future.
///
/// # Errors
///
/// Returns a [`TransportError`] on URL, DNS, connect, TLS, or upgrade
/// failure, and [`TransportError::FamilyUnsupported`] when the URL requires
/// an Extended CONNECT family this build does not carry.
pub async fn dial_ws(raw_url: &str, fwmark: u32) -> Result<Box<dyn WsConn>, TransportError> {
    let start = Instant::now();
    let url = Url::parse(raw_url).map_err(|e| TransportError::InvalidUrl {
        url: raw_url.to_string(),
        reason: e.to_string(),
    })?;

    let hints = TransportHints::from_url(&url);
    if hints.h3_only {
        return Err(TransportError::FamilyUnsupported { family: "h3" });
    }
    if hints.h2_only {
        return Err(TransportError::FamilyUnsupported { family: "h2" });
    }
    if hints.try_h3 || hints.try_h2 {
        debug!(url = %url, "extended-connect hint present; using http/1.1 upgrade");
    }

    let use_tls = matches!(url.scheme(), "wss" | "https");
    if !matches!(url.scheme(), "ws" | "wss" | "http" | "https") {
        return Err(TransportError::InvalidUrl {
            url: raw_url.to_string(),
            reason: format!("unsupported scheme {:?}", url.scheme()),
        });
    }

    let host = url
        .host_str()
        .ok_or_else(|| TransportError::InvalidUrl {
            url: raw_url.to_string(),
            reason: "missing host".into(),
        })?
        .to_string();
    let port = url
        .port()
        .unwrap_or(if use_tls { 443 } else { 80 });

    let conn = timeout(DIAL_BUDGET, dial_inner(&url, &host, port, use_tls, fwmark))
        .await
        .map_err(|_| TransportError::Timeout {
            addr: format!("{host}:{port}"),
            timeout_ms: DIAL_BUDGET.as_millis() as u64,
        })??;

    metrics::observe_dial(&host, proto_of_url(&url), start.elapsed());
    Ok(conn)
}

/// Infer the metrics protocol label from the endpoint path
fn proto_of_url(url: &Url) -> &'static str {
    if url.path().to_ascii_lowercase().contains("udp") {
        "udp"
    } else {
        "tcp"
    }
}

async fn dial_inner(
    url: &Url,
    host: &str,
    port: u16,
    use_tls: bool,
    fwmark: u32,
) -> Result<Box<dyn WsConn>, TransportError> {
    let addrs = resolve(host, port).await?;

    let mut last_err = None;
    for addr in addrs {
        match dial_one(url, host, addr, use_tls, fwmark).await {
            Ok(conn) => return Ok(conn),
            Err(e) => {
                debug!(%addr, error = %e, "websocket dial attempt failed");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or(TransportError::Dns {
        addr: format!("{host}:{port}"),
        reason: "no addresses returned".into(),
    }))
}

async fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>, TransportError> {
    // IPv6 hosts may arrive with or without brackets.
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<std::net::IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, port)]);
    }
    let target = format!("{host}:{port}");
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host(&target)
        .await
        .map_err(|e| TransportError::Dns {
            addr: target.clone(),
            reason: e.to_string(),
        })?
        .collect();
    if addrs.is_empty() {
        return Err(TransportError::Dns {
            addr: target,
            reason: "no addresses returned".into(),
        });
    }
    Ok(addrs)
}

async fn dial_one(
    url: &Url,
    host: &str,
    addr: SocketAddr,
    use_tls: bool,
    fwmark: u32,
) -> Result<Box<dyn WsConn>, TransportError> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4(),
        SocketAddr::V6(_) => TcpSocket::new_v6(),
    }
    .map_err(|e| TransportError::Dial {
        addr: addr.to_string(),
        reason: e.to_string(),
    })?;

    set_socket_mark(&socket, fwmark).map_err(|e| TransportError::Dial {
        addr: addr.to_string(),
        reason: format!("SO_MARK: {e}"),
    })?;

    let tcp = socket
        .connect(addr)
        .await
        .map_err(|e| TransportError::Dial {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;
    let _ = tcp.set_nodelay(true);

    let request = build_request(url, host)?;

    if use_tls {
        let connector = tls_connector();
        let server_name: rustls::pki_types::ServerName<'static> = host
            .to_string()
            .try_into()
            .map_err(|_| TransportError::InvalidUrl {
                url: url.to_string(),
                reason: format!("invalid TLS server name {host:?}"),
            })?;
        let tls = connector
            .connect(server_name, tcp)
            .await
            .map_err(|e| TransportError::Dial {
                addr: addr.to_string(),
                reason: format!("tls: {e}"),
            })?;
        let (ws, _response) = tokio_tungstenite::client_async(request, tls)
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        Ok(Box::new(TungsteniteConn {
            inner: Inner::Tls(ws),
            closed: false,
        }))
    } else {
        let (ws, _response) = tokio_tungstenite::client_async(request, tcp)
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        Ok(Box::new(TungsteniteConn {
            inner: Inner::Plain(ws),
            closed: false,
        }))
    }
}

fn tls_connector() -> TlsConnector {
    let root_store =
        rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

fn build_request(url: &Url, host: &str) -> Result<Request<()>, TransportError> {
    let scheme = if matches!(url.scheme(), "wss" | "https") {
        "wss"
    } else {
        "ws"
    };
    let mut target = format!("{scheme}://{host}");
    if let Some(port) = url.port() {
        target.push_str(&format!(":{port}"));
    }
    target.push_str(url.path());
    if let Some(q) = url.query() {
        target.push('?');
        target.push_str(q);
    }

    Request::builder()
        .uri(&target)
        .header("Host", host)
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header("Sec-WebSocket-Key", generate_key())
        .body(())
        .map_err(|e| TransportError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })
}
