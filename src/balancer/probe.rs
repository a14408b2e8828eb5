//! Liveness and quality probes
//!
//! A liveness probe is the WebSocket handshake itself. Quality probes go
//! further and exercise the whole encrypted path: TCP issues an HTTP `HEAD`
//! through the Shadowsocks stream and expects a response starting with
//! `HTTP/`; UDP sends a DNS query through the encrypted datagram channel and
//! expects a response whose transaction id matches and whose QR flag says
//! "answer". The measured quality duration replaces the liveness RTT.

use std::time::{Duration, Instant};

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RecordType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::upstream::Upstream;
use crate::config::ProbeConfig;
use crate::error::{ProbeError, TransportError};
use crate::socks::AddrKey;
use crate::transport::{dial_ws, WsByteStream, WsPacketReader, WsPacketWriter, CLOSE_NORMAL};

/// Probe the WebSocket handshake to `url`.
///
/// # Errors
///
/// Returns the dial error; the connection is closed immediately on success.
pub(crate) async fn probe_liveness(url: &str, fwmark: u32) -> Result<Duration, TransportError> {
    let start = Instant::now();
    let mut conn = dial_ws(url, fwmark).await?;
    let _ = conn.close(CLOSE_NORMAL, "probe").await;
    Ok(start.elapsed())
}

/// TCP quality probe: `HEAD /` through the encrypted stream.
///
/// # Errors
///
/// Returns [`ProbeError::TcpQuality`] when the dial, the exchange, or the
/// response shape fails.
pub(crate) async fn probe_tcp_quality(
    up: &Upstream,
    target: &str,
    fwmark: u32,
) -> Result<Duration, ProbeError> {
    let start = Instant::now();

    let dst = AddrKey::parse(target)
        .ok_or_else(|| ProbeError::TcpQuality(format!("bad target {target:?}")))?;

    let conn = dial_ws(up.endpoint(super::upstream::Proto::Tcp), fwmark)
        .await
        .map_err(|e| ProbeError::TcpQuality(e.to_string()))?;
    let (write, read) = conn.split();
    let ws_stream = WsByteStream::new(write, read);
    let mut stream = up.cipher().stream_conn(ws_stream, &dst);

    let host = dst.host_string();
    let request = format!("HEAD / HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| ProbeError::TcpQuality(e.to_string()))?;
    stream
        .flush()
        .await
        .map_err(|e| ProbeError::TcpQuality(e.to_string()))?;

    // Read a little; a live HTTP server answers with its protocol banner.
    let mut buf = [0u8; 16];
    let mut filled = 0;
    while filled < 5 {
        let n = stream
            .read(&mut buf[filled..])
            .await
            .map_err(|e| ProbeError::TcpQuality(e.to_string()))?;
        if n == 0 {
            return Err(ProbeError::TcpQuality("connection closed early".into()));
        }
        filled += n;
    }
    if !buf[..filled].starts_with(b"HTTP/") {
        return Err(ProbeError::TcpQuality("unexpected response".into()));
    }

    let _ = stream.shutdown().await;
    Ok(start.elapsed())
}

/// UDP quality probe: DNS query through the encrypted datagram channel.
///
/// # Errors
///
/// Returns [`ProbeError::UdpQuality`] when the dial, the exchange, or
/// response matching fails.
pub(crate) async fn probe_udp_quality(
    up: &Upstream,
    probe: &ProbeConfig,
    fwmark: u32,
) -> Result<Duration, ProbeError> {
    let start = Instant::now();

    let resolver = AddrKey::parse(&probe.udp_target)
        .ok_or_else(|| ProbeError::UdpQuality(format!("bad resolver {:?}", probe.udp_target)))?;

    let conn = dial_ws(up.endpoint(super::upstream::Proto::Udp), fwmark)
        .await
        .map_err(|e| ProbeError::UdpQuality(e.to_string()))?;
    let (write, read) = conn.split();
    let writer = WsPacketWriter::new(write);
    let mut reader = WsPacketReader::new(read);

    let txid: u16 = rand::random();
    let qtype = if probe.dns_type.eq_ignore_ascii_case("AAAA") {
        RecordType::AAAA
    } else {
        RecordType::A
    };
    let query = build_dns_query(txid, &probe.dns_name, qtype)
        .map_err(ProbeError::UdpQuality)?;

    let sealed = up.cipher().seal_packet(&resolver, &query);
    writer
        .send(sealed)
        .await
        .map_err(|e| ProbeError::UdpQuality(e.to_string()))?;

    loop {
        let Some(mut datagram) = reader
            .recv()
            .await
            .map_err(|e| ProbeError::UdpQuality(e.to_string()))?
        else {
            writer.close("udp-probe").await;
            return Err(ProbeError::UdpQuality("channel closed".into()));
        };

        let Ok((_, payload)) = up.cipher().open_packet(&mut datagram) else {
            continue;
        };
        if let Some((rxid, is_response)) = parse_dns_response(payload) {
            if rxid == txid && is_response {
                writer.close("udp-probe").await;
                return Ok(start.elapsed());
            }
        }
        // Not our answer; keep reading until the caller's deadline fires.
    }
}

/// Build a single-question DNS query message
pub(crate) fn build_dns_query(
    txid: u16,
    name: &str,
    qtype: RecordType,
) -> Result<Vec<u8>, String> {
    let name = Name::from_ascii(name).map_err(|e| format!("bad dns name: {e}"))?;
    let mut message = Message::new();
    message
        .set_id(txid)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name, qtype));
    message.to_vec().map_err(|e| format!("encode dns query: {e}"))
}

/// Extract `(transaction id, QR == response)` from a DNS payload
pub(crate) fn parse_dns_response(payload: &[u8]) -> Option<(u16, bool)> {
    let message = Message::from_vec(payload).ok()?;
    Some((
        message.id(),
        message.message_type() == MessageType::Response,
    ))
}
