//! Process-wide metrics sink
//!
//! A single sink, initialized once before the long-running loops start, that
//! the balancer and transport layers feed. Exposition is the Prometheus text
//! format served by a minimal HTTP endpoint. When the sink was never
//! initialized every observation is a no-op.

use std::fmt::Write as _;
use std::sync::OnceLock;
use std::time::Duration;

use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Bound on draining in-flight scrapes at shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Default)]
struct Sink {
    selected: DashMap<(String, &'static str), u64>,
    failures: DashMap<(String, &'static str, &'static str), u64>,
    healthy: DashMap<(String, &'static str), bool>,
    ws_frames: DashMap<&'static str, u64>,
    ws_bytes: DashMap<&'static str, u64>,
    dial_count: DashMap<(String, &'static str), u64>,
    dial_sum_secs: DashMap<(String, &'static str), f64>,
}

static SINK: OnceLock<Sink> = OnceLock::new();

/// Enable the metrics sink. Call once at startup, before the run loops.
pub fn init() {
    let _ = SINK.set(Sink::default());
}

fn sink() -> Option<&'static Sink> {
    SINK.get()
}

/// Record that `upstream` was selected for `proto`
pub fn observe_selection(upstream: &str, proto: &'static str) {
    if let Some(sink) = sink() {
        *sink
            .selected
            .entry((upstream.to_string(), proto))
            .or_insert(0) += 1;
    }
}

/// Record a reported data-plane failure, classified by reason
pub fn observe_failure(upstream: &str, proto: &'static str, err: Option<&str>) {
    if let Some(sink) = sink() {
        let reason = failure_reason(err);
        *sink
            .failures
            .entry((upstream.to_string(), proto, reason))
            .or_insert(0) += 1;
    }
}

/// Record an upstream health flag
pub fn set_healthy(upstream: &str, proto: &'static str, healthy: bool) {
    if let Some(sink) = sink() {
        sink.healthy.insert((upstream.to_string(), proto), healthy);
    }
}

/// Record one WebSocket frame moving in `direction` ("rx"/"tx")
pub fn observe_ws_frame(direction: &'static str, bytes: usize) {
    if let Some(sink) = sink() {
        *sink.ws_frames.entry(direction).or_insert(0) += 1;
        *sink.ws_bytes.entry(direction).or_insert(0) += bytes as u64;
    }
}

/// Record a completed WebSocket dial and its duration
pub fn observe_dial(upstream: &str, proto: &'static str, elapsed: Duration) {
    if let Some(sink) = sink() {
        let key = (upstream.to_string(), proto);
        *sink.dial_count.entry(key.clone()).or_insert(0) += 1;
        *sink.dial_sum_secs.entry(key).or_insert(0.0) += elapsed.as_secs_f64();
    }
}

/// Classify an error message for the failure counter.
///
/// Case-insensitive substring matching; an absent error is "unknown".
#[must_use]
pub fn failure_reason(err: Option<&str>) -> &'static str {
    let Some(err) = err else {
        return "unknown";
    };
    let err = err.to_ascii_lowercase();
    if err.contains("timeout") || err.contains("deadline") {
        "timeout"
    } else if err.contains("tls") || err.contains("x509") || err.contains("certificate") {
        "tls"
    } else if err.contains("dns") || err.contains("no such host") {
        "dns"
    } else if err.contains("refused") {
        "refused"
    } else {
        "other"
    }
}

/// Render every metric in the Prometheus text format (0.0.4)
#[must_use]
pub fn render() -> String {
    let Some(sink) = sink() else {
        return "# metrics disabled\n".to_string();
    };

    let mut out = String::new();

    let mut selected: Vec<_> = sink
        .selected
        .iter()
        .map(|e| (e.key().clone(), *e.value()))
        .collect();
    selected.sort();
    for ((upstream, proto), count) in selected {
        let _ = writeln!(
            out,
            "wsrelay_upstream_selected_total{{upstream=\"{upstream}\",proto=\"{proto}\"}} {count}"
        );
    }

    let mut failures: Vec<_> = sink
        .failures
        .iter()
        .map(|e| (e.key().clone(), *e.value()))
        .collect();
    failures.sort();
    for ((upstream, proto, reason), count) in failures {
        let _ = writeln!(
            out,
            "wsrelay_upstream_failures_total{{upstream=\"{upstream}\",proto=\"{proto}\",reason=\"{reason}\"}} {count}"
        );
    }

    let mut healthy: Vec<_> = sink
        .healthy
        .iter()
        .map(|e| (e.key().clone(), *e.value()))
        .collect();
    healthy.sort();
    for ((upstream, proto), flag) in healthy {
        let _ = writeln!(
            out,
            "wsrelay_upstream_healthy{{upstream=\"{upstream}\",proto=\"{proto}\"}} {}",
            u8::from(flag)
        );
    }

    let mut frames: Vec<_> = sink
        .ws_frames
        .iter()
        .map(|e| (*e.key(), *e.value()))
        .collect();
    frames.sort_unstable();
    for (dir, count) in frames {
        let _ = writeln!(out, "wsrelay_ws_frames_total{{dir=\"{dir}\"}} {count}");
    }
    let mut bytes: Vec<_> = sink
        .ws_bytes
        .iter()
        .map(|e| (*e.key(), *e.value()))
        .collect();
    bytes.sort_unstable();
    for (dir, count) in bytes {
        let _ = writeln!(out, "wsrelay_ws_bytes_total{{dir=\"{dir}\"}} {count}");
    }

    let mut dials: Vec<_> = sink
        .dial_count
        .iter()
        .map(|e| (e.key().clone(), *e.value()))
        .collect();
    dials.sort();
    for ((upstream, proto), count) in dials {
        let sum = sink
            .dial_sum_secs
            .get(&(upstream.clone(), proto))
            .map_or(0.0, |v| *v);
        let _ = writeln!(
            out,
            "wsrelay_ws_dial_duration_seconds_count{{upstream=\"{upstream}\",proto=\"{proto}\"}} {count}"
        );
        let _ = writeln!(
            out,
            "wsrelay_ws_dial_duration_seconds_sum{{upstream=\"{upstream}\",proto=\"{proto}\"}} {sum}"
        );
    }

    out
}

/// Serve `/metrics` on `addr` until cancelled.
///
/// Shutdown stops accepting immediately and waits up to two seconds for
/// in-flight scrapes.
///
/// # Errors
///
/// Returns the bind error; accept errors are logged and retried.
pub async fn serve(addr: &str, cancel: CancellationToken) -> std::io::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    debug!(addr, "metrics endpoint listening");

    let mut scrapes = JoinSet::new();
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        scrapes.spawn(handle_scrape(stream));
                    }
                    Err(e) => warn!(error = %e, "metrics accept failed"),
                }
            }
        }
    }

    drop(listener);
    let drain = async {
        while scrapes.join_next().await.is_some() {}
    };
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, drain).await;
    Ok(())
}

async fn handle_scrape(mut stream: tokio::net::TcpStream) {
    // Read and discard the request head; the endpoint serves one document.
    let mut buf = [0u8; 1024];
    let _ = stream.read(&mut buf).await;

    let body = render();
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}
