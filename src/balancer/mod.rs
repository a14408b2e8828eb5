//! Upstream pool manager
//!
//! The balancer owns the pool of upstreams and everything that decides where
//! traffic goes: per-upstream TCP/UDP health state driven by the adaptive
//! scheduler, EWMA scoring with sticky routing and hysteresis, warm-standby
//! reservations, and the failure-report surface the data path uses to demote
//! a broken upstream immediately.
//!
//! # Selection
//!
//! A candidate must be healthy and out of cooldown for the requested
//! protocol. Its cost is
//!
//! ```text
//! score = (rtt_ewma_ms + stale_penalty + fail_penalty + err_penalty) / weight
//! ```
//!
//! with unmeasured RTT penalized as 1000 ms. The minimum score wins; ties
//! break by pool insertion order. TCP selections are sticky for
//! `sticky_ttl` and only switch when the winner improves on the current
//! choice by at least `min_switch` (hysteresis). UDP selection is stateless.

mod health;
mod probe;
mod scheduler;
mod standby;
mod upstream;

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::debug;

pub use health::{apply_jitter, HealthState};
pub use standby::ALIVE_CHECK_TIMEOUT;
pub use upstream::{Proto, Upstream};

use crate::config::{HealthcheckConfig, ProbeConfig, SelectionConfig, UpstreamConfig};
use crate::error::{ConfigError, SelectError, WsRelayError};
use crate::metrics;
use crate::shadowsocks::{pick_cipher, SsClientStream};
use crate::socks::AddrKey;
use crate::transport::{dial_ws, WsByteStream, WsConn};

/// Encrypted TCP stream to a destination through an upstream
pub type UpstreamTcpStream = SsClientStream<WsByteStream>;

/// Global bound on simultaneous new WebSocket dials
pub const DIAL_CONCURRENCY: usize = 32;

struct StickyState {
    current: Option<Arc<Upstream>>,
    until: Option<Instant>,
}

/// The upstream pool manager
pub struct Balancer {
    hc: HealthcheckConfig,
    sel: SelectionConfig,
    probe: ProbeConfig,
    fwmark: u32,
    pool: Vec<Arc<Upstream>>,
    sticky: Mutex<StickyState>,
    dial_sem: Semaphore,
}

impl Balancer {
    /// Build a balancer from upstream descriptors.
    ///
    /// Pool order is preserved; it breaks score ties. Every upstream starts
    /// unhealthy until its first successful probe.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when an upstream's cipher cannot be
    /// constructed.
    pub fn new(
        upstreams: Vec<UpstreamConfig>,
        hc: HealthcheckConfig,
        sel: SelectionConfig,
        probe: ProbeConfig,
        fwmark: u32,
    ) -> Result<Arc<Self>, ConfigError> {
        let now = Instant::now();
        let mut pool = Vec::with_capacity(upstreams.len());
        for (index, config) in upstreams.into_iter().enumerate() {
            let cipher = pick_cipher(&config.cipher, &config.secret).map_err(|e| {
                ConfigError::ValidationError(format!("upstream {}: {e}", config.name))
            })?;
            pool.push(Arc::new(Upstream::new(config, cipher, index, now)));
        }
        Ok(Arc::new(Self {
            hc,
            sel,
            probe,
            fwmark,
            pool,
            sticky: Mutex::new(StickyState {
                current: None,
                until: None,
            }),
            dial_sem: Semaphore::new(DIAL_CONCURRENCY),
        }))
    }

    /// The pool, in insertion order
    #[must_use]
    pub fn pool(&self) -> &[Arc<Upstream>] {
        &self.pool
    }

    /// Pick the best upstream for a TCP stream.
    ///
    /// Honors stickiness and hysteresis.
    ///
    /// # Errors
    ///
    /// Returns [`SelectError::NoHealthyUpstream`] when no candidate is
    /// healthy and out of cooldown.
    pub fn pick_tcp(&self) -> Result<Arc<Upstream>, SelectError> {
        self.pick(Proto::Tcp)
    }

    /// Pick the best upstream for a UDP session.
    ///
    /// Stateless: always the current score minimum.
    ///
    /// # Errors
    ///
    /// Returns [`SelectError::NoHealthyUpstream`] when no candidate is
    /// healthy and out of cooldown.
    pub fn pick_udp(&self) -> Result<Arc<Upstream>, SelectError> {
        self.pick(Proto::Udp)
    }

    fn pick(&self, proto: Proto) -> Result<Arc<Upstream>, SelectError> {
        let now = Instant::now();

        let (current, sticky_until) = {
            let sticky = self.sticky.lock();
            (sticky.current.clone(), sticky.until)
        };

        // Sticky window applies to TCP only.
        if proto == Proto::Tcp {
            if let (Some(cur), Some(until)) = (&current, sticky_until) {
                if now < until && cur.eligible(Proto::Tcp, now) {
                    metrics::observe_selection(cur.name(), proto.as_str());
                    return Ok(cur.clone());
                }
            }
        }

        let (best, best_rtt) = self
            .best_candidate(now, proto)
            .ok_or(SelectError::NoHealthyUpstream)?;

        if proto == Proto::Tcp {
            // Hysteresis: keep the current choice unless the winner beats it
            // by at least min_switch.
            if let Some(cur) = current {
                let (cur_ok, cur_rtt) = {
                    let pair = cur.health.lock();
                    let state = pair.get(Proto::Tcp);
                    (state.healthy && !state.in_cooldown(now), state.rtt_ewma)
                };
                if cur_ok
                    && cur_rtt > Duration::ZERO
                    && best_rtt > Duration::ZERO
                    && cur_rtt.saturating_sub(best_rtt) < self.sel.min_switch()
                {
                    let mut sticky = self.sticky.lock();
                    sticky.current = Some(cur.clone());
                    sticky.until = Some(now + self.sel.sticky_ttl());
                    metrics::observe_selection(cur.name(), proto.as_str());
                    return Ok(cur);
                }
            }

            let mut sticky = self.sticky.lock();
            sticky.current = Some(best.clone());
            sticky.until = Some(now + self.sel.sticky_ttl());
        }

        metrics::observe_selection(best.name(), proto.as_str());
        Ok(best)
    }

    /// Lowest-score eligible candidate and its RTT EWMA
    fn best_candidate(&self, now: Instant, proto: Proto) -> Option<(Arc<Upstream>, Duration)> {
        let mut best: Option<(Arc<Upstream>, Duration)> = None;
        let mut best_score = f64::INFINITY;

        for upstream in &self.pool {
            let state = upstream.health_snapshot(proto);
            let Some(score) = score_candidate(&state, upstream.weight(), now, self.hc.interval())
            else {
                continue;
            };
            if score < best_score {
                best_score = score;
                best = Some((upstream.clone(), state.rtt_ewma));
            }
        }

        best
    }

    /// The best `n` upstreams by TCP score, without replacement.
    ///
    /// Used by the warm-standby manager to decide which upstreams deserve a
    /// pre-opened connection.
    #[must_use]
    pub fn top_n(&self, now: Instant, n: usize) -> Vec<Arc<Upstream>> {
        let mut out: Vec<Arc<Upstream>> = Vec::with_capacity(n);

        while out.len() < n {
            let mut best: Option<Arc<Upstream>> = None;
            let mut best_score = f64::INFINITY;

            for upstream in &self.pool {
                if out.iter().any(|chosen| Arc::ptr_eq(chosen, upstream)) {
                    continue;
                }
                let state = upstream.health_snapshot(Proto::Tcp);
                let Some(score) =
                    score_candidate(&state, upstream.weight(), now, self.hc.interval())
                else {
                    continue;
                };
                if score < best_score {
                    best_score = score;
                    best = Some(upstream.clone());
                }
            }

            match best {
                Some(upstream) => out.push(upstream),
                None => break,
            }
        }

        out
    }

    /// Record a live TCP data-plane failure on `upstream`.
    ///
    /// Demotes immediately (no threshold), opens the cooldown window,
    /// accelerates the next probe, and clears stickiness if this was the
    /// current upstream.
    pub fn report_tcp_failure(&self, upstream: &Arc<Upstream>, err: &str) {
        self.report_failure(upstream, Proto::Tcp, err);

        let mut sticky = self.sticky.lock();
        if sticky
            .current
            .as_ref()
            .is_some_and(|cur| Arc::ptr_eq(cur, upstream))
        {
            sticky.until = None;
        }
    }

    /// Record a live UDP data-plane failure on `upstream`.
    pub fn report_udp_failure(&self, upstream: &Arc<Upstream>, err: &str) {
        self.report_failure(upstream, Proto::Udp, err);
    }

    fn report_failure(&self, upstream: &Arc<Upstream>, proto: Proto, err: &str) {
        let now = Instant::now();
        debug!(upstream = upstream.name(), proto = proto.as_str(), error = err, "data-plane failure reported");
        metrics::observe_failure(upstream.name(), proto.as_str(), Some(err));

        let mut pair = upstream.health.lock();
        let state = pair.get_mut(proto);
        state.last_error = Some(err.to_string());
        state.fail_count += 1;
        state.success_count = 0;
        state.healthy = false;
        state.cooldown_until = Some(now + self.sel.cooldown());
        state.every = self.hc.min_interval();
        state.next_check = now + apply_jitter(self.hc.min_interval(), self.hc.jitter());
        metrics::set_healthy(upstream.name(), proto.as_str(), false);
    }

    /// Dial a WebSocket under the global dial concurrency bound.
    ///
    /// # Errors
    ///
    /// Returns the dial error from the transport layer.
    pub(crate) async fn dial_ws_limited(
        &self,
        url: &str,
    ) -> Result<Box<dyn WsConn>, crate::error::TransportError> {
        // The semaphore is never closed, so acquire cannot fail.
        let _permit = self
            .dial_sem
            .acquire()
            .await
            .map_err(|_| crate::error::TransportError::Ws("dial semaphore closed".into()))?;
        dial_ws(url, self.fwmark).await
    }

    /// Open an encrypted TCP stream to `dst` through `upstream`.
    ///
    /// Reuses a verified warm-standby connection when one is available,
    /// otherwise dials fresh under the dial bound. The SOCKS-encoded
    /// destination is written once ahead of the payload; shutting the
    /// returned stream down closes the WebSocket.
    ///
    /// # Errors
    ///
    /// Returns a protocol error for unaddressable destinations and a
    /// transport error when no connection could be established. The caller
    /// is expected to feed dial failures back via
    /// [`Balancer::report_tcp_failure`].
    pub async fn dial_tcp_through_upstream(
        &self,
        upstream: &Arc<Upstream>,
        dst: &str,
    ) -> Result<UpstreamTcpStream, WsRelayError> {
        let dst_key = AddrKey::parse(dst).ok_or_else(|| {
            WsRelayError::from(crate::error::ProtocolError::AddressNotSupported(
                dst.to_string(),
            ))
        })?;

        let conn = self.acquire_tcp_ws(upstream).await?;
        let (write, read) = conn.split();
        let stream = WsByteStream::new(write, read);
        Ok(upstream.cipher().stream_conn(stream, &dst_key))
    }
}

/// Score one candidate; `None` when ineligible (unhealthy or cooling down)
fn score_candidate(
    state: &HealthState,
    weight: u32,
    now: Instant,
    interval: Duration,
) -> Option<f64> {
    if !state.healthy || state.in_cooldown(now) {
        return None;
    }

    let mut base = state.rtt_ewma.as_secs_f64() * 1000.0;
    if base <= 0.0 {
        base = 1000.0;
    }

    let stale_penalty = state.last_check.map_or(0.0, |last| {
        let staleness = now.saturating_duration_since(last);
        if staleness > interval * 2 {
            staleness.as_secs_f64() * 1000.0 * 0.2
        } else {
            0.0
        }
    });

    let fail_penalty = f64::from(state.fail_count) * 500.0;
    let err_penalty = if state.last_error.is_some() { 500.0 } else { 0.0 };
    let weight_factor = 1.0 / f64::from(weight.max(1));

    Some((base + stale_penalty + fail_penalty + err_penalty) * weight_factor)
}
