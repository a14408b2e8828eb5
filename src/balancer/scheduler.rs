//! Adaptive probe scheduler
//!
//! A fixed 200 ms tick scans every upstream's TCP and UDP sub-states and
//! launches a probe task for each sub-state that is due and not already in
//! flight. Probes for distinct (upstream, protocol) pairs run in parallel;
//! the `in_flight` flag guarantees the same pair never overlaps itself.
//! Probe results feed the health-update function, which recomputes the next
//! due time with jitter.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::health::apply_observation;
use super::probe::{probe_liveness, probe_tcp_quality, probe_udp_quality};
use super::upstream::{Proto, Upstream};
use super::Balancer;

/// Scheduler scan period; probe jitter absorbs the granularity
pub(crate) const SCHEDULER_TICK: Duration = Duration::from_millis(200);

impl Balancer {
    /// Drive health checks until cancelled.
    ///
    /// On entry every sub-state is scheduled immediately so the pool
    /// converges to a useful state fast after startup.
    pub async fn run_health_checks(self: Arc<Self>, cancel: CancellationToken) {
        let now = Instant::now();
        for upstream in &self.pool {
            let mut pair = upstream.health.lock();
            for proto in [Proto::Tcp, Proto::Udp] {
                let state = pair.get_mut(proto);
                state.next_check = now;
                if state.every == Duration::ZERO {
                    state.every = self.hc.interval();
                }
            }
        }

        let mut tick = interval(SCHEDULER_TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("health-check scheduler stopped");
                    return;
                }
                _ = tick.tick() => self.launch_due_probes(&cancel),
            }
        }
    }

    /// Spawn one probe task per due, not-in-flight sub-state
    fn launch_due_probes(self: &Arc<Self>, cancel: &CancellationToken) {
        let now = Instant::now();

        for upstream in &self.pool {
            for proto in [Proto::Tcp, Proto::Udp] {
                let due = {
                    let mut pair = upstream.health.lock();
                    let state = pair.get_mut(proto);
                    if !state.in_flight && state.next_check <= now {
                        state.in_flight = true;
                        true
                    } else {
                        false
                    }
                };
                if due {
                    let balancer = self.clone();
                    let upstream = upstream.clone();
                    let cancel = cancel.clone();
                    tokio::spawn(async move {
                        balancer.probe_one(&upstream, proto, &cancel).await;
                    });
                }
            }
        }
    }

    /// Run one liveness (+ optional quality) probe and apply the result.
    ///
    /// `in_flight` is cleared exactly once on every exit path, including
    /// cancellation.
    async fn probe_one(&self, upstream: &Arc<Upstream>, proto: Proto, cancel: &CancellationToken) {
        let outcome = tokio::select! {
            () = cancel.cancelled() => {
                let mut pair = upstream.health.lock();
                pair.get_mut(proto).in_flight = false;
                return;
            }
            outcome = self.run_probe(upstream, proto) => outcome,
        };

        let mut pair = upstream.health.lock();
        let state = pair.get_mut(proto);
        apply_observation(state, &self.hc, outcome, upstream.name(), proto);
        if state.healthy {
            // A restored upstream no longer needs its failure cooldown.
            state.cooldown_until = None;
        }
        state.in_flight = false;
    }

    /// Liveness probe, then the quality probe when enabled.
    ///
    /// A quality failure fails the whole observation even though liveness
    /// succeeded; a quality success replaces the liveness RTT.
    async fn run_probe(&self, upstream: &Arc<Upstream>, proto: Proto) -> Result<Duration, String> {
        let url = upstream.endpoint(proto);

        let liveness = match timeout(self.hc.timeout(), probe_liveness(url, self.fwmark)).await {
            Err(_) => return Err(format!("liveness probe: timeout after {:?}", self.hc.timeout())),
            Ok(Err(e)) => return Err(format!("liveness probe: {e}")),
            Ok(Ok(rtt)) => rtt,
        };

        let quality_enabled = match proto {
            Proto::Tcp => self.probe.tcp_enabled(),
            Proto::Udp => self.probe.udp_enabled(),
        };
        if !quality_enabled {
            return Ok(liveness);
        }

        let quality = match proto {
            Proto::Tcp => {
                timeout(
                    self.probe.timeout(),
                    probe_tcp_quality(upstream, &self.probe.tcp_target, self.fwmark),
                )
                .await
            }
            Proto::Udp => {
                timeout(
                    self.probe.timeout(),
                    probe_udp_quality(upstream, &self.probe, self.fwmark),
                )
                .await
            }
        };

        match quality {
            Err(_) => Err(format!(
                "{} quality probe: timeout after {:?}",
                proto.as_str(),
                self.probe.timeout()
            )),
            Ok(Err(e)) => Err(e.to_string()),
            Ok(Ok(rtt)) => Ok(rtt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HealthcheckConfig, ProbeConfig, SelectionConfig, UpstreamConfig};

    fn unreachable_upstream(name: &str) -> UpstreamConfig {
        UpstreamConfig {
            name: name.to_string(),
            weight: 1,
            // Loopback port 1: refused immediately, no network needed.
            tcp_wss: "ws://127.0.0.1:1/tcp".into(),
            udp_wss: "ws://127.0.0.1:1/udp".into(),
            cipher: "aes-256-gcm".into(),
            secret: "s".into(),
        }
    }

    #[tokio::test]
    async fn test_failed_probe_updates_state() {
        let balancer = Balancer::new(
            vec![unreachable_upstream("dead")],
            HealthcheckConfig::default(),
            SelectionConfig::default(),
            ProbeConfig::default(),
            0,
        )
        .unwrap();

        let upstream = balancer.pool()[0].clone();
        {
            let mut pair = upstream.health.lock();
            pair.tcp.in_flight = true;
        }
        let cancel = CancellationToken::new();
        balancer.probe_one(&upstream, Proto::Tcp, &cancel).await;

        let state = upstream.health_snapshot(Proto::Tcp);
        assert!(!state.in_flight, "in_flight must clear after the probe");
        assert_eq!(state.fail_count, 1);
        assert_eq!(state.success_count, 0);
        assert!(state.last_error.is_some());
        assert!(state.last_check.is_some());
        assert!(state.every >= HealthcheckConfig::default().min_interval());
    }

    #[tokio::test]
    async fn test_cancelled_probe_clears_in_flight_without_observation() {
        let balancer = Balancer::new(
            vec![unreachable_upstream("dead")],
            HealthcheckConfig::default(),
            SelectionConfig::default(),
            ProbeConfig::default(),
            0,
        )
        .unwrap();

        let upstream = balancer.pool()[0].clone();
        {
            let mut pair = upstream.health.lock();
            pair.udp.in_flight = true;
        }
        let cancel = CancellationToken::new();
        cancel.cancel();
        balancer.probe_one(&upstream, Proto::Udp, &cancel).await;

        let state = upstream.health_snapshot(Proto::Udp);
        assert!(!state.in_flight);
        assert_eq!(state.fail_count, 0, "cancellation is not a failure");
        assert!(state.last_check.is_none());
    }

    #[tokio::test]
    async fn test_scheduler_marks_due_probes_in_flight() {
        let balancer = Balancer::new(
            vec![unreachable_upstream("dead")],
            HealthcheckConfig::default(),
            SelectionConfig::default(),
            ProbeConfig::default(),
            0,
        )
        .unwrap();

        // Due in the past; the scan must claim it atomically.
        {
            let mut pair = balancer.pool()[0].health.lock();
            pair.tcp.next_check = Instant::now() - Duration::from_secs(1);
            pair.udp.next_check = Instant::now() + Duration::from_secs(60);
        }
        let cancel = CancellationToken::new();
        balancer.launch_due_probes(&cancel);

        // The tcp probe task may already be running; what must hold is that
        // the udp side was not touched.
        let state = balancer.pool()[0].health_snapshot(Proto::Udp);
        assert!(!state.in_flight);
        cancel.cancel();
    }
}
