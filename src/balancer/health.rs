//! Health sub-state and the observation update function
//!
//! Every probe or reported failure ends in [`apply_observation`]. Failures
//! and successes zero each other's counters, the healthy flag only flips at
//! the configured thresholds, and the adaptive probe period is recomputed by
//! the pure interval functions after every observation.

use std::time::{Duration, Instant};

use rand::Rng;
use tracing::info;

use super::upstream::Proto;
use crate::config::HealthcheckConfig;
use crate::metrics;

/// Health sub-state for one protocol of one upstream
#[derive(Debug, Clone)]
pub struct HealthState {
    /// Whether the upstream is usable for this protocol
    pub healthy: bool,
    /// Consecutive failed observations
    pub fail_count: u32,
    /// Consecutive successful observations
    pub success_count: u32,
    /// Descriptor of the most recent error, if the last observation failed
    pub last_error: Option<String>,
    /// When the last observation was applied
    pub last_check: Option<Instant>,
    /// When the next probe is due
    pub next_check: Instant,
    /// Current adaptive probe period; zero means not yet established
    pub every: Duration,
    /// RTT of the last successful probe
    pub last_rtt: Duration,
    /// Exponentially-weighted RTT average; zero means unmeasured
    pub rtt_ewma: Duration,
    /// Guards against overlapping probes for this sub-state
    pub in_flight: bool,
    /// Excluded from selection until this instant after a data-plane failure
    pub cooldown_until: Option<Instant>,
}

impl HealthState {
    pub(crate) fn new(now: Instant) -> Self {
        Self {
            healthy: false,
            fail_count: 0,
            success_count: 0,
            last_error: None,
            last_check: None,
            next_check: now,
            every: Duration::ZERO,
            last_rtt: Duration::ZERO,
            rtt_ewma: Duration::ZERO,
            in_flight: false,
            cooldown_until: None,
        }
    }

    /// Whether the cooldown window is still open at `now`
    #[must_use]
    pub fn in_cooldown(&self, now: Instant) -> bool {
        self.cooldown_until.is_some_and(|until| until > now)
    }
}

/// Apply one probe observation to a health sub-state.
///
/// `outcome` is the measured RTT on success or an error descriptor on
/// failure. Only the false→true and true→false transitions are logged.
pub(crate) fn apply_observation(
    state: &mut HealthState,
    hc: &HealthcheckConfig,
    outcome: Result<Duration, String>,
    name: &str,
    proto: Proto,
) {
    let now = Instant::now();
    state.last_check = Some(now);

    match outcome {
        Err(err) => {
            let was_healthy = state.healthy;
            state.last_error = Some(err.clone());
            state.success_count = 0;
            state.fail_count += 1;

            if state.fail_count >= hc.fail_threshold {
                if state.healthy {
                    info!(upstream = name, proto = proto.as_str(), error = %err, "upstream DOWN");
                }
                state.healthy = false;
                metrics::set_healthy(name, proto.as_str(), false);
            }

            state.every = next_interval_on_failure(state.every, was_healthy, hc);
        }
        Ok(rtt) => {
            state.last_error = None;
            state.fail_count = 0;
            state.success_count += 1;
            state.last_rtt = rtt;

            if state.rtt_ewma == Duration::ZERO {
                state.rtt_ewma = rtt;
            } else {
                let blended =
                    state.rtt_ewma.as_secs_f64() * 0.8 + rtt.as_secs_f64() * 0.2;
                state.rtt_ewma = Duration::from_secs_f64(blended);
            }

            if state.success_count >= hc.success_threshold {
                if !state.healthy {
                    info!(
                        upstream = name,
                        proto = proto.as_str(),
                        rtt_ewma_ms = state.rtt_ewma.as_millis() as u64,
                        "upstream UP"
                    );
                }
                state.healthy = true;
                metrics::set_healthy(name, proto.as_str(), true);
            }

            state.every = next_interval_on_success(state.every, state.success_count, state.rtt_ewma, hc);
        }
    }

    state.next_check = now + apply_jitter(state.every, hc.jitter());
}

/// Next probe period after a failed observation.
///
/// Backs off multiplicatively from the current period; a failure observed
/// while the upstream was still considered healthy restarts from the floor
/// so the demotion decision comes quickly.
pub(crate) fn next_interval_on_failure(
    every: Duration,
    was_healthy: bool,
    hc: &HealthcheckConfig,
) -> Duration {
    let mut base = if every == Duration::ZERO {
        hc.min_interval()
    } else {
        every
    };
    if was_healthy {
        base = hc.min_interval();
    }
    let next = base.mul_f64(hc.backoff_factor);
    next.clamp(hc.min_interval(), hc.max_interval())
}

/// Next probe period after a successful observation.
///
/// Grows gently (×1.2) plus an RTT-proportional bonus, but stays capped at
/// the base interval until a few consecutive successes have accumulated so
/// a recovering upstream is re-measured quickly.
pub(crate) fn next_interval_on_success(
    every: Duration,
    success_count: u32,
    rtt_ewma: Duration,
    hc: &HealthcheckConfig,
) -> Duration {
    let mut base = if every == Duration::ZERO {
        hc.interval()
    } else {
        every
    };
    if success_count < 3 {
        base = base.min(hc.interval());
    }
    let bonus = rtt_ewma.mul_f64(hc.rtt_scale);
    let next = base.mul_f64(1.2) + bonus;
    next.clamp(hc.min_interval(), hc.max_interval())
}

/// Add a uniform random offset in `[-jitter, +jitter]` to `d`, clamped at
/// zero. Desynchronizes probe schedules across upstreams.
#[must_use]
pub fn apply_jitter(d: Duration, jitter: Duration) -> Duration {
    if jitter == Duration::ZERO {
        return d;
    }
    let jitter_ns = i64::try_from(jitter.as_nanos()).unwrap_or(i64::MAX);
    let offset = rand::thread_rng().gen_range(-jitter_ns..=jitter_ns);
    let total = i64::try_from(d.as_nanos()).unwrap_or(i64::MAX).saturating_add(offset);
    if total <= 0 {
        Duration::ZERO
    } else {
        Duration::from_nanos(total as u64)
    }
}
