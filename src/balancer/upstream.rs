//! Per-upstream shared state
//!
//! Each upstream carries two independent health sub-states (TCP and UDP), a
//! warm-standby slot, and its immutable descriptor. One lock covers both
//! sub-states and the cooldown fields; a separate lock covers the standby
//! slot. Neither lock is ever held across an await point.

use std::time::Instant;

use parking_lot::Mutex;

use super::health::HealthState;
use crate::config::UpstreamConfig;
use crate::shadowsocks::SsCipher;
use crate::transport::WsConn;

/// Protocol axis of an upstream's health state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    /// TCP streams over the `tcp_wss` endpoint
    Tcp,
    /// UDP datagram channels over the `udp_wss` endpoint
    Udp,
}

impl Proto {
    /// Label used in logs and metrics
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

/// Both health sub-states of one upstream
#[derive(Debug)]
pub(crate) struct HealthPair {
    pub tcp: HealthState,
    pub udp: HealthState,
}

impl HealthPair {
    pub(crate) fn get(&self, proto: Proto) -> &HealthState {
        match proto {
            Proto::Tcp => &self.tcp,
            Proto::Udp => &self.udp,
        }
    }

    pub(crate) fn get_mut(&mut self, proto: Proto) -> &mut HealthState {
        match proto {
            Proto::Tcp => &mut self.tcp,
            Proto::Udp => &mut self.udp,
        }
    }
}

/// One upstream server: immutable descriptor plus mutable runtime state
pub struct Upstream {
    pub(crate) config: UpstreamConfig,
    pub(crate) cipher: SsCipher,
    /// Pool insertion order; breaks score ties
    pub(crate) index: usize,
    pub(crate) health: Mutex<HealthPair>,
    /// Pre-opened TCP-capable WebSocket, at most one at any instant
    pub(crate) standby: Mutex<Option<Box<dyn WsConn>>>,
}

impl Upstream {
    pub(crate) fn new(config: UpstreamConfig, cipher: SsCipher, index: usize, now: Instant) -> Self {
        Self {
            config,
            cipher,
            index,
            health: Mutex::new(HealthPair {
                tcp: HealthState::new(now),
                udp: HealthState::new(now),
            }),
            standby: Mutex::new(None),
        }
    }

    /// Label for logs and metrics
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Selection weight (already coerced to at least 1)
    #[must_use]
    pub fn weight(&self) -> u32 {
        self.config.effective_weight()
    }

    /// WebSocket endpoint for the given protocol
    #[must_use]
    pub fn endpoint(&self, proto: Proto) -> &str {
        match proto {
            Proto::Tcp => &self.config.tcp_wss,
            Proto::Udp => &self.config.udp_wss,
        }
    }

    /// The upstream's Shadowsocks cipher
    #[must_use]
    pub fn cipher(&self) -> &SsCipher {
        &self.cipher
    }

    /// Snapshot of one health sub-state
    #[must_use]
    pub fn health_snapshot(&self, proto: Proto) -> HealthState {
        self.health.lock().get(proto).clone()
    }

    /// Whether the sub-state is healthy and out of cooldown at `now`
    pub(crate) fn eligible(&self, proto: Proto, now: Instant) -> bool {
        let pair = self.health.lock();
        let state = pair.get(proto);
        state.healthy && !state.in_cooldown(now)
    }
}

impl std::fmt::Debug for Upstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upstream")
            .field("name", &self.config.name)
            .field("weight", &self.weight())
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}
