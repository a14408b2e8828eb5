//! Configuration types for ws-relay
//!
//! Configuration is loaded from a YAML file. Durations are expressed as
//! integer fields with `_ms` or `_secs` suffixes; accessor methods return
//! `std::time::Duration`. Every field has a default matching the documented
//! configuration surface, so an upstream list is the only mandatory content.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::socks::AddrKey;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Local listener addresses
    #[serde(default)]
    pub listen: ListenConfig,

    /// L3 tunnel settings and UDP flow-table tuning
    #[serde(default)]
    pub tun: TunConfig,

    /// Health-check scheduling parameters
    #[serde(default)]
    pub healthcheck: HealthcheckConfig,

    /// Upstream selection parameters
    #[serde(default)]
    pub selection: SelectionConfig,

    /// Quality-probe parameters
    #[serde(default)]
    pub probe: ProbeConfig,

    /// Metrics exposition
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Upstream pool (order is preserved and breaks score ties)
    pub upstreams: Vec<UpstreamConfig>,

    /// Firewall mark for all outbound sockets; 0 disables marking
    #[serde(default)]
    pub fwmark: u32,
}

impl Config {
    /// Validate the configuration after defaults have been applied.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` on an empty pool, duplicate
    /// upstream names, unparsable probe targets, or unknown cipher methods.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upstreams.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one upstream must be configured".into(),
            ));
        }

        let mut names = std::collections::HashSet::new();
        for upstream in &self.upstreams {
            upstream.validate()?;
            if !names.insert(upstream.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate upstream name: {}",
                    upstream.name
                )));
            }
        }

        if AddrKey::parse(&self.probe.tcp_target).is_none() {
            return Err(ConfigError::ValidationError(format!(
                "probe.tcp_target is not host:port: {}",
                self.probe.tcp_target
            )));
        }
        if AddrKey::parse(&self.probe.udp_target).is_none() {
            return Err(ConfigError::ValidationError(format!(
                "probe.udp_target is not host:port: {}",
                self.probe.udp_target
            )));
        }
        if !matches!(self.probe.dns_type.to_ascii_uppercase().as_str(), "A" | "AAAA") {
            return Err(ConfigError::ValidationError(format!(
                "probe.dns_type must be A or AAAA, got {}",
                self.probe.dns_type
            )));
        }

        if self.healthcheck.backoff_factor < 1.0 {
            return Err(ConfigError::ValidationError(
                "healthcheck.backoff_factor must be >= 1.0".into(),
            ));
        }
        if self.healthcheck.min_interval_ms > self.healthcheck.max_interval_ms {
            return Err(ConfigError::ValidationError(
                "healthcheck.min_interval_ms must not exceed max_interval_ms".into(),
            ));
        }

        Ok(())
    }
}

/// Local listener addresses
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenConfig {
    /// SOCKS5 listen address
    #[serde(default = "default_socks5_listen")]
    pub socks5: String,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            socks5: default_socks5_listen(),
        }
    }
}

fn default_socks5_listen() -> String {
    "127.0.0.1:1080".into()
}

/// L3 tunnel settings and UDP flow-table tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TunConfig {
    /// Whether the external L3 stack feeds the flow table
    #[serde(default)]
    pub enable: bool,

    /// TUN device name (managed by the external stack)
    #[serde(default)]
    pub device: String,

    /// Interface MTU
    #[serde(default = "default_mtu")]
    pub mtu: u32,

    /// Maximum number of UDP port sessions
    #[serde(default = "default_udp_max_flows")]
    pub udp_max_flows: usize,

    /// Idle timeout for a whole port session
    #[serde(default = "default_udp_idle_timeout_secs")]
    pub udp_idle_timeout_secs: u64,

    /// Flow-table garbage-collection period
    #[serde(default = "default_udp_gc_interval_secs")]
    pub udp_gc_interval_secs: u64,

    /// Idle timeout for a single destination inside a port session
    #[serde(default = "default_udp_flow_idle_timeout_secs")]
    pub udp_flow_idle_timeout_secs: u64,

    /// Maximum distinct destinations per port session
    #[serde(default = "default_udp_max_dst_per_port")]
    pub udp_max_dst_per_port: usize,
}

impl Default for TunConfig {
    fn default() -> Self {
        Self {
            enable: false,
            device: String::new(),
            mtu: default_mtu(),
            udp_max_flows: default_udp_max_flows(),
            udp_idle_timeout_secs: default_udp_idle_timeout_secs(),
            udp_gc_interval_secs: default_udp_gc_interval_secs(),
            udp_flow_idle_timeout_secs: default_udp_flow_idle_timeout_secs(),
            udp_max_dst_per_port: default_udp_max_dst_per_port(),
        }
    }
}

impl TunConfig {
    /// Idle timeout for a whole port session
    #[must_use]
    pub const fn udp_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.udp_idle_timeout_secs)
    }

    /// Flow-table garbage-collection period
    #[must_use]
    pub const fn udp_gc_interval(&self) -> Duration {
        Duration::from_secs(self.udp_gc_interval_secs)
    }

    /// Idle timeout for a single destination
    #[must_use]
    pub const fn udp_flow_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.udp_flow_idle_timeout_secs)
    }
}

fn default_mtu() -> u32 {
    1500
}
fn default_udp_max_flows() -> usize {
    4096
}
fn default_udp_idle_timeout_secs() -> u64 {
    60
}
fn default_udp_gc_interval_secs() -> u64 {
    10
}
fn default_udp_flow_idle_timeout_secs() -> u64 {
    30
}
fn default_udp_max_dst_per_port() -> usize {
    512
}

/// Health-check scheduling parameters
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HealthcheckConfig {
    /// Base probe period for stable upstreams
    #[serde(default = "default_hc_interval_ms")]
    pub interval_ms: u64,

    /// Liveness-probe timeout
    #[serde(default = "default_hc_timeout_ms")]
    pub timeout_ms: u64,

    /// Consecutive failures before an upstream is marked down
    #[serde(default = "default_fail_threshold")]
    pub fail_threshold: u32,

    /// Consecutive successes before an upstream is marked up
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,

    /// Floor for the adaptive probe period
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,

    /// Ceiling for the adaptive probe period
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,

    /// Uniform jitter applied to every scheduled probe time
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,

    /// Period growth factor after a failed probe
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Fraction of the RTT EWMA added to the period after a success
    #[serde(default = "default_rtt_scale")]
    pub rtt_scale: f64,
}

impl Default for HealthcheckConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_hc_interval_ms(),
            timeout_ms: default_hc_timeout_ms(),
            fail_threshold: default_fail_threshold(),
            success_threshold: default_success_threshold(),
            min_interval_ms: default_min_interval_ms(),
            max_interval_ms: default_max_interval_ms(),
            jitter_ms: default_jitter_ms(),
            backoff_factor: default_backoff_factor(),
            rtt_scale: default_rtt_scale(),
        }
    }
}

impl HealthcheckConfig {
    /// Base probe period
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Liveness-probe timeout
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Adaptive period floor
    #[must_use]
    pub const fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    /// Adaptive period ceiling
    #[must_use]
    pub const fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }

    /// Scheduling jitter bound
    #[must_use]
    pub const fn jitter(&self) -> Duration {
        Duration::from_millis(self.jitter_ms)
    }
}

fn default_hc_interval_ms() -> u64 {
    5000
}
fn default_hc_timeout_ms() -> u64 {
    3000
}
fn default_fail_threshold() -> u32 {
    2
}
fn default_success_threshold() -> u32 {
    1
}
fn default_min_interval_ms() -> u64 {
    1000
}
fn default_max_interval_ms() -> u64 {
    30_000
}
fn default_jitter_ms() -> u64 {
    200
}
fn default_backoff_factor() -> f64 {
    1.6
}
fn default_rtt_scale() -> f64 {
    0.25
}

/// Upstream selection parameters
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SelectionConfig {
    /// How long the current TCP upstream stays preferred
    #[serde(default = "default_sticky_ttl_ms")]
    pub sticky_ttl_ms: u64,

    /// Exclusion window after a reported data-plane failure
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,

    /// Minimum EWMA improvement required to switch away from the current
    /// upstream
    #[serde(default = "default_min_switch_ms")]
    pub min_switch_ms: u64,

    /// How many upstreams keep a pre-warmed standby connection
    #[serde(default = "default_warm_standby_n")]
    pub warm_standby_n: usize,

    /// Warm-standby maintenance period
    #[serde(default = "default_warm_standby_interval_ms")]
    pub warm_standby_interval_ms: u64,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            sticky_ttl_ms: default_sticky_ttl_ms(),
            cooldown_ms: default_cooldown_ms(),
            min_switch_ms: default_min_switch_ms(),
            warm_standby_n: default_warm_standby_n(),
            warm_standby_interval_ms: default_warm_standby_interval_ms(),
        }
    }
}

impl SelectionConfig {
    /// Sticky window length
    #[must_use]
    pub const fn sticky_ttl(&self) -> Duration {
        Duration::from_millis(self.sticky_ttl_ms)
    }

    /// Cooldown window length
    #[must_use]
    pub const fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    /// Hysteresis threshold
    #[must_use]
    pub const fn min_switch(&self) -> Duration {
        Duration::from_millis(self.min_switch_ms)
    }

    /// Warm-standby maintenance period
    #[must_use]
    pub const fn warm_standby_interval(&self) -> Duration {
        Duration::from_millis(self.warm_standby_interval_ms)
    }
}

fn default_sticky_ttl_ms() -> u64 {
    60_000
}
fn default_cooldown_ms() -> u64 {
    20_000
}
fn default_min_switch_ms() -> u64 {
    20
}
fn default_warm_standby_n() -> usize {
    2
}
fn default_warm_standby_interval_ms() -> u64 {
    2000
}

/// Quality-probe parameters
///
/// Liveness probes (the WebSocket handshake itself) always run; the quality
/// probes here additionally exercise encryption and upstream egress. An
/// absent `enable_*` key means enabled; an explicit `false` is honored.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProbeConfig {
    /// Run the TCP quality probe (HTTP HEAD through the upstream)
    #[serde(default)]
    pub enable_tcp: Option<bool>,

    /// Run the UDP quality probe (DNS query through the upstream)
    #[serde(default)]
    pub enable_udp: Option<bool>,

    /// Quality-probe timeout
    #[serde(default = "default_probe_timeout_ms")]
    pub timeout_ms: u64,

    /// Target for the TCP quality probe
    #[serde(default = "default_tcp_target")]
    pub tcp_target: String,

    /// Resolver for the UDP quality probe
    #[serde(default = "default_udp_target")]
    pub udp_target: String,

    /// Name queried by the UDP quality probe
    #[serde(default = "default_dns_name")]
    pub dns_name: String,

    /// Query type for the UDP quality probe: "A" or "AAAA"
    #[serde(default = "default_dns_type")]
    pub dns_type: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            enable_tcp: None,
            enable_udp: None,
            timeout_ms: default_probe_timeout_ms(),
            tcp_target: default_tcp_target(),
            udp_target: default_udp_target(),
            dns_name: default_dns_name(),
            dns_type: default_dns_type(),
        }
    }
}

impl ProbeConfig {
    /// Whether the TCP quality probe runs
    #[must_use]
    pub fn tcp_enabled(&self) -> bool {
        self.enable_tcp.unwrap_or(true)
    }

    /// Whether the UDP quality probe runs
    #[must_use]
    pub fn udp_enabled(&self) -> bool {
        self.enable_udp.unwrap_or(true)
    }

    /// Quality-probe timeout
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_probe_timeout_ms() -> u64 {
    2000
}
fn default_tcp_target() -> String {
    "example.com:80".into()
}
fn default_udp_target() -> String {
    "1.1.1.1:53".into()
}
fn default_dns_name() -> String {
    "example.com".into()
}
fn default_dns_type() -> String {
    "A".into()
}

/// Metrics exposition
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Listen address for the Prometheus text endpoint; absent disables it
    #[serde(default)]
    pub listen: Option<String>,
}

/// A single upstream server
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    /// Label used in logs and metrics
    pub name: String,

    /// Relative selection weight; values below 1 are coerced to 1
    #[serde(default = "default_weight")]
    pub weight: i64,

    /// WebSocket endpoint for TCP streams
    pub tcp_wss: String,

    /// WebSocket endpoint for UDP datagram channels
    pub udp_wss: String,

    /// Shadowsocks AEAD method name
    pub cipher: String,

    /// Shadowsocks password
    pub secret: String,
}

fn default_weight() -> i64 {
    1
}

impl UpstreamConfig {
    /// The effective selection weight (coerced to at least 1)
    #[must_use]
    pub fn effective_weight(&self) -> u32 {
        u32::try_from(self.weight.max(1)).unwrap_or(1)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::ValidationError(
                "upstream name cannot be empty".into(),
            ));
        }
        if self.tcp_wss.is_empty() || self.udp_wss.is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "upstream {}: tcp_wss and udp_wss are required",
                self.name
            )));
        }
        crate::shadowsocks::SsMethod::parse(&self.cipher).map_err(|e| {
            ConfigError::ValidationError(format!("upstream {}: {e}", self.name))
        })?;
        Ok(())
    }
}
