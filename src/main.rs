//! ws-relay: load-balancing Shadowsocks-over-WebSocket client
//!
//! # Usage
//!
//! ```bash
//! # Run with the default configuration path
//! ws-relay
//!
//! # Run with a custom configuration
//! ws-relay -c /path/to/config.yaml
//!
//! # Validate a configuration and exit
//! ws-relay -c config.yaml --check
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use ws_relay::balancer::Balancer;
use ws_relay::config::load_config_with_env;
use ws_relay::flow::FlowTable;
use ws_relay::metrics;
use ws_relay::socks5::run_socks5;

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Check configuration only
    check_config: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from("/etc/ws-relay/config.yaml");
        let mut check_config = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "--check" => check_config = true,
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("ws-relay v{}", ws_relay::VERSION);
                    std::process::exit(0);
                }
                other => {
                    eprintln!("Unknown argument: {other}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            config_path,
            check_config,
        }
    }
}

fn print_help() {
    println!(
        r"ws-relay v{}

SOCKS5 client that balances traffic across Shadowsocks-over-WebSocket upstreams.

USAGE:
    ws-relay [OPTIONS]

OPTIONS:
    -c, --config <PATH>    Configuration file path [default: /etc/ws-relay/config.yaml]
    --check                Check configuration and exit
    -h, --help             Print help information
    -v, --version          Print version information

ENVIRONMENT:
    WS_RELAY_SOCKS5_LISTEN    Override the SOCKS5 listen address
    WS_RELAY_METRICS_LISTEN   Override the metrics listen address
    WS_RELAY_FWMARK           Override the firewall mark
    RUST_LOG                  Log filter (default: info)",
        ws_relay::VERSION
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = load_config_with_env(&args.config_path)
        .with_context(|| format!("loading {:?}", args.config_path))?;

    if args.check_config {
        println!("configuration ok: {} upstreams", config.upstreams.len());
        return Ok(());
    }

    // rustls needs a process-wide crypto provider before the first TLS dial.
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        warn!("rustls crypto provider was already installed");
    }

    info!(version = ws_relay::VERSION, "ws-relay starting");

    if config.metrics.listen.is_some() {
        metrics::init();
    }

    let balancer = Balancer::new(
        config.upstreams.clone(),
        config.healthcheck.clone(),
        config.selection.clone(),
        config.probe.clone(),
        config.fwmark,
    )?;

    let cancel = CancellationToken::new();
    let mut tasks = tokio::task::JoinSet::new();

    tasks.spawn(balancer.clone().run_health_checks(cancel.clone()));
    tasks.spawn(balancer.clone().run_warm_standby(cancel.clone()));

    if let Some(metrics_addr) = config.metrics.listen.clone() {
        let cancel = cancel.clone();
        tasks.spawn(async move {
            if let Err(e) = metrics::serve(&metrics_addr, cancel).await {
                error!(error = %e, "metrics endpoint failed");
            }
        });
    }

    if config.tun.enable {
        // The external L3 stack feeds flows into this table; we own its GC.
        let table = FlowTable::new(balancer.clone(), config.tun.clone());
        tasks.spawn(table.run_gc(cancel.clone()));
        info!(device = %config.tun.device, "flow table ready for L3 stack");
    }

    {
        let listen = config.listen.socks5.clone();
        let balancer = balancer.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            if let Err(e) = run_socks5(&listen, balancer, cancel.clone()).await {
                error!(error = %e, "socks5 inbound failed");
                cancel.cancel();
            }
        });
    }

    signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    cancel.cancel();

    while tasks.join_next().await.is_some() {}
    info!("bye");
    Ok(())
}
