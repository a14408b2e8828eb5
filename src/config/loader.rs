//! Configuration loading
//!
//! Loads YAML configuration from a file or string, applies defaults through
//! serde, validates, and optionally applies environment overrides.

use std::path::Path;

use tracing::{debug, info};

use super::types::Config;
use crate::error::ConfigError;

/// Load configuration from a YAML file.
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read, parsed, or validated.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;
    let config = load_config_str(&contents)?;

    info!(
        upstreams = config.upstreams.len(),
        socks5 = %config.listen.socks5,
        "Configuration loaded"
    );

    Ok(config)
}

/// Load configuration from a YAML string.
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(yaml: &str) -> Result<Config, ConfigError> {
    let config: Config =
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    config.validate()?;
    Ok(config)
}

/// Load configuration with environment variable overrides.
///
/// Environment variables:
/// - `WS_RELAY_SOCKS5_LISTEN`: override the SOCKS5 listen address
/// - `WS_RELAY_METRICS_LISTEN`: override the metrics listen address
/// - `WS_RELAY_FWMARK`: override the firewall mark
///
/// # Errors
///
/// Returns `ConfigError` if loading fails or an override does not parse.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let mut config = load_config(path)?;

    if let Ok(addr) = std::env::var("WS_RELAY_SOCKS5_LISTEN") {
        debug!("SOCKS5 listen address overridden to {}", addr);
        config.listen.socks5 = addr;
    }

    if let Ok(addr) = std::env::var("WS_RELAY_METRICS_LISTEN") {
        debug!("Metrics listen address overridden to {}", addr);
        config.metrics.listen = Some(addr);
    }

    if let Ok(mark) = std::env::var("WS_RELAY_FWMARK") {
        config.fwmark = mark.parse().map_err(|_| ConfigError::EnvError {
            name: "WS_RELAY_FWMARK".into(),
            reason: format!("invalid mark: {mark}"),
        })?;
        debug!("fwmark overridden to {}", config.fwmark);
    }

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_missing_file() {
        let err = load_config("/nonexistent/ws-relay.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn test_load_invalid_yaml() {
        let err = load_config_str("upstreams: [unterminated").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_load_valid_string() {
        let config = load_config_str(
            r#"
listen:
  socks5: "0.0.0.0:1081"
upstreams:
  - name: primary
    tcp_wss: "wss://relay.example.com/tcp"
    udp_wss: "wss://relay.example.com/udp"
    cipher: "chacha20-ietf-poly1305"
    secret: "hunter2"
fwmark: 42
"#,
        )
        .unwrap();
        assert_eq!(config.listen.socks5, "0.0.0.0:1081");
        assert_eq!(config.fwmark, 42);
        assert_eq!(config.upstreams.len(), 1);
    }
}
