//! Transport-family hints carried in endpoint URL queries
//!
//! Endpoint URLs may request a specific handshake family:
//!
//! - `?h2=1`, `?http2=1`, `?h2c=1` — prefer WebSocket over HTTP/2 Extended
//!   CONNECT (RFC 8441), fall back to HTTP/1.1 Upgrade.
//! - `?h2=only`, `?http2=only`, `?h2only=1` — require HTTP/2; never fall
//!   back.
//! - `?h3=1`, `?http3=1`, `?quic=1` — prefer WebSocket over HTTP/3 Extended
//!   CONNECT (RFC 9220), fall back to lower families.
//! - `?h3=only`, `?http3=only`, `?h3only=1`, `?quic=only` — require HTTP/3;
//!   never fall back.
//!
//! "only" is strict: when the requested family is not carried by the build,
//! the dial fails fast instead of silently downgrading.

use url::Url;

/// Parsed transport-family hints
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportHints {
    /// Try HTTP/2 Extended CONNECT first
    pub try_h2: bool,
    /// Require HTTP/2 Extended CONNECT
    pub h2_only: bool,
    /// Try HTTP/3 Extended CONNECT first
    pub try_h3: bool,
    /// Require HTTP/3 Extended CONNECT
    pub h3_only: bool,
}

impl TransportHints {
    /// Extract hints from a URL query string
    #[must_use]
    pub fn from_url(url: &Url) -> Self {
        let mut hints = Self::default();
        for (k, v) in url.query_pairs() {
            match (k.as_ref(), v.as_ref()) {
                ("h2" | "http2" | "h2c", "1") => hints.try_h2 = true,
                ("h2" | "http2", "only") | ("h2only", "1") => hints.h2_only = true,
                ("h3" | "http3" | "quic", "1") => hints.try_h3 = true,
                ("h3" | "http3" | "quic", "only") | ("h3only", "1") => {
                    hints.h3_only = true;
                }
                _ => {}
            }
        }
        hints
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hints(u: &str) -> TransportHints {
        TransportHints::from_url(&Url::parse(u).unwrap())
    }

    #[test]
    fn test_no_hints() {
        assert_eq!(hints("wss://example.com/tcp"), TransportHints::default());
    }

    #[test]
    fn test_h2_try() {
        for q in ["h2=1", "http2=1", "h2c=1"] {
            let h = hints(&format!("wss://example.com/tcp?{q}"));
            assert!(h.try_h2, "query {q}");
            assert!(!h.h2_only);
        }
    }

    #[test]
    fn test_h2_only() {
        for q in ["h2=only", "http2=only", "h2only=1"] {
            let h = hints(&format!("wss://example.com/tcp?{q}"));
            assert!(h.h2_only, "query {q}");
        }
    }

    #[test]
    fn test_h3_try() {
        for q in ["h3=1", "http3=1", "quic=1"] {
            let h = hints(&format!("wss://example.com/udp?{q}"));
            assert!(h.try_h3, "query {q}");
            assert!(!h.h3_only);
        }
    }

    #[test]
    fn test_h3_only() {
        for q in ["h3=only", "http3=only", "h3only=1", "quic=only"] {
            let h = hints(&format!("wss://example.com/udp?{q}"));
            assert!(h.h3_only, "query {q}");
        }
    }

    #[test]
    fn test_unrelated_params_ignored() {
        let h = hints("wss://example.com/tcp?token=abc&h2=0");
        assert_eq!(h, TransportHints::default());
    }
}
