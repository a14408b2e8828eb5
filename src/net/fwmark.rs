//! Firewall-mark stamping for outbound sockets
//!
//! A caller-provided mark (`fwmark` in the configuration) is stamped on every
//! socket the dialer creates so that policy routing can steer relay traffic
//! around the tunnel it serves. Linux only; everywhere else this is a no-op.

use std::io;

/// Stamp `mark` on the socket with `SO_MARK`. A mark of 0 disables stamping.
///
/// # Errors
///
/// Returns the underlying `setsockopt` error. On non-Linux targets this never
/// fails.
#[cfg(target_os = "linux")]
pub fn set_socket_mark<S: std::os::fd::AsFd>(socket: &S, mark: u32) -> io::Result<()> {
    if mark == 0 {
        return Ok(());
    }
    let sock = socket2::SockRef::from(socket);
    sock.set_mark(mark)
}

/// Stamp `mark` on the socket with `SO_MARK`. A mark of 0 disables stamping.
///
/// # Errors
///
/// Never fails on this target; marks require Linux.
#[cfg(not(target_os = "linux"))]
pub fn set_socket_mark<S>(_socket: &S, mark: u32) -> io::Result<()> {
    if mark != 0 {
        tracing::debug!(mark, "fwmark requested but not supported on this platform");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_zero_mark_is_noop() {
        let socket = tokio::net::TcpSocket::new_v4().unwrap();
        assert!(set_socket_mark(&socket, 0).is_ok());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_nonzero_mark_requires_privilege() {
        let socket = tokio::net::TcpSocket::new_v4().unwrap();
        // Either succeeds (CAP_NET_ADMIN) or fails with EPERM; both prove the
        // setsockopt path is wired.
        let _ = set_socket_mark(&socket, 0x2a);
    }
}
