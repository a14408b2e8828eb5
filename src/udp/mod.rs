//! UDP session multiplexer
//!
//! One encrypted datagram channel per upstream, fanned out to many
//! concurrent destinations through per-source subscription queues.

mod session;

use std::sync::Arc;

pub use session::{UdpSession, SUBSCRIPTION_QUEUE_CAPACITY};

use crate::balancer::{Balancer, Proto, Upstream};
use crate::error::WsRelayError;

impl Balancer {
    /// Open a new UDP session through `upstream`.
    ///
    /// Dials the upstream's datagram endpoint under the global dial bound
    /// and starts the session's read loop.
    ///
    /// # Errors
    ///
    /// Returns the dial error when the channel cannot be established.
    pub async fn new_udp_session(
        &self,
        upstream: &Arc<Upstream>,
    ) -> Result<Arc<UdpSession>, WsRelayError> {
        let conn = self.dial_ws_limited(upstream.endpoint(Proto::Udp)).await?;
        Ok(UdpSession::start(
            upstream.name().to_string(),
            upstream.cipher().clone(),
            conn,
        ))
    }
}
