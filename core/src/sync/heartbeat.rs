//! Periodic liveness probe of the tracked peer

use std::sync::Arc;
use std::time::Duration;

use crate::sync::client::{PeerProbe, PingOutcome};
use crate::sync::tracker::PeerTracker;
use crate::sync::PeerAddress;

/// How the heartbeat probes
#[derive(Clone)]
pub struct HeartbeatSettings {
    pub probe: Arc<dyn PeerProbe>,
    pub interval: Duration,
}

/// Ping `peer` every `interval` until a ping reports the peer lost.
///
/// Pings are strictly sequential: the next one starts `interval` after the
/// previous one finished. A transient transport error is only logged; the
/// next tick is the retry.
pub(crate) async fn run(
    peer: PeerAddress,
    epoch: u64,
    settings: HeartbeatSettings,
    tracker: PeerTracker,
) {
    tracing::info!(peer = %peer, "heartbeat started");

    loop {
        let outcome = settings.probe.ping(peer).await;
        if outcome.is_peer_lost() {
            tracing::warn!(peer = %peer, "heartbeat failed: {:?}", outcome);
            tracker.heartbeat_failed(epoch).await;
            break;
        }

        match outcome {
            PingOutcome::Pong => tracing::debug!(peer = %peer, "received PONG"),
            other => tracing::warn!(peer = %peer, "error while sending PING: {:?}", other),
        }

        tokio::time::sleep(settings.interval).await;
    }

    tracing::info!(peer = %peer, "heartbeat stopped");
}
