//! Connection liveness supervision.
//!
//! Every probe interval the supervisor walks a snapshot of open connections.
//! A connection whose previous probe was never acknowledged gets evicted:
//! its shutdown handle is signaled and the handler's close path runs the
//! same cleanup as an explicit leave. Everyone else is flipped to
//! unacknowledged and probed again. Two states per connection, no retry
//! counting — one missed interval is fatal.

use std::sync::atomic::Ordering;
use std::time::Duration;

use zephyr_core::signaling::SignalMessage;

use crate::state::RelayState;

/// Run the supervisor until the process exits. Spawn this on its own task.
pub async fn run(state: RelayState, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately; skip it so connections get a
    // full interval before their first probe.
    ticker.tick().await;

    loop {
        ticker.tick().await;
        probe_pass(&state);
    }
}

/// One supervision pass over a snapshot of current connections.
///
/// Iterating a snapshot keeps the pass free of the registry's shard locks
/// while handlers join and leave concurrently; evictions funnel through each
/// handler's own close path.
pub fn probe_pass(state: &RelayState) {
    let snapshot: Vec<(String, crate::state::ConnectionEntry)> = state
        .connections
        .iter()
        .map(|e| (e.key().clone(), e.value().clone()))
        .collect();

    let mut probed = 0usize;
    let mut evicted = 0usize;

    for (peer_id, entry) in snapshot {
        if !entry.alive.load(Ordering::SeqCst) {
            tracing::warn!(
                peer_id = peer_id.as_str(),
                "Liveness probe unacknowledged, evicting connection"
            );
            entry.shutdown.notify_one();
            evicted += 1;
            continue;
        }

        entry.alive.store(false, Ordering::SeqCst);
        let _ = entry.sender.send(SignalMessage::Ping);
        probed += 1;
    }

    if probed > 0 || evicted > 0 {
        tracing::debug!(probed = probed, evicted = evicted, "Liveness pass complete");
    }
}
