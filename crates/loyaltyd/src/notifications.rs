//! Forwards engine events to the daemon log.
//!
//! The engine hands events to a [`ChannelNotifier`] so a slow consumer never
//! blocks a committed operation. This task drains the channel and writes one
//! structured log line per event. Delivery to users is outside the daemon.

use loyalty_common::events::ChannelNotifier;
use loyalty_common::EventEnvelope;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Notifier for the engine plus the task draining it
pub fn spawn_forwarder() -> (ChannelNotifier, JoinHandle<usize>) {
    let (notifier, rx) = ChannelNotifier::new();
    let handle = tokio::spawn(forward(rx));
    (notifier, handle)
}

/// Drain until every sender is dropped. Returns the number of events seen.
pub async fn forward(mut rx: UnboundedReceiver<EventEnvelope>) -> usize {
    let mut seen = 0;
    while let Some(envelope) = rx.recv().await {
        seen += 1;
        match serde_json::to_string(&envelope) {
            Ok(payload) => info!(
                target: "loyalty::events",
                id = %envelope.id,
                kind = envelope.event.kind(),
                "{}",
                payload
            ),
            Err(e) => warn!("Could not serialize event {}: {}", envelope.id, e),
        }
    }
    seen
}
