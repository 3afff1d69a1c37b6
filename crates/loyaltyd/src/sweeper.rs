//! Periodic sweep that applies due pending credits.

use loyalty_common::LoyaltyEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub struct Sweeper {
    engine: Arc<LoyaltyEngine>,
    interval: Duration,
}

impl Sweeper {
    pub fn new(engine: Arc<LoyaltyEngine>, interval: Duration) -> Self {
        Self { engine, interval }
    }

    /// One pass over due credits. Returns how many were applied.
    pub async fn sweep_once(&self) -> usize {
        match self.engine.process_due_credits().await {
            Ok(applied) if applied.is_empty() => {
                debug!("Sweep found no due credits");
                0
            }
            Ok(applied) => {
                let total: i64 = applied.iter().map(|c| c.change.delta).sum();
                info!("Applied {} pending credits ({} points)", applied.len(), total);
                applied.len()
            }
            Err(e) => {
                // Unapplied rows stay pending for the next pass
                warn!("Pending credit sweep failed: {}", e);
                0
            }
        }
    }

    /// Sweep on every tick until `shutdown` flips to true or its sender is dropped
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Sweeper stopped");
    }
}
