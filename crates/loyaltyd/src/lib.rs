//! Loyalty Daemon - background worker for the loyalty engine
//!
//! Owns the database connection, applies due pending credits on a timer and
//! forwards engine events to the log.

pub mod config;
pub mod notifications;
pub mod sweeper;

use anyhow::{Context, Result};
use loyalty_common::{LoyaltyDb, LoyaltyEngine};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::Config;
use crate::sweeper::Sweeper;

/// Running daemon: the engine plus its background tasks
pub struct Daemon {
    engine: Arc<LoyaltyEngine>,
    sweeper: JoinHandle<()>,
    forwarder: JoinHandle<usize>,
    shutdown: watch::Sender<bool>,
}

impl Daemon {
    /// Open the configured database and start the background tasks
    pub async fn start(config: Config) -> Result<Self> {
        let engine = LoyaltyEngine::open(config.engine.clone())
            .await
            .context("Failed to open loyalty engine")?;
        Self::start_with(engine, &config).await
    }

    /// Start over an already open database
    pub async fn start_on(db: Arc<LoyaltyDb>, config: Config) -> Result<Self> {
        let engine = LoyaltyEngine::new(db, config.engine.clone())?;
        Self::start_with(engine, &config).await
    }

    async fn start_with(engine: LoyaltyEngine, config: &Config) -> Result<Self> {
        let (notifier, forwarder) = notifications::spawn_forwarder();
        let engine = Arc::new(engine.with_notifier(Arc::new(notifier)));

        let sweeper = Sweeper::new(
            Arc::clone(&engine),
            Duration::from_secs(config.daemon.sweep_interval_secs),
        );
        if config.daemon.sweep_on_start {
            sweeper.sweep_once().await;
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let sweeper = tokio::spawn(sweeper.run(shutdown_rx));

        info!(
            "Daemon ready, sweeping every {}s",
            config.daemon.sweep_interval_secs
        );
        Ok(Self {
            engine,
            sweeper,
            forwarder,
            shutdown,
        })
    }

    pub fn engine(&self) -> &Arc<LoyaltyEngine> {
        &self.engine
    }

    /// Stop the sweeper, then let the forwarder drain what is queued.
    /// Returns the number of events forwarded.
    pub async fn shutdown(self) -> Result<usize> {
        let _ = self.shutdown.send(true);
        self.sweeper.await?;

        // The forwarder ends once the last engine handle (and its notifier) is gone
        drop(self.engine);
        let forwarded = self.forwarder.await?;
        info!("Forwarded {} events", forwarded);
        Ok(forwarded)
    }
}
