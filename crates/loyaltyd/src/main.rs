//! Loyalty Daemon - applies pending credits and forwards engine events.

use anyhow::Result;
use loyaltyd::config::Config;
use loyaltyd::Daemon;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load();

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.daemon.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Loyalty Daemon v{} starting", env!("CARGO_PKG_VERSION"));
    config.validate()?;

    let daemon = Daemon::start(config).await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down gracefully");
    daemon.shutdown().await?;

    Ok(())
}
