//! Configuration management for loyaltyd.
//!
//! The daemon reads the same file as the engine. Daemon settings live under
//! `[daemon]`, everything else is passed through to [`LoyaltyConfig`].

use anyhow::{Context, Result};
use loyalty_common::config::{CONFIG_ENV, CONFIG_PATH, DEFAULT_CONFIG_PATH};
use loyalty_common::LoyaltyConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

/// Daemon-only settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Seconds between pending credit sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Sweep once before the first interval elapses
    #[serde(default = "default_sweep_on_start")]
    pub sweep_on_start: bool,

    /// Default filter when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_sweep_on_start() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
            sweep_on_start: default_sweep_on_start(),
            log_level: default_log_level(),
        }
    }
}

/// Full daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,

    #[serde(flatten)]
    pub engine: LoyaltyConfig,
}

impl Config {
    /// Load config from the first readable location, or return defaults
    pub fn load() -> Self {
        let env_path = std::env::var(CONFIG_ENV).ok();
        let candidates = env_path
            .iter()
            .map(String::as_str)
            .chain([CONFIG_PATH, DEFAULT_CONFIG_PATH]);

        for path in candidates {
            if !Path::new(path).exists() {
                continue;
            }
            match Self::load_from_path(path) {
                Ok(config) => return config,
                Err(e) => warn!("Ignoring config at {}: {:#}", path, e),
            }
        }

        warn!("Config not found, using defaults");
        Self::default()
    }

    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config = Self::parse(&content)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.daemon.sweep_interval_secs == 0 {
            anyhow::bail!("daemon.sweep_interval_secs must be at least 1");
        }
        self.engine.validate()?;
        Ok(())
    }
}
