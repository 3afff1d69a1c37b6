//! Engine configuration.
//!
//! Loaded from `$LOYALTY_CONFIG`, /etc/loyalty/config.toml or
//! /var/lib/loyalty/config.toml, falling back to built-in defaults.
//! Every field has a default so partial files are valid.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::daily_tasks;
use crate::error::LoyaltyError;
use crate::status::{TierLevel, TierTable};

/// Config file path
pub const CONFIG_PATH: &str = "/etc/loyalty/config.toml";

/// Fallback config file path
pub const DEFAULT_CONFIG_PATH: &str = "/var/lib/loyalty/config.toml";

/// Environment override for the config file location
pub const CONFIG_ENV: &str = "LOYALTY_CONFIG";

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database file. Unset means auto-detect (system or user data dir).
    #[serde(default)]
    pub db_path: Option<PathBuf>,

    /// How long SQLite waits on a competing writer before reporting busy
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_ms: u64,

    /// Transaction attempts before surfacing ConcurrencyConflict
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_busy_timeout() -> u64 {
    5_000
}

fn default_max_retries() -> u32 {
    3
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            busy_timeout_ms: default_busy_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

/// Referral program configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferralConfig {
    #[serde(default = "default_code_prefix")]
    pub code_prefix: String,

    /// Random characters appended to the prefix
    #[serde(default = "default_code_length")]
    pub code_length: usize,

    /// Collision retries before CodeGenerationExhausted
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Points paid to the code owner
    #[serde(default = "default_referrer_bonus")]
    pub referrer_bonus: i64,

    /// Points paid to the account that activates the code
    #[serde(default = "default_referee_bonus")]
    pub referee_bonus: i64,
}

fn default_code_prefix() -> String {
    "FAR".to_string()
}

fn default_code_length() -> usize {
    4
}

fn default_max_attempts() -> u32 {
    10
}

fn default_referrer_bonus() -> i64 {
    50
}

fn default_referee_bonus() -> i64 {
    20
}

impl Default for ReferralConfig {
    fn default() -> Self {
        Self {
            code_prefix: default_code_prefix(),
            code_length: default_code_length(),
            max_attempts: default_max_attempts(),
            referrer_bonus: default_referrer_bonus(),
            referee_bonus: default_referee_bonus(),
        }
    }
}

/// One-time bonus for reaching an exact streak length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreakMilestone {
    pub length: u32,
    pub bonus: i64,
}

/// Streak configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreakConfig {
    /// Completed easy tasks needed for a day to count as active
    #[serde(default = "default_min_easy_tasks")]
    pub min_easy_tasks: u32,

    #[serde(default = "default_milestones")]
    pub milestones: Vec<StreakMilestone>,
}

fn default_min_easy_tasks() -> u32 {
    2
}

fn default_milestones() -> Vec<StreakMilestone> {
    vec![
        StreakMilestone { length: 3, bonus: 50 },
        StreakMilestone { length: 7, bonus: 150 },
        StreakMilestone { length: 14, bonus: 300 },
        StreakMilestone { length: 30, bonus: 1_000 },
    ]
}

impl Default for StreakConfig {
    fn default() -> Self {
        Self {
            min_easy_tasks: default_min_easy_tasks(),
            milestones: default_milestones(),
        }
    }
}

impl StreakConfig {
    pub fn milestone_for(&self, length: u32) -> Option<StreakMilestone> {
        self.milestones.iter().copied().find(|m| m.length == length)
    }
}

/// Daily task selection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyTaskConfig {
    #[serde(default = "default_min_tasks")]
    pub min_tasks: usize,

    #[serde(default = "default_max_tasks")]
    pub max_tasks: usize,

    /// Chance of each hard task, indexed by tier rank (last value repeats)
    #[serde(default = "default_hard_task_chance")]
    pub hard_task_chance: Vec<f64>,
}

fn default_min_tasks() -> usize {
    5
}

fn default_max_tasks() -> usize {
    7
}

fn default_hard_task_chance() -> Vec<f64> {
    vec![0.10, 0.20, 0.35, 0.50]
}

impl Default for DailyTaskConfig {
    fn default() -> Self {
        Self {
            min_tasks: default_min_tasks(),
            max_tasks: default_max_tasks(),
            hard_task_chance: default_hard_task_chance(),
        }
    }
}

impl DailyTaskConfig {
    pub fn hard_chance_for_rank(&self, rank: usize) -> f64 {
        self.hard_task_chance
            .get(rank)
            .or_else(|| self.hard_task_chance.last())
            .copied()
            .unwrap_or(0.0)
            .clamp(0.0, 1.0)
    }
}

/// Purchase cashback configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurchaseConfig {
    /// Delay between purchase confirmation and the cashback credit
    #[serde(default = "default_credit_delay")]
    pub credit_delay_secs: i64,
}

fn default_credit_delay() -> i64 {
    600 // 10 minutes, leaves room for refunds right after checkout
}

impl Default for PurchaseConfig {
    fn default() -> Self {
        Self {
            credit_delay_secs: default_credit_delay(),
        }
    }
}

fn default_tiers() -> Vec<TierLevel> {
    vec![
        TierLevel::new("Bronze", 0, 5),
        TierLevel::new("Silver", 500, 10),
        TierLevel::new("Gold", 1_500, 15),
        TierLevel::new("Platinum", 3_000, 20),
    ]
}

/// Full engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoyaltyConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    /// Tier table, ascending by min_points
    #[serde(default = "default_tiers")]
    pub tiers: Vec<TierLevel>,

    #[serde(default)]
    pub referral: ReferralConfig,

    #[serde(default)]
    pub streaks: StreakConfig,

    #[serde(default)]
    pub daily_tasks: DailyTaskConfig,

    #[serde(default)]
    pub purchases: PurchaseConfig,
}

impl Default for LoyaltyConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            tiers: default_tiers(),
            referral: ReferralConfig::default(),
            streaks: StreakConfig::default(),
            daily_tasks: DailyTaskConfig::default(),
            purchases: PurchaseConfig::default(),
        }
    }
}

impl LoyaltyConfig {
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

    /// Load and validate config from a specific path
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: LoyaltyConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.validate()?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> std::result::Result<(), LoyaltyError> {
        TierTable::new(self.tiers.clone())?;

        if self.daily_tasks.min_tasks == 0 || self.daily_tasks.min_tasks > self.daily_tasks.max_tasks {
            return Err(LoyaltyError::Config(format!(
                "daily_tasks.min_tasks ({}) must be between 1 and max_tasks ({})",
                self.daily_tasks.min_tasks, self.daily_tasks.max_tasks
            )));
        }
        // Room for every guaranteed easy task plus the medium one
        let floor = daily_tasks::guaranteed_task_count(&daily_tasks::catalog()) + 1;
        if self.daily_tasks.max_tasks < floor {
            return Err(LoyaltyError::Config(format!(
                "daily_tasks.max_tasks ({}) must be at least {}",
                self.daily_tasks.max_tasks, floor
            )));
        }
        if self.streaks.min_easy_tasks == 0 {
            return Err(LoyaltyError::Config("streaks.min_easy_tasks must be at least 1".to_string()));
        }
        if self.referral.max_attempts == 0 {
            return Err(LoyaltyError::Config("referral.max_attempts must be at least 1".to_string()));
        }
        if self.referral.referrer_bonus <= 0 || self.referral.referee_bonus <= 0 {
            return Err(LoyaltyError::Config("referral bonuses must be positive".to_string()));
        }
        if self.storage.max_retries == 0 {
            return Err(LoyaltyError::Config("storage.max_retries must be at least 1".to_string()));
        }
        Ok(())
    }

    /// Validated tier table
    pub fn tier_table(&self) -> std::result::Result<TierTable, LoyaltyError> {
        TierTable::new(self.tiers.clone())
    }
}
