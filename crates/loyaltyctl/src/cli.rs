//! CLI - Command-line argument parsing
//!
//! Defines the CLI structure using clap. Execution lives in `commands`.

use clap::{Parser, Subcommand};
use loyalty_common::achievements::AchievementCategory;
use loyalty_common::{PointSource, SocialNetwork};
use std::path::PathBuf;

/// Loyalty engine CLI
#[derive(Parser, Debug)]
#[command(name = "loyaltyctl")]
#[command(about = "Loyalty Engine - points, tiers, referrals and daily tasks", long_about = None)]
#[command(version)]
#[command(disable_help_subcommand = true)]
pub struct Cli {
    /// Database file (overrides storage.db_path and defaults)
    #[arg(long, global = true)]
    pub db: Option<PathBuf>,

    /// Config file (overrides $LOYALTY_CONFIG and defaults)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Output JSON only
    #[arg(long, global = true)]
    pub json: bool,

    /// Log engine activity to stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create an account in the base tier
    Register { account: String },

    /// Add points to an account
    Credit {
        account: String,
        amount: i64,

        #[arg(long, default_value = "manual")]
        source: PointSource,

        #[arg(long, default_value = "manual adjustment")]
        reason: String,
    },

    /// Remove points from an account
    Debit {
        account: String,
        amount: i64,

        #[arg(long, default_value = "manual")]
        source: PointSource,

        #[arg(long, default_value = "manual adjustment")]
        reason: String,
    },

    /// Show balance, tier and cashback rate
    Status { account: String },

    /// Show recent ledger entries, newest first
    History {
        account: String,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Compare the cached balance with the ledger and repair it
    Reconcile { account: String },

    /// Referral codes
    Referral {
        #[command(subcommand)]
        action: ReferralCommands,
    },

    /// Achievements
    Achievements {
        #[command(subcommand)]
        action: AchievementCommands,
    },

    /// Daily tasks
    Tasks {
        #[command(subcommand)]
        action: TaskCommands,
    },

    /// Show the activity streak
    Streak { account: String },

    /// Link a social network account
    Link {
        account: String,
        network: SocialNetwork,
    },

    /// Confirm a purchase and schedule its cashback
    Purchase {
        account: String,
        purchase_id: String,
        amount: i64,
    },

    /// Schedule a credit to be applied later
    Schedule {
        account: String,
        amount: i64,

        /// Seconds until the credit becomes due
        #[arg(long, default_value_t = 0)]
        delay_secs: i64,

        #[arg(long, default_value = "manual")]
        source: PointSource,

        #[arg(long, default_value = "scheduled credit")]
        reason: String,
    },

    /// Apply every due pending credit now
    Sweep,
}

#[derive(Subcommand, Debug)]
pub enum ReferralCommands {
    /// Issue (or show the open) referral code for an owner
    Generate { owner: String },

    /// Check whether a code can be activated
    Validate { code: String },

    /// Activate a code for a new account
    Activate { code: String, referee: String },

    /// Activation totals for an owner
    Stats { owner: String },
}

#[derive(Subcommand, Debug)]
pub enum AchievementCommands {
    /// Evaluate and unlock achievements
    Check {
        account: String,

        #[arg(long)]
        category: Option<AchievementCategory>,
    },

    /// Stored progress per achievement
    Progress { account: String },

    /// List achievement definitions
    List,
}

#[derive(Subcommand, Debug)]
pub enum TaskCommands {
    /// Today's tasks, generated on first request
    List { account: String },

    /// Record progress on one of today's tasks
    Progress {
        account: String,
        task: String,

        #[arg(long, default_value_t = 1)]
        by: i64,
    },
}
