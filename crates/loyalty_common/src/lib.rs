//! Loyalty Common - ledger, status and progression engine for the loyalty program
//!
//! One account balance is shared by purchases, referrals, achievements,
//! daily tasks and streak bonuses. Every change is an append-only ledger
//! entry committed in the same transaction as the rule that produced it.

pub mod achievements;
pub mod clock;
pub mod config;
pub mod daily_tasks;
pub mod db;
pub mod engine;
pub mod error;
pub mod events;
pub mod ledger;
pub mod pending;
pub mod purchases;
pub mod referral;
pub mod social;
pub mod status;
pub mod store;
pub mod streaks;

pub use config::LoyaltyConfig;
pub use db::{DbLocation, LoyaltyDb};
pub use engine::LoyaltyEngine;
pub use error::{LoyaltyError, Result};
pub use events::{EventEnvelope, LoyaltyEvent, Notifier};
pub use ledger::PointSource;
pub use social::SocialNetwork;
