//! Progress sources for achievement conditions.
//!
//! Each definition names a [`ProgressField`]; the registry maps the field to
//! a [`ProgressSource`] that reads the current value from the store.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{LoyaltyError, Result};
use crate::status::TierTable;
use crate::store::LoyaltyStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressField {
    PurchaseCount,
    ReferralCount,
    PointBalance,
    /// Index of the current tier in the tier table (base tier is 0)
    TierRank,
    SocialLinks,
    LongestStreak,
    TasksCompleted,
}

impl ProgressField {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressField::PurchaseCount => "purchase_count",
            ProgressField::ReferralCount => "referral_count",
            ProgressField::PointBalance => "point_balance",
            ProgressField::TierRank => "tier_rank",
            ProgressField::SocialLinks => "social_links",
            ProgressField::LongestStreak => "longest_streak",
            ProgressField::TasksCompleted => "tasks_completed",
        }
    }
}

/// Reads one progress value for an account
pub trait ProgressSource: Send + Sync {
    fn field(&self) -> ProgressField;
    fn compute(&self, store: &dyn LoyaltyStore, account_id: &str) -> Result<i64>;
}

fn balance_of(store: &dyn LoyaltyStore, account_id: &str) -> Result<i64> {
    store
        .load_account(account_id)?
        .map(|account| account.balance)
        .ok_or_else(|| LoyaltyError::not_found("account", account_id))
}

struct PurchaseCount;

impl ProgressSource for PurchaseCount {
    fn field(&self) -> ProgressField {
        ProgressField::PurchaseCount
    }

    fn compute(&self, store: &dyn LoyaltyStore, account_id: &str) -> Result<i64> {
        store.count_purchases(account_id)
    }
}

struct ReferralCount;

impl ProgressSource for ReferralCount {
    fn field(&self) -> ProgressField {
        ProgressField::ReferralCount
    }

    fn compute(&self, store: &dyn LoyaltyStore, account_id: &str) -> Result<i64> {
        store.count_referral_activations(account_id)
    }
}

struct PointBalance;

impl ProgressSource for PointBalance {
    fn field(&self) -> ProgressField {
        ProgressField::PointBalance
    }

    fn compute(&self, store: &dyn LoyaltyStore, account_id: &str) -> Result<i64> {
        balance_of(store, account_id)
    }
}

struct TierRank {
    tiers: TierTable,
}

impl ProgressSource for TierRank {
    fn field(&self) -> ProgressField {
        ProgressField::TierRank
    }

    // Derived from the balance so it never lags behind a pending status refresh
    fn compute(&self, store: &dyn LoyaltyStore, account_id: &str) -> Result<i64> {
        let balance = balance_of(store, account_id)?;
        Ok(self.tiers.rank_for_balance(balance) as i64)
    }
}

struct SocialLinks;

impl ProgressSource for SocialLinks {
    fn field(&self) -> ProgressField {
        ProgressField::SocialLinks
    }

    fn compute(&self, store: &dyn LoyaltyStore, account_id: &str) -> Result<i64> {
        Ok(store.linked_networks(account_id)?.len() as i64)
    }
}

struct LongestStreak;

impl ProgressSource for LongestStreak {
    fn field(&self) -> ProgressField {
        ProgressField::LongestStreak
    }

    fn compute(&self, store: &dyn LoyaltyStore, account_id: &str) -> Result<i64> {
        Ok(store
            .load_streak(account_id)?
            .map(|streak| i64::from(streak.longest_streak))
            .unwrap_or(0))
    }
}

struct TasksCompleted;

impl ProgressSource for TasksCompleted {
    fn field(&self) -> ProgressField {
        ProgressField::TasksCompleted
    }

    fn compute(&self, store: &dyn LoyaltyStore, account_id: &str) -> Result<i64> {
        store.count_completed_tasks(account_id)
    }
}

/// Field -> source lookup
#[derive(Default)]
pub struct ProgressRegistry {
    sources: HashMap<ProgressField, Box<dyn ProgressSource>>,
}

impl ProgressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with a source for every built-in field
    pub fn with_defaults(tiers: TierTable) -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(PurchaseCount));
        registry.register(Box::new(ReferralCount));
        registry.register(Box::new(PointBalance));
        registry.register(Box::new(TierRank { tiers }));
        registry.register(Box::new(SocialLinks));
        registry.register(Box::new(LongestStreak));
        registry.register(Box::new(TasksCompleted));
        registry
    }

    /// Replaces any source already registered for the same field
    pub fn register(&mut self, source: Box<dyn ProgressSource>) {
        self.sources.insert(source.field(), source);
    }

    pub fn compute(&self, field: ProgressField, store: &dyn LoyaltyStore, account_id: &str) -> Result<i64> {
        let source = self
            .sources
            .get(&field)
            .ok_or_else(|| LoyaltyError::not_found("progress source", field.as_str()))?;
        source.compute(store, account_id)
    }
}
