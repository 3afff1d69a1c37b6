//! Tier and cashback derivation.
//!
//! Tiers are bands over the point balance, ordered by ascending minimum.
//! The tier is recomputed from the balance on every refresh and is not
//! sticky: a deduction below a threshold downgrades the account.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::db::LoyaltyDb;
use crate::error::{LoyaltyError, Result};
use crate::store::LoyaltyStore;

/// One band of the tier table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLevel {
    pub name: String,
    /// Lowest balance that qualifies for this tier
    pub min_points: i64,
    /// Share of a purchase returned as points
    pub cashback_percent: u32,
}

impl TierLevel {
    pub fn new(name: &str, min_points: i64, cashback_percent: u32) -> Self {
        Self {
            name: name.to_string(),
            min_points,
            cashback_percent,
        }
    }
}

/// Validated tier table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierTable {
    levels: Vec<TierLevel>,
}

impl TierTable {
    /// Levels must be non-empty, start at 0 and be strictly ascending.
    pub fn new(levels: Vec<TierLevel>) -> Result<Self> {
        let first = levels
            .first()
            .ok_or_else(|| LoyaltyError::Config("tier table is empty".to_string()))?;
        if first.min_points != 0 {
            return Err(LoyaltyError::Config(format!(
                "lowest tier {} must start at 0 points",
                first.name
            )));
        }
        for pair in levels.windows(2) {
            if pair[1].min_points <= pair[0].min_points {
                return Err(LoyaltyError::Config(format!(
                    "tier {} must require more points than {}",
                    pair[1].name, pair[0].name
                )));
            }
        }
        if let Some(level) = levels.iter().find(|l| l.cashback_percent > 100) {
            return Err(LoyaltyError::Config(format!(
                "tier {} has cashback above 100%",
                level.name
            )));
        }
        Ok(Self { levels })
    }

    pub fn levels(&self) -> &[TierLevel] {
        &self.levels
    }

    /// Tier every new account starts in
    pub fn base(&self) -> &TierLevel {
        &self.levels[0]
    }

    /// Highest tier whose minimum is at or below the balance
    pub fn calculate_tier(&self, balance: i64) -> &TierLevel {
        &self.levels[self.rank_for_balance(balance)]
    }

    pub fn rank_for_balance(&self, balance: i64) -> usize {
        self.levels
            .iter()
            .rposition(|level| balance >= level.min_points)
            .unwrap_or(0)
    }

    pub fn rank_of(&self, tier: &str) -> Option<usize> {
        self.levels.iter().position(|level| level.name == tier)
    }

    /// Cashback percentage for a tier name
    pub fn calculate_cashback(&self, tier: &str) -> Option<u32> {
        self.rank_of(tier).map(|rank| self.levels[rank].cashback_percent)
    }

    pub fn next_tier(&self, tier: &str) -> Option<&TierLevel> {
        self.rank_of(tier).and_then(|rank| self.levels.get(rank + 1))
    }
}

/// round(amount * rate / 100), half away from zero
pub fn cashback_points(amount: i64, cashback_percent: u32) -> i64 {
    (amount as f64 * f64::from(cashback_percent) / 100.0).round() as i64
}

/// Tier transition recorded by a refresh
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierChange {
    pub account_id: String,
    pub old: String,
    pub new: String,
}

/// Current standing of an account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub account_id: String,
    pub balance: i64,
    pub tier: String,
    pub cashback_percent: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_tier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub points_to_next: Option<i64>,
}

/// Recompute the tier from the balance and persist it if it moved.
pub(crate) fn refresh_in(
    store: &dyn LoyaltyStore,
    tiers: &TierTable,
    account_id: &str,
) -> Result<Option<TierChange>> {
    let account = store
        .load_account(account_id)?
        .ok_or_else(|| LoyaltyError::not_found("account", account_id))?;

    let tier = tiers.calculate_tier(account.balance);
    if tier.name == account.tier {
        return Ok(None);
    }

    store.update_cached_tier(account_id, &tier.name)?;
    Ok(Some(TierChange {
        account_id: account_id.to_string(),
        old: account.tier,
        new: tier.name.clone(),
    }))
}

pub(crate) fn snapshot_in(
    store: &dyn LoyaltyStore,
    tiers: &TierTable,
    account_id: &str,
) -> Result<StatusSnapshot> {
    let account = store
        .load_account(account_id)?
        .ok_or_else(|| LoyaltyError::not_found("account", account_id))?;

    let tier = tiers.calculate_tier(account.balance);
    let next = tiers.next_tier(&tier.name);

    Ok(StatusSnapshot {
        account_id: account.id,
        balance: account.balance,
        tier: tier.name.clone(),
        cashback_percent: tier.cashback_percent,
        next_tier: next.map(|n| n.name.clone()),
        points_to_next: next.map(|n| n.min_points - account.balance),
    })
}

/// Derives tiers and cashback for accounts
pub struct StatusEngine {
    db: Arc<LoyaltyDb>,
    tiers: TierTable,
}

impl StatusEngine {
    pub fn new(db: Arc<LoyaltyDb>, tiers: TierTable) -> Self {
        Self { db, tiers }
    }

    pub fn tiers(&self) -> &TierTable {
        &self.tiers
    }

    pub fn calculate_tier(&self, balance: i64) -> &TierLevel {
        self.tiers.calculate_tier(balance)
    }

    pub fn calculate_cashback(&self, tier: &str) -> Option<u32> {
        self.tiers.calculate_cashback(tier)
    }

    /// Persist the tier implied by the current balance
    pub async fn refresh_status(&self, account_id: &str) -> Result<Option<TierChange>> {
        let tiers = self.tiers.clone();
        let account_id = account_id.to_string();
        let change = self
            .db
            .transact(move |conn| refresh_in(conn, &tiers, &account_id))
            .await?;

        if let Some(change) = &change {
            info!(
                "Account {} moved from {} to {}",
                change.account_id, change.old, change.new
            );
        }
        Ok(change)
    }

    pub async fn get_status(&self, account_id: &str) -> Result<StatusSnapshot> {
        let tiers = self.tiers.clone();
        let account_id = account_id.to_string();
        self.db
            .execute(move |conn| snapshot_in(conn, &tiers, &account_id))
            .await
    }

    /// Cashback points for a purchase at the account's current tier
    pub async fn cashback_for_purchase(&self, account_id: &str, amount: i64) -> Result<i64> {
        if amount <= 0 {
            return Err(LoyaltyError::InvalidAmount(amount));
        }
        let status = self.get_status(account_id).await?;
        Ok(cashback_points(amount, status.cashback_percent))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoyaltyConfig;

    fn default_table() -> TierTable {
        LoyaltyConfig::default().tier_table().unwrap()
    }

    #[test]
    fn test_tier_boundaries() {
        let table = default_table();
        let cases = [
            (0, "Bronze", 5),
            (499, "Bronze", 5),
            (500, "Silver", 10),
            (1499, "Silver", 10),
            (1500, "Gold", 15),
            (2999, "Gold", 15),
            (3000, "Platinum", 20),
            (1_000_000, "Platinum", 20),
        ];
        for (balance, name, cashback) in cases {
            let tier = table.calculate_tier(balance);
            assert_eq!(tier.name, name, "balance {}", balance);
            assert_eq!(table.calculate_cashback(&tier.name), Some(cashback));
        }
    }

    #[test]
    fn test_negative_balance_falls_back_to_base() {
        let table = default_table();
        assert_eq!(table.calculate_tier(-10).name, "Bronze");
    }

    #[test]
    fn test_next_tier() {
        let table = default_table();
        assert_eq!(table.next_tier("Bronze").map(|t| t.name.as_str()), Some("Silver"));
        assert!(table.next_tier("Platinum").is_none());
        assert!(table.next_tier("Diamond").is_none());
    }

    #[test]
    fn test_cashback_rounding() {
        assert_eq!(cashback_points(1000, 5), 50);
        assert_eq!(cashback_points(1250, 5), 63);
        assert_eq!(cashback_points(1249, 5), 62);
        assert_eq!(cashback_points(7, 10), 1);
        assert_eq!(cashback_points(4, 10), 0);
    }

    #[test]
    fn test_table_validation() {
        assert!(TierTable::new(vec![]).is_err());
        assert!(TierTable::new(vec![TierLevel::new("A", 10, 5)]).is_err());
        assert!(TierTable::new(vec![
            TierLevel::new("A", 0, 5),
            TierLevel::new("B", 0, 10),
        ])
        .is_err());
        assert!(TierTable::new(vec![TierLevel::new("A", 0, 150)]).is_err());
    }

    #[tokio::test]
    async fn test_refresh_persists_change_once() {
        let db = Arc::new(LoyaltyDb::open_in_memory().await.unwrap());
        let engine = StatusEngine::new(Arc::clone(&db), default_table());

        db.transact(|conn| {
            crate::ledger::register_in(conn, "anna", "Bronze", chrono::Utc::now())?;
            crate::ledger::credit_in(
                conn,
                "anna",
                600,
                crate::ledger::PointSource::Manual,
                "seed",
                chrono::Utc::now(),
            )?;
            Ok(())
        })
        .await
        .unwrap();

        let change = engine.refresh_status("anna").await.unwrap().unwrap();
        assert_eq!(change.old, "Bronze");
        assert_eq!(change.new, "Silver");
        assert!(engine.refresh_status("anna").await.unwrap().is_none());

        let status = engine.get_status("anna").await.unwrap();
        assert_eq!(status.tier, "Silver");
        assert_eq!(status.next_tier.as_deref(), Some("Gold"));
        assert_eq!(status.points_to_next, Some(900));
        assert_eq!(engine.cashback_for_purchase("anna", 200).await.unwrap(), 20);
    }

    #[tokio::test]
    async fn test_unknown_account() {
        let db = Arc::new(LoyaltyDb::open_in_memory().await.unwrap());
        let engine = StatusEngine::new(db, default_table());
        assert!(matches!(
            engine.get_status("ghost").await,
            Err(LoyaltyError::NotFound { entity: "account", .. })
        ));
    }
}
