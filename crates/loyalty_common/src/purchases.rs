//! Purchase confirmation and delayed cashback.
//!
//! Confirmations are keyed by the external purchase id, so webhook retries
//! return the original record instead of paying twice.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::PurchaseConfig;
use crate::error::{LoyaltyError, Result};
use crate::ledger::PointSource;
use crate::pending::{self, PendingCredit};
use crate::status::{cashback_points, TierTable};
use crate::store::LoyaltyStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Purchase {
    pub purchase_id: String,
    pub account_id: String,
    pub amount: i64,
    /// Points owed at the tier held when the purchase was confirmed
    pub cashback: i64,
    pub pending_credit_id: Option<i64>,
    pub confirmed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurchaseConfirmation {
    pub purchase: Purchase,
    /// False when the purchase id was already confirmed
    pub recorded: bool,
    pub pending: Option<PendingCredit>,
}

pub(crate) fn confirm_in(
    store: &dyn LoyaltyStore,
    tiers: &TierTable,
    config: &PurchaseConfig,
    account_id: &str,
    purchase_id: &str,
    amount: i64,
    now: DateTime<Utc>,
) -> Result<PurchaseConfirmation> {
    if amount <= 0 {
        return Err(LoyaltyError::InvalidAmount(amount));
    }

    if let Some(existing) = store.find_purchase(purchase_id)? {
        if existing.account_id != account_id {
            return Err(LoyaltyError::AlreadyUsed(purchase_id.to_string()));
        }
        let pending = match existing.pending_credit_id {
            Some(id) => store.load_pending_credit(id)?,
            None => None,
        };
        return Ok(PurchaseConfirmation {
            purchase: existing,
            recorded: false,
            pending,
        });
    }

    let account = store
        .load_account(account_id)?
        .ok_or_else(|| LoyaltyError::not_found("account", account_id))?;
    let rate = tiers.calculate_tier(account.balance).cashback_percent;
    let cashback = cashback_points(amount, rate);

    let pending = if cashback > 0 {
        let delay_secs = config.credit_delay_secs.max(0);
        let due_at = Duration::try_seconds(delay_secs)
            .and_then(|delay| now.checked_add_signed(delay))
            .ok_or(LoyaltyError::InvalidAmount(delay_secs))?;
        Some(pending::schedule_in(
            store,
            account_id,
            cashback,
            PointSource::Purchase,
            &format!("cashback:{}", purchase_id),
            due_at,
            now,
        )?)
    } else {
        None
    };

    let purchase = Purchase {
        purchase_id: purchase_id.to_string(),
        account_id: account_id.to_string(),
        amount,
        cashback,
        pending_credit_id: pending.as_ref().map(|p| p.id),
        confirmed_at: now,
    };
    store.insert_purchase(&purchase)?;

    Ok(PurchaseConfirmation {
        purchase,
        recorded: true,
        pending,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoyaltyConfig;
    use crate::db::LoyaltyDb;
    use crate::ledger;

    fn confirm(
        conn: &dyn LoyaltyStore,
        account: &str,
        purchase_id: &str,
        amount: i64,
    ) -> Result<PurchaseConfirmation> {
        let config = LoyaltyConfig::default();
        let tiers = config.tier_table()?;
        confirm_in(conn, &tiers, &config.purchases, account, purchase_id, amount, Utc::now())
    }

    #[tokio::test]
    async fn test_confirmation_is_idempotent() {
        let db = LoyaltyDb::open_in_memory().await.unwrap();
        let (first, second, pending) = db
            .transact(|conn| {
                ledger::register_in(conn, "anna", "Bronze", Utc::now())?;
                let first = confirm(conn, "anna", "order-1", 1000)?;
                let second = confirm(conn, "anna", "order-1", 1000)?;
                Ok((first, second, conn.pending_credits_for("anna")?))
            })
            .await
            .unwrap();

        assert!(first.recorded);
        assert_eq!(first.purchase.cashback, 50);
        assert!(!second.recorded);
        assert_eq!(second.purchase, first.purchase);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].reason, "cashback:order-1");
    }

    #[tokio::test]
    async fn test_cashback_uses_current_tier_and_delay() {
        let db = LoyaltyDb::open_in_memory().await.unwrap();
        let confirmation = db
            .transact(|conn| {
                ledger::register_in(conn, "anna", "Bronze", Utc::now())?;
                ledger::credit_in(conn, "anna", 1500, PointSource::Manual, "seed", Utc::now())?;
                confirm(conn, "anna", "order-2", 200)
            })
            .await
            .unwrap();

        assert_eq!(confirmation.purchase.cashback, 30);
        let pending = confirmation.pending.unwrap();
        assert!(!pending.processed);
        assert!(pending.due_at > confirmation.purchase.confirmed_at + Duration::seconds(590));
    }

    #[tokio::test]
    async fn test_purchase_id_owned_by_other_account() {
        let db = LoyaltyDb::open_in_memory().await.unwrap();
        let result = db
            .transact(|conn| {
                ledger::register_in(conn, "anna", "Bronze", Utc::now())?;
                ledger::register_in(conn, "ben", "Bronze", Utc::now())?;
                confirm(conn, "anna", "order-3", 100)?;
                confirm(conn, "ben", "order-3", 100)
            })
            .await;
        assert!(matches!(result, Err(LoyaltyError::AlreadyUsed(_))));
    }

    #[tokio::test]
    async fn test_unrepresentable_delay_rejects_confirmation() {
        let db = LoyaltyDb::open_in_memory().await.unwrap();
        let result = db
            .transact(|conn| {
                ledger::register_in(conn, "anna", "Bronze", Utc::now())?;
                let mut config = LoyaltyConfig::default();
                config.purchases.credit_delay_secs = i64::MAX;
                let tiers = config.tier_table()?;
                confirm_in(conn, &tiers, &config.purchases, "anna", "order-5", 1000, Utc::now())
            })
            .await;
        assert!(matches!(result, Err(LoyaltyError::InvalidAmount(i64::MAX))));

        let pending = db.execute(|conn| conn.pending_credits_for("anna")).await;
        assert!(pending.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_tiny_purchase_schedules_nothing() {
        let db = LoyaltyDb::open_in_memory().await.unwrap();
        let confirmation = db
            .transact(|conn| {
                ledger::register_in(conn, "anna", "Bronze", Utc::now())?;
                confirm(conn, "anna", "order-4", 5)
            })
            .await
            .unwrap();
        assert_eq!(confirmation.purchase.cashback, 0);
        assert!(confirmation.pending.is_none());
    }
}
