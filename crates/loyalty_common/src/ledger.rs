//! Append-only point ledger.
//!
//! Every balance change is a signed entry; the cached balance on the account
//! row is updated in the same transaction so that
//! `balance == SUM(delta)` holds after every commit.

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::db::LoyaltyDb;
use crate::error::{LoyaltyError, Result};
use crate::store::LoyaltyStore;

/// Where a ledger entry came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointSource {
    Purchase,
    Referral,
    Achievement,
    DailyTask,
    StreakBonus,
    Manual,
}

impl PointSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PointSource::Purchase => "purchase",
            PointSource::Referral => "referral",
            PointSource::Achievement => "achievement",
            PointSource::DailyTask => "daily_task",
            PointSource::StreakBonus => "streak_bonus",
            PointSource::Manual => "manual",
        }
    }
}

impl std::fmt::Display for PointSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PointSource {
    type Err = LoyaltyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "purchase" => Ok(PointSource::Purchase),
            "referral" => Ok(PointSource::Referral),
            "achievement" => Ok(PointSource::Achievement),
            "daily_task" => Ok(PointSource::DailyTask),
            "streak_bonus" => Ok(PointSource::StreakBonus),
            "manual" => Ok(PointSource::Manual),
            _ => Err(LoyaltyError::not_found("point source", s)),
        }
    }
}

impl ToSql for PointSource {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for PointSource {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: LoyaltyError| FromSqlError::Other(Box::new(e)))
    }
}

/// Account row: cached balance and tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub balance: i64,
    pub tier: String,
    pub created_at: DateTime<Utc>,
}

/// Immutable ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub account_id: String,
    pub delta: i64,
    pub source: PointSource,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// Result of one committed credit or debit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerChange {
    pub entry_id: i64,
    pub account_id: String,
    pub delta: i64,
    pub balance: i64,
    pub source: PointSource,
    pub reason: String,
}

/// Cached balance compared against the entry sum
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub account_id: String,
    pub cached: i64,
    pub computed: i64,
    pub corrected: bool,
}

/// Create the account if it does not exist yet. Returns true when created.
pub(crate) fn register_in(
    store: &dyn LoyaltyStore,
    account_id: &str,
    base_tier: &str,
    now: DateTime<Utc>,
) -> Result<bool> {
    store.insert_account(account_id, base_tier, now)
}

fn load_account(store: &dyn LoyaltyStore, account_id: &str) -> Result<Account> {
    store
        .load_account(account_id)?
        .ok_or_else(|| LoyaltyError::not_found("account", account_id))
}

fn apply(
    store: &dyn LoyaltyStore,
    account: Account,
    delta: i64,
    source: PointSource,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<LedgerChange> {
    let balance = account
        .balance
        .checked_add(delta)
        .ok_or(LoyaltyError::BalanceOverflow {
            balance: account.balance,
            delta,
        })?;
    let entry_id = store.append_entry(&account.id, delta, source, reason, now)?;
    store.update_cached_balance(&account.id, balance)?;

    debug!(
        "Ledger entry {} for {}: {:+} ({}) -> {}",
        entry_id, account.id, delta, source, balance
    );

    Ok(LedgerChange {
        entry_id,
        account_id: account.id,
        delta,
        balance,
        source,
        reason: reason.to_string(),
    })
}

/// Append a positive entry. Must run inside the caller's transaction.
pub(crate) fn credit_in(
    store: &dyn LoyaltyStore,
    account_id: &str,
    amount: i64,
    source: PointSource,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<LedgerChange> {
    if amount <= 0 {
        return Err(LoyaltyError::InvalidAmount(amount));
    }
    let account = load_account(store, account_id)?;
    apply(store, account, amount, source, reason, now)
}

/// Append a negative entry after checking the balance read in the same transaction.
pub(crate) fn debit_in(
    store: &dyn LoyaltyStore,
    account_id: &str,
    amount: i64,
    source: PointSource,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<LedgerChange> {
    if amount <= 0 {
        return Err(LoyaltyError::InvalidAmount(amount));
    }
    let account = load_account(store, account_id)?;
    if amount > account.balance {
        return Err(LoyaltyError::InsufficientBalance {
            balance: account.balance,
            requested: amount,
        });
    }
    apply(store, account, -amount, source, reason, now)
}

pub(crate) fn reconcile_in(store: &dyn LoyaltyStore, account_id: &str) -> Result<ReconcileReport> {
    let account = load_account(store, account_id)?;
    let computed = store.sum_entries(account_id)?;
    let corrected = computed != account.balance;
    if corrected {
        store.update_cached_balance(account_id, computed)?;
    }
    Ok(ReconcileReport {
        account_id: account.id,
        cached: account.balance,
        computed,
        corrected,
    })
}

/// Point ledger over the shared database
pub struct PointsLedger {
    db: Arc<LoyaltyDb>,
}

impl PointsLedger {
    pub fn new(db: Arc<LoyaltyDb>) -> Self {
        Self { db }
    }

    pub async fn register(&self, account_id: &str, base_tier: &str, now: DateTime<Utc>) -> Result<bool> {
        let account_id = account_id.to_string();
        let base_tier = base_tier.to_string();
        self.db
            .transact(move |conn| register_in(conn, &account_id, &base_tier, now))
            .await
    }

    pub async fn credit(
        &self,
        account_id: &str,
        amount: i64,
        source: PointSource,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<LedgerChange> {
        let account_id = account_id.to_string();
        let reason = reason.to_string();
        self.db
            .transact(move |conn| credit_in(conn, &account_id, amount, source, &reason, now))
            .await
    }

    pub async fn debit(
        &self,
        account_id: &str,
        amount: i64,
        source: PointSource,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<LedgerChange> {
        let account_id = account_id.to_string();
        let reason = reason.to_string();
        self.db
            .transact(move |conn| debit_in(conn, &account_id, amount, source, &reason, now))
            .await
    }

    /// Cached balance
    pub async fn balance(&self, account_id: &str) -> Result<i64> {
        Ok(self.account(account_id).await?.balance)
    }

    pub async fn account(&self, account_id: &str) -> Result<Account> {
        let account_id = account_id.to_string();
        self.db
            .execute(move |conn| load_account(conn, &account_id))
            .await
    }

    /// Recompute the balance from entries and repair cache drift
    pub async fn reconcile(&self, account_id: &str) -> Result<ReconcileReport> {
        let account_id = account_id.to_string();
        let report = self
            .db
            .transact(move |conn| reconcile_in(conn, &account_id))
            .await?;

        if report.corrected {
            warn!(
                "Balance drift on {}: cached {} != ledger {}, corrected",
                report.account_id, report.cached, report.computed
            );
        } else {
            info!("Balance for {} verified at {}", report.account_id, report.computed);
        }
        Ok(report)
    }

    /// Most recent entries first
    pub async fn history(&self, account_id: &str, limit: usize) -> Result<Vec<LedgerEntry>> {
        let account_id = account_id.to_string();
        self.db
            .execute(move |conn| {
                load_account(conn, &account_id)?;
                conn.recent_entries(&account_id, limit)
            })
            .await
    }
}
