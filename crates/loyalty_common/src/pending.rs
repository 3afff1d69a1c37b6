//! Durable delayed credits.
//!
//! A scheduled credit is a row with a due time. The sweep applies each due
//! row in its own transaction: the `processed = 0 -> 1` flip and the ledger
//! credit commit together, so a row is applied exactly once no matter how
//! many sweeps race over it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::db::LoyaltyDb;
use crate::error::{LoyaltyError, Result};
use crate::ledger::{self, LedgerChange, PointSource};
use crate::store::LoyaltyStore;

/// Upper bound on rows handled by one sweep
pub const DEFAULT_SWEEP_BATCH: usize = 500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingCredit {
    pub id: i64,
    pub account_id: String,
    pub amount: i64,
    pub source: PointSource,
    pub reason: String,
    /// Second precision
    pub due_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedCredit {
    pub pending_id: i64,
    pub change: LedgerChange,
}

pub(crate) fn schedule_in(
    store: &dyn LoyaltyStore,
    account_id: &str,
    amount: i64,
    source: PointSource,
    reason: &str,
    due_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<PendingCredit> {
    if amount <= 0 {
        return Err(LoyaltyError::InvalidAmount(amount));
    }
    if store.load_account(account_id)?.is_none() {
        return Err(LoyaltyError::not_found("account", account_id));
    }
    let id = store.insert_pending_credit(account_id, amount, source, reason, due_at, now)?;
    store
        .load_pending_credit(id)?
        .ok_or_else(|| LoyaltyError::not_found("pending credit", id.to_string()))
}

/// Apply one row if it is due and unprocessed. Returns None otherwise.
pub(crate) fn process_one_in(store: &dyn LoyaltyStore, id: i64, now: DateTime<Utc>) -> Result<Option<AppliedCredit>> {
    let job = store
        .load_pending_credit(id)?
        .ok_or_else(|| LoyaltyError::not_found("pending credit", id.to_string()))?;

    if job.processed || job.due_at > now {
        return Ok(None);
    }
    if !store.mark_pending_processed(id, now)? {
        return Ok(None);
    }

    let change = ledger::credit_in(store, &job.account_id, job.amount, job.source, &job.reason, now)?;
    Ok(Some(AppliedCredit { pending_id: id, change }))
}

/// Scheduled credits over the shared database
pub struct PendingCredits {
    db: Arc<LoyaltyDb>,
}

impl PendingCredits {
    pub fn new(db: Arc<LoyaltyDb>) -> Self {
        Self { db }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn schedule(
        &self,
        account_id: &str,
        amount: i64,
        source: PointSource,
        reason: &str,
        due_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<PendingCredit> {
        let account_id = account_id.to_string();
        let reason = reason.to_string();
        let job = self
            .db
            .transact(move |conn| schedule_in(conn, &account_id, amount, source, &reason, due_at, now))
            .await?;
        debug!("Scheduled {} points for {} at {}", job.amount, job.account_id, job.due_at);
        Ok(job)
    }

    /// Apply every credit due at `now`, each in its own transaction.
    ///
    /// A failing row is logged and left unprocessed for the next sweep.
    pub async fn process_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<AppliedCredit>> {
        let due = self
            .db
            .execute(move |conn| conn.due_pending_credits(now, limit))
            .await?;

        let mut applied = Vec::with_capacity(due.len());
        for job in due {
            let id = job.id;
            match self.db.transact(move |conn| process_one_in(conn, id, now)).await {
                Ok(Some(credit)) => applied.push(credit),
                Ok(None) => debug!("Pending credit {} already handled", id),
                Err(e) => warn!("Pending credit {} for {} failed: {}", id, job.account_id, e),
            }
        }

        if !applied.is_empty() {
            info!("Applied {} pending credits", applied.len());
        }
        Ok(applied)
    }

    pub async fn list(&self, account_id: &str) -> Result<Vec<PendingCredit>> {
        let account_id = account_id.to_string();
        self.db
            .execute(move |conn| conn.pending_credits_for(&account_id))
            .await
    }
}
