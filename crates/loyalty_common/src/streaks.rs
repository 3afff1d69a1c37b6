//! Activity streaks and milestone bonuses.
//!
//! A day counts once; consecutive days extend the streak, any gap resets it
//! to 1. Milestone bonuses are paid the first time `current_streak` equals a
//! configured length and never again for that account.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::config::StreakConfig;
use crate::db::LoyaltyDb;
use crate::error::{LoyaltyError, Result};
use crate::ledger::{self, PointSource};
use crate::store::LoyaltyStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreakRecord {
    pub account_id: String,
    pub current_streak: u32,
    pub longest_streak: u32,
    pub last_active_date: Option<NaiveDate>,
    pub total_active_days: u32,
}

impl StreakRecord {
    pub fn empty(account_id: &str) -> Self {
        Self {
            account_id: account_id.to_string(),
            current_streak: 0,
            longest_streak: 0,
            last_active_date: None,
            total_active_days: 0,
        }
    }

    /// Streak as seen on `today`: still alive if the last active day was today or yesterday
    pub fn effective_streak(&self, today: NaiveDate) -> u32 {
        match self.last_active_date {
            Some(last) if last == today || last.succ_opt() == Some(today) => self.current_streak,
            _ => 0,
        }
    }

    /// Record for the account after `date` became active, or None if nothing changes.
    ///
    /// Dates at or before the last active day are ignored.
    pub fn advance(&self, date: NaiveDate) -> Option<StreakRecord> {
        let current = match self.last_active_date {
            Some(last) if date <= last => return None,
            Some(last) if last.succ_opt() == Some(date) => self.current_streak + 1,
            _ => 1,
        };
        Some(StreakRecord {
            account_id: self.account_id.clone(),
            current_streak: current,
            longest_streak: self.longest_streak.max(current),
            last_active_date: Some(date),
            total_active_days: self.total_active_days + 1,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MilestoneAward {
    pub length: u32,
    pub bonus: i64,
    pub balance: i64,
}

/// Committed change to a streak
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreakUpdate {
    pub account_id: String,
    pub date: NaiveDate,
    pub previous: u32,
    pub current: u32,
    pub longest: u32,
    pub milestone: Option<MilestoneAward>,
}

impl StreakUpdate {
    pub fn was_reset(&self) -> bool {
        self.current == 1 && self.previous != 0
    }
}

/// Mark `date` active. Must run inside the caller's transaction.
pub(crate) fn update_in(
    store: &dyn LoyaltyStore,
    config: &StreakConfig,
    account_id: &str,
    date: NaiveDate,
    now: DateTime<Utc>,
) -> Result<Option<StreakUpdate>> {
    let record = store
        .load_streak(account_id)?
        .unwrap_or_else(|| StreakRecord::empty(account_id));

    let Some(next) = record.advance(date) else {
        return Ok(None);
    };
    store.save_streak(&next)?;

    let mut milestone = None;
    if let Some(reached) = config.milestone_for(next.current_streak) {
        if store.record_streak_milestone(account_id, reached.length, reached.bonus, now)? && reached.bonus > 0 {
            let change = ledger::credit_in(
                store,
                account_id,
                reached.bonus,
                PointSource::StreakBonus,
                &format!("streak_milestone:{}", reached.length),
                now,
            )?;
            milestone = Some(MilestoneAward {
                length: reached.length,
                bonus: reached.bonus,
                balance: change.balance,
            });
        }
    }

    Ok(Some(StreakUpdate {
        account_id: account_id.to_string(),
        date,
        previous: record.current_streak,
        current: next.current_streak,
        longest: next.longest_streak,
        milestone,
    }))
}

pub(crate) fn load_in(store: &dyn LoyaltyStore, account_id: &str) -> Result<StreakRecord> {
    if store.load_account(account_id)?.is_none() {
        return Err(LoyaltyError::not_found("account", account_id));
    }
    Ok(store
        .load_streak(account_id)?
        .unwrap_or_else(|| StreakRecord::empty(account_id)))
}

/// Streak tracking over the shared database
pub struct StreakEngine {
    db: Arc<LoyaltyDb>,
    config: StreakConfig,
}

impl StreakEngine {
    pub fn new(db: Arc<LoyaltyDb>, config: StreakConfig) -> Self {
        Self { db, config }
    }

    pub async fn get_streak(&self, account_id: &str) -> Result<StreakRecord> {
        let account_id = account_id.to_string();
        self.db.execute(move |conn| load_in(conn, &account_id)).await
    }

    /// Mark a day active outside the daily task flow (admin corrections)
    pub async fn record_activity(
        &self,
        account_id: &str,
        date: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<Option<StreakUpdate>> {
        let config = self.config.clone();
        let account_id = account_id.to_string();
        let update = self
            .db
            .transact(move |conn| {
                if conn.load_account(&account_id)?.is_none() {
                    return Err(LoyaltyError::not_found("account", account_id.as_str()));
                }
                update_in(conn, &config, &account_id, date, now)
            })
            .await?;

        if let Some(update) = &update {
            if let Some(milestone) = &update.milestone {
                info!(
                    "{} reached a {}-day streak (+{})",
                    update.account_id, milestone.length, milestone.bonus
                );
            }
        }
        Ok(update)
    }
}
