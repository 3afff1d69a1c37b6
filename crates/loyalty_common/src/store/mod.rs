//! Persistence interface for the loyalty engine.
//!
//! Components never touch SQL directly; they run their read-modify-write
//! logic against `&dyn LoyaltyStore` inside a transaction opened by
//! [`LoyaltyDb::transact`](crate::db::LoyaltyDb::transact). The SQLite
//! implementation lives in [`sqlite`].

pub mod sqlite;

use chrono::{DateTime, NaiveDate, Utc};

use crate::achievements::AchievementProgress;
use crate::daily_tasks::DailyTaskInstance;
use crate::error::Result;
use crate::ledger::{Account, LedgerEntry, PointSource};
use crate::pending::PendingCredit;
use crate::purchases::Purchase;
use crate::referral::ReferralCode;
use crate::social::SocialNetwork;
use crate::streaks::StreakRecord;

pub trait LoyaltyStore {
    // Accounts

    /// Returns false when the account already exists
    fn insert_account(&self, account_id: &str, tier: &str, now: DateTime<Utc>) -> Result<bool>;
    fn load_account(&self, account_id: &str) -> Result<Option<Account>>;
    fn update_cached_balance(&self, account_id: &str, balance: i64) -> Result<()>;
    fn update_cached_tier(&self, account_id: &str, tier: &str) -> Result<()>;

    // Ledger

    fn append_entry(
        &self,
        account_id: &str,
        delta: i64,
        source: PointSource,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<i64>;
    fn sum_entries(&self, account_id: &str) -> Result<i64>;
    fn recent_entries(&self, account_id: &str, limit: usize) -> Result<Vec<LedgerEntry>>;

    // Referral codes

    /// Returns false on a code collision
    fn insert_referral_code(&self, code: &str, owner_id: &str, now: DateTime<Utc>) -> Result<bool>;
    fn find_referral_code(&self, code: &str) -> Result<Option<ReferralCode>>;
    /// Newest code of the owner that nobody has activated yet
    fn open_referral_code(&self, owner_id: &str) -> Result<Option<ReferralCode>>;
    fn referral_codes_owned_by(&self, owner_id: &str) -> Result<Vec<ReferralCode>>;
    /// The code this account activated, if any
    fn referral_activated_by(&self, account_id: &str) -> Result<Option<ReferralCode>>;
    /// Conditional on the code not being activated yet; returns whether it flipped
    fn mark_referral_activated(
        &self,
        code: &str,
        activated_by: &str,
        bonus_amount: i64,
        now: DateTime<Utc>,
    ) -> Result<bool>;
    fn count_referral_activations(&self, owner_id: &str) -> Result<i64>;

    // Achievements

    fn load_achievement_progress(
        &self,
        account_id: &str,
        achievement: &str,
    ) -> Result<Option<AchievementProgress>>;
    fn list_achievement_progress(&self, account_id: &str) -> Result<Vec<AchievementProgress>>;
    /// Updates the cached progress of an incomplete achievement
    fn upsert_achievement_progress(
        &self,
        account_id: &str,
        achievement: &str,
        progress: i64,
        now: DateTime<Utc>,
    ) -> Result<()>;
    /// Conditional on not being completed yet; returns whether it flipped
    fn complete_achievement(
        &self,
        account_id: &str,
        achievement: &str,
        progress: i64,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    // Daily tasks

    fn count_task_instances(&self, account_id: &str, date: NaiveDate) -> Result<i64>;
    fn insert_task_instance(&self, account_id: &str, task_code: &str, date: NaiveDate) -> Result<()>;
    fn list_task_instances(&self, account_id: &str, date: NaiveDate) -> Result<Vec<DailyTaskInstance>>;
    fn find_task_instance(
        &self,
        account_id: &str,
        task_code: &str,
        date: NaiveDate,
    ) -> Result<Option<DailyTaskInstance>>;
    fn update_task_progress(&self, instance_id: i64, progress: i64) -> Result<()>;
    /// Conditional on not being completed yet; returns whether it flipped
    fn complete_task_instance(
        &self,
        instance_id: i64,
        progress: i64,
        reward: i64,
        now: DateTime<Utc>,
    ) -> Result<bool>;
    fn count_completed_tasks(&self, account_id: &str) -> Result<i64>;
    fn completed_task_codes(&self, account_id: &str, date: NaiveDate) -> Result<Vec<String>>;

    // Streaks

    fn load_streak(&self, account_id: &str) -> Result<Option<StreakRecord>>;
    fn save_streak(&self, record: &StreakRecord) -> Result<()>;
    /// Returns false when this milestone was already awarded
    fn record_streak_milestone(
        &self,
        account_id: &str,
        length: u32,
        bonus: i64,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    // Social links

    /// Returns false when the network was already linked
    fn insert_social_link(&self, account_id: &str, network: SocialNetwork, now: DateTime<Utc>) -> Result<bool>;
    fn linked_networks(&self, account_id: &str) -> Result<Vec<SocialNetwork>>;

    // Purchases

    fn find_purchase(&self, purchase_id: &str) -> Result<Option<Purchase>>;
    fn insert_purchase(&self, purchase: &Purchase) -> Result<()>;
    fn count_purchases(&self, account_id: &str) -> Result<i64>;

    // Pending credits

    fn insert_pending_credit(
        &self,
        account_id: &str,
        amount: i64,
        source: PointSource,
        reason: &str,
        due_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<i64>;
    /// Unprocessed credits due at or before `now`, oldest first
    fn due_pending_credits(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<PendingCredit>>;
    fn load_pending_credit(&self, id: i64) -> Result<Option<PendingCredit>>;
    /// Conditional on not being processed yet; returns whether it flipped
    fn mark_pending_processed(&self, id: i64, now: DateTime<Utc>) -> Result<bool>;
    fn pending_credits_for(&self, account_id: &str) -> Result<Vec<PendingCredit>>;
}
