// SQLite implementation of the loyalty store
//
// Implemented on `Connection` so that a `Transaction` (which derefs to it)
// can be handed to component logic as `&dyn LoyaltyStore`.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::LoyaltyStore;
use crate::achievements::AchievementProgress;
use crate::daily_tasks::DailyTaskInstance;
use crate::error::Result;
use crate::ledger::{Account, LedgerEntry, PointSource};
use crate::pending::PendingCredit;
use crate::purchases::Purchase;
use crate::referral::ReferralCode;
use crate::social::SocialNetwork;
use crate::streaks::StreakRecord;

const REFERRAL_COLUMNS: &str =
    "code, owner_id, created_at, activated_by, activated_at, bonus_amount, bonus_paid";

const TASK_COLUMNS: &str =
    "id, account_id, task_code, task_date, progress, completed, completed_at, reward_earned";

const PENDING_COLUMNS: &str =
    "id, account_id, amount, source, reason, due_at, created_at, processed, processed_at";

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<Account> {
    Ok(Account {
        id: row.get(0)?,
        balance: row.get(1)?,
        tier: row.get(2)?,
        created_at: row.get(3)?,
    })
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<LedgerEntry> {
    Ok(LedgerEntry {
        id: row.get(0)?,
        account_id: row.get(1)?,
        delta: row.get(2)?,
        source: row.get(3)?,
        reason: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn referral_from_row(row: &Row<'_>) -> rusqlite::Result<ReferralCode> {
    Ok(ReferralCode {
        code: row.get(0)?,
        owner_id: row.get(1)?,
        created_at: row.get(2)?,
        activated_by: row.get(3)?,
        activated_at: row.get(4)?,
        bonus_amount: row.get(5)?,
        bonus_paid: row.get(6)?,
    })
}

fn progress_from_row(row: &Row<'_>) -> rusqlite::Result<AchievementProgress> {
    Ok(AchievementProgress {
        account_id: row.get(0)?,
        achievement: row.get(1)?,
        progress: row.get(2)?,
        completed: row.get(3)?,
        unlocked_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<DailyTaskInstance> {
    Ok(DailyTaskInstance {
        id: row.get(0)?,
        account_id: row.get(1)?,
        task_code: row.get(2)?,
        task_date: row.get(3)?,
        progress: row.get(4)?,
        completed: row.get(5)?,
        completed_at: row.get(6)?,
        reward_earned: row.get(7)?,
    })
}

fn streak_from_row(row: &Row<'_>) -> rusqlite::Result<StreakRecord> {
    Ok(StreakRecord {
        account_id: row.get(0)?,
        current_streak: row.get(1)?,
        longest_streak: row.get(2)?,
        last_active_date: row.get(3)?,
        total_active_days: row.get(4)?,
    })
}

fn purchase_from_row(row: &Row<'_>) -> rusqlite::Result<Purchase> {
    Ok(Purchase {
        purchase_id: row.get(0)?,
        account_id: row.get(1)?,
        amount: row.get(2)?,
        cashback: row.get(3)?,
        pending_credit_id: row.get(4)?,
        confirmed_at: row.get(5)?,
    })
}

fn pending_from_row(row: &Row<'_>) -> rusqlite::Result<PendingCredit> {
    let due_ts: i64 = row.get(5)?;
    let due_at = DateTime::from_timestamp(due_ts, 0)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(5, due_ts))?;
    Ok(PendingCredit {
        id: row.get(0)?,
        account_id: row.get(1)?,
        amount: row.get(2)?,
        source: row.get(3)?,
        reason: row.get(4)?,
        due_at,
        created_at: row.get(6)?,
        processed: row.get(7)?,
        processed_at: row.get(8)?,
    })
}

impl LoyaltyStore for Connection {
    fn insert_account(&self, account_id: &str, tier: &str, now: DateTime<Utc>) -> Result<bool> {
        let inserted = self.execute(
            "INSERT OR IGNORE INTO accounts (id, balance, tier, created_at) VALUES (?1, 0, ?2, ?3)",
            params![account_id, tier, now],
        )?;
        Ok(inserted == 1)
    }

    fn load_account(&self, account_id: &str) -> Result<Option<Account>> {
        let account = self
            .query_row(
                "SELECT id, balance, tier, created_at FROM accounts WHERE id = ?1",
                params![account_id],
                account_from_row,
            )
            .optional()?;
        Ok(account)
    }

    fn update_cached_balance(&self, account_id: &str, balance: i64) -> Result<()> {
        self.execute(
            "UPDATE accounts SET balance = ?2 WHERE id = ?1",
            params![account_id, balance],
        )?;
        Ok(())
    }

    fn update_cached_tier(&self, account_id: &str, tier: &str) -> Result<()> {
        self.execute(
            "UPDATE accounts SET tier = ?2 WHERE id = ?1",
            params![account_id, tier],
        )?;
        Ok(())
    }

    fn append_entry(
        &self,
        account_id: &str,
        delta: i64,
        source: PointSource,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        self.execute(
            "INSERT INTO ledger_entries (account_id, delta, source, reason, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![account_id, delta, source, reason, now],
        )?;
        Ok(self.last_insert_rowid())
    }

    fn sum_entries(&self, account_id: &str) -> Result<i64> {
        let sum = self.query_row(
            "SELECT COALESCE(SUM(delta), 0) FROM ledger_entries WHERE account_id = ?1",
            params![account_id],
            |row| row.get(0),
        )?;
        Ok(sum)
    }

    fn recent_entries(&self, account_id: &str, limit: usize) -> Result<Vec<LedgerEntry>> {
        let mut stmt = self.prepare(
            "SELECT id, account_id, delta, source, reason, created_at
             FROM ledger_entries WHERE account_id = ?1
             ORDER BY id DESC LIMIT ?2",
        )?;
        let entries = stmt
            .query_map(params![account_id, limit], entry_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    fn insert_referral_code(&self, code: &str, owner_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let inserted = self.execute(
            "INSERT OR IGNORE INTO referral_codes (code, owner_id, created_at) VALUES (?1, ?2, ?3)",
            params![code, owner_id, now],
        )?;
        Ok(inserted == 1)
    }

    fn find_referral_code(&self, code: &str) -> Result<Option<ReferralCode>> {
        let found = self
            .query_row(
                &format!("SELECT {} FROM referral_codes WHERE code = ?1", REFERRAL_COLUMNS),
                params![code],
                referral_from_row,
            )
            .optional()?;
        Ok(found)
    }

    fn open_referral_code(&self, owner_id: &str) -> Result<Option<ReferralCode>> {
        let found = self
            .query_row(
                &format!(
                    "SELECT {} FROM referral_codes
                     WHERE owner_id = ?1 AND activated_by IS NULL
                     ORDER BY created_at DESC, rowid DESC LIMIT 1",
                    REFERRAL_COLUMNS
                ),
                params![owner_id],
                referral_from_row,
            )
            .optional()?;
        Ok(found)
    }

    fn referral_codes_owned_by(&self, owner_id: &str) -> Result<Vec<ReferralCode>> {
        let mut stmt = self.prepare(&format!(
            "SELECT {} FROM referral_codes WHERE owner_id = ?1 ORDER BY created_at, rowid",
            REFERRAL_COLUMNS
        ))?;
        let codes = stmt
            .query_map(params![owner_id], referral_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(codes)
    }

    fn referral_activated_by(&self, account_id: &str) -> Result<Option<ReferralCode>> {
        let found = self
            .query_row(
                &format!("SELECT {} FROM referral_codes WHERE activated_by = ?1", REFERRAL_COLUMNS),
                params![account_id],
                referral_from_row,
            )
            .optional()?;
        Ok(found)
    }

    fn mark_referral_activated(
        &self,
        code: &str,
        activated_by: &str,
        bonus_amount: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let updated = self.execute(
            "UPDATE referral_codes
             SET activated_by = ?2, activated_at = ?3, bonus_amount = ?4, bonus_paid = 1
             WHERE code = ?1 AND activated_by IS NULL",
            params![code, activated_by, now, bonus_amount],
        )?;
        Ok(updated == 1)
    }

    fn count_referral_activations(&self, owner_id: &str) -> Result<i64> {
        let count = self.query_row(
            "SELECT COUNT(*) FROM referral_codes WHERE owner_id = ?1 AND activated_by IS NOT NULL",
            params![owner_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn load_achievement_progress(
        &self,
        account_id: &str,
        achievement: &str,
    ) -> Result<Option<AchievementProgress>> {
        let found = self
            .query_row(
                "SELECT account_id, achievement, progress, completed, unlocked_at, updated_at
                 FROM achievement_progress WHERE account_id = ?1 AND achievement = ?2",
                params![account_id, achievement],
                progress_from_row,
            )
            .optional()?;
        Ok(found)
    }

    fn list_achievement_progress(&self, account_id: &str) -> Result<Vec<AchievementProgress>> {
        let mut stmt = self.prepare(
            "SELECT account_id, achievement, progress, completed, unlocked_at, updated_at
             FROM achievement_progress WHERE account_id = ?1 ORDER BY achievement",
        )?;
        let rows = stmt
            .query_map(params![account_id], progress_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn upsert_achievement_progress(
        &self,
        account_id: &str,
        achievement: &str,
        progress: i64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.execute(
            "INSERT INTO achievement_progress (account_id, achievement, progress, completed, updated_at)
             VALUES (?1, ?2, ?3, 0, ?4)
             ON CONFLICT (account_id, achievement) DO UPDATE
             SET progress = excluded.progress, updated_at = excluded.updated_at
             WHERE achievement_progress.completed = 0",
            params![account_id, achievement, progress, now],
        )?;
        Ok(())
    }

    fn complete_achievement(
        &self,
        account_id: &str,
        achievement: &str,
        progress: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = self.execute(
            "INSERT INTO achievement_progress
                 (account_id, achievement, progress, completed, unlocked_at, updated_at)
             VALUES (?1, ?2, ?3, 1, ?4, ?4)
             ON CONFLICT (account_id, achievement) DO UPDATE
             SET progress = excluded.progress, completed = 1,
                 unlocked_at = excluded.unlocked_at, updated_at = excluded.updated_at
             WHERE achievement_progress.completed = 0",
            params![account_id, achievement, progress, now],
        )?;
        Ok(changed == 1)
    }

    fn count_task_instances(&self, account_id: &str, date: NaiveDate) -> Result<i64> {
        let count = self.query_row(
            "SELECT COUNT(*) FROM daily_task_instances WHERE account_id = ?1 AND task_date = ?2",
            params![account_id, date],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn insert_task_instance(&self, account_id: &str, task_code: &str, date: NaiveDate) -> Result<()> {
        self.execute(
            "INSERT INTO daily_task_instances (account_id, task_code, task_date) VALUES (?1, ?2, ?3)",
            params![account_id, task_code, date],
        )?;
        Ok(())
    }

    fn list_task_instances(&self, account_id: &str, date: NaiveDate) -> Result<Vec<DailyTaskInstance>> {
        let mut stmt = self.prepare(&format!(
            "SELECT {} FROM daily_task_instances
             WHERE account_id = ?1 AND task_date = ?2 ORDER BY id",
            TASK_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![account_id, date], task_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn find_task_instance(
        &self,
        account_id: &str,
        task_code: &str,
        date: NaiveDate,
    ) -> Result<Option<DailyTaskInstance>> {
        let found = self
            .query_row(
                &format!(
                    "SELECT {} FROM daily_task_instances
                     WHERE account_id = ?1 AND task_code = ?2 AND task_date = ?3",
                    TASK_COLUMNS
                ),
                params![account_id, task_code, date],
                task_from_row,
            )
            .optional()?;
        Ok(found)
    }

    fn update_task_progress(&self, instance_id: i64, progress: i64) -> Result<()> {
        self.execute(
            "UPDATE daily_task_instances SET progress = ?2 WHERE id = ?1 AND completed = 0",
            params![instance_id, progress],
        )?;
        Ok(())
    }

    fn complete_task_instance(
        &self,
        instance_id: i64,
        progress: i64,
        reward: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let changed = self.execute(
            "UPDATE daily_task_instances
             SET progress = ?2, completed = 1, completed_at = ?3, reward_earned = ?4
             WHERE id = ?1 AND completed = 0",
            params![instance_id, progress, now, reward],
        )?;
        Ok(changed == 1)
    }

    fn count_completed_tasks(&self, account_id: &str) -> Result<i64> {
        let count = self.query_row(
            "SELECT COUNT(*) FROM daily_task_instances WHERE account_id = ?1 AND completed = 1",
            params![account_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn completed_task_codes(&self, account_id: &str, date: NaiveDate) -> Result<Vec<String>> {
        let mut stmt = self.prepare(
            "SELECT task_code FROM daily_task_instances
             WHERE account_id = ?1 AND task_date = ?2 AND completed = 1 ORDER BY id",
        )?;
        let codes = stmt
            .query_map(params![account_id, date], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(codes)
    }

    fn load_streak(&self, account_id: &str) -> Result<Option<StreakRecord>> {
        let found = self
            .query_row(
                "SELECT account_id, current_streak, longest_streak, last_active_date, total_active_days
                 FROM streaks WHERE account_id = ?1",
                params![account_id],
                streak_from_row,
            )
            .optional()?;
        Ok(found)
    }

    fn save_streak(&self, record: &StreakRecord) -> Result<()> {
        self.execute(
            "INSERT INTO streaks
                 (account_id, current_streak, longest_streak, last_active_date, total_active_days)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (account_id) DO UPDATE
             SET current_streak = excluded.current_streak,
                 longest_streak = excluded.longest_streak,
                 last_active_date = excluded.last_active_date,
                 total_active_days = excluded.total_active_days",
            params![
                record.account_id,
                record.current_streak,
                record.longest_streak,
                record.last_active_date,
                record.total_active_days
            ],
        )?;
        Ok(())
    }

    fn record_streak_milestone(
        &self,
        account_id: &str,
        length: u32,
        bonus: i64,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let inserted = self.execute(
            "INSERT OR IGNORE INTO streak_milestones (account_id, length, bonus, awarded_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![account_id, length, bonus, now],
        )?;
        Ok(inserted == 1)
    }

    fn insert_social_link(&self, account_id: &str, network: SocialNetwork, now: DateTime<Utc>) -> Result<bool> {
        let inserted = self.execute(
            "INSERT OR IGNORE INTO social_links (account_id, network, linked_at) VALUES (?1, ?2, ?3)",
            params![account_id, network, now],
        )?;
        Ok(inserted == 1)
    }

    fn linked_networks(&self, account_id: &str) -> Result<Vec<SocialNetwork>> {
        let mut stmt = self.prepare(
            "SELECT network FROM social_links WHERE account_id = ?1 ORDER BY network",
        )?;
        let networks = stmt
            .query_map(params![account_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<SocialNetwork>>>()?;
        Ok(networks)
    }

    fn find_purchase(&self, purchase_id: &str) -> Result<Option<Purchase>> {
        let found = self
            .query_row(
                "SELECT purchase_id, account_id, amount, cashback, pending_credit_id, confirmed_at
                 FROM purchases WHERE purchase_id = ?1",
                params![purchase_id],
                purchase_from_row,
            )
            .optional()?;
        Ok(found)
    }

    fn insert_purchase(&self, purchase: &Purchase) -> Result<()> {
        self.execute(
            "INSERT INTO purchases
                 (purchase_id, account_id, amount, cashback, pending_credit_id, confirmed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                purchase.purchase_id,
                purchase.account_id,
                purchase.amount,
                purchase.cashback,
                purchase.pending_credit_id,
                purchase.confirmed_at
            ],
        )?;
        Ok(())
    }

    fn count_purchases(&self, account_id: &str) -> Result<i64> {
        let count = self.query_row(
            "SELECT COUNT(*) FROM purchases WHERE account_id = ?1",
            params![account_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    fn insert_pending_credit(
        &self,
        account_id: &str,
        amount: i64,
        source: PointSource,
        reason: &str,
        due_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        self.execute(
            "INSERT INTO pending_credits (account_id, amount, source, reason, due_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![account_id, amount, source, reason, due_at.timestamp(), now],
        )?;
        Ok(self.last_insert_rowid())
    }

    fn due_pending_credits(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<PendingCredit>> {
        let mut stmt = self.prepare(&format!(
            "SELECT {} FROM pending_credits
             WHERE processed = 0 AND due_at <= ?1
             ORDER BY due_at, id LIMIT ?2",
            PENDING_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![now.timestamp(), limit], pending_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn load_pending_credit(&self, id: i64) -> Result<Option<PendingCredit>> {
        let found = self
            .query_row(
                &format!("SELECT {} FROM pending_credits WHERE id = ?1", PENDING_COLUMNS),
                params![id],
                pending_from_row,
            )
            .optional()?;
        Ok(found)
    }

    fn mark_pending_processed(&self, id: i64, now: DateTime<Utc>) -> Result<bool> {
        let updated = self.execute(
            "UPDATE pending_credits SET processed = 1, processed_at = ?2
             WHERE id = ?1 AND processed = 0",
            params![id, now],
        )?;
        Ok(updated == 1)
    }

    fn pending_credits_for(&self, account_id: &str) -> Result<Vec<PendingCredit>> {
        let mut stmt = self.prepare(&format!(
            "SELECT {} FROM pending_credits WHERE account_id = ?1 ORDER BY due_at, id",
            PENDING_COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![account_id], pending_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}
