//! Achievement catalog and evaluator.
//!
//! A definition compares the value of one progress field against a target.
//! Unlocking is a conditional write on `completed = 0` in the same
//! transaction as the reward credit, so repeated checks pay once.

pub mod progress;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::db::LoyaltyDb;
use crate::error::{LoyaltyError, Result};
use crate::ledger::{self, PointSource};
use crate::status::TierTable;
use crate::store::LoyaltyStore;

pub use progress::{ProgressField, ProgressRegistry, ProgressSource};

/// How the progress value is read against the target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionKind {
    /// Number of events so far
    Count,
    /// Current value of a quantity that can go down again
    Threshold,
    /// Highest level ever reached
    Milestone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AchievementCategory {
    Purchase,
    Referral,
    Points,
    Status,
    Social,
    Tasks,
}

impl AchievementCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AchievementCategory::Purchase => "purchase",
            AchievementCategory::Referral => "referral",
            AchievementCategory::Points => "points",
            AchievementCategory::Status => "status",
            AchievementCategory::Social => "social",
            AchievementCategory::Tasks => "tasks",
        }
    }
}

impl std::fmt::Display for AchievementCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AchievementCategory {
    type Err = LoyaltyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "purchase" => Ok(AchievementCategory::Purchase),
            "referral" => Ok(AchievementCategory::Referral),
            "points" => Ok(AchievementCategory::Points),
            "status" => Ok(AchievementCategory::Status),
            "social" => Ok(AchievementCategory::Social),
            "tasks" => Ok(AchievementCategory::Tasks),
            _ => Err(LoyaltyError::not_found("achievement category", s)),
        }
    }
}

/// Static achievement definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AchievementDefinition {
    pub code: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub kind: ConditionKind,
    pub field: ProgressField,
    pub target: i64,
    pub reward: i64,
    pub category: AchievementCategory,
    pub active: bool,
}

impl AchievementDefinition {
    #[allow(clippy::too_many_arguments)]
    const fn new(
        code: &'static str,
        name: &'static str,
        description: &'static str,
        kind: ConditionKind,
        field: ProgressField,
        target: i64,
        reward: i64,
        category: AchievementCategory,
    ) -> Self {
        Self {
            code,
            name,
            description,
            kind,
            field,
            target,
            reward,
            category,
            active: true,
        }
    }

    /// Progress to record given the freshly computed value and the cached row.
    /// Milestones never move backwards, the other kinds follow the source.
    pub fn effective_progress(&self, computed: i64, cached: Option<i64>) -> i64 {
        match self.kind {
            ConditionKind::Milestone => cached.map_or(computed, |seen| seen.max(computed)),
            ConditionKind::Count | ConditionKind::Threshold => computed,
        }
    }

    pub fn is_met(&self, progress: i64) -> bool {
        progress >= self.target
    }
}

/// Built-in achievement catalog
pub fn catalog() -> Vec<AchievementDefinition> {
    use AchievementCategory as Cat;
    use ConditionKind::*;
    use ProgressField as F;

    vec![
        // Purchases
        AchievementDefinition::new("first_purchase", "First Purchase", "Confirm your first purchase", Count, F::PurchaseCount, 1, 50, Cat::Purchase),
        AchievementDefinition::new("regular_customer", "Regular", "Confirm 10 purchases", Count, F::PurchaseCount, 10, 300, Cat::Purchase),

        // Referrals
        AchievementDefinition::new("first_referral", "Ambassador", "Bring your first friend", Count, F::ReferralCount, 1, 100, Cat::Referral),
        AchievementDefinition::new("five_referrals", "Crowd Puller", "Bring 5 friends", Count, F::ReferralCount, 5, 500, Cat::Referral),

        // Balance
        AchievementDefinition::new("points_1000", "Saver", "Hold 1000 points at once", Threshold, F::PointBalance, 1_000, 100, Cat::Points),

        // Status
        AchievementDefinition::new("silver_status", "Silver", "Reach the second tier", Milestone, F::TierRank, 1, 50, Cat::Status),
        AchievementDefinition::new("gold_status", "Gold", "Reach the third tier", Milestone, F::TierRank, 2, 150, Cat::Status),
        AchievementDefinition::new("platinum_status", "Platinum", "Reach the fourth tier", Milestone, F::TierRank, 3, 300, Cat::Status),

        // Social
        AchievementDefinition::new("connected", "Connected", "Link a social network", Count, F::SocialLinks, 1, 30, Cat::Social),

        // Tasks
        AchievementDefinition::new("week_streak", "Week Warrior", "Keep a 7-day streak", Milestone, F::LongestStreak, 7, 100, Cat::Tasks),
        AchievementDefinition::new("task_master", "Task Master", "Complete 50 daily tasks", Count, F::TasksCompleted, 50, 200, Cat::Tasks),
    ]
}

/// Cached progress row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AchievementProgress {
    pub account_id: String,
    pub achievement: String,
    pub progress: i64,
    pub completed: bool,
    pub unlocked_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlockedAchievement {
    pub account_id: String,
    pub achievement: String,
    pub reward: i64,
    pub progress: i64,
    /// Balance right after the reward credit
    pub balance: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub evaluated: usize,
    pub unlocked: Vec<UnlockedAchievement>,
}

fn evaluate_pass(
    store: &dyn LoyaltyStore,
    definitions: &[AchievementDefinition],
    registry: &ProgressRegistry,
    account_id: &str,
    categories: &[AchievementCategory],
    now: DateTime<Utc>,
    outcome: &mut CheckOutcome,
) -> Result<usize> {
    let mut unlocked = 0;

    for def in definitions {
        if !def.active || (!categories.is_empty() && !categories.contains(&def.category)) {
            continue;
        }
        let cached = store.load_achievement_progress(account_id, def.code)?;
        if cached.as_ref().is_some_and(|row| row.completed) {
            continue;
        }

        outcome.evaluated += 1;
        let computed = registry.compute(def.field, store, account_id)?;
        let progress = def.effective_progress(computed, cached.map(|row| row.progress));

        if !def.is_met(progress) {
            store.upsert_achievement_progress(account_id, def.code, progress, now)?;
            continue;
        }
        if !store.complete_achievement(account_id, def.code, progress, now)? {
            continue;
        }

        let balance = if def.reward > 0 {
            ledger::credit_in(
                store,
                account_id,
                def.reward,
                PointSource::Achievement,
                &format!("achievement:{}", def.code),
                now,
            )?
            .balance
        } else {
            store
                .load_account(account_id)?
                .map(|account| account.balance)
                .unwrap_or_default()
        };

        debug!("{} unlocked {} at progress {}", account_id, def.code, progress);
        unlocked += 1;
        outcome.unlocked.push(UnlockedAchievement {
            account_id: account_id.to_string(),
            achievement: def.code.to_string(),
            reward: def.reward,
            progress,
            balance,
        });
    }

    Ok(unlocked)
}

/// Evaluate definitions for one account.
///
/// An empty category list means all categories. Rewards move the balance,
/// so after any unlock every category is evaluated again until a pass
/// unlocks nothing. Completed rows are skipped, which bounds the passes by
/// the catalog size.
pub(crate) fn check_in(
    store: &dyn LoyaltyStore,
    definitions: &[AchievementDefinition],
    registry: &ProgressRegistry,
    account_id: &str,
    categories: &[AchievementCategory],
    now: DateTime<Utc>,
) -> Result<CheckOutcome> {
    if store.load_account(account_id)?.is_none() {
        return Err(LoyaltyError::not_found("account", account_id));
    }

    let mut outcome = CheckOutcome::default();
    let mut unlocked = evaluate_pass(store, definitions, registry, account_id, categories, now, &mut outcome)?;
    while unlocked > 0 {
        unlocked = evaluate_pass(store, definitions, registry, account_id, &[], now, &mut outcome)?;
    }
    Ok(outcome)
}

/// Checks achievement conditions and pays rewards
pub struct AchievementEvaluator {
    db: Arc<LoyaltyDb>,
    definitions: Arc<Vec<AchievementDefinition>>,
    registry: Arc<ProgressRegistry>,
}

impl AchievementEvaluator {
    /// Built-in catalog with the default progress sources
    pub fn new(db: Arc<LoyaltyDb>, tiers: TierTable) -> Self {
        Self::with_catalog(db, catalog(), ProgressRegistry::with_defaults(tiers))
    }

    pub fn with_catalog(
        db: Arc<LoyaltyDb>,
        definitions: Vec<AchievementDefinition>,
        registry: ProgressRegistry,
    ) -> Self {
        Self {
            db,
            definitions: Arc::new(definitions),
            registry: Arc::new(registry),
        }
    }

    pub fn definitions(&self) -> &[AchievementDefinition] {
        &self.definitions
    }

    /// Check one category, or every category when `category` is None
    pub async fn check_and_unlock(
        &self,
        account_id: &str,
        category: Option<AchievementCategory>,
        now: DateTime<Utc>,
    ) -> Result<CheckOutcome> {
        let categories: Vec<_> = category.into_iter().collect();
        self.check_categories(account_id, &categories, now).await
    }

    /// Check several categories in one transaction (empty means all)
    pub async fn check_categories(
        &self,
        account_id: &str,
        categories: &[AchievementCategory],
        now: DateTime<Utc>,
    ) -> Result<CheckOutcome> {
        let definitions = Arc::clone(&self.definitions);
        let registry = Arc::clone(&self.registry);
        let account_id = account_id.to_string();
        let categories = categories.to_vec();

        let outcome = self
            .db
            .transact(move |conn| check_in(conn, &definitions, &registry, &account_id, &categories, now))
            .await?;

        for unlock in &outcome.unlocked {
            info!(
                "Achievement {} unlocked for {} (+{})",
                unlock.achievement, unlock.account_id, unlock.reward
            );
        }
        Ok(outcome)
    }

    /// Cached progress rows for the account
    pub async fn progress(&self, account_id: &str) -> Result<Vec<AchievementProgress>> {
        let account_id = account_id.to_string();
        self.db
            .execute(move |conn| {
                if conn.load_account(&account_id)?.is_none() {
                    return Err(LoyaltyError::not_found("account", account_id.as_str()));
                }
                conn.list_achievement_progress(&account_id)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoyaltyConfig;

    async fn evaluator_with(account: &str, balance: i64) -> (Arc<LoyaltyDb>, AchievementEvaluator) {
        let db = Arc::new(LoyaltyDb::open_in_memory().await.unwrap());
        let account = account.to_string();
        db.transact(move |conn| {
            ledger::register_in(conn, &account, "Bronze", Utc::now())?;
            if balance > 0 {
                ledger::credit_in(conn, &account, balance, PointSource::Manual, "seed", Utc::now())?;
            }
            Ok(())
        })
        .await
        .unwrap();
        let tiers = LoyaltyConfig::default().tier_table().unwrap();
        let evaluator = AchievementEvaluator::new(Arc::clone(&db), tiers);
        (db, evaluator)
    }

    #[test]
    fn test_catalog_codes_are_unique() {
        let defs = catalog();
        let mut codes: Vec<_> = defs.iter().map(|d| d.code).collect();
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), defs.len());
        assert!(defs.iter().all(|d| d.target > 0 && d.reward >= 0));
    }

    #[tokio::test]
    async fn test_unlock_pays_once() {
        let (_db, evaluator) = evaluator_with("anna", 1000).await;

        let first = evaluator
            .check_and_unlock("anna", Some(AchievementCategory::Points), Utc::now())
            .await
            .unwrap();
        // The reward pushes the balance into Silver, which unlocks on the follow-up pass
        let codes: Vec<_> = first.unlocked.iter().map(|u| u.achievement.as_str()).collect();
        assert_eq!(codes, vec!["points_1000", "silver_status"]);
        assert_eq!(first.unlocked[0].balance, 1100);
        assert_eq!(first.unlocked[1].balance, 1150);

        let second = evaluator
            .check_and_unlock("anna", Some(AchievementCategory::Points), Utc::now())
            .await
            .unwrap();
        assert!(second.unlocked.is_empty());
        assert_eq!(second.evaluated, 0);
    }

    #[tokio::test]
    async fn test_unmet_condition_caches_progress() {
        let (_db, evaluator) = evaluator_with("anna", 250).await;
        let outcome = evaluator
            .check_and_unlock("anna", Some(AchievementCategory::Points), Utc::now())
            .await
            .unwrap();
        assert!(outcome.unlocked.is_empty());

        let rows = evaluator.progress("anna").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].achievement, "points_1000");
        assert_eq!(rows[0].progress, 250);
        assert!(!rows[0].completed);
    }

    #[tokio::test]
    async fn test_rewards_cascade_into_other_categories() {
        // Gold reward lifts the balance over the 1000 point threshold
        let (_db, evaluator) = evaluator_with("anna", 1500).await;
        let outcome = evaluator
            .check_and_unlock("anna", Some(AchievementCategory::Status), Utc::now())
            .await
            .unwrap();
        let codes: Vec<_> = outcome.unlocked.iter().map(|u| u.achievement.as_str()).collect();
        assert!(codes.contains(&"silver_status"));
        assert!(codes.contains(&"gold_status"));
        assert!(codes.contains(&"points_1000"));
        assert!(!codes.contains(&"platinum_status"));
    }

    #[test]
    fn test_only_milestones_keep_their_best_value() {
        let defs = catalog();
        let gold = defs.iter().find(|d| d.code == "gold_status").unwrap();
        let saver = defs.iter().find(|d| d.code == "points_1000").unwrap();

        assert_eq!(gold.effective_progress(0, Some(1)), 1);
        assert_eq!(gold.effective_progress(2, Some(1)), 2);
        assert_eq!(gold.effective_progress(1, None), 1);
        assert_eq!(saver.effective_progress(250, Some(650)), 250);
    }

    #[tokio::test]
    async fn test_milestone_progress_survives_a_downgrade() {
        let (db, evaluator) = evaluator_with("anna", 600).await;
        let outcome = evaluator
            .check_and_unlock("anna", Some(AchievementCategory::Status), Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome.unlocked[0].achievement, "silver_status");

        db.transact(|conn| {
            ledger::debit_in(conn, "anna", 400, PointSource::Manual, "redeem", Utc::now())?;
            Ok(())
        })
        .await
        .unwrap();
        evaluator.check_and_unlock("anna", None, Utc::now()).await.unwrap();

        let rows = evaluator.progress("anna").await.unwrap();
        let progress_of = |code: &str| rows.iter().find(|r| r.achievement == code).unwrap().progress;
        // Back in Bronze, but the best tier reached stays recorded
        assert_eq!(progress_of("gold_status"), 1);
        assert_eq!(progress_of("points_1000"), 250);
    }

    #[tokio::test]
    async fn test_inactive_definitions_are_skipped() {
        let db = Arc::new(LoyaltyDb::open_in_memory().await.unwrap());
        db.transact(|conn| {
            ledger::register_in(conn, "anna", "Bronze", Utc::now())?;
            ledger::credit_in(conn, "anna", 5000, PointSource::Manual, "seed", Utc::now())?;
            Ok(())
        })
        .await
        .unwrap();

        let mut defs = catalog();
        for def in &mut defs {
            def.active = def.code != "points_1000";
        }
        let tiers = LoyaltyConfig::default().tier_table().unwrap();
        let evaluator = AchievementEvaluator::with_catalog(db, defs, ProgressRegistry::with_defaults(tiers));
        let outcome = evaluator
            .check_and_unlock("anna", Some(AchievementCategory::Points), Utc::now())
            .await
            .unwrap();
        assert!(outcome.unlocked.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_account() {
        let (_db, evaluator) = evaluator_with("anna", 0).await;
        assert!(matches!(
            evaluator.check_and_unlock("ghost", None, Utc::now()).await,
            Err(LoyaltyError::NotFound { entity: "account", .. })
        ));
    }

    #[test]
    fn test_category_parse() {
        assert_eq!("Referral".parse::<AchievementCategory>().unwrap(), AchievementCategory::Referral);
        assert!("karma".parse::<AchievementCategory>().is_err());
    }
}
