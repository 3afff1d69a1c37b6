//! Engine facade: one entry point per inbound operation.
//!
//! Each operation commits its own transaction through a component, then runs
//! the follow-up (status refresh, achievement check, event dispatch) after
//! the commit. Follow-up failures are logged and never undo the operation.

use chrono::Duration;
use std::sync::Arc;
use tracing::{info, warn};

use crate::achievements::{AchievementCategory, AchievementEvaluator, AchievementProgress, CheckOutcome};
use crate::clock::{Clock, SystemClock};
use crate::config::LoyaltyConfig;
use crate::daily_tasks::{DailyTask, DailyTaskScheduler, TaskProgressUpdate};
use crate::db::{DbLocation, LoyaltyDb};
use crate::error::{LoyaltyError, Result};
use crate::events::{dispatch, LoyaltyEvent, Notifier, NullNotifier};
use crate::ledger::{LedgerChange, LedgerEntry, PointSource, PointsLedger, ReconcileReport};
use crate::pending::{AppliedCredit, PendingCredit, PendingCredits, DEFAULT_SWEEP_BATCH};
use crate::purchases::{self, PurchaseConfirmation};
use crate::referral::{CodeValidation, ReferralActivation, ReferralCode, ReferralCoordinator, ReferralStats};
use crate::social::{self, SocialNetwork};
use crate::status::{StatusEngine, StatusSnapshot, TierTable};
use crate::streaks::{StreakEngine, StreakRecord};

/// Refresh/check rounds after one operation; rewards can move the tier,
/// which can unlock more rewards
const MAX_FOLLOW_UP_ROUNDS: usize = 3;

const BALANCE_CATEGORIES: &[AchievementCategory] = &[AchievementCategory::Points, AchievementCategory::Status];

pub struct LoyaltyEngine {
    db: Arc<LoyaltyDb>,
    config: LoyaltyConfig,
    tiers: TierTable,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    ledger: PointsLedger,
    status: StatusEngine,
    referrals: ReferralCoordinator,
    achievements: AchievementEvaluator,
    tasks: DailyTaskScheduler,
    streaks: StreakEngine,
    pending: PendingCredits,
}

impl LoyaltyEngine {
    /// Engine over an open database, using the system clock and no notifier
    pub fn new(db: Arc<LoyaltyDb>, config: LoyaltyConfig) -> Result<Self> {
        config.validate()?;
        let tiers = config.tier_table()?;

        Ok(Self {
            ledger: PointsLedger::new(Arc::clone(&db)),
            status: StatusEngine::new(Arc::clone(&db), tiers.clone()),
            referrals: ReferralCoordinator::new(Arc::clone(&db), config.referral.clone()),
            achievements: AchievementEvaluator::new(Arc::clone(&db), tiers.clone()),
            tasks: DailyTaskScheduler::new(
                Arc::clone(&db),
                config.daily_tasks.clone(),
                config.streaks.clone(),
                tiers.clone(),
            ),
            streaks: StreakEngine::new(Arc::clone(&db), config.streaks.clone()),
            pending: PendingCredits::new(Arc::clone(&db)),
            clock: Arc::new(SystemClock),
            notifier: Arc::new(NullNotifier),
            tiers,
            config,
            db,
        })
    }

    /// Open the database named by the storage config and build the engine
    pub async fn open(config: LoyaltyConfig) -> Result<Self> {
        let location = DbLocation::resolve(&config.storage);
        let db = LoyaltyDb::open_with(location, &config.storage).await?;
        Self::new(Arc::new(db), config)
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Deterministic daily task selection
    pub fn with_task_seed(mut self, seed: u64) -> Self {
        self.tasks = DailyTaskScheduler::with_seed(
            Arc::clone(&self.db),
            self.config.daily_tasks.clone(),
            self.config.streaks.clone(),
            self.tiers.clone(),
            seed,
        );
        self
    }

    pub fn db(&self) -> &Arc<LoyaltyDb> {
        &self.db
    }

    pub fn config(&self) -> &LoyaltyConfig {
        &self.config
    }

    pub fn tiers(&self) -> &TierTable {
        &self.tiers
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn ledger(&self) -> &PointsLedger {
        &self.ledger
    }

    pub fn status(&self) -> &StatusEngine {
        &self.status
    }

    pub fn referrals(&self) -> &ReferralCoordinator {
        &self.referrals
    }

    pub fn achievements(&self) -> &AchievementEvaluator {
        &self.achievements
    }

    pub fn tasks(&self) -> &DailyTaskScheduler {
        &self.tasks
    }

    pub fn streaks(&self) -> &StreakEngine {
        &self.streaks
    }

    pub fn pending(&self) -> &PendingCredits {
        &self.pending
    }

    // Accounts and ledger

    /// Create the account in the base tier. Repeated calls return the current status.
    pub async fn register_account(&self, account_id: &str) -> Result<StatusSnapshot> {
        let base = self.tiers.base().name.clone();
        let created = self.ledger.register(account_id, &base, self.clock.now()).await?;
        if created {
            info!("Registered account {} in {}", account_id, base);
            self.emit(vec![LoyaltyEvent::AccountRegistered {
                account_id: account_id.to_string(),
                tier: base,
            }]);
        }
        self.status.get_status(account_id).await
    }

    pub async fn credit(
        &self,
        account_id: &str,
        amount: i64,
        source: PointSource,
        reason: &str,
    ) -> Result<LedgerChange> {
        let change = self
            .ledger
            .credit(account_id, amount, source, reason, self.clock.now())
            .await?;
        self.follow_up(account_id, vec![credited(&change)], BALANCE_CATEGORIES)
            .await;
        Ok(change)
    }

    pub async fn debit(
        &self,
        account_id: &str,
        amount: i64,
        source: PointSource,
        reason: &str,
    ) -> Result<LedgerChange> {
        let change = self
            .ledger
            .debit(account_id, amount, source, reason, self.clock.now())
            .await?;
        let event = LoyaltyEvent::PointsDebited {
            account_id: change.account_id.clone(),
            amount,
            balance: change.balance,
            source: change.source,
            reason: change.reason.clone(),
        };
        self.follow_up(account_id, vec![event], BALANCE_CATEGORIES).await;
        Ok(change)
    }

    pub async fn balance(&self, account_id: &str) -> Result<i64> {
        self.ledger.balance(account_id).await
    }

    pub async fn reconcile(&self, account_id: &str) -> Result<ReconcileReport> {
        let report = self.ledger.reconcile(account_id).await?;
        if report.corrected {
            self.follow_up(account_id, Vec::new(), &[]).await;
        }
        Ok(report)
    }

    pub async fn history(&self, account_id: &str, limit: usize) -> Result<Vec<LedgerEntry>> {
        self.ledger.history(account_id, limit).await
    }

    pub async fn get_status(&self, account_id: &str) -> Result<StatusSnapshot> {
        self.status.get_status(account_id).await
    }

    // Referrals

    pub async fn generate_referral_code(&self, owner_id: &str) -> Result<ReferralCode> {
        self.referrals.generate_code(owner_id, self.clock.now()).await
    }

    pub async fn validate_referral_code(&self, code: &str) -> Result<CodeValidation> {
        self.referrals.validate(code).await
    }

    pub async fn activate_referral_code(&self, code: &str, referee_id: &str) -> Result<ReferralActivation> {
        let activation = self.referrals.activate(code, referee_id, self.clock.now()).await?;

        let owner_events = vec![
            LoyaltyEvent::ReferralActivated {
                code: activation.code.clone(),
                owner_id: activation.owner_id.clone(),
                referee_id: activation.referee_id.clone(),
            },
            credited(&activation.owner_credit),
        ];
        self.follow_up(
            &activation.owner_id,
            owner_events,
            &[AchievementCategory::Referral, AchievementCategory::Points, AchievementCategory::Status],
        )
        .await;
        self.follow_up(
            &activation.referee_id,
            vec![credited(&activation.referee_credit)],
            BALANCE_CATEGORIES,
        )
        .await;
        Ok(activation)
    }

    pub async fn get_referral_stats(&self, owner_id: &str) -> Result<ReferralStats> {
        self.referrals.stats(owner_id).await
    }

    // Achievements

    /// Explicit achievement check. Unlock rewards still go through the status refresh.
    pub async fn check_achievements(
        &self,
        account_id: &str,
        category: Option<AchievementCategory>,
    ) -> Result<CheckOutcome> {
        let outcome = self
            .achievements
            .check_and_unlock(account_id, category, self.clock.now())
            .await?;
        let mut events = unlock_events(&outcome);
        if !outcome.unlocked.is_empty() {
            self.refresh_into(account_id, &mut events).await;
        }
        self.emit(events);
        Ok(outcome)
    }

    pub async fn achievement_progress(&self, account_id: &str) -> Result<Vec<AchievementProgress>> {
        self.achievements.progress(account_id).await
    }

    // Daily tasks and streaks

    /// Today's task set, generated on first request
    pub async fn get_daily_tasks(&self, account_id: &str) -> Result<Vec<DailyTask>> {
        self.tasks.generate_for_date(account_id, self.clock.today()).await
    }

    pub async fn update_task_progress(
        &self,
        account_id: &str,
        task_code: &str,
        increment: i64,
    ) -> Result<TaskProgressUpdate> {
        let now = self.clock.now();
        let update = self
            .tasks
            .update_progress(account_id, task_code, increment, now.date_naive(), now)
            .await?;

        if !update.completed_now {
            return Ok(update);
        }

        let mut events = vec![LoyaltyEvent::TaskCompleted {
            account_id: account_id.to_string(),
            task_code: update.task.code.clone(),
            date: update.task.date,
            reward: update.task.reward_earned,
        }];
        if let Some(change) = &update.credit {
            events.push(credited(change));
        }
        if let Some(streak) = &update.streak {
            events.push(LoyaltyEvent::StreakExtended {
                account_id: account_id.to_string(),
                current: streak.current,
                longest: streak.longest,
            });
            if let Some(milestone) = &streak.milestone {
                events.push(LoyaltyEvent::StreakMilestoneReached {
                    account_id: account_id.to_string(),
                    length: milestone.length,
                    bonus: milestone.bonus,
                });
            }
        }
        self.follow_up(
            account_id,
            events,
            &[AchievementCategory::Tasks, AchievementCategory::Points, AchievementCategory::Status],
        )
        .await;
        Ok(update)
    }

    pub async fn get_streak(&self, account_id: &str) -> Result<StreakRecord> {
        self.streaks.get_streak(account_id).await
    }

    // Social links and purchases

    /// Link a network. Returns false if it was already linked.
    pub async fn link_social(&self, account_id: &str, network: SocialNetwork) -> Result<bool> {
        let now = self.clock.now();
        let owned = account_id.to_string();
        let linked = self
            .db
            .transact(move |conn| social::link_in(conn, &owned, network, now))
            .await?;

        if linked {
            info!("{} linked {}", account_id, network);
            let event = LoyaltyEvent::SocialLinked {
                account_id: account_id.to_string(),
                network: network.to_string(),
            };
            self.follow_up(account_id, vec![event], &[AchievementCategory::Social])
                .await;
        }
        Ok(linked)
    }

    /// Record a purchase once per external id and schedule its cashback
    pub async fn confirm_purchase(
        &self,
        account_id: &str,
        purchase_id: &str,
        amount: i64,
    ) -> Result<PurchaseConfirmation> {
        let now = self.clock.now();
        let tiers = self.tiers.clone();
        let config = self.config.purchases.clone();
        let owned_account = account_id.to_string();
        let owned_purchase = purchase_id.to_string();

        let confirmation = self
            .db
            .transact(move |conn| {
                purchases::confirm_in(conn, &tiers, &config, &owned_account, &owned_purchase, amount, now)
            })
            .await?;

        if confirmation.recorded {
            info!(
                "Purchase {} confirmed for {}: {} points cashback",
                purchase_id, account_id, confirmation.purchase.cashback
            );
            let event = LoyaltyEvent::PurchaseConfirmed {
                account_id: account_id.to_string(),
                purchase_id: purchase_id.to_string(),
                amount,
                cashback: confirmation.purchase.cashback,
            };
            self.follow_up(account_id, vec![event], &[AchievementCategory::Purchase])
                .await;
        }
        Ok(confirmation)
    }

    // Pending credits

    pub async fn schedule_credit(
        &self,
        account_id: &str,
        amount: i64,
        source: PointSource,
        reason: &str,
        delay: Duration,
    ) -> Result<PendingCredit> {
        let now = self.clock.now();
        let due_at = now
            .checked_add_signed(delay)
            .ok_or(LoyaltyError::InvalidAmount(delay.num_seconds()))?;
        self.pending
            .schedule(account_id, amount, source, reason, due_at, now)
            .await
    }

    /// Apply every due pending credit
    pub async fn process_due_credits(&self) -> Result<Vec<AppliedCredit>> {
        let applied = self
            .pending
            .process_due(self.clock.now(), DEFAULT_SWEEP_BATCH)
            .await?;

        for credit in &applied {
            let events = vec![
                LoyaltyEvent::PendingCreditApplied {
                    pending_id: credit.pending_id,
                    account_id: credit.change.account_id.clone(),
                    amount: credit.change.delta,
                },
                credited(&credit.change),
            ];
            self.follow_up(&credit.change.account_id, events, BALANCE_CATEGORIES)
                .await;
        }
        Ok(applied)
    }

    // Follow-up

    async fn follow_up(&self, account_id: &str, mut events: Vec<LoyaltyEvent>, categories: &[AchievementCategory]) {
        let mut categories = categories.to_vec();
        // Every check is followed by a refresh, so the cached tier ends up current
        for round in 1..=MAX_FOLLOW_UP_ROUNDS {
            self.refresh_into(account_id, &mut events).await;
            if categories.is_empty() || round == MAX_FOLLOW_UP_ROUNDS {
                break;
            }

            match self
                .achievements
                .check_categories(account_id, &categories, self.clock.now())
                .await
            {
                Ok(outcome) if outcome.unlocked.is_empty() => break,
                Ok(outcome) => {
                    events.extend(unlock_events(&outcome));
                    // Rewards moved the balance; only balance-driven conditions can change
                    categories = BALANCE_CATEGORIES.to_vec();
                }
                Err(e) => {
                    warn!("Achievement check for {} failed after commit: {}", account_id, e);
                    break;
                }
            }
        }
        self.emit(events);
    }

    async fn refresh_into(&self, account_id: &str, events: &mut Vec<LoyaltyEvent>) {
        match self.status.refresh_status(account_id).await {
            Ok(Some(change)) => events.push(LoyaltyEvent::TierChanged {
                account_id: change.account_id,
                old: change.old,
                new: change.new,
            }),
            Ok(None) => {}
            Err(e) => warn!("Status refresh for {} failed after commit: {}", account_id, e),
        }
    }

    fn emit(&self, events: Vec<LoyaltyEvent>) {
        if !events.is_empty() {
            dispatch(self.notifier.as_ref(), events, self.clock.now());
        }
    }
}

fn credited(change: &LedgerChange) -> LoyaltyEvent {
    LoyaltyEvent::PointsCredited {
        account_id: change.account_id.clone(),
        amount: change.delta,
        balance: change.balance,
        source: change.source,
        reason: change.reason.clone(),
    }
}

fn unlock_events(outcome: &CheckOutcome) -> Vec<LoyaltyEvent> {
    let mut events = Vec::new();
    for unlock in &outcome.unlocked {
        events.push(LoyaltyEvent::AchievementUnlocked {
            account_id: unlock.account_id.clone(),
            achievement: unlock.achievement.clone(),
            reward: unlock.reward,
        });
        if unlock.reward > 0 {
            events.push(LoyaltyEvent::PointsCredited {
                account_id: unlock.account_id.clone(),
                amount: unlock.reward,
                balance: unlock.balance,
                source: PointSource::Achievement,
                reason: format!("achievement:{}", unlock.achievement),
            });
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::{EventEnvelope, RecordingNotifier};

    struct Unreachable;

    impl Notifier for Unreachable {
        fn notify(&self, _envelope: &EventEnvelope) -> anyhow::Result<()> {
            anyhow::bail!("crm unavailable")
        }
    }

    async fn engine() -> (LoyaltyEngine, Arc<RecordingNotifier>) {
        let db = Arc::new(LoyaltyDb::open_in_memory().await.unwrap());
        let recorder = Arc::new(RecordingNotifier::new());
        let engine = LoyaltyEngine::new(db, LoyaltyConfig::default())
            .unwrap()
            .with_notifier(recorder.clone())
            .with_task_seed(9);
        (engine, recorder)
    }

    fn tier_changes(events: &[LoyaltyEvent]) -> Vec<(String, String)> {
        events
            .iter()
            .filter_map(|e| match e {
                LoyaltyEvent::TierChanged { old, new, .. } => Some((old.clone(), new.clone())),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let (engine, recorder) = engine().await;
        let status = engine.register_account("anna").await.unwrap();
        assert_eq!(status.tier, "Bronze");
        assert_eq!(status.cashback_percent, 5);
        engine.register_account("anna").await.unwrap();
        assert_eq!(recorder.events().len(), 1);
    }

    #[tokio::test]
    async fn test_credit_emits_single_tier_change() {
        let (engine, recorder) = engine().await;
        engine.register_account("anna").await.unwrap();
        recorder.clear();

        engine.credit("anna", 500, PointSource::Manual, "welcome").await.unwrap();
        let events = recorder.events();
        assert_eq!(tier_changes(&events), vec![("Bronze".to_string(), "Silver".to_string())]);
        assert!(matches!(events[0], LoyaltyEvent::PointsCredited { amount: 500, .. }));
        assert!(events
            .iter()
            .any(|e| matches!(e, LoyaltyEvent::AchievementUnlocked { achievement, .. } if achievement == "silver_status")));
        assert_eq!(engine.get_status("anna").await.unwrap().tier, "Silver");
    }

    #[tokio::test]
    async fn test_debit_downgrades_tier() {
        let (engine, recorder) = engine().await;
        engine.register_account("anna").await.unwrap();
        engine.credit("anna", 600, PointSource::Manual, "seed").await.unwrap();
        recorder.clear();

        engine.debit("anna", 300, PointSource::Manual, "redeem").await.unwrap();
        assert_eq!(
            tier_changes(&recorder.events()),
            vec![("Silver".to_string(), "Bronze".to_string())]
        );
    }

    #[tokio::test]
    async fn test_failed_debit_emits_nothing() {
        let (engine, recorder) = engine().await;
        engine.register_account("anna").await.unwrap();
        recorder.clear();
        let err = engine.debit("anna", 1, PointSource::Manual, "x").await.unwrap_err();
        assert!(matches!(err, LoyaltyError::InsufficientBalance { .. }));
        assert!(recorder.events().is_empty());
    }

    #[tokio::test]
    async fn test_purchase_cashback_flows_through_sweep() {
        let db = Arc::new(LoyaltyDb::open_in_memory().await.unwrap());
        let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
        let engine = LoyaltyEngine::new(db, LoyaltyConfig::default())
            .unwrap()
            .with_clock(clock.clone());
        engine.register_account("anna").await.unwrap();

        let confirmation = engine.confirm_purchase("anna", "order-1", 1000).await.unwrap();
        assert_eq!(confirmation.purchase.cashback, 50);
        // first_purchase reward is immediate, cashback is not
        assert_eq!(engine.balance("anna").await.unwrap(), 50);
        assert!(engine.process_due_credits().await.unwrap().is_empty());

        clock.advance(Duration::seconds(601));
        let applied = engine.process_due_credits().await.unwrap();
        assert_eq!(applied.len(), 1);
        assert_eq!(engine.balance("anna").await.unwrap(), 100);
        assert!(engine.process_due_credits().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_social_link_unlocks_once() {
        let (engine, recorder) = engine().await;
        engine.register_account("anna").await.unwrap();
        assert!(engine.link_social("anna", SocialNetwork::Vk).await.unwrap());
        assert!(!engine.link_social("anna", SocialNetwork::Vk).await.unwrap());

        let unlocks = recorder
            .events()
            .into_iter()
            .filter(|e| matches!(e, LoyaltyEvent::AchievementUnlocked { .. }))
            .count();
        assert_eq!(unlocks, 1);
        assert_eq!(engine.balance("anna").await.unwrap(), 30);

        let tasks = engine.get_daily_tasks("anna").await.unwrap();
        assert!(tasks.iter().any(|t| t.code == "vk_like"));
    }

    #[tokio::test]
    async fn test_notifier_failure_keeps_committed_credit() {
        let db = Arc::new(LoyaltyDb::open_in_memory().await.unwrap());
        let engine = LoyaltyEngine::new(db, LoyaltyConfig::default())
            .unwrap()
            .with_notifier(Arc::new(Unreachable));
        engine.register_account("anna").await.unwrap();

        let change = engine.credit("anna", 500, PointSource::Manual, "welcome").await.unwrap();
        assert_eq!(change.balance, 500);

        let status = engine.get_status("anna").await.unwrap();
        assert_eq!(status.tier, "Silver");
        // silver_status reward landed too
        assert_eq!(status.balance, 550);

        let history = engine.history("anna", 10).await.unwrap();
        assert!(history
            .iter()
            .any(|e| e.delta == 500 && e.source == PointSource::Manual && e.reason == "welcome"));
        assert!(!engine.reconcile("anna").await.unwrap().corrected);
    }

    #[tokio::test]
    async fn test_schedule_rejects_unrepresentable_delay() {
        let (engine, recorder) = engine().await;
        engine.register_account("anna").await.unwrap();
        recorder.clear();

        let err = engine
            .schedule_credit("anna", 10, PointSource::Manual, "later", Duration::MAX)
            .await
            .unwrap_err();
        assert!(matches!(err, LoyaltyError::InvalidAmount(_)));
        assert!(engine.process_due_credits().await.unwrap().is_empty());
        assert_eq!(engine.balance("anna").await.unwrap(), 0);
    }
}
