//! End-to-end scenarios through the engine facade.

use chrono::{Duration, NaiveDate};
use loyalty_common::achievements::AchievementCategory;
use loyalty_common::clock::{Clock, ManualClock};
use loyalty_common::events::RecordingNotifier;
use loyalty_common::referral::CodeValidation;
use loyalty_common::{LoyaltyConfig, LoyaltyDb, LoyaltyEngine, LoyaltyError, LoyaltyEvent, PointSource};
use std::sync::Arc;

struct Harness {
    engine: LoyaltyEngine,
    clock: Arc<ManualClock>,
    events: Arc<RecordingNotifier>,
}

async fn harness(start: NaiveDate) -> Harness {
    let db = Arc::new(LoyaltyDb::open_in_memory().await.unwrap());
    let clock = Arc::new(ManualClock::at_date(start));
    let events = Arc::new(RecordingNotifier::new());
    let engine = LoyaltyEngine::new(db, LoyaltyConfig::default())
        .unwrap()
        .with_clock(clock.clone())
        .with_notifier(events.clone())
        .with_task_seed(2024);
    Harness { engine, clock, events }
}

fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 6, d).unwrap()
}

fn count_tier_changes(events: &[LoyaltyEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, LoyaltyEvent::TierChanged { .. }))
        .count()
}

#[tokio::test]
async fn test_status_and_referral_scenario() {
    let h = harness(day(1)).await;
    let engine = &h.engine;

    // New account starts in the base tier
    let status = engine.register_account("a").await.unwrap();
    assert_eq!((status.tier.as_str(), status.cashback_percent), ("Bronze", 5));

    // Crossing 500 moves to Silver with exactly one tier change
    engine.credit("a", 500, PointSource::Manual, "welcome").await.unwrap();
    let status = engine.get_status("a").await.unwrap();
    assert_eq!((status.tier.as_str(), status.cashback_percent), ("Silver", 10));
    assert_eq!(count_tier_changes(&h.events.events()), 1);

    // Over-debit is rejected and leaves the balance alone
    let before = engine.balance("a").await.unwrap();
    let err = engine
        .debit("a", before + 1, PointSource::Manual, "too much")
        .await
        .unwrap_err();
    assert!(matches!(err, LoyaltyError::InsufficientBalance { .. }));
    assert_eq!(engine.balance("a").await.unwrap(), before);

    // B activates A's code: A +50, B +20
    engine.register_account("b").await.unwrap();
    engine.register_account("c").await.unwrap();
    let code = engine.generate_referral_code("a").await.unwrap();
    assert!(code.code.starts_with("FAR") && code.code.len() == 7);

    let activation = engine.activate_referral_code(&code.code, "b").await.unwrap();
    assert_eq!(activation.owner_credit.delta, 50);
    assert_eq!(activation.referee_credit.delta, 20);
    assert_eq!(activation.owner_credit.balance, before + 50);
    assert_eq!(engine.balance("b").await.unwrap(), 20);

    // C cannot reuse it
    let err = engine.activate_referral_code(&code.code, "c").await.unwrap_err();
    assert!(matches!(err, LoyaltyError::AlreadyUsed(_)));
    assert_eq!(engine.balance("c").await.unwrap(), 0);
    assert_eq!(
        engine.validate_referral_code(&code.code).await.unwrap(),
        CodeValidation::AlreadyUsed
    );

    // The owner's referral achievement was paid during the follow-up
    let progress = engine.achievement_progress("a").await.unwrap();
    assert!(progress.iter().any(|p| p.achievement == "first_referral" && p.completed));

    let stats = engine.get_referral_stats("a").await.unwrap();
    assert_eq!(stats.activations, 1);
    assert_eq!(stats.total_bonus, 50);
    assert_eq!(stats.referred_accounts, vec!["b".to_string()]);
}

#[tokio::test]
async fn test_repeated_achievement_checks_pay_once() {
    let h = harness(day(1)).await;
    let engine = &h.engine;
    engine.register_account("anna").await.unwrap();
    engine.ledger().credit("anna", 1200, PointSource::Manual, "import", h.clock.now()).await.unwrap();

    let first = engine.check_achievements("anna", Some(AchievementCategory::Points)).await.unwrap();
    let second = engine.check_achievements("anna", Some(AchievementCategory::Points)).await.unwrap();
    assert!(first.unlocked.iter().any(|u| u.achievement == "points_1000"));
    assert!(second.unlocked.is_empty());

    let rewards: Vec<_> = engine
        .history("anna", 50)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.reason == "achievement:points_1000")
        .collect();
    assert_eq!(rewards.len(), 1);
}

#[tokio::test]
async fn test_daily_tasks_are_stable_for_the_day() {
    let h = harness(day(1)).await;
    let engine = &h.engine;
    engine.register_account("anna").await.unwrap();

    let first = engine.get_daily_tasks("anna").await.unwrap();
    let second = engine.get_daily_tasks("anna").await.unwrap();
    assert_eq!(first, second);
    assert!((5..=7).contains(&first.len()));

    h.clock.advance(Duration::days(1));
    let tomorrow = engine.get_daily_tasks("anna").await.unwrap();
    assert!(tomorrow.iter().all(|t| t.date == day(2)));
}

#[tokio::test]
async fn test_streak_across_days() {
    let h = harness(day(10)).await;
    let engine = &h.engine;
    engine.register_account("anna").await.unwrap();

    let mut observed = Vec::new();
    for offset in [0, 1, 2, 4] {
        h.clock.set_date(day(10 + offset));
        engine.get_daily_tasks("anna").await.unwrap();
        engine.update_task_progress("anna", "daily_login", 1).await.unwrap();
        let update = engine.update_task_progress("anna", "check_balance", 1).await.unwrap();
        observed.push(update.streak.map(|s| s.current));
    }
    assert_eq!(observed, vec![Some(1), Some(2), Some(3), Some(1)]);

    let streak = engine.get_streak("anna").await.unwrap();
    assert_eq!(streak.current_streak, 1);
    assert_eq!(streak.longest_streak, 3);
    assert_eq!(streak.total_active_days, 4);

    // The 3-day milestone was paid once
    let bonuses = engine
        .history("anna", 100)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.source == PointSource::StreakBonus)
        .count();
    assert_eq!(bonuses, 1);
    assert!(h
        .events
        .events()
        .iter()
        .any(|e| matches!(e, LoyaltyEvent::StreakMilestoneReached { length: 3, .. })));
}

#[tokio::test]
async fn test_pending_credit_applied_once() {
    let h = harness(day(1)).await;
    let engine = &h.engine;
    engine.register_account("anna").await.unwrap();

    let job = engine
        .schedule_credit("anna", 75, PointSource::Manual, "goodwill", Duration::minutes(5))
        .await
        .unwrap();
    assert!(!job.processed);
    assert!(engine.process_due_credits().await.unwrap().is_empty());

    h.clock.advance(Duration::minutes(6));
    let applied = engine.process_due_credits().await.unwrap();
    assert_eq!(applied.len(), 1);
    assert_eq!(applied[0].pending_id, job.id);
    for _ in 0..3 {
        assert!(engine.process_due_credits().await.unwrap().is_empty());
    }
    assert_eq!(engine.balance("anna").await.unwrap(), 75);
}
