//! Post-commit events and the notifier boundary.
//!
//! Events are emitted only after the transaction that produced them has
//! committed. Notifier failures never affect the ledger; they are logged and
//! dropped.

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ledger::PointSource;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LoyaltyEvent {
    AccountRegistered {
        account_id: String,
        tier: String,
    },
    PointsCredited {
        account_id: String,
        amount: i64,
        balance: i64,
        source: PointSource,
        reason: String,
    },
    PointsDebited {
        account_id: String,
        amount: i64,
        balance: i64,
        source: PointSource,
        reason: String,
    },
    TierChanged {
        account_id: String,
        old: String,
        new: String,
    },
    ReferralActivated {
        code: String,
        owner_id: String,
        referee_id: String,
    },
    AchievementUnlocked {
        account_id: String,
        achievement: String,
        reward: i64,
    },
    TaskCompleted {
        account_id: String,
        task_code: String,
        date: NaiveDate,
        reward: i64,
    },
    StreakExtended {
        account_id: String,
        current: u32,
        longest: u32,
    },
    StreakMilestoneReached {
        account_id: String,
        length: u32,
        bonus: i64,
    },
    SocialLinked {
        account_id: String,
        network: String,
    },
    PurchaseConfirmed {
        account_id: String,
        purchase_id: String,
        amount: i64,
        cashback: i64,
    },
    PendingCreditApplied {
        pending_id: i64,
        account_id: String,
        amount: i64,
    },
}

impl LoyaltyEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            LoyaltyEvent::AccountRegistered { .. } => "account_registered",
            LoyaltyEvent::PointsCredited { .. } => "points_credited",
            LoyaltyEvent::PointsDebited { .. } => "points_debited",
            LoyaltyEvent::TierChanged { .. } => "tier_changed",
            LoyaltyEvent::ReferralActivated { .. } => "referral_activated",
            LoyaltyEvent::AchievementUnlocked { .. } => "achievement_unlocked",
            LoyaltyEvent::TaskCompleted { .. } => "task_completed",
            LoyaltyEvent::StreakExtended { .. } => "streak_extended",
            LoyaltyEvent::StreakMilestoneReached { .. } => "streak_milestone_reached",
            LoyaltyEvent::SocialLinked { .. } => "social_linked",
            LoyaltyEvent::PurchaseConfirmed { .. } => "purchase_confirmed",
            LoyaltyEvent::PendingCreditApplied { .. } => "pending_credit_applied",
        }
    }
}

/// Event with an id for downstream de-duplication
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: Uuid,
    pub emitted_at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: LoyaltyEvent,
}

impl EventEnvelope {
    pub fn new(event: LoyaltyEvent, emitted_at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            emitted_at,
            event,
        }
    }
}

/// Receives committed events (CRM sync, push notifications, ...)
pub trait Notifier: Send + Sync {
    fn notify(&self, envelope: &EventEnvelope) -> Result<()>;
}

/// Discards everything
#[derive(Debug, Default)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, _envelope: &EventEnvelope) -> Result<()> {
        Ok(())
    }
}

/// Writes events to the tracing log
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, envelope: &EventEnvelope) -> Result<()> {
        info!("event {} {}", envelope.event.kind(), serde_json::to_string(&envelope.event)?);
        Ok(())
    }
}

/// Hands events to an async consumer
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<EventEnvelope>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EventEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, envelope: &EventEnvelope) -> Result<()> {
        self.tx
            .send(envelope.clone())
            .map_err(|_| anyhow::anyhow!("event channel closed"))
    }
}

/// Keeps every event in memory; used by tests and dry runs
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<EventEnvelope>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LoyaltyEvent> {
        self.lock().iter().map(|e| e.event.clone()).collect()
    }

    pub fn envelopes(&self) -> Vec<EventEnvelope> {
        self.lock().clone()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<EventEnvelope>> {
        self.events.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, envelope: &EventEnvelope) -> Result<()> {
        self.lock().push(envelope.clone());
        Ok(())
    }
}

/// Deliver events in order; failures are logged and swallowed
pub fn dispatch(notifier: &dyn Notifier, events: Vec<LoyaltyEvent>, now: DateTime<Utc>) {
    for event in events {
        let envelope = EventEnvelope::new(event, now);
        match notifier.notify(&envelope) {
            Ok(()) => debug!("Delivered {} ({})", envelope.event.kind(), envelope.id),
            Err(e) => warn!("Notifier failed for {} ({}): {:#}", envelope.event.kind(), envelope.id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;

    impl Notifier for Failing {
        fn notify(&self, _envelope: &EventEnvelope) -> Result<()> {
            anyhow::bail!("crm unavailable")
        }
    }

    fn tier_event() -> LoyaltyEvent {
        LoyaltyEvent::TierChanged {
            account_id: "anna".to_string(),
            old: "Bronze".to_string(),
            new: "Silver".to_string(),
        }
    }

    #[test]
    fn test_envelope_json_shape() {
        let envelope = EventEnvelope::new(tier_event(), Utc::now());
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["type"], "tier_changed");
        assert_eq!(json["new"], "Silver");
        assert!(json["id"].is_string());
    }

    #[test]
    fn test_dispatch_swallows_failures() {
        dispatch(&Failing, vec![tier_event()], Utc::now());
    }

    #[test]
    fn test_recording_notifier_keeps_order() {
        let recorder = RecordingNotifier::new();
        let credited = LoyaltyEvent::PointsCredited {
            account_id: "anna".to_string(),
            amount: 5,
            balance: 5,
            source: PointSource::DailyTask,
            reason: "daily_task:daily_login".to_string(),
        };
        dispatch(&recorder, vec![credited.clone(), tier_event()], Utc::now());
        assert_eq!(recorder.events(), vec![credited, tier_event()]);
    }

    #[tokio::test]
    async fn test_channel_notifier() {
        let (notifier, mut rx) = ChannelNotifier::new();
        dispatch(&notifier, vec![tier_event()], Utc::now());
        let received = rx.recv().await.unwrap();
        assert_eq!(received.event, tier_event());

        drop(rx);
        assert!(notifier.notify(&EventEnvelope::new(tier_event(), Utc::now())).is_err());
    }
}
