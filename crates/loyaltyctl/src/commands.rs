//! Command execution against a local engine.
//!
//! Every command maps onto one engine operation and yields a [`Reply`], which
//! `output` prints as JSON or as a short human summary.

use anyhow::{Context, Result};
use chrono::Duration;
use loyalty_common::achievements::{AchievementDefinition, AchievementProgress, CheckOutcome};
use loyalty_common::daily_tasks::{DailyTask, TaskProgressUpdate};
use loyalty_common::events::LogNotifier;
use loyalty_common::ledger::{LedgerChange, LedgerEntry, ReconcileReport};
use loyalty_common::pending::{AppliedCredit, PendingCredit};
use loyalty_common::purchases::PurchaseConfirmation;
use loyalty_common::referral::{CodeValidation, ReferralActivation, ReferralCode, ReferralStats};
use loyalty_common::status::StatusSnapshot;
use loyalty_common::streaks::StreakRecord;
use loyalty_common::{LoyaltyConfig, LoyaltyEngine, LoyaltyError, SocialNetwork};
use serde::Serialize;
use std::sync::Arc;

use crate::cli::{AchievementCommands, Cli, Commands, ReferralCommands, TaskCommands};

/// Result of one command
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum Reply {
    Status(StatusSnapshot),
    Change(LedgerChange),
    History(Vec<LedgerEntry>),
    Reconcile(ReconcileReport),
    Code(ReferralCode),
    Validation(CodeValidation),
    Activation(ReferralActivation),
    ReferralStats(ReferralStats),
    Check(CheckOutcome),
    Progress(Vec<AchievementProgress>),
    Catalog(Vec<AchievementDefinition>),
    Tasks(Vec<DailyTask>),
    TaskUpdate(TaskProgressUpdate),
    Streak(StreakRecord),
    Linked {
        account_id: String,
        network: SocialNetwork,
        linked: bool,
    },
    Purchase(PurchaseConfirmation),
    Scheduled(PendingCredit),
    Swept(Vec<AppliedCredit>),
}

/// Config from --config, else the standard search path, with --db applied
pub fn load_config(cli: &Cli) -> Result<LoyaltyConfig> {
    let mut config = match &cli.config {
        Some(path) => LoyaltyConfig::load_from_path(path)?,
        None => LoyaltyConfig::load(),
    };
    if let Some(db) = &cli.db {
        config.storage.db_path = Some(db.clone());
    }
    Ok(config)
}

pub async fn open_engine(config: LoyaltyConfig) -> Result<LoyaltyEngine> {
    let engine = LoyaltyEngine::open(config)
        .await
        .context("Failed to open loyalty database")?;
    Ok(engine.with_notifier(Arc::new(LogNotifier)))
}

/// Run one command
pub async fn execute(engine: &LoyaltyEngine, command: Commands) -> Result<Reply> {
    let reply = match command {
        Commands::Register { account } => Reply::Status(engine.register_account(&account).await?),
        Commands::Credit { account, amount, source, reason } => {
            Reply::Change(engine.credit(&account, amount, source, &reason).await?)
        }
        Commands::Debit { account, amount, source, reason } => {
            Reply::Change(engine.debit(&account, amount, source, &reason).await?)
        }
        Commands::Status { account } => Reply::Status(engine.get_status(&account).await?),
        Commands::History { account, limit } => Reply::History(engine.history(&account, limit).await?),
        Commands::Reconcile { account } => Reply::Reconcile(engine.reconcile(&account).await?),

        Commands::Referral { action } => match action {
            ReferralCommands::Generate { owner } => {
                Reply::Code(engine.generate_referral_code(&owner).await?)
            }
            ReferralCommands::Validate { code } => {
                Reply::Validation(engine.validate_referral_code(&code).await?)
            }
            ReferralCommands::Activate { code, referee } => {
                Reply::Activation(engine.activate_referral_code(&code, &referee).await?)
            }
            ReferralCommands::Stats { owner } => {
                Reply::ReferralStats(engine.get_referral_stats(&owner).await?)
            }
        },

        Commands::Achievements { action } => match action {
            AchievementCommands::Check { account, category } => {
                Reply::Check(engine.check_achievements(&account, category).await?)
            }
            AchievementCommands::Progress { account } => {
                Reply::Progress(engine.achievement_progress(&account).await?)
            }
            AchievementCommands::List => {
                Reply::Catalog(engine.achievements().definitions().to_vec())
            }
        },

        Commands::Tasks { action } => match action {
            TaskCommands::List { account } => Reply::Tasks(engine.get_daily_tasks(&account).await?),
            TaskCommands::Progress { account, task, by } => {
                Reply::TaskUpdate(engine.update_task_progress(&account, &task, by).await?)
            }
        },

        Commands::Streak { account } => Reply::Streak(engine.get_streak(&account).await?),
        Commands::Link { account, network } => {
            let linked = engine.link_social(&account, network).await?;
            Reply::Linked {
                account_id: account,
                network,
                linked,
            }
        }
        Commands::Purchase { account, purchase_id, amount } => {
            Reply::Purchase(engine.confirm_purchase(&account, &purchase_id, amount).await?)
        }
        Commands::Schedule { account, amount, delay_secs, source, reason } => {
            let delay = Duration::try_seconds(delay_secs).ok_or(LoyaltyError::InvalidAmount(delay_secs))?;
            Reply::Scheduled(engine.schedule_credit(&account, amount, source, &reason, delay).await?)
        }
        Commands::Sweep => Reply::Swept(engine.process_due_credits().await?),
    };
    Ok(reply)
}
