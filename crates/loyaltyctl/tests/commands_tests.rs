//! Command execution against a throwaway database file.

use clap::Parser;
use loyalty_common::referral::CodeValidation;
use loyalty_common::{LoyaltyEngine, LoyaltyError};
use loyaltyctl::cli::Cli;
use loyaltyctl::commands::{execute, load_config, open_engine, Reply};
use loyaltyctl::output::render;
use tempfile::TempDir;

struct Ctl {
    _dir: TempDir,
    db: String,
}

impl Ctl {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("loyalty.db").to_string_lossy().to_string();
        Self { _dir: dir, db }
    }

    fn parse(&self, args: &[&str]) -> Cli {
        let mut argv = vec!["loyaltyctl", "--db", self.db.as_str()];
        argv.extend_from_slice(args);
        Cli::parse_from(argv)
    }

    async fn engine(&self, cli: &Cli) -> LoyaltyEngine {
        open_engine(load_config(cli).unwrap()).await.unwrap()
    }

    /// Each call opens a fresh engine, like separate CLI invocations
    async fn run(&self, args: &[&str]) -> anyhow::Result<Reply> {
        let cli = self.parse(args);
        let engine = self.engine(&cli).await;
        execute(&engine, cli.command).await
    }
}

#[tokio::test]
async fn test_register_credit_status() {
    let ctl = Ctl::new();
    ctl.run(&["register", "anna"]).await.unwrap();
    ctl.run(&["credit", "anna", "700", "--reason", "import"]).await.unwrap();

    match ctl.run(&["status", "anna"]).await.unwrap() {
        Reply::Status(status) => {
            assert_eq!(status.tier, "Silver");
            // 700 + silver_status reward
            assert_eq!(status.balance, 750);
        }
        other => panic!("unexpected reply: {:?}", other),
    }
}

#[tokio::test]
async fn test_overdraw_surfaces_business_error() {
    let ctl = Ctl::new();
    ctl.run(&["register", "anna"]).await.unwrap();

    let err = ctl.run(&["debit", "anna", "5"]).await.unwrap_err();
    let err = err.downcast_ref::<LoyaltyError>().unwrap();
    assert_eq!(err.code(), "insufficient_balance");
}

#[tokio::test]
async fn test_referral_flow_across_invocations() {
    let ctl = Ctl::new();
    ctl.run(&["register", "anna"]).await.unwrap();
    ctl.run(&["register", "bob"]).await.unwrap();

    let code = match ctl.run(&["referral", "generate", "anna"]).await.unwrap() {
        Reply::Code(code) => code.code,
        other => panic!("unexpected reply: {:?}", other),
    };

    // Lowercase input is normalized
    let lower = code.to_lowercase();
    match ctl.run(&["referral", "validate", lower.as_str()]).await.unwrap() {
        Reply::Validation(CodeValidation::Valid { owner_id }) => assert_eq!(owner_id, "anna"),
        other => panic!("unexpected reply: {:?}", other),
    }

    ctl.run(&["referral", "activate", code.as_str(), "bob"]).await.unwrap();
    match ctl.run(&["referral", "stats", "anna"]).await.unwrap() {
        Reply::ReferralStats(stats) => {
            assert_eq!(stats.activations, 1);
            assert_eq!(stats.referred_accounts, vec!["bob".to_string()]);
        }
        other => panic!("unexpected reply: {:?}", other),
    }
}

#[tokio::test]
async fn test_tasks_and_streak() {
    let ctl = Ctl::new();
    ctl.run(&["register", "anna"]).await.unwrap();

    let tasks = match ctl.run(&["tasks", "list", "anna"]).await.unwrap() {
        Reply::Tasks(tasks) => tasks,
        other => panic!("unexpected reply: {:?}", other),
    };
    assert!(tasks.iter().any(|t| t.code == "daily_login"));

    match ctl.run(&["tasks", "progress", "anna", "daily_login"]).await.unwrap() {
        Reply::TaskUpdate(update) => {
            assert!(update.completed_now);
            assert!(update.streak.is_none());
        }
        other => panic!("unexpected reply: {:?}", other),
    }

    let err = ctl
        .run(&["tasks", "progress", "anna", "daily_login"])
        .await
        .unwrap_err();
    assert_eq!(err.downcast_ref::<LoyaltyError>().unwrap().code(), "already_completed");

    match ctl.run(&["streak", "anna"]).await.unwrap() {
        Reply::Streak(streak) => assert_eq!(streak.current_streak, 0),
        other => panic!("unexpected reply: {:?}", other),
    }
}

#[tokio::test]
async fn test_schedule_then_sweep() {
    let ctl = Ctl::new();
    ctl.run(&["register", "anna"]).await.unwrap();
    ctl.run(&["schedule", "anna", "30"]).await.unwrap();

    let reply = ctl.run(&["sweep"]).await.unwrap();
    assert_eq!(render(&reply), vec!["Applied 1 pending credits (30 points)".to_string()]);
    match ctl.run(&["sweep"]).await.unwrap() {
        Reply::Swept(applied) => assert!(applied.is_empty()),
        other => panic!("unexpected reply: {:?}", other),
    }
}

#[tokio::test]
async fn test_link_twice() {
    let ctl = Ctl::new();
    ctl.run(&["register", "anna"]).await.unwrap();
    assert!(matches!(
        ctl.run(&["link", "anna", "ig"]).await.unwrap(),
        Reply::Linked { linked: true, .. }
    ));
    assert!(matches!(
        ctl.run(&["link", "anna", "instagram"]).await.unwrap(),
        Reply::Linked { linked: false, .. }
    ));
}

#[tokio::test]
async fn test_achievement_catalog_lists_definitions() {
    let ctl = Ctl::new();
    match ctl.run(&["achievements", "list"]).await.unwrap() {
        Reply::Catalog(defs) => assert!(defs.iter().any(|d| d.code == "first_purchase")),
        other => panic!("unexpected reply: {:?}", other),
    }
}

#[tokio::test]
async fn test_schedule_with_out_of_range_delay() {
    let ctl = Ctl::new();
    ctl.run(&["register", "anna"]).await.unwrap();

    let delay = i64::MAX.to_string();
    let err = ctl
        .run(&["schedule", "anna", "30", "--delay-secs", delay.as_str()])
        .await
        .unwrap_err();
    assert_eq!(err.downcast_ref::<LoyaltyError>().unwrap().code(), "invalid_amount");

    match ctl.run(&["sweep"]).await.unwrap() {
        Reply::Swept(applied) => assert!(applied.is_empty()),
        other => panic!("unexpected reply: {:?}", other),
    }
}
