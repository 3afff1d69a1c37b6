// Database Connection Management for the Loyalty Ledger
//
// One SQLite connection guarded by a tokio mutex. Every mutation runs inside
// a BEGIN IMMEDIATE transaction, which serializes writers per process (mutex)
// and across processes (SQLite reserved lock).

use rusqlite::{Connection, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::StorageConfig;
use crate::error::{LoyaltyError, Result};
use crate::store::LoyaltyStore;

/// State directory used by the system-wide daemon
pub const STATE_DIR: &str = "/var/lib/loyalty";

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS accounts (
    id TEXT PRIMARY KEY,
    balance INTEGER NOT NULL DEFAULT 0,
    tier TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS ledger_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id TEXT NOT NULL REFERENCES accounts(id),
    delta INTEGER NOT NULL,
    source TEXT NOT NULL,
    reason TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_ledger_account ON ledger_entries(account_id, id);

CREATE TRIGGER IF NOT EXISTS ledger_entries_no_update
BEFORE UPDATE ON ledger_entries
BEGIN
    SELECT RAISE(ABORT, 'ledger entries are append-only');
END;

CREATE TRIGGER IF NOT EXISTS ledger_entries_no_delete
BEFORE DELETE ON ledger_entries
BEGIN
    SELECT RAISE(ABORT, 'ledger entries are append-only');
END;

CREATE TABLE IF NOT EXISTS referral_codes (
    code TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL REFERENCES accounts(id),
    created_at TEXT NOT NULL,
    activated_by TEXT UNIQUE REFERENCES accounts(id),
    activated_at TEXT,
    bonus_amount INTEGER NOT NULL DEFAULT 0,
    bonus_paid INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_referral_owner ON referral_codes(owner_id);

CREATE TABLE IF NOT EXISTS achievement_progress (
    account_id TEXT NOT NULL REFERENCES accounts(id),
    achievement TEXT NOT NULL,
    progress INTEGER NOT NULL DEFAULT 0,
    completed INTEGER NOT NULL DEFAULT 0,
    unlocked_at TEXT,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (account_id, achievement)
);

CREATE TABLE IF NOT EXISTS daily_task_instances (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id TEXT NOT NULL REFERENCES accounts(id),
    task_code TEXT NOT NULL,
    task_date TEXT NOT NULL,
    progress INTEGER NOT NULL DEFAULT 0,
    completed INTEGER NOT NULL DEFAULT 0,
    completed_at TEXT,
    reward_earned INTEGER NOT NULL DEFAULT 0,
    UNIQUE (account_id, task_code, task_date)
);
CREATE INDEX IF NOT EXISTS idx_task_account_date ON daily_task_instances(account_id, task_date);

CREATE TABLE IF NOT EXISTS streaks (
    account_id TEXT PRIMARY KEY REFERENCES accounts(id),
    current_streak INTEGER NOT NULL DEFAULT 0,
    longest_streak INTEGER NOT NULL DEFAULT 0,
    last_active_date TEXT,
    total_active_days INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS streak_milestones (
    account_id TEXT NOT NULL REFERENCES accounts(id),
    length INTEGER NOT NULL,
    bonus INTEGER NOT NULL,
    awarded_at TEXT NOT NULL,
    PRIMARY KEY (account_id, length)
);

CREATE TABLE IF NOT EXISTS social_links (
    account_id TEXT NOT NULL REFERENCES accounts(id),
    network TEXT NOT NULL,
    linked_at TEXT NOT NULL,
    PRIMARY KEY (account_id, network)
);

CREATE TABLE IF NOT EXISTS pending_credits (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id TEXT NOT NULL REFERENCES accounts(id),
    amount INTEGER NOT NULL,
    source TEXT NOT NULL,
    reason TEXT NOT NULL,
    due_at INTEGER NOT NULL,
    created_at TEXT NOT NULL,
    processed INTEGER NOT NULL DEFAULT 0,
    processed_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_pending_due ON pending_credits(processed, due_at);

CREATE TABLE IF NOT EXISTS purchases (
    purchase_id TEXT PRIMARY KEY,
    account_id TEXT NOT NULL REFERENCES accounts(id),
    amount INTEGER NOT NULL,
    cashback INTEGER NOT NULL,
    pending_credit_id INTEGER REFERENCES pending_credits(id),
    confirmed_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_purchases_account ON purchases(account_id);
";

/// Database location based on execution mode
#[derive(Debug, Clone)]
pub enum DbLocation {
    /// System mode: /var/lib/loyalty/loyalty.db
    System,
    /// User mode: $XDG_DATA_HOME/loyalty/loyalty.db or ~/.local/share/loyalty/loyalty.db
    User,
    /// Explicit path from config or command line
    Custom(PathBuf),
    /// Private in-memory database (tests, dry runs)
    InMemory,
}

impl DbLocation {
    pub fn path(&self) -> Result<Option<PathBuf>> {
        match self {
            DbLocation::System => Ok(Some(Path::new(STATE_DIR).join("loyalty.db"))),
            DbLocation::User => {
                // Try XDG_DATA_HOME first, fall back to ~/.local/share
                let base_dir = if let Ok(xdg_data) = std::env::var("XDG_DATA_HOME") {
                    PathBuf::from(xdg_data)
                } else if let Ok(home) = std::env::var("HOME") {
                    PathBuf::from(home).join(".local/share")
                } else {
                    return Err(LoyaltyError::Config(
                        "Could not determine user data directory".to_string(),
                    ));
                };
                Ok(Some(base_dir.join("loyalty").join("loyalty.db")))
            }
            DbLocation::Custom(path) => Ok(Some(path.clone())),
            DbLocation::InMemory => Ok(None),
        }
    }

    /// Configured path wins, otherwise system dir when it exists
    pub fn resolve(storage: &StorageConfig) -> Self {
        if let Some(path) = &storage.db_path {
            return DbLocation::Custom(path.clone());
        }
        if Path::new(STATE_DIR).is_dir() {
            DbLocation::System
        } else {
            DbLocation::User
        }
    }
}

/// Guarded SQLite connection shared by every component
pub struct LoyaltyDb {
    conn: Arc<Mutex<Connection>>,
    location: DbLocation,
    max_retries: u32,
}

impl LoyaltyDb {
    /// Open or create database at the specified location with default storage settings
    pub async fn open(location: DbLocation) -> Result<Self> {
        Self::open_with(location, &StorageConfig::default()).await
    }

    /// Private in-memory database with the full schema
    pub async fn open_in_memory() -> Result<Self> {
        Self::open(DbLocation::InMemory).await
    }

    pub async fn open_with(location: DbLocation, storage: &StorageConfig) -> Result<Self> {
        let db_path = location.path()?;

        // Ensure parent directory exists
        if let Some(parent) = db_path.as_deref().and_then(Path::parent) {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        match &db_path {
            Some(path) => info!("Opening loyalty database at: {}", path.display()),
            None => debug!("Opening in-memory loyalty database"),
        }

        let busy_timeout = Duration::from_millis(storage.busy_timeout_ms);
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            let conn = match &db_path {
                Some(path) => {
                    let conn = Connection::open(path)?;
                    // WAL lets readers proceed while the daemon writes
                    conn.pragma_update(None, "journal_mode", "WAL")?;
                    conn.pragma_update(None, "synchronous", "NORMAL")?;
                    conn
                }
                None => Connection::open_in_memory()?,
            };

            conn.pragma_update(None, "foreign_keys", "ON")?;
            conn.busy_timeout(busy_timeout)?;
            conn.execute_batch(SCHEMA_SQL)?;
            Ok(conn)
        })
        .await??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            location,
            max_retries: storage.max_retries.max(1),
        })
    }

    /// Run a read (or single-statement write) in a blocking context
    pub async fn execute<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let outcome = tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            f(&conn)
        })
        .await;
        log_failure("read", flatten(outcome))
    }

    /// Run `f` inside one IMMEDIATE transaction.
    ///
    /// Any error rolls the whole transaction back. Busy/locked failures are
    /// retried up to `max_retries` times, after which the caller receives
    /// `ConcurrencyConflict`. `f` may therefore run more than once and must
    /// not have side effects outside the store.
    pub async fn transact<F, R>(&self, mut f: F) -> Result<R>
    where
        F: FnMut(&dyn LoyaltyStore) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let max_retries = self.max_retries;

        let outcome = tokio::task::spawn_blocking(move || {
            let mut guard = conn.blocking_lock();
            let mut attempt = 0u32;
            loop {
                attempt += 1;
                match run_transaction(&mut guard, &mut f) {
                    Err(e) if e.is_retryable() => {
                        if attempt >= max_retries {
                            warn!("Transaction still busy after {} attempts", attempt);
                            return Err(LoyaltyError::ConcurrencyConflict { attempts: attempt });
                        }
                        debug!("Transaction busy (attempt {}), retrying", attempt);
                        std::thread::sleep(Duration::from_millis(25 * u64::from(attempt)));
                    }
                    outcome => return outcome,
                }
            }
        })
        .await;
        log_failure("transaction", flatten(outcome))
    }

    /// Get database location
    pub fn location(&self) -> &DbLocation {
        &self.location
    }
}

fn run_transaction<F, R>(conn: &mut Connection, f: &mut F) -> Result<R>
where
    F: FnMut(&dyn LoyaltyStore) -> Result<R>,
{
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let value = f(&*tx)?;
    tx.commit()?;
    Ok(value)
}

fn flatten<R>(outcome: std::result::Result<Result<R>, tokio::task::JoinError>) -> Result<R> {
    outcome.map_err(LoyaltyError::from).and_then(|result| result)
}

/// Business-rule rejections are the caller's concern, anything else is logged here
fn log_failure<R>(op: &str, result: Result<R>) -> Result<R> {
    if let Err(e) = &result {
        if !e.is_business_rule() {
            error!("Storage {} failed ({}): {}", op, e.code(), e);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::PointSource;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_db_creation() {
        let temp_dir = tempdir().unwrap();
        let db_path = temp_dir.path().join("nested").join("test.db");
        let location = DbLocation::Custom(db_path.clone());

        let db = LoyaltyDb::open(location).await.unwrap();

        // Verify database file was created
        assert!(db_path.exists());

        let tables = db
            .execute(|conn| {
                let count: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table'",
                    [],
                    |row| row.get(0),
                )?;
                Ok(count)
            })
            .await
            .unwrap();

        assert!(tables >= 10);
    }

    #[tokio::test]
    async fn test_schema_is_idempotent() {
        let temp_dir = tempdir().unwrap();
        let location = DbLocation::Custom(temp_dir.path().join("test.db"));

        drop(LoyaltyDb::open(location.clone()).await.unwrap());
        assert!(LoyaltyDb::open(location).await.is_ok());
    }

    #[tokio::test]
    async fn test_transaction_rolls_back_on_error() {
        let db = LoyaltyDb::open_in_memory().await.unwrap();

        let result: Result<()> = db
            .transact(|store| {
                store.insert_account("a", "Bronze", chrono::Utc::now())?;
                Err(LoyaltyError::InvalidAmount(0))
            })
            .await;
        assert!(matches!(result, Err(LoyaltyError::InvalidAmount(0))));

        let count = db
            .execute(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM accounts", [], |r| r.get::<_, i64>(0))?))
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_ledger_entries_are_append_only() {
        let db = LoyaltyDb::open_in_memory().await.unwrap();

        let result = db
            .execute(|conn| {
                conn.execute(
                    "INSERT INTO accounts (id, balance, tier, created_at) VALUES ('a', 0, 'Bronze', '2026-01-01')",
                    [],
                )?;
                conn.execute(
                    "INSERT INTO ledger_entries (account_id, delta, source, reason, created_at)
                     VALUES ('a', 10, 'manual', 'seed', '2026-01-01')",
                    [],
                )?;
                conn.execute("UPDATE ledger_entries SET delta = 1000", [])?;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(LoyaltyError::Storage(_))));
    }

    #[tokio::test]
    async fn test_storage_failure_propagates_and_rolls_back() {
        let db = LoyaltyDb::open_in_memory().await.unwrap();

        // Ledger row for an account that does not exist trips the foreign key
        let result = db
            .transact(|store| {
                store.insert_account("a", "Bronze", chrono::Utc::now())?;
                store.append_entry("ghost", 10, PointSource::Manual, "orphan", chrono::Utc::now())?;
                Ok(())
            })
            .await;
        match result {
            Err(e) => {
                assert_eq!(e.code(), "storage");
                assert!(!e.is_business_rule());
            }
            Ok(()) => panic!("orphan entry was accepted"),
        }

        let account = db.execute(|conn| conn.load_account("a")).await.unwrap();
        assert!(account.is_none());
    }

    #[tokio::test]
    async fn test_busy_database_surfaces_conflict() {
        let temp_dir = tempdir().unwrap();
        let db_path = temp_dir.path().join("busy.db");
        let storage = StorageConfig {
            db_path: None,
            busy_timeout_ms: 0,
            max_retries: 2,
        };
        let db = LoyaltyDb::open_with(DbLocation::Custom(db_path.clone()), &storage)
            .await
            .unwrap();

        // A second process holding the writer lock
        let blocker = Connection::open(&db_path).unwrap();
        blocker.execute_batch("BEGIN IMMEDIATE").unwrap();

        let result = db.transact(|_conn| Ok(())).await;
        assert!(matches!(result, Err(LoyaltyError::ConcurrencyConflict { attempts: 2 })));

        blocker.execute_batch("COMMIT").unwrap();
        assert!(db.transact(|_conn| Ok(())).await.is_ok());
    }

    #[test]
    fn test_location_paths() {
        assert!(DbLocation::InMemory.path().unwrap().is_none());
        let custom = DbLocation::Custom(PathBuf::from("/tmp/x.db"));
        assert_eq!(custom.path().unwrap(), Some(PathBuf::from("/tmp/x.db")));
        assert_eq!(
            DbLocation::System.path().unwrap(),
            Some(PathBuf::from("/var/lib/loyalty/loyalty.db"))
        );
    }

    #[test]
    fn test_resolve_prefers_configured_path() {
        let storage = StorageConfig {
            db_path: Some(PathBuf::from("/srv/loyalty.db")),
            ..StorageConfig::default()
        };
        assert!(matches!(DbLocation::resolve(&storage), DbLocation::Custom(_)));
    }
}
