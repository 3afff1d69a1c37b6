//! Error types for the loyalty engine.

use rusqlite::ErrorCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoyaltyError {
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    #[error("Already used: {0}")]
    AlreadyUsed(String),

    #[error("{entity} already completed: {key}")]
    AlreadyCompleted { entity: &'static str, key: String },

    #[error("Account {0} has already activated a referral code")]
    AlreadyReferred(String),

    #[error("Account {0} cannot activate its own referral code")]
    SelfReferralRejected(String),

    #[error("Insufficient balance: have {balance}, need {requested}")]
    InsufficientBalance { balance: i64, requested: i64 },

    #[error("Amount must be positive, got {0}")]
    InvalidAmount(i64),

    #[error("Balance {balance} cannot absorb {delta:+}")]
    BalanceOverflow { balance: i64, delta: i64 },

    #[error("Could not generate a unique referral code after {attempts} attempts")]
    CodeGenerationExhausted { attempts: u32 },

    #[error("Transaction conflicted {attempts} times, giving up")]
    ConcurrencyConflict { attempts: u32 },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, LoyaltyError>;

impl LoyaltyError {
    pub fn not_found(entity: &'static str, key: impl Into<String>) -> Self {
        LoyaltyError::NotFound { entity, key: key.into() }
    }

    pub fn already_completed(entity: &'static str, key: impl Into<String>) -> Self {
        LoyaltyError::AlreadyCompleted { entity, key: key.into() }
    }

    /// Stable identifier for the boundary layer to map onto responses.
    pub fn code(&self) -> &'static str {
        match self {
            LoyaltyError::NotFound { .. } => "not_found",
            LoyaltyError::AlreadyUsed(_) => "already_used",
            LoyaltyError::AlreadyCompleted { .. } => "already_completed",
            LoyaltyError::AlreadyReferred(_) => "already_referred",
            LoyaltyError::SelfReferralRejected(_) => "self_referral_rejected",
            LoyaltyError::InsufficientBalance { .. } => "insufficient_balance",
            LoyaltyError::InvalidAmount(_) => "invalid_amount",
            LoyaltyError::BalanceOverflow { .. } => "balance_overflow",
            LoyaltyError::CodeGenerationExhausted { .. } => "code_generation_exhausted",
            LoyaltyError::ConcurrencyConflict { .. } => "concurrency_conflict",
            LoyaltyError::Config(_) => "config",
            LoyaltyError::Storage(_) => "storage",
            LoyaltyError::Io(_) => "io",
            LoyaltyError::Worker(_) => "worker",
        }
    }

    /// Business-rule violations are expected outcomes, everything else is infrastructure.
    pub fn is_business_rule(&self) -> bool {
        matches!(
            self,
            LoyaltyError::NotFound { .. }
                | LoyaltyError::AlreadyUsed(_)
                | LoyaltyError::AlreadyCompleted { .. }
                | LoyaltyError::AlreadyReferred(_)
                | LoyaltyError::SelfReferralRejected(_)
                | LoyaltyError::InsufficientBalance { .. }
                | LoyaltyError::InvalidAmount(_)
                | LoyaltyError::BalanceOverflow { .. }
                | LoyaltyError::CodeGenerationExhausted { .. }
        )
    }

    /// SQLite reported a competing writer; the transaction can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            LoyaltyError::Storage(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}
