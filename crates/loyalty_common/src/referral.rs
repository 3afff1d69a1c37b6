//! Referral codes: issue, validate, activate.
//!
//! A code is `<prefix><random A-Z0-9>`. Activation credits both sides and
//! consumes the code in one transaction; the conditional update on
//! `activated_by IS NULL` plus the UNIQUE constraint on `activated_by`
//! keep both "one activation per code" and "one code per account".

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::ReferralConfig;
use crate::db::LoyaltyDb;
use crate::error::{LoyaltyError, Result};
use crate::ledger::{self, LedgerChange, PointSource};
use crate::store::LoyaltyStore;

const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferralCode {
    pub code: String,
    pub owner_id: String,
    pub created_at: DateTime<Utc>,
    pub activated_by: Option<String>,
    pub activated_at: Option<DateTime<Utc>>,
    /// Points paid to the owner on activation
    pub bonus_amount: i64,
    pub bonus_paid: bool,
}

impl ReferralCode {
    pub fn is_activated(&self) -> bool {
        self.activated_by.is_some()
    }
}

/// Outcome of a validation lookup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CodeValidation {
    Valid { owner_id: String },
    NotFound,
    AlreadyUsed,
}

/// Committed activation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferralActivation {
    pub code: String,
    pub owner_id: String,
    pub referee_id: String,
    pub owner_credit: LedgerChange,
    pub referee_credit: LedgerChange,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferralStats {
    pub codes_issued: usize,
    pub activations: usize,
    pub total_bonus: i64,
    pub referred_accounts: Vec<String>,
    /// Code the owner can currently hand out
    pub open_code: Option<String>,
}

/// Codes are case-insensitive on input
pub fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

pub fn random_code<R: Rng + ?Sized>(prefix: &str, length: usize, rng: &mut R) -> String {
    let mut code = String::with_capacity(prefix.len() + length);
    code.push_str(prefix);
    for _ in 0..length {
        let idx = rng.gen_range(0..CODE_ALPHABET.len());
        code.push(CODE_ALPHABET[idx] as char);
    }
    code
}

pub(crate) fn generate_in<R: Rng + ?Sized>(
    store: &dyn LoyaltyStore,
    config: &ReferralConfig,
    owner_id: &str,
    rng: &mut R,
    now: DateTime<Utc>,
) -> Result<ReferralCode> {
    if store.load_account(owner_id)?.is_none() {
        return Err(LoyaltyError::not_found("account", owner_id));
    }
    if let Some(existing) = store.open_referral_code(owner_id)? {
        return Ok(existing);
    }

    let prefix = normalize_code(&config.code_prefix);
    for attempt in 1..=config.max_attempts {
        let candidate = random_code(&prefix, config.code_length, rng);
        if store.insert_referral_code(&candidate, owner_id, now)? {
            debug!("Issued referral code {} to {} (attempt {})", candidate, owner_id, attempt);
            return store
                .find_referral_code(&candidate)?
                .ok_or_else(|| LoyaltyError::not_found("referral code", candidate));
        }
    }

    Err(LoyaltyError::CodeGenerationExhausted {
        attempts: config.max_attempts,
    })
}

pub(crate) fn validate_in(store: &dyn LoyaltyStore, code: &str) -> Result<CodeValidation> {
    Ok(match store.find_referral_code(&normalize_code(code))? {
        None => CodeValidation::NotFound,
        Some(found) if found.is_activated() => CodeValidation::AlreadyUsed,
        Some(found) => CodeValidation::Valid {
            owner_id: found.owner_id,
        },
    })
}

pub(crate) fn activate_in(
    store: &dyn LoyaltyStore,
    config: &ReferralConfig,
    code: &str,
    referee_id: &str,
    now: DateTime<Utc>,
) -> Result<ReferralActivation> {
    let code = normalize_code(code);
    let found = store
        .find_referral_code(&code)?
        .ok_or_else(|| LoyaltyError::not_found("referral code", code.as_str()))?;

    if found.is_activated() {
        return Err(LoyaltyError::AlreadyUsed(code));
    }
    if found.owner_id == referee_id {
        return Err(LoyaltyError::SelfReferralRejected(code));
    }
    if store.load_account(referee_id)?.is_none() {
        return Err(LoyaltyError::not_found("account", referee_id));
    }
    if store.referral_activated_by(referee_id)?.is_some() {
        return Err(LoyaltyError::AlreadyReferred(referee_id.to_string()));
    }

    if !store.mark_referral_activated(&code, referee_id, config.referrer_bonus, now)? {
        return Err(LoyaltyError::AlreadyUsed(code));
    }

    let owner_credit = ledger::credit_in(
        store,
        &found.owner_id,
        config.referrer_bonus,
        PointSource::Referral,
        &format!("referral:{}:{}", code, referee_id),
        now,
    )?;
    let referee_credit = ledger::credit_in(
        store,
        referee_id,
        config.referee_bonus,
        PointSource::Referral,
        &format!("referral_welcome:{}", code),
        now,
    )?;

    Ok(ReferralActivation {
        code,
        owner_id: found.owner_id,
        referee_id: referee_id.to_string(),
        owner_credit,
        referee_credit,
    })
}

pub(crate) fn stats_in(store: &dyn LoyaltyStore, owner_id: &str) -> Result<ReferralStats> {
    if store.load_account(owner_id)?.is_none() {
        return Err(LoyaltyError::not_found("account", owner_id));
    }
    let codes = store.referral_codes_owned_by(owner_id)?;

    let mut stats = ReferralStats {
        codes_issued: codes.len(),
        ..Default::default()
    };
    for code in codes {
        match code.activated_by {
            Some(referee) => {
                stats.activations += 1;
                if code.bonus_paid {
                    stats.total_bonus += code.bonus_amount;
                }
                stats.referred_accounts.push(referee);
            }
            None => stats.open_code = Some(code.code),
        }
    }
    Ok(stats)
}

/// Issues and redeems referral codes
pub struct ReferralCoordinator {
    db: Arc<LoyaltyDb>,
    config: ReferralConfig,
}

impl ReferralCoordinator {
    pub fn new(db: Arc<LoyaltyDb>, config: ReferralConfig) -> Self {
        Self { db, config }
    }

    /// Existing open code of the owner, or a fresh one
    pub async fn generate_code(&self, owner_id: &str, now: DateTime<Utc>) -> Result<ReferralCode> {
        let config = self.config.clone();
        let owner_id = owner_id.to_string();
        self.db
            .transact(move |conn| {
                let mut rng = rand::thread_rng();
                generate_in(conn, &config, &owner_id, &mut rng, now)
            })
            .await
    }

    pub async fn validate(&self, code: &str) -> Result<CodeValidation> {
        let code = code.to_string();
        self.db.execute(move |conn| validate_in(conn, &code)).await
    }

    pub async fn activate(&self, code: &str, referee_id: &str, now: DateTime<Utc>) -> Result<ReferralActivation> {
        let config = self.config.clone();
        let code = code.to_string();
        let referee_id = referee_id.to_string();
        let activation = self
            .db
            .transact(move |conn| activate_in(conn, &config, &code, &referee_id, now))
            .await?;

        info!(
            "Referral {} activated by {}: owner {} +{}, referee +{}",
            activation.code,
            activation.referee_id,
            activation.owner_id,
            activation.owner_credit.delta,
            activation.referee_credit.delta
        );
        Ok(activation)
    }

    pub async fn stats(&self, owner_id: &str) -> Result<ReferralStats> {
        let owner_id = owner_id.to_string();
        self.db.execute(move |conn| stats_in(conn, &owner_id)).await
    }
}
