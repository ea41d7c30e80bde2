//! Credit ledger
//!
//! Durable account state behind a single [`LedgerStore`] trait: balances, bans,
//! protected and blacklisted identifiers, one-time redeem codes and the search
//! audit log. The gate and dispatcher operate exclusively through the trait,
//! so the SQLite backend and the in-memory backend are interchangeable.
//!
//! Every operation that touches more than one row (onboarding with a referral,
//! code redemption) is atomic: either every row changes or none does.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryLedger;
pub use sqlite::SqliteLedger;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::lookup::LookupKind;

/// Stable external caller id.
pub type AccountId = i64;

/// Accounts seen within this window count as active in [`LedgerStats`].
pub const ACTIVE_WINDOW_HOURS: i64 = 24;

// ── Records ──

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub username: Option<String>,
    pub display_name: Option<String>,
    pub balance: i64,
    pub referrer_id: Option<AccountId>,
    pub referral_count: i64,
    pub is_banned: bool,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

/// Input for [`LedgerStore::create_account`].
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub id: AccountId,
    pub username: Option<String>,
    pub display_name: Option<String>,
    pub referrer_id: Option<AccountId>,
    pub starting_balance: i64,
    /// Credited to the referrer, if any, in the same atomic unit.
    pub referral_bonus: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferralRecord {
    pub referrer_id: AccountId,
    pub referred_id: AccountId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedeemableCode {
    pub code: String,
    pub credits: i64,
    pub used_by: Option<AccountId>,
    pub used_at: Option<DateTime<Utc>>,
}

/// A protected or blacklisted query string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListedIdentifier {
    pub identifier: String,
    /// Free-form category; only meaningful on the blacklist.
    pub category: Option<String>,
    pub added_by: AccountId,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchLogEntry {
    pub account_id: AccountId,
    pub kind: LookupKind,
    pub query: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerStats {
    pub total_accounts: i64,
    pub active_accounts: i64,
    pub banned_accounts: i64,
    pub total_searches: i64,
    pub total_referrals: i64,
    pub total_balance: i64,
}

// ── Outcomes ──

/// Result of inserting a uniquely-keyed row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Created,
    Duplicate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceMode {
    Add,
    Deduct,
    Set,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalanceOutcome {
    /// The change was applied; carries the new balance.
    Applied(i64),
    /// A deduct would have gone negative. Nothing changed.
    Insufficient,
    UnknownAccount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedeemOutcome {
    Redeemed { credits: i64, balance: i64 },
    InvalidCode,
    AlreadyUsed,
}

// ── Errors ──

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("referrer {0} does not exist")]
    UnknownReferrer(AccountId),

    #[error("account {0} cannot refer itself")]
    SelfReferral(AccountId),

    #[error("account {0} does not exist")]
    UnknownAccount(AccountId),

    #[error("invalid amount {0}: amounts must be non-negative")]
    InvalidAmount(i64),

    #[error("crediting account {0} would overflow its balance")]
    Overflow(AccountId),

    #[error("ledger lock poisoned: {0}")]
    Poisoned(String),

    #[error("corrupt ledger row: {0}")]
    Corrupt(String),
}

pub type Result<T> = std::result::Result<T, LedgerError>;

// ── Store trait ──

/// Persistence trait for all ledger state.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    // ── Accounts ──

    /// Create an account exactly once. With a referrer, the referral record
    /// and the referrer's count/bonus bump commit together with the account.
    async fn create_account(&self, account: NewAccount) -> Result<InsertOutcome>;
    async fn get_account(&self, id: AccountId) -> Result<Option<Account>>;
    async fn list_account_ids(&self) -> Result<Vec<AccountId>>;

    /// Adjust a balance. `Deduct` is a single check-and-debit: it never
    /// leaves the balance negative, even under concurrent callers.
    async fn adjust_balance(
        &self,
        id: AccountId,
        amount: i64,
        mode: BalanceMode,
    ) -> Result<BalanceOutcome>;

    /// Returns false when the account does not exist.
    async fn set_banned(&self, id: AccountId, banned: bool) -> Result<bool>;

    /// Refresh last-active. Returns false when the account does not exist.
    async fn touch(&self, id: AccountId) -> Result<bool>;

    async fn referrals_of(&self, referrer_id: AccountId) -> Result<Vec<ReferralRecord>>;

    // ── Access lists ──

    async fn add_protected(&self, identifier: &str, added_by: AccountId)
        -> Result<InsertOutcome>;
    async fn remove_protected(&self, identifier: &str) -> Result<bool>;
    async fn is_protected(&self, identifier: &str) -> Result<bool>;
    async fn list_protected(&self) -> Result<Vec<ListedIdentifier>>;

    async fn add_blacklisted(
        &self,
        identifier: &str,
        category: Option<&str>,
        added_by: AccountId,
    ) -> Result<InsertOutcome>;
    async fn remove_blacklisted(&self, identifier: &str) -> Result<bool>;
    async fn is_blacklisted(&self, identifier: &str) -> Result<bool>;
    async fn list_blacklisted(&self) -> Result<Vec<ListedIdentifier>>;

    // ── Redeem codes ──

    async fn create_code(&self, code: &str, credits: i64) -> Result<InsertOutcome>;
    async fn get_code(&self, code: &str) -> Result<Option<RedeemableCode>>;

    /// Check-and-mark the code and credit the account in one atomic unit.
    /// Redeeming for an unknown account leaves the code unconsumed.
    async fn redeem_code(&self, id: AccountId, code: &str) -> Result<RedeemOutcome>;

    // ── Audit ──

    async fn append_search_log(&self, id: AccountId, kind: LookupKind, query: &str)
        -> Result<()>;
    async fn search_logs_for(&self, id: AccountId) -> Result<Vec<SearchLogEntry>>;

    async fn compute_stats(&self) -> Result<LedgerStats>;
}

fn check_new_account(account: &NewAccount) -> Result<()> {
    check_amount(account.starting_balance)?;
    check_amount(account.referral_bonus)?;
    if account.referrer_id == Some(account.id) {
        return Err(LedgerError::SelfReferral(account.id));
    }
    Ok(())
}

fn check_amount(amount: i64) -> Result<()> {
    if amount < 0 {
        return Err(LedgerError::InvalidAmount(amount));
    }
    Ok(())
}
