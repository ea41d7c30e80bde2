//! In-memory ledger for tests and dry runs.
//!
//! One `RwLock` guards every table and each mutating operation holds the write
//! guard for its whole body, so multi-row changes are serialized and atomic.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::*;

#[derive(Default)]
struct Tables {
    accounts: BTreeMap<AccountId, Account>,
    referrals: Vec<ReferralRecord>,
    protected: BTreeMap<String, ListedIdentifier>,
    blacklisted: BTreeMap<String, ListedIdentifier>,
    codes: HashMap<String, RedeemableCode>,
    search_logs: Vec<SearchLogEntry>,
}

#[derive(Default)]
pub struct MemoryLedger {
    inner: RwLock<Tables>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>> {
        self.inner
            .read()
            .map_err(|e| LedgerError::Poisoned(e.to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>> {
        self.inner
            .write()
            .map_err(|e| LedgerError::Poisoned(e.to_string()))
    }
}

/// The balance after adding `amount`, or `Overflow` past `i64::MAX`.
fn credit(account: &Account, amount: i64) -> Result<i64> {
    account
        .balance
        .checked_add(amount)
        .ok_or(LedgerError::Overflow(account.id))
}

fn listed(identifier: &str, category: Option<&str>, added_by: AccountId) -> ListedIdentifier {
    ListedIdentifier {
        identifier: identifier.to_string(),
        category: category.map(str::to_string),
        added_by,
        added_at: Utc::now(),
    }
}

#[async_trait]
impl LedgerStore for MemoryLedger {
    async fn create_account(&self, account: NewAccount) -> Result<InsertOutcome> {
        check_new_account(&account)?;
        let mut tables = self.write()?;

        if tables.accounts.contains_key(&account.id) {
            return Ok(InsertOutcome::Duplicate);
        }
        // Validate everything before the first write so a failure changes nothing.
        if let Some(referrer_id) = account.referrer_id {
            let referrer = tables
                .accounts
                .get(&referrer_id)
                .ok_or(LedgerError::UnknownReferrer(referrer_id))?;
            credit(referrer, account.referral_bonus)?;
        }

        let now = Utc::now();
        tables.accounts.insert(
            account.id,
            Account {
                id: account.id,
                username: account.username,
                display_name: account.display_name,
                balance: account.starting_balance,
                referrer_id: account.referrer_id,
                referral_count: 0,
                is_banned: false,
                created_at: now,
                last_active: now,
            },
        );

        if let Some(referrer_id) = account.referrer_id {
            tables.referrals.push(ReferralRecord {
                referrer_id,
                referred_id: account.id,
                created_at: now,
            });
            let referrer = tables
                .accounts
                .get_mut(&referrer_id)
                .ok_or(LedgerError::UnknownReferrer(referrer_id))?;
            referrer.referral_count += 1;
            referrer.balance = credit(referrer, account.referral_bonus)?;
        }

        Ok(InsertOutcome::Created)
    }

    async fn get_account(&self, id: AccountId) -> Result<Option<Account>> {
        Ok(self.read()?.accounts.get(&id).cloned())
    }

    async fn list_account_ids(&self) -> Result<Vec<AccountId>> {
        Ok(self.read()?.accounts.keys().copied().collect())
    }

    async fn adjust_balance(
        &self,
        id: AccountId,
        amount: i64,
        mode: BalanceMode,
    ) -> Result<BalanceOutcome> {
        check_amount(amount)?;
        let mut tables = self.write()?;
        let Some(account) = tables.accounts.get_mut(&id) else {
            return Ok(BalanceOutcome::UnknownAccount);
        };

        match mode {
            BalanceMode::Add => account.balance = credit(account, amount)?,
            BalanceMode::Deduct => {
                if account.balance < amount {
                    return Ok(BalanceOutcome::Insufficient);
                }
                account.balance -= amount;
            }
            BalanceMode::Set => account.balance = amount,
        }
        Ok(BalanceOutcome::Applied(account.balance))
    }

    async fn set_banned(&self, id: AccountId, banned: bool) -> Result<bool> {
        let mut tables = self.write()?;
        match tables.accounts.get_mut(&id) {
            Some(account) => {
                account.is_banned = banned;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn touch(&self, id: AccountId) -> Result<bool> {
        let mut tables = self.write()?;
        match tables.accounts.get_mut(&id) {
            Some(account) => {
                account.last_active = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn referrals_of(&self, referrer_id: AccountId) -> Result<Vec<ReferralRecord>> {
        Ok(self
            .read()?
            .referrals
            .iter()
            .filter(|r| r.referrer_id == referrer_id)
            .cloned()
            .collect())
    }

    async fn add_protected(
        &self,
        identifier: &str,
        added_by: AccountId,
    ) -> Result<InsertOutcome> {
        let mut tables = self.write()?;
        if tables.protected.contains_key(identifier) {
            return Ok(InsertOutcome::Duplicate);
        }
        tables
            .protected
            .insert(identifier.to_string(), listed(identifier, None, added_by));
        Ok(InsertOutcome::Created)
    }

    async fn remove_protected(&self, identifier: &str) -> Result<bool> {
        Ok(self.write()?.protected.remove(identifier).is_some())
    }

    async fn is_protected(&self, identifier: &str) -> Result<bool> {
        Ok(self.read()?.protected.contains_key(identifier))
    }

    async fn list_protected(&self) -> Result<Vec<ListedIdentifier>> {
        Ok(self.read()?.protected.values().cloned().collect())
    }

    async fn add_blacklisted(
        &self,
        identifier: &str,
        category: Option<&str>,
        added_by: AccountId,
    ) -> Result<InsertOutcome> {
        let mut tables = self.write()?;
        if tables.blacklisted.contains_key(identifier) {
            return Ok(InsertOutcome::Duplicate);
        }
        tables
            .blacklisted
            .insert(identifier.to_string(), listed(identifier, category, added_by));
        Ok(InsertOutcome::Created)
    }

    async fn remove_blacklisted(&self, identifier: &str) -> Result<bool> {
        Ok(self.write()?.blacklisted.remove(identifier).is_some())
    }

    async fn is_blacklisted(&self, identifier: &str) -> Result<bool> {
        Ok(self.read()?.blacklisted.contains_key(identifier))
    }

    async fn list_blacklisted(&self) -> Result<Vec<ListedIdentifier>> {
        Ok(self.read()?.blacklisted.values().cloned().collect())
    }

    async fn create_code(&self, code: &str, credits: i64) -> Result<InsertOutcome> {
        check_amount(credits)?;
        let mut tables = self.write()?;
        if tables.codes.contains_key(code) {
            return Ok(InsertOutcome::Duplicate);
        }
        tables.codes.insert(
            code.to_string(),
            RedeemableCode {
                code: code.to_string(),
                credits,
                used_by: None,
                used_at: None,
            },
        );
        Ok(InsertOutcome::Created)
    }

    async fn get_code(&self, code: &str) -> Result<Option<RedeemableCode>> {
        Ok(self.read()?.codes.get(code).cloned())
    }

    async fn redeem_code(&self, id: AccountId, code: &str) -> Result<RedeemOutcome> {
        let mut tables = self.write()?;
        let credits = match tables.codes.get(code) {
            None => return Ok(RedeemOutcome::InvalidCode),
            Some(c) if c.used_by.is_some() => return Ok(RedeemOutcome::AlreadyUsed),
            Some(c) => c.credits,
        };

        let account = tables
            .accounts
            .get_mut(&id)
            .ok_or(LedgerError::UnknownAccount(id))?;
        account.balance = credit(account, credits)?;
        let balance = account.balance;

        if let Some(c) = tables.codes.get_mut(code) {
            c.used_by = Some(id);
            c.used_at = Some(Utc::now());
        }
        Ok(RedeemOutcome::Redeemed { credits, balance })
    }

    async fn append_search_log(
        &self,
        id: AccountId,
        kind: LookupKind,
        query: &str,
    ) -> Result<()> {
        self.write()?.search_logs.push(SearchLogEntry {
            account_id: id,
            kind,
            query: query.to_string(),
            created_at: Utc::now(),
        });
        Ok(())
    }

    async fn search_logs_for(&self, id: AccountId) -> Result<Vec<SearchLogEntry>> {
        Ok(self
            .read()?
            .search_logs
            .iter()
            .filter(|e| e.account_id == id)
            .cloned()
            .collect())
    }

    async fn compute_stats(&self) -> Result<LedgerStats> {
        let tables = self.read()?;
        let cutoff = Utc::now() - Duration::hours(ACTIVE_WINDOW_HOURS);
        let accounts = tables.accounts.values();
        Ok(LedgerStats {
            total_accounts: tables.accounts.len() as i64,
            active_accounts: accounts
                .clone()
                .filter(|a| !a.is_banned && a.last_active >= cutoff)
                .count() as i64,
            banned_accounts: accounts.clone().filter(|a| a.is_banned).count() as i64,
            total_searches: tables.search_logs.len() as i64,
            total_referrals: tables.referrals.len() as i64,
            total_balance: accounts.map(|a| a.balance).fold(0, i64::saturating_add),
        })
    }
}
