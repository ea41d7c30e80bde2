//! SQLite ledger backed by a sqlx pool.
//!
//! All SQL is runtime-checked (`sqlx::query`, not `sqlx::query!`) so the crate
//! builds without a database. Multi-row operations run in one transaction whose
//! first statement is a write: SQLite then takes the writer lock up front and
//! concurrent transactions queue behind `busy_timeout` instead of racing.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use std::str::FromStr;

use super::*;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    id              INTEGER PRIMARY KEY,
    username        TEXT,
    display_name    TEXT,
    balance         INTEGER NOT NULL DEFAULT 0 CHECK (balance >= 0),
    referrer_id     INTEGER,
    referral_count  INTEGER NOT NULL DEFAULT 0,
    is_banned       BOOLEAN NOT NULL DEFAULT 0,
    created_at      TEXT NOT NULL,
    last_active     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS referrals (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    referrer_id     INTEGER NOT NULL REFERENCES accounts(id),
    referred_id     INTEGER NOT NULL UNIQUE REFERENCES accounts(id),
    created_at      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS protected_identifiers (
    identifier      TEXT PRIMARY KEY,
    added_by        INTEGER NOT NULL,
    added_at        TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS blacklisted_identifiers (
    identifier      TEXT PRIMARY KEY,
    category        TEXT,
    added_by        INTEGER NOT NULL,
    added_at        TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS search_logs (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id      INTEGER NOT NULL,
    kind            TEXT NOT NULL,
    query           TEXT NOT NULL,
    created_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS search_logs_account_idx ON search_logs (account_id);

CREATE TABLE IF NOT EXISTS redeem_codes (
    code            TEXT PRIMARY KEY,
    credits         INTEGER NOT NULL CHECK (credits >= 0),
    used_by         INTEGER,
    used_at         TEXT
);
"#;

const BUSY_TIMEOUT_SECS: u64 = 10;

// ── Row types ──

#[derive(sqlx::FromRow)]
struct AccountRow {
    id: i64,
    username: Option<String>,
    display_name: Option<String>,
    balance: i64,
    referrer_id: Option<i64>,
    referral_count: i64,
    is_banned: bool,
    created_at: DateTime<Utc>,
    last_active: DateTime<Utc>,
}

impl From<AccountRow> for Account {
    fn from(row: AccountRow) -> Self {
        Account {
            id: row.id,
            username: row.username,
            display_name: row.display_name,
            balance: row.balance,
            referrer_id: row.referrer_id,
            referral_count: row.referral_count,
            is_banned: row.is_banned,
            created_at: row.created_at,
            last_active: row.last_active,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ListedRow {
    identifier: String,
    category: Option<String>,
    added_by: i64,
    added_at: DateTime<Utc>,
}

impl From<ListedRow> for ListedIdentifier {
    fn from(row: ListedRow) -> Self {
        ListedIdentifier {
            identifier: row.identifier,
            category: row.category,
            added_by: row.added_by,
            added_at: row.added_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct SearchLogRow {
    account_id: i64,
    kind: String,
    query: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<SearchLogRow> for SearchLogEntry {
    type Error = LedgerError;

    fn try_from(row: SearchLogRow) -> Result<Self> {
        let kind = row
            .kind
            .parse::<LookupKind>()
            .map_err(|e| LedgerError::Corrupt(format!("search_logs.kind: {e}")))?;
        Ok(SearchLogEntry {
            account_id: row.account_id,
            kind,
            query: row.query,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct StatsRow {
    total_accounts: i64,
    active_accounts: i64,
    banned_accounts: i64,
    total_searches: i64,
    total_referrals: i64,
    total_balance: i64,
}

// ── SqliteLedger ──

pub struct SqliteLedger {
    pool: SqlitePool,
}

impl SqliteLedger {
    /// Connect to (creating if needed) the database at `url` and apply the schema.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(BUSY_TIMEOUT_SECS))
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        let ledger = Self { pool };
        ledger.init_schema().await?;
        tracing::debug!(url, max_connections, "ledger connected");
        Ok(ledger)
    }

    /// A private in-memory database. One connection, never recycled, since
    /// each SQLite memory connection is its own database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let ledger = Self { pool };
        ledger.init_schema().await?;
        Ok(ledger)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Idempotent: every statement is `IF NOT EXISTS`.
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn account_exists(&self, id: AccountId) -> Result<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM accounts WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }
}

async fn exists(tx: &mut Transaction<'_, Sqlite>, id: AccountId) -> Result<bool> {
    let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM accounts WHERE id = ?1")
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?;
    Ok(found.is_some())
}

#[async_trait]
impl LedgerStore for SqliteLedger {
    async fn create_account(&self, account: NewAccount) -> Result<InsertOutcome> {
        check_new_account(&account)?;
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO accounts (id, username, display_name, balance, referrer_id,
                                  referral_count, is_banned, created_at, last_active)
            VALUES (?1, ?2, ?3, ?4, ?5, 0, 0, ?6, ?6)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(account.id)
        .bind(&account.username)
        .bind(&account.display_name)
        .bind(account.starting_balance)
        .bind(account.referrer_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            return Ok(InsertOutcome::Duplicate);
        }

        if let Some(referrer_id) = account.referrer_id {
            let bumped = sqlx::query(
                r#"
                UPDATE accounts
                SET referral_count = referral_count + 1,
                    balance = balance + ?1
                WHERE id = ?2 AND balance <= ?3 - ?1
                "#,
            )
            .bind(account.referral_bonus)
            .bind(referrer_id)
            .bind(i64::MAX)
            .execute(&mut *tx)
            .await?;

            // Dropping `tx` rolls back the account insert.
            if bumped.rows_affected() == 0 {
                return Err(if exists(&mut tx, referrer_id).await? {
                    LedgerError::Overflow(referrer_id)
                } else {
                    LedgerError::UnknownReferrer(referrer_id)
                });
            }

            sqlx::query(
                "INSERT INTO referrals (referrer_id, referred_id, created_at) VALUES (?1, ?2, ?3)",
            )
            .bind(referrer_id)
            .bind(account.id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(InsertOutcome::Created)
    }

    async fn get_account(&self, id: AccountId) -> Result<Option<Account>> {
        let row = sqlx::query_as::<_, AccountRow>(
            r#"
            SELECT id, username, display_name, balance, referrer_id,
                   referral_count, is_banned, created_at, last_active
            FROM accounts
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Account::from))
    }

    async fn list_account_ids(&self) -> Result<Vec<AccountId>> {
        let ids = sqlx::query_scalar::<_, i64>("SELECT id FROM accounts ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    async fn adjust_balance(
        &self,
        id: AccountId,
        amount: i64,
        mode: BalanceMode,
    ) -> Result<BalanceOutcome> {
        check_amount(amount)?;
        let sql = match mode {
            BalanceMode::Add => {
                "UPDATE accounts SET balance = balance + ?1 WHERE id = ?2 AND balance <= ?3 - ?1 RETURNING balance"
            }
            BalanceMode::Deduct => {
                "UPDATE accounts SET balance = balance - ?1 WHERE id = ?2 AND balance >= ?1 RETURNING balance"
            }
            BalanceMode::Set => "UPDATE accounts SET balance = ?1 WHERE id = ?2 RETURNING balance",
        };

        // SQLite silently widens an overflowing sum to REAL, hence the `?3` bound.
        let mut query = sqlx::query_scalar::<_, i64>(sql).bind(amount).bind(id);
        if mode == BalanceMode::Add {
            query = query.bind(i64::MAX);
        }
        let balance = query.fetch_optional(&self.pool).await?;

        if let Some(balance) = balance {
            return Ok(BalanceOutcome::Applied(balance));
        }
        // A set only misses on an unknown row; this read is for reporting only.
        if mode == BalanceMode::Set || !self.account_exists(id).await? {
            return Ok(BalanceOutcome::UnknownAccount);
        }
        match mode {
            BalanceMode::Deduct => Ok(BalanceOutcome::Insufficient),
            _ => Err(LedgerError::Overflow(id)),
        }
    }

    async fn set_banned(&self, id: AccountId, banned: bool) -> Result<bool> {
        let result = sqlx::query("UPDATE accounts SET is_banned = ?1 WHERE id = ?2")
            .bind(banned)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn touch(&self, id: AccountId) -> Result<bool> {
        let result = sqlx::query("UPDATE accounts SET last_active = ?1 WHERE id = ?2")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn referrals_of(&self, referrer_id: AccountId) -> Result<Vec<ReferralRecord>> {
        let rows = sqlx::query_as::<_, (i64, i64, DateTime<Utc>)>(
            r#"
            SELECT referrer_id, referred_id, created_at
            FROM referrals
            WHERE referrer_id = ?1
            ORDER BY id
            "#,
        )
        .bind(referrer_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(referrer_id, referred_id, created_at)| ReferralRecord {
                referrer_id,
                referred_id,
                created_at,
            })
            .collect())
    }

    // ── Access lists ──

    async fn add_protected(
        &self,
        identifier: &str,
        added_by: AccountId,
    ) -> Result<InsertOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO protected_identifiers (identifier, added_by, added_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (identifier) DO NOTHING
            "#,
        )
        .bind(identifier)
        .bind(added_by)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(insert_outcome(result.rows_affected()))
    }

    async fn remove_protected(&self, identifier: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM protected_identifiers WHERE identifier = ?1")
            .bind(identifier)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn is_protected(&self, identifier: &str) -> Result<bool> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM protected_identifiers WHERE identifier = ?1")
                .bind(identifier)
                .fetch_optional(&self.pool)
                .await?;
        Ok(found.is_some())
    }

    async fn list_protected(&self) -> Result<Vec<ListedIdentifier>> {
        let rows = sqlx::query_as::<_, ListedRow>(
            r#"
            SELECT identifier, NULL AS category, added_by, added_at
            FROM protected_identifiers
            ORDER BY identifier
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ListedIdentifier::from).collect())
    }

    async fn add_blacklisted(
        &self,
        identifier: &str,
        category: Option<&str>,
        added_by: AccountId,
    ) -> Result<InsertOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO blacklisted_identifiers (identifier, category, added_by, added_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (identifier) DO NOTHING
            "#,
        )
        .bind(identifier)
        .bind(category)
        .bind(added_by)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(insert_outcome(result.rows_affected()))
    }

    async fn remove_blacklisted(&self, identifier: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM blacklisted_identifiers WHERE identifier = ?1")
            .bind(identifier)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn is_blacklisted(&self, identifier: &str) -> Result<bool> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM blacklisted_identifiers WHERE identifier = ?1")
                .bind(identifier)
                .fetch_optional(&self.pool)
                .await?;
        Ok(found.is_some())
    }

    async fn list_blacklisted(&self) -> Result<Vec<ListedIdentifier>> {
        let rows = sqlx::query_as::<_, ListedRow>(
            r#"
            SELECT identifier, category, added_by, added_at
            FROM blacklisted_identifiers
            ORDER BY identifier
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ListedIdentifier::from).collect())
    }

    // ── Redeem codes ──

    async fn create_code(&self, code: &str, credits: i64) -> Result<InsertOutcome> {
        check_amount(credits)?;
        let result = sqlx::query(
            "INSERT INTO redeem_codes (code, credits) VALUES (?1, ?2) ON CONFLICT (code) DO NOTHING",
        )
        .bind(code)
        .bind(credits)
        .execute(&self.pool)
        .await?;
        Ok(insert_outcome(result.rows_affected()))
    }

    async fn get_code(&self, code: &str) -> Result<Option<RedeemableCode>> {
        let row = sqlx::query_as::<_, (String, i64, Option<i64>, Option<DateTime<Utc>>)>(
            "SELECT code, credits, used_by, used_at FROM redeem_codes WHERE code = ?1",
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(code, credits, used_by, used_at)| RedeemableCode {
            code,
            credits,
            used_by,
            used_at,
        }))
    }

    async fn redeem_code(&self, id: AccountId, code: &str) -> Result<RedeemOutcome> {
        let mut tx = self.pool.begin().await?;

        // Claim first: the conditional UPDATE is both the validity check and the mark.
        let claimed: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE redeem_codes
            SET used_by = ?1, used_at = ?2
            WHERE code = ?3 AND used_by IS NULL
            RETURNING credits
            "#,
        )
        .bind(id)
        .bind(Utc::now())
        .bind(code)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(credits) = claimed else {
            let exists: Option<i64> =
                sqlx::query_scalar("SELECT 1 FROM redeem_codes WHERE code = ?1")
                    .bind(code)
                    .fetch_optional(&mut *tx)
                    .await?;
            return Ok(match exists {
                Some(_) => RedeemOutcome::AlreadyUsed,
                None => RedeemOutcome::InvalidCode,
            });
        };

        let balance: Option<i64> = sqlx::query_scalar(
            "UPDATE accounts SET balance = balance + ?1 WHERE id = ?2 AND balance <= ?3 - ?1 RETURNING balance",
        )
        .bind(credits)
        .bind(id)
        .bind(i64::MAX)
        .fetch_optional(&mut *tx)
        .await?;

        // Dropping `tx` releases the claim.
        let Some(balance) = balance else {
            return Err(if exists(&mut tx, id).await? {
                LedgerError::Overflow(id)
            } else {
                LedgerError::UnknownAccount(id)
            });
        };

        tx.commit().await?;
        Ok(RedeemOutcome::Redeemed { credits, balance })
    }

    // ── Audit ──

    async fn append_search_log(
        &self,
        id: AccountId,
        kind: LookupKind,
        query: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO search_logs (account_id, kind, query, created_at) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(id)
        .bind(kind.as_str())
        .bind(query)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn search_logs_for(&self, id: AccountId) -> Result<Vec<SearchLogEntry>> {
        let rows = sqlx::query_as::<_, SearchLogRow>(
            r#"
            SELECT account_id, kind, query, created_at
            FROM search_logs
            WHERE account_id = ?1
            ORDER BY id
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(SearchLogEntry::try_from).collect()
    }

    async fn compute_stats(&self) -> Result<LedgerStats> {
        let cutoff = Utc::now() - Duration::hours(ACTIVE_WINDOW_HOURS);
        let row = sqlx::query_as::<_, StatsRow>(
            r#"
            SELECT
                (SELECT COUNT(*) FROM accounts) AS total_accounts,
                (SELECT COUNT(*) FROM accounts
                  WHERE is_banned = 0 AND last_active >= ?1) AS active_accounts,
                (SELECT COUNT(*) FROM accounts WHERE is_banned = 1) AS banned_accounts,
                (SELECT COUNT(*) FROM search_logs) AS total_searches,
                (SELECT COUNT(*) FROM referrals) AS total_referrals,
                (SELECT COALESCE(SUM(balance), 0) FROM accounts) AS total_balance
            "#,
        )
        .bind(cutoff)
        .fetch_one(&self.pool)
        .await?;

        Ok(LedgerStats {
            total_accounts: row.total_accounts,
            active_accounts: row.active_accounts,
            banned_accounts: row.banned_accounts,
            total_searches: row.total_searches,
            total_referrals: row.total_referrals,
            total_balance: row.total_balance,
        })
    }
}

fn insert_outcome(rows_affected: u64) -> InsertOutcome {
    if rows_affected == 0 {
        InsertOutcome::Duplicate
    } else {
        InsertOutcome::Created
    }
}
