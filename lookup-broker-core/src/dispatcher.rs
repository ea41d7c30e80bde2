//! Dispatcher
//!
//! The per-request entry point: sanitize, gate, log, fetch, normalize. It is
//! the only component a transport talks to; everything else is reached
//! through it.

use regex::Regex;
use std::sync::{Arc, LazyLock};
use thiserror::Error;
use tracing::instrument;

use crate::config::{BrokerConfig, PolicyConfig};
use crate::gate::{Decision, DenyReason, EntitlementGate, GateError, GateRequest};
use crate::ledger::{
    Account, AccountId, BalanceMode, BalanceOutcome, InsertOutcome, LedgerError, LedgerStats,
    LedgerStore, ListedIdentifier, NewAccount, RedeemOutcome,
};
use crate::lookup::LookupKind;
use crate::normalize::{CanonicalReport, Normalizer};
use crate::source::{FetchFailure, SourceAdapter};

/// Attachment file names are cut to this many characters before `.txt`.
pub const MAX_ATTACHMENT_STEM: usize = 120;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Gate(#[from] GateError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("empty query for {0}")]
    EmptyQuery(LookupKind),
}

pub type Result<T> = std::result::Result<T, DispatchError>;

/// One inbound lookup.
#[derive(Debug, Clone)]
pub struct LookupRequest {
    pub caller: AccountId,
    pub display_name: Option<String>,
    pub kind: LookupKind,
    pub query: String,
    pub is_privileged: bool,
    pub is_free_context: bool,
}

impl LookupRequest {
    pub fn new(caller: AccountId, kind: LookupKind, query: impl Into<String>) -> Self {
        Self {
            caller,
            display_name: None,
            kind,
            query: query.into(),
            is_privileged: false,
            is_free_context: false,
        }
    }

    pub fn privileged(mut self, yes: bool) -> Self {
        self.is_privileged = yes;
        self
    }

    pub fn free_context(mut self, yes: bool) -> Self {
        self.is_free_context = yes;
        self
    }

    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LookupOutcome {
    Denied(DenyReason),
    FetchFailed(FetchFailure),
    Report(CanonicalReport),
}

#[derive(Debug, Clone, PartialEq)]
pub enum OnboardOutcome {
    /// First contact. `referrer` is the referrer actually credited.
    Onboarded {
        account: Account,
        referrer: Option<AccountId>,
    },
    Returning(Account),
}

impl OnboardOutcome {
    pub fn account(&self) -> &Account {
        match self {
            OnboardOutcome::Onboarded { account, .. } | OnboardOutcome::Returning(account) => account,
        }
    }
}

/// How a rendered report reaches the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    Inline(String),
    Attachment { file_name: String, body: String },
}

pub struct Dispatcher {
    store: Arc<dyn LedgerStore>,
    gate: EntitlementGate,
    source: Arc<dyn SourceAdapter>,
    normalizer: Normalizer,
    policy: PolicyConfig,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        source: Arc<dyn SourceAdapter>,
        config: &BrokerConfig,
    ) -> Self {
        Self {
            gate: EntitlementGate::new(store.clone(), config.policy.owner_id),
            store,
            source,
            normalizer: Normalizer::new(config.branding.footer.clone()),
            policy: config.policy.clone(),
        }
    }

    pub fn policy(&self) -> &PolicyConfig {
        &self.policy
    }

    /// A request with privilege and free-context flags taken from policy.
    pub fn request_for(
        &self,
        caller: AccountId,
        kind: LookupKind,
        query: impl Into<String>,
        context: Option<i64>,
    ) -> LookupRequest {
        LookupRequest::new(caller, kind, query)
            .privileged(self.policy.is_privileged(caller))
            .free_context(self.policy.is_free_context(context))
    }

    // ── Onboarding ──

    #[instrument(skip(self, username, display_name))]
    pub async fn onboard(
        &self,
        caller: AccountId,
        username: Option<&str>,
        display_name: Option<&str>,
        start_param: Option<&str>,
    ) -> Result<OnboardOutcome> {
        if let Some(account) = self.store.get_account(caller).await? {
            self.store.touch(caller).await?;
            return Ok(OnboardOutcome::Returning(account));
        }

        let referrer = parse_referrer(caller, start_param);
        let mut new_account = NewAccount {
            id: caller,
            username: username.map(str::to_string),
            display_name: display_name.map(str::to_string),
            referrer_id: referrer,
            starting_balance: self.policy.starting_balance,
            referral_bonus: self.policy.referral_bonus,
        };

        let (inserted, credited) = match self.store.create_account(new_account.clone()).await {
            Ok(outcome) => (outcome, referrer),
            Err(LedgerError::UnknownReferrer(unknown)) => {
                tracing::info!(caller, referrer = unknown, "unknown referrer ignored");
                new_account.referrer_id = None;
                (self.store.create_account(new_account).await?, None)
            }
            Err(e) => return Err(e.into()),
        };

        let account = self
            .store
            .get_account(caller)
            .await?
            .ok_or(LedgerError::UnknownAccount(caller))?;

        // Lost a race with a concurrent first contact.
        if inserted == InsertOutcome::Duplicate {
            return Ok(OnboardOutcome::Returning(account));
        }
        tracing::info!(caller, referrer = ?credited, balance = account.balance, "caller onboarded");
        Ok(OnboardOutcome::Onboarded {
            account,
            referrer: credited,
        })
    }

    // ── Lookups ──

    #[instrument(
        skip(self, req),
        fields(caller = req.caller, kind = %req.kind)
    )]
    pub async fn lookup(&self, req: LookupRequest) -> Result<LookupOutcome> {
        let query = req.kind.sanitize_query(&req.query);
        if query.is_empty() {
            return Err(DispatchError::EmptyQuery(req.kind));
        }

        let decision = self
            .gate
            .authorize(GateRequest {
                caller: req.caller,
                query: &query,
                kind: req.kind,
                is_privileged: req.is_privileged,
                is_free_context: req.is_free_context,
            })
            .await?;

        let charged = match decision {
            Decision::Deny(reason) => return Ok(LookupOutcome::Denied(reason)),
            Decision::Allow { charged } => charged,
        };

        // A free context waives the charge, not the premium restriction.
        if req.kind.is_premium() && !req.is_privileged {
            tracing::debug!(reason = %DenyReason::PaidFeatureRequiresPurchase, "lookup denied");
            return Ok(LookupOutcome::Denied(DenyReason::PaidFeatureRequiresPurchase));
        }

        if let Err(e) = self.store.append_search_log(req.caller, req.kind, &query).await {
            tracing::warn!(error = %e, "search log write failed");
        }
        if let Err(e) = self.store.touch(req.caller).await {
            tracing::warn!(error = %e, "last-active update failed");
        }
        tracing::info!(
            target: "search",
            caller = req.caller,
            name = req.display_name.as_deref().unwrap_or(""),
            kind = %req.kind,
            query = %query,
            charged,
            "search"
        );

        let payload = match self.source.fetch(req.kind, &query).await {
            Ok(payload) => payload,
            Err(failure) => {
                tracing::warn!(failure = failure.as_str(), error = %failure, "fetch failed");
                return Ok(LookupOutcome::FetchFailed(failure));
            }
        };

        let report = self.normalizer.normalize(req.kind, &query, &payload);
        tracing::debug!(status = ?report.status, sections = report.sections.len(), "report ready");
        Ok(LookupOutcome::Report(report))
    }

    /// Classify free text and look it up. `None` when the text matches no kind.
    pub async fn lookup_input(
        &self,
        caller: AccountId,
        text: &str,
        context: Option<i64>,
    ) -> Result<Option<LookupOutcome>> {
        let Some((kind, query)) = classify_input(text) else {
            return Ok(None);
        };
        let req = self.request_for(caller, kind, query, context);
        self.lookup(req).await.map(Some)
    }

    /// Inline text, or an attachment when the rendering exceeds the inline limit.
    pub fn deliver(&self, report: &CanonicalReport) -> Delivery {
        let body = report.render_text();
        if body.chars().count() <= self.policy.report_inline_limit {
            return Delivery::Inline(body);
        }
        Delivery::Attachment {
            file_name: attachment_name(report.kind, &report.query),
            body,
        }
    }

    // ── Credits ──

    #[instrument(skip(self))]
    pub async fn redeem(&self, caller: AccountId, code: &str) -> Result<RedeemOutcome> {
        let code = normalize_code(code);
        let outcome = self.store.redeem_code(caller, &code).await?;
        tracing::info!(caller, ?outcome, "redeem");
        Ok(outcome)
    }

    pub async fn balance(&self, caller: AccountId) -> Result<Option<i64>> {
        Ok(self.store.get_account(caller).await?.map(|a| a.balance))
    }

    pub async fn account(&self, caller: AccountId) -> Result<Option<Account>> {
        Ok(self.store.get_account(caller).await?)
    }

    // ── Administration ──

    #[instrument(skip(self))]
    pub async fn adjust_balance(
        &self,
        target: AccountId,
        amount: i64,
        mode: BalanceMode,
    ) -> Result<BalanceOutcome> {
        let outcome = self.store.adjust_balance(target, amount, mode).await?;
        tracing::info!(?outcome, "balance adjusted");
        Ok(outcome)
    }

    #[instrument(skip(self))]
    pub async fn set_banned(&self, target: AccountId, banned: bool) -> Result<bool> {
        Ok(self.store.set_banned(target, banned).await?)
    }

    pub async fn protect(&self, identifier: &str, added_by: AccountId) -> Result<InsertOutcome> {
        Ok(self.store.add_protected(identifier.trim(), added_by).await?)
    }

    pub async fn unprotect(&self, identifier: &str) -> Result<bool> {
        Ok(self.store.remove_protected(identifier.trim()).await?)
    }

    pub async fn protected(&self) -> Result<Vec<ListedIdentifier>> {
        Ok(self.store.list_protected().await?)
    }

    pub async fn blacklist(
        &self,
        identifier: &str,
        category: Option<&str>,
        added_by: AccountId,
    ) -> Result<InsertOutcome> {
        Ok(self
            .store
            .add_blacklisted(identifier.trim(), category, added_by)
            .await?)
    }

    pub async fn unblacklist(&self, identifier: &str) -> Result<bool> {
        Ok(self.store.remove_blacklisted(identifier.trim()).await?)
    }

    pub async fn blacklisted(&self) -> Result<Vec<ListedIdentifier>> {
        Ok(self.store.list_blacklisted().await?)
    }

    pub async fn create_code(&self, code: &str, credits: i64) -> Result<InsertOutcome> {
        Ok(self.store.create_code(&normalize_code(code), credits).await?)
    }

    pub async fn stats(&self) -> Result<LedgerStats> {
        Ok(self.store.compute_stats().await?)
    }

    pub async fn account_ids(&self) -> Result<Vec<AccountId>> {
        Ok(self.store.list_account_ids().await?)
    }

    /// Release the source adapter's connections.
    pub async fn shutdown(&self) {
        self.source.shutdown().await;
        tracing::debug!("dispatcher shut down");
    }
}

/// A numeric start parameter names the referrer; self-referral is ignored.
fn parse_referrer(caller: AccountId, start_param: Option<&str>) -> Option<AccountId> {
    start_param
        .and_then(|p| p.trim().parse::<AccountId>().ok())
        .filter(|referrer| *referrer != caller)
}

/// Codes are case-insensitive.
fn normalize_code(code: &str) -> String {
    code.trim().to_uppercase()
}

/// Guess the lookup kind of free text. Checked in order: UPI handle, Pakistani
/// number, Indian number, IPv4 address, national ID.
pub fn classify_input(text: &str) -> Option<(LookupKind, String)> {
    let text = text.trim();
    if text.is_empty() || text.starts_with('/') {
        return None;
    }
    let all_digits = text.bytes().all(|b| b.is_ascii_digit());

    if text.matches('@').count() == 1 {
        return Some((LookupKind::Upi, text.to_string()));
    }
    if text.starts_with("+92") || (all_digits && text.len() == 12 && text.starts_with("92")) {
        return Some((LookupKind::Pakistan, LookupKind::Pakistan.sanitize_query(text)));
    }
    if text.starts_with("+91") || (all_digits && text.len() == 10) {
        return Some((LookupKind::Number, LookupKind::Number.sanitize_query(text)));
    }
    if IPV4_RE.is_match(text) {
        return Some((LookupKind::Ip, text.to_string()));
    }
    if all_digits && text.len() == 12 {
        return Some((LookupKind::Aadhaar, text.to_string()));
    }
    None
}

static IPV4_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}$").unwrap());

/// `<kind>_<query>` with anything outside `[A-Za-z0-9_.-]` replaced, capped,
/// plus `.txt`.
pub fn attachment_name(kind: LookupKind, query: &str) -> String {
    let stem: String = format!("{kind}_{query}")
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_ATTACHMENT_STEM)
        .collect();
    format!("{stem}.txt")
}
