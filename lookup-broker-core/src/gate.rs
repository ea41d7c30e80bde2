//! Entitlement gate
//!
//! Decides whether a caller may run a lookup and applies the one-credit debit
//! in the same step. Checks run in a fixed order and stop at the first match:
//!
//! 1. banned caller
//! 2. blacklisted query
//! 3. protected query (unless the caller is the super-identity)
//! 4. privileged caller or free context: allow, no charge
//! 5. premium kind: deny, balance is never consulted
//! 6. + 7. check-and-debit one credit as a single ledger operation

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;

use crate::ledger::{AccountId, BalanceMode, BalanceOutcome, LedgerError, LedgerStore};
use crate::lookup::LookupKind;

/// Credits charged per paid lookup.
pub const LOOKUP_COST: i64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DenyReason {
    Banned,
    BlacklistedQuery,
    ProtectedQuery,
    InsufficientBalance,
    PaidFeatureRequiresPurchase,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::Banned => "banned",
            DenyReason::BlacklistedQuery => "blacklisted-query",
            DenyReason::ProtectedQuery => "protected-query",
            DenyReason::InsufficientBalance => "insufficient-balance",
            DenyReason::PaidFeatureRequiresPurchase => "paid-feature-requires-purchase",
        }
    }

    /// Text shown to the caller.
    pub fn message(&self) -> &'static str {
        match self {
            DenyReason::Banned => "You are banned from using this service.",
            DenyReason::BlacklistedQuery => "This number/query is blacklisted and cannot be searched.",
            DenyReason::ProtectedQuery => "This number/query is protected and cannot be searched.",
            DenyReason::InsufficientBalance => {
                "Insufficient credits. Refer friends or redeem a code to top up."
            }
            DenyReason::PaidFeatureRequiresPurchase => {
                "This is a paid feature. Contact the owner to purchase access."
            }
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The lookup may proceed; `charged` is true when a credit was debited.
    Allow { charged: bool },
    Deny(DenyReason),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow { .. })
    }
}

#[derive(Debug, Error)]
pub enum GateError {
    #[error("ledger unavailable: {0}")]
    Storage(#[from] LedgerError),
}

/// One lookup attempt as seen by the gate.
#[derive(Debug, Clone, Copy)]
pub struct GateRequest<'a> {
    pub caller: AccountId,
    pub query: &'a str,
    pub kind: LookupKind,
    pub is_privileged: bool,
    pub is_free_context: bool,
}

pub struct EntitlementGate {
    store: Arc<dyn LedgerStore>,
    super_identity: Option<AccountId>,
}

impl EntitlementGate {
    pub fn new(store: Arc<dyn LedgerStore>, super_identity: Option<AccountId>) -> Self {
        Self {
            store,
            super_identity,
        }
    }

    pub fn super_identity(&self) -> Option<AccountId> {
        self.super_identity
    }

    /// Run the checks. `Allow { charged: true }` means the debit is already
    /// committed; a store failure is an error, never an allow.
    #[instrument(
        skip(self, req),
        fields(caller = req.caller, kind = %req.kind, privileged = req.is_privileged, free = req.is_free_context)
    )]
    pub async fn authorize(&self, req: GateRequest<'_>) -> Result<Decision, GateError> {
        let decision = self.decide(&req).await?;
        match decision {
            Decision::Allow { charged } => tracing::debug!(charged, "lookup allowed"),
            Decision::Deny(reason) => tracing::debug!(%reason, "lookup denied"),
        }
        Ok(decision)
    }

    async fn decide(&self, req: &GateRequest<'_>) -> Result<Decision, GateError> {
        let account = self.store.get_account(req.caller).await?;
        if account.as_ref().is_some_and(|a| a.is_banned) {
            return Ok(Decision::Deny(DenyReason::Banned));
        }

        if self.store.is_blacklisted(req.query).await? {
            return Ok(Decision::Deny(DenyReason::BlacklistedQuery));
        }

        if self.super_identity != Some(req.caller) && self.store.is_protected(req.query).await? {
            return Ok(Decision::Deny(DenyReason::ProtectedQuery));
        }

        if req.is_privileged || req.is_free_context {
            return Ok(Decision::Allow { charged: false });
        }

        if req.kind.is_premium() {
            return Ok(Decision::Deny(DenyReason::PaidFeatureRequiresPurchase));
        }

        // Unknown accounts read as balance 0.
        let outcome = self
            .store
            .adjust_balance(req.caller, LOOKUP_COST, BalanceMode::Deduct)
            .await?;
        Ok(match outcome {
            BalanceOutcome::Applied(_) => Decision::Allow { charged: true },
            BalanceOutcome::Insufficient | BalanceOutcome::UnknownAccount => {
                Decision::Deny(DenyReason::InsufficientBalance)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{MemoryLedger, NewAccount};

    const OWNER: AccountId = 1;

    async fn gate_with(balance: i64) -> (EntitlementGate, Arc<MemoryLedger>) {
        let store = Arc::new(MemoryLedger::new());
        store
            .create_account(NewAccount {
                id: 7,
                username: None,
                display_name: None,
                referrer_id: None,
                starting_balance: balance,
                referral_bonus: 0,
            })
            .await
            .unwrap();
        (EntitlementGate::new(store.clone(), Some(OWNER)), store)
    }

    fn request(caller: AccountId, query: &str, kind: LookupKind) -> GateRequest<'_> {
        GateRequest {
            caller,
            query,
            kind,
            is_privileged: caller == OWNER,
            is_free_context: false,
        }
    }

    async fn balance(store: &MemoryLedger, id: AccountId) -> i64 {
        store.get_account(id).await.unwrap().unwrap().balance
    }

    #[tokio::test]
    async fn paid_lookup_debits_one_credit() {
        let (gate, store) = gate_with(2).await;
        let decision = gate
            .authorize(request(7, "9990001111", LookupKind::Number))
            .await
            .unwrap();
        assert_eq!(decision, Decision::Allow { charged: true });
        assert_eq!(balance(&store, 7).await, 1);
    }

    #[tokio::test]
    async fn zero_balance_is_denied_without_mutation() {
        let (gate, store) = gate_with(0).await;
        let decision = gate
            .authorize(request(7, "9990001111", LookupKind::Number))
            .await
            .unwrap();
        assert_eq!(decision, Decision::Deny(DenyReason::InsufficientBalance));
        assert_eq!(balance(&store, 7).await, 0);
    }

    #[tokio::test]
    async fn unknown_caller_reads_as_empty_balance() {
        let (gate, _) = gate_with(5).await;
        let decision = gate
            .authorize(request(99, "9990001111", LookupKind::Number))
            .await
            .unwrap();
        assert_eq!(decision, Decision::Deny(DenyReason::InsufficientBalance));
    }

    #[tokio::test]
    async fn ban_wins_over_everything() {
        let (gate, store) = gate_with(5).await;
        store.set_banned(7, true).await.unwrap();
        store.add_blacklisted("9990001111", None, OWNER).await.unwrap();

        let decision = gate
            .authorize(request(7, "9990001111", LookupKind::Number))
            .await
            .unwrap();
        assert_eq!(decision, Decision::Deny(DenyReason::Banned));
        assert_eq!(balance(&store, 7).await, 5);
    }

    #[tokio::test]
    async fn blacklist_beats_protection() {
        let (gate, store) = gate_with(5).await;
        store.add_blacklisted("9990001111", None, OWNER).await.unwrap();
        store.add_protected("9990001111", OWNER).await.unwrap();

        let decision = gate
            .authorize(request(7, "9990001111", LookupKind::Number))
            .await
            .unwrap();
        assert_eq!(decision, Decision::Deny(DenyReason::BlacklistedQuery));
    }

    #[tokio::test]
    async fn blacklist_applies_to_the_super_identity_too() {
        let (gate, store) = gate_with(5).await;
        store.add_blacklisted("9990001111", None, OWNER).await.unwrap();

        let decision = gate
            .authorize(request(OWNER, "9990001111", LookupKind::Number))
            .await
            .unwrap();
        assert_eq!(decision, Decision::Deny(DenyReason::BlacklistedQuery));
    }

    #[tokio::test]
    async fn protection_exempts_only_the_super_identity() {
        let (gate, store) = gate_with(5).await;
        store.add_protected("9990001111", OWNER).await.unwrap();

        let other = gate
            .authorize(request(7, "9990001111", LookupKind::Number))
            .await
            .unwrap();
        assert_eq!(other, Decision::Deny(DenyReason::ProtectedQuery));

        let owner = gate
            .authorize(request(OWNER, "9990001111", LookupKind::Number))
            .await
            .unwrap();
        assert_eq!(owner, Decision::Allow { charged: false });
    }

    #[tokio::test]
    async fn premium_kind_denied_regardless_of_balance() {
        let (gate, store) = gate_with(100).await;
        let decision = gate
            .authorize(request(7, "9990001111", LookupKind::CallHistory))
            .await
            .unwrap();
        assert_eq!(decision, Decision::Deny(DenyReason::PaidFeatureRequiresPurchase));
        assert_eq!(balance(&store, 7).await, 100);
    }

    #[tokio::test]
    async fn free_context_allows_without_charge() {
        let (gate, store) = gate_with(0).await;
        let decision = gate
            .authorize(GateRequest {
                is_free_context: true,
                ..request(7, "9990001111", LookupKind::Number)
            })
            .await
            .unwrap();
        assert_eq!(decision, Decision::Allow { charged: false });
        assert_eq!(balance(&store, 7).await, 0);
    }

    #[test]
    fn deny_reasons_serialize_as_their_labels() {
        let reasons = [
            DenyReason::Banned,
            DenyReason::BlacklistedQuery,
            DenyReason::ProtectedQuery,
            DenyReason::InsufficientBalance,
            DenyReason::PaidFeatureRequiresPurchase,
        ];
        for reason in reasons {
            let json = serde_json::to_value(reason).unwrap();
            assert_eq!(json, serde_json::Value::from(reason.as_str()));
        }
    }
}
