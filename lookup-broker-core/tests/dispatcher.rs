//! End-to-end dispatcher flows over the in-memory ledger and canned sources.

use std::sync::Arc;

use anyhow::Result;
use lookup_broker_core::ledger::{LedgerStore, MemoryLedger};
use lookup_broker_core::{
    BalanceMode, BrokerConfig, Delivery, DenyReason, DispatchError, Dispatcher, FetchFailure,
    FixtureSource, LookupKind, LookupOutcome, LookupRequest, OnboardOutcome, RawPayload,
    RedeemOutcome, ReportStatus,
};

const OWNER: i64 = 1;
const FREE_GROUP: i64 = -100;

const NUMBER_BODY: &str = r#"{"data": [{"mobile": "9990001111", "name": "SOME ONE", "address": "HOUSE 12!STREET 4!CITY"}]}"#;
const CALLS_BODY: &str = r#"{"calls": [{"call_date": "2024-01-01", "caller_number": "9990001111"}]}"#;

fn config() -> BrokerConfig {
    let mut config = BrokerConfig::default();
    config.policy.owner_id = Some(OWNER);
    config.policy.sudo_ids = vec![2];
    config.policy.free_contexts = vec![FREE_GROUP];
    config.branding.footer = "-- footer --".to_string();
    config
}

struct Harness {
    dispatcher: Dispatcher,
    ledger: Arc<MemoryLedger>,
    source: Arc<FixtureSource>,
}

fn harness_with(source: FixtureSource, config: BrokerConfig) -> Harness {
    let ledger = Arc::new(MemoryLedger::new());
    let source = Arc::new(source);
    let dispatcher = Dispatcher::new(ledger.clone(), source.clone(), &config);
    Harness {
        dispatcher,
        ledger,
        source,
    }
}

fn harness() -> Harness {
    harness_with(
        FixtureSource::new()
            .with_json(LookupKind::Number, NUMBER_BODY)
            .with_json(LookupKind::CallHistory, CALLS_BODY)
            .with_failure(LookupKind::Upi, FetchFailure::Timeout),
        config(),
    )
}

impl Harness {
    async fn balance(&self, id: i64) -> i64 {
        self.dispatcher.balance(id).await.unwrap().unwrap_or(-1)
    }

    async fn searches(&self, id: i64) -> usize {
        self.ledger.search_logs_for(id).await.unwrap().len()
    }
}

#[tokio::test]
async fn onboarding_credits_referrer_once() -> Result<()> {
    let h = harness();
    h.dispatcher.onboard(10, Some("ten"), Some("Ten"), None).await?;

    let outcome = h.dispatcher.onboard(11, None, None, Some("10")).await?;
    match &outcome {
        OnboardOutcome::Onboarded { account, referrer } => {
            assert_eq!(*referrer, Some(10));
            assert_eq!(account.balance, 2);
        }
        other => panic!("expected onboarding, got {other:?}"),
    }
    assert_eq!(h.balance(10).await, 3);

    // Returning callers are not re-credited and do not re-credit.
    let again = h.dispatcher.onboard(11, None, None, Some("10")).await?;
    assert!(matches!(again, OnboardOutcome::Returning(_)));
    assert_eq!(h.balance(10).await, 3);
    assert_eq!(h.dispatcher.account(10).await?.unwrap().referral_count, 1);
    Ok(())
}

#[tokio::test]
async fn unknown_referrer_still_onboards() -> Result<()> {
    let h = harness();
    let outcome = h.dispatcher.onboard(11, None, None, Some("404")).await?;
    match outcome {
        OnboardOutcome::Onboarded { account, referrer } => {
            assert_eq!(referrer, None);
            assert_eq!(account.referrer_id, None);
            assert_eq!(account.balance, 2);
        }
        other => panic!("expected onboarding, got {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn self_referral_is_ignored() -> Result<()> {
    let h = harness();
    let outcome = h.dispatcher.onboard(12, None, None, Some("12")).await?;
    assert!(matches!(
        outcome,
        OnboardOutcome::Onboarded { referrer: None, .. }
    ));
    Ok(())
}

#[tokio::test]
async fn paid_lookup_debits_logs_and_reports() -> Result<()> {
    let h = harness();
    h.dispatcher.onboard(20, None, None, None).await?;

    let req = h
        .dispatcher
        .request_for(20, LookupKind::Number, "+91 99900 01111", None);
    let outcome = h.dispatcher.lookup(req).await?;

    let LookupOutcome::Report(report) = outcome else {
        panic!("expected a report, got {outcome:?}");
    };
    assert_eq!(report.status, ReportStatus::Found);
    assert_eq!(report.sections[0].get("ADDRESS"), Some("HOUSE 12, STREET 4, CITY"));
    assert_eq!(report.render_text().matches("-- footer --").count(), 1);

    assert_eq!(h.balance(20).await, 1);
    assert_eq!(h.searches(20).await, 1);
    assert_eq!(h.source.seen(), vec![(LookupKind::Number, "9990001111".to_string())]);
    Ok(())
}

#[tokio::test]
async fn denied_lookup_never_fetches_or_logs() -> Result<()> {
    let h = harness();
    h.dispatcher.onboard(21, None, None, None).await?;
    h.dispatcher.adjust_balance(21, 0, BalanceMode::Set).await?;

    let outcome = h
        .dispatcher
        .lookup(LookupRequest::new(21, LookupKind::Number, "9990001111"))
        .await?;
    assert_eq!(outcome, LookupOutcome::Denied(DenyReason::InsufficientBalance));
    assert_eq!(h.source.calls(), 0);
    assert_eq!(h.searches(21).await, 0);
    Ok(())
}

#[tokio::test]
async fn blacklisted_query_beats_protection() -> Result<()> {
    let h = harness();
    h.dispatcher.onboard(22, None, None, None).await?;
    h.dispatcher.protect("9990001111", OWNER).await?;
    h.dispatcher.blacklist("9990001111", Some("vip"), OWNER).await?;

    let outcome = h
        .dispatcher
        .lookup(LookupRequest::new(22, LookupKind::Number, "9990001111"))
        .await?;
    assert_eq!(outcome, LookupOutcome::Denied(DenyReason::BlacklistedQuery));
    assert_eq!(h.balance(22).await, 2);
    Ok(())
}

#[tokio::test]
async fn protected_query_is_open_to_owner_only() -> Result<()> {
    let h = harness();
    h.dispatcher.onboard(23, None, None, None).await?;
    h.dispatcher.protect("9990001111", OWNER).await?;

    let denied = h
        .dispatcher
        .lookup(h.dispatcher.request_for(23, LookupKind::Number, "9990001111", None))
        .await?;
    assert_eq!(denied, LookupOutcome::Denied(DenyReason::ProtectedQuery));

    // Sudo is privileged but is not the super-identity.
    let sudo = h
        .dispatcher
        .lookup(h.dispatcher.request_for(2, LookupKind::Number, "9990001111", None))
        .await?;
    assert_eq!(sudo, LookupOutcome::Denied(DenyReason::ProtectedQuery));

    let owner = h
        .dispatcher
        .lookup(h.dispatcher.request_for(OWNER, LookupKind::Number, "9990001111", None))
        .await?;
    assert!(matches!(owner, LookupOutcome::Report(_)));
    Ok(())
}

#[tokio::test]
async fn premium_kind_requires_purchase_even_with_balance() -> Result<()> {
    let h = harness();
    h.dispatcher.onboard(24, None, None, None).await?;
    h.dispatcher.adjust_balance(24, 100, BalanceMode::Add).await?;

    let outcome = h
        .dispatcher
        .lookup(h.dispatcher.request_for(24, LookupKind::CallHistory, "9990001111", None))
        .await?;
    assert_eq!(
        outcome,
        LookupOutcome::Denied(DenyReason::PaidFeatureRequiresPurchase)
    );
    assert_eq!(h.balance(24).await, 102);
    Ok(())
}

#[tokio::test]
async fn free_context_waives_charge_but_not_premium() -> Result<()> {
    let h = harness();
    h.dispatcher.onboard(25, None, None, None).await?;

    let free = h
        .dispatcher
        .lookup(h.dispatcher.request_for(25, LookupKind::Number, "9990001111", Some(FREE_GROUP)))
        .await?;
    assert!(matches!(free, LookupOutcome::Report(_)));
    assert_eq!(h.balance(25).await, 2);

    let premium = h
        .dispatcher
        .lookup(h.dispatcher.request_for(25, LookupKind::CallHistory, "9990001111", Some(FREE_GROUP)))
        .await?;
    assert_eq!(
        premium,
        LookupOutcome::Denied(DenyReason::PaidFeatureRequiresPurchase)
    );
    assert_eq!(h.source.calls(), 1);
    Ok(())
}

#[tokio::test]
async fn privileged_caller_gets_premium_report() -> Result<()> {
    let h = harness();
    let outcome = h
        .dispatcher
        .lookup(h.dispatcher.request_for(OWNER, LookupKind::CallHistory, "99900 01111", None))
        .await?;
    let LookupOutcome::Report(report) = outcome else {
        panic!("expected a report, got {outcome:?}");
    };
    assert_eq!(report.preamble[0].value, "9990001111");
    assert_eq!(report.sections[0].get("DATE"), Some("2024-01-01"));
    Ok(())
}

#[tokio::test]
async fn fetch_failure_keeps_debit_and_search_log() -> Result<()> {
    let h = harness();
    h.dispatcher.onboard(26, None, None, None).await?;

    let outcome = h
        .dispatcher
        .lookup(LookupRequest::new(26, LookupKind::Upi, "someone@bank"))
        .await?;
    assert_eq!(outcome, LookupOutcome::FetchFailed(FetchFailure::Timeout));
    assert_eq!(h.balance(26).await, 1);
    assert_eq!(h.searches(26).await, 1);
    Ok(())
}

#[tokio::test]
async fn unconfigured_kind_is_a_fetch_failure() -> Result<()> {
    let h = harness();
    let outcome = h
        .dispatcher
        .lookup(LookupRequest::new(OWNER, LookupKind::Telegram, "@someone").privileged(true))
        .await?;
    assert_eq!(
        outcome,
        LookupOutcome::FetchFailed(FetchFailure::Unconfigured(LookupKind::Telegram))
    );
    assert_eq!(h.source.seen()[0].1, "someone");
    Ok(())
}

#[tokio::test]
async fn empty_query_is_rejected_before_the_gate() -> Result<()> {
    let h = harness();
    h.dispatcher.onboard(27, None, None, None).await?;
    let err = h
        .dispatcher
        .lookup(LookupRequest::new(27, LookupKind::Telegram, " @ "))
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::EmptyQuery(LookupKind::Telegram)));
    assert_eq!(h.balance(27).await, 2);
    Ok(())
}

#[tokio::test]
async fn direct_input_is_classified_and_looked_up() -> Result<()> {
    let h = harness();
    h.dispatcher.onboard(28, None, None, None).await?;

    let outcome = h.dispatcher.lookup_input(28, "+91 99900 01111", None).await?;
    assert!(matches!(outcome, Some(LookupOutcome::Report(_))));

    assert!(h.dispatcher.lookup_input(28, "hello there", None).await?.is_none());
    assert_eq!(h.balance(28).await, 1);
    Ok(())
}

#[tokio::test]
async fn long_reports_become_attachments() -> Result<()> {
    let entries: Vec<String> = (0..40)
        .map(|i| format!(r#"{{"mobile": "99900{i:05}", "address": "HOUSE {i}!STREET!CITY"}}"#))
        .collect();
    let body = format!("[{}]", entries.join(","));

    let mut config = config();
    config.policy.report_inline_limit = 500;
    let h = harness_with(
        FixtureSource::new().with_payload(LookupKind::Number, RawPayload::json(body)),
        config,
    );

    let outcome = h
        .dispatcher
        .lookup(LookupRequest::new(OWNER, LookupKind::Number, "+91 9990001111").privileged(true))
        .await?;
    let LookupOutcome::Report(report) = outcome else {
        panic!("expected a report, got {outcome:?}");
    };

    assert_eq!(report.query, "9990001111");
    match h.dispatcher.deliver(&report) {
        Delivery::Attachment { file_name, body } => {
            assert_eq!(file_name, "number_9990001111.txt");
            assert!(body.contains("NUMBER DETAILS #40"));
        }
        Delivery::Inline(_) => panic!("expected an attachment"),
    }

    let short = h.dispatcher.deliver(&lookup_broker_core::normalize(
        LookupKind::Ip,
        "1.1.1.1",
        &RawPayload::text("x"),
    ));
    assert!(matches!(short, Delivery::Inline(_)));
    Ok(())
}

#[tokio::test]
async fn attachment_name_uses_the_sanitized_query() -> Result<()> {
    let mut config = config();
    config.policy.report_inline_limit = 10;
    let h = harness_with(FixtureSource::new().with_json(LookupKind::Number, NUMBER_BODY), config);

    let outcome = h.dispatcher.lookup_input(OWNER, "+91 99900 01111", None).await?;
    let Some(LookupOutcome::Report(report)) = outcome else {
        panic!("expected a report, got {outcome:?}");
    };
    match h.dispatcher.deliver(&report) {
        Delivery::Attachment { file_name, .. } => assert_eq!(file_name, "number_9990001111.txt"),
        Delivery::Inline(_) => panic!("expected an attachment"),
    }
    Ok(())
}

#[tokio::test]
async fn redeem_codes_are_case_insensitive() -> Result<()> {
    let h = harness();
    h.dispatcher.onboard(29, None, None, None).await?;
    h.dispatcher.create_code("promo7", 7).await?;

    assert_eq!(
        h.dispatcher.redeem(29, "PROMO7").await?,
        RedeemOutcome::Redeemed { credits: 7, balance: 9 }
    );
    assert_eq!(h.dispatcher.redeem(29, "promo7").await?, RedeemOutcome::AlreadyUsed);
    Ok(())
}

#[tokio::test]
async fn banned_caller_is_denied_until_unbanned() -> Result<()> {
    let h = harness();
    h.dispatcher.onboard(30, None, None, None).await?;
    assert!(h.dispatcher.set_banned(30, true).await?);

    let req = LookupRequest::new(30, LookupKind::Number, "9990001111");
    assert_eq!(
        h.dispatcher.lookup(req.clone()).await?,
        LookupOutcome::Denied(DenyReason::Banned)
    );

    assert!(h.dispatcher.set_banned(30, false).await?);
    assert!(matches!(h.dispatcher.lookup(req).await?, LookupOutcome::Report(_)));

    let stats = h.dispatcher.stats().await?;
    assert_eq!(stats.total_searches, 1);
    assert_eq!(stats.banned_accounts, 0);
    Ok(())
}

#[tokio::test]
async fn shutdown_is_idempotent() -> Result<()> {
    let h = harness();
    h.dispatcher.shutdown().await;
    h.dispatcher.shutdown().await;
    assert_eq!(h.dispatcher.account_ids().await?, Vec::<i64>::new());
    Ok(())
}
