//! HTTP source adapter against an in-process provider.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use axum::extract::Query;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;

use lookup_broker_core::source::{Endpoint, FetchFailure, HttpSourceAdapter, RawPayload, SourceAdapter};
use lookup_broker_core::{normalize, LookupKind, ReportStatus, ResponseMode};

async fn provider() -> Result<SocketAddr> {
    let app = Router::new()
        .route(
            "/number",
            get(|Query(params): Query<HashMap<String, String>>| async move {
                let term = params.get("term").cloned().unwrap_or_default();
                let key = params.get("key").cloned().unwrap_or_default();
                Json(json!({ "data": { "data": [{ "mobile": term, "email": key }] } }))
            }),
        )
        .route(
            "/broken",
            get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "upstream exploded") }),
        )
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "too late"
            }),
        )
        .route("/ip", get(|| async { "  8.8.8.8 | US | Google  " }))
        .route("/html", get(|| async { "<html>maintenance</html>" }));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(addr)
}

fn endpoint(addr: SocketAddr, path: &str, mode: ResponseMode, timeout: Duration) -> Endpoint {
    Endpoint::new(format!("http://{addr}{path}"), mode, timeout)
}

#[tokio::test]
async fn json_body_is_returned_raw() -> Result<()> {
    let addr = provider().await?;
    let adapter = HttpSourceAdapter::new([(
        LookupKind::Number,
        endpoint(addr, "/number?type=mobile&term={query}&key={key}", ResponseMode::Json, Duration::from_secs(5))
            .with_key("k&1"),
    )]);

    let payload = adapter.fetch(LookupKind::Number, "9990001111").await?;
    let RawPayload::Json(bytes) = &payload else {
        panic!("expected json payload, got {payload:?}");
    };
    let body: serde_json::Value = serde_json::from_slice(bytes)?;
    assert_eq!(body["data"]["data"][0]["mobile"], "9990001111");
    assert_eq!(body["data"]["data"][0]["email"], "k&1");

    let report = normalize(LookupKind::Number, "9990001111", &payload);
    assert_eq!(report.status, ReportStatus::Found);
    assert_eq!(report.sections[0].get("MOBILE"), Some("9990001111"));
    Ok(())
}

#[tokio::test]
async fn server_error_maps_to_status_failure() -> Result<()> {
    let addr = provider().await?;
    let adapter = HttpSourceAdapter::new([(
        LookupKind::Upi,
        endpoint(addr, "/broken", ResponseMode::Json, Duration::from_secs(5)),
    )]);

    let err = adapter.fetch(LookupKind::Upi, "someone@bank").await.unwrap_err();
    assert_eq!(err, FetchFailure::Status(500));
    Ok(())
}

#[tokio::test]
async fn slow_provider_times_out() -> Result<()> {
    let addr = provider().await?;
    let adapter = HttpSourceAdapter::new([(
        LookupKind::CallHistory,
        endpoint(addr, "/slow", ResponseMode::Json, Duration::from_millis(200)),
    )]);

    let err = adapter.fetch(LookupKind::CallHistory, "9990001111").await.unwrap_err();
    assert_eq!(err, FetchFailure::Timeout);
    Ok(())
}

#[tokio::test]
async fn text_mode_returns_text() -> Result<()> {
    let addr = provider().await?;
    let adapter = HttpSourceAdapter::new([(
        LookupKind::Ip,
        endpoint(addr, "/ip?ip={query}", ResponseMode::Text, Duration::from_secs(5)),
    )]);

    let payload = adapter.fetch(LookupKind::Ip, "8.8.8.8").await?;
    assert_eq!(payload, RawPayload::text("  8.8.8.8 | US | Google  "));
    Ok(())
}

#[tokio::test]
async fn html_error_page_normalizes_as_malformed() -> Result<()> {
    let addr = provider().await?;
    let adapter = HttpSourceAdapter::new([(
        LookupKind::Aadhaar,
        endpoint(addr, "/html", ResponseMode::Json, Duration::from_secs(5)),
    )]);

    let payload = adapter.fetch(LookupKind::Aadhaar, "123412341234").await?;
    let report = normalize(LookupKind::Aadhaar, "123412341234", &payload);
    assert_eq!(report.status, ReportStatus::MalformedSource);
    Ok(())
}

#[tokio::test]
async fn unreachable_provider_is_a_transport_failure() -> Result<()> {
    // Bind then drop to get a port nobody listens on.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    drop(listener);

    let adapter = HttpSourceAdapter::new([(
        LookupKind::Telegram,
        endpoint(addr, "/user?user={query}", ResponseMode::Json, Duration::from_secs(5)),
    )]);
    let err = adapter.fetch(LookupKind::Telegram, "someone").await.unwrap_err();
    assert!(matches!(err, FetchFailure::Transport(_)), "{err:?}");
    Ok(())
}

#[tokio::test]
async fn shutdown_releases_and_next_fetch_reopens() -> Result<()> {
    let addr = provider().await?;
    let adapter = HttpSourceAdapter::new([(
        LookupKind::Ip,
        endpoint(addr, "/ip", ResponseMode::Text, Duration::from_secs(5)),
    )]);

    assert!(!adapter.is_open().await);
    adapter.fetch(LookupKind::Ip, "1.1.1.1").await?;
    assert!(adapter.is_open().await);

    adapter.shutdown().await;
    assert!(!adapter.is_open().await);

    adapter.fetch(LookupKind::Ip, "1.1.1.1").await?;
    assert!(adapter.is_open().await);
    Ok(())
}
