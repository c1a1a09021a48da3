mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::*;
use http_body_util::BodyExt;
use lockup_sweeper::config::AppConfig;
use lockup_sweeper::server::{AppState, build_router, shutdown_on};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::RwLock;
use tower::ServiceExt;

struct Harness {
    state: AppState,
    _store_dir: TempDir,
    _config_dir: TempDir,
}

async fn harness() -> Harness {
    let (store, store_dir) = temp_store().await;
    let orchestrator = build_orchestrator(seeded_ledger(), store, RecordingAlerts::new());

    let config_dir = TempDir::new().unwrap();
    let mut config = AppConfig::default();
    config.run = run_config(2, 2);

    Harness {
        state: AppState {
            orchestrator: Arc::new(orchestrator),
            config: Arc::new(RwLock::new(config)),
            config_path: config_dir.path().join("config.json"),
        },
        _store_dir: store_dir,
        _config_dir: config_dir,
    }
}

async fn call(state: &AppState, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    let request = match body {
        Some(body) => request.body(Body::from(body.to_string())).unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = build_router(state.clone()).oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_status_when_stopped() {
    let h = harness().await;
    let (status, body) = call(&h.state, "GET", "/api/status", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["isRunning"], json!(false));
    assert_eq!(body["summary"]["TOTAL"], json!(0));
}

#[tokio::test]
async fn test_start_and_stop_endpoints() {
    let h = harness().await;

    let (status, _) = call(&h.state, "POST", "/api/start", None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = call(&h.state, "POST", "/api/start", None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (_, body) = call(&h.state, "GET", "/api/status", None).await;
    assert_eq!(body["isRunning"], json!(true));
    assert_eq!(body["sponsors"].as_array().unwrap().len(), 2);

    let (status, _) = call(&h.state, "POST", "/api/stop", None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = call(&h.state, "POST", "/api/stop", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_force_run_while_stopped_conflicts() {
    let h = harness().await;
    let (status, body) = call(
        &h.state,
        "POST",
        "/api/force-run",
        Some(json!({ "secretPhrase": phrase(60) })),
    )
    .await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["message"], json!("bot is not running"));
}

#[tokio::test]
async fn test_add_wallets_and_list_without_phrases() {
    let h = harness().await;

    let (status, _) = call(
        &h.state,
        "POST",
        "/api/wallets",
        Some(json!({ "secretPhrases": [] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = call(
        &h.state,
        "POST",
        "/api/wallets",
        Some(json!({ "secretPhrases": ["not a phrase"] })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stats"]["invalid"], json!(1));

    let (_, body) = call(&h.state, "GET", "/api/status", None).await;
    let wallets = body["wallets"].as_array().unwrap();
    assert_eq!(wallets.len(), 1);
    assert_eq!(wallets[0]["status"], json!("INVALID"));
    assert!(wallets[0].get("secretPhrase").is_none());
    assert!(wallets[0].get("secret_phrase").is_none());

    let (status, _) = call(&h.state, "POST", "/api/clear", None).await;
    assert_eq!(status, StatusCode::OK);
    let (_, body) = call(&h.state, "GET", "/api/status", None).await;
    assert!(body["wallets"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_config_is_redacted_and_validated() {
    let h = harness().await;

    let (status, body) = call(&h.state, "GET", "/api/config", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["run"]["funding_phrase"], json!("********"));
    assert_eq!(body["run"]["recipient"], json!(recipient()));

    let (status, _) = call(
        &h.state,
        "POST",
        "/api/config",
        Some(json!({ "recipient": "", "funding_phrase": funder_phrase() })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let update = json!({
        "recipient": recipient(),
        "funding_phrase": funder_phrase(),
        "sponsor_phrases": [phrase(1)],
        "concurrent_workers": 1,
        "funding_amount": "0.5",
    });
    let (status, _) = call(&h.state, "POST", "/api/config", Some(update)).await;
    assert_eq!(status, StatusCode::OK);

    let saved = AppConfig::load(&h.state.config_path).await.unwrap();
    assert_eq!(saved.run.concurrent_workers, 1);
    assert_eq!(saved.run.sponsor_phrases, vec![phrase(1)]);
}

#[tokio::test]
async fn test_shutdown_resolves_on_signal() {
    tokio::time::timeout(Duration::from_secs(1), shutdown_on(async { Ok::<(), std::io::Error>(()) }))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_failed_signal_registration_keeps_serving() {
    let failing = async { Err::<(), _>(std::io::Error::other("signal handler unavailable")) };
    let result = tokio::time::timeout(Duration::from_millis(200), shutdown_on(failing)).await;
    assert!(result.is_err(), "server must not shut down when the signal cannot be registered");
}
