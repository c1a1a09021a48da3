//! HTTP control surface

use crate::config::AppConfig;
use crate::error::BotError;
use crate::orchestrator::Orchestrator;
use crate::types::{PublicKey, WalletRecord, WalletStatus};
use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub config: Arc<RwLock<AppConfig>>,
    pub config_path: PathBuf,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/start", post(start))
        .route("/api/stop", post(stop))
        .route("/api/status", get(status))
        .route("/api/wallets", post(add_wallets))
        .route("/api/force-run", post(force_run))
        .route("/api/config", get(get_config).post(save_config))
        .route("/api/clear", post(clear))
        .with_state(state)
}

pub async fn serve(state: AppState, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
    let bind = state.config.read().await.server.bind;
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    info!("Control surface listening on http://{}", listener.local_addr()?);

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server failed")
}

/// Resolves once `signal` fires. A signal that could not be registered is
/// logged and never resolves, so the server keeps serving.
pub async fn shutdown_on<F>(signal: F)
where
    F: Future<Output = std::io::Result<()>>,
{
    match signal.await {
        Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
        Err(e) => {
            error!("Failed to listen for Ctrl+C, graceful shutdown disabled: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "message": self.1 }))).into_response()
    }
}

impl From<BotError> for ApiError {
    fn from(e: BotError) -> Self {
        let status = match &e {
            BotError::AlreadyRunning
            | BotError::NotRunning
            | BotError::Draining(_)
            | BotError::WalletBusy
            | BotError::NoSponsorAvailable => StatusCode::CONFLICT,
            BotError::UnknownWallet => StatusCode::NOT_FOUND,
            BotError::InvalidConfig(_) | BotError::Derivation(_) => StatusCode::BAD_REQUEST,
            BotError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(status, e.to_string())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e))
    }
}

fn message(text: impl Into<String>) -> Json<serde_json::Value> {
    Json(json!({ "message": text.into() }))
}

async fn start(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let run = state.config.read().await.run.clone();
    state.orchestrator.start(run).await?;
    Ok(message("bot started"))
}

async fn stop(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    if state.orchestrator.stop().await {
        Ok(message("bot stopped"))
    } else {
        Err(BotError::NotRunning.into())
    }
}

/// Wallet as shown to operators; the secret phrase never leaves the process.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WalletView {
    public_key: Option<PublicKey>,
    status: WalletStatus,
    unlock_time: Option<DateTime<Utc>>,
    sponsor_public_key: Option<PublicKey>,
    reason: Option<String>,
    updated_at: DateTime<Utc>,
}

impl From<WalletRecord> for WalletView {
    fn from(record: WalletRecord) -> Self {
        Self {
            public_key: record.public_key,
            status: record.status,
            unlock_time: record.unlock_time,
            sponsor_public_key: record.sponsor_public_key,
            reason: record.reason,
            updated_at: record.updated_at,
        }
    }
}

async fn status(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let bot = state.orchestrator.status().await;
    let store = state.orchestrator.store();
    let summary = store.summary().await?;
    let wallets: Vec<WalletView> = store
        .list_all()
        .await?
        .into_iter()
        .map(WalletView::from)
        .collect();

    Ok(Json(json!({
        "isRunning": bot.running,
        "inFlight": bot.in_flight,
        "sponsors": bot.sponsors,
        "summary": summary,
        "wallets": wallets,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddWalletsRequest {
    secret_phrases: Vec<String>,
}

async fn add_wallets(
    State(state): State<AppState>,
    Json(body): Json<AddWalletsRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if body.secret_phrases.is_empty() {
        return Err(ApiError(
            StatusCode::BAD_REQUEST,
            "secretPhrases must be a non-empty list".to_string(),
        ));
    }
    let stats = state.orchestrator.schedule_new(&body.secret_phrases).await?;
    Ok(Json(json!({
        "message": format!(
            "Scheduling complete. Scheduled: {}, Pending: {}, Invalid: {}, Duplicates: {}",
            stats.scheduled, stats.pending, stats.invalid, stats.duplicates
        ),
        "stats": stats,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ForceRunRequest {
    secret_phrase: String,
}

async fn force_run(
    State(state): State<AppState>,
    Json(body): Json<ForceRunRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if body.secret_phrase.trim().is_empty() {
        return Err(ApiError(
            StatusCode::BAD_REQUEST,
            "secretPhrase is required".to_string(),
        ));
    }
    let outcome = state.orchestrator.force_run(&body.secret_phrase).await?;
    Ok(Json(json!({
        "message": outcome.to_string(),
        "status": outcome.status(),
        "reason": outcome.reason(),
    })))
}

async fn get_config(State(state): State<AppState>) -> Json<serde_json::Value> {
    let config = state.config.read().await;
    Json(json!({
        "run": config.run.redacted(),
        "network": config.network,
        "engine": config.engine,
    }))
}

async fn save_config(
    State(state): State<AppState>,
    Json(run): Json<crate::config::RunConfig>,
) -> Result<Json<serde_json::Value>, ApiError> {
    run.validate()
        .map_err(|e| ApiError(StatusCode::BAD_REQUEST, e))?;

    let mut config = state.config.write().await;
    config.run = run;
    config.save(&state.config_path).await?;
    Ok(message(
        "configuration saved; restart the bot for changes to take effect",
    ))
}

async fn clear(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    if state.orchestrator.is_running().await {
        warn!("Clearing wallet store while the bot is running");
    }
    state.orchestrator.store().clear().await?;
    Ok(message("all wallet records removed"))
}
