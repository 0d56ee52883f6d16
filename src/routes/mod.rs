use axum::{
    extract::State,
    http::StatusCode,
    middleware::{self as axum_middleware},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::delivery::normalize_endpoint;
use crate::error::ApiError;
use crate::middleware;
use crate::orchestrator::{DeliveryResponse, Orchestrator, TokenResponse};
use crate::store::{self, ConfigStore, RELAY_AUTH_TOKEN, RELAY_ENDPOINT};
use crate::token::{mask, CredentialEvent};

/// Application version from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub control_api_key: String,
    pub orchestrator: Arc<Orchestrator>,
}

/// Body of `PUT /v1/settings`; absent fields are left alone
#[derive(Debug, Deserialize)]
pub struct SettingsUpdate {
    pub endpoint: Option<String>,
    pub auth_token: Option<String>,
}

/// Health check routes (no authentication required)
pub fn health_routes() -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
}

/// Control routes (require the control key)
pub fn control_routes(state: AppState) -> Router {
    Router::new()
        .route("/v1/token", get(get_token_handler))
        .route("/v1/token/test", post(test_delivery_handler))
        .route("/v1/events/credential", post(credential_event_handler))
        .route("/v1/status", get(status_handler))
        .route(
            "/v1/settings",
            get(get_settings_handler).put(put_settings_handler),
        )
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::auth_middleware,
        ))
        .with_state(state)
}

/// GET / - Simple health check
async fn root_handler() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "message": "Session Relay is running",
        "version": VERSION
    }))
}

/// GET /health - Detailed health check
async fn health_handler() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "timestamp": Utc::now().to_rfc3339(),
        "version": VERSION
    }))
}

/// GET /v1/token - Acquisition request
///
/// Answers from the cache, falling back to the credential source.
async fn get_token_handler(State(state): State<AppState>) -> (StatusCode, Json<TokenResponse>) {
    let response = state.orchestrator.request_token().await;
    let status = if response.ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(response))
}

/// POST /v1/token/test - Force-send the current token
///
/// Bypasses dedup and the in-flight guard; delivery errors are returned.
async fn test_delivery_handler(
    State(state): State<AppState>,
) -> (StatusCode, Json<DeliveryResponse>) {
    tracing::info!("Request to /v1/token/test");
    let response = state.orchestrator.test_delivery().await;
    let status = if response.ok {
        StatusCode::OK
    } else {
        StatusCode::BAD_GATEWAY
    };
    (status, Json(response))
}

/// POST /v1/events/credential - Host change notification
async fn credential_event_handler(
    State(state): State<AppState>,
    Json(event): Json<CredentialEvent>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if event.domain.trim().is_empty() || event.name.trim().is_empty() {
        return Err(ApiError::ValidationError(
            "domain and name are required".to_string(),
        ));
    }

    let accepted = state.orchestrator.handle_event(&event);
    Ok((StatusCode::ACCEPTED, Json(json!({ "accepted": accepted }))))
}

/// GET /v1/status - Cache and delivery state, without the token itself
async fn status_handler(State(state): State<AppState>) -> Json<Value> {
    let orchestrator = &state.orchestrator;
    let record = orchestrator.state().delivery_record();
    let target = orchestrator.detector().target();

    Json(json!({
        "domain": target.domain,
        "name": target.name,
        "cached": orchestrator.state().cache().peek().is_some(),
        "last_delivered_at_millis": record.last_delivered_at_millis,
        "sending": orchestrator.is_sending(),
    }))
}

/// GET /v1/settings - Relay settings, auth token masked
async fn get_settings_handler(State(state): State<AppState>) -> Json<Value> {
    let store = state.orchestrator.state().store();
    let config = store::load_relay_config(store.as_ref()).await;

    Json(json!({
        "endpoint": config.endpoint,
        "auth_token": config.auth_token.as_deref().map(mask),
    }))
}

/// PUT /v1/settings - Update relay settings
///
/// Takes effect on the next delivery attempt.
async fn put_settings_handler(
    State(state): State<AppState>,
    Json(update): Json<SettingsUpdate>,
) -> Result<Json<Value>, ApiError> {
    let store = state.orchestrator.state().store();

    if let Some(ref endpoint) = update.endpoint {
        let resolved = normalize_endpoint(Some(endpoint))
            .map_err(|e| ApiError::ValidationError(e.to_string()))?;
        store.set(RELAY_ENDPOINT, &resolved.url).await?;
        tracing::info!("Relay endpoint updated to {}", resolved.url);
    }

    if let Some(ref auth_token) = update.auth_token {
        store.set(RELAY_AUTH_TOKEN, auth_token.trim()).await?;
        tracing::info!("Relay auth token updated");
    }

    Ok(Json(json!({ "ok": true })))
}
