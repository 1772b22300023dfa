//! Status and configuration endpoints

use std::sync::Arc;

use axum::{Json, Router, extract::State, routing::get};
use serde::Serialize;

use super::{ApiState, ProviderNames};

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub providers: ProviderNames,
    pub active_connections: usize,
    pub uptime_secs: i64,
}

/// Liveness check plus a summary of configured providers
async fn health(State(state): State<Arc<ApiState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        providers: state.provider_names.clone(),
        active_connections: state.active_connections(),
        uptime_secs: (chrono::Utc::now() - state.started_at).num_seconds(),
    })
}

/// Effective configuration with secrets reduced to presence flags
async fn config(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    Json(state.config_view.clone())
}

/// Build status router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/health", get(health))
        .route("/config", get(config))
        .with_state(state)
}
