//! HTTP and WebSocket surface for voiceclaw

pub mod health;
pub mod websocket;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::Router;
use chrono::{DateTime, Utc};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::{Config, PipelineConfig};
use crate::pipeline::TurnController;
use crate::providers::Providers;
use crate::Result;

/// Shared state for API handlers
pub struct ApiState {
    /// Providers shared by every conversation
    pub providers: Providers,
    /// Tuning applied to each new conversation
    pub pipeline: PipelineConfig,
    /// Sample rate assumed for raw PCM uploads
    pub sample_rate: u32,
    /// Redacted configuration served at `/config`
    pub config_view: serde_json::Value,
    /// Names of the configured providers, for health output
    pub provider_names: ProviderNames,
    pub started_at: DateTime<Utc>,
    connections: AtomicUsize,
}

/// Which backend serves each capability
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProviderNames {
    pub stt: String,
    pub llm: String,
    pub tts: String,
}

impl ApiState {
    /// Build state from loaded configuration and ready providers
    #[must_use]
    pub fn new(config: &Config, providers: Providers) -> Self {
        let provider_names = ProviderNames {
            stt: format!("{:?}", config.stt.provider).to_lowercase(),
            llm: config.llm.endpoint.clone(),
            tts: format!("{:?}", config.tts.provider).to_lowercase(),
        };
        Self {
            providers,
            pipeline: config.pipeline.clone(),
            sample_rate: config.stt.sample_rate,
            config_view: config.redacted(),
            provider_names,
            started_at: Utc::now(),
            connections: AtomicUsize::new(0),
        }
    }

    /// A fresh controller for one conversation
    #[must_use]
    pub fn conversation(&self) -> TurnController {
        TurnController::new(self.providers.clone(), self.pipeline.clone())
    }

    /// Number of open WebSocket conversations
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    fn connection_opened(&self) -> usize {
        self.connections.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn connection_closed(&self) -> usize {
        self.connections.fetch_sub(1, Ordering::Relaxed).saturating_sub(1)
    }
}

/// API server
pub struct ApiServer {
    state: Arc<ApiState>,
    host: String,
    port: u16,
}

impl ApiServer {
    /// Create a new API server
    #[must_use]
    pub fn new(state: ApiState, host: impl Into<String>, port: u16) -> Self {
        Self {
            state: Arc::new(state),
            host: host.into(),
            port,
        }
    }

    /// Build the router with all routes
    #[must_use]
    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            .merge(health::router(Arc::clone(&self.state)))
            .merge(websocket::router(Arc::clone(&self.state)))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
    }

    /// Run the API server
    ///
    /// # Errors
    ///
    /// Returns error if server fails to bind or run
    pub async fn run(self) -> Result<()> {
        let addr = format!("{}:{}", self.host, self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| crate::Error::Config(format!("failed to bind API server on {addr}: {e}")))?;

        tracing::info!(addr = %addr, "API server listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| crate::Error::Config(format!("API server error: {e}")))?;

        tracing::info!("API server stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
