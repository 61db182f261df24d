pub mod errors;

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::config::defaults::{HEALTH_ENDPOINT, SPANS_ENDPOINT, TOKEN_ENDPOINT};
use crate::config::ServerConfig;
use crate::gateway::{DetectionGateway, GatewayStats};
use crate::schema::{DetectionRequest, SpanDetectionResponse, TokenDetectionResponse};
pub use errors::{ApiError, ErrorBody};

#[derive(Clone)]
pub struct AppState {
    gateway: Arc<DetectionGateway>,
    info: Arc<ServiceInfo>,
}

/// Static facts reported by the health endpoint.
#[derive(Debug)]
struct ServiceInfo {
    model: String,
    method: String,
    started_at: Instant,
}

impl AppState {
    pub fn new(gateway: Arc<DetectionGateway>, model: &str, method: &str) -> Self {
        Self {
            gateway,
            info: Arc::new(ServiceInfo {
                model: model.to_string(),
                method: method.to_string(),
                started_at: Instant::now(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub version: String,
    pub model: String,
    pub method: String,
    /// Name reported by the loaded detector.
    pub detector: String,
    pub uptime_seconds: u64,
    pub timestamp: String,
    pub inference: GatewayStats,
}

/// Build the HTTP surface: the two detection endpoints and the health check.
pub fn router(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .route(TOKEN_ENDPOINT, post(detect_token))
        .route(SPANS_ENDPOINT, post(detect_spans))
        .route(HEALTH_ENDPOINT, get(health_check))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub struct ApiServer {
    config: ServerConfig,
    state: AppState,
}

impl ApiServer {
    pub fn new(config: ServerConfig, gateway: Arc<DetectionGateway>) -> Self {
        let state = AppState::new(
            gateway,
            &config.detector.model,
            config.detector.method.as_str(),
        );
        Self { config, state }
    }

    pub fn router(&self) -> Router {
        router(self.state.clone(), self.config.max_body_bytes)
    }

    /// Bind the configured address and serve until Ctrl-C.
    pub async fn run(self) -> Result<()> {
        let addr = self.config.socket_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        self.serve(listener, shutdown_signal()).await
    }

    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let local_addr = listener.local_addr()?;
        info!(
            "✅ LettuceDetect API listening on http://{}{}",
            local_addr, TOKEN_ENDPOINT
        );

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .context("HTTP server error")?;

        info!("LettuceDetect API stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
    }
}

async fn detect_token(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<TokenDetectionResponse>, ApiError> {
    let request = parse_request(&body, "token")?;
    let response = state
        .gateway
        .detect_tokens(&request)
        .await
        .map_err(|e| ApiError::inference(e, "token"))?;
    Ok(Json(response))
}

async fn detect_spans(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<SpanDetectionResponse>, ApiError> {
    let request = parse_request(&body, "spans")?;
    let response = state
        .gateway
        .detect_spans(&request)
        .await
        .map_err(|e| ApiError::inference(e, "spans"))?;
    Ok(Json(response))
}

fn parse_request(body: &[u8], endpoint: &str) -> Result<DetectionRequest, ApiError> {
    DetectionRequest::from_json(body).map_err(|e| {
        debug!(endpoint, "Rejected request: {}", e);
        ApiError::from(e)
    })
}

async fn health_check(State(state): State<AppState>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        model: state.info.model.clone(),
        method: state.info.method.clone(),
        detector: state.gateway.model_name().to_string(),
        uptime_seconds: state.info.started_at.elapsed().as_secs(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        inference: state.gateway.stats(),
    })
}
