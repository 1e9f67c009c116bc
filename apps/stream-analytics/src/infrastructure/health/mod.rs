//! Health Check and Metrics Endpoint
//!
//! HTTP endpoint for health checks, provider status reporting, and Prometheus metrics.
//! Used by container orchestrators, load balancers, and monitoring systems.
//!
//! # Endpoints
//!
//! - `GET /health` - Returns JSON health status
//! - `GET /healthz` - Kubernetes liveness probe (simple OK)
//! - `GET /readyz` - Kubernetes readiness probe (any provider connected)
//! - `GET /metrics` - Prometheus metrics in text format

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::application::services::{
    AnalyticsEngine, OrchestratorStats, ProviderStatus, StreamingOrchestrator,
};
use crate::infrastructure::broadcast::EventHubStats;
use crate::infrastructure::metrics::get_metrics_handle;

// =============================================================================
// Health Response Types
// =============================================================================

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Overall status: "healthy", "degraded", or "unhealthy".
    pub status: HealthStatus,
    /// Engine version.
    pub version: String,
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Current time.
    pub current_time: DateTime<Utc>,
    /// Per-provider connection status.
    pub providers: Vec<ProviderStatus>,
    /// Data subscription statistics.
    pub orchestrator: OrchestratorStats,
    /// Active analytics subscriptions.
    pub analytics_subscriptions: usize,
    /// Event channel receivers.
    pub events: EventHubStats,
}

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Every provider connected.
    Healthy,
    /// Some providers connected.
    Degraded,
    /// No provider connected.
    Unhealthy,
}

// =============================================================================
// Health Server State
// =============================================================================

/// Shared state for the health server.
pub struct HealthServerState {
    version: String,
    started_at: Instant,
    orchestrator: Arc<StreamingOrchestrator>,
    analytics: Arc<AnalyticsEngine>,
}

impl HealthServerState {
    /// Create new health server state.
    #[must_use]
    pub fn new(
        version: String,
        orchestrator: Arc<StreamingOrchestrator>,
        analytics: Arc<AnalyticsEngine>,
    ) -> Self {
        Self {
            version,
            started_at: Instant::now(),
            orchestrator,
            analytics,
        }
    }
}

// =============================================================================
// Health Server
// =============================================================================

/// Health check HTTP server.
pub struct HealthServer {
    port: u16,
    state: Arc<HealthServerState>,
    cancel: CancellationToken,
}

impl HealthServer {
    /// Create a new health server.
    #[must_use]
    pub const fn new(port: u16, state: Arc<HealthServerState>, cancel: CancellationToken) -> Self {
        Self {
            port,
            state,
            cancel,
        }
    }

    /// Run the health server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `HealthServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), HealthServerError> {
        let app = router(self.state);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| HealthServerError::BindFailed(self.port, e.to_string()))?;

        tracing::info!(port = self.port, "Health server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| HealthServerError::ServerFailed(e.to_string()))?;

        tracing::info!("Health server stopped");
        Ok(())
    }
}

fn router(state: Arc<HealthServerState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

// =============================================================================
// HTTP Handlers
// =============================================================================

async fn health_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    let response = build_health_response(&state);
    let status_code = match response.status {
        HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(response))
}

async fn liveness_handler() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

async fn readiness_handler(State(state): State<Arc<HealthServerState>>) -> impl IntoResponse {
    if is_ready(&state.orchestrator.provider_statuses()) {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    get_metrics_handle().map_or_else(
        || {
            (
                StatusCode::SERVICE_UNAVAILABLE,
                [("content-type", "text/plain")],
                "Metrics not initialized".to_string(),
            )
        },
        |handle| {
            let body = handle.render();
            (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                body,
            )
        },
    )
}

fn build_health_response(state: &HealthServerState) -> HealthResponse {
    let providers = state.orchestrator.provider_statuses();
    let status = determine_health_status(&providers);

    HealthResponse {
        status,
        version: state.version.clone(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        current_time: Utc::now(),
        providers,
        orchestrator: state.orchestrator.stats(),
        analytics_subscriptions: state.analytics.subscription_count(),
        events: state.orchestrator.hub().stats(),
    }
}

fn is_ready(providers: &[ProviderStatus]) -> bool {
    providers.iter().any(ProviderStatus::is_connected)
}

fn determine_health_status(providers: &[ProviderStatus]) -> HealthStatus {
    let connected_count = providers.iter().filter(|p| p.is_connected()).count();

    match connected_count {
        0 => HealthStatus::Unhealthy,
        n if n == providers.len() => HealthStatus::Healthy,
        _ => HealthStatus::Degraded,
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Health server errors.
#[derive(Debug, thiserror::Error)]
pub enum HealthServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;
    use crate::application::ports::ConnectionState;
    use crate::application::services::{AnalyticsEngineConfig, OrchestratorConfig};
    use crate::domain::clock::SystemClock;
    use crate::infrastructure::broadcast::EventHub;
    use crate::infrastructure::providers::{SimulatedProvider, SimulatedProviderConfig};

    fn provider(name: &str, state: ConnectionState) -> ProviderStatus {
        ProviderStatus {
            name: name.to_string(),
            state,
            last_connected_at: None,
            last_error: None,
            messages_received: 0,
            reconnect_attempts: 0,
        }
    }

    #[test]
    fn health_status_serialization() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Healthy).unwrap(),
            "\"healthy\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Degraded).unwrap(),
            "\"degraded\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Unhealthy).unwrap(),
            "\"unhealthy\""
        );
    }

    #[test_case(&[ConnectionState::Connected, ConnectionState::Connected] => HealthStatus::Healthy ; "all connected")]
    #[test_case(&[ConnectionState::Connected, ConnectionState::Reconnecting] => HealthStatus::Degraded ; "partial")]
    #[test_case(&[ConnectionState::Error, ConnectionState::Disconnected] => HealthStatus::Unhealthy ; "none connected")]
    #[test_case(&[] => HealthStatus::Unhealthy ; "no providers")]
    fn determine_status(states: &[ConnectionState]) -> HealthStatus {
        let providers: Vec<ProviderStatus> = states
            .iter()
            .enumerate()
            .map(|(i, state)| provider(&format!("p{i}"), *state))
            .collect();
        determine_health_status(&providers)
    }

    #[test]
    fn ready_when_any_provider_connected() {
        assert!(!is_ready(&[]));
        assert!(!is_ready(&[provider("a", ConnectionState::Connecting)]));
        assert!(is_ready(&[
            provider("a", ConnectionState::Error),
            provider("b", ConnectionState::Connected),
        ]));
    }

    #[tokio::test]
    async fn response_reflects_engine_state() {
        let orchestrator = Arc::new(StreamingOrchestrator::new(
            OrchestratorConfig::default(),
            Arc::new(EventHub::with_defaults()),
        ));
        orchestrator.register_provider(
            "simulated",
            Arc::new(SimulatedProvider::new(SimulatedProviderConfig::injection_only())),
        );
        let analytics = Arc::new(AnalyticsEngine::with_default_calculators(
            Arc::clone(&orchestrator),
            Arc::new(SystemClock),
            AnalyticsEngineConfig::default(),
        ));
        let state = HealthServerState::new("0.1.0".to_string(), Arc::clone(&orchestrator), analytics);

        let response = build_health_response(&state);
        assert_eq!(response.status, HealthStatus::Unhealthy);
        assert_eq!(response.providers[0].state, ConnectionState::Disconnected);

        orchestrator.initialize().await;

        let response = build_health_response(&state);
        assert_eq!(response.status, HealthStatus::Healthy);
        assert!(response.orchestrator.initialized);
        assert_eq!(response.analytics_subscriptions, 0);

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["providers"][0]["state"], "CONNECTED");
    }
}
