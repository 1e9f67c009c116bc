//! Stream Analytics Binary
//!
//! Starts the streaming orchestrator against the simulated provider and
//! runs a set of analytics subscriptions over the configured symbols.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin stream-analytics
//! ```
//!
//! # Environment Variables
//!
//! - `STREAM_ANALYTICS_SYMBOLS`: Comma-separated symbols (default: AAPL,MSFT,SPY)
//! - `STREAM_ANALYTICS_TICK_INTERVAL_MS`: Simulator cadence (default: 250)
//! - `STREAM_ANALYTICS_HEALTH_PORT`: Health check HTTP port (default: 8083)
//! - `STREAM_ANALYTICS_*`: Pipeline and analytics defaults, see `EngineConfig`
//! - `OTEL_ENABLED`: Export traces over OTLP (default: false)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use stream_analytics::infrastructure::health::{HealthServer, HealthServerState};
use stream_analytics::infrastructure::telemetry;
use stream_analytics::{
    AnalyticsConfig, AnalyticsEngine, AnalyticsEvent, AnalyticsType, EngineConfig, EventHub,
    SharedEventHub, SimulatedProvider, StreamEvent, StreamingOrchestrator, SystemClock,
    init_metrics,
};
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

/// Analytics started for every configured symbol.
const STARTUP_ANALYTICS: &[AnalyticsType] = &[
    AnalyticsType::Vwap,
    AnalyticsType::BidAskSpread,
    AnalyticsType::Momentum,
];

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();

    // Initialize telemetry (tracing + optional OTLP)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting stream analytics engine");

    // Initialize Prometheus metrics
    if let Err(e) = init_metrics() {
        tracing::warn!(error = %e, "Metrics recorder unavailable");
    }

    let config = EngineConfig::from_env().context("invalid engine configuration")?;
    log_config(&config);
    let EngineConfig {
        orchestrator: orchestrator_settings,
        analytics: analytics_settings,
        broadcast: broadcast_settings,
        server: server_settings,
        simulator: simulator_settings,
    } = config;

    let shutdown_token = CancellationToken::new();
    let symbols = simulator_settings.symbols.clone();

    // Wire the engine
    let hub: SharedEventHub = Arc::new(EventHub::new(broadcast_settings.into()));
    let orchestrator = Arc::new(StreamingOrchestrator::new(
        orchestrator_settings.into(),
        Arc::clone(&hub),
    ));
    orchestrator.register_provider(
        "simulated",
        Arc::new(SimulatedProvider::new(simulator_settings.into())),
    );

    tokio::spawn(log_stream_events(Arc::clone(&hub), shutdown_token.clone()));
    tokio::spawn(log_analytics_events(Arc::clone(&hub), shutdown_token.clone()));

    let summary = orchestrator.initialize().await;
    if summary.connected.is_empty() {
        anyhow::bail!("no provider connected (failed: {:?})", summary.failed);
    }

    let analytics = Arc::new(AnalyticsEngine::with_default_calculators(
        Arc::clone(&orchestrator),
        Arc::new(SystemClock),
        analytics_settings.into(),
    ));

    for &analytics_type in STARTUP_ANALYTICS {
        let id = analytics
            .subscribe(AnalyticsConfig::new(analytics_type, symbols.iter().cloned()))
            .with_context(|| format!("failed to start {analytics_type} analytics"))?;
        tracing::info!(subscription_id = %id, %analytics_type, "Analytics running");
        tokio::spawn(log_results(
            Arc::clone(&hub),
            analytics_type,
            shutdown_token.clone(),
        ));
    }

    // Spawn health server
    let health_state = Arc::new(HealthServerState::new(
        env!("CARGO_PKG_VERSION").to_string(),
        Arc::clone(&orchestrator),
        Arc::clone(&analytics),
    ));
    let health_server = HealthServer::new(
        server_settings.health_port,
        health_state,
        shutdown_token.clone(),
    );
    let health_task = tokio::spawn(async move {
        if let Err(e) = health_server.run().await {
            tracing::error!(error = %e, "Health server error");
        }
    });

    tracing::info!("Stream analytics engine ready");

    await_shutdown().await;

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
    let teardown = async {
        analytics.shutdown();
        orchestrator.shutdown().await;
        shutdown_token.cancel();
        let _ = health_task.await;
    };
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, teardown).await.is_err() {
        tracing::warn!("Graceful shutdown timed out");
    }

    tracing::info!("Stream analytics engine stopped");
    Ok(())
}

/// Log engine stream events until shutdown.
async fn log_stream_events(hub: SharedEventHub, cancel: CancellationToken) {
    let mut rx = hub.stream_events();
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = rx.recv() => event,
        };
        match event {
            Ok(
                event @ (StreamEvent::ProviderConnectionFailed { .. }
                | StreamEvent::ProviderError { .. }
                | StreamEvent::ProcessingError { .. }),
            ) => tracing::warn!(event = event.name(), details = ?event, "Stream event"),
            Ok(event) => tracing::debug!(event = event.name(), details = ?event, "Stream event"),
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Stream event logger lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Log analytics lifecycle events until shutdown.
async fn log_analytics_events(hub: SharedEventHub, cancel: CancellationToken) {
    let mut rx = hub.analytics_events();
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = rx.recv() => event,
        };
        match event {
            Ok(AnalyticsEvent::CalculationError {
                subscription_id,
                analytics_type,
                error,
            }) => tracing::warn!(%subscription_id, %analytics_type, %error, "Calculation error"),
            Ok(event) => tracing::debug!(details = ?event, "Analytics event"),
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Analytics event logger lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Log results of one analytics type until shutdown.
async fn log_results(hub: SharedEventHub, analytics_type: AnalyticsType, cancel: CancellationToken) {
    let mut rx = hub.results(analytics_type);
    loop {
        let result = tokio::select! {
            () = cancel.cancelled() => break,
            result = rx.recv() => result,
        };
        match result {
            Ok(result) => tracing::info!(
                analytics_type = %result.analytics_type,
                symbol = %result.symbol,
                value = result.value,
                confidence = ?result.confidence,
                "Analytics result"
            ),
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!(skipped, %analytics_type, "Result logger lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Load .env file from current or ancestor directories.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &EngineConfig) {
    tracing::info!(
        default_provider = %config.orchestrator.default_provider,
        default_capacity = config.orchestrator.default_capacity,
        default_policy = %config.orchestrator.default_policy,
        throttle_rate = config.analytics.throttle_rate,
        health_port = config.server.health_port,
        symbols = ?config.simulator.symbols,
        "Configuration loaded"
    );
    tracing::debug!(
        connect_timeout_ms = config.orchestrator.connect_timeout.as_millis(),
        dedup_window_ms = config.analytics.deduplication_window.as_millis(),
        tick_interval_ms = config.simulator.tick_interval.as_millis(),
        "Engine timings"
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn await_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
