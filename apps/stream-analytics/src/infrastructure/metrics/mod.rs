//! Prometheus Metrics Module
//!
//! Exposes engine metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Messages**: received from providers, emitted by pipelines, dropped
//! - **Pipelines**: stage errors and backpressure events
//! - **Subscriptions**: active data and analytics subscriptions, demanded symbols
//! - **Providers**: connection state per provider
//! - **Analytics**: ticks, calculation errors and latency
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port. Recording
//! before `init_metrics` is a no-op.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::domain::analytics::AnalyticsType;
use crate::domain::market_data::DataType;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// Subsequent calls return the handle installed by the first.
///
/// # Errors
///
/// Returns an error if the recorder cannot be installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Message counters
    describe_counter!(
        "stream_engine_messages_received_total",
        "Total messages received from providers"
    );
    describe_counter!(
        "stream_engine_messages_emitted_total",
        "Total messages delivered to pipeline listeners"
    );
    describe_counter!(
        "stream_engine_messages_dropped_total",
        "Total messages dropped at pipeline admission"
    );

    // Pipeline counters
    describe_counter!(
        "stream_engine_stage_errors_total",
        "Total messages a stage processor failed on"
    );
    describe_counter!(
        "stream_engine_backpressure_total",
        "Total backpressure events from REJECT stages"
    );

    // Subscription gauges
    describe_gauge!(
        "stream_engine_subscriptions",
        "Number of active data subscriptions"
    );
    describe_gauge!(
        "stream_engine_active_symbols",
        "Number of distinct symbols demanded per data type"
    );
    describe_gauge!(
        "stream_engine_analytics_subscriptions",
        "Number of active analytics subscriptions"
    );

    // Provider gauges
    describe_gauge!(
        "stream_engine_provider_connected",
        "Whether a provider is connected (1) or not (0)"
    );

    // Analytics
    describe_counter!(
        "stream_engine_analytics_ticks_total",
        "Total analytics ticks that ran a calculator"
    );
    describe_counter!(
        "stream_engine_calculation_errors_total",
        "Total calculator failures"
    );
    describe_histogram!(
        "stream_engine_calculation_seconds",
        "Time spent in one calculator invocation"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Why a message was dropped at admission.
#[derive(Debug, Clone, Copy)]
pub enum DropReason {
    /// Evicted from the head of a full `OLDEST` buffer.
    Evicted,
    /// Discarded by a full `NEWEST` buffer.
    Discarded,
    /// Refused by a full `REJECT` buffer.
    Rejected,
    /// Pushed into a stopped pipeline.
    Closed,
}

impl DropReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Evicted => "evicted",
            Self::Discarded => "discarded",
            Self::Rejected => "rejected",
            Self::Closed => "closed",
        }
    }
}

/// Record a message received from a provider.
pub fn record_message_received(provider: &str, data_type: DataType) {
    counter!(
        "stream_engine_messages_received_total",
        "provider" => provider.to_string(),
        "data_type" => data_type.as_str()
    )
    .increment(1);
}

/// Record a message delivered to pipeline listeners.
pub fn record_message_emitted(data_type: DataType) {
    counter!(
        "stream_engine_messages_emitted_total",
        "data_type" => data_type.as_str()
    )
    .increment(1);
}

/// Record a message dropped at pipeline admission.
pub fn record_message_dropped(data_type: DataType, reason: DropReason) {
    counter!(
        "stream_engine_messages_dropped_total",
        "data_type" => data_type.as_str(),
        "reason" => reason.as_str()
    )
    .increment(1);
}

/// Record a stage processor failure.
pub fn record_stage_error(data_type: DataType, stage: &str) {
    counter!(
        "stream_engine_stage_errors_total",
        "data_type" => data_type.as_str(),
        "stage" => stage.to_string()
    )
    .increment(1);
}

/// Record a backpressure event.
pub fn record_backpressure(data_type: DataType, stage: &str) {
    counter!(
        "stream_engine_backpressure_total",
        "data_type" => data_type.as_str(),
        "stage" => stage.to_string()
    )
    .increment(1);
}

/// Update the active data subscription count.
pub fn set_subscriptions(count: usize) {
    gauge!("stream_engine_subscriptions").set(count as f64);
}

/// Update the demanded symbol count for a data type.
pub fn set_active_symbols(data_type: DataType, count: usize) {
    gauge!(
        "stream_engine_active_symbols",
        "data_type" => data_type.as_str()
    )
    .set(count as f64);
}

/// Update the active analytics subscription count.
pub fn set_analytics_subscriptions(count: usize) {
    gauge!("stream_engine_analytics_subscriptions").set(count as f64);
}

/// Update a provider's connection gauge.
pub fn set_provider_connected(provider: &str, connected: bool) {
    gauge!(
        "stream_engine_provider_connected",
        "provider" => provider.to_string()
    )
    .set(if connected { 1.0 } else { 0.0 });
}

/// Record one calculator invocation.
pub fn record_calculation(analytics_type: AnalyticsType, duration: Duration) {
    counter!(
        "stream_engine_analytics_ticks_total",
        "analytics_type" => analytics_type.as_str()
    )
    .increment(1);
    histogram!(
        "stream_engine_calculation_seconds",
        "analytics_type" => analytics_type.as_str()
    )
    .record(duration.as_secs_f64());
}

/// Record a calculator failure.
pub fn record_calculation_error(analytics_type: AnalyticsType) {
    counter!(
        "stream_engine_calculation_errors_total",
        "analytics_type" => analytics_type.as_str()
    )
    .increment(1);
}

// =============================================================================
// Tests
// =============================================================================
