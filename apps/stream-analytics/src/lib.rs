#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Stream Analytics - Streaming Pipeline and Windowed Analytics Engine
//!
//! Routes market data from provider adapters through per-subscription,
//! backpressure-aware pipelines and recomputes windowed analytics on a
//! fixed cadence.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Pure types and algorithms
//!   - `market_data`: Messages, payloads and data types
//!   - `pipeline`: Stage descriptors, bounded buffers, stage processors
//!   - `subscription`: Subscription options and symbol demand
//!   - `analytics`: Analytics types, sliding windows, calculators
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Provider adapter contract
//!   - `services`: Pipeline runtime, streaming orchestrator, analytics engine
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `providers`: Simulated provider adapter
//!   - `broadcast`: Engine events and analytics result topics
//!   - `config`: Environment configuration
//!   - `health`: Health check HTTP endpoint
//!
//! # Data Flow
//!
//! ```text
//! Provider ──► Pipeline (per subscription, per data type) ──► Listeners
//!                                                              │
//!                      Analytics windows ◄─────────────────────┘
//!                              │ every update interval
//!                              ▼
//!                         Calculator ──► Result listeners, result topics
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core types with no runtime dependencies.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::analytics::{AnalyticsConfig, AnalyticsResult, AnalyticsType};
pub use domain::clock::{Clock, ManualClock, SystemClock};
pub use domain::market_data::{DataType, MarketDataMessage, MarketPayload, Symbol};
pub use domain::pipeline::{DropPolicy, PipelineEvent, PipelineTemplate, Priority, StageDescriptor};
pub use domain::subscription::{SubscriptionId, SubscriptionOptions};

// Ports
pub use application::ports::{ConnectionState, ProviderAdapter, ProviderError, ProviderEvent};

// Services
pub use application::services::{
    AnalyticsEngine, AnalyticsEngineConfig, AnalyticsError, OrchestratorConfig,
    OrchestratorError, Pipeline, PipelineError, PushOutcome, StreamingOrchestrator,
};

// Infrastructure config
pub use infrastructure::config::{
    AnalyticsSettings, BroadcastSettings, ConfigError, EngineConfig, OrchestratorSettings,
    ServerSettings, SimulatorSettings,
};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Event hub
pub use infrastructure::broadcast::{AnalyticsEvent, EventHub, SharedEventHub, StreamEvent};

// Providers
pub use infrastructure::providers::{SimulatedProvider, SimulatedProviderConfig};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
