//! Application Services
//!
//! Services that coordinate domain logic across ports.
//!
//! - `Pipeline`: Staged, buffered processing of one message stream
//! - `StreamingOrchestrator`: Provider routing, subscriptions and pipelines
//! - `AnalyticsEngine`: Windowed calculators on top of orchestrator subscriptions

mod analytics;
mod orchestrator;
mod pipeline;

pub use analytics::{AnalyticsEngine, AnalyticsEngineConfig, AnalyticsError};
pub use orchestrator::{
    InitializationSummary, OrchestratorConfig, OrchestratorError, OrchestratorStats,
    ProviderStatus, StreamingOrchestrator,
};
pub use pipeline::{
    Pipeline, PipelineError, PipelineState, PipelineStats, PushOutcome, StageStats,
};
