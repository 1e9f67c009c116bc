//! Configuration Module
//!
//! Configuration loading for the stream analytics engine.

mod settings;

pub use settings::{
    AnalyticsSettings, BroadcastSettings, ConfigError, EngineConfig, OrchestratorSettings,
    ServerSettings, SimulatorSettings,
};
