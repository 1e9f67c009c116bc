//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services and port interfaces
//! that define how the domain interacts with external systems.

/// Port interfaces for external systems (market data providers).
pub mod ports;

/// Pipeline runtime, streaming orchestrator and analytics engine.
pub mod services;
