//! Domain Layer - Core streaming types and business logic.
//!
//! Pure types and algorithms: nothing here spawns tasks or touches the
//! network. Everything that needs a runtime lives in the application layer.

/// Market data messages, payloads and data types.
pub mod market_data;

/// Wall clock abstraction.
pub mod clock;

/// Token-based listener registry.
pub mod listener;

/// Stage descriptors, bounded buffers and stage processors.
pub mod pipeline;

/// Subscription options and symbol demand tracking.
pub mod subscription;

/// Analytics types, sliding windows and calculators.
pub mod analytics;
