//! Provider Adapters
//!
//! Concrete `ProviderAdapter` implementations.

mod simulated;

pub use simulated::{SimulatedProvider, SimulatedProviderConfig};
