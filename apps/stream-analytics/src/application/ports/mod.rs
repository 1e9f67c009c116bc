//! Port Interfaces
//!
//! Contracts the application layer consumes, following the Hexagonal
//! Architecture pattern. Infrastructure adapters implement them.
//!
//! ## Driven Ports (Outbound)
//!
//! - `ProviderAdapter`: a market data vendor connection that can connect,
//!   subscribe per data type with a message callback, unsubscribe, and
//!   report its connection state as a stream of events

/// Market data provider adapter contract.
pub mod provider;

pub use provider::{
    ConnectionState, MessageCallback, ProviderAdapter, ProviderError, ProviderEvent,
    ProviderSubscription, ProviderSubscriptionId,
};

#[cfg(test)]
pub use provider::MockProviderAdapter;
