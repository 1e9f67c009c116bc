//! Provider Adapter Port (Driven Port)
//!
//! Interface every market data vendor connection implements. The
//! orchestrator only ever talks to providers through this trait, so
//! several vendors can be live at once and tests can substitute mocks.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::domain::market_data::{DataType, MarketDataMessage, Symbol};

/// Provider-assigned identifier of a provider-level subscription.
pub type ProviderSubscriptionId = String;

/// Callback a provider invokes for each message of a subscription.
pub type MessageCallback = Arc<dyn Fn(MarketDataMessage) + Send + Sync>;

/// Connection state of a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// Not connected.
    #[default]
    Disconnected,
    /// Connection in progress.
    Connecting,
    /// Connected and streaming.
    Connected,
    /// Lost connection, retrying.
    Reconnecting,
    /// Failed and not retrying.
    Error,
}

impl ConnectionState {
    /// Get as string for logging and health output.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection lifecycle event published by a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    /// The connection is open and ready for subscriptions.
    Open,
    /// The connection state changed.
    StateChange(ConnectionState),
    /// The provider hit an error.
    Error(String),
}

/// A live provider-level subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderSubscription {
    /// Provider-assigned id.
    pub id: ProviderSubscriptionId,
    /// Data type streamed.
    pub channel: DataType,
    /// Symbols streamed.
    pub symbols: Vec<Symbol>,
}

/// Errors from provider operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// Connection could not be established.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Operation needs an open connection.
    #[error("provider not connected")]
    NotConnected,

    /// The provider does not stream this data type.
    #[error("unsupported data type: {0}")]
    UnsupportedDataType(DataType),

    /// The provider refused the subscription.
    #[error("subscription failed: {0}")]
    SubscriptionFailed(String),
}

/// Market data provider connection.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Start connecting. Completion is signalled by `ProviderEvent::Open`.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError` if the attempt cannot be started or fails
    /// outright.
    async fn connect(&self) -> Result<(), ProviderError>;

    /// Close the connection and drop every subscription.
    async fn disconnect(&self);

    /// Stream `data_type` for `symbols`, invoking `callback` per message.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError` if the provider refuses the subscription.
    fn subscribe_market_data(
        &self,
        data_type: DataType,
        symbols: &[Symbol],
        callback: MessageCallback,
    ) -> Result<ProviderSubscriptionId, ProviderError>;

    /// Stop a provider-level subscription. Returns false if unknown.
    fn unsubscribe(&self, subscription_id: &str) -> bool;

    /// Provider-level subscriptions currently live.
    fn subscriptions(&self) -> Vec<ProviderSubscription>;

    /// Subscribe to connection lifecycle events.
    fn events(&self) -> broadcast::Receiver<ProviderEvent>;

    /// Current connection state.
    fn state(&self) -> ConnectionState;
}
