//! Broadcast Channel Adapters
//!
//! Process-wide event fan-out using tokio broadcast channels.
//!
//! # Architecture
//!
//! The `EventHub` carries three kinds of traffic:
//! - `StreamEvent`: provider connectivity, pipeline backpressure and
//!   processing errors, orchestrator lifecycle
//! - `AnalyticsEvent`: analytics subscription lifecycle and calculation errors
//! - `AnalyticsResult` topics: `analytics:<type>` and `analytics:<type>:<symbol>`
//!
//! Result topics are created when first subscribed and pruned once their
//! last receiver is gone, so publishing to a topic nobody watches is free.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::BroadcastSettings;
use crate::application::ports::ConnectionState;
use crate::domain::analytics::{AnalyticsResult, AnalyticsType};
use crate::domain::market_data::DataType;
use crate::domain::subscription::SubscriptionId;

// =============================================================================
// Events
// =============================================================================

/// Event emitted by the streaming orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    /// A provider connected and reported `open`.
    ProviderConnected {
        /// Provider name.
        provider: String,
    },
    /// A provider reported a connection state change.
    ProviderConnectionChange {
        /// Provider name.
        provider: String,
        /// New state.
        state: ConnectionState,
    },
    /// A provider failed to connect during initialization.
    ProviderConnectionFailed {
        /// Provider name.
        provider: String,
        /// Failure reason.
        error: String,
    },
    /// A provider reported an error after connecting.
    ProviderError {
        /// Provider name.
        provider: String,
        /// Error text.
        error: String,
    },
    /// A `REJECT` stage buffer refused a message.
    Backpressure {
        /// Owning subscription.
        subscription_id: SubscriptionId,
        /// Pipeline data type.
        data_type: DataType,
        /// Stage name.
        stage: String,
        /// Buffer capacity.
        capacity: usize,
        /// `buffered / capacity`.
        utilization: f64,
        /// Total messages this stage has dropped.
        dropped: u64,
    },
    /// A stage failed on one message.
    ProcessingError {
        /// Owning subscription.
        subscription_id: SubscriptionId,
        /// Pipeline data type.
        data_type: DataType,
        /// Stage name.
        stage: String,
        /// Error text.
        error: String,
    },
    /// A pipeline stopped with messages still buffered.
    PipelineDrained {
        /// Owning subscription.
        subscription_id: SubscriptionId,
        /// Pipeline data type.
        data_type: DataType,
        /// Messages discarded.
        discarded: usize,
    },
    /// Initialization finished.
    Initialized {
        /// Providers that connected.
        connected: Vec<String>,
        /// Providers that failed.
        failed: Vec<String>,
    },
    /// Shutdown finished.
    Shutdown,
}

impl StreamEvent {
    /// Event name for logging and metric labels.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ProviderConnected { .. } => "provider_connected",
            Self::ProviderConnectionChange { .. } => "provider_connection_change",
            Self::ProviderConnectionFailed { .. } => "provider_connection_failed",
            Self::ProviderError { .. } => "provider_error",
            Self::Backpressure { .. } => "backpressure",
            Self::ProcessingError { .. } => "processing_error",
            Self::PipelineDrained { .. } => "pipeline_drained",
            Self::Initialized { .. } => "initialized",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Event emitted by the analytics engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AnalyticsEvent {
    /// An analytics subscription started.
    Subscribed {
        /// Analytics subscription id.
        subscription_id: SubscriptionId,
        /// Calculator type.
        analytics_type: AnalyticsType,
    },
    /// An analytics subscription ended.
    Unsubscribed {
        /// Analytics subscription id.
        subscription_id: SubscriptionId,
    },
    /// A calculator failed on one tick.
    CalculationError {
        /// Analytics subscription id.
        subscription_id: SubscriptionId,
        /// Calculator type.
        analytics_type: AnalyticsType,
        /// Error text.
        error: String,
    },
}

// =============================================================================
// Event Hub
// =============================================================================

/// Configuration for event channel capacities.
#[derive(Debug, Clone, Copy)]
pub struct EventHubConfig {
    /// Capacity for the stream event channel.
    pub stream_events_capacity: usize,
    /// Capacity for the analytics event channel.
    pub analytics_events_capacity: usize,
    /// Capacity for each result topic.
    pub result_topic_capacity: usize,
}

impl Default for EventHubConfig {
    fn default() -> Self {
        Self {
            stream_events_capacity: 1_024,
            analytics_events_capacity: 1_024,
            result_topic_capacity: 256,
        }
    }
}

impl From<BroadcastSettings> for EventHubConfig {
    fn from(settings: BroadcastSettings) -> Self {
        Self {
            stream_events_capacity: settings.stream_events_capacity,
            analytics_events_capacity: settings.analytics_events_capacity,
            result_topic_capacity: settings.result_topic_capacity,
        }
    }
}

/// Central hub for process-wide events.
///
/// # Example
///
/// ```rust
/// use stream_analytics::domain::analytics::AnalyticsType;
/// use stream_analytics::infrastructure::broadcast::{EventHub, EventHubConfig};
///
/// let hub = EventHub::new(EventHubConfig::default());
///
/// // Watch every VWAP result, or only AAPL's
/// let _all = hub.results(AnalyticsType::Vwap);
/// let _aapl = hub.symbol_results(AnalyticsType::Vwap, "AAPL");
/// assert_eq!(hub.stats().result_topics, 2);
/// ```
#[derive(Debug)]
pub struct EventHub {
    stream_tx: broadcast::Sender<StreamEvent>,
    analytics_tx: broadcast::Sender<AnalyticsEvent>,
    topics: RwLock<HashMap<String, broadcast::Sender<AnalyticsResult>>>,
    topic_capacity: usize,
}

impl EventHub {
    /// Create a new event hub with the given configuration.
    #[must_use]
    pub fn new(config: EventHubConfig) -> Self {
        Self {
            stream_tx: broadcast::channel(config.stream_events_capacity.max(1)).0,
            analytics_tx: broadcast::channel(config.analytics_events_capacity.max(1)).0,
            topics: RwLock::new(HashMap::new()),
            topic_capacity: config.result_topic_capacity.max(1),
        }
    }

    /// Create a new event hub with default configuration.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(EventHubConfig::default())
    }

    // =========================================================================
    // Stream Events
    // =========================================================================

    /// Publish a stream event.
    ///
    /// Returns the number of receivers, or `None` if there are none.
    pub fn publish_stream(&self, event: StreamEvent) -> Option<usize> {
        tracing::trace!(event = event.name(), "Stream event");
        self.stream_tx.send(event).ok()
    }

    /// Get a new receiver for stream events.
    #[must_use]
    pub fn stream_events(&self) -> broadcast::Receiver<StreamEvent> {
        self.stream_tx.subscribe()
    }

    // =========================================================================
    // Analytics Events
    // =========================================================================

    /// Publish an analytics event.
    pub fn publish_analytics(&self, event: AnalyticsEvent) -> Option<usize> {
        self.analytics_tx.send(event).ok()
    }

    /// Get a new receiver for analytics events.
    #[must_use]
    pub fn analytics_events(&self) -> broadcast::Receiver<AnalyticsEvent> {
        self.analytics_tx.subscribe()
    }

    // =========================================================================
    // Result Topics
    // =========================================================================

    /// Subscribe to a result topic by name.
    #[must_use]
    pub fn subscribe_topic(&self, topic: &str) -> broadcast::Receiver<AnalyticsResult> {
        if let Some(sender) = self.topics.read().get(topic) {
            return sender.subscribe();
        }
        self.topics
            .write()
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.topic_capacity).0)
            .subscribe()
    }

    /// Subscribe to every result of one analytics type.
    #[must_use]
    pub fn results(&self, analytics_type: AnalyticsType) -> broadcast::Receiver<AnalyticsResult> {
        self.subscribe_topic(&analytics_type.topic())
    }

    /// Subscribe to results of one analytics type for one symbol.
    #[must_use]
    pub fn symbol_results(
        &self,
        analytics_type: AnalyticsType,
        symbol: &str,
    ) -> broadcast::Receiver<AnalyticsResult> {
        self.subscribe_topic(&analytics_type.symbol_topic(symbol))
    }

    /// Publish a result on its type topic and its type+symbol topic.
    ///
    /// Returns the number of receivers reached.
    pub fn publish_result(&self, result: &AnalyticsResult) -> usize {
        let topics = [
            result.analytics_type.topic(),
            result.analytics_type.symbol_topic(&result.symbol),
        ];

        let mut delivered = 0;
        let mut stale = Vec::new();
        {
            let senders = self.topics.read();
            for topic in topics {
                if let Some(sender) = senders.get(&topic) {
                    match sender.send(result.clone()) {
                        Ok(count) => delivered += count,
                        Err(_) => stale.push(topic),
                    }
                }
            }
        }

        if !stale.is_empty() {
            let mut senders = self.topics.write();
            for topic in stale {
                if senders.get(&topic).is_some_and(|s| s.receiver_count() == 0) {
                    senders.remove(&topic);
                }
            }
        }

        delivered
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    /// Get statistics about all channels.
    #[must_use]
    pub fn stats(&self) -> EventHubStats {
        let topics = self.topics.read();
        EventHubStats {
            stream_receivers: self.stream_tx.receiver_count(),
            analytics_receivers: self.analytics_tx.receiver_count(),
            result_topics: topics.len(),
            result_receivers: topics.values().map(broadcast::Sender::receiver_count).sum(),
        }
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Shared event hub reference.
pub type SharedEventHub = Arc<EventHub>;

/// Statistics about event channels.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EventHubStats {
    /// Number of stream event receivers.
    pub stream_receivers: usize,
    /// Number of analytics event receivers.
    pub analytics_receivers: usize,
    /// Number of live result topics.
    pub result_topics: usize,
    /// Number of result receivers across topics.
    pub result_receivers: usize,
}

impl EventHubStats {
    /// Get total number of receivers across all channels.
    #[must_use]
    pub const fn total_receivers(&self) -> usize {
        self.stream_receivers + self.analytics_receivers + self.result_receivers
    }
}

// =============================================================================
// Tests
// =============================================================================
