//! Streaming Orchestrator
//!
//! Owns provider connections, routes each data type to a provider and
//! builds one `Pipeline` per (subscription, data type) channel.
//!
//! # Channels
//!
//! A channel is the unit of wiring:
//!
//! ```text
//! provider callback ──► slot (Arc<Pipeline>) ──► ListenerRegistry ──► listeners
//!                            │
//!                            └─ pipeline events ──► forwarder ──► EventHub
//! ```
//!
//! The provider callback pushes through a swappable slot, so inserting a
//! custom processor swaps a freshly started pipeline in without touching
//! the provider subscription. The listener registry is shared by every
//! pipeline a channel ever had, so reconfiguration never loses listeners.
//!
//! # Locking
//!
//! The subscription table lock serializes `subscribe`, `unsubscribe`,
//! `set_provider_for_data_type` and `register_processor`. It is never held
//! across an await point and never taken from a provider callback.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;

use super::pipeline::{Pipeline, PipelineError, PipelineStats, PushOutcome};
use crate::OrchestratorSettings;
use crate::application::ports::{
    ConnectionState, MessageCallback, ProviderAdapter, ProviderError, ProviderEvent,
    ProviderSubscriptionId,
};
use crate::domain::listener::{ListenerId, ListenerRegistry};
use crate::domain::market_data::{DataType, MarketDataMessage};
use crate::domain::pipeline::{CustomProcessor, DropPolicy, PipelineEvent, PipelineTemplate};
use crate::domain::subscription::{
    DemandStats, OptionsError, SubscriptionId, SubscriptionOptions, SymbolDemand,
};
use crate::infrastructure::broadcast::{SharedEventHub, StreamEvent};
use crate::infrastructure::metrics::{self, DropReason};

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the streaming orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Time allowed for a provider to connect and report `open`.
    pub connect_timeout: Duration,
    /// Provider used for data types without an explicit route.
    pub default_provider: String,
    /// Stage buffer capacity when a subscription sets no buffer size.
    pub default_capacity: usize,
    /// Stage drop policy when a subscription sets none.
    pub default_policy: DropPolicy,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorSettings::default().into()
    }
}

impl From<OrchestratorSettings> for OrchestratorConfig {
    fn from(settings: OrchestratorSettings) -> Self {
        Self {
            connect_timeout: settings.connect_timeout,
            default_provider: settings.default_provider,
            default_capacity: settings.default_capacity,
            default_policy: settings.default_policy,
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Orchestrator errors.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// `subscribe` called before `initialize`.
    #[error("orchestrator not initialized")]
    NotInitialized,

    /// Subscription options failed validation.
    #[error("invalid subscription options: {0}")]
    InvalidOptions(#[from] OptionsError),

    /// No provider registered under this name.
    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    /// A provider refused a subscription.
    #[error("provider {provider} refused {data_type}: {source}")]
    Provider {
        /// Provider name.
        provider: String,
        /// Data type requested.
        data_type: DataType,
        /// Provider error.
        #[source]
        source: ProviderError,
    },

    /// A pipeline could not be started.
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

// =============================================================================
// Provider Health
// =============================================================================

/// Live connection record of one provider.
#[derive(Debug)]
pub struct ProviderHealth {
    state: RwLock<ConnectionState>,
    last_connected_at: RwLock<Option<DateTime<Utc>>>,
    last_error: RwLock<Option<String>>,
    messages_received: AtomicU64,
    reconnect_attempts: AtomicU32,
}

impl ProviderHealth {
    const fn new() -> Self {
        Self {
            state: RwLock::new(ConnectionState::Disconnected),
            last_connected_at: RwLock::new(None),
            last_error: RwLock::new(None),
            messages_received: AtomicU64::new(0),
            reconnect_attempts: AtomicU32::new(0),
        }
    }

    /// Set the connection state.
    pub fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
        match state {
            ConnectionState::Connected => {
                *self.last_connected_at.write() = Some(Utc::now());
                self.reconnect_attempts.store(0, Ordering::Relaxed);
                *self.last_error.write() = None;
            }
            ConnectionState::Reconnecting => {
                self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    /// Record an error without changing state.
    pub fn record_error(&self, message: String) {
        *self.last_error.write() = Some(message);
    }

    /// Increment messages received counter.
    pub fn increment_messages(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    fn snapshot(&self, name: &str) -> ProviderStatus {
        ProviderStatus {
            name: name.to_string(),
            state: self.state(),
            last_connected_at: *self.last_connected_at.read(),
            last_error: self.last_error.read().clone(),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of a provider's health.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderStatus {
    /// Provider name.
    pub name: String,
    /// Connection state.
    pub state: ConnectionState,
    /// Last successful connection.
    pub last_connected_at: Option<DateTime<Utc>>,
    /// Last reported error.
    pub last_error: Option<String>,
    /// Messages received across subscriptions.
    pub messages_received: u64,
    /// Reconnect attempts since the last successful connection.
    pub reconnect_attempts: u32,
}

impl ProviderStatus {
    /// Whether the provider is connected.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

// =============================================================================
// Results and Statistics
// =============================================================================

/// Outcome of `initialize`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InitializationSummary {
    /// Providers that connected.
    pub connected: Vec<String>,
    /// Providers that failed or timed out.
    pub failed: Vec<String>,
}

impl InitializationSummary {
    /// Whether every provider connected.
    #[must_use]
    pub fn all_connected(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Orchestrator-wide counters.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStats {
    /// Whether `initialize` has completed.
    pub initialized: bool,
    /// Registered providers.
    pub providers: usize,
    /// Connected providers.
    pub connected_providers: usize,
    /// Live subscriptions.
    pub subscriptions: usize,
    /// Live pipelines.
    pub pipelines: usize,
    /// Symbol demand per data type.
    pub demand: BTreeMap<DataType, DemandStats>,
}

// =============================================================================
// Internals
// =============================================================================

struct ProviderEntry {
    adapter: Arc<dyn ProviderAdapter>,
    health: Arc<ProviderHealth>,
    watcher: Mutex<Option<CancellationToken>>,
}

struct Channel {
    provider: String,
    provider_subscription_id: ProviderSubscriptionId,
    slot: Arc<RwLock<Arc<Pipeline>>>,
    listeners: Arc<ListenerRegistry<MarketDataMessage>>,
}

impl Channel {
    fn pipeline(&self) -> Arc<Pipeline> {
        Arc::clone(&self.slot.read())
    }
}

struct SubscriptionEntry {
    options: SubscriptionOptions,
    channels: HashMap<DataType, Channel>,
}

const fn drop_reason(outcome: PushOutcome) -> Option<DropReason> {
    match outcome {
        PushOutcome::Accepted => None,
        PushOutcome::EvictedOldest => Some(DropReason::Evicted),
        PushOutcome::DroppedNewest => Some(DropReason::Discarded),
        PushOutcome::Rejected => Some(DropReason::Rejected),
        PushOutcome::Closed => Some(DropReason::Closed),
    }
}

async fn await_open(
    adapter: &dyn ProviderAdapter,
    events: &mut broadcast::Receiver<ProviderEvent>,
) -> Result<(), String> {
    adapter.connect().await.map_err(|e| e.to_string())?;
    if adapter.state() == ConnectionState::Connected {
        return Ok(());
    }

    loop {
        match events.recv().await {
            Ok(ProviderEvent::Open) => return Ok(()),
            Ok(ProviderEvent::Error(error)) => return Err(error),
            Ok(ProviderEvent::StateChange(ConnectionState::Error)) => {
                return Err("provider entered error state".to_string());
            }
            Ok(ProviderEvent::StateChange(_)) | Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => return Err("provider event stream closed".to_string()),
        }
    }
}

async fn watch_provider(
    name: String,
    mut events: broadcast::Receiver<ProviderEvent>,
    health: Arc<ProviderHealth>,
    hub: SharedEventHub,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Ok(ProviderEvent::Open) => {
                health.set_state(ConnectionState::Connected);
                metrics::set_provider_connected(&name, true);
                hub.publish_stream(StreamEvent::ProviderConnected {
                    provider: name.clone(),
                });
            }
            Ok(ProviderEvent::StateChange(state)) => {
                health.set_state(state);
                metrics::set_provider_connected(&name, state == ConnectionState::Connected);
                tracing::info!(provider = %name, state = %state, "Provider connection state changed");
                hub.publish_stream(StreamEvent::ProviderConnectionChange {
                    provider: name.clone(),
                    state,
                });
            }
            Ok(ProviderEvent::Error(error)) => {
                tracing::warn!(provider = %name, error = %error, "Provider error");
                health.record_error(error.clone());
                hub.publish_stream(StreamEvent::ProviderError {
                    provider: name.clone(),
                    error,
                });
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(provider = %name, skipped, "Provider event watcher lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }

    tracing::debug!(provider = %name, "Provider watcher stopped");
}

async fn forward_pipeline_events(
    subscription_id: SubscriptionId,
    data_type: DataType,
    mut events: broadcast::Receiver<PipelineEvent>,
    hub: SharedEventHub,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(%subscription_id, %data_type, skipped, "Pipeline event forwarder lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };

        let stream_event = match event {
            PipelineEvent::Backpressure {
                stage,
                capacity,
                utilization,
                dropped,
                ..
            } => {
                metrics::record_backpressure(data_type, &stage);
                StreamEvent::Backpressure {
                    subscription_id: subscription_id.clone(),
                    data_type,
                    stage,
                    capacity,
                    utilization,
                    dropped,
                }
            }
            PipelineEvent::StageError { stage, error } => {
                metrics::record_stage_error(data_type, &stage);
                StreamEvent::ProcessingError {
                    subscription_id: subscription_id.clone(),
                    data_type,
                    stage,
                    error,
                }
            }
            PipelineEvent::Drained { discarded: 0 } => continue,
            PipelineEvent::Drained { discarded } => StreamEvent::PipelineDrained {
                subscription_id: subscription_id.clone(),
                data_type,
                discarded,
            },
        };
        hub.publish_stream(stream_event);
    }
}

// =============================================================================
// Streaming Orchestrator
// =============================================================================

/// Routes data types to providers and owns every data subscription.
pub struct StreamingOrchestrator {
    config: OrchestratorConfig,
    hub: SharedEventHub,
    providers: RwLock<HashMap<String, ProviderEntry>>,
    routes: RwLock<HashMap<DataType, String>>,
    processors: RwLock<HashMap<DataType, Vec<CustomProcessor>>>,
    subscriptions: Mutex<HashMap<SubscriptionId, SubscriptionEntry>>,
    demand: SymbolDemand,
    initialized: AtomicBool,
    lifecycle: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for StreamingOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingOrchestrator")
            .field("initialized", &self.is_initialized())
            .field("providers", &self.providers.read().len())
            .field("subscriptions", &self.subscriptions.lock().len())
            .finish_non_exhaustive()
    }
}

impl StreamingOrchestrator {
    /// Create an orchestrator with no providers.
    #[must_use]
    pub fn new(config: OrchestratorConfig, hub: SharedEventHub) -> Self {
        Self {
            config,
            hub,
            providers: RwLock::new(HashMap::new()),
            routes: RwLock::new(HashMap::new()),
            processors: RwLock::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            demand: SymbolDemand::new(),
            initialized: AtomicBool::new(false),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Event hub this orchestrator publishes to.
    #[must_use]
    pub const fn hub(&self) -> &SharedEventHub {
        &self.hub
    }

    // =========================================================================
    // Providers
    // =========================================================================

    /// Register a provider under a name.
    ///
    /// Returns false if the name is taken.
    pub fn register_provider(&self, name: impl Into<String>, adapter: Arc<dyn ProviderAdapter>) -> bool {
        let name = name.into();
        let mut providers = self.providers.write();
        if providers.contains_key(&name) {
            return false;
        }
        tracing::debug!(provider = %name, "Provider registered");
        providers.insert(
            name,
            ProviderEntry {
                adapter,
                health: Arc::new(ProviderHealth::new()),
                watcher: Mutex::new(None),
            },
        );
        true
    }

    /// Connect every registered provider.
    ///
    /// Providers connect concurrently; each must report `open` within the
    /// connect timeout. Failures are reported through
    /// `StreamEvent::ProviderConnectionFailed` and never abort the others.
    /// Calling this again while initialized only reports current state.
    pub async fn initialize(&self) -> InitializationSummary {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_initialized() {
            return self.current_summary();
        }

        let providers: Vec<(String, Arc<dyn ProviderAdapter>, Arc<ProviderHealth>)> = self
            .providers
            .read()
            .iter()
            .map(|(name, entry)| (name.clone(), Arc::clone(&entry.adapter), Arc::clone(&entry.health)))
            .collect();

        let attempts = providers
            .iter()
            .map(|(name, adapter, health)| self.connect_provider(name, adapter.as_ref(), health));
        let outcomes = futures::future::join_all(attempts).await;

        let mut summary = InitializationSummary::default();
        for ((name, _, _), connected) in providers.into_iter().zip(outcomes) {
            if connected {
                summary.connected.push(name);
            } else {
                summary.failed.push(name);
            }
        }
        summary.connected.sort();
        summary.failed.sort();

        self.initialized.store(true, Ordering::Release);
        tracing::info!(
            connected = ?summary.connected,
            failed = ?summary.failed,
            "Streaming orchestrator initialized"
        );
        self.hub.publish_stream(StreamEvent::Initialized {
            connected: summary.connected.clone(),
            failed: summary.failed.clone(),
        });

        summary
    }

    async fn connect_provider(
        &self,
        name: &str,
        adapter: &dyn ProviderAdapter,
        health: &Arc<ProviderHealth>,
    ) -> bool {
        let mut events = adapter.events();
        health.set_state(ConnectionState::Connecting);
        tracing::info!(provider = %name, "Connecting provider");

        let outcome = tokio::time::timeout(self.config.connect_timeout, await_open(adapter, &mut events))
            .await
            .unwrap_or_else(|_| {
                Err(format!(
                    "timed out after {}ms",
                    self.config.connect_timeout.as_millis()
                ))
            });

        let connected = match outcome {
            Ok(()) => {
                health.set_state(ConnectionState::Connected);
                metrics::set_provider_connected(name, true);
                tracing::info!(provider = %name, "Provider connected");
                self.hub.publish_stream(StreamEvent::ProviderConnected {
                    provider: name.to_string(),
                });
                true
            }
            Err(error) => {
                health.set_state(ConnectionState::Disconnected);
                health.record_error(error.clone());
                metrics::set_provider_connected(name, false);
                tracing::warn!(provider = %name, error = %error, "Provider connection failed");
                self.hub.publish_stream(StreamEvent::ProviderConnectionFailed {
                    provider: name.to_string(),
                    error,
                });
                false
            }
        };

        // Failed providers are watched too, so a late `open` still surfaces.
        let cancel = CancellationToken::new();
        if let Some(entry) = self.providers.read().get(name)
            && let Some(previous) = entry.watcher.lock().replace(cancel.clone())
        {
            previous.cancel();
        }
        tokio::spawn(watch_provider(
            name.to_string(),
            events,
            Arc::clone(health),
            Arc::clone(&self.hub),
            cancel,
        ));

        connected
    }

    fn current_summary(&self) -> InitializationSummary {
        let mut summary = InitializationSummary::default();
        for status in self.provider_statuses() {
            if status.is_connected() {
                summary.connected.push(status.name);
            } else {
                summary.failed.push(status.name);
            }
        }
        summary
    }

    /// Route a data type to a registered provider.
    ///
    /// Every live channel of that data type is rebuilt on the new provider
    /// with its listeners intact. A channel whose new provider refuses the
    /// subscription stays on its old provider and the first such error is
    /// returned after all channels were attempted.
    ///
    /// # Errors
    ///
    /// Returns `UnknownProvider` before touching any route if the name is
    /// not registered.
    pub fn set_provider_for_data_type(
        &self,
        data_type: DataType,
        provider: &str,
    ) -> Result<(), OrchestratorError> {
        if !self.providers.read().contains_key(provider) {
            return Err(OrchestratorError::UnknownProvider(provider.to_string()));
        }

        let mut subscriptions = self.subscriptions.lock();
        let previous = self
            .routes
            .write()
            .insert(data_type, provider.to_string());
        tracing::info!(%data_type, provider, ?previous, "Provider route updated");

        let mut first_error = None;
        for (id, entry) in subscriptions.iter_mut() {
            let Some(current) = entry.channels.get(&data_type) else {
                continue;
            };
            if current.provider == provider {
                continue;
            }

            let listeners = Arc::clone(&current.listeners);
            match self.open_channel(id, data_type, &entry.options, listeners) {
                Ok(replacement) => {
                    if let Some(old) = entry.channels.insert(data_type, replacement) {
                        self.close_channel(id, data_type, &old, false);
                    }
                }
                Err(error) => {
                    tracing::warn!(subscription_id = %id, %data_type, error = %error, "Channel rebuild failed");
                    first_error.get_or_insert(error);
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Provider serving a data type.
    #[must_use]
    pub fn provider_for(&self, data_type: DataType) -> String {
        self.routes
            .read()
            .get(&data_type)
            .cloned()
            .unwrap_or_else(|| self.config.default_provider.clone())
    }

    /// Health of every registered provider, sorted by name.
    #[must_use]
    pub fn provider_statuses(&self) -> Vec<ProviderStatus> {
        let mut statuses: Vec<ProviderStatus> = self
            .providers
            .read()
            .iter()
            .map(|(name, entry)| entry.health.snapshot(name))
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    // =========================================================================
    // Processors
    // =========================================================================

    /// Insert a custom stage into the template of a data type.
    ///
    /// `position` indexes the custom processors (not the built-in stages);
    /// `None` appends. Every live pipeline of that data type is replaced by
    /// a started pipeline built from the new template and sharing the old
    /// one's listeners. Returns how many pipelines were replaced.
    ///
    /// # Errors
    ///
    /// Returns `Pipeline` if a replacement cannot be started.
    pub fn register_processor(
        &self,
        data_type: DataType,
        processor: CustomProcessor,
        position: Option<usize>,
    ) -> Result<usize, OrchestratorError> {
        let subscriptions = self.subscriptions.lock();
        {
            let mut processors = self.processors.write();
            let list = processors.entry(data_type).or_default();
            let index = position.map_or(list.len(), |p| p.min(list.len()));
            tracing::info!(%data_type, processor = processor.name(), index, "Processor registered");
            list.insert(index, processor);
        }

        let mut rebuilt = 0;
        for (id, entry) in subscriptions.iter() {
            let Some(channel) = entry.channels.get(&data_type) else {
                continue;
            };

            let replacement =
                self.start_pipeline(id, data_type, &entry.options, Arc::clone(&channel.listeners))?;
            let old = std::mem::replace(&mut *channel.slot.write(), replacement);
            old.stop();
            rebuilt += 1;
        }

        Ok(rebuilt)
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Open a data subscription.
    ///
    /// # Errors
    ///
    /// Returns `NotInitialized` before `initialize`, `InvalidOptions` for
    /// empty data types or symbols, `UnknownProvider` if a data type routes
    /// to an unregistered provider and `Provider` if a provider refuses.
    /// Channels already opened are rolled back on error.
    pub fn subscribe(&self, options: SubscriptionOptions) -> Result<SubscriptionId, OrchestratorError> {
        if !self.is_initialized() {
            return Err(OrchestratorError::NotInitialized);
        }
        options.validate()?;

        let id = SubscriptionId::generate();
        let mut subscriptions = self.subscriptions.lock();

        let mut channels: HashMap<DataType, Channel> = HashMap::new();
        for &data_type in &options.data_types {
            match self.open_channel(&id, data_type, &options, Arc::new(ListenerRegistry::new())) {
                Ok(channel) => {
                    channels.insert(data_type, channel);
                }
                Err(error) => {
                    for (data_type, channel) in channels.drain() {
                        self.close_channel(&id, data_type, &channel, true);
                    }
                    tracing::warn!(error = %error, "Subscription failed");
                    return Err(error);
                }
            }
        }

        for &data_type in &options.data_types {
            let changes = self.demand.add(&id, data_type, &options.symbols);
            if !changes.is_empty() {
                tracing::debug!(%data_type, added = ?changes.subscribe, "Symbol demand grew");
            }
            metrics::set_active_symbols(data_type, self.demand.stats(data_type).symbol_count);
        }

        tracing::info!(
            subscription_id = %id,
            data_types = ?options.data_types,
            symbols = ?options.symbols,
            "Subscription created"
        );
        subscriptions.insert(id.clone(), SubscriptionEntry { options, channels });
        metrics::set_subscriptions(subscriptions.len());

        Ok(id)
    }

    /// Close a data subscription. Returns false if the id is unknown.
    ///
    /// Provider-level subscriptions are released first so no new message
    /// enters; then pipelines are stopped and cleared and every listener
    /// is detached.
    pub fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        let mut subscriptions = self.subscriptions.lock();
        let Some(entry) = subscriptions.remove(id) else {
            return false;
        };

        for (data_type, channel) in &entry.channels {
            self.close_channel(id, *data_type, channel, true);
        }

        for (data_type, changes) in self.demand.remove(id) {
            tracing::debug!(%data_type, released = ?changes.unsubscribe, "Symbol demand shrank");
        }
        for data_type in entry.channels.keys() {
            metrics::set_active_symbols(*data_type, self.demand.stats(*data_type).symbol_count);
        }
        metrics::set_subscriptions(subscriptions.len());

        tracing::info!(subscription_id = %id, "Subscription removed");
        true
    }

    /// Attach a listener to one channel of a subscription.
    ///
    /// Returns `None` if the subscription or data type is not present.
    pub fn add_listener(
        &self,
        id: &SubscriptionId,
        data_type: DataType,
        listener: impl Fn(&MarketDataMessage) + Send + Sync + 'static,
    ) -> Option<ListenerId> {
        let subscriptions = self.subscriptions.lock();
        let channel = subscriptions.get(id)?.channels.get(&data_type)?;
        Some(channel.listeners.add(Arc::new(listener)))
    }

    /// Detach a listener. Returns false if anything is not present.
    pub fn remove_listener(
        &self,
        id: &SubscriptionId,
        data_type: DataType,
        listener: ListenerId,
    ) -> bool {
        self.subscriptions
            .lock()
            .get(id)
            .and_then(|entry| entry.channels.get(&data_type))
            .is_some_and(|channel| channel.listeners.remove(listener))
    }

    fn start_pipeline(
        &self,
        id: &SubscriptionId,
        data_type: DataType,
        options: &SubscriptionOptions,
        listeners: Arc<ListenerRegistry<MarketDataMessage>>,
    ) -> Result<Arc<Pipeline>, OrchestratorError> {
        let handle = Handle::try_current().map_err(|_| PipelineError::NoRuntime)?;
        let processors = self
            .processors
            .read()
            .get(&data_type)
            .cloned()
            .unwrap_or_default();
        let template = PipelineTemplate::for_subscription(
            options,
            &processors,
            self.config.default_capacity,
            self.config.default_policy,
        );

        let pipeline = Arc::new(Pipeline::from_template(
            format!("{id}/{data_type}"),
            data_type,
            &template,
            listeners,
        ));
        handle.spawn(forward_pipeline_events(
            id.clone(),
            data_type,
            pipeline.subscribe_events(),
            Arc::clone(&self.hub),
        ));
        pipeline.start()?;
        Ok(pipeline)
    }

    fn open_channel(
        &self,
        id: &SubscriptionId,
        data_type: DataType,
        options: &SubscriptionOptions,
        listeners: Arc<ListenerRegistry<MarketDataMessage>>,
    ) -> Result<Channel, OrchestratorError> {
        let provider = self.provider_for(data_type);
        let (adapter, health) = self
            .providers
            .read()
            .get(&provider)
            .map(|entry| (Arc::clone(&entry.adapter), Arc::clone(&entry.health)))
            .ok_or_else(|| OrchestratorError::UnknownProvider(provider.clone()))?;

        let pipeline = self.start_pipeline(id, data_type, options, Arc::clone(&listeners))?;
        let slot = Arc::new(RwLock::new(pipeline));

        let callback: MessageCallback = {
            let slot = Arc::clone(&slot);
            let provider = provider.clone();
            let priority = options.priority;
            Arc::new(move |message: MarketDataMessage| {
                health.increment_messages();
                metrics::record_message_received(&provider, data_type);
                let outcome = slot.read().push(message, priority);
                if let Some(reason) = drop_reason(outcome) {
                    metrics::record_message_dropped(data_type, reason);
                }
            })
        };

        match adapter.subscribe_market_data(data_type, &options.symbols, callback) {
            Ok(provider_subscription_id) => {
                tracing::debug!(
                    subscription_id = %id,
                    %data_type,
                    provider = %provider,
                    provider_subscription_id = %provider_subscription_id,
                    "Channel opened"
                );
                Ok(Channel {
                    provider,
                    provider_subscription_id,
                    slot,
                    listeners,
                })
            }
            Err(source) => {
                slot.read().stop();
                Err(OrchestratorError::Provider {
                    provider,
                    data_type,
                    source,
                })
            }
        }
    }

    fn close_channel(
        &self,
        id: &SubscriptionId,
        data_type: DataType,
        channel: &Channel,
        detach_listeners: bool,
    ) {
        let released = self
            .providers
            .read()
            .get(&channel.provider)
            .is_some_and(|entry| entry.adapter.unsubscribe(&channel.provider_subscription_id));
        if !released {
            tracing::debug!(
                subscription_id = %id,
                %data_type,
                provider = %channel.provider,
                provider_subscription_id = %channel.provider_subscription_id,
                "Provider subscription already gone"
            );
        }

        let pipeline = channel.pipeline();
        pipeline.stop();
        pipeline.clear();
        if detach_listeners {
            channel.listeners.clear();
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Unsubscribe everything, disconnect every provider and reset
    /// initialization state.
    pub async fn shutdown(&self) {
        let _lifecycle = self.lifecycle.lock().await;

        let ids = self.subscription_ids();
        for id in &ids {
            self.unsubscribe(id);
        }

        let providers: Vec<(String, Arc<dyn ProviderAdapter>, Arc<ProviderHealth>)> = self
            .providers
            .read()
            .iter()
            .map(|(name, entry)| {
                if let Some(cancel) = entry.watcher.lock().take() {
                    cancel.cancel();
                }
                (name.clone(), Arc::clone(&entry.adapter), Arc::clone(&entry.health))
            })
            .collect();

        for (name, adapter, health) in providers {
            adapter.disconnect().await;
            health.set_state(ConnectionState::Disconnected);
            metrics::set_provider_connected(&name, false);
        }

        self.initialized.store(false, Ordering::Release);
        tracing::info!(subscriptions = ids.len(), "Streaming orchestrator shut down");
        self.hub.publish_stream(StreamEvent::Shutdown);
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Whether `initialize` has completed and `shutdown` has not.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Ids of every live subscription.
    #[must_use]
    pub fn subscription_ids(&self) -> Vec<SubscriptionId> {
        let mut ids: Vec<SubscriptionId> = self.subscriptions.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Counters of one channel's current pipeline.
    #[must_use]
    pub fn pipeline_stats(&self, id: &SubscriptionId, data_type: DataType) -> Option<PipelineStats> {
        self.subscriptions
            .lock()
            .get(id)
            .and_then(|entry| entry.channels.get(&data_type))
            .map(|channel| channel.pipeline().stats())
    }

    /// Symbols demanded for a data type across subscriptions.
    #[must_use]
    pub fn active_symbols(&self, data_type: DataType) -> Vec<String> {
        let mut symbols = self.demand.active_symbols(data_type);
        symbols.sort();
        symbols
    }

    /// Orchestrator-wide counters.
    #[must_use]
    pub fn stats(&self) -> OrchestratorStats {
        let (subscriptions, pipelines) = {
            let table = self.subscriptions.lock();
            (table.len(), table.values().map(|e| e.channels.len()).sum())
        };
        let statuses = self.provider_statuses();

        OrchestratorStats {
            initialized: self.is_initialized(),
            providers: statuses.len(),
            connected_providers: statuses.iter().filter(|s| s.is_connected()).count(),
            subscriptions,
            pipelines,
            demand: DataType::all()
                .iter()
                .map(|&data_type| (data_type, self.demand.stats(data_type)))
                .filter(|(_, stats)| stats.symbol_count > 0)
                .collect(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
