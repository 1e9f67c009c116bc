//! Real-Time Analytics Engine
//!
//! Each analytics subscription owns one orchestrator data subscription,
//! one set of per-symbol sliding windows and one ticker task. Listeners on
//! the data subscription append to the windows; every tick takes an owned
//! snapshot and runs the registered calculator over it.
//!
//! # Ticks
//!
//! - Empty snapshot: skipped, the calculator is not invoked.
//! - Calculator error or panic: reported as
//!   `AnalyticsEvent::CalculationError`; the ticker keeps its schedule.
//! - Unsubscribe during a tick: the tick works on its snapshot and
//!   discards its results, since cancellation is checked before fan-out.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::orchestrator::{OrchestratorError, StreamingOrchestrator};
use crate::AnalyticsSettings;
use crate::domain::analytics::calculators::default_calculators;
use crate::domain::analytics::{
    AnalyticsConfig, AnalyticsResult, AnalyticsType, CalculationError, CalculationResult,
    Calculator, ConfigValidationError, SymbolWindows, WindowSnapshot,
};
use crate::domain::clock::Clock;
use crate::domain::listener::{ListenerId, ListenerRegistry};
use crate::domain::pipeline::Priority;
use crate::domain::subscription::{SubscriptionId, SubscriptionOptions};
use crate::infrastructure::broadcast::{AnalyticsEvent, SharedEventHub};
use crate::infrastructure::metrics;

/// Data subscription defaults applied to every analytics subscription.
#[derive(Debug, Clone, Copy)]
pub struct AnalyticsEngineConfig {
    /// Messages per second per symbol.
    pub throttle_rate: u32,
    /// Duplicate suppression window.
    pub deduplication_window: Duration,
    /// Push priority.
    pub priority: Priority,
    /// Entry cap per symbol window.
    pub max_window_entries: usize,
}

impl Default for AnalyticsEngineConfig {
    fn default() -> Self {
        AnalyticsSettings::default().into()
    }
}

impl From<AnalyticsSettings> for AnalyticsEngineConfig {
    fn from(settings: AnalyticsSettings) -> Self {
        Self {
            throttle_rate: settings.throttle_rate,
            deduplication_window: settings.deduplication_window,
            priority: settings.priority,
            max_window_entries: settings.max_window_entries,
        }
    }
}

/// Analytics engine errors.
#[derive(Debug, thiserror::Error)]
pub enum AnalyticsError {
    /// No calculator for the requested type.
    #[error("no calculator registered for type {0}")]
    NoCalculator(AnalyticsType),

    /// The config failed validation.
    #[error("invalid analytics config: {0}")]
    InvalidConfig(#[from] ConfigValidationError),

    /// Ticker tasks need a Tokio runtime.
    #[error("no tokio runtime available")]
    NoRuntime,

    /// The underlying data subscription failed.
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

struct AnalyticsSubscription {
    analytics_type: AnalyticsType,
    data_subscription: SubscriptionId,
    windows: Arc<Mutex<SymbolWindows>>,
    listeners: Arc<ListenerRegistry<AnalyticsResult>>,
    cancel: CancellationToken,
}

struct Ticker {
    id: SubscriptionId,
    config: AnalyticsConfig,
    calculator: Calculator,
    windows: Arc<Mutex<SymbolWindows>>,
    listeners: Arc<ListenerRegistry<AnalyticsResult>>,
    clock: Arc<dyn Clock>,
    hub: SharedEventHub,
}

impl Ticker {
    async fn run(self, cancel: CancellationToken) {
        let period = Duration::from_millis(self.config.update_interval_ms);
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => self.tick(&cancel),
            }
        }

        tracing::debug!(subscription_id = %self.id, "Analytics ticker stopped");
    }

    fn tick(&self, cancel: &CancellationToken) {
        let now = self.clock.now_ms();
        let Some(snapshot) = self.windows.lock().snapshot(now) else {
            return;
        };

        let started = std::time::Instant::now();
        let outcome = run_calculator(&self.calculator, &self.config, &snapshot);
        metrics::record_calculation(self.config.analytics_type, started.elapsed());

        if cancel.is_cancelled() {
            return;
        }

        match outcome {
            Ok(results) => {
                tracing::trace!(
                    subscription_id = %self.id,
                    results = results.len(),
                    "Analytics tick"
                );
                for result in &results {
                    self.listeners.emit(result);
                    self.hub.publish_result(result);
                }
            }
            Err(error) => {
                metrics::record_calculation_error(self.config.analytics_type);
                tracing::warn!(
                    subscription_id = %self.id,
                    analytics_type = %self.config.analytics_type,
                    error = %error,
                    "Calculation failed"
                );
                self.hub.publish_analytics(AnalyticsEvent::CalculationError {
                    subscription_id: self.id.clone(),
                    analytics_type: self.config.analytics_type,
                    error: error.to_string(),
                });
            }
        }
    }
}

fn run_calculator(
    calculator: &Calculator,
    config: &AnalyticsConfig,
    snapshot: &WindowSnapshot,
) -> CalculationResult {
    catch_unwind(AssertUnwindSafe(|| calculator(config, snapshot))).unwrap_or_else(|panic| {
        let message = panic
            .downcast_ref::<&str>()
            .map(ToString::to_string)
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Err(CalculationError::Panicked(message))
    })
}

/// Runs registered calculators over sliding windows of live data.
pub struct AnalyticsEngine {
    orchestrator: Arc<StreamingOrchestrator>,
    hub: SharedEventHub,
    clock: Arc<dyn Clock>,
    config: AnalyticsEngineConfig,
    calculators: RwLock<HashMap<AnalyticsType, Calculator>>,
    subscriptions: Mutex<HashMap<SubscriptionId, AnalyticsSubscription>>,
}

impl std::fmt::Debug for AnalyticsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalyticsEngine")
            .field("config", &self.config)
            .field("calculators", &self.calculators.read().len())
            .field("subscriptions", &self.subscription_count())
            .finish_non_exhaustive()
    }
}

impl AnalyticsEngine {
    /// Create an engine with no calculators.
    #[must_use]
    pub fn new(
        orchestrator: Arc<StreamingOrchestrator>,
        clock: Arc<dyn Clock>,
        config: AnalyticsEngineConfig,
    ) -> Self {
        let hub = Arc::clone(orchestrator.hub());
        Self {
            orchestrator,
            hub,
            clock,
            config,
            calculators: RwLock::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Create an engine with every built-in calculator registered.
    #[must_use]
    pub fn with_default_calculators(
        orchestrator: Arc<StreamingOrchestrator>,
        clock: Arc<dyn Clock>,
        config: AnalyticsEngineConfig,
    ) -> Self {
        let engine = Self::new(orchestrator, clock, config);
        engine.calculators.write().extend(default_calculators());
        engine
    }

    /// Register or replace the calculator of a type.
    ///
    /// Running subscriptions keep the calculator they started with.
    pub fn register_calculator<F>(&self, analytics_type: AnalyticsType, calculator: F)
    where
        F: Fn(&AnalyticsConfig, &WindowSnapshot) -> CalculationResult + Send + Sync + 'static,
    {
        let calculator: Calculator = Arc::new(calculator);
        if self
            .calculators
            .write()
            .insert(analytics_type, calculator)
            .is_some()
        {
            tracing::debug!(%analytics_type, "Calculator replaced");
        }
    }

    /// Whether a calculator is registered for a type.
    #[must_use]
    pub fn has_calculator(&self, analytics_type: AnalyticsType) -> bool {
        self.calculators.read().contains_key(&analytics_type)
    }

    /// Start an analytics subscription.
    ///
    /// # Errors
    ///
    /// Returns `NoCalculator` if the type has no calculator, `InvalidConfig`
    /// for unusable configs and `Orchestrator` if the data subscription
    /// cannot be opened.
    pub fn subscribe(&self, config: AnalyticsConfig) -> Result<SubscriptionId, AnalyticsError> {
        let calculator = self
            .calculators
            .read()
            .get(&config.analytics_type)
            .cloned()
            .ok_or(AnalyticsError::NoCalculator(config.analytics_type))?;
        config.validate()?;
        let handle = Handle::try_current().map_err(|_| AnalyticsError::NoRuntime)?;

        let options = SubscriptionOptions::new(
            config.required_data_types.iter().copied(),
            config.symbols.iter().cloned(),
        )
        .with_throttle_rate(self.config.throttle_rate)
        .with_deduplication_window(self.config.deduplication_window)
        .with_priority(self.config.priority);
        let data_subscription = self.orchestrator.subscribe(options)?;

        let windows = Arc::new(Mutex::new(SymbolWindows::new(
            &config.symbols,
            config.window_size_ms,
            self.config.max_window_entries,
        )));
        for &data_type in &config.required_data_types {
            let windows = Arc::clone(&windows);
            let clock = Arc::clone(&self.clock);
            self.orchestrator
                .add_listener(&data_subscription, data_type, move |message| {
                    windows.lock().record(message.clone(), clock.now_ms());
                });
        }

        let id = SubscriptionId::generate();
        let listeners = Arc::new(ListenerRegistry::new());
        let cancel = CancellationToken::new();
        let analytics_type = config.analytics_type;

        tracing::info!(
            subscription_id = %id,
            %analytics_type,
            symbols = ?config.symbols,
            window_ms = config.window_size_ms,
            interval_ms = config.update_interval_ms,
            "Analytics subscription created"
        );

        let ticker = Ticker {
            id: id.clone(),
            config,
            calculator,
            windows: Arc::clone(&windows),
            listeners: Arc::clone(&listeners),
            clock: Arc::clone(&self.clock),
            hub: Arc::clone(&self.hub),
        };
        handle.spawn(ticker.run(cancel.clone()));

        let count = {
            let mut subscriptions = self.subscriptions.lock();
            subscriptions.insert(
                id.clone(),
                AnalyticsSubscription {
                    analytics_type,
                    data_subscription,
                    windows,
                    listeners,
                    cancel,
                },
            );
            subscriptions.len()
        };
        metrics::set_analytics_subscriptions(count);
        self.hub.publish_analytics(AnalyticsEvent::Subscribed {
            subscription_id: id.clone(),
            analytics_type,
        });

        Ok(id)
    }

    /// Stop an analytics subscription. Returns false if the id is unknown.
    pub fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        let (subscription, count) = {
            let mut subscriptions = self.subscriptions.lock();
            let Some(subscription) = subscriptions.remove(id) else {
                return false;
            };
            (subscription, subscriptions.len())
        };

        subscription.cancel.cancel();
        self.orchestrator.unsubscribe(&subscription.data_subscription);
        subscription.windows.lock().clear();
        subscription.listeners.clear();

        metrics::set_analytics_subscriptions(count);
        tracing::info!(
            subscription_id = %id,
            analytics_type = %subscription.analytics_type,
            "Analytics subscription removed"
        );
        self.hub.publish_analytics(AnalyticsEvent::Unsubscribed {
            subscription_id: id.clone(),
        });
        true
    }

    /// Attach a result listener. Returns `None` if the id is unknown.
    pub fn add_listener(
        &self,
        id: &SubscriptionId,
        listener: impl Fn(&AnalyticsResult) + Send + Sync + 'static,
    ) -> Option<ListenerId> {
        self.subscriptions
            .lock()
            .get(id)
            .map(|subscription| subscription.listeners.add(Arc::new(listener)))
    }

    /// Detach a result listener.
    pub fn remove_listener(&self, id: &SubscriptionId, listener: ListenerId) -> bool {
        self.subscriptions
            .lock()
            .get(id)
            .is_some_and(|subscription| subscription.listeners.remove(listener))
    }

    /// Ids of every live analytics subscription.
    #[must_use]
    pub fn subscription_ids(&self) -> Vec<SubscriptionId> {
        let mut ids: Vec<SubscriptionId> = self.subscriptions.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of live analytics subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Messages currently windowed for a symbol of a subscription.
    #[must_use]
    pub fn window_len(&self, id: &SubscriptionId, symbol: &str) -> Option<usize> {
        self.subscriptions
            .lock()
            .get(id)
            .map(|subscription| subscription.windows.lock().len(symbol))
    }

    /// Stop every analytics subscription. Returns how many were stopped.
    pub fn shutdown(&self) -> usize {
        let ids = self.subscription_ids();
        let stopped = ids.iter().filter(|id| self.unsubscribe(id)).count();
        tracing::info!(stopped, "Analytics engine shut down");
        stopped
    }
}

impl Drop for AnalyticsEngine {
    fn drop(&mut self) {
        for subscription in self.subscriptions.get_mut().values() {
            subscription.cancel.cancel();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use rust_decimal_macros::dec;
    use tokio::sync::broadcast;

    use super::*;
    use crate::application::ports::{
        ConnectionState, MessageCallback, MockProviderAdapter, ProviderEvent,
    };
    use crate::application::services::OrchestratorConfig;
    use crate::domain::clock::ManualClock;
    use crate::domain::market_data::MarketDataMessage;
    use crate::infrastructure::broadcast::EventHub;

    type Callbacks = Arc<Mutex<Vec<MessageCallback>>>;

    fn mock_provider(callbacks: Callbacks) -> MockProviderAdapter {
        let (tx, _) = broadcast::channel(8);
        let events_tx = tx.clone();
        let mut mock = MockProviderAdapter::new();
        mock.expect_events().returning(move || events_tx.subscribe());
        mock.expect_connect().returning(move || {
            let _ = tx.send(ProviderEvent::Open);
            Ok(())
        });
        mock.expect_state().return_const(ConnectionState::Connecting);
        mock.expect_subscribe_market_data()
            .returning(move |data_type, _, callback| {
                callbacks.lock().push(callback);
                Ok(format!("ws-{data_type}"))
            });
        mock.expect_unsubscribe().return_const(true);
        mock
    }

    async fn engine(clock: Arc<ManualClock>) -> (AnalyticsEngine, Callbacks) {
        let callbacks: Callbacks = Arc::new(Mutex::new(Vec::new()));
        let orchestrator = Arc::new(StreamingOrchestrator::new(
            OrchestratorConfig::default(),
            Arc::new(EventHub::with_defaults()),
        ));
        orchestrator.register_provider("simulated", Arc::new(mock_provider(Arc::clone(&callbacks))));
        orchestrator.initialize().await;

        let engine = AnalyticsEngine::with_default_calculators(
            orchestrator,
            clock,
            AnalyticsEngineConfig::default(),
        );
        (engine, callbacks)
    }

    fn trade(symbol: &str, ts: i64) -> MarketDataMessage {
        MarketDataMessage::trade(symbol, ts, dec!(100), 10)
    }

    async fn settle() {
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }

    async fn advance(clock: &ManualClock, ms: u64) {
        clock.advance(i64::try_from(ms).unwrap());
        tokio::time::advance(Duration::from_millis(ms)).await;
        settle().await;
    }

    #[tokio::test]
    async fn subscribe_requires_calculator() {
        let (engine, _) = engine(Arc::new(ManualClock::new(0))).await;
        let empty = AnalyticsEngine::new(
            Arc::clone(&engine.orchestrator),
            Arc::new(ManualClock::new(0)),
            AnalyticsEngineConfig::default(),
        );

        let error = empty
            .subscribe(AnalyticsConfig::new(AnalyticsType::Vwap, ["AAPL"]))
            .unwrap_err();
        assert_eq!(error.to_string(), "no calculator registered for type vwap");
        assert!(engine.has_calculator(AnalyticsType::Vwap));
        assert!(engine.has_calculator(AnalyticsType::Correlation));
    }

    #[tokio::test]
    async fn subscribe_validates_config() {
        let (engine, _) = engine(Arc::new(ManualClock::new(0))).await;
        let result = engine.subscribe(AnalyticsConfig::new(AnalyticsType::Vwap, ["AAPL"]).with_window_ms(0));
        assert!(matches!(
            result,
            Err(AnalyticsError::InvalidConfig(ConfigValidationError::ZeroWindow))
        ));
        assert_eq!(engine.subscription_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_windows_skip_the_calculator() {
        let clock = Arc::new(ManualClock::new(0));
        let (engine, _) = engine(Arc::clone(&clock)).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        engine.register_calculator(AnalyticsType::Momentum, move |_, _| {
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(Vec::new())
        });

        engine
            .subscribe(AnalyticsConfig::new(AnalyticsType::Momentum, ["AAPL"]))
            .unwrap();
        for _ in 0..3 {
            advance(&clock, 1_000).await;
        }

        assert_eq!(calls.load(Ordering::Relaxed), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_tick_does_not_stop_the_timer() {
        let clock = Arc::new(ManualClock::new(0));
        let (engine, callbacks) = engine(Arc::clone(&clock)).await;
        let mut events = engine.hub.analytics_events();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        engine.register_calculator(AnalyticsType::Vwap, move |_, snapshot| {
            let call = counter.fetch_add(1, Ordering::Relaxed);
            assert!(call != 0, "first tick explodes");
            Ok(vec![AnalyticsResult::new(
                AnalyticsType::Vwap,
                "AAPL",
                snapshot.as_of_ms,
                1.0,
            )])
        });

        let id = engine
            .subscribe(AnalyticsConfig::new(AnalyticsType::Vwap, ["AAPL"]))
            .unwrap();
        let results = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&results);
        engine.add_listener(&id, move |_| {
            sink.fetch_add(1, Ordering::Relaxed);
        });

        let callback = Arc::clone(&callbacks.lock()[0]);
        callback(trade("AAPL", 0));
        settle().await;

        advance(&clock, 1_000).await;
        advance(&clock, 1_000).await;

        assert_eq!(calls.load(Ordering::Relaxed), 2);
        assert_eq!(results.load(Ordering::Relaxed), 1);

        let mut errors = 0;
        while let Ok(event) = events.try_recv() {
            if let AnalyticsEvent::CalculationError { error, .. } = event {
                assert!(error.contains("first tick explodes"));
                errors += 1;
            }
        }
        assert_eq!(errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unsubscribe_stops_ticks() {
        let clock = Arc::new(ManualClock::new(0));
        let (engine, callbacks) = engine(Arc::clone(&clock)).await;
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        engine.register_calculator(AnalyticsType::Vwap, move |_, _| {
            counter.fetch_add(1, Ordering::Relaxed);
            Ok(Vec::new())
        });

        let id = engine
            .subscribe(AnalyticsConfig::new(AnalyticsType::Vwap, ["AAPL"]).with_window_ms(600_000))
            .unwrap();
        let callback = Arc::clone(&callbacks.lock()[0]);
        callback(trade("AAPL", 0));
        settle().await;
        advance(&clock, 1_000).await;
        assert_eq!(calls.load(Ordering::Relaxed), 1);

        assert!(engine.unsubscribe(&id));
        assert!(!engine.unsubscribe(&id));
        advance(&clock, 5_000).await;

        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert!(engine.window_len(&id, "AAPL").is_none());
        assert!(engine.orchestrator.subscription_ids().is_empty());
    }

    #[tokio::test]
    async fn listener_management() {
        let (engine, _) = engine(Arc::new(ManualClock::new(0))).await;
        let id = engine
            .subscribe(AnalyticsConfig::new(AnalyticsType::Vwap, ["AAPL"]))
            .unwrap();

        let listener = engine.add_listener(&id, |_| {}).unwrap();
        assert!(engine.remove_listener(&id, listener));
        assert!(!engine.remove_listener(&id, listener));
        assert!(
            engine
                .add_listener(&SubscriptionId::from("missing"), |_| {})
                .is_none()
        );

        assert_eq!(engine.shutdown(), 1);
        assert_eq!(engine.subscription_count(), 0);
    }

    #[test]
    fn panicking_calculator_becomes_error() {
        let calculator: Calculator =
            Arc::new(|_: &AnalyticsConfig, _: &WindowSnapshot| -> CalculationResult { panic!("boom") });
        let config = AnalyticsConfig::new(AnalyticsType::Vwap, ["AAPL"]);
        let result = run_calculator(&calculator, &config, &WindowSnapshot::default());
        assert_eq!(result, Err(CalculationError::Panicked("boom".to_string())));
    }
}
