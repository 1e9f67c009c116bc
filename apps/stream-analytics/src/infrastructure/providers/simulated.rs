//! Simulated Provider
//!
//! In-process `ProviderAdapter` producing random-walk quotes, trades and
//! bars for every subscribed symbol. Messages can also be injected
//! directly, which is how integration tests drive the engine without a
//! vendor connection.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use rust_decimal::Decimal;
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::SimulatorSettings;
use crate::application::ports::{
    ConnectionState, MessageCallback, ProviderAdapter, ProviderError, ProviderEvent,
    ProviderSubscription, ProviderSubscriptionId,
};
use crate::domain::market_data::{Bar, DataType, MarketDataMessage, Symbol, WILDCARD_SYMBOL};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Largest random-walk step, in cents.
const MAX_STEP_CENTS: i64 = 5;

/// Simulated provider configuration.
#[derive(Debug, Clone)]
pub struct SimulatedProviderConfig {
    /// Generation cadence. `None` disables generation; only injected
    /// messages are delivered.
    pub tick_interval: Option<Duration>,
    /// Price every symbol starts its walk at.
    pub start_price: Decimal,
}

impl Default for SimulatedProviderConfig {
    fn default() -> Self {
        SimulatorSettings::default().into()
    }
}

impl From<SimulatorSettings> for SimulatedProviderConfig {
    fn from(settings: SimulatorSettings) -> Self {
        Self {
            tick_interval: Some(settings.tick_interval),
            start_price: Decimal::ONE_HUNDRED,
        }
    }
}

impl SimulatedProviderConfig {
    /// Configuration that never generates on its own.
    #[must_use]
    pub const fn injection_only() -> Self {
        Self {
            tick_interval: None,
            start_price: Decimal::ONE_HUNDRED,
        }
    }
}

struct Entry {
    subscription: ProviderSubscription,
    callback: MessageCallback,
}

impl Entry {
    fn matches(&self, message: &MarketDataMessage) -> bool {
        self.subscription.channel == message.data_type
            && self
                .subscription
                .symbols
                .iter()
                .any(|s| s == WILDCARD_SYMBOL || *s == message.symbol)
    }
}

struct Shared {
    state: RwLock<ConnectionState>,
    events: broadcast::Sender<ProviderEvent>,
    subscriptions: RwLock<BTreeMap<ProviderSubscriptionId, Entry>>,
    prices: Mutex<HashMap<Symbol, Decimal>>,
    start_price: Decimal,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            let _ = self.events.send(ProviderEvent::StateChange(state));
        }
    }

    fn deliver(&self, message: &MarketDataMessage) -> usize {
        let callbacks: Vec<MessageCallback> = self
            .subscriptions
            .read()
            .values()
            .filter(|entry| entry.matches(message))
            .map(|entry| Arc::clone(&entry.callback))
            .collect();

        for callback in &callbacks {
            callback(message.clone());
        }
        callbacks.len()
    }

    fn generate(&self, now_ms: i64) -> Vec<MarketDataMessage> {
        let targets: Vec<(DataType, Symbol)> = self
            .subscriptions
            .read()
            .values()
            .flat_map(|entry| {
                entry
                    .subscription
                    .symbols
                    .iter()
                    .filter(|s| s.as_str() != WILDCARD_SYMBOL)
                    .map(|s| (entry.subscription.channel, s.clone()))
            })
            .collect();

        let mut rng = rand::rng();
        let mut prices = self.prices.lock();
        targets
            .into_iter()
            .map(|(data_type, symbol)| {
                let previous = *prices.entry(symbol.clone()).or_insert(self.start_price);
                let step = Decimal::new(rng.random_range(-MAX_STEP_CENTS..=MAX_STEP_CENTS), 2);
                let price = (previous + step).max(Decimal::new(1, 2));
                prices.insert(symbol.clone(), price);
                random_message(&mut rng, data_type, symbol, now_ms, previous, price)
            })
            .collect()
    }
}

fn random_message(
    rng: &mut impl Rng,
    data_type: DataType,
    symbol: Symbol,
    now_ms: i64,
    previous: Decimal,
    price: Decimal,
) -> MarketDataMessage {
    let cent = Decimal::new(1, 2);
    match data_type {
        DataType::Bars => MarketDataMessage::bar(
            symbol,
            now_ms,
            Bar {
                open: previous,
                high: previous.max(price) + cent,
                low: (previous.min(price) - cent).max(cent),
                close: price,
                volume: rng.random_range(1_000..=10_000),
            },
        ),
        DataType::Trades => {
            MarketDataMessage::trade(symbol, now_ms, price, rng.random_range(1..=500))
        }
        _ => MarketDataMessage::quote(
            symbol,
            now_ms,
            (price - cent).max(cent),
            rng.random_range(100..=1_000),
            price + cent,
            rng.random_range(100..=1_000),
        ),
    }
}

async fn run_generator(shared: Arc<Shared>, period: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                let now_ms = chrono::Utc::now().timestamp_millis();
                for message in shared.generate(now_ms) {
                    shared.deliver(&message);
                }
            }
        }
    }

    tracing::debug!("Simulated generator stopped");
}

/// Provider adapter backed by a random walk.
pub struct SimulatedProvider {
    shared: Arc<Shared>,
    tick_interval: Option<Duration>,
    next_id: AtomicU64,
    generator: Mutex<Option<CancellationToken>>,
}

impl std::fmt::Debug for SimulatedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedProvider")
            .field("state", &*self.shared.state.read())
            .field("subscriptions", &self.shared.subscriptions.read().len())
            .field("tick_interval", &self.tick_interval)
            .finish_non_exhaustive()
    }
}

impl Default for SimulatedProvider {
    fn default() -> Self {
        Self::new(SimulatedProviderConfig::default())
    }
}

impl SimulatedProvider {
    /// Create a disconnected provider.
    #[must_use]
    pub fn new(config: SimulatedProviderConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                state: RwLock::new(ConnectionState::Disconnected),
                events,
                subscriptions: RwLock::new(BTreeMap::new()),
                prices: Mutex::new(HashMap::new()),
                start_price: config.start_price,
            }),
            tick_interval: config.tick_interval,
            next_id: AtomicU64::new(1),
            generator: Mutex::new(None),
        }
    }

    /// Deliver a message to every matching subscription.
    ///
    /// Returns the number of subscriptions it reached. Nothing is
    /// delivered unless connected.
    pub fn inject(&self, message: MarketDataMessage) -> usize {
        if *self.shared.state.read() != ConnectionState::Connected {
            return 0;
        }
        self.shared.deliver(&message)
    }

    /// Fail the connection: stop generating, publish the error and move
    /// to `Error`. Subscriptions are kept.
    pub fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if let Some(token) = self.generator.lock().take() {
            token.cancel();
        }
        tracing::warn!(reason = %reason, "Simulated provider failure");
        let _ = self.shared.events.send(ProviderEvent::Error(reason));
        self.shared.set_state(ConnectionState::Error);
    }
}

#[async_trait]
impl ProviderAdapter for SimulatedProvider {
    async fn connect(&self) -> Result<(), ProviderError> {
        if *self.shared.state.read() == ConnectionState::Connected {
            return Ok(());
        }
        self.shared.set_state(ConnectionState::Connecting);

        if let Some(period) = self.tick_interval {
            let handle = Handle::try_current().map_err(|_| {
                self.shared.set_state(ConnectionState::Error);
                ProviderError::ConnectionFailed("no tokio runtime available".to_string())
            })?;
            let token = CancellationToken::new();
            handle.spawn(run_generator(
                Arc::clone(&self.shared),
                period,
                token.clone(),
            ));
            if let Some(previous) = self.generator.lock().replace(token) {
                previous.cancel();
            }
        }

        self.shared.set_state(ConnectionState::Connected);
        let _ = self.shared.events.send(ProviderEvent::Open);
        tracing::info!(tick_interval = ?self.tick_interval, "Simulated provider connected");
        Ok(())
    }

    async fn disconnect(&self) {
        if let Some(token) = self.generator.lock().take() {
            token.cancel();
        }
        self.shared.subscriptions.write().clear();
        self.shared.set_state(ConnectionState::Disconnected);
        tracing::info!("Simulated provider disconnected");
    }

    fn subscribe_market_data(
        &self,
        data_type: DataType,
        symbols: &[Symbol],
        callback: MessageCallback,
    ) -> Result<ProviderSubscriptionId, ProviderError> {
        if *self.shared.state.read() != ConnectionState::Connected {
            return Err(ProviderError::NotConnected);
        }
        if !matches!(
            data_type,
            DataType::Quotes | DataType::Trades | DataType::Bars
        ) {
            return Err(ProviderError::UnsupportedDataType(data_type));
        }

        let id = format!("sim-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        tracing::debug!(subscription_id = %id, %data_type, symbols = ?symbols, "Simulated subscription");
        self.shared.subscriptions.write().insert(
            id.clone(),
            Entry {
                subscription: ProviderSubscription {
                    id: id.clone(),
                    channel: data_type,
                    symbols: symbols.to_vec(),
                },
                callback,
            },
        );
        Ok(id)
    }

    fn unsubscribe(&self, subscription_id: &str) -> bool {
        self.shared
            .subscriptions
            .write()
            .remove(subscription_id)
            .is_some()
    }

    fn subscriptions(&self) -> Vec<ProviderSubscription> {
        self.shared
            .subscriptions
            .read()
            .values()
            .map(|entry| entry.subscription.clone())
            .collect()
    }

    fn events(&self) -> broadcast::Receiver<ProviderEvent> {
        self.shared.events.subscribe()
    }

    fn state(&self) -> ConnectionState {
        *self.shared.state.read()
    }
}

impl Drop for SimulatedProvider {
    fn drop(&mut self) {
        if let Some(token) = self.generator.get_mut().take() {
            token.cancel();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use rust_decimal_macros::dec;

    use super::*;

    fn counting_callback(count: &Arc<AtomicUsize>) -> MessageCallback {
        let count = Arc::clone(count);
        Arc::new(move |_| {
            count.fetch_add(1, Ordering::Relaxed);
        })
    }

    #[tokio::test]
    async fn subscribe_requires_connection() {
        let provider = SimulatedProvider::new(SimulatedProviderConfig::injection_only());
        let result = provider.subscribe_market_data(
            DataType::Quotes,
            &["AAPL".to_string()],
            Arc::new(|_| {}),
        );
        assert_eq!(result, Err(ProviderError::NotConnected));
    }

    #[tokio::test]
    async fn connect_publishes_state_and_open() {
        let provider = SimulatedProvider::new(SimulatedProviderConfig::injection_only());
        let mut events = provider.events();

        provider.connect().await.unwrap();

        assert_eq!(provider.state(), ConnectionState::Connected);
        assert_eq!(
            events.try_recv().unwrap(),
            ProviderEvent::StateChange(ConnectionState::Connecting)
        );
        assert_eq!(
            events.try_recv().unwrap(),
            ProviderEvent::StateChange(ConnectionState::Connected)
        );
        assert_eq!(events.try_recv().unwrap(), ProviderEvent::Open);
    }

    #[tokio::test]
    async fn unsupported_data_type_is_refused() {
        let provider = SimulatedProvider::new(SimulatedProviderConfig::injection_only());
        provider.connect().await.unwrap();

        let result =
            provider.subscribe_market_data(DataType::News, &["AAPL".to_string()], Arc::new(|_| {}));
        assert_eq!(result, Err(ProviderError::UnsupportedDataType(DataType::News)));
    }

    #[tokio::test]
    async fn inject_reaches_matching_subscriptions() {
        let provider = SimulatedProvider::new(SimulatedProviderConfig::injection_only());
        provider.connect().await.unwrap();

        let quotes = Arc::new(AtomicUsize::new(0));
        let any = Arc::new(AtomicUsize::new(0));
        provider
            .subscribe_market_data(DataType::Quotes, &["AAPL".to_string()], counting_callback(&quotes))
            .unwrap();
        let wildcard = provider
            .subscribe_market_data(DataType::Quotes, &["*".to_string()], counting_callback(&any))
            .unwrap();

        let quote = |symbol: &str| {
            MarketDataMessage::quote(symbol, 1, dec!(99.99), 100, dec!(100.01), 100)
        };
        assert_eq!(provider.inject(quote("AAPL")), 2);
        assert_eq!(provider.inject(quote("MSFT")), 1);
        assert_eq!(
            provider.inject(MarketDataMessage::trade("AAPL", 1, dec!(100), 5)),
            0
        );

        assert!(provider.unsubscribe(&wildcard));
        assert!(!provider.unsubscribe(&wildcard));
        assert_eq!(provider.inject(quote("AAPL")), 1);

        assert_eq!(quotes.load(Ordering::Relaxed), 2);
        assert_eq!(any.load(Ordering::Relaxed), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn generator_walks_subscribed_symbols() {
        let provider = SimulatedProvider::new(SimulatedProviderConfig {
            tick_interval: Some(Duration::from_millis(100)),
            start_price: dec!(50),
        });
        provider.connect().await.unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);
        provider
            .subscribe_market_data(
                DataType::Trades,
                &["AAPL".to_string(), "MSFT".to_string()],
                Arc::new(move |message| sink.lock().push(message)),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(350)).await;

        let received = received.lock();
        assert!(received.len() >= 6);
        for message in received.iter() {
            let price = message.as_trade().unwrap().price;
            assert!(price > dec!(40) && price < dec!(60));
        }
    }

    #[tokio::test]
    async fn disconnect_drops_subscriptions() {
        let provider = SimulatedProvider::new(SimulatedProviderConfig::injection_only());
        provider.connect().await.unwrap();
        provider
            .subscribe_market_data(DataType::Bars, &["SPY".to_string()], Arc::new(|_| {}))
            .unwrap();
        assert_eq!(provider.subscriptions().len(), 1);

        provider.disconnect().await;

        assert!(provider.subscriptions().is_empty());
        assert_eq!(provider.state(), ConnectionState::Disconnected);
        assert_eq!(
            provider.inject(MarketDataMessage::trade("SPY", 1, dec!(1), 1)),
            0
        );
    }

    #[tokio::test]
    async fn fail_publishes_error() {
        let provider = SimulatedProvider::new(SimulatedProviderConfig::injection_only());
        provider.connect().await.unwrap();
        let mut events = provider.events();

        provider.fail("socket reset");

        assert_eq!(
            events.try_recv().unwrap(),
            ProviderEvent::Error("socket reset".to_string())
        );
        assert_eq!(
            events.try_recv().unwrap(),
            ProviderEvent::StateChange(ConnectionState::Error)
        );
        assert_eq!(provider.state(), ConnectionState::Error);
    }

    #[test]
    fn random_bar_is_consistent() {
        let mut rng = rand::rng();
        let message = random_message(&mut rng, DataType::Bars, "AAPL".into(), 7, dec!(10), dec!(10.05));
        let crate::domain::market_data::MarketPayload::Bar(bar) = message.data else {
            panic!("expected bar");
        };
        assert!(bar.low <= bar.open.min(bar.close));
        assert!(bar.high >= bar.open.max(bar.close));
        assert_eq!(message.timestamp, 7);
    }
}
