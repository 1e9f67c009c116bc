//! Stage processors.
//!
//! Every processor is self-contained: its state (dedup table, throttle
//! windows) belongs to one pipeline instance and is discarded with it.
//! Time-based processors read `tokio::time::Instant` so tests can drive
//! them with a paused clock.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use super::{Stage, StageError, StageResult};
use crate::domain::market_data::{MarketDataMessage, Symbol, WILDCARD_SYMBOL};

/// Length of one throttling interval.
const THROTTLE_INTERVAL: Duration = Duration::from_secs(1);

// =============================================================================
// Symbol Filter
// =============================================================================

/// Admits messages whose symbol is in the set, or everything with `"*"`.
#[derive(Debug, Clone)]
pub struct SymbolFilter {
    symbols: HashSet<Symbol>,
    wildcard: bool,
}

impl SymbolFilter {
    /// Build a filter for `symbols`.
    #[must_use]
    pub fn new<'a>(symbols: impl IntoIterator<Item = &'a Symbol>) -> Self {
        let symbols: HashSet<Symbol> = symbols.into_iter().cloned().collect();
        let wildcard = symbols.contains(WILDCARD_SYMBOL);
        Self { symbols, wildcard }
    }

    /// Whether `symbol` passes.
    #[must_use]
    pub fn admits(&self, symbol: &str) -> bool {
        self.wildcard || self.symbols.contains(symbol)
    }
}

impl Stage for SymbolFilter {
    fn name(&self) -> &str {
        "symbol_filter"
    }

    fn process(&mut self, message: MarketDataMessage) -> StageResult {
        Ok(self.admits(&message.symbol).then_some(message))
    }
}

// =============================================================================
// Deduplicator
// =============================================================================

/// Key function used to recognize duplicates.
#[derive(Clone)]
pub struct DedupKey(Arc<dyn Fn(&MarketDataMessage) -> String + Send + Sync>);

impl DedupKey {
    /// Wrap a key function.
    pub fn new(key: impl Fn(&MarketDataMessage) -> String + Send + Sync + 'static) -> Self {
        Self(Arc::new(key))
    }

    /// Key on the full identity of the message: type, symbol, timestamp
    /// and payload.
    #[must_use]
    pub fn identity() -> Self {
        Self::new(|message| {
            let payload = serde_json::to_string(&message.data).unwrap_or_default();
            format!(
                "{}:{}:{}:{payload}",
                message.data_type, message.symbol, message.timestamp
            )
        })
    }

    /// Key on data type and symbol only.
    #[must_use]
    pub fn symbol() -> Self {
        Self::new(|message| format!("{}:{}", message.data_type, message.symbol))
    }

    /// Compute the key of a message.
    #[must_use]
    pub fn key(&self, message: &MarketDataMessage) -> String {
        (self.0)(message)
    }
}

impl Default for DedupKey {
    fn default() -> Self {
        Self::identity()
    }
}

impl fmt::Debug for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DedupKey(..)")
    }
}

/// Suppresses messages whose key was emitted within the window.
///
/// The last-seen time is refreshed only when a message is emitted, so a
/// steady stream of duplicates re-emits once per window rather than being
/// suppressed forever.
#[derive(Debug)]
pub struct Deduplicator {
    window: Duration,
    key: DedupKey,
    last_emitted: HashMap<String, Instant>,
    last_sweep: Instant,
}

impl Deduplicator {
    /// Create a deduplicator.
    #[must_use]
    pub fn new(window: Duration, key: DedupKey) -> Self {
        Self {
            window,
            key,
            last_emitted: HashMap::new(),
            last_sweep: Instant::now(),
        }
    }

    /// Number of keys currently remembered.
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.last_emitted.len()
    }

    fn sweep(&mut self, now: Instant) {
        if now.duration_since(self.last_sweep) < self.window {
            return;
        }
        let window = self.window;
        self.last_emitted
            .retain(|_, seen| now.duration_since(*seen) < window);
        self.last_sweep = now;
    }
}

impl Stage for Deduplicator {
    fn name(&self) -> &str {
        "deduplicator"
    }

    fn process(&mut self, message: MarketDataMessage) -> StageResult {
        let now = Instant::now();
        self.sweep(now);

        let key = self.key.key(&message);
        if let Some(seen) = self.last_emitted.get(&key)
            && now.duration_since(*seen) < self.window
        {
            return Ok(None);
        }

        self.last_emitted.insert(key, now);
        Ok(Some(message))
    }
}

// =============================================================================
// Throttler
// =============================================================================

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    started: Instant,
    admitted: u32,
}

/// Caps throughput at `rate` messages per second per symbol.
///
/// Each symbol gets fixed one-second windows. Messages beyond the rate
/// within a window are dropped, never queued.
#[derive(Debug)]
pub struct Throttler {
    rate: u32,
    windows: HashMap<Symbol, RateWindow>,
    dropped: u64,
}

impl Throttler {
    /// Create a throttler. A rate of zero is raised to one.
    #[must_use]
    pub fn new(rate: u32) -> Self {
        Self {
            rate: rate.max(1),
            windows: HashMap::new(),
            dropped: 0,
        }
    }

    /// Messages dropped so far.
    #[must_use]
    pub const fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl Stage for Throttler {
    fn name(&self) -> &str {
        "throttler"
    }

    fn process(&mut self, message: MarketDataMessage) -> StageResult {
        let now = Instant::now();
        let window = self
            .windows
            .entry(message.symbol.clone())
            .or_insert(RateWindow {
                started: now,
                admitted: 0,
            });

        if now.duration_since(window.started) >= THROTTLE_INTERVAL {
            *window = RateWindow {
                started: now,
                admitted: 0,
            };
        }

        if window.admitted < self.rate {
            window.admitted += 1;
            Ok(Some(message))
        } else {
            self.dropped += 1;
            Ok(None)
        }
    }
}

// =============================================================================
// Custom Processor
// =============================================================================

/// Caller-supplied transform function.
pub type ProcessorFn = Arc<dyn Fn(MarketDataMessage) -> StageResult + Send + Sync>;

/// A named caller-supplied stage.
#[derive(Clone)]
pub struct CustomProcessor {
    name: String,
    func: ProcessorFn,
}

impl CustomProcessor {
    /// Create a processor from a fallible transform.
    pub fn new(
        name: impl Into<String>,
        func: impl Fn(MarketDataMessage) -> StageResult + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            func: Arc::new(func),
        }
    }

    /// Create a processor from an infallible map.
    pub fn map(
        name: impl Into<String>,
        func: impl Fn(MarketDataMessage) -> MarketDataMessage + Send + Sync + 'static,
    ) -> Self {
        Self::new(name, move |message| Ok(Some(func(message))))
    }

    /// Processor name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for CustomProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomProcessor")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Stage for CustomProcessor {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&mut self, message: MarketDataMessage) -> StageResult {
        (self.func)(message)
    }
}

/// Convenience for processors that reject a message.
#[must_use]
pub fn reject(reason: impl fmt::Display) -> StageError {
    StageError::processor(reason)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    fn trade(symbol: &str, ts: i64) -> MarketDataMessage {
        MarketDataMessage::trade(symbol, ts, dec!(100), 10)
    }

    #[test]
    fn symbol_filter_admits_listed_symbols() {
        let symbols = vec!["AAPL".to_string()];
        let mut filter = SymbolFilter::new(&symbols);

        assert!(filter.process(trade("AAPL", 0)).unwrap().is_some());
        assert!(filter.process(trade("MSFT", 0)).unwrap().is_none());
    }

    #[test]
    fn symbol_filter_wildcard() {
        let symbols = vec!["*".to_string()];
        let filter = SymbolFilter::new(&symbols);
        assert!(filter.admits("ANYTHING"));
    }

    #[tokio::test(start_paused = true)]
    async fn deduplicator_suppresses_within_window() {
        let mut dedup = Deduplicator::new(Duration::from_millis(100), DedupKey::identity());

        assert!(dedup.process(trade("AAPL", 1)).unwrap().is_some());
        tokio::time::advance(Duration::from_millis(50)).await;
        assert!(dedup.process(trade("AAPL", 1)).unwrap().is_none());
        // different timestamp is a different identity
        assert!(dedup.process(trade("AAPL", 2)).unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn deduplicator_passes_after_window() {
        let mut dedup = Deduplicator::new(Duration::from_millis(100), DedupKey::identity());

        assert!(dedup.process(trade("AAPL", 1)).unwrap().is_some());
        tokio::time::advance(Duration::from_millis(101)).await;
        assert!(dedup.process(trade("AAPL", 1)).unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn steady_duplicates_reemit_once_per_window() {
        let mut dedup = Deduplicator::new(Duration::from_millis(100), DedupKey::identity());

        let mut emitted = 0;
        for _ in 0..8 {
            if dedup.process(trade("AAPL", 1)).unwrap().is_some() {
                emitted += 1;
            }
            tokio::time::advance(Duration::from_millis(50)).await;
        }
        // t = 0, 100, 200, 300
        assert_eq!(emitted, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn deduplicator_sweeps_expired_keys() {
        let mut dedup = Deduplicator::new(Duration::from_millis(100), DedupKey::identity());
        for ts in 0..50 {
            dedup.process(trade("AAPL", ts)).unwrap();
        }
        assert_eq!(dedup.tracked_keys(), 50);

        tokio::time::advance(Duration::from_millis(150)).await;
        dedup.process(trade("AAPL", 999)).unwrap();
        assert_eq!(dedup.tracked_keys(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn custom_dedup_key() {
        let mut dedup = Deduplicator::new(Duration::from_secs(1), DedupKey::symbol());
        assert!(dedup.process(trade("AAPL", 1)).unwrap().is_some());
        assert!(dedup.process(trade("AAPL", 2)).unwrap().is_none());
        assert!(dedup.process(trade("MSFT", 2)).unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn throttler_drops_excess_within_interval() {
        let mut throttler = Throttler::new(2);
        let mut passed = 0;
        for ts in 0..10 {
            if throttler.process(trade("AAPL", ts)).unwrap().is_some() {
                passed += 1;
            }
            tokio::time::advance(Duration::from_millis(50)).await;
        }

        assert_eq!(passed, 2);
        assert_eq!(throttler.dropped(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn throttler_resets_each_interval() {
        let mut throttler = Throttler::new(1);
        assert!(throttler.process(trade("AAPL", 0)).unwrap().is_some());
        assert!(throttler.process(trade("AAPL", 1)).unwrap().is_none());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(throttler.process(trade("AAPL", 2)).unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn throttler_is_per_symbol() {
        let mut throttler = Throttler::new(1);
        assert!(throttler.process(trade("AAPL", 0)).unwrap().is_some());
        assert!(throttler.process(trade("MSFT", 0)).unwrap().is_some());
        assert!(throttler.process(trade("AAPL", 1)).unwrap().is_none());
    }

    #[test]
    fn custom_processor_transforms_and_fails() {
        let mut upper = CustomProcessor::map("upper", |mut m| {
            m.symbol = m.symbol.to_lowercase();
            m
        });
        let out = upper.process(trade("AAPL", 0)).unwrap().unwrap();
        assert_eq!(out.symbol, "aapl");
        assert_eq!(Stage::name(&upper), "upper");

        let mut failing = CustomProcessor::new("failing", |_| Err(reject("bad tick")));
        assert_eq!(
            failing.process(trade("AAPL", 0)),
            Err(StageError::Processor("bad tick".to_string()))
        );
    }
}
