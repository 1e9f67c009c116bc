//! Subscription Types
//!
//! Options a caller supplies when opening a data subscription, the
//! subscription identifier, and symbol demand tracking across all live
//! subscriptions.
//!
//! # Design
//!
//! `SymbolDemand` tracks:
//! - Which symbols each subscription requested, per data type
//! - Reference counts per symbol so the first and last interested
//!   subscription are visible as upstream changes
//!
//! This lets the orchestrator report how many distinct symbols are being
//! pulled from providers even when many subscriptions overlap.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::domain::market_data::{DataType, Symbol};
use crate::domain::pipeline::{DedupKey, DropPolicy, Priority};

// =============================================================================
// Subscription Id
// =============================================================================

/// Identifier of a data or analytics subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    /// Generate a fresh random id.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Borrow the id as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubscriptionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SubscriptionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

// =============================================================================
// Subscription Options
// =============================================================================

/// Invalid subscription options.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OptionsError {
    /// No data type requested.
    #[error("at least one data type is required")]
    NoDataTypes,

    /// No symbol requested.
    #[error("at least one symbol is required")]
    NoSymbols,

    /// Throttle rate of zero would drop everything.
    #[error("throttle rate must be positive")]
    ZeroThrottleRate,

    /// Buffer size of zero cannot hold a message.
    #[error("buffer size must be positive")]
    ZeroBufferSize,
}

/// Parameters of a data subscription.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionOptions {
    /// Requested data types, one pipeline each.
    pub data_types: Vec<DataType>,
    /// Requested symbols. `"*"` admits every symbol.
    pub symbols: Vec<Symbol>,
    /// Maximum messages per second per symbol.
    pub throttle_rate: Option<u32>,
    /// Capacity of each stage buffer.
    pub buffer_size: Option<usize>,
    /// Priority used when pushing into the pipeline.
    pub priority: Priority,
    /// Suppress repeated messages seen within this window.
    pub deduplication_window: Option<Duration>,
    /// Overflow policy for every stage buffer.
    pub drop_policy: Option<DropPolicy>,
    /// Key used by the deduplicator. Defaults to the full message identity.
    pub dedup_key: Option<DedupKey>,
}

impl SubscriptionOptions {
    /// Start options for the given data types and symbols.
    #[must_use]
    pub fn new(
        data_types: impl IntoIterator<Item = DataType>,
        symbols: impl IntoIterator<Item = impl Into<Symbol>>,
    ) -> Self {
        let mut data_types: Vec<DataType> = data_types.into_iter().collect();
        data_types.sort_unstable();
        data_types.dedup();
        Self {
            data_types,
            symbols: symbols.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Set the throttle rate.
    #[must_use]
    pub const fn with_throttle_rate(mut self, rate: u32) -> Self {
        self.throttle_rate = Some(rate);
        self
    }

    /// Set the stage buffer size.
    #[must_use]
    pub const fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = Some(size);
        self
    }

    /// Set the push priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the deduplication window.
    #[must_use]
    pub const fn with_deduplication_window(mut self, window: Duration) -> Self {
        self.deduplication_window = Some(window);
        self
    }

    /// Set the overflow policy.
    #[must_use]
    pub const fn with_drop_policy(mut self, policy: DropPolicy) -> Self {
        self.drop_policy = Some(policy);
        self
    }

    /// Set the deduplication key.
    #[must_use]
    pub fn with_dedup_key(mut self, key: DedupKey) -> Self {
        self.dedup_key = Some(key);
        self
    }

    /// Check the options are usable.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.data_types.is_empty() {
            return Err(OptionsError::NoDataTypes);
        }
        if self.symbols.is_empty() {
            return Err(OptionsError::NoSymbols);
        }
        if self.throttle_rate == Some(0) {
            return Err(OptionsError::ZeroThrottleRate);
        }
        if self.buffer_size == Some(0) {
            return Err(OptionsError::ZeroBufferSize);
        }
        Ok(())
    }
}

// =============================================================================
// Subscription Changes
// =============================================================================

/// Changes to the set of symbols demanded from providers.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionChanges {
    /// Symbols that gained their first subscriber.
    pub subscribe: HashSet<Symbol>,
    /// Symbols that lost their last subscriber.
    pub unsubscribe: HashSet<Symbol>,
}

impl SubscriptionChanges {
    /// Check if there are any changes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscribe.is_empty() && self.unsubscribe.is_empty()
    }

    /// Create changes with only subscribes.
    #[must_use]
    pub fn subscribe_only(symbols: impl IntoIterator<Item = Symbol>) -> Self {
        Self {
            subscribe: symbols.into_iter().collect(),
            unsubscribe: HashSet::new(),
        }
    }

    /// Create changes with only unsubscribes.
    #[must_use]
    pub fn unsubscribe_only(symbols: impl IntoIterator<Item = Symbol>) -> Self {
        Self {
            subscribe: HashSet::new(),
            unsubscribe: symbols.into_iter().collect(),
        }
    }
}

// =============================================================================
// Demand State (per data type)
// =============================================================================

#[derive(Debug, Default)]
struct TypeDemand {
    by_subscription: HashMap<SubscriptionId, HashSet<Symbol>>,
    refcount: HashMap<Symbol, usize>,
}

impl TypeDemand {
    /// Returns symbols whose refcount went 0→1.
    fn add(&mut self, id: &SubscriptionId, symbols: &[Symbol]) -> Vec<Symbol> {
        let held = self.by_subscription.entry(id.clone()).or_default();
        let mut first = Vec::new();

        for symbol in symbols {
            if !held.insert(symbol.clone()) {
                continue;
            }
            let count = self.refcount.entry(symbol.clone()).or_insert(0);
            *count += 1;
            if *count == 1 {
                first.push(symbol.clone());
            }
        }

        first
    }

    /// Returns symbols whose refcount went 1→0.
    fn remove(&mut self, id: &SubscriptionId) -> Vec<Symbol> {
        let Some(held) = self.by_subscription.remove(id) else {
            return vec![];
        };

        let mut last = Vec::new();
        for symbol in held {
            if let Some(count) = self.refcount.get_mut(&symbol) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    self.refcount.remove(&symbol);
                    last.push(symbol);
                }
            }
        }

        last
    }
}

// =============================================================================
// Symbol Demand
// =============================================================================

/// Reference-counted symbol demand across subscriptions.
///
/// # Example
///
/// ```rust
/// use stream_analytics::domain::market_data::DataType;
/// use stream_analytics::domain::subscription::{SubscriptionId, SymbolDemand};
///
/// let demand = SymbolDemand::new();
/// let a = SubscriptionId::from("a");
/// let b = SubscriptionId::from("b");
///
/// let changes = demand.add(&a, DataType::Quotes, &["AAPL".to_string()]);
/// assert!(changes.subscribe.contains("AAPL"));
///
/// // A second subscriber does not change upstream demand
/// let changes = demand.add(&b, DataType::Quotes, &["AAPL".to_string()]);
/// assert!(changes.is_empty());
///
/// demand.remove(&a);
/// let changes = demand.remove(&b);
/// assert!(changes[&DataType::Quotes].unsubscribe.contains("AAPL"));
/// ```
#[derive(Debug, Default)]
pub struct SymbolDemand {
    by_type: RwLock<HashMap<DataType, TypeDemand>>,
}

impl SymbolDemand {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a subscription wants `symbols` of `data_type`.
    pub fn add(
        &self,
        id: &SubscriptionId,
        data_type: DataType,
        symbols: &[Symbol],
    ) -> SubscriptionChanges {
        let first = self
            .by_type
            .write()
            .entry(data_type)
            .or_default()
            .add(id, symbols);
        SubscriptionChanges::subscribe_only(first)
    }

    /// Release everything a subscription held.
    ///
    /// Returns, per data type, the symbols nobody demands anymore.
    pub fn remove(&self, id: &SubscriptionId) -> HashMap<DataType, SubscriptionChanges> {
        let mut by_type = self.by_type.write();
        let mut changes = HashMap::new();

        for (data_type, state) in by_type.iter_mut() {
            let last = state.remove(id);
            if !last.is_empty() {
                changes.insert(*data_type, SubscriptionChanges::unsubscribe_only(last));
            }
        }

        changes
    }

    /// All symbols demanded for a data type.
    #[must_use]
    pub fn active_symbols(&self, data_type: DataType) -> Vec<Symbol> {
        self.by_type
            .read()
            .get(&data_type)
            .map(|state| state.refcount.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Statistics for one data type.
    #[must_use]
    pub fn stats(&self, data_type: DataType) -> DemandStats {
        self.by_type
            .read()
            .get(&data_type)
            .map(|state| DemandStats {
                symbol_count: state.refcount.len(),
                subscription_count: state.by_subscription.len(),
            })
            .unwrap_or_default()
    }

    /// Number of distinct (data type, symbol) pairs demanded.
    #[must_use]
    pub fn total_symbols(&self) -> usize {
        self.by_type
            .read()
            .values()
            .map(|state| state.refcount.len())
            .sum()
    }
}

/// Demand statistics for one data type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DemandStats {
    /// Number of distinct symbols.
    pub symbol_count: usize,
    /// Number of subscriptions holding at least one symbol.
    pub subscription_count: usize,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(s: &str) -> Symbol {
        s.to_string()
    }

    #[test]
    fn options_validation() {
        let ok = SubscriptionOptions::new([DataType::Quotes], ["AAPL"]);
        assert!(ok.validate().is_ok());

        let no_types = SubscriptionOptions::new([], ["AAPL"]);
        assert_eq!(no_types.validate(), Err(OptionsError::NoDataTypes));

        let no_symbols = SubscriptionOptions::new([DataType::Quotes], Vec::<String>::new());
        assert_eq!(no_symbols.validate(), Err(OptionsError::NoSymbols));

        let zero_rate = ok.clone().with_throttle_rate(0);
        assert_eq!(zero_rate.validate(), Err(OptionsError::ZeroThrottleRate));

        let zero_buffer = ok.with_buffer_size(0);
        assert_eq!(zero_buffer.validate(), Err(OptionsError::ZeroBufferSize));
    }

    #[test]
    fn options_dedupe_data_types() {
        let options = SubscriptionOptions::new(
            [DataType::Trades, DataType::Quotes, DataType::Trades],
            ["AAPL"],
        );
        assert_eq!(options.data_types, vec![DataType::Quotes, DataType::Trades]);
        assert_eq!(options.priority, Priority::Medium);
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(SubscriptionId::generate(), SubscriptionId::generate());
    }

    #[test]
    fn first_subscriber_changes_demand() {
        let demand = SymbolDemand::new();
        let changes = demand.add(&"a".into(), DataType::Quotes, &[sym("AAPL")]);

        assert!(changes.subscribe.contains("AAPL"));
        assert!(changes.unsubscribe.is_empty());
    }

    #[test]
    fn overlapping_subscribers_share_demand() {
        let demand = SymbolDemand::new();
        demand.add(&"a".into(), DataType::Trades, &[sym("AAPL"), sym("MSFT")]);
        let changes = demand.add(&"b".into(), DataType::Trades, &[sym("AAPL"), sym("GOOG")]);

        assert_eq!(changes.subscribe.len(), 1);
        assert!(changes.subscribe.contains("GOOG"));

        let released = demand.remove(&"a".into());
        let trades = &released[&DataType::Trades];
        assert!(trades.unsubscribe.contains("MSFT"));
        assert!(!trades.unsubscribe.contains("AAPL"));
    }

    #[test]
    fn removing_unknown_subscription_is_empty() {
        let demand = SymbolDemand::new();
        demand.add(&"a".into(), DataType::Quotes, &[sym("AAPL")]);

        assert!(demand.remove(&"zzz".into()).is_empty());
        assert_eq!(demand.active_symbols(DataType::Quotes).len(), 1);
    }

    #[test]
    fn data_types_are_independent() {
        let demand = SymbolDemand::new();
        demand.add(&"a".into(), DataType::Quotes, &[sym("AAPL")]);
        demand.add(&"a".into(), DataType::Trades, &[sym("MSFT")]);

        assert_eq!(demand.active_symbols(DataType::Quotes), vec![sym("AAPL")]);
        assert_eq!(demand.active_symbols(DataType::Trades), vec![sym("MSFT")]);
        assert_eq!(demand.total_symbols(), 2);

        let released = demand.remove(&"a".into());
        assert_eq!(released.len(), 2);
        assert_eq!(demand.total_symbols(), 0);
    }

    #[test]
    fn stats_are_accurate() {
        let demand = SymbolDemand::new();
        demand.add(&"a".into(), DataType::Quotes, &[sym("AAPL"), sym("MSFT")]);
        demand.add(&"b".into(), DataType::Quotes, &[sym("AAPL")]);

        let stats = demand.stats(DataType::Quotes);
        assert_eq!(stats.symbol_count, 2);
        assert_eq!(stats.subscription_count, 2);
        assert_eq!(demand.stats(DataType::Bars), DemandStats::default());
    }

    #[test]
    fn thread_safety_concurrent_subscriptions() {
        use std::sync::Arc;
        use std::thread;

        let demand = Arc::new(SymbolDemand::new());
        let handles: Vec<_> = (0..10)
            .map(|i| {
                let demand = Arc::clone(&demand);
                thread::spawn(move || {
                    demand.add(
                        &SubscriptionId::from(format!("sub-{i}")),
                        DataType::Quotes,
                        &[format!("SYM{i}"), sym("SHARED")],
                    );
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let stats = demand.stats(DataType::Quotes);
        assert_eq!(stats.subscription_count, 10);
        assert_eq!(stats.symbol_count, 11);
    }
}
