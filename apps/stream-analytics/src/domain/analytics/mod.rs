//! Analytics Domain Types
//!
//! Declarative analytics configuration, point-in-time results, the
//! per-symbol sliding window and the calculator functions that turn a
//! window snapshot into results.
//!
//! A calculator is a pure function of `(config, snapshot)`. It never sees
//! live buffers: the engine hands it an owned copy taken at tick time, so
//! messages arriving mid-calculation cannot change its input.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::market_data::{DataType, MarketDataMessage, Symbol};

/// Calculator implementations.
pub mod calculators;

/// Per-symbol sliding windows.
pub mod window;

pub use window::SymbolWindows;

/// Default window length.
pub const DEFAULT_WINDOW_SIZE_MS: u64 = 60_000;

/// Default recomputation interval.
pub const DEFAULT_UPDATE_INTERVAL_MS: u64 = 1_000;

// =============================================================================
// Analytics Type
// =============================================================================

/// Kind of derived metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnalyticsType {
    /// Bucketed rate of change and acceleration.
    Momentum,
    /// Annualized return volatility.
    Volatility,
    /// Volume-weighted average price.
    Vwap,
    /// Quote size imbalance and trade classification imbalance.
    OrderImbalance,
    /// Volume by price level.
    VolumeProfile,
    /// Bid/ask spread in price and basis points.
    BidAskSpread,
    /// Relative strength against peers. Not implemented.
    RelativeStrength,
    /// Cross-symbol correlation. Not implemented.
    Correlation,
    /// Book depth. Not implemented.
    MarketDepth,
    /// Activity by price level. Not implemented.
    PriceLevelActivity,
}

impl AnalyticsType {
    /// Get all analytics types.
    #[must_use]
    pub const fn all() -> &'static [Self] {
        &[
            Self::Momentum,
            Self::Volatility,
            Self::Vwap,
            Self::OrderImbalance,
            Self::VolumeProfile,
            Self::BidAskSpread,
            Self::RelativeStrength,
            Self::Correlation,
            Self::MarketDepth,
            Self::PriceLevelActivity,
        ]
    }

    /// Get as string for topics, logging and metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Momentum => "momentum",
            Self::Volatility => "volatility",
            Self::Vwap => "vwap",
            Self::OrderImbalance => "order_imbalance",
            Self::VolumeProfile => "volume_profile",
            Self::BidAskSpread => "bid_ask_spread",
            Self::RelativeStrength => "relative_strength",
            Self::Correlation => "correlation",
            Self::MarketDepth => "market_depth",
            Self::PriceLevelActivity => "price_level_activity",
        }
    }

    /// Parse from a configuration string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Self::all()
            .iter()
            .copied()
            .find(|t| t.as_str() == normalized)
    }

    /// Data types a calculator of this type reads by default.
    #[must_use]
    pub fn default_data_types(&self) -> Vec<DataType> {
        match self {
            Self::Momentum | Self::Volatility | Self::RelativeStrength => {
                vec![DataType::Trades, DataType::Bars]
            }
            Self::Vwap | Self::VolumeProfile | Self::Correlation => vec![DataType::Trades],
            Self::OrderImbalance => vec![DataType::Quotes, DataType::Trades],
            Self::BidAskSpread => vec![DataType::Quotes],
            Self::MarketDepth => vec![DataType::Level2],
            Self::PriceLevelActivity => vec![DataType::Level2, DataType::Trades],
        }
    }

    /// Global topic carrying every result of this type.
    #[must_use]
    pub fn topic(&self) -> String {
        format!("analytics:{}", self.as_str())
    }

    /// Global topic carrying results of this type for one symbol.
    #[must_use]
    pub fn symbol_topic(&self, symbol: &str) -> String {
        format!("analytics:{}:{symbol}", self.as_str())
    }
}

impl fmt::Display for AnalyticsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Analytics Config
// =============================================================================

/// Invalid analytics configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigValidationError {
    /// No symbol requested.
    #[error("at least one symbol is required")]
    NoSymbols,

    /// No data type to read.
    #[error("at least one required data type is needed")]
    NoDataTypes,

    /// Window of zero length.
    #[error("window size must be positive")]
    ZeroWindow,

    /// Interval of zero length.
    #[error("update interval must be positive")]
    ZeroInterval,
}

/// Declarative description of an analytics subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsConfig {
    /// Metric to compute.
    #[serde(rename = "type")]
    pub analytics_type: AnalyticsType,
    /// Symbols to compute it for.
    pub symbols: Vec<Symbol>,
    /// Calculator-specific parameters.
    #[serde(default)]
    pub parameters: Map<String, Value>,
    /// Sliding window length.
    pub window_size_ms: u64,
    /// Recomputation cadence.
    pub update_interval_ms: u64,
    /// Data types to subscribe to.
    pub required_data_types: Vec<DataType>,
}

impl AnalyticsConfig {
    /// Config with default window, interval and data types.
    #[must_use]
    pub fn new(
        analytics_type: AnalyticsType,
        symbols: impl IntoIterator<Item = impl Into<Symbol>>,
    ) -> Self {
        Self {
            analytics_type,
            symbols: symbols.into_iter().map(Into::into).collect(),
            parameters: Map::new(),
            window_size_ms: DEFAULT_WINDOW_SIZE_MS,
            update_interval_ms: DEFAULT_UPDATE_INTERVAL_MS,
            required_data_types: analytics_type.default_data_types(),
        }
    }

    /// Set the window length.
    #[must_use]
    pub const fn with_window_ms(mut self, window_size_ms: u64) -> Self {
        self.window_size_ms = window_size_ms;
        self
    }

    /// Set the recomputation cadence.
    #[must_use]
    pub const fn with_update_interval_ms(mut self, update_interval_ms: u64) -> Self {
        self.update_interval_ms = update_interval_ms;
        self
    }

    /// Override the data types to read.
    #[must_use]
    pub fn with_data_types(mut self, data_types: impl IntoIterator<Item = DataType>) -> Self {
        self.required_data_types = data_types.into_iter().collect();
        self
    }

    /// Set one parameter.
    #[must_use]
    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    /// Check the config is usable.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.symbols.is_empty() {
            return Err(ConfigValidationError::NoSymbols);
        }
        if self.required_data_types.is_empty() {
            return Err(ConfigValidationError::NoDataTypes);
        }
        if self.window_size_ms == 0 {
            return Err(ConfigValidationError::ZeroWindow);
        }
        if self.update_interval_ms == 0 {
            return Err(ConfigValidationError::ZeroInterval);
        }
        Ok(())
    }

    /// Unsigned integer parameter, trying each key in turn.
    #[must_use]
    pub fn param_u64(&self, keys: &[&str]) -> Option<u64> {
        keys.iter()
            .find_map(|key| self.parameters.get(*key).and_then(Value::as_u64))
    }

    /// String parameter.
    #[must_use]
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(Value::as_str)
    }
}

// =============================================================================
// Results and Snapshots
// =============================================================================

/// Point-in-time metric value for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsResult {
    /// Metric kind.
    #[serde(rename = "type")]
    pub analytics_type: AnalyticsType,
    /// Symbol the value describes.
    pub symbol: Symbol,
    /// Computation time in epoch milliseconds.
    pub timestamp: i64,
    /// Headline value.
    pub value: f64,
    /// Confidence in `[0, 1]`, when the calculator can judge it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Calculator-specific detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl AnalyticsResult {
    /// Create a result with no confidence or metadata.
    #[must_use]
    pub fn new(
        analytics_type: AnalyticsType,
        symbol: impl Into<Symbol>,
        timestamp: i64,
        value: f64,
    ) -> Self {
        Self {
            analytics_type,
            symbol: symbol.into(),
            timestamp,
            value,
            confidence: None,
            metadata: None,
        }
    }

    /// Attach a confidence.
    #[must_use]
    pub const fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    /// Attach metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Read a numeric metadata field.
    #[must_use]
    pub fn metadata_f64(&self, key: &str) -> Option<f64> {
        self.metadata.as_ref()?.get(key)?.as_f64()
    }
}

/// Owned copy of a subscription's windows at one instant.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowSnapshot {
    /// Snapshot time in epoch milliseconds.
    pub as_of_ms: i64,
    /// Window length the snapshot was trimmed to.
    pub window_ms: u64,
    /// Non-empty buffers, oldest message first.
    pub buffers: BTreeMap<Symbol, Vec<MarketDataMessage>>,
}

impl WindowSnapshot {
    /// Earliest timestamp still inside the window.
    #[must_use]
    pub fn window_start_ms(&self) -> i64 {
        self.as_of_ms
            .saturating_sub(i64::try_from(self.window_ms).unwrap_or(i64::MAX))
    }

    /// Messages of one symbol.
    #[must_use]
    pub fn messages(&self, symbol: &str) -> &[MarketDataMessage] {
        self.buffers.get(symbol).map(Vec::as_slice).unwrap_or_default()
    }

    /// Whether every buffer is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffers.values().all(Vec::is_empty)
    }
}

// =============================================================================
// Calculators
// =============================================================================

/// Failure of a calculator on one tick.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CalculationError {
    /// A parameter has an unusable value.
    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter {
        /// Parameter name.
        name: String,
        /// What is wrong with it.
        reason: String,
    },

    /// The calculation failed.
    #[error("calculation failed: {0}")]
    Failed(String),

    /// The calculator panicked.
    #[error("calculator panicked: {0}")]
    Panicked(String),
}

/// Outcome of one calculator invocation.
pub type CalculationResult = Result<Vec<AnalyticsResult>, CalculationError>;

/// Pure function from config and window snapshot to results.
pub type Calculator = Arc<dyn Fn(&AnalyticsConfig, &WindowSnapshot) -> CalculationResult + Send + Sync>;

#[cfg(test)]
mod tests {
    use serde_json::json;
    use test_case::test_case;

    use super::*;

    #[test]
    fn config_defaults() {
        let config = AnalyticsConfig::new(AnalyticsType::OrderImbalance, ["AAPL"]);

        assert_eq!(config.window_size_ms, 60_000);
        assert_eq!(config.update_interval_ms, 1_000);
        assert_eq!(
            config.required_data_types,
            vec![DataType::Quotes, DataType::Trades]
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn config_validation() {
        let base = AnalyticsConfig::new(AnalyticsType::Vwap, ["AAPL"]);

        assert_eq!(
            base.clone().with_window_ms(0).validate(),
            Err(ConfigValidationError::ZeroWindow)
        );
        assert_eq!(
            base.clone().with_update_interval_ms(0).validate(),
            Err(ConfigValidationError::ZeroInterval)
        );
        assert_eq!(
            base.with_data_types([]).validate(),
            Err(ConfigValidationError::NoDataTypes)
        );
        assert_eq!(
            AnalyticsConfig::new(AnalyticsType::Vwap, Vec::<String>::new()).validate(),
            Err(ConfigValidationError::NoSymbols)
        );
    }

    #[test]
    fn parameters_fall_back_across_keys() {
        let config =
            AnalyticsConfig::new(AnalyticsType::VolumeProfile, ["AAPL"]).with_parameter("priceLevels", 20);

        assert_eq!(config.param_u64(&["price_levels", "priceLevels"]), Some(20));
        assert_eq!(config.param_u64(&["missing"]), None);
    }

    #[test_case("momentum", Some(AnalyticsType::Momentum))]
    #[test_case("ORDER_IMBALANCE", Some(AnalyticsType::OrderImbalance))]
    #[test_case("bid-ask-spread", Some(AnalyticsType::BidAskSpread))]
    #[test_case("sma", None)]
    fn parse_analytics_type(input: &str, expected: Option<AnalyticsType>) {
        assert_eq!(AnalyticsType::parse(input), expected);
    }

    #[test]
    fn topics() {
        assert_eq!(AnalyticsType::Vwap.topic(), "analytics:vwap");
        assert_eq!(
            AnalyticsType::OrderImbalance.symbol_topic("AAPL"),
            "analytics:order_imbalance:AAPL"
        );
    }

    #[test]
    fn config_json_shape() {
        let config: AnalyticsConfig = serde_json::from_value(json!({
            "type": "MOMENTUM",
            "symbols": ["AAPL"],
            "window_size_ms": 30000,
            "update_interval_ms": 500,
            "required_data_types": ["TRADES"]
        }))
        .unwrap();

        assert_eq!(config.analytics_type, AnalyticsType::Momentum);
        assert!(config.parameters.is_empty());
    }

    #[test]
    fn snapshot_window_start() {
        let snapshot = WindowSnapshot {
            as_of_ms: 100_000,
            window_ms: 60_000,
            buffers: BTreeMap::new(),
        };
        assert_eq!(snapshot.window_start_ms(), 40_000);
        assert!(snapshot.is_empty());
        assert!(snapshot.messages("AAPL").is_empty());
    }
}
