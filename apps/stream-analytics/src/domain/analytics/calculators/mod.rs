//! Analytics calculators.
//!
//! Each calculator is a pure `fn(&AnalyticsConfig, &WindowSnapshot)`.
//! Symbols without enough data produce no result rather than an error;
//! errors are reserved for unusable parameters.

use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

use super::{
    AnalyticsConfig, AnalyticsType, CalculationError, CalculationResult, Calculator, WindowSnapshot,
};
use crate::domain::market_data::MarketDataMessage;

/// Momentum over equal-duration buckets.
pub mod momentum;

/// Order book imbalance from quotes and classified trades.
pub mod order_imbalance;

/// Bid/ask spread.
pub mod spread;

/// Annualized volatility of returns.
pub mod volatility;

/// Volume by price level.
pub mod volume_profile;

/// Volume-weighted average price.
pub mod vwap;

/// Every built-in calculator, including empty-result placeholders for
/// types that have no implementation yet.
#[must_use]
pub fn default_calculators() -> Vec<(AnalyticsType, Calculator)> {
    vec![
        entry(AnalyticsType::Momentum, momentum::calculate),
        entry(AnalyticsType::Volatility, volatility::calculate),
        entry(AnalyticsType::Vwap, vwap::calculate),
        entry(AnalyticsType::OrderImbalance, order_imbalance::calculate),
        entry(AnalyticsType::VolumeProfile, volume_profile::calculate),
        entry(AnalyticsType::BidAskSpread, spread::calculate),
        entry(AnalyticsType::RelativeStrength, not_implemented),
        entry(AnalyticsType::Correlation, not_implemented),
        entry(AnalyticsType::MarketDepth, not_implemented),
        entry(AnalyticsType::PriceLevelActivity, not_implemented),
    ]
}

fn entry<F>(analytics_type: AnalyticsType, calculator: F) -> (AnalyticsType, Calculator)
where
    F: Fn(&AnalyticsConfig, &WindowSnapshot) -> CalculationResult + Send + Sync + 'static,
{
    let calculator: Calculator = Arc::new(calculator);
    (analytics_type, calculator)
}

/// Placeholder calculator that always yields no results.
///
/// # Errors
///
/// Never fails.
pub fn not_implemented(_config: &AnalyticsConfig, _snapshot: &WindowSnapshot) -> CalculationResult {
    Ok(Vec::new())
}

// =============================================================================
// Shared helpers
// =============================================================================

fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or_default()
}

/// Messages sorted by timestamp, arrival order kept for ties.
fn chronological(messages: &[MarketDataMessage]) -> Vec<&MarketDataMessage> {
    let mut ordered: Vec<&MarketDataMessage> = messages.iter().collect();
    ordered.sort_by_key(|m| m.timestamp);
    ordered
}

/// `(timestamp, reference price)` points in time order.
fn price_series(messages: &[MarketDataMessage]) -> Vec<(i64, f64)> {
    chronological(messages)
        .into_iter()
        .filter_map(|m| m.reference_price().map(|p| (m.timestamp, to_f64(p))))
        .collect()
}

fn bounded_param(
    config: &AnalyticsConfig,
    keys: &[&str],
    default: u64,
    range: std::ops::RangeInclusive<u64>,
) -> Result<usize, CalculationError> {
    let value = config.param_u64(keys).unwrap_or(default);
    if !range.contains(&value) {
        return Err(CalculationError::InvalidParameter {
            name: keys.first().copied().unwrap_or_default().to_string(),
            reason: format!(
                "{value} is outside {}..={}",
                range.start(),
                range.end()
            ),
        });
    }
    usize::try_from(value).map_err(|e| CalculationError::InvalidParameter {
        name: keys.first().copied().unwrap_or_default().to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn every_type_has_a_default_calculator() {
        let registered: Vec<AnalyticsType> =
            default_calculators().into_iter().map(|(t, _)| t).collect();
        for analytics_type in AnalyticsType::all() {
            assert!(registered.contains(analytics_type), "{analytics_type} missing");
        }
    }

    #[test]
    fn placeholders_return_nothing() {
        let config = AnalyticsConfig::new(AnalyticsType::Correlation, ["AAPL"]);
        let snapshot = WindowSnapshot {
            as_of_ms: 0,
            window_ms: 1_000,
            buffers: BTreeMap::new(),
        };
        assert_eq!(not_implemented(&config, &snapshot), Ok(vec![]));
    }

    #[test]
    fn bounded_param_rejects_out_of_range() {
        let config =
            AnalyticsConfig::new(AnalyticsType::Momentum, ["AAPL"]).with_parameter("buckets", 1);
        let err = bounded_param(&config, &["buckets"], 5, 2..=100).unwrap_err();
        assert!(matches!(err, CalculationError::InvalidParameter { ref name, .. } if name == "buckets"));
    }
}
