//! Volume-weighted average price over the trades in the window, plus the
//! latest trade's deviation from it. Arithmetic stays in `Decimal` until
//! the result is reported.

use rust_decimal::Decimal;
use serde_json::json;

use super::{chronological, to_f64};
use crate::domain::analytics::{
    AnalyticsConfig, AnalyticsResult, AnalyticsType, CalculationResult, WindowSnapshot,
};

/// Compute VWAP per symbol.
///
/// # Errors
///
/// Never fails; symbols without traded volume are skipped.
pub fn calculate(_config: &AnalyticsConfig, snapshot: &WindowSnapshot) -> CalculationResult {
    let mut results = Vec::new();

    for (symbol, messages) in &snapshot.buffers {
        let trades: Vec<_> = chronological(messages)
            .into_iter()
            .filter_map(|m| m.as_trade())
            .collect();

        let volume: u64 = trades.iter().map(|t| t.size).sum();
        let Some(latest) = trades.last() else {
            continue;
        };
        if volume == 0 {
            continue;
        }

        let notional: Decimal = trades
            .iter()
            .map(|t| t.price * Decimal::from(t.size))
            .sum();
        let vwap = notional / Decimal::from(volume);
        let deviation = latest.price - vwap;
        let deviation_pct = if vwap.is_zero() {
            Decimal::ZERO
        } else {
            deviation / vwap * Decimal::ONE_HUNDRED
        };

        results.push(
            AnalyticsResult::new(AnalyticsType::Vwap, symbol.clone(), snapshot.as_of_ms, to_f64(vwap))
                .with_metadata(json!({
                    "vwap": to_f64(vwap),
                    "volume": volume,
                    "trade_count": trades.len(),
                    "latest_price": to_f64(latest.price),
                    "deviation": to_f64(deviation),
                    "deviation_pct": to_f64(deviation_pct),
                })),
        );
    }

    Ok(results)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use rust_decimal_macros::dec;

    use super::*;
    use crate::domain::market_data::MarketDataMessage;

    fn snapshot(messages: Vec<MarketDataMessage>) -> WindowSnapshot {
        WindowSnapshot {
            as_of_ms: 1_000,
            window_ms: 60_000,
            buffers: BTreeMap::from([("AAPL".to_string(), messages)]),
        }
    }

    #[test]
    fn weighted_by_volume() {
        let config = AnalyticsConfig::new(AnalyticsType::Vwap, ["AAPL"]);
        let results = calculate(
            &config,
            &snapshot(vec![
                MarketDataMessage::trade("AAPL", 0, dec!(100), 100),
                MarketDataMessage::trade("AAPL", 1, dec!(102), 300),
            ]),
        )
        .unwrap();

        let result = &results[0];
        assert!((result.value - 101.5).abs() < 1e-9);
        assert!((result.metadata_f64("deviation").unwrap() - 0.5).abs() < 1e-9);
        assert_eq!(result.metadata_f64("volume"), Some(400.0));
    }

    #[test]
    fn latest_is_by_timestamp() {
        let config = AnalyticsConfig::new(AnalyticsType::Vwap, ["AAPL"]);
        let results = calculate(
            &config,
            &snapshot(vec![
                MarketDataMessage::trade("AAPL", 5, dec!(100), 100),
                MarketDataMessage::trade("AAPL", 1, dec!(104), 100),
            ]),
        )
        .unwrap();

        assert!((results[0].metadata_f64("latest_price").unwrap() - 100.0).abs() < 1e-9);
        assert!((results[0].metadata_f64("deviation").unwrap() + 2.0).abs() < 1e-9);
    }

    #[test]
    fn quotes_only_yield_nothing() {
        let config = AnalyticsConfig::new(AnalyticsType::Vwap, ["AAPL"]);
        let results = calculate(
            &config,
            &snapshot(vec![MarketDataMessage::quote("AAPL", 0, dec!(1), 1, dec!(2), 1)]),
        )
        .unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn zero_volume_is_skipped() {
        let config = AnalyticsConfig::new(AnalyticsType::Vwap, ["AAPL"]);
        let results = calculate(
            &config,
            &snapshot(vec![MarketDataMessage::trade("AAPL", 0, dec!(100), 0)]),
        )
        .unwrap();
        assert!(results.is_empty());
    }
}
