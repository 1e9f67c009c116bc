//! Bid/ask spread in price and basis points of mid.

use rust_decimal::Decimal;
use serde_json::json;

use super::{chronological, to_f64};
use crate::domain::analytics::{
    AnalyticsConfig, AnalyticsResult, AnalyticsType, CalculationResult, WindowSnapshot,
};
use crate::domain::market_data::Quote;

const BPS: Decimal = Decimal::from_parts(10_000, 0, 0, false, 0);

fn spread_bps(quote: &Quote) -> Option<Decimal> {
    let mid = quote.mid_price();
    (mid > Decimal::ZERO).then(|| quote.spread() / mid * BPS)
}

/// Compute the spread per symbol.
///
/// # Errors
///
/// Never fails; symbols without a quote are skipped.
pub fn calculate(_config: &AnalyticsConfig, snapshot: &WindowSnapshot) -> CalculationResult {
    let mut results = Vec::new();

    for (symbol, messages) in &snapshot.buffers {
        let quotes: Vec<&Quote> = chronological(messages)
            .into_iter()
            .filter_map(|m| m.as_quote())
            .collect();
        let Some(latest) = quotes.last() else {
            continue;
        };
        let Some(latest_bps) = spread_bps(latest) else {
            continue;
        };

        let all_bps: Vec<Decimal> = quotes.iter().filter_map(|q| spread_bps(q)).collect();
        let average_bps = all_bps.iter().sum::<Decimal>() / Decimal::from(all_bps.len());

        results.push(
            AnalyticsResult::new(
                AnalyticsType::BidAskSpread,
                symbol.clone(),
                snapshot.as_of_ms,
                to_f64(latest_bps),
            )
            .with_metadata(json!({
                "spread": to_f64(latest.spread()),
                "spread_bps": to_f64(latest_bps),
                "average_spread_bps": to_f64(average_bps),
                "mid_price": to_f64(latest.mid_price()),
                "quote_count": quotes.len(),
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
    fn spread_in_basis_points() {
        let config = AnalyticsConfig::new(AnalyticsType::BidAskSpread, ["AAPL"]);
        let results = calculate(
            &config,
            &snapshot(vec![
                MarketDataMessage::quote("AAPL", 0, dec!(99), 1, dec!(101), 1),
                MarketDataMessage::quote("AAPL", 1, dec!(100), 1, dec!(100.10), 1),
            ]),
        )
        .unwrap();

        let result = &results[0];
        let expected = 0.10 / 100.05 * 10_000.0;
        assert!((result.value - expected).abs() < 1e-6);
        assert!((result.metadata_f64("spread").unwrap() - 0.10).abs() < 1e-9);
        // (200 + 9.995) / 2
        assert!((result.metadata_f64("average_spread_bps").unwrap() - (200.0 + expected) / 2.0).abs() < 1e-6);
    }

    #[test]
    fn no_quotes_no_result() {
        let config = AnalyticsConfig::new(AnalyticsType::BidAskSpread, ["AAPL"]);
        let results = calculate(
            &config,
            &snapshot(vec![MarketDataMessage::trade("AAPL", 0, dec!(100), 1)]),
        )
        .unwrap();
        assert!(results.is_empty());
    }
}
