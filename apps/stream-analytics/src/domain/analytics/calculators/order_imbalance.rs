//! Order imbalance.
//!
//! The headline value is `(bid_size - ask_size) / (bid_size + ask_size)`
//! from the latest quote. Trades are also classified against the mid of
//! the quote prevailing when they printed: above mid is buyer-initiated,
//! below mid seller-initiated, at mid unclassified.

use serde_json::json;

use super::chronological;
use crate::domain::analytics::{
    AnalyticsConfig, AnalyticsResult, AnalyticsType, CalculationResult, WindowSnapshot,
};
use crate::domain::market_data::{MarketPayload, Quote};

fn ratio(a: u64, b: u64) -> f64 {
    let total = a.saturating_add(b);
    if total == 0 {
        return 0.0;
    }
    (a as f64 - b as f64) / total as f64
}

/// Compute order imbalance per symbol.
///
/// # Errors
///
/// Never fails; symbols without a quote are skipped.
pub fn calculate(_config: &AnalyticsConfig, snapshot: &WindowSnapshot) -> CalculationResult {
    let mut results = Vec::new();

    for (symbol, messages) in &snapshot.buffers {
        let mut prevailing: Option<&Quote> = None;
        let mut buy_volume = 0_u64;
        let mut sell_volume = 0_u64;

        for message in chronological(messages) {
            match &message.data {
                MarketPayload::Quote(quote) => prevailing = Some(quote),
                MarketPayload::Trade(trade) => {
                    if let Some(quote) = prevailing {
                        let mid = quote.mid_price();
                        if trade.price > mid {
                            buy_volume += trade.size;
                        } else if trade.price < mid {
                            sell_volume += trade.size;
                        }
                    }
                }
                _ => {}
            }
        }

        let Some(quote) = prevailing else {
            continue;
        };
        let imbalance = ratio(quote.bid_size, quote.ask_size);
        let trade_imbalance = ratio(buy_volume, sell_volume);

        results.push(
            AnalyticsResult::new(
                AnalyticsType::OrderImbalance,
                symbol.clone(),
                snapshot.as_of_ms,
                imbalance,
            )
            .with_metadata(json!({
                "imbalance_ratio": imbalance,
                "bid_size": quote.bid_size,
                "ask_size": quote.ask_size,
                "trade_imbalance": trade_imbalance,
                "buy_volume": buy_volume,
                "sell_volume": sell_volume,
            })),
        );
    }

    Ok(results)
}
