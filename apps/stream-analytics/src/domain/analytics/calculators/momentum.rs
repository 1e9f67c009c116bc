//! Momentum.
//!
//! The window `[as_of - window, as_of]` is split into `buckets` equal
//! slices (default 5). Each slice's reference prices (trade price or bar
//! close) are averaged, and the rate of change is taken between
//! consecutive non-empty slices. The result value is the mean rate of
//! change; `acceleration` is the difference of the last two rates.

use serde_json::json;

use super::{bounded_param, price_series};
use crate::domain::analytics::{
    AnalyticsConfig, AnalyticsResult, AnalyticsType, CalculationResult, WindowSnapshot,
};

const DEFAULT_BUCKETS: u64 = 5;

/// Compute momentum per symbol.
///
/// # Errors
///
/// Returns `InvalidParameter` when `buckets` is outside `2..=1000`.
pub fn calculate(config: &AnalyticsConfig, snapshot: &WindowSnapshot) -> CalculationResult {
    let buckets = bounded_param(config, &["buckets", "periods"], DEFAULT_BUCKETS, 2..=1_000)?;
    let start = snapshot.window_start_ms();
    let bucket_ms = snapshot.window_ms as f64 / buckets as f64;

    let mut results = Vec::new();
    for (symbol, messages) in &snapshot.buffers {
        let mut sums = vec![(0.0_f64, 0_usize); buckets];
        for (timestamp, price) in price_series(messages) {
            let offset = (timestamp - start).max(0) as f64;
            let index = ((offset / bucket_ms) as usize).min(buckets - 1);
            sums[index].0 += price;
            sums[index].1 += 1;
        }

        let averages: Vec<f64> = sums
            .iter()
            .filter(|(_, count)| *count > 0)
            .map(|(sum, count)| sum / *count as f64)
            .collect();

        let rates: Vec<f64> = averages
            .windows(2)
            .filter(|pair| pair[0].abs() > f64::EPSILON)
            .map(|pair| (pair[1] - pair[0]) / pair[0])
            .collect();

        if rates.is_empty() {
            continue;
        }

        let mean_rate = rates.iter().sum::<f64>() / rates.len() as f64;
        let acceleration = match rates.as_slice() {
            [.., previous, last] => last - previous,
            _ => 0.0,
        };

        results.push(
            AnalyticsResult::new(AnalyticsType::Momentum, symbol.clone(), snapshot.as_of_ms, mean_rate)
                .with_confidence(averages.len() as f64 / buckets as f64)
                .with_metadata(json!({
                    "rate_of_change": rates,
                    "acceleration": acceleration,
                    "buckets": buckets,
                    "filled_buckets": averages.len(),
                })),
        );
    }

    Ok(results)
}
