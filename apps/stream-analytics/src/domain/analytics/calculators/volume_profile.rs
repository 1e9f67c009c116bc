//! Volume profile.
//!
//! Trade volume is binned into `priceLevels` equal-width bins (default
//! 10) spanning the window's min and max trade price. Bars and quotes in
//! the window are ignored. The headline value is the point of control: the
//! midpoint of the highest-volume bin.

use serde_json::json;

use super::{bounded_param, chronological, to_f64};
use crate::domain::analytics::{
    AnalyticsConfig, AnalyticsResult, AnalyticsType, CalculationResult, WindowSnapshot,
};

const DEFAULT_PRICE_LEVELS: u64 = 10;

/// Compute the volume profile per symbol.
///
/// # Errors
///
/// Returns `InvalidParameter` when `priceLevels` is outside `1..=1000`.
pub fn calculate(config: &AnalyticsConfig, snapshot: &WindowSnapshot) -> CalculationResult {
    let levels = bounded_param(
        config,
        &["priceLevels", "price_levels"],
        DEFAULT_PRICE_LEVELS,
        1..=1_000,
    )?;

    let mut results = Vec::new();
    for (symbol, messages) in &snapshot.buffers {
        let points: Vec<(f64, u64)> = chronological(messages)
            .into_iter()
            .filter_map(|m| m.as_trade().map(|trade| (to_f64(trade.price), trade.size)))
            .filter(|(_, volume)| *volume > 0)
            .collect();

        if points.is_empty() {
            continue;
        }

        let min = points.iter().map(|(p, _)| *p).fold(f64::INFINITY, f64::min);
        let max = points.iter().map(|(p, _)| *p).fold(f64::NEG_INFINITY, f64::max);
        let width = (max - min) / levels as f64;

        let mut volumes = vec![0_u64; levels];
        for (price, volume) in &points {
            let index = if width > 0.0 {
                (((price - min) / width) as usize).min(levels - 1)
            } else {
                0
            };
            volumes[index] += volume;
        }

        let mut poc_index = 0;
        for (index, volume) in volumes.iter().enumerate() {
            if *volume > volumes[poc_index] {
                poc_index = index;
            }
        }
        let poc_price = (poc_index as f64 + 0.5).mul_add(width, min);

        let total_volume: u64 = volumes.iter().sum();
        let vwap = points.iter().map(|(p, v)| p * *v as f64).sum::<f64>() / total_volume as f64;

        let bins: Vec<_> = volumes
            .iter()
            .enumerate()
            .map(|(index, volume)| {
                json!({
                    "price_low": (index as f64).mul_add(width, min),
                    "price_high": (index as f64 + 1.0).mul_add(width, min),
                    "volume": volume,
                })
            })
            .collect();

        results.push(
            AnalyticsResult::new(AnalyticsType::VolumeProfile, symbol.clone(), snapshot.as_of_ms, poc_price)
                .with_metadata(json!({
                    "poc_price": poc_price,
                    "poc_volume": volumes[poc_index],
                    "vwap": vwap,
                    "total_volume": total_volume,
                    "levels": bins,
                })),
        );
    }

    Ok(results)
}
