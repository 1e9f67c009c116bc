//! Annualized volatility.
//!
//! Returns are taken between consecutive reference prices in time order,
//! either as log returns (default) or simple returns (`method: "simple"`).
//! The sample standard deviation is scaled by
//! `sqrt(SECONDS_PER_YEAR / window_seconds)`.

use serde_json::json;

use super::price_series;
use crate::domain::analytics::{
    AnalyticsConfig, AnalyticsResult, AnalyticsType, CalculationError, CalculationResult,
    WindowSnapshot,
};

/// Seconds in a 365-day year.
pub const SECONDS_PER_YEAR: f64 = 31_536_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReturnMethod {
    Log,
    Simple,
}

impl ReturnMethod {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Simple => "simple",
        }
    }

    fn returns(self, prices: &[(i64, f64)]) -> Vec<f64> {
        prices
            .windows(2)
            .filter(|pair| pair[0].1 > 0.0 && pair[1].1 > 0.0)
            .map(|pair| match self {
                Self::Log => (pair[1].1 / pair[0].1).ln(),
                Self::Simple => (pair[1].1 - pair[0].1) / pair[0].1,
            })
            .collect()
    }
}

fn sample_std_dev(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    Some(variance.sqrt())
}

/// Compute annualized volatility per symbol.
///
/// # Errors
///
/// Returns `InvalidParameter` for an unknown `method`.
pub fn calculate(config: &AnalyticsConfig, snapshot: &WindowSnapshot) -> CalculationResult {
    let method = match config.param_str("method").unwrap_or("log") {
        "log" => ReturnMethod::Log,
        "simple" => ReturnMethod::Simple,
        other => {
            return Err(CalculationError::InvalidParameter {
                name: "method".to_string(),
                reason: format!("unknown return method {other}"),
            });
        }
    };

    let window_seconds = snapshot.window_ms as f64 / 1_000.0;
    let annualization = (SECONDS_PER_YEAR / window_seconds).sqrt();

    let mut results = Vec::new();
    for (symbol, messages) in &snapshot.buffers {
        let returns = method.returns(&price_series(messages));
        let Some(std_dev) = sample_std_dev(&returns) else {
            continue;
        };

        results.push(
            AnalyticsResult::new(
                AnalyticsType::Volatility,
                symbol.clone(),
                snapshot.as_of_ms,
                std_dev * annualization,
            )
            .with_metadata(json!({
                "method": method.as_str(),
                "std_dev": std_dev,
                "annualization_factor": annualization,
                "returns": returns.len(),
            })),
        );
    }

    Ok(results)
}
