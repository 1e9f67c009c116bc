//! Engine Configuration Settings
//!
//! Configuration types for the stream analytics engine, loaded from
//! environment variables. Every value has a documented default; only
//! malformed enumerations and empty lists are errors.

use std::time::Duration;

use crate::domain::market_data::Symbol;
use crate::domain::pipeline::{DropPolicy, Priority};

/// Provider routing and pipeline defaults.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Time allowed for a provider to connect and report `open`.
    pub connect_timeout: Duration,
    /// Provider used for data types without an explicit route.
    pub default_provider: String,
    /// Stage buffer capacity when a subscription sets no buffer size.
    pub default_capacity: usize,
    /// Stage drop policy when a subscription sets none.
    pub default_policy: DropPolicy,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            default_provider: "simulated".to_string(),
            default_capacity: 1_000,
            default_policy: DropPolicy::Oldest,
        }
    }
}

/// Data subscription defaults applied by the analytics engine.
#[derive(Debug, Clone, Copy)]
pub struct AnalyticsSettings {
    /// Messages per second per symbol.
    pub throttle_rate: u32,
    /// Duplicate suppression window.
    pub deduplication_window: Duration,
    /// Push priority.
    pub priority: Priority,
    /// Entry cap per symbol window.
    pub max_window_entries: usize,
}

impl Default for AnalyticsSettings {
    fn default() -> Self {
        Self {
            throttle_rate: 10,
            deduplication_window: Duration::from_millis(100),
            priority: Priority::Medium,
            max_window_entries: 10_000,
        }
    }
}

/// Event channel settings.
#[derive(Debug, Clone)]
pub struct BroadcastSettings {
    /// Capacity of the streaming event channel.
    pub stream_events_capacity: usize,
    /// Capacity of the analytics event channel.
    pub analytics_events_capacity: usize,
    /// Capacity of each `analytics:*` result topic.
    pub result_topic_capacity: usize,
}

impl Default for BroadcastSettings {
    fn default() -> Self {
        Self {
            stream_events_capacity: 1_024,
            analytics_events_capacity: 1_024,
            result_topic_capacity: 256,
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Health check HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { health_port: 8083 }
    }
}

/// Simulated provider and startup subscription settings.
#[derive(Debug, Clone)]
pub struct SimulatorSettings {
    /// Symbols the binary subscribes analytics for.
    pub symbols: Vec<Symbol>,
    /// Interval between generated ticks.
    pub tick_interval: Duration,
}

impl Default for SimulatorSettings {
    fn default() -> Self {
        Self {
            symbols: vec!["AAPL".to_string(), "MSFT".to_string(), "SPY".to_string()],
            tick_interval: Duration::from_millis(250),
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Provider routing and pipeline defaults.
    pub orchestrator: OrchestratorSettings,
    /// Analytics data subscription defaults.
    pub analytics: AnalyticsSettings,
    /// Event channel settings.
    pub broadcast: BroadcastSettings,
    /// Server port settings.
    pub server: ServerSettings,
    /// Simulated provider settings.
    pub simulator: SimulatorSettings,
}

impl EngineConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if an enumerated value cannot be parsed or a
    /// required list is empty.
    pub fn from_env() -> Result<Self, ConfigError> {
        let orchestrator_defaults = OrchestratorSettings::default();
        let default_provider = std::env::var("STREAM_ANALYTICS_DEFAULT_PROVIDER")
            .unwrap_or(orchestrator_defaults.default_provider);
        if default_provider.trim().is_empty() {
            return Err(ConfigError::EmptyValue(
                "STREAM_ANALYTICS_DEFAULT_PROVIDER".to_string(),
            ));
        }

        let orchestrator = OrchestratorSettings {
            connect_timeout: parse_env_duration_millis(
                "STREAM_ANALYTICS_CONNECT_TIMEOUT_MS",
                orchestrator_defaults.connect_timeout,
            ),
            default_provider,
            default_capacity: parse_env_usize(
                "STREAM_ANALYTICS_DEFAULT_CAPACITY",
                orchestrator_defaults.default_capacity,
            ),
            default_policy: parse_env_enum(
                "STREAM_ANALYTICS_DEFAULT_DROP_POLICY",
                orchestrator_defaults.default_policy,
                DropPolicy::parse,
            )?,
        };

        let analytics_defaults = AnalyticsSettings::default();
        let analytics = AnalyticsSettings {
            throttle_rate: parse_env_u32(
                "STREAM_ANALYTICS_THROTTLE_RATE",
                analytics_defaults.throttle_rate,
            ),
            deduplication_window: parse_env_duration_millis(
                "STREAM_ANALYTICS_DEDUP_WINDOW_MS",
                analytics_defaults.deduplication_window,
            ),
            priority: parse_env_enum(
                "STREAM_ANALYTICS_PRIORITY",
                analytics_defaults.priority,
                Priority::parse,
            )?,
            max_window_entries: parse_env_usize(
                "STREAM_ANALYTICS_MAX_WINDOW_ENTRIES",
                analytics_defaults.max_window_entries,
            ),
        };

        let broadcast = BroadcastSettings {
            stream_events_capacity: parse_env_usize(
                "STREAM_ANALYTICS_STREAM_EVENTS_CAPACITY",
                BroadcastSettings::default().stream_events_capacity,
            ),
            analytics_events_capacity: parse_env_usize(
                "STREAM_ANALYTICS_ANALYTICS_EVENTS_CAPACITY",
                BroadcastSettings::default().analytics_events_capacity,
            ),
            result_topic_capacity: parse_env_usize(
                "STREAM_ANALYTICS_RESULT_TOPIC_CAPACITY",
                BroadcastSettings::default().result_topic_capacity,
            ),
        };

        let server = ServerSettings {
            health_port: parse_env_u16(
                "STREAM_ANALYTICS_HEALTH_PORT",
                ServerSettings::default().health_port,
            ),
        };

        let simulator = SimulatorSettings {
            symbols: parse_env_symbols(
                "STREAM_ANALYTICS_SYMBOLS",
                SimulatorSettings::default().symbols,
            )?,
            tick_interval: parse_env_duration_millis(
                "STREAM_ANALYTICS_TICK_INTERVAL_MS",
                SimulatorSettings::default().tick_interval,
            ),
        };

        Ok(Self {
            orchestrator,
            analytics,
            broadcast,
            server,
            simulator,
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable could not be parsed.
    #[error("environment variable {key} has invalid value {value:?}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// Raw value.
        value: String,
    },
}

fn parse_env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_duration_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}

fn parse_env_enum<T>(
    key: &str,
    default: T,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<T, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => parse(raw.trim()).ok_or(ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw,
        }),
        Err(_) => Ok(default),
    }
}

fn parse_env_symbols(key: &str, default: Vec<Symbol>) -> Result<Vec<Symbol>, ConfigError> {
    let Ok(raw) = std::env::var(key) else {
        return Ok(default);
    };
    let symbols = split_symbols(&raw);
    if symbols.is_empty() {
        return Err(ConfigError::EmptyValue(key.to_string()));
    }
    Ok(symbols)
}

fn split_symbols(raw: &str) -> Vec<Symbol> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_uppercase)
        .collect()
}
