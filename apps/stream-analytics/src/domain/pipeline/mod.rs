//! Pipeline Domain Types
//!
//! A pipeline is an ordered chain of stages. Each stage owns one bounded
//! buffer and one processor; a message leaves a stage's buffer, runs
//! through the processor and, unless dropped, lands in the next stage's
//! buffer. The last stage's output is emitted to listeners.
//!
//! This module holds the pieces that need no runtime:
//! - `buffer`: bounded FIFO with drop policies
//! - `stages`: symbol filter, deduplicator, throttler, custom processors
//! - `template`: declarative stage descriptors a pipeline is built from
//!
//! The async runtime lives in `application::services::pipeline`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::market_data::MarketDataMessage;

/// Bounded stage buffer.
pub mod buffer;

/// Stage processors.
pub mod stages;

/// Declarative pipeline templates.
pub mod template;

pub use buffer::{Admission, BoundedBuffer};
pub use stages::{CustomProcessor, DedupKey, Deduplicator, SymbolFilter, Throttler};
pub use template::{PipelineTemplate, StageDescriptor, StageKind};

// =============================================================================
// Policies
// =============================================================================

/// Push priority.
///
/// Priority never changes which message a full buffer keeps. Losing a
/// `High` message to overflow is logged at `warn` instead of `trace`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    /// Background traffic.
    Low,
    /// Normal traffic.
    #[default]
    Medium,
    /// Traffic whose loss is worth a warning.
    High,
}

impl Priority {
    /// Get as string for logging.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    /// Parse from a configuration string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

/// Overflow rule of a stage buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DropPolicy {
    /// Evict the head before inserting.
    #[default]
    Oldest,
    /// Silently discard the incoming message.
    Newest,
    /// Discard the incoming message and report backpressure.
    Reject,
}

impl DropPolicy {
    /// Get as string for logging and metric labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Oldest => "oldest",
            Self::Newest => "newest",
            Self::Reject => "reject",
        }
    }

    /// Parse from a configuration string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "oldest" => Some(Self::Oldest),
            "newest" => Some(Self::Newest),
            "reject" => Some(Self::Reject),
            _ => None,
        }
    }
}

impl fmt::Display for DropPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Stage Contract
// =============================================================================

/// Failure of a stage processor on one message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StageError {
    /// The processor returned an error.
    #[error("processor failed: {0}")]
    Processor(String),

    /// The processor panicked.
    #[error("processor panicked: {0}")]
    Panicked(String),
}

impl StageError {
    /// Build a processor error from any displayable value.
    pub fn processor(message: impl fmt::Display) -> Self {
        Self::Processor(message.to_string())
    }
}

/// Outcome of processing one message: `Ok(None)` drops it.
pub type StageResult = Result<Option<MarketDataMessage>, StageError>;

/// A pipeline stage processor.
///
/// Processors own their state and are driven by exactly one worker, so
/// `process` takes `&mut self`.
pub trait Stage: Send {
    /// Stable name used in events and stats.
    fn name(&self) -> &str;

    /// Transform, pass or drop one message.
    ///
    /// # Errors
    ///
    /// Returns `StageError` when the message cannot be processed. The
    /// message is dropped and the pipeline continues.
    fn process(&mut self, message: MarketDataMessage) -> StageResult;
}

// =============================================================================
// Events
// =============================================================================

/// Event emitted by a running pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    /// A `REJECT` stage buffer refused a message.
    Backpressure {
        /// Stage name.
        stage: String,
        /// Stage position in the chain.
        stage_index: usize,
        /// Buffer capacity.
        capacity: usize,
        /// Messages buffered at the time.
        buffered: usize,
        /// `buffered / capacity`.
        utilization: f64,
        /// Total messages this stage has dropped.
        dropped: u64,
    },
    /// A processor failed on one message.
    StageError {
        /// Stage name.
        stage: String,
        /// Error text.
        error: String,
    },
    /// The pipeline stopped with messages still buffered.
    Drained {
        /// Messages discarded.
        discarded: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        assert_eq!(Priority::default(), Priority::Medium);
        assert_eq!(DropPolicy::default(), DropPolicy::Oldest);
    }

    #[test]
    fn drop_policy_parse() {
        assert_eq!(DropPolicy::parse("REJECT"), Some(DropPolicy::Reject));
        assert_eq!(DropPolicy::parse("newest"), Some(DropPolicy::Newest));
        assert_eq!(DropPolicy::parse("latest"), None);
    }

    #[test]
    fn priority_orders_low_to_high() {
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
    }
}
