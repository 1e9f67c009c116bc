//! Declarative pipeline templates.
//!
//! A template is an ordered list of stage descriptors. Pipelines are
//! built from templates and never mutated in place: reconfiguring a live
//! subscription means building a fresh pipeline from an updated template.

use std::time::Duration;

use super::stages::{CustomProcessor, DedupKey, Deduplicator, SymbolFilter, Throttler};
use super::{DropPolicy, Stage};
use crate::domain::market_data::Symbol;
use crate::domain::subscription::SubscriptionOptions;

/// Processor a stage runs.
#[derive(Debug, Clone)]
pub enum StageKind {
    /// Keep listed symbols only.
    SymbolFilter(Vec<Symbol>),
    /// Suppress duplicates within a window.
    Deduplicate {
        /// Suppression window.
        window: Duration,
        /// Duplicate key.
        key: DedupKey,
    },
    /// Cap per-symbol rate.
    Throttle {
        /// Messages per second per symbol.
        rate: u32,
    },
    /// Caller-supplied transform.
    Custom(CustomProcessor),
}

/// One stage of a template.
#[derive(Debug, Clone)]
pub struct StageDescriptor {
    /// Processor to run.
    pub kind: StageKind,
    /// Buffer capacity in front of the processor.
    pub capacity: usize,
    /// Buffer overflow policy.
    pub policy: DropPolicy,
}

impl StageDescriptor {
    /// Create a descriptor.
    #[must_use]
    pub const fn new(kind: StageKind, capacity: usize, policy: DropPolicy) -> Self {
        Self {
            kind,
            capacity,
            policy,
        }
    }

    /// Instantiate a fresh processor for this stage.
    #[must_use]
    pub fn build(&self) -> Box<dyn Stage> {
        match &self.kind {
            StageKind::SymbolFilter(symbols) => Box::new(SymbolFilter::new(symbols)),
            StageKind::Deduplicate { window, key } => {
                Box::new(Deduplicator::new(*window, key.clone()))
            }
            StageKind::Throttle { rate } => Box::new(Throttler::new(*rate)),
            StageKind::Custom(processor) => Box::new(processor.clone()),
        }
    }

    /// Stage name as reported in events and stats.
    #[must_use]
    pub fn name(&self) -> &str {
        match &self.kind {
            StageKind::SymbolFilter(_) => "symbol_filter",
            StageKind::Deduplicate { .. } => "deduplicator",
            StageKind::Throttle { .. } => "throttler",
            StageKind::Custom(processor) => processor.name(),
        }
    }
}

/// Ordered list of stage descriptors.
#[derive(Debug, Clone, Default)]
pub struct PipelineTemplate {
    stages: Vec<StageDescriptor>,
}

impl PipelineTemplate {
    /// Create an empty template.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Template for one data type of a subscription.
    ///
    /// Stage order: symbol filter, deduplicator (if a window is set),
    /// throttler (if a rate is set), then custom processors in order.
    #[must_use]
    pub fn for_subscription(
        options: &SubscriptionOptions,
        processors: &[CustomProcessor],
        default_capacity: usize,
        default_policy: DropPolicy,
    ) -> Self {
        let capacity = options.buffer_size.unwrap_or(default_capacity);
        let policy = options.drop_policy.unwrap_or(default_policy);

        let mut template = Self::new().stage(StageDescriptor::new(
            StageKind::SymbolFilter(options.symbols.clone()),
            capacity,
            policy,
        ));

        if let Some(window) = options.deduplication_window {
            template = template.stage(StageDescriptor::new(
                StageKind::Deduplicate {
                    window,
                    key: options.dedup_key.clone().unwrap_or_default(),
                },
                capacity,
                policy,
            ));
        }

        if let Some(rate) = options.throttle_rate {
            template = template.stage(StageDescriptor::new(
                StageKind::Throttle { rate },
                capacity,
                policy,
            ));
        }

        for processor in processors {
            template = template.stage(StageDescriptor::new(
                StageKind::Custom(processor.clone()),
                capacity,
                policy,
            ));
        }

        template
    }

    /// Append a stage.
    #[must_use]
    pub fn stage(mut self, descriptor: StageDescriptor) -> Self {
        self.stages.push(descriptor);
        self
    }

    /// Stage descriptors in order.
    #[must_use]
    pub fn stages(&self) -> &[StageDescriptor] {
        &self.stages
    }

    /// Number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether the template has no stages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}
