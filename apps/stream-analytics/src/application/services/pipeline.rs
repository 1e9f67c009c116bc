//! Pipeline Runtime
//!
//! Drives a chain of stages built from a `PipelineTemplate`.
//!
//! # Design
//!
//! - Each stage owns one `BoundedBuffer`. `push` only touches the first
//!   stage's buffer and never blocks on processing.
//! - One worker task per pipeline owns every processor and always drains
//!   the most downstream non-empty stage first, so a message leaves the
//!   chain before the next one enters it. Order within the chain is FIFO.
//! - A processor error or panic drops that one message, counts it and
//!   publishes `PipelineEvent::StageError`. The worker keeps going.
//! - `stop` flips the state, cancels the worker and discards whatever is
//!   still buffered. It never waits for a processor to finish.
//! - A pipeline pushed to while idle and without stages gets a passthrough
//!   `input` stage, so the message waits for `start` like any other.
//!
//! # Lifecycle
//!
//! ```text
//! Idle ──start──► Running ──stop──► Stopped
//!   └──────────────stop──────────────┘
//! ```

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::{Notify, broadcast};
use tokio_util::sync::CancellationToken;

use crate::domain::listener::{Listener, ListenerId, ListenerRegistry};
use crate::infrastructure::metrics;
use crate::domain::market_data::{DataType, MarketDataMessage};
use crate::domain::pipeline::{
    Admission, BoundedBuffer, CustomProcessor, DropPolicy, PipelineEvent, PipelineTemplate,
    Priority, Stage, StageDescriptor, StageError, StageKind,
};

/// Steps the worker runs before yielding to the scheduler.
const YIELD_EVERY: usize = 64;

/// Capacity of the pipeline event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Name of the passthrough stage added to a stage-less idle pipeline.
const INPUT_STAGE: &str = "input";

/// Buffer capacity of the passthrough input stage.
const INPUT_CAPACITY: usize = 1_000;

// =============================================================================
// Errors and Outcomes
// =============================================================================

/// Errors from pipeline lifecycle operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    /// Stages can only be added before `start`.
    #[error("pipeline already started")]
    AlreadyStarted,

    /// A stopped pipeline cannot be restarted.
    #[error("pipeline stopped")]
    Stopped,

    /// `start` was called outside a Tokio runtime.
    #[error("no tokio runtime available")]
    NoRuntime,
}

/// Result of pushing a message into a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Buffered.
    Accepted,
    /// Buffered after evicting the oldest buffered message.
    EvictedOldest,
    /// Discarded under the `NEWEST` policy.
    DroppedNewest,
    /// Discarded under the `REJECT` policy.
    Rejected,
    /// The pipeline is stopped.
    Closed,
}

impl From<Admission> for PushOutcome {
    fn from(admission: Admission) -> Self {
        match admission {
            Admission::Accepted => Self::Accepted,
            Admission::EvictedOldest => Self::EvictedOldest,
            Admission::DroppedIncoming => Self::DroppedNewest,
            Admission::Rejected => Self::Rejected,
        }
    }
}

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum PipelineState {
    /// Built, accepting stages and buffering pushes.
    Idle = 0,
    /// Worker running.
    Running = 1,
    /// Terminal.
    Stopped = 2,
}

impl PipelineState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Running,
            _ => Self::Stopped,
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Counters of one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageStats {
    /// Stage name.
    pub name: String,
    /// Buffer capacity.
    pub capacity: usize,
    /// Overflow policy.
    pub policy: DropPolicy,
    /// Messages currently buffered.
    pub buffered: usize,
    /// Messages taken out of the buffer and run through the processor.
    pub processed: u64,
    /// Messages the processor dropped (filter, dedup, throttle).
    pub filtered: u64,
    /// Messages lost to buffer overflow.
    pub dropped: u64,
    /// Messages that failed in the processor.
    pub errors: u64,
}

/// Counters of a whole pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    /// Lifecycle state.
    pub state: PipelineState,
    /// Per-stage counters in chain order.
    pub stages: Vec<StageStats>,
    /// Messages delivered to listeners.
    pub emitted: u64,
}

impl PipelineStats {
    /// Total overflow drops across stages.
    #[must_use]
    pub fn total_dropped(&self) -> u64 {
        self.stages.iter().map(|s| s.dropped).sum()
    }

    /// Total processor drops across stages.
    #[must_use]
    pub fn total_filtered(&self) -> u64 {
        self.stages.iter().map(|s| s.filtered).sum()
    }

    /// Messages buffered across stages.
    #[must_use]
    pub fn total_buffered(&self) -> usize {
        self.stages.iter().map(|s| s.buffered).sum()
    }
}

// =============================================================================
// Internals
// =============================================================================

#[derive(Debug)]
struct Queued {
    message: MarketDataMessage,
    priority: Priority,
}

#[derive(Debug)]
struct StageSlot {
    name: String,
    buffer: Mutex<BoundedBuffer<Queued>>,
    processed: AtomicU64,
    filtered: AtomicU64,
    dropped: AtomicU64,
    errors: AtomicU64,
}

impl StageSlot {
    fn new(descriptor: &StageDescriptor) -> Self {
        Self {
            name: descriptor.name().to_string(),
            buffer: Mutex::new(BoundedBuffer::new(descriptor.capacity, descriptor.policy)),
            processed: AtomicU64::new(0),
            filtered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    fn stats(&self) -> StageStats {
        let buffer = self.buffer.lock();
        StageStats {
            name: self.name.clone(),
            capacity: buffer.capacity(),
            policy: buffer.policy(),
            buffered: buffer.len(),
            processed: self.processed.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

struct PipelineInner {
    name: String,
    data_type: Option<DataType>,
    state: AtomicU8,
    stages: RwLock<Vec<Arc<StageSlot>>>,
    notify: Notify,
    cancel: CancellationToken,
    listeners: Arc<ListenerRegistry<MarketDataMessage>>,
    events: broadcast::Sender<PipelineEvent>,
    emitted: AtomicU64,
}

impl PipelineInner {
    fn state(&self) -> PipelineState {
        PipelineState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn publish(&self, event: PipelineEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    /// Enqueue into stage `index`, applying its drop policy.
    fn offer(&self, index: usize, slot: &StageSlot, queued: Queued) -> Admission {
        let priority = queued.priority;
        let (admission, buffered, capacity, policy) = {
            let mut buffer = slot.buffer.lock();
            let admission = buffer.offer(queued);
            (admission, buffer.len(), buffer.capacity(), buffer.policy())
        };

        if admission.lost_item() {
            let dropped = slot.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if priority == Priority::High {
                tracing::warn!(
                    pipeline = %self.name,
                    stage = %slot.name,
                    ?admission,
                    dropped,
                    "High priority message lost to overflow"
                );
            } else {
                tracing::trace!(
                    pipeline = %self.name,
                    stage = %slot.name,
                    ?admission,
                    dropped,
                    "Stage buffer overflow"
                );
            }

            if policy == DropPolicy::Reject {
                tracing::warn!(
                    pipeline = %self.name,
                    stage = %slot.name,
                    capacity,
                    dropped,
                    "Backpressure"
                );
                self.publish(PipelineEvent::Backpressure {
                    stage: slot.name.clone(),
                    stage_index: index,
                    capacity,
                    buffered,
                    utilization: buffered as f64 / capacity as f64,
                    dropped,
                });
            }
        }

        admission
    }

    /// Deliver to listeners. Returns false unless running.
    fn emit(&self, message: &MarketDataMessage) -> bool {
        if self.state() != PipelineState::Running {
            return false;
        }
        self.emitted.fetch_add(1, Ordering::Relaxed);
        if let Some(data_type) = self.data_type {
            metrics::record_message_emitted(data_type);
        }
        self.listeners.emit(message);
        true
    }

    /// Process one message from the most downstream non-empty stage.
    ///
    /// Returns false when every buffer is empty.
    fn step(&self, stages: &[Arc<StageSlot>], processors: &mut [Box<dyn Stage>]) -> bool {
        let Some((index, queued)) = stages
            .iter()
            .enumerate()
            .rev()
            .find_map(|(index, slot)| slot.buffer.lock().pop().map(|q| (index, q)))
        else {
            return false;
        };

        let slot = &stages[index];
        slot.processed.fetch_add(1, Ordering::Relaxed);

        let Queued { message, priority } = queued;
        let processor = &mut processors[index];
        let outcome = catch_unwind(AssertUnwindSafe(|| processor.process(message)))
            .unwrap_or_else(|panic| Err(StageError::Panicked(panic_message(panic.as_ref()))));

        match outcome {
            Ok(Some(message)) => match stages.get(index + 1) {
                Some(next) => {
                    self.offer(index + 1, next, Queued { message, priority });
                }
                None => {
                    self.emit(&message);
                }
            },
            Ok(None) => {
                slot.filtered.fetch_add(1, Ordering::Relaxed);
            }
            Err(error) => {
                slot.errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    pipeline = %self.name,
                    stage = %slot.name,
                    error = %error,
                    "Stage processing error"
                );
                self.publish(PipelineEvent::StageError {
                    stage: slot.name.clone(),
                    error: error.to_string(),
                });
            }
        }

        true
    }

    fn discard_buffered(&self) -> usize {
        self.stages
            .read()
            .iter()
            .map(|slot| slot.buffer.lock().clear())
            .sum()
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

async fn run_worker(inner: Arc<PipelineInner>, mut processors: Vec<Box<dyn Stage>>) {
    let stages: Vec<Arc<StageSlot>> = inner.stages.read().clone();
    tracing::debug!(pipeline = %inner.name, stages = stages.len(), "Pipeline worker started");

    loop {
        let mut steps = 0_usize;
        while !inner.cancel.is_cancelled() && inner.step(&stages, &mut processors) {
            steps += 1;
            if steps % YIELD_EVERY == 0 {
                tokio::task::yield_now().await;
            }
        }

        tokio::select! {
            () = inner.cancel.cancelled() => break,
            () = inner.notify.notified() => {}
        }
    }

    tracing::debug!(pipeline = %inner.name, "Pipeline worker stopped");
}

// =============================================================================
// Pipeline
// =============================================================================

/// A running chain of stages for one (subscription, data type) pair.
pub struct Pipeline {
    inner: Arc<PipelineInner>,
    processors: Mutex<Vec<Box<dyn Stage>>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Create an idle pipeline with no stages.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_listeners(name, Arc::new(ListenerRegistry::new()))
    }

    /// Create an idle pipeline delivering to an existing listener registry.
    ///
    /// A rebuilt pipeline adopts its predecessor's registry this way, so
    /// attached listeners survive reconfiguration.
    #[must_use]
    pub fn with_listeners(
        name: impl Into<String>,
        listeners: Arc<ListenerRegistry<MarketDataMessage>>,
    ) -> Self {
        Self::build(name.into(), None, listeners)
    }

    fn build(
        name: String,
        data_type: Option<DataType>,
        listeners: Arc<ListenerRegistry<MarketDataMessage>>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(PipelineInner {
                name,
                data_type,
                state: AtomicU8::new(PipelineState::Idle as u8),
                stages: RwLock::new(Vec::new()),
                notify: Notify::new(),
                cancel: CancellationToken::new(),
                listeners,
                events,
                emitted: AtomicU64::new(0),
            }),
            processors: Mutex::new(Vec::new()),
        }
    }

    /// Create an idle pipeline for one data type with every stage of a
    /// template. Emitted messages are counted per data type.
    #[must_use]
    pub fn from_template(
        name: impl Into<String>,
        data_type: DataType,
        template: &PipelineTemplate,
        listeners: Arc<ListenerRegistry<MarketDataMessage>>,
    ) -> Self {
        let pipeline = Self::build(name.into(), Some(data_type), listeners);
        {
            let mut processors = pipeline.processors.lock();
            for descriptor in template.stages() {
                pipeline.append(&mut processors, descriptor);
            }
        }
        pipeline
    }

    /// Add a slot and its processor. Callers hold the processor lock, which
    /// keeps both lists aligned and orders appends against `start`.
    fn append(
        &self,
        processors: &mut Vec<Box<dyn Stage>>,
        descriptor: &StageDescriptor,
    ) -> Arc<StageSlot> {
        let slot = Arc::new(StageSlot::new(descriptor));
        self.inner.stages.write().push(Arc::clone(&slot));
        processors.push(descriptor.build());
        slot
    }

    /// Append a stage.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyStarted` or `Stopped` unless the pipeline is idle.
    pub fn add_stage(&self, descriptor: &StageDescriptor) -> Result<(), PipelineError> {
        let mut processors = self.processors.lock();
        match self.state() {
            PipelineState::Idle => {
                self.append(&mut processors, descriptor);
                Ok(())
            }
            PipelineState::Running => Err(PipelineError::AlreadyStarted),
            PipelineState::Stopped => Err(PipelineError::Stopped),
        }
    }

    /// First stage of an idle pipeline, adding the passthrough input stage
    /// when there is none. `None` once the pipeline has left `Idle`.
    fn idle_input_stage(&self) -> Option<Arc<StageSlot>> {
        let mut processors = self.processors.lock();
        if self.state() != PipelineState::Idle {
            return None;
        }
        if let Some(first) = self.inner.stages.read().first() {
            return Some(Arc::clone(first));
        }

        let descriptor = StageDescriptor::new(
            StageKind::Custom(CustomProcessor::map(INPUT_STAGE, |message| message)),
            INPUT_CAPACITY,
            DropPolicy::Oldest,
        );
        Some(self.append(&mut processors, &descriptor))
    }

    /// Spawn the worker. Calling `start` on a running pipeline is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `Stopped` after `stop`, `NoRuntime` outside Tokio.
    pub fn start(&self) -> Result<(), PipelineError> {
        let handle = Handle::try_current().map_err(|_| PipelineError::NoRuntime)?;

        match self.inner.state.compare_exchange(
            PipelineState::Idle as u8,
            PipelineState::Running as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(current) if PipelineState::from_u8(current) == PipelineState::Running => {
                return Ok(());
            }
            Err(_) => return Err(PipelineError::Stopped),
        }

        let processors = std::mem::take(&mut *self.processors.lock());
        handle.spawn(run_worker(Arc::clone(&self.inner), processors));
        // Wake the worker for anything buffered while idle.
        self.inner.notify.notify_one();

        tracing::debug!(pipeline = %self.inner.name, "Pipeline started");
        Ok(())
    }

    /// Stop the pipeline. Idempotent.
    ///
    /// Buffered messages are discarded and reported via
    /// `PipelineEvent::Drained`. No `data` is emitted afterwards.
    pub fn stop(&self) {
        let previous = self
            .inner
            .state
            .swap(PipelineState::Stopped as u8, Ordering::AcqRel);
        if PipelineState::from_u8(previous) == PipelineState::Stopped {
            return;
        }

        self.inner.cancel.cancel();
        self.processors.lock().clear();

        let discarded = self.inner.discard_buffered();
        if discarded > 0 {
            tracing::warn!(
                pipeline = %self.inner.name,
                discarded,
                "Pipeline stopped with buffered messages"
            );
        } else {
            tracing::debug!(pipeline = %self.inner.name, "Pipeline stopped");
        }
        self.inner.publish(PipelineEvent::Drained { discarded });
    }

    /// Push a message into the first stage.
    pub fn push(&self, message: MarketDataMessage, priority: Priority) -> PushOutcome {
        if self.state() == PipelineState::Stopped {
            return PushOutcome::Closed;
        }

        let first = self.inner.stages.read().first().cloned();
        let Some(first) = first.or_else(|| self.idle_input_stage()) else {
            // Running without stages: deliver directly.
            return if self.inner.emit(&message) {
                PushOutcome::Accepted
            } else {
                PushOutcome::Closed
            };
        };

        let admission = self.inner.offer(0, &first, Queued { message, priority });
        if admission.is_admitted() {
            self.inner.notify.notify_one();
        }
        admission.into()
    }

    /// Empty every stage buffer, returning how many messages were dropped.
    pub fn clear(&self) -> usize {
        self.inner.discard_buffered()
    }

    /// Attach a data listener.
    pub fn add_listener(&self, listener: Listener<MarketDataMessage>) -> ListenerId {
        self.inner.listeners.add(listener)
    }

    /// Detach a data listener.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    /// Listener registry shared with rebuilt pipelines.
    #[must_use]
    pub fn listeners(&self) -> Arc<ListenerRegistry<MarketDataMessage>> {
        Arc::clone(&self.inner.listeners)
    }

    /// Subscribe to backpressure, stage error and drain events.
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<PipelineEvent> {
        self.inner.events.subscribe()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> PipelineState {
        self.inner.state()
    }

    /// Pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.inner.stages.read().len()
    }

    /// Snapshot of counters.
    #[must_use]
    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            state: self.state(),
            stages: self.inner.stages.read().iter().map(|s| s.stats()).collect(),
            emitted: self.inner.emitted.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use rust_decimal_macros::dec;

    use super::*;
    use crate::domain::pipeline::{CustomProcessor, StageKind};

    fn trade(symbol: &str, ts: i64) -> MarketDataMessage {
        MarketDataMessage::trade(symbol, ts, dec!(100), 1)
    }

    fn passthrough(name: &str, capacity: usize, policy: DropPolicy) -> StageDescriptor {
        StageDescriptor::new(
            StageKind::Custom(CustomProcessor::map(name, |m| m)),
            capacity,
            policy,
        )
    }

    fn collector(pipeline: &Pipeline) -> Arc<StdMutex<Vec<MarketDataMessage>>> {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        pipeline.add_listener(Arc::new(move |m: &MarketDataMessage| {
            sink.lock().unwrap().push(m.clone());
        }));
        seen
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn delivers_in_push_order() {
        let pipeline = Pipeline::new("test");
        pipeline.add_stage(&passthrough("a", 100, DropPolicy::Oldest)).unwrap();
        pipeline.add_stage(&passthrough("b", 100, DropPolicy::Oldest)).unwrap();
        let seen = collector(&pipeline);
        pipeline.start().unwrap();

        for ts in 0..50 {
            assert_eq!(pipeline.push(trade("AAPL", ts), Priority::Medium), PushOutcome::Accepted);
        }
        settle().await;

        let timestamps: Vec<i64> = seen.lock().unwrap().iter().map(|m| m.timestamp).collect();
        assert_eq!(timestamps, (0..50).collect::<Vec<_>>());
        assert_eq!(pipeline.stats().emitted, 50);
    }

    #[tokio::test]
    async fn messages_pushed_while_idle_flow_after_start() {
        let pipeline = Pipeline::new("test");
        pipeline.add_stage(&passthrough("a", 10, DropPolicy::Oldest)).unwrap();
        let seen = collector(&pipeline);

        pipeline.push(trade("AAPL", 1), Priority::Medium);
        settle().await;
        assert!(seen.lock().unwrap().is_empty());

        pipeline.start().unwrap();
        settle().await;
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn oldest_policy_evicts_head() {
        let pipeline = Pipeline::new("test");
        pipeline.add_stage(&passthrough("a", 2, DropPolicy::Oldest)).unwrap();
        let seen = collector(&pipeline);

        pipeline.push(trade("AAPL", 1), Priority::Medium);
        pipeline.push(trade("AAPL", 2), Priority::Medium);
        assert_eq!(
            pipeline.push(trade("AAPL", 3), Priority::Medium),
            PushOutcome::EvictedOldest
        );
        assert_eq!(pipeline.stats().stages[0].buffered, 2);

        pipeline.start().unwrap();
        settle().await;

        let timestamps: Vec<i64> = seen.lock().unwrap().iter().map(|m| m.timestamp).collect();
        assert_eq!(timestamps, vec![2, 3]);
        assert_eq!(pipeline.stats().stages[0].dropped, 1);
    }

    #[tokio::test]
    async fn reject_policy_emits_backpressure() {
        let pipeline = Pipeline::new("test");
        pipeline.add_stage(&passthrough("gate", 1, DropPolicy::Reject)).unwrap();
        let mut events = pipeline.subscribe_events();

        assert_eq!(pipeline.push(trade("AAPL", 1), Priority::Medium), PushOutcome::Accepted);
        assert_eq!(pipeline.push(trade("AAPL", 2), Priority::Medium), PushOutcome::Rejected);
        assert_eq!(pipeline.stats().stages[0].buffered, 1);

        match events.try_recv().unwrap() {
            PipelineEvent::Backpressure {
                stage,
                stage_index,
                capacity,
                dropped,
                ..
            } => {
                assert_eq!(stage, "gate");
                assert_eq!(stage_index, 0);
                assert_eq!(capacity, 1);
                assert_eq!(dropped, 1);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn newest_policy_is_silent() {
        let pipeline = Pipeline::new("test");
        pipeline.add_stage(&passthrough("a", 1, DropPolicy::Newest)).unwrap();
        let mut events = pipeline.subscribe_events();

        pipeline.push(trade("AAPL", 1), Priority::Medium);
        assert_eq!(
            pipeline.push(trade("AAPL", 2), Priority::Low),
            PushOutcome::DroppedNewest
        );
        assert!(events.try_recv().is_err());
        assert_eq!(
            pipeline.push(trade("AAPL", 3), Priority::High),
            PushOutcome::DroppedNewest
        );
    }

    #[tokio::test]
    async fn high_priority_never_displaces_rejecting_buffer() {
        let pipeline = Pipeline::new("test");
        pipeline.add_stage(&passthrough("gate", 2, DropPolicy::Reject)).unwrap();
        let seen = collector(&pipeline);
        let mut events = pipeline.subscribe_events();

        pipeline.push(trade("AAPL", 1), Priority::Medium);
        pipeline.push(trade("AAPL", 2), Priority::Medium);
        assert_eq!(
            pipeline.push(trade("AAPL", 3), Priority::High),
            PushOutcome::Rejected
        );
        assert!(matches!(
            events.try_recv().unwrap(),
            PipelineEvent::Backpressure { dropped: 1, .. }
        ));

        pipeline.start().unwrap();
        settle().await;

        let timestamps: Vec<i64> = seen.lock().unwrap().iter().map(|m| m.timestamp).collect();
        assert_eq!(timestamps, vec![1, 2]);
    }

    #[tokio::test]
    async fn stageless_pipeline_buffers_until_start() {
        let pipeline = Pipeline::new("bare");
        let seen = collector(&pipeline);

        assert_eq!(pipeline.push(trade("AAPL", 1), Priority::Medium), PushOutcome::Accepted);
        assert_eq!(pipeline.stage_count(), 1);
        assert_eq!(pipeline.stats().stages[0].name, INPUT_STAGE);
        settle().await;
        assert!(seen.lock().unwrap().is_empty());

        pipeline.start().unwrap();
        settle().await;
        assert_eq!(seen.lock().unwrap().len(), 1);

        assert_eq!(pipeline.push(trade("AAPL", 2), Priority::Medium), PushOutcome::Accepted);
        settle().await;
        let timestamps: Vec<i64> = seen.lock().unwrap().iter().map(|m| m.timestamp).collect();
        assert_eq!(timestamps, vec![1, 2]);
    }

    #[tokio::test]
    async fn stageless_running_pipeline_delivers_directly() {
        let pipeline = Pipeline::new("bare");
        let seen = collector(&pipeline);
        pipeline.start().unwrap();

        assert_eq!(pipeline.push(trade("AAPL", 1), Priority::Medium), PushOutcome::Accepted);
        assert_eq!(pipeline.stage_count(), 0);
        assert_eq!(seen.lock().unwrap().len(), 1);

        pipeline.stop();
        assert_eq!(pipeline.push(trade("AAPL", 2), Priority::Medium), PushOutcome::Closed);
    }

    #[tokio::test]
    async fn failing_message_does_not_halt_pipeline() {
        let pipeline = Pipeline::new("test");
        pipeline
            .add_stage(&StageDescriptor::new(
                StageKind::Custom(CustomProcessor::new("picky", |m: MarketDataMessage| {
                    if m.timestamp == 2 {
                        Err(StageError::processor("bad tick"))
                    } else {
                        Ok(Some(m))
                    }
                })),
                10,
                DropPolicy::Oldest,
            ))
            .unwrap();
        let seen = collector(&pipeline);
        let mut events = pipeline.subscribe_events();
        pipeline.start().unwrap();

        for ts in 1..=3 {
            pipeline.push(trade("AAPL", ts), Priority::Medium);
        }
        settle().await;

        let timestamps: Vec<i64> = seen.lock().unwrap().iter().map(|m| m.timestamp).collect();
        assert_eq!(timestamps, vec![1, 3]);
        assert_eq!(pipeline.stats().stages[0].errors, 1);
        assert!(matches!(
            events.try_recv().unwrap(),
            PipelineEvent::StageError { ref stage, .. } if stage == "picky"
        ));
    }

    #[tokio::test]
    async fn panicking_processor_is_contained() {
        let pipeline = Pipeline::new("test");
        pipeline
            .add_stage(&StageDescriptor::new(
                StageKind::Custom(CustomProcessor::new("boom", |m: MarketDataMessage| {
                    assert!(m.timestamp != 1, "boom");
                    Ok(Some(m))
                })),
                10,
                DropPolicy::Oldest,
            ))
            .unwrap();
        let seen = collector(&pipeline);
        pipeline.start().unwrap();

        pipeline.push(trade("AAPL", 1), Priority::Medium);
        pipeline.push(trade("AAPL", 2), Priority::Medium);
        settle().await;

        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(pipeline.stats().stages[0].errors, 1);
    }

    #[tokio::test]
    async fn lifecycle_rules() {
        let pipeline = Pipeline::new("test");
        pipeline.add_stage(&passthrough("a", 10, DropPolicy::Oldest)).unwrap();
        pipeline.start().unwrap();
        pipeline.start().unwrap();

        assert_eq!(
            pipeline.add_stage(&passthrough("late", 10, DropPolicy::Oldest)),
            Err(PipelineError::AlreadyStarted)
        );

        pipeline.stop();
        pipeline.stop();
        assert_eq!(pipeline.state(), PipelineState::Stopped);
        assert_eq!(pipeline.start(), Err(PipelineError::Stopped));
        assert_eq!(pipeline.push(trade("AAPL", 1), Priority::High), PushOutcome::Closed);
    }

    #[test]
    fn start_outside_runtime_fails() {
        let pipeline = Pipeline::new("test");
        assert_eq!(pipeline.start(), Err(PipelineError::NoRuntime));
        assert_eq!(pipeline.state(), PipelineState::Idle);
    }

    #[tokio::test]
    async fn stop_reports_discarded_messages() {
        let pipeline = Pipeline::new("test");
        pipeline.add_stage(&passthrough("a", 10, DropPolicy::Oldest)).unwrap();
        let seen = collector(&pipeline);
        let mut events = pipeline.subscribe_events();

        pipeline.push(trade("AAPL", 1), Priority::Medium);
        pipeline.push(trade("AAPL", 2), Priority::Medium);
        pipeline.stop();

        assert_eq!(events.try_recv().unwrap(), PipelineEvent::Drained { discarded: 2 });
        assert_eq!(pipeline.stats().total_buffered(), 0);
        settle().await;
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stop_does_not_wait_for_slow_processor() {
        let pipeline = Pipeline::new("test");
        pipeline
            .add_stage(&StageDescriptor::new(
                StageKind::Custom(CustomProcessor::new("slow", |m| {
                    std::thread::sleep(Duration::from_millis(200));
                    Ok(Some(m))
                })),
                10,
                DropPolicy::Oldest,
            ))
            .unwrap();
        pipeline.start().unwrap();
        pipeline.push(trade("AAPL", 1), Priority::Medium);

        let started = std::time::Instant::now();
        pipeline.stop();
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn clear_empties_buffers() {
        let pipeline = Pipeline::new("test");
        pipeline.add_stage(&passthrough("a", 10, DropPolicy::Oldest)).unwrap();
        for ts in 0..5 {
            pipeline.push(trade("AAPL", ts), Priority::Medium);
        }
        assert_eq!(pipeline.clear(), 5);
        assert_eq!(pipeline.stats().total_buffered(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_scenario_drops_excess() {
        let options = crate::domain::subscription::SubscriptionOptions::new(
            [crate::domain::market_data::DataType::Trades],
            ["AAPL"],
        )
        .with_throttle_rate(2);
        let template = PipelineTemplate::for_subscription(&options, &[], 100, DropPolicy::Oldest);
        let pipeline = Pipeline::from_template(
            "throttled",
            crate::domain::market_data::DataType::Trades,
            &template,
            Arc::new(ListenerRegistry::new()),
        );
        let seen = collector(&pipeline);
        pipeline.start().unwrap();

        for ts in 0..10 {
            pipeline.push(trade("AAPL", ts), Priority::Medium);
            settle().await;
            tokio::time::advance(Duration::from_millis(50)).await;
        }
        settle().await;

        assert_eq!(seen.lock().unwrap().len(), 2);
        let stats = pipeline.stats();
        let throttler = stats.stages.iter().find(|s| s.name == "throttler").unwrap();
        assert_eq!(throttler.filtered, 8);
    }

    #[tokio::test]
    async fn shared_listeners_survive_rebuild() {
        let listeners = Arc::new(ListenerRegistry::new());
        let first = Pipeline::with_listeners("v1", Arc::clone(&listeners));
        let seen = collector(&first);
        first.stop();

        let second = Pipeline::with_listeners("v2", first.listeners());
        second.add_stage(&passthrough("a", 10, DropPolicy::Oldest)).unwrap();
        second.start().unwrap();
        second.push(trade("AAPL", 1), Priority::Medium);
        settle().await;

        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
