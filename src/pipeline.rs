//! Event processing pipeline
//!
//! Wires the per-event stages into one processor: operation filter,
//! predicate filter, tombstone expansion, field conversion, then the
//! bounded queue. Stage order is fixed; the predicate never sees events
//! dropped by the operation filter, synthesized tombstone markers are
//! never re-filtered, and converters run on everything that will be
//! enqueued.
//!
//! Per-event evaluation and conversion failures are governed by the
//! configured [`FailureHandlingMode`]; configuration and lifecycle
//! errors always propagate.

use crate::config::{FailureHandlingMode, PipelineConfig};
use crate::converters::{ConverterFactory, ConverterRegistry};
use crate::error::{PipelineError, Result};
use crate::event::{ChangeEvent, SourcePosition};
use crate::operation_filter::OperationFilter;
use crate::predicate::{EngineRegistry, EventFilter};
use crate::queue::ChangeEventQueue;
use crate::tombstone::TombstonePolicy;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{trace, warn};

/// Latest observed source position per partition.
///
/// Every event's position is recorded before any filtering, so offset
/// tracking advances even when every event in a stretch is dropped.
#[derive(Debug, Default)]
pub struct PositionTracker {
    positions: RwLock<HashMap<u32, SourcePosition>>,
}

impl PositionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a position if it advances its partition.
    pub fn observe(&self, position: SourcePosition) {
        let mut positions = self.positions.write().expect("position lock poisoned");
        positions
            .entry(position.partition)
            .and_modify(|p| {
                if position > *p {
                    *p = position;
                }
            })
            .or_insert(position);
    }

    /// The latest observed position for a partition.
    pub fn latest(&self, partition: u32) -> Option<SourcePosition> {
        self.positions
            .read()
            .expect("position lock poisoned")
            .get(&partition)
            .copied()
    }

    /// Latest observed positions for all partitions.
    pub fn all(&self) -> HashMap<u32, SourcePosition> {
        self.positions
            .read()
            .expect("position lock poisoned")
            .clone()
    }
}

/// Counters for processor activity.
#[derive(Debug, Default)]
pub struct ProcessorStats {
    events_seen: AtomicU64,
    skipped_operations: AtomicU64,
    filtered_out: AtomicU64,
    dropped_on_error: AtomicU64,
    enqueued: AtomicU64,
}

impl ProcessorStats {
    pub fn snapshot(&self) -> ProcessorStatsSnapshot {
        ProcessorStatsSnapshot {
            events_seen: self.events_seen.load(Ordering::Relaxed),
            skipped_operations: self.skipped_operations.load(Ordering::Relaxed),
            filtered_out: self.filtered_out.load(Ordering::Relaxed),
            dropped_on_error: self.dropped_on_error.load(Ordering::Relaxed),
            enqueued: self.enqueued.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`ProcessorStats`].
#[derive(Debug, Clone)]
pub struct ProcessorStatsSnapshot {
    /// Events offered to the processor
    pub events_seen: u64,
    /// Dropped by the operation filter
    pub skipped_operations: u64,
    /// Dropped by the predicate filter
    pub filtered_out: u64,
    /// Dropped under the warn/skip failure policy
    pub dropped_on_error: u64,
    /// Events (including tombstone markers) placed on the queue
    pub enqueued: u64,
}

/// Per-event processor feeding the bounded queue.
pub struct EventProcessor {
    operation_filter: OperationFilter,
    event_filter: Option<EventFilter>,
    tombstones: TombstonePolicy,
    converters: ConverterRegistry,
    failure_mode: FailureHandlingMode,
    queue: Arc<ChangeEventQueue>,
    positions: Arc<PositionTracker>,
    stats: ProcessorStats,
}

impl std::fmt::Debug for EventProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventProcessor").finish_non_exhaustive()
    }
}

impl EventProcessor {
    /// Build the processor from configuration, bootstrapping the
    /// expression engine and instantiating the declared converters. Any
    /// misconfiguration aborts startup.
    pub fn from_config(
        config: &PipelineConfig,
        engines: &EngineRegistry,
        factory: &ConverterFactory,
        queue: Arc<ChangeEventQueue>,
    ) -> Result<Self> {
        config.ensure_valid()?;
        let event_filter = config
            .filter
            .as_ref()
            .map(|f| EventFilter::from_config(f, engines))
            .transpose()?;
        Ok(Self {
            operation_filter: OperationFilter::new(config.skipped_operations.clone()),
            event_filter,
            tombstones: TombstonePolicy::from_config(config),
            converters: ConverterRegistry::from_config(&config.converters, factory)?,
            failure_mode: config.failure_handling_mode,
            queue,
            positions: Arc::new(PositionTracker::new()),
            stats: ProcessorStats::default(),
        })
    }

    /// The shared position tracker.
    pub fn positions(&self) -> Arc<PositionTracker> {
        Arc::clone(&self.positions)
    }

    /// The queue the processor feeds.
    pub fn queue(&self) -> Arc<ChangeEventQueue> {
        Arc::clone(&self.queue)
    }

    /// Process one source event through every stage and enqueue the
    /// survivors, waiting when the queue is full.
    ///
    /// Dropping an event (operation filter, predicate, warn/skip failure
    /// policy) is `Ok(())`; its position is still recorded. Only fatal
    /// errors are returned.
    pub async fn process(&self, event: ChangeEvent) -> Result<()> {
        self.stats.events_seen.fetch_add(1, Ordering::Relaxed);
        self.positions.observe(event.source_position);

        if self.operation_filter.should_skip(&event) {
            self.stats.skipped_operations.fetch_add(1, Ordering::Relaxed);
            trace!(position = %event.source_position, op = %event.operation, "operation skipped");
            return Ok(());
        }

        if let Some(filter) = &self.event_filter {
            match filter.retain(&event) {
                Ok(true) => {}
                Ok(false) => {
                    self.stats.filtered_out.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
                Err(err) => return self.handle_failure(err),
            }
        }

        for output in self.tombstones.expand(event) {
            let converted = match self.converters.apply(&output) {
                Ok(converted) => converted,
                Err(err) => {
                    // The delete may already be enqueued when its marker
                    // fails; each output is governed independently.
                    self.handle_failure(err)?;
                    continue;
                }
            };
            self.queue.enqueue(converted).await?;
            self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Apply the failure policy to a per-event error.
    fn handle_failure(&self, err: PipelineError) -> Result<()> {
        if !err.is_policy_governed() {
            return Err(err);
        }
        match self.failure_mode {
            FailureHandlingMode::Fail => Err(err),
            FailureHandlingMode::Warn => {
                self.stats.dropped_on_error.fetch_add(1, Ordering::Relaxed);
                match err.position() {
                    Some(position) => {
                        warn!(%position, cause = %err, "dropping event after processing failure")
                    }
                    None => warn!(cause = %err, "dropping event after processing failure"),
                }
                Ok(())
            }
            FailureHandlingMode::Skip => {
                self.stats.dropped_on_error.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        }
    }

    pub fn stats(&self) -> ProcessorStatsSnapshot {
        self.stats.snapshot()
    }
}
