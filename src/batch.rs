//! Batch assembly and delivery
//!
//! The single consumer repeatedly drains the queue under a size-or-time
//! policy, packages the entries into a [`Batch`], hands it to the
//! external [`PublishingHarness`] and, after acknowledgment, asks the
//! harness to commit the maximum source position contained. Batches are
//! never split or reordered; a batch always reflects pure FIFO order
//! from the queue.

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::event::{ChangeEvent, Operation, SourcePosition};
use crate::queue::{ChangeEventQueue, QueueEntry};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// An ordered sequence of change events delivered as one unit.
#[derive(Debug)]
pub struct Batch {
    /// Events in queue (FIFO) order
    pub events: Vec<ChangeEvent>,
    /// Time the assembler started collecting this batch
    pub opened_at: Instant,
    /// Time the batch was handed out
    pub assembled_at: Instant,
    /// Monotonic batch number
    pub sequence: u64,
}

impl Batch {
    /// Number of events in the batch.
    #[inline]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Check if the batch is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// The maximum source position per partition. The harness commits
    /// these only after successful delivery.
    pub fn max_positions(&self) -> HashMap<u32, SourcePosition> {
        let mut max: HashMap<u32, SourcePosition> = HashMap::new();
        for event in &self.events {
            let pos = event.source_position;
            max.entry(pos.partition)
                .and_modify(|p| {
                    if pos > *p {
                        *p = pos;
                    }
                })
                .or_insert(pos);
        }
        max
    }

    /// The globally maximum source position, for single-partition use.
    pub fn max_position(&self) -> Option<SourcePosition> {
        self.events.iter().map(|e| e.source_position).max()
    }

    /// Count events by operation type.
    pub fn counts(&self) -> BatchCounts {
        let mut counts = BatchCounts::default();
        for event in &self.events {
            match event.operation {
                Operation::Read => counts.reads += 1,
                Operation::Create => counts.creates += 1,
                Operation::Update => counts.updates += 1,
                Operation::Delete => counts.deletes += 1,
            }
            if event.is_tombstone() {
                counts.tombstones += 1;
            }
        }
        counts
    }
}

/// Counts of batch events by operation type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchCounts {
    pub reads: usize,
    pub creates: usize,
    pub updates: usize,
    pub deletes: usize,
    /// Null-value markers, also counted under their operation
    pub tombstones: usize,
}

impl BatchCounts {
    pub fn total(&self) -> usize {
        self.reads + self.creates + self.updates + self.deletes
    }
}

/// External publishing harness: receives batches, acknowledges delivery
/// by returning, then is told which positions to commit.
#[async_trait]
pub trait PublishingHarness: Send + Sync {
    /// Deliver a batch. Returning `Ok` acknowledges delivery.
    async fn deliver(&self, batch: &Batch) -> Result<()>;

    /// Commit a source position after its batch was acknowledged.
    async fn commit(&self, position: SourcePosition) -> Result<()>;
}

/// Drains the queue into bounded batches for the publishing harness.
pub struct BatchAssembler {
    queue: Arc<ChangeEventQueue>,
    max_batch_size: usize,
    poll_interval: Duration,
    sequence: u64,
    exhausted: bool,
}

impl BatchAssembler {
    pub fn new(queue: Arc<ChangeEventQueue>, config: &PipelineConfig) -> Self {
        Self {
            queue,
            max_batch_size: config.max_batch_size,
            poll_interval: config.poll_interval,
            sequence: 0,
            exhausted: false,
        }
    }

    /// Drain once.
    ///
    /// Returns `Ok(None)` when the poll interval elapsed with no entries
    /// — the caller's suspension point. Returns
    /// [`PipelineError::QueueClosed`] once the queue is shut down and
    /// fully drained.
    pub async fn poll(&mut self) -> Result<Option<Batch>> {
        if self.exhausted {
            return Err(PipelineError::QueueClosed);
        }
        let opened_at = Instant::now();
        let entries = self
            .queue
            .drain(self.max_batch_size, self.poll_interval)
            .await?;
        if entries.is_empty() {
            return Ok(None);
        }

        let mut events = Vec::with_capacity(entries.len());
        for entry in entries {
            match entry {
                QueueEntry::Event { event, .. } => events.push(event),
                QueueEntry::Shutdown => {
                    self.exhausted = true;
                }
            }
        }
        if events.is_empty() {
            // Only the shutdown marker remained.
            return Err(PipelineError::QueueClosed);
        }

        self.sequence += 1;
        Ok(Some(Batch {
            events,
            opened_at,
            assembled_at: Instant::now(),
            sequence: self.sequence,
        }))
    }

    /// Poll once and, if a batch was assembled, deliver it and commit the
    /// maximum position of every partition it touched.
    ///
    /// Returns whether a batch was delivered.
    pub async fn deliver_once(&mut self, harness: &dyn PublishingHarness) -> Result<bool> {
        match self.poll().await? {
            None => Ok(false),
            Some(batch) => {
                debug!(
                    sequence = batch.sequence,
                    events = batch.len(),
                    "delivering batch"
                );
                harness.deliver(&batch).await?;
                for (_, position) in batch.max_positions() {
                    harness.commit(position).await?;
                }
                Ok(true)
            }
        }
    }

    /// Run the poll/deliver loop until the queue is exhausted.
    pub async fn run(&mut self, harness: Arc<dyn PublishingHarness>) -> Result<()> {
        loop {
            match self.deliver_once(harness.as_ref()).await {
                Ok(_) => continue,
                Err(PipelineError::QueueClosed) => {
                    info!("queue exhausted, batch assembler stopping");
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
        }
    }
}
