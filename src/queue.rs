//! Bounded change event queue
//!
//! Multi-producer, single-consumer FIFO buffer decoupling event production
//! from batch consumption.
//!
//! ## Backpressure
//!
//! `enqueue` suspends the calling producer while the queue is full; this
//! is the system's memory bound and propagates upstream, pausing the log
//! reader instead of growing memory. Multiple producers (parallel
//! snapshot workers) are supported; the queue interleaves but never
//! reorders — per-partition position order is the producers' contract.
//!
//! ## Shutdown
//!
//! `shutdown` is idempotent, wakes all blocked producers and the blocked
//! consumer promptly, and appends an in-band [`QueueEntry::Shutdown`]
//! sentinel. Already-queued entries remain drainable exactly once for
//! final delivery; once exhausted, `drain` reports
//! [`PipelineError::QueueClosed`].

use crate::error::{PipelineError, Result};
use crate::event::ChangeEvent;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};

/// An entry owned by the queue between enqueue and dequeue; ownership
/// transfers to the consumer on drain.
#[derive(Debug)]
pub enum QueueEntry {
    /// A change event with its enqueue timestamp for latency metrics.
    Event {
        event: ChangeEvent,
        enqueued_at: Instant,
    },
    /// Control marker appended by `shutdown`; marks end of stream.
    Shutdown,
}

impl QueueEntry {
    fn event(event: ChangeEvent) -> Self {
        Self::Event {
            event,
            enqueued_at: Instant::now(),
        }
    }

    /// The wrapped event, if this is not a control marker.
    pub fn as_event(&self) -> Option<&ChangeEvent> {
        match self {
            Self::Event { event, .. } => Some(event),
            Self::Shutdown => None,
        }
    }

    /// Consume the entry, yielding the event if present.
    pub fn into_event(self) -> Option<ChangeEvent> {
        match self {
            Self::Event { event, .. } => Some(event),
            Self::Shutdown => None,
        }
    }

    /// Time the entry spent in the queue so far.
    pub fn age(&self) -> Option<Duration> {
        match self {
            Self::Event { enqueued_at, .. } => Some(enqueued_at.elapsed()),
            Self::Shutdown => None,
        }
    }
}

/// Counters for queue activity.
#[derive(Debug, Default)]
pub struct QueueStats {
    enqueued: AtomicU64,
    drained: AtomicU64,
    rejected: AtomicU64,
}

impl QueueStats {
    pub fn snapshot(&self) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            drained: self.drained.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`QueueStats`].
#[derive(Debug, Clone)]
pub struct QueueStatsSnapshot {
    /// Events accepted by `enqueue`
    pub enqueued: u64,
    /// Events handed to the consumer
    pub drained: u64,
    /// Enqueue attempts after shutdown
    pub rejected: u64,
}

struct Inner {
    entries: VecDeque<QueueEntry>,
}

/// Bounded FIFO buffer of capacity `max_queue_size`.
pub struct ChangeEventQueue {
    capacity: usize,
    inner: Mutex<Inner>,
    not_full: Notify,
    not_empty: Notify,
    closed: AtomicBool,
    depth: AtomicUsize,
    stats: QueueStats,
}

impl ChangeEventQueue {
    /// Create a queue with the given capacity.
    ///
    /// Capacity validation against the batch size happens at
    /// configuration time ([`crate::PipelineConfig::validate`]); this
    /// constructor only rejects a zero capacity.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(PipelineError::configuration(
                "max.queue.size = '0': A positive queue size is required",
            ));
        }
        Ok(Self {
            capacity,
            inner: Mutex::new(Inner {
                entries: VecDeque::with_capacity(capacity),
            }),
            not_full: Notify::new(),
            not_empty: Notify::new(),
            closed: AtomicBool::new(false),
            depth: AtomicUsize::new(0),
            stats: QueueStats::default(),
        })
    }

    /// Create a queue from a validated configuration.
    pub fn from_config(config: &crate::config::PipelineConfig) -> Result<Self> {
        config.ensure_valid()?;
        Self::new(config.max_queue_size)
    }

    /// Queue capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current number of buffered entries; the observable depth gauge.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    /// Whether `shutdown` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Activity counters.
    pub fn stats(&self) -> QueueStatsSnapshot {
        self.stats.snapshot()
    }

    /// Append an event, suspending the caller while the queue is full.
    ///
    /// Safe for concurrent producers. Fails with
    /// [`PipelineError::QueueClosed`] after shutdown.
    pub async fn enqueue(&self, event: ChangeEvent) -> Result<()> {
        loop {
            // Register interest before re-checking state so a wakeup
            // between the check and the await is not lost.
            let notified = self.not_full.notified();
            {
                let mut inner = self.inner.lock().await;
                if self.closed.load(Ordering::Relaxed) {
                    self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                    return Err(PipelineError::QueueClosed);
                }
                if inner.entries.len() < self.capacity {
                    inner.entries.push_back(QueueEntry::event(event));
                    self.depth.store(inner.entries.len(), Ordering::Relaxed);
                    self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                    self.not_empty.notify_one();
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Remove up to `max_count` entries in FIFO order.
    ///
    /// Blocks until at least one entry is available or `max_wait`
    /// elapses; a timeout returns an empty vector, not an error. After
    /// shutdown, remaining entries (ending with the
    /// [`QueueEntry::Shutdown`] marker) are returned once; further calls
    /// report [`PipelineError::QueueClosed`].
    pub async fn drain(&self, max_count: usize, max_wait: Duration) -> Result<Vec<QueueEntry>> {
        let deadline = Instant::now() + max_wait;
        loop {
            let notified = self.not_empty.notified();
            {
                let mut inner = self.inner.lock().await;
                if !inner.entries.is_empty() {
                    let n = max_count.min(inner.entries.len());
                    let drained: Vec<QueueEntry> = inner.entries.drain(..n).collect();
                    self.depth.store(inner.entries.len(), Ordering::Relaxed);
                    let events = drained.iter().filter(|e| e.as_event().is_some()).count();
                    self.stats.drained.fetch_add(events as u64, Ordering::Relaxed);
                    // Freed capacity: wake every blocked producer; each
                    // re-checks under the lock.
                    self.not_full.notify_waiters();
                    return Ok(drained);
                }
                if self.closed.load(Ordering::Relaxed) {
                    // Final drain already happened; the stream is exhausted.
                    return Err(PipelineError::QueueClosed);
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            if tokio::time::timeout(remaining, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    /// Close the queue. Idempotent; wakes all blocked producers and the
    /// consumer, rejects subsequent enqueues and appends the in-band
    /// shutdown sentinel.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        // Control marker is exempt from the capacity bound.
        inner.entries.push_back(QueueEntry::Shutdown);
        self.depth.store(inner.entries.len(), Ordering::Relaxed);
        drop(inner);
        self.not_full.notify_waiters();
        self.not_empty.notify_waiters();
        tracing::debug!("change event queue shut down");
    }
}
