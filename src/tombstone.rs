//! Tombstone emission
//!
//! When `tombstones.on.delete` is enabled (the default), each delete
//! event that survives filtering is followed by a synthesized marker
//! carrying the same key and a null value, so downstream log compaction
//! can remove every event for the key.
//!
//! The marker's position is the delete position's successor: it sorts
//! strictly after the delete and strictly before the partition's next
//! source offset, so it can never precede the delete in commit order.
//! The marker is not a source-log event and is subject to no further
//! filtering, but it passes through the queue like any other event.

use crate::config::PipelineConfig;
use crate::event::{ChangeEvent, Operation};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for tombstone emission.
#[derive(Debug, Default)]
pub struct TombstoneStats {
    deletes_seen: AtomicU64,
    tombstones_emitted: AtomicU64,
}

impl TombstoneStats {
    pub fn snapshot(&self) -> TombstoneStatsSnapshot {
        TombstoneStatsSnapshot {
            deletes_seen: self.deletes_seen.load(Ordering::Relaxed),
            tombstones_emitted: self.tombstones_emitted.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of [`TombstoneStats`].
#[derive(Debug, Clone)]
pub struct TombstoneStatsSnapshot {
    /// Delete events processed
    pub deletes_seen: u64,
    /// Markers synthesized
    pub tombstones_emitted: u64,
}

/// Decides whether a logical delete is followed by an explicit
/// null-value marker event.
pub struct TombstonePolicy {
    emit_on_delete: bool,
    stats: TombstoneStats,
}

impl TombstonePolicy {
    pub fn new(emit_on_delete: bool) -> Self {
        Self {
            emit_on_delete,
            stats: TombstoneStats::default(),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(config.tombstones_on_delete)
    }

    /// Whether markers are emitted.
    pub fn is_enabled(&self) -> bool {
        self.emit_on_delete
    }

    /// Expand an event into the sequence to enqueue.
    ///
    /// Deletes yield `[delete, marker]` when emission is enabled; every
    /// other event (including an already-null marker) passes through
    /// unchanged.
    pub fn expand(&self, event: ChangeEvent) -> Vec<ChangeEvent> {
        if event.operation != Operation::Delete || event.is_tombstone() {
            return vec![event];
        }
        self.stats.deletes_seen.fetch_add(1, Ordering::Relaxed);
        if !self.emit_on_delete {
            return vec![event];
        }

        let marker = ChangeEvent::tombstone_for(&event);
        self.stats.tombstones_emitted.fetch_add(1, Ordering::Relaxed);
        vec![event, marker]
    }

    pub fn stats(&self) -> TombstoneStatsSnapshot {
        self.stats.snapshot()
    }
}

impl Default for TombstonePolicy {
    fn default() -> Self {
        Self::new(true)
    }
}
