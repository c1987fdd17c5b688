//! Full collection tracing support.
//!
//! When the `tracing` feature is enabled, this module provides structured
//! spans and events for each collection and each of its four phases.

#[cfg(feature = "tracing")]
pub mod internal {
    use std::sync::atomic::{AtomicU64, Ordering};
    use tracing::{span, Level};

    /// The four phases of a full collection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum FullGcPhase {
        /// Trace the live object graph.
        Mark,
        /// Compute forwarding addresses.
        Prepare,
        /// Rewrite references to forwarding addresses.
        Adjust,
        /// Move objects.
        Compact,
    }

    /// Stable identifier for a collection.
    ///
    /// Correlates all events of a single full collection. Starts at 1 and
    /// increases monotonically across all heaps of the process.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    static NEXT_GC_ID: AtomicU64 = AtomicU64::new(1);

    /// Generate the next unique GC ID.
    pub fn next_gc_id() -> GcId {
        GcId(NEXT_GC_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Create a span for the entire collection.
    pub fn trace_gc_collection(collection_type: &str, gc_id: GcId, explicit: bool) -> span::EnteredSpan {
        span!(
            Level::DEBUG,
            "gc_collect",
            collection_type = collection_type,
            gc_id = gc_id.0,
            explicit = explicit
        )
        .entered()
    }

    /// Create a span for one phase.
    pub fn trace_phase(phase: FullGcPhase) -> span::EnteredSpan {
        span!(Level::DEBUG, "full_gc_phase", phase = ?phase).entered()
    }

    /// Log the outcome of worker sizing.
    pub fn log_worker_count(max: usize, waste_limited: usize, adaptive: usize, chosen: usize) {
        tracing::debug!(max, waste_limited, adaptive, chosen, "worker_count");
    }

    /// Log the completion of one worker's share of a gang task.
    #[allow(clippy::cast_possible_truncation)]
    pub fn log_task(task: &str, worker_id: usize, elapsed: std::time::Duration) {
        tracing::trace!(task, worker_id, elapsed_us = elapsed.as_micros() as u64, "task_done");
    }

    /// Log the end of marking.
    pub fn log_marking_done(objects_marked: usize) {
        tracing::debug!(objects_marked, "marking_done");
    }

    /// Log reference processing results.
    pub fn log_references(cleared: usize, weak_roots_cleared: usize) {
        tracing::debug!(cleared, weak_roots_cleared, "references_processed");
    }

    /// Log class unloading results.
    pub fn log_class_unloading(unloaded: usize) {
        tracing::debug!(unloaded, "class_unloading");
    }

    /// Log that the serial compaction fallback will run.
    pub fn log_serial_fallback(regions: usize) {
        tracing::debug!(regions, "serial_compaction");
    }

    /// Log a humongous relocation.
    pub fn log_humongous_move(from: usize, to: usize, regions: usize) {
        tracing::debug!(from, to, regions, "humongous_move");
    }

    /// Log the objects one worker routed through rescue buffers.
    pub fn log_rescued(worker: usize, count: usize) {
        tracing::debug!(worker, count, "rescued_objects");
    }

    /// Log the end of a collection.
    pub fn log_collection_done(regions_freed: usize, words_reclaimed: usize) {
        tracing::debug!(regions_freed, words_reclaimed, "full_gc_done");
    }
}

#[cfg(not(feature = "tracing"))]
pub mod internal {
    /// Stub type when tracing is disabled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct GcId(pub u64);

    /// Stub function when tracing is disabled.
    pub const fn next_gc_id() -> GcId {
        GcId(0)
    }
}

pub use internal::GcId;
