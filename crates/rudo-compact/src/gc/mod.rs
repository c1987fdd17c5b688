//! Parallel full collection.
//!
//! This module provides the four phases of a full collection and the
//! machinery they share:
//! - Parallel marking with work stealing and reference discovery
//! - Forwarding address computation over per-worker compaction points
//! - Pointer adjustment and compaction, including the rescue path used
//!   while migrating instances of redefined klasses
//! - Serial and humongous fallbacks

mod adjust_task;
mod bitmap;
mod collector;
mod compact_task;
mod mark_task;
mod prepare_task;

pub mod compaction_point;
pub mod derived;
pub mod gang;
pub mod marker;
pub mod preserved;
pub mod reference;
pub mod terminator;
pub mod verify;

pub use bitmap::MarkBitmap;
pub use collector::{calc_active_workers, FullCollector};
pub use compact_task::free_non_overlapping_regions;
pub use prepare_task::HumongousMove;

use crate::config::FullGcConfig;
use crate::heap::Heap;
use crate::metrics::FullGcMetrics;
use crate::object::HeapAddr;

/// Calls `f` on every marked address in `[bottom, top)`. `f` returns the
/// size of the object it was given, and the walk resumes past it.
pub(crate) fn apply_to_marked_objects(
    heap: &Heap,
    bottom: HeapAddr,
    top: HeapAddr,
    mut f: impl FnMut(HeapAddr) -> usize,
) {
    let bitmap = heap.mark_bitmap();
    let mut cur = bottom;
    while let Some(obj) = bitmap.next_marked(cur, top) {
        let size = f(obj);
        debug_assert!(size > 0, "zero-sized object at {obj:#x}");
        cur = obj + size;
    }
}

/// Runs a complete full collection of `heap`.
///
/// # Example
///
/// ```
/// use rudo_compact::{collect_full, FullGcConfig, Heap, HeapConfig, KlassDef};
///
/// let mut heap = Heap::new(HeapConfig::new(256, 4)).unwrap();
/// let node = heap
///     .register_klass(&KlassDef::instance("Node").reference_field("next"), None)
///     .unwrap();
/// for _ in 0..10 {
///     heap.allocate(node, 0).unwrap();
/// }
/// let kept = heap.allocate(node, 0).unwrap();
/// heap.add_root(Some(kept));
///
/// let metrics = collect_full(&mut heap, &FullGcConfig::default());
/// assert_eq!(metrics.objects_marked, 1);
/// assert_eq!(heap.used_words(), 2);
/// ```
pub fn collect_full(heap: &mut Heap, config: &FullGcConfig) -> FullGcMetrics {
    #[cfg(feature = "tracing")]
    let _span = crate::tracing::internal::trace_gc_collection(
        "full",
        crate::tracing::internal::next_gc_id(),
        config.explicit_gc,
    );

    let mut collector = FullCollector::new(heap, config);
    collector.prepare_collection();
    collector.collect();
    collector.complete_collection()
}
