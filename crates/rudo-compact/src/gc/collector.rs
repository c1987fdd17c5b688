//! The full collection state machine.
//!
//! A [`FullCollector`] owns the per-worker state of one collection: a
//! marker and a compaction point per worker, the serial compaction point,
//! the humongous relocation plan and the derived pointer table. Each phase
//! runs as one gang task, so every phase starts only after the previous one
//! finished on all workers.

use std::collections::HashSet;
use std::time::Instant;

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;

use crate::config::FullGcConfig;
use crate::gc::adjust_task::AdjustTask;
use crate::gc::compact_task::{humongous_compaction, serial_compaction, serial_compaction_redefining, CompactTask};
use crate::gc::compaction_point::CompactionPoint;
use crate::gc::derived::DerivedPointerTable;
use crate::gc::gang::WorkGang;
use crate::gc::mark_task::MarkTask;
use crate::gc::marker::{FullGcMarker, MarkingQueues};
use crate::gc::prepare_task::{
    prepare_humongous_compaction, prepare_serial_compaction, prepare_serial_compaction_redefining, HumongousMove,
    PrepareTask,
};
use crate::gc::preserved::RestorePreservedMarksTask;
use crate::gc::reference::{process_discovered_references, process_weak_roots};
use crate::gc::verify::{verify_after_full_collection, verify_after_marking};
use crate::heap::Heap;
use crate::metrics::{FullGcMetrics, PhaseTimer};
use crate::object::{HeapAddr, KlassId};

#[cfg(feature = "tracing")]
use crate::tracing::internal::{
    log_class_unloading, log_collection_done, log_marking_done, log_references, log_serial_fallback,
    log_worker_count, trace_phase, FullGcPhase,
};

/// Number of workers to use for a collection of `heap`.
///
/// With a dynamic worker count this is the smallest of `max_workers`, a
/// limit keeping the per-worker compaction tails (about half a region
/// each) under `heap_waste_percent` of the heap, and one worker per
/// `heap_words_per_worker` used words.
#[must_use]
pub fn calc_active_workers(heap: &Heap, config: &FullGcConfig) -> usize {
    let max = config.max_workers.max(1);
    if !config.use_dynamic_worker_count {
        return max;
    }

    let waste_limited = (2 * heap.num_regions() * config.heap_waste_percent / 100).clamp(1, max);
    let adaptive = heap
        .used_words()
        .div_ceil(config.heap_words_per_worker.max(1))
        .clamp(1, max);
    let chosen = waste_limited.min(adaptive);

    #[cfg(feature = "tracing")]
    log_worker_count(max, waste_limited, adaptive, chosen);

    chosen
}

/// One full collection of a heap.
///
/// ```
/// use rudo_compact::{FullCollector, FullGcConfig, Heap, HeapConfig, KlassDef};
///
/// let mut heap = Heap::new(HeapConfig::new(256, 4)).unwrap();
/// let k = heap.register_klass(&KlassDef::instance("A").field("x", 8), None).unwrap();
/// let _garbage = heap.allocate(k, 0).unwrap();
/// let live = heap.allocate(k, 0).unwrap();
/// let root = heap.add_root(Some(live));
///
/// let mut collector = FullCollector::new(&mut heap, &FullGcConfig::with_workers(2));
/// collector.prepare_collection();
/// collector.collect();
/// let metrics = collector.complete_collection();
///
/// assert_eq!(metrics.objects_marked, 1);
/// assert_eq!(heap.root(root), Some(0));
/// ```
pub struct FullCollector<'h> {
    heap: &'h mut Heap,
    config: FullGcConfig,
    gang: WorkGang,
    markers: Vec<Mutex<FullGcMarker>>,
    queues: MarkingQueues,
    discovered: SegQueue<HeapAddr>,
    compaction_points: Vec<Mutex<CompactionPoint>>,
    serial_point: CompactionPoint,
    humongous_moves: Vec<HumongousMove>,
    derived: DerivedPointerTable,
    used_before: Vec<bool>,
    retained: HashSet<KlassId>,
    redefining: bool,
    prepared: bool,
    started: Instant,
    timer: PhaseTimer,
    metrics: FullGcMetrics,
}

impl std::fmt::Debug for FullCollector<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FullCollector")
            .field("workers", &self.gang.active_workers())
            .field("redefining", &self.redefining)
            .field("prepared", &self.prepared)
            .finish_non_exhaustive()
    }
}

impl<'h> FullCollector<'h> {
    /// Sizes the worker gang and sets up one marker and one compaction
    /// point per worker.
    pub fn new(heap: &'h mut Heap, config: &FullGcConfig) -> Self {
        let workers = calc_active_workers(heap, config);
        let markers: Vec<_> = (0..workers)
            .map(|w| Mutex::new(FullGcMarker::new(w, config.objarray_marking_stride, config.clear_soft_refs)))
            .collect();
        let queues = MarkingQueues::new(&markers);

        let mut metrics = FullGcMetrics::new();
        metrics.workers = workers;

        Self {
            heap,
            config: *config,
            gang: WorkGang::new(workers),
            markers,
            queues,
            discovered: SegQueue::new(),
            compaction_points: (0..workers).map(|_| Mutex::new(CompactionPoint::new())).collect(),
            serial_point: CompactionPoint::new(),
            humongous_moves: Vec::new(),
            derived: DerivedPointerTable::new(),
            used_before: Vec::new(),
            retained: HashSet::new(),
            redefining: false,
            prepared: false,
            started: Instant::now(),
            timer: PhaseTimer::new(),
            metrics,
        }
    }

    /// Workers used by every parallel phase.
    #[must_use]
    pub const fn workers(&self) -> usize {
        self.gang.active_workers()
    }

    /// The heap being collected.
    #[must_use]
    pub fn heap(&self) -> &Heap {
        self.heap
    }

    /// Returns `true` if this collection migrates instances of redefined
    /// klasses.
    #[must_use]
    pub const fn is_redefining(&self) -> bool {
        self.redefining
    }

    /// Regions queued for compaction by `worker`, in compaction order.
    #[must_use]
    pub fn compaction_queue(&self, worker: usize) -> Vec<usize> {
        self.compaction_points[worker].lock().regions().to_vec()
    }

    /// Objects `worker` routes through rescue buffers.
    #[must_use]
    pub fn rescued_objects(&self, worker: usize) -> Vec<HeapAddr> {
        self.compaction_points[worker].lock().rescued_oops().to_vec()
    }

    /// Regions handed to the serial compaction point.
    #[must_use]
    pub fn serial_queue(&self) -> &[usize] {
        self.serial_point.regions()
    }

    /// Planned humongous relocations.
    #[must_use]
    pub fn humongous_moves(&self) -> &[HumongousMove] {
        &self.humongous_moves
    }

    /// Retires the allocation regions, records heap occupancy and derived
    /// pointers, and decides whether this collection migrates redefined
    /// klasses.
    pub fn prepare_collection(&mut self) {
        self.started = Instant::now();
        self.used_before = self.heap.prepare_heap_for_full_collection();
        self.metrics.used_words_before = self.heap.used_words();
        self.redefining = self.heap.klasses().has_pending_redefinition();
        self.derived.activate(self.heap);
        self.prepared = true;
    }

    /// Runs the four phases.
    pub fn collect(&mut self) {
        self.phase1_mark_live_objects();
        self.phase2_prepare_compaction();
        self.phase3_adjust_pointers();
        self.phase4_do_compaction();
    }

    /// Phase 1: marks everything reachable, then processes references, weak
    /// roots and class unloading.
    ///
    /// # Panics
    ///
    /// Panics if [`prepare_collection`](Self::prepare_collection) was not
    /// called, or if verification is on and finds an inconsistency.
    pub fn phase1_mark_live_objects(&mut self) {
        assert!(self.prepared, "full collection started without prepare_collection");
        #[cfg(feature = "tracing")]
        let _span = trace_phase(FullGcPhase::Mark);
        self.timer.start();

        let task = MarkTask::new(
            self.heap,
            &self.markers,
            &self.queues,
            &self.discovered,
            self.config.class_unloading,
        );
        self.gang.run_task(&task);
        drop(task);

        let refs = process_discovered_references(self.heap, &self.discovered);
        let weak_roots_cleared = process_weak_roots(self.heap);
        self.metrics.references_cleared = refs.total();
        self.metrics.weak_roots_cleared = weak_roots_cleared;
        #[cfg(feature = "tracing")]
        log_references(refs.total(), weak_roots_cleared);

        if self.config.class_unloading {
            self.metrics.classes_unloaded = self.heap.unload_dead_klasses();
            #[cfg(feature = "tracing")]
            log_class_unloading(self.metrics.classes_unloaded);
        }

        self.metrics.objects_marked = self.heap.mark_bitmap().marked_count();
        #[cfg(feature = "tracing")]
        log_marking_done(self.metrics.objects_marked);

        if self.config.verify {
            verify_after_marking(self.heap);
        }
        self.derived.deactivate();
        self.timer.end_mark();
    }

    /// Phase 2: computes forwarding addresses and the compaction plan.
    pub fn phase2_prepare_compaction(&mut self) {
        #[cfg(feature = "tracing")]
        let _span = trace_phase(FullGcPhase::Prepare);
        self.timer.start();
        let heap: &Heap = self.heap;

        let task = PrepareTask::new(heap, &self.compaction_points, self.redefining);
        self.gang.run_task(&task);
        self.metrics.humongous_regions_freed = task.humongous_freed();

        if self.redefining {
            let mut spare: Vec<usize> = (0..heap.num_regions())
                .rev()
                .filter(|&i| !self.used_before[i] && !heap.region_at(i).is_pinned())
                .collect();
            prepare_serial_compaction_redefining(heap, &self.compaction_points, &mut spare);
            self.metrics.rescued_objects = self
                .compaction_points
                .iter()
                .map(|cp| cp.lock().rescued_oops().len())
                .sum();
        } else if !task.has_freed_regions() {
            prepare_serial_compaction(heap, &self.compaction_points, &mut self.serial_point);
            self.metrics.serial_compaction = true;
            #[cfg(feature = "tracing")]
            log_serial_fallback(self.serial_point.regions().len());
        }

        let mut queued = vec![false; heap.num_regions()];
        for cp in &self.compaction_points {
            for &index in cp.lock().regions() {
                queued[index] = true;
            }
        }
        for &index in self.serial_point.regions() {
            queued[index] = true;
        }
        self.humongous_moves = prepare_humongous_compaction(heap, &queued);
        self.metrics.humongous_relocated = self.humongous_moves.len();
        self.timer.end_prepare();
    }

    /// Phase 3: rewrites every reference to its target's forwardee.
    pub fn phase3_adjust_pointers(&mut self) {
        #[cfg(feature = "tracing")]
        let _span = trace_phase(FullGcPhase::Adjust);
        self.timer.start();
        let task = AdjustTask::new(self.heap, &self.markers);
        self.gang.run_task(&task);
        self.timer.end_adjust();
    }

    /// Phase 4: moves the objects, then runs the serial and humongous
    /// compaction steps.
    pub fn phase4_do_compaction(&mut self) {
        #[cfg(feature = "tracing")]
        let _span = trace_phase(FullGcPhase::Compact);
        self.timer.start();
        let heap: &Heap = self.heap;

        let task = CompactTask::new(heap, &self.compaction_points, self.redefining);
        self.gang.run_task(&task);
        let mut moved = task.objects_moved();
        self.retained = task.into_retained();

        if self.redefining {
            serial_compaction_redefining(&self.compaction_points);
        } else {
            moved += serial_compaction(heap, &self.serial_point);
        }
        humongous_compaction(heap, &self.humongous_moves);

        self.metrics.objects_moved = moved;
        self.timer.end_compact();
    }

    /// Restores preserved marks, updates derived pointers and hands the heap
    /// back to mutators.
    ///
    /// # Panics
    ///
    /// Panics if verification is on and finds an inconsistency.
    pub fn complete_collection(mut self) -> FullGcMetrics {
        self.gang
            .run_task(&RestorePreservedMarksTask::new(self.heap, &self.markers));
        self.derived.update_pointers(self.heap);

        let heap = self.heap;
        self.metrics.regions_freed = heap.prepare_heap_for_mutators(&self.used_before);
        if self.redefining {
            self.metrics.classes_redefined = heap.klasses_mut().complete_redefinition(&self.retained);
        }
        heap.record_collection();

        if self.config.verify {
            verify_after_full_collection(heap);
        }

        let mut metrics = self.metrics;
        metrics.used_words_after = heap.used_words();
        metrics.total_collections = heap.total_collections();
        metrics.duration = self.started.elapsed();
        self.timer.apply_to(&mut metrics);

        #[cfg(feature = "tracing")]
        log_collection_done(metrics.regions_freed, metrics.words_reclaimed());

        metrics
    }
}
