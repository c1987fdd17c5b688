//! Phase 2: compute forwarding addresses.
//!
//! Workers claim regions (old generation first, then young) and forward the
//! live objects of each claimed region through their own
//! [`CompactionPoint`]. Dead humongous objects free their regions, which
//! then join the claiming worker's queue as empty targets. Pinned regions
//! and live humongous objects are left to the serial steps that follow.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::gc::apply_to_marked_objects;
use crate::gc::compaction_point::CompactionPoint;
use crate::gc::gang::GangTask;
use crate::heap::Heap;
use crate::object::HeapAddr;
use crate::redefine::{must_rescue, CompactionSpace};
use crate::region::{Generation, HeapRegion, HeapRegionClaimer, RegionKind};

/// Regions in phase 2 claiming order: old generation, then young. Free
/// regions are not compacted and are left out.
#[must_use]
pub(crate) fn claim_order(heap: &Heap) -> Vec<usize> {
    let (old, young): (Vec<&HeapRegion>, Vec<&HeapRegion>) = heap
        .regions()
        .iter()
        .filter(|r| !r.is_free())
        .partition(|r| r.kind().generation() == Generation::Old);
    old.into_iter().chain(young).map(HeapRegion::index).collect()
}

pub(crate) struct PrepareTask<'a> {
    heap: &'a Heap,
    compaction_points: &'a [Mutex<CompactionPoint>],
    claimer: HeapRegionClaimer,
    order: Vec<usize>,
    redefining: bool,
    freed_regions: AtomicBool,
    humongous_freed: AtomicUsize,
}

impl<'a> PrepareTask<'a> {
    pub(crate) fn new(heap: &'a Heap, compaction_points: &'a [Mutex<CompactionPoint>], redefining: bool) -> Self {
        Self {
            heap,
            compaction_points,
            claimer: HeapRegionClaimer::new(heap.num_regions(), compaction_points.len()),
            order: claim_order(heap),
            redefining,
            freed_regions: AtomicBool::new(false),
            humongous_freed: AtomicUsize::new(0),
        }
    }

    /// Whether any worker ends up with at least one empty region.
    pub(crate) fn has_freed_regions(&self) -> bool {
        self.freed_regions.load(Ordering::Relaxed)
    }

    /// Regions freed because their humongous object died.
    pub(crate) fn humongous_freed(&self) -> usize {
        self.humongous_freed.load(Ordering::Relaxed)
    }
}

impl GangTask for PrepareTask<'_> {
    fn name(&self) -> &'static str {
        "prepare compaction task"
    }

    fn work(&self, worker_id: usize) {
        let mut cp = self.compaction_points[worker_id].lock();
        let mut closure = CalculatePointers {
            heap: self.heap,
            cp: &mut cp,
            redefining: self.redefining,
            humongous_removed: 0,
            humongous_queued: 0,
            processing_order: 0,
        };
        self.claimer
            .par_iterate_from_start(&self.order, |index| closure.do_region(index));
        let freed = closure.freed_regions();
        let humongous_removed = closure.humongous_removed;

        if self.redefining {
            #[cfg(feature = "tracing")]
            crate::tracing::internal::log_rescued(worker_id, cp.rescued_oops().len());
            cp.forward_rescued(self.heap);
        }
        cp.update(self.heap);

        self.humongous_freed
            .fetch_add(humongous_removed, Ordering::Relaxed);
        if freed {
            self.freed_regions.store(true, Ordering::Relaxed);
        }
    }
}

struct CalculatePointers<'a, 'b> {
    heap: &'a Heap,
    cp: &'b mut CompactionPoint,
    redefining: bool,
    humongous_removed: usize,
    humongous_queued: usize,
    processing_order: usize,
}

impl CalculatePointers<'_, '_> {
    fn do_region(&mut self, index: usize) {
        let heap = self.heap;
        let region = heap.region_at(index);
        region.set_processing_order(self.processing_order);
        self.processing_order += 1;

        if region.is_humongous() {
            let start = heap.region_at(region.humongous_start()).bottom();
            if !heap.mark_bitmap().is_marked(start) {
                self.free_humongous_region(region);
            }
        } else if !region.is_pinned() {
            self.prepare_for_compaction(region);
        }
    }

    /// Frees a region of a dead humongous object. A pinned region is left
    /// empty and out of the compaction queue.
    fn free_humongous_region(&mut self, region: &HeapRegion) {
        region.set_free();
        self.humongous_removed += 1;
        if !region.is_pinned() {
            self.humongous_queued += 1;
            self.prepare_for_compaction(region);
        }
    }

    fn prepare_for_compaction(&mut self, region: &HeapRegion) {
        if !self.cp.is_initialized() {
            region.set_compaction_top(region.bottom());
            self.cp.initialize(self.heap, region.index());
        }
        self.cp.add(region.index());
        region.set_compaction_top(region.bottom());

        let heap = self.heap;
        if self.redefining {
            let from = CompactionSpace {
                generation: region.kind().generation(),
                order: region.processing_order(),
            };
            apply_to_marked_objects(heap, region.bottom(), region.top(), |obj| {
                self.prepare_object_redefining(obj, from)
            });
        } else {
            apply_to_marked_objects(heap, region.bottom(), region.top(), |obj| {
                let size = heap.object_size(obj);
                self.cp.forward(heap, obj, size);
                size
            });
        }
    }

    fn prepare_object_redefining(&mut self, obj: HeapAddr, from: CompactionSpace) -> usize {
        let heap = self.heap;
        let klass = heap.klass_of(obj);
        let size = heap.size_given_klass(obj, klass);
        let new_size = klass
            .new_version()
            .map(|id| heap.size_given_klass(obj, heap.klasses().get(id)));
        let forward_size = new_size.unwrap_or(size);

        let placed = self.cp.forward_compact_top(heap, forward_size).filter(|&top| {
            let to = self.cp.current_region().map_or(from, |current| {
                let region = heap.region_at(current);
                CompactionSpace {
                    generation: region.kind().generation(),
                    order: region.processing_order(),
                }
            });
            !must_rescue(obj, size, top, new_size, from, to)
        });

        if placed.is_some() {
            self.cp.forward_redefining(heap, obj, forward_size, new_size.is_some());
        } else {
            self.cp.push_rescued(obj);
        }
        size
    }

    fn freed_regions(&self) -> bool {
        self.humongous_queued > 0 || self.cp.has_free_tail()
    }
}

/// Moves the last region of every worker's queue to `serial` and re-plans
/// them in one sequence.
///
/// Objects of these regions that were forwarded within their own region, or
/// left in place, are forwarded again by the serial point. Objects already
/// forwarded into an earlier region keep that destination.
pub(crate) fn prepare_serial_compaction(
    heap: &Heap,
    compaction_points: &[Mutex<CompactionPoint>],
    serial: &mut CompactionPoint,
) {
    for cp in compaction_points {
        if let Some(last) = cp.lock().remove_last() {
            serial.add(last);
        }
    }

    let regions = serial.regions().to_vec();
    for index in regions {
        let region = heap.region_at(index);
        if !serial.is_initialized() {
            // Already planned by its worker; nothing more to do.
            serial.initialize(heap, index);
            continue;
        }
        assert!(!region.is_humongous(), "humongous region {index} in serial compaction queue");
        region.set_compaction_top(region.bottom());
        apply_to_marked_objects(heap, region.bottom(), region.top(), |obj| {
            let size = heap.object_size(obj);
            let elsewhere = heap.forwardee(obj).is_some_and(|to| !region.contains(to));
            if !elsewhere {
                serial.forward(heap, obj, size);
            }
            size
        });
    }
    serial.update(heap);
}

/// Forwards rescued objects that did not fit in their worker's queue into
/// spare regions, appending each spare region to that worker's queue.
/// Returns the number of spare regions used.
///
/// # Panics
///
/// Panics when spare regions run out; the collection cannot complete.
pub(crate) fn prepare_serial_compaction_redefining(
    heap: &Heap,
    compaction_points: &[Mutex<CompactionPoint>],
    spare_regions: &mut Vec<usize>,
) -> usize {
    let mut used = 0;
    for (worker, cp) in compaction_points.iter().enumerate() {
        let mut cp = cp.lock();
        while cp.has_unforwarded_rescued() {
            let Some(index) = spare_regions.pop() else {
                panic!(
                    "out of free regions placing {} rescued objects of worker {worker} after redefinition",
                    cp.rescued_oops().len() - cp.last_rescued_oop()
                );
            };
            let region = heap.region_at(index);
            region.set_compaction_top(region.bottom());
            cp.add(index);
            if !cp.is_initialized() {
                cp.initialize(heap, index);
            }
            cp.forward_rescued(heap);
            cp.update(heap);
            used += 1;
        }
    }
    used
}

/// A live humongous object planned to slide down to a lower run of regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HumongousMove {
    /// First region of the object before the move.
    pub from: usize,
    /// First region of the object after the move.
    pub to: usize,
    /// Regions the object spans before the move.
    pub num_regions: usize,
    /// Object size in words before the move.
    pub words: usize,
    /// Size in words of the migrated object when its klass is being
    /// redefined. Such objects are rewritten even when `to == from`.
    pub migrated_words: Option<usize>,
}

impl HumongousMove {
    /// Regions the object spans after the move.
    #[must_use]
    pub const fn regions_after(&self, region_words: usize) -> usize {
        match self.migrated_words {
            Some(words) => words.div_ceil(region_words),
            None => self.num_regions,
        }
    }

    /// Object size in words after the move.
    #[must_use]
    pub const fn words_after(&self) -> usize {
        match self.migrated_words {
            Some(words) => words,
            None => self.words,
        }
    }
}

/// Plans the relocation of live humongous objects.
///
/// A region can take part of a humongous object if it will be empty once
/// regular compaction is done: a queued region whose compaction top stayed
/// at bottom, or a free region nobody queued. Pinned regions never move or
/// receive objects. Each live humongous object, in address order, moves to
/// the lowest run of such regions (its own regions included) below its
/// current start; the regions it leaves become available to later ones.
///
/// Instances of a redefined klass are always planned, possibly in place,
/// with a run sized for their new layout.
///
/// # Panics
///
/// Panics if a redefined humongous instance finds no run large enough for
/// its new layout.
pub(crate) fn prepare_humongous_compaction(heap: &Heap, queued: &[bool]) -> Vec<HumongousMove> {
    let n = heap.num_regions();
    let mut available: Vec<bool> = (0..n)
        .map(|i| {
            let region = heap.region_at(i);
            !region.is_pinned()
                && if queued[i] {
                    region.compaction_top() == region.bottom()
                } else {
                    region.is_free()
                }
        })
        .collect();

    let mut moves = Vec::new();
    for start in 0..n {
        let region = heap.region_at(start);
        if region.kind() != RegionKind::StartsHumongous || !heap.mark_bitmap().is_marked(region.bottom()) {
            continue;
        }
        let obj = region.bottom();
        let klass = heap.klass_of(obj);
        let words = heap.size_given_klass(obj, klass);
        let count = words.div_ceil(heap.region_words());
        let own = start..start + count;
        if own.clone().any(|i| heap.region_at(i).is_pinned()) {
            continue;
        }

        let migrated_words = klass
            .new_version()
            .map(|id| heap.size_given_klass(obj, heap.klasses().get(id)));
        // Unchanged objects only move down; migrated ones may stay put.
        let (new_count, mut candidates) = match migrated_words {
            Some(new_words) => (new_words.div_ceil(heap.region_words()), 0..start + 1),
            None => (count, 0..start),
        };
        let target = candidates.find(|&t| {
            t + new_count <= n && (t..t + new_count).all(|i| available[i] || own.contains(&i))
        });

        let Some(to) = target else {
            assert!(
                migrated_words.is_none(),
                "out of free regions migrating humongous instance of {} at region {start}",
                klass.name()
            );
            continue;
        };
        heap.forward_to(obj, heap.region_at(to).bottom());
        for i in own {
            available[i] = true;
        }
        for slot in &mut available[to..to + new_count] {
            *slot = false;
        }
        moves.push(HumongousMove {
            from: start,
            to,
            num_regions: count,
            words,
            migrated_words,
        });
    }
    moves
}
