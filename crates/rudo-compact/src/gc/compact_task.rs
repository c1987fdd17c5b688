//! Phase 4: move objects to their forwarding addresses.
//!
//! Every worker compacts the regions of its own compaction queue in queue
//! order. Since phase 2 only ever forwards objects to the same or an
//! earlier queue position, an object's destination has always been read
//! before it is overwritten. Objects whose klass is being redefined may
//! grow; the ones that would clobber unread data were rescued in phase 2
//! and go through a side buffer here.

use std::collections::HashSet;
use std::ops::Range;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::gc::apply_to_marked_objects;
use crate::gc::compaction_point::CompactionPoint;
use crate::gc::gang::GangTask;
use crate::gc::prepare_task::HumongousMove;
use crate::heap::Heap;
use crate::object::{decode_header, HeapAddr, KlassId};
use crate::redefine::{update_fields, write_migrated};
use crate::region::{HeapRegion, HeapRegionClaimer, RegionKind};

pub(crate) struct CompactTask<'a> {
    heap: &'a Heap,
    compaction_points: &'a [Mutex<CompactionPoint>],
    claimer: HeapRegionClaimer,
    redefining: bool,
    moved: AtomicUsize,
    retained: Mutex<HashSet<KlassId>>,
}

impl<'a> CompactTask<'a> {
    pub(crate) fn new(heap: &'a Heap, compaction_points: &'a [Mutex<CompactionPoint>], redefining: bool) -> Self {
        Self {
            heap,
            compaction_points,
            claimer: HeapRegionClaimer::new(heap.num_regions(), compaction_points.len()),
            redefining,
            moved: AtomicUsize::new(0),
            retained: Mutex::new(HashSet::new()),
        }
    }

    /// Objects copied to a new address so far.
    pub(crate) fn objects_moved(&self) -> usize {
        self.moved.load(Ordering::Relaxed)
    }

    /// Old klass versions that still have instances after compaction.
    pub(crate) fn into_retained(self) -> HashSet<KlassId> {
        self.retained.into_inner()
    }

    fn compact_region_redefining(&self, cp: &mut CompactionPoint, region: &HeapRegion, next_rescued: &mut usize) -> usize {
        let heap = self.heap;
        let mut moved = 0;
        apply_to_marked_objects(heap, region.bottom(), region.top(), |obj| {
            let klass = heap.klass_of(obj);
            let size = heap.size_given_klass(obj, klass);
            heap.mark_bitmap().clear(obj);

            if cp.rescued_oops().get(*next_rescued) == Some(&obj) {
                cp.push_rescued_value(heap.snapshot_words(obj, size).into_boxed_slice());
                if cfg!(debug_assertions) {
                    heap.fill_words(obj, size, 0);
                }
                *next_rescued += 1;
                return size;
            }

            if let Some(dest) = heap.forwardee(obj) {
                match klass.new_version().map(|id| heap.klasses().get(id)) {
                    Some(new_klass) if new_klass.update_information().is_none() => {
                        heap.copy_possibly_overlapping(obj, dest, size);
                        heap.set_klass(dest, new_klass.id());
                    }
                    Some(_) => update_fields(heap, obj, dest),
                    None => heap.copy_possibly_overlapping(obj, dest, size),
                }
                heap.init_mark(dest);
                moved += 1;
            }
            size
        });
        region.complete_compaction();
        moved
    }

    fn replay_rescued(&self, cp: &mut CompactionPoint) {
        let heap = self.heap;
        for value in cp.take_rescued_values() {
            let (klass, mark) = decode_header(value[0]);
            let Some(dest) = mark.forwardee() else {
                panic!("rescued object of klass {} has no destination", klass.as_u32());
            };
            match heap.klasses().get(klass).new_version() {
                Some(new_version) => write_migrated(heap, &value, dest, heap.klasses().get(new_version)),
                None => {
                    heap.store_words(dest, &value);
                    heap.init_mark(dest);
                }
            }
            self.moved.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn reset_region(&self, index: usize) {
        let heap = self.heap;
        let region = heap.region_at(index);
        let bitmap = heap.mark_bitmap();
        if region.kind() == RegionKind::StartsHumongous {
            let obj = region.bottom();
            if bitmap.is_marked(obj) && heap.forwardee(obj).is_none() {
                bitmap.clear(obj);
                self.retain_if_redefined(obj);
            }
        } else if region.is_pinned() && !region.is_humongous() {
            let mut cur = region.bottom();
            apply_to_marked_objects(heap, region.bottom(), region.top(), |obj| {
                heap.fill_with_dummy_objects(cur, obj - cur);
                let size = heap.object_size(obj);
                bitmap.clear(obj);
                self.retain_if_redefined(obj);
                cur = obj + size;
                size
            });
            heap.fill_with_dummy_objects(cur, region.top() - cur);
        }
    }

    fn retain_if_redefined(&self, obj: HeapAddr) {
        let klass = self.heap.klass_of(obj);
        if klass.new_version().is_some() {
            self.retained.lock().insert(klass.id());
        }
    }
}

/// Slides the marked objects of `region` to their forwardees, clearing their
/// mark bits, and installs the planned top. Returns the number of objects
/// that moved.
pub(crate) fn compact_region(heap: &Heap, region: &HeapRegion) -> usize {
    let mut moved = 0;
    apply_to_marked_objects(heap, region.bottom(), region.top(), |obj| {
        let size = heap.object_size(obj);
        heap.mark_bitmap().clear(obj);
        if let Some(dest) = heap.forwardee(obj) {
            heap.copy_possibly_overlapping(obj, dest, size);
            heap.init_mark(dest);
            moved += 1;
        }
        size
    });
    region.complete_compaction();
    moved
}

impl GangTask for CompactTask<'_> {
    fn name(&self) -> &'static str {
        "compaction task"
    }

    fn work(&self, worker_id: usize) {
        let heap = self.heap;
        {
            let mut cp = self.compaction_points[worker_id].lock();
            let regions = cp.regions().to_vec();
            let mut moved = 0;
            if self.redefining {
                let mut next_rescued = 0;
                for index in regions {
                    moved += self.compact_region_redefining(&mut cp, heap.region_at(index), &mut next_rescued);
                }
                assert_eq!(
                    next_rescued,
                    cp.rescued_oops().len(),
                    "worker {worker_id} saw {next_rescued} of {} rescued objects",
                    cp.rescued_oops().len()
                );
                self.replay_rescued(&mut cp);
            } else {
                for index in regions {
                    moved += compact_region(heap, heap.region_at(index));
                }
            }
            self.moved.fetch_add(moved, Ordering::Relaxed);
        }

        self.claimer
            .par_iterate_from_worker_offset(worker_id, |index| self.reset_region(index));
    }
}

/// Compacts the regions of the serial compaction point. Returns the number
/// of objects moved.
pub(crate) fn serial_compaction(heap: &Heap, serial: &CompactionPoint) -> usize {
    serial
        .regions()
        .iter()
        .map(|&index| compact_region(heap, heap.region_at(index)))
        .sum()
}

/// Drops the rescue bookkeeping of every worker after a redefining
/// compaction.
///
/// # Panics
///
/// Panics if any worker left a rescued object behind.
pub(crate) fn serial_compaction_redefining(compaction_points: &[Mutex<CompactionPoint>]) {
    for cp in compaction_points {
        cp.lock().clear_rescued();
    }
}

/// Regions of `src` that `dst` does not cover, in ascending order.
#[must_use]
pub fn free_non_overlapping_regions(src: Range<usize>, dst: Range<usize>) -> Vec<usize> {
    src.filter(|index| !dst.contains(index)).collect()
}

/// Moves each planned humongous object down to its destination run and
/// frees the regions it left. Instances of a redefined klass are rewritten
/// in their new layout.
pub(crate) fn humongous_compaction(heap: &Heap, moves: &[HumongousMove]) {
    for mv in moves {
        let src = heap.region_at(mv.from).bottom();
        let dest = heap.region_at(mv.to).bottom();
        assert_eq!(
            heap.forwardee(src),
            Some(dest),
            "humongous object at region {} not forwarded to region {}",
            mv.from,
            mv.to
        );
        heap.mark_bitmap().clear(src);

        let count = mv.regions_after(heap.region_words());
        let snapshot = mv.migrated_words.map(|_| heap.snapshot_words(src, mv.words));
        for index in free_non_overlapping_regions(mv.from..mv.from + mv.num_regions, mv.to..mv.to + count) {
            heap.region_at(index).set_free();
        }
        heap.set_humongous_metadata(mv.to, count, mv.words_after());

        match snapshot {
            Some(value) => {
                let (klass, _) = decode_header(value[0]);
                let Some(new_version) = heap.klasses().get(klass).new_version() else {
                    panic!("humongous object at region {} lost its klass redefinition", mv.from);
                };
                write_migrated(heap, &value, dest, heap.klasses().get(new_version));
            }
            None => {
                heap.copy_possibly_overlapping(src, dest, mv.words);
                heap.init_mark(dest);
            }
        }

        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_humongous_move(mv.from, mv.to, count);
    }
}
