//! Phase 3: point every reference at its referent's new address.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::gc::apply_to_marked_objects;
use crate::gc::gang::GangTask;
use crate::gc::marker::FullGcMarker;
use crate::heap::{decode_oop, encode_oop, Heap};
use crate::object::{HeapAddr, Klass};
use crate::region::{HeapRegionClaimer, RegionKind};

fn adjust_root(heap: &Heap, slot: &AtomicU64) {
    let Some(target) = decode_oop(slot.load(Ordering::Relaxed)) else {
        return;
    };
    if let Some(forwardee) = heap.forwardee(target) {
        slot.store(encode_oop(Some(forwardee)), Ordering::Relaxed);
    }
}

/// Rewrites the heap slot `slot` if its target was forwarded.
pub(crate) fn adjust_pointer(heap: &Heap, slot: HeapAddr) {
    if let Some(forwardee) = heap.load_oop(slot).and_then(|target| heap.forwardee(target)) {
        heap.store_oop(slot, Some(forwardee));
    }
}

/// Root groups are each adjusted by one worker; heap regions are claimed
/// per worker starting at spread-out offsets.
pub(crate) struct AdjustTask<'a> {
    heap: &'a Heap,
    markers: &'a [Mutex<FullGcMarker>],
    claimer: HeapRegionClaimer,
    strong_roots_claimed: AtomicBool,
    weak_roots_claimed: AtomicBool,
    klass_roots_claimed: AtomicBool,
}

impl<'a> AdjustTask<'a> {
    pub(crate) fn new(heap: &'a Heap, markers: &'a [Mutex<FullGcMarker>]) -> Self {
        Self {
            heap,
            markers,
            claimer: HeapRegionClaimer::new(heap.num_regions(), markers.len()),
            strong_roots_claimed: AtomicBool::new(false),
            weak_roots_claimed: AtomicBool::new(false),
            klass_roots_claimed: AtomicBool::new(false),
        }
    }

    fn adjust_roots(&self) {
        let heap = self.heap;
        let roots = heap.roots();
        if !self.strong_roots_claimed.swap(true, Ordering::AcqRel) {
            for slot in roots.strong_slots().iter().chain(roots.pending_slots()) {
                adjust_root(heap, slot);
            }
        }
        if !self.weak_roots_claimed.swap(true, Ordering::AcqRel) {
            for slot in roots.weak_slots() {
                adjust_root(heap, slot);
            }
        }
        if !self.klass_roots_claimed.swap(true, Ordering::AcqRel) {
            for slot in heap.klasses().iter().filter_map(Klass::holder_slot) {
                adjust_root(heap, slot);
            }
        }
    }

    fn adjust_region(&self, index: usize) {
        let heap = self.heap;
        let region = heap.region_at(index);
        if matches!(region.kind(), RegionKind::Free | RegionKind::ContinuesHumongous) {
            return;
        }
        apply_to_marked_objects(heap, region.bottom(), region.top(), |obj| {
            let klass = heap.klass_of(obj);
            heap.for_each_oop_slot(obj, klass, |slot| adjust_pointer(heap, slot));
            heap.size_given_klass(obj, klass)
        });
    }
}

impl GangTask for AdjustTask<'_> {
    fn name(&self) -> &'static str {
        "adjust pointers task"
    }

    fn work(&self, worker_id: usize) {
        self.adjust_roots();
        self.markers[worker_id]
            .lock()
            .preserved_marks_mut()
            .adjust_during_full_gc(self.heap);
        self.claimer
            .par_iterate_from_worker_offset(worker_id, |index| self.adjust_region(index));
    }
}
