//! Reference and weak root processing after marking.

use crossbeam_queue::SegQueue;

use crate::heap::{decode_oop, Heap};
use crate::object::{HeapAddr, KlassKind, ReferenceType};

/// Referents cleared by one round of reference processing, by strength.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReferenceStats {
    /// Soft referents cleared.
    pub soft: usize,
    /// Weak referents cleared.
    pub weak: usize,
    /// Phantom referents cleared.
    pub phantom: usize,
}

impl ReferenceStats {
    /// Total referents cleared.
    #[must_use]
    pub const fn total(&self) -> usize {
        self.soft + self.weak + self.phantom
    }
}

/// Clears the referent of every discovered reference whose referent was
/// not marked, and appends those references to the pending list in
/// address order.
pub(crate) fn process_discovered_references(heap: &mut Heap, discovered: &SegQueue<HeapAddr>) -> ReferenceStats {
    let mut refs = Vec::with_capacity(discovered.len());
    while let Some(reference) = discovered.pop() {
        refs.push(reference);
    }
    refs.sort_unstable();
    refs.dedup();

    let mut stats = ReferenceStats::default();
    for reference in refs {
        let klass = heap.klass_of(reference);
        let KlassKind::Reference(ty) = klass.kind() else {
            panic!("discovered object {reference:#x} of klass {} is not a reference", klass.name());
        };
        let slot = reference + klass.oop_offsets()[0];
        let Some(referent) = heap.load_oop(slot) else {
            continue;
        };
        if heap.mark_bitmap().is_marked(referent) {
            continue;
        }

        heap.store_oop(slot, None);
        heap.roots_mut().push_pending(reference);
        match ty {
            ReferenceType::Soft => stats.soft += 1,
            ReferenceType::Weak => stats.weak += 1,
            ReferenceType::Phantom => stats.phantom += 1,
        }
    }
    stats
}

/// Clears every weak root whose target was not marked. Returns the number
/// of roots cleared.
pub(crate) fn process_weak_roots(heap: &Heap) -> usize {
    let mut cleared = 0;
    for slot in heap.roots().weak_slots() {
        let raw = slot.load(std::sync::atomic::Ordering::Relaxed);
        if decode_oop(raw).is_some_and(|target| !heap.mark_bitmap().is_marked(target)) {
            slot.store(0, std::sync::atomic::Ordering::Relaxed);
            cleared += 1;
        }
    }
    cleared
}
