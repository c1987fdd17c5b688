//! Heap verification around a full collection.
//!
//! Any inconsistency found here is fatal: the heap is corrupt and mutators
//! must not resume.

use std::collections::HashSet;
use std::sync::atomic::Ordering;

use crate::gc::apply_to_marked_objects;
use crate::heap::{decode_oop, Heap};
use crate::object::HeapAddr;
use crate::region::RegionKind;

/// Checks that every reference held by a marked object points at a marked
/// object.
///
/// # Panics
///
/// Panics naming the offending object and slot.
pub fn verify_after_marking(heap: &Heap) {
    let bitmap = heap.mark_bitmap();
    for region in heap.regions() {
        if matches!(region.kind(), RegionKind::Free | RegionKind::ContinuesHumongous) {
            continue;
        }
        apply_to_marked_objects(heap, region.bottom(), region.top(), |obj| {
            let klass = heap.klass_of(obj);
            heap.for_each_oop_slot(obj, klass, |slot| {
                if let Some(target) = heap.load_oop(slot) {
                    assert!(
                        bitmap.is_marked(target),
                        "marked object {obj:#x} ({}) in region {} refers to unmarked {target:#x} \
                         through slot {slot:#x}",
                        klass.name(),
                        region.index()
                    );
                }
            });
            heap.size_given_klass(obj, klass)
        });
    }
}

/// Checks the heap handed back to mutators: the mark bitmap is clear, every
/// region parses from bottom to top with loaded klasses and unforwarded
/// marks, free regions are empty, and every reference (heap slot or root)
/// points at an object start.
///
/// # Panics
///
/// Panics naming the first inconsistency found.
pub fn verify_after_full_collection(heap: &Heap) {
    let bitmap = heap.mark_bitmap();
    assert_eq!(
        bitmap.marked_count(),
        0,
        "mark bitmap not clear after full collection (first bit at {:?})",
        bitmap.next_marked(0, heap.heap_words())
    );

    let mut starts = HashSet::new();
    for region in heap.regions() {
        assert!(
            region.bottom() <= region.top() && region.top() <= region.end(),
            "region {} top {:#x} outside [{:#x}, {:#x}]",
            region.index(),
            region.top(),
            region.bottom(),
            region.end()
        );
        match region.kind() {
            RegionKind::Free => assert!(
                region.is_empty(),
                "free region {} has top {:#x}",
                region.index(),
                region.top()
            ),
            RegionKind::ContinuesHumongous => {
                let start = heap.region_at(region.humongous_start());
                assert_eq!(
                    start.kind(),
                    RegionKind::StartsHumongous,
                    "region {} continues a humongous object at region {} which does not start one",
                    region.index(),
                    start.index()
                );
            }
            _ => {
                let mut cur = region.bottom();
                while cur < region.top() {
                    let (klass, mark) = heap.header(cur);
                    let Some(klass) = heap.klasses().try_get(klass) else {
                        panic!(
                            "object {cur:#x} in region {} has unloaded klass {}",
                            region.index(),
                            klass.as_u32()
                        );
                    };
                    assert!(
                        !mark.is_forwarded(),
                        "object {cur:#x} ({}) in region {} is still forwarded",
                        klass.name(),
                        region.index()
                    );
                    starts.insert(cur);
                    cur += heap.size_given_klass(cur, klass);
                }
                if region.kind() != RegionKind::StartsHumongous {
                    assert_eq!(
                        cur,
                        region.top(),
                        "objects of region {} overrun top {:#x}",
                        region.index(),
                        region.top()
                    );
                }
            }
        }
    }

    let check = |what: &str, slot: HeapAddr, target: HeapAddr| {
        assert!(
            starts.contains(&target),
            "{what} {slot:#x} refers to {target:#x} which is not an object start"
        );
    };
    for &obj in &starts {
        let klass = heap.klass_of(obj);
        heap.for_each_oop_slot(obj, klass, |slot| {
            if let Some(target) = heap.load_oop(slot) {
                check("slot", slot, target);
            }
        });
        if let Some(holder) = klass.holder() {
            check("holder of klass", obj, holder);
        }
    }

    let roots = heap.roots();
    for (i, slot) in roots
        .strong_slots()
        .iter()
        .chain(roots.weak_slots())
        .chain(roots.pending_slots())
        .enumerate()
    {
        if let Some(target) = decode_oop(slot.load(Ordering::Relaxed)) {
            check("root", i, target);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeapConfig;
    use crate::object::KlassDef;

    fn heap_with_pair() -> (Heap, HeapAddr, HeapAddr) {
        let mut heap = Heap::new(HeapConfig::new(64, 2)).unwrap();
        let node = heap
            .register_klass(&KlassDef::instance("Node").reference_field("next"), None)
            .unwrap();
        let a = heap.allocate(node, 0).unwrap();
        let b = heap.allocate(node, 0).unwrap();
        heap.store_oop(heap.field_addr(a, "next").unwrap(), Some(b));
        (heap, a, b)
    }

    #[test]
    fn test_consistent_marking_passes() {
        let (heap, a, b) = heap_with_pair();
        heap.mark_bitmap().par_mark(a);
        heap.mark_bitmap().par_mark(b);
        verify_after_marking(&heap);
    }

    #[test]
    #[should_panic(expected = "refers to unmarked")]
    fn test_missing_mark_is_fatal() {
        let (heap, a, _) = heap_with_pair();
        heap.mark_bitmap().par_mark(a);
        verify_after_marking(&heap);
    }

    #[test]
    fn test_parseable_heap_passes() {
        let (heap, _, _) = heap_with_pair();
        verify_after_full_collection(&heap);
    }

    #[test]
    #[should_panic(expected = "not an object start")]
    fn test_interior_reference_is_fatal() {
        let (heap, a, b) = heap_with_pair();
        heap.store_oop(heap.field_addr(a, "next").unwrap(), Some(b + 1));
        verify_after_full_collection(&heap);
    }

    #[test]
    #[should_panic(expected = "not clear")]
    fn test_leftover_mark_is_fatal() {
        let (heap, a, _) = heap_with_pair();
        heap.mark_bitmap().par_mark(a);
        verify_after_full_collection(&heap);
    }
}
