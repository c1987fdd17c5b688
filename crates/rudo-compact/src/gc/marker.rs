//! Per-worker marking state for phase 1.
//!
//! Each worker owns a LIFO deque of objects to scan and a deque of object
//! array continuations. Idle workers steal from the FIFO end of their
//! siblings' deques until the [`TaskTerminator`] sees everyone idle.

use crossbeam::deque::{Steal, Stealer, Worker};
use crossbeam_queue::SegQueue;
use parking_lot::Mutex;

use crate::gc::preserved::PreservedMarks;
use crate::gc::terminator::TaskTerminator;
use crate::heap::Heap;
use crate::object::{HeapAddr, KlassKind, ReferenceType};

/// Remaining elements of a partially scanned object array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjArrayTask {
    /// The array being scanned.
    pub array: HeapAddr,
    /// First element not yet scanned.
    pub index: usize,
}

/// The stealing ends of every worker's deques.
#[derive(Debug)]
pub struct MarkingQueues {
    oops: Vec<Stealer<HeapAddr>>,
    arrays: Vec<Stealer<ObjArrayTask>>,
}

fn steal_from<T>(stealers: &[Stealer<T>], thief: usize) -> Option<T> {
    let n = stealers.len();
    for i in 1..n {
        let victim = &stealers[(thief + i) % n];
        loop {
            match victim.steal() {
                Steal::Success(item) => return Some(item),
                Steal::Empty => break,
                Steal::Retry => {}
            }
        }
    }
    None
}

impl MarkingQueues {
    /// Registers the stealers of `markers`, indexed by worker id.
    #[must_use]
    pub fn new(markers: &[Mutex<FullGcMarker>]) -> Self {
        let (oops, arrays) = markers
            .iter()
            .map(|m| {
                let m = m.lock();
                (m.oop_stack.stealer(), m.objarray_stack.stealer())
            })
            .unzip();
        Self { oops, arrays }
    }

    /// Returns `true` if any deque has work left.
    #[must_use]
    pub fn has_work(&self) -> bool {
        self.oops.iter().any(|s| !s.is_empty()) || self.arrays.iter().any(|s| !s.is_empty())
    }

    fn steal_oop(&self, thief: usize) -> Option<HeapAddr> {
        steal_from(&self.oops, thief)
    }

    fn steal_array(&self, thief: usize) -> Option<ObjArrayTask> {
        steal_from(&self.arrays, thief)
    }
}

/// A marking worker.
pub struct FullGcMarker {
    worker_id: usize,
    oop_stack: Worker<HeapAddr>,
    objarray_stack: Worker<ObjArrayTask>,
    preserved: PreservedMarks,
    marked: usize,
    stride: usize,
    clear_soft: bool,
}

impl std::fmt::Debug for FullGcMarker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FullGcMarker")
            .field("worker_id", &self.worker_id)
            .field("marked", &self.marked)
            .field("preserved", &self.preserved.len())
            .finish_non_exhaustive()
    }
}

impl FullGcMarker {
    /// Creates the marker of `worker_id`.
    #[must_use]
    pub fn new(worker_id: usize, stride: usize, clear_soft: bool) -> Self {
        Self {
            worker_id,
            oop_stack: Worker::new_lifo(),
            objarray_stack: Worker::new_lifo(),
            preserved: PreservedMarks::new(),
            marked: 0,
            stride: stride.max(1),
            clear_soft,
        }
    }

    /// Objects this worker marked.
    #[must_use]
    pub const fn marked_count(&self) -> usize {
        self.marked
    }

    /// This worker's preserved marks.
    #[must_use]
    pub const fn preserved_marks(&self) -> &PreservedMarks {
        &self.preserved
    }

    pub(crate) fn preserved_marks_mut(&mut self) -> &mut PreservedMarks {
        &mut self.preserved
    }

    /// Marks `obj` and queues it for scanning if this call marked it.
    pub fn mark_and_push(&mut self, heap: &Heap, obj: HeapAddr) {
        if heap.mark_bitmap().par_mark(obj) {
            self.preserved.push_if_necessary(obj, heap.mark_word(obj));
            self.marked += 1;
            self.oop_stack.push(obj);
        }
    }

    fn follow_slot(&mut self, heap: &Heap, slot: HeapAddr) {
        if let Some(target) = heap.load_oop(slot) {
            self.mark_and_push(heap, target);
        }
    }

    fn follow_object(&mut self, heap: &Heap, obj: HeapAddr, discovered: &SegQueue<HeapAddr>) {
        let klass = heap.klass_of(obj);
        if let Some(holder) = klass.holder() {
            self.mark_and_push(heap, holder);
        }

        match klass.kind() {
            KlassKind::ObjArray => self.follow_array_chunk(heap, obj, 0),
            KlassKind::TypeArray => {}
            KlassKind::Instance => {
                for &offset in klass.oop_offsets() {
                    self.follow_slot(heap, obj + offset);
                }
            }
            KlassKind::Reference(ty) => {
                let (referent_slot, rest) = klass
                    .oop_offsets()
                    .split_first()
                    .map_or((None, &[][..]), |(first, rest)| (Some(obj + first), rest));
                if let Some(slot) = referent_slot {
                    self.discover_or_follow(heap, obj, slot, ty, discovered);
                }
                for &offset in rest {
                    self.follow_slot(heap, obj + offset);
                }
            }
        }
    }

    fn discover_or_follow(
        &mut self,
        heap: &Heap,
        reference: HeapAddr,
        slot: HeapAddr,
        ty: ReferenceType,
        discovered: &SegQueue<HeapAddr>,
    ) {
        let Some(referent) = heap.load_oop(slot) else {
            return;
        };
        if ty == ReferenceType::Soft && !self.clear_soft {
            self.mark_and_push(heap, referent);
        } else if !heap.mark_bitmap().is_marked(referent) {
            discovered.push(reference);
        }
    }

    fn follow_array_chunk(&mut self, heap: &Heap, array: HeapAddr, start: usize) {
        let len = heap.array_length(array);
        let end = len.min(start + self.stride);
        if end < len {
            self.objarray_stack.push(ObjArrayTask { array, index: end });
        }
        for index in start..end {
            self.follow_slot(heap, array + 2 + index);
        }
    }

    /// Scans everything on the local deques.
    pub fn drain_stacks(&mut self, heap: &Heap, discovered: &SegQueue<HeapAddr>) {
        loop {
            while let Some(obj) = self.oop_stack.pop() {
                self.follow_object(heap, obj, discovered);
            }
            match self.objarray_stack.pop() {
                Some(task) => self.follow_array_chunk(heap, task.array, task.index),
                None if self.oop_stack.is_empty() => return,
                None => {}
            }
        }
    }

    /// Drains local work, then steals until global termination.
    pub fn complete_marking(
        &mut self,
        heap: &Heap,
        queues: &MarkingQueues,
        terminator: &TaskTerminator,
        discovered: &SegQueue<HeapAddr>,
    ) {
        loop {
            self.drain_stacks(heap, discovered);
            if let Some(obj) = queues.steal_oop(self.worker_id) {
                self.follow_object(heap, obj, discovered);
                continue;
            }
            if let Some(task) = queues.steal_array(self.worker_id) {
                self.follow_array_chunk(heap, task.array, task.index);
                continue;
            }
            if terminator.offer_termination(|| queues.has_work()) {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeapConfig;
    use crate::object::{KlassDef, MarkWord};

    fn heap() -> Heap {
        Heap::new(HeapConfig::new(256, 4)).unwrap()
    }

    #[test]
    fn test_marks_transitive_closure() {
        let mut heap = heap();
        let node = heap
            .register_klass(&KlassDef::instance("Node").reference_field("next"), None)
            .unwrap();
        let a = heap.allocate(node, 0).unwrap();
        let b = heap.allocate(node, 0).unwrap();
        let dead = heap.allocate(node, 0).unwrap();
        heap.store_oop(heap.field_addr(a, "next").unwrap(), Some(b));
        heap.store_oop(heap.field_addr(b, "next").unwrap(), Some(a));

        let mut marker = FullGcMarker::new(0, 16, false);
        let discovered = SegQueue::new();
        marker.mark_and_push(&heap, a);
        marker.drain_stacks(&heap, &discovered);

        assert!(heap.mark_bitmap().is_marked(a));
        assert!(heap.mark_bitmap().is_marked(b));
        assert!(!heap.mark_bitmap().is_marked(dead));
        assert_eq!(marker.marked_count(), 2);
    }

    #[test]
    fn test_large_array_is_chunked() {
        let mut heap = heap();
        let arr = heap.register_klass(&KlassDef::object_array("Arr"), None).unwrap();
        let leaf = heap.register_klass(&KlassDef::instance("Leaf"), None).unwrap();
        let array = heap.allocate(arr, 10).unwrap();
        let leaves: Vec<_> = (0..10).map(|_| heap.allocate(leaf, 0).unwrap()).collect();
        for (i, &l) in leaves.iter().enumerate() {
            heap.store_oop(heap.element_addr(array, i), Some(l));
        }

        let mut marker = FullGcMarker::new(0, 3, false);
        let discovered = SegQueue::new();
        marker.mark_and_push(&heap, array);
        marker.drain_stacks(&heap, &discovered);
        assert!(leaves.iter().all(|&l| heap.mark_bitmap().is_marked(l)));
    }

    #[test]
    fn test_hashed_marks_are_preserved() {
        let mut heap = heap();
        let k = heap.register_klass(&KlassDef::instance("H"), None).unwrap();
        let obj = heap.allocate(k, 0).unwrap();
        let hash = heap.identity_hash(obj).unwrap();

        let mut marker = FullGcMarker::new(0, 16, false);
        marker.mark_and_push(&heap, obj);
        assert_eq!(
            marker.preserved_marks().entries(),
            &[(obj, MarkWord::Default { hash })]
        );
    }

    #[test]
    fn test_weak_referent_is_discovered_not_marked() {
        let mut heap = heap();
        let weak = heap
            .register_klass(&KlassDef::reference("Weak", ReferenceType::Weak), None)
            .unwrap();
        let soft = heap
            .register_klass(&KlassDef::reference("Soft", ReferenceType::Soft), None)
            .unwrap();
        let leaf = heap.register_klass(&KlassDef::instance("Leaf"), None).unwrap();
        let w = heap.allocate(weak, 0).unwrap();
        let s = heap.allocate(soft, 0).unwrap();
        let weakly = heap.allocate(leaf, 0).unwrap();
        let softly = heap.allocate(leaf, 0).unwrap();
        heap.store_oop(w + 1, Some(weakly));
        heap.store_oop(s + 1, Some(softly));

        let mut marker = FullGcMarker::new(0, 16, false);
        let discovered = SegQueue::new();
        marker.mark_and_push(&heap, w);
        marker.mark_and_push(&heap, s);
        marker.drain_stacks(&heap, &discovered);

        assert!(!heap.mark_bitmap().is_marked(weakly));
        assert!(heap.mark_bitmap().is_marked(softly));
        assert_eq!(discovered.pop(), Some(w));
        assert!(discovered.is_empty());
    }

    #[test]
    fn test_holder_is_kept_alive_by_instances() {
        let mut heap = heap();
        let holder_klass = heap.register_klass(&KlassDef::instance("Loader"), None).unwrap();
        let holder = heap.allocate(holder_klass, 0).unwrap();
        let k = heap
            .register_klass(&KlassDef::instance("Loaded"), Some(holder))
            .unwrap();
        let obj = heap.allocate(k, 0).unwrap();

        let mut marker = FullGcMarker::new(0, 16, false);
        let discovered = SegQueue::new();
        marker.mark_and_push(&heap, obj);
        marker.drain_stacks(&heap, &discovered);
        assert!(heap.mark_bitmap().is_marked(holder));
    }
}
