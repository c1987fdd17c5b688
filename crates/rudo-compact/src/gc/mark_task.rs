//! Phase 1: parallel marking from the roots.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_queue::SegQueue;
use parking_lot::Mutex;

use crate::gc::gang::GangTask;
use crate::gc::marker::{FullGcMarker, MarkingQueues};
use crate::gc::terminator::TaskTerminator;
use crate::heap::{decode_oop, Heap};
use crate::object::HeapAddr;

const ROOT_CHUNK: usize = 64;

/// Marks everything reachable from the roots.
///
/// Strong roots are handed out in chunks. Worker 0 additionally marks the
/// pending reference list and, when class unloading is off, every klass
/// holder. Each worker then drains its own deque and steals from its
/// siblings until all are idle.
pub(crate) struct MarkTask<'a> {
    heap: &'a Heap,
    markers: &'a [Mutex<FullGcMarker>],
    queues: &'a MarkingQueues,
    terminator: TaskTerminator,
    discovered: &'a SegQueue<HeapAddr>,
    next_root: AtomicUsize,
    class_unloading: bool,
}

impl<'a> MarkTask<'a> {
    pub(crate) fn new(
        heap: &'a Heap,
        markers: &'a [Mutex<FullGcMarker>],
        queues: &'a MarkingQueues,
        discovered: &'a SegQueue<HeapAddr>,
        class_unloading: bool,
    ) -> Self {
        Self {
            heap,
            markers,
            queues,
            terminator: TaskTerminator::new(markers.len()),
            discovered,
            next_root: AtomicUsize::new(0),
            class_unloading,
        }
    }

    fn mark_strong_roots(&self, marker: &mut FullGcMarker) {
        let slots = self.heap.roots().strong_slots();
        loop {
            let start = self.next_root.fetch_add(ROOT_CHUNK, Ordering::Relaxed);
            if start >= slots.len() {
                return;
            }
            for slot in &slots[start..slots.len().min(start + ROOT_CHUNK)] {
                if let Some(obj) = decode_oop(slot.load(Ordering::Relaxed)) {
                    marker.mark_and_push(self.heap, obj);
                }
            }
            marker.drain_stacks(self.heap, self.discovered);
        }
    }

    fn mark_vm_roots(&self, marker: &mut FullGcMarker) {
        for slot in self.heap.roots().pending_slots() {
            if let Some(obj) = decode_oop(slot.load(Ordering::Relaxed)) {
                marker.mark_and_push(self.heap, obj);
            }
        }
        if !self.class_unloading {
            for klass in self.heap.klasses().iter() {
                if let Some(holder) = klass.holder() {
                    marker.mark_and_push(self.heap, holder);
                }
            }
        }
    }
}

impl GangTask for MarkTask<'_> {
    fn name(&self) -> &'static str {
        "marking task"
    }

    fn work(&self, worker_id: usize) {
        let mut marker = self.markers[worker_id].lock();
        if worker_id == 0 {
            self.mark_vm_roots(&mut marker);
        }
        self.mark_strong_roots(&mut marker);
        marker.complete_marking(self.heap, self.queues, &self.terminator, self.discovered);
    }
}
