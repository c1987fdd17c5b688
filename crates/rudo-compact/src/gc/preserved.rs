//! Mark words that must survive forwarding.
//!
//! Marking stashes every hash or lock mark it sees. Phase 3 moves the stashed
//! addresses to the forwardees and `complete_collection` writes the marks
//! back once the objects sit at their final addresses.

use parking_lot::Mutex;

use crate::gc::gang::GangTask;
use crate::gc::marker::FullGcMarker;
use crate::heap::Heap;
use crate::object::{HeapAddr, MarkWord};

/// One worker's stash of preserved marks.
#[derive(Debug, Default)]
pub struct PreservedMarks {
    stack: Vec<(HeapAddr, MarkWord)>,
}

impl PreservedMarks {
    /// Creates an empty stash.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stashes `mark` for `obj` if it carries information.
    pub fn push_if_necessary(&mut self, obj: HeapAddr, mark: MarkWord) {
        if mark.must_be_preserved() {
            self.stack.push((obj, mark));
        }
    }

    /// Number of stashed marks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stack.len()
    }

    /// Returns `true` if nothing is stashed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }

    /// Stashed entries.
    #[must_use]
    pub fn entries(&self) -> &[(HeapAddr, MarkWord)] {
        &self.stack
    }

    /// Redirects each entry to its object's forwardee.
    pub(crate) fn adjust_during_full_gc(&mut self, heap: &Heap) {
        for (obj, _) in &mut self.stack {
            if let Some(forwardee) = heap.forwardee(*obj) {
                *obj = forwardee;
            }
        }
    }

    /// Writes every mark back and empties the stash.
    pub(crate) fn restore(&mut self, heap: &Heap) {
        for (obj, mark) in self.stack.drain(..) {
            heap.set_mark(obj, mark);
        }
    }
}

/// Restores every worker's preserved marks in parallel.
pub(crate) struct RestorePreservedMarksTask<'a> {
    heap: &'a Heap,
    markers: &'a [Mutex<FullGcMarker>],
}

impl<'a> RestorePreservedMarksTask<'a> {
    pub(crate) const fn new(heap: &'a Heap, markers: &'a [Mutex<FullGcMarker>]) -> Self {
        Self { heap, markers }
    }
}

impl GangTask for RestorePreservedMarksTask<'_> {
    fn name(&self) -> &'static str {
        "restore preserved marks"
    }

    fn work(&self, worker_id: usize) {
        if let Some(marker) = self.markers.get(worker_id) {
            marker.lock().preserved_marks_mut().restore(self.heap);
        }
    }
}
