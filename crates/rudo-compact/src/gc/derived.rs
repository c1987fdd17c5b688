//! Interior pointers that must follow their base object.
//!
//! The table records `derived - base` for every derived root when the
//! collection starts and recomputes each derived value from the base's
//! final address once compaction is done.

use std::sync::atomic::Ordering;

use crate::heap::{encode_oop, Heap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    derived: usize,
    offset: Option<usize>,
}

/// Derived root offsets for one collection.
#[derive(Debug, Default)]
pub struct DerivedPointerTable {
    entries: Vec<Entry>,
    active: bool,
}

impl DerivedPointerTable {
    /// Creates an inactive, empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` while new entries are accepted.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.active
    }

    /// Number of recorded entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Clears the table and records the offset of every derived root of
    /// `heap` from its base.
    ///
    /// # Panics
    ///
    /// Panics if a derived pointer lies below its base.
    pub fn activate(&mut self, heap: &Heap) {
        self.entries.clear();
        self.active = true;
        let roots = heap.roots();
        for (derived, root) in roots.derived_roots().iter().enumerate() {
            let offset = match (heap.root(root.base()), root.value()) {
                (Some(base), Some(value)) => {
                    assert!(value >= base, "derived pointer {value:#x} below its base {base:#x}");
                    Some(value - base)
                }
                _ => None,
            };
            self.entries.push(Entry { derived, offset });
        }
    }

    /// Stops accepting entries.
    pub fn deactivate(&mut self) {
        self.active = false;
    }

    /// Rewrites every derived root from its base's current address and
    /// empties the table.
    pub fn update_pointers(&mut self, heap: &Heap) {
        let roots = heap.roots();
        for entry in self.entries.drain(..) {
            let root = &roots.derived_roots()[entry.derived];
            let value = heap
                .root(root.base())
                .zip(entry.offset)
                .map(|(base, offset)| base + offset);
            root.value.store(encode_oop(value), Ordering::Relaxed);
        }
    }
}
