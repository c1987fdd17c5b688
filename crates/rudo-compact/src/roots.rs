//! Root slots owned by the mutator side.
//!
//! Slots are atomic so the collector's workers can scan and adjust them
//! while sharing the heap. Each slot stores a raw reference (0 for null).

use std::sync::atomic::{AtomicU64, Ordering};

use crate::heap::{decode_oop, encode_oop};
use crate::object::HeapAddr;

/// Handle to a strong root slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RootHandle(pub(crate) usize);

/// Handle to a weak root slot, cleared when its target dies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WeakHandle(pub(crate) usize);

/// Handle to a derived root: an interior pointer tied to a strong root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DerivedHandle(pub(crate) usize);

/// An interior pointer that follows its base object when it moves.
#[derive(Debug)]
pub struct DerivedRoot {
    pub(crate) base: RootHandle,
    pub(crate) value: AtomicU64,
}

impl DerivedRoot {
    /// The strong root holding the base object.
    #[must_use]
    pub const fn base(&self) -> RootHandle {
        self.base
    }

    /// Current interior address.
    #[must_use]
    pub fn value(&self) -> Option<HeapAddr> {
        decode_oop(self.value.load(Ordering::Relaxed))
    }
}

/// Every root the collector scans or adjusts.
#[derive(Debug, Default)]
pub struct RootSet {
    strong: Vec<AtomicU64>,
    weak: Vec<AtomicU64>,
    pending: Vec<AtomicU64>,
    derived: Vec<DerivedRoot>,
}

fn load(slots: &[AtomicU64], index: usize) -> Option<HeapAddr> {
    decode_oop(slots[index].load(Ordering::Relaxed))
}

impl RootSet {
    /// Creates an empty root set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_strong(&mut self, target: Option<HeapAddr>) -> RootHandle {
        self.strong.push(AtomicU64::new(encode_oop(target)));
        RootHandle(self.strong.len() - 1)
    }

    pub(crate) fn strong(&self, handle: RootHandle) -> Option<HeapAddr> {
        load(&self.strong, handle.0)
    }

    pub(crate) fn set_strong(&self, handle: RootHandle, target: Option<HeapAddr>) {
        self.strong[handle.0].store(encode_oop(target), Ordering::Relaxed);
    }

    pub(crate) fn add_weak(&mut self, target: Option<HeapAddr>) -> WeakHandle {
        self.weak.push(AtomicU64::new(encode_oop(target)));
        WeakHandle(self.weak.len() - 1)
    }

    pub(crate) fn weak(&self, handle: WeakHandle) -> Option<HeapAddr> {
        load(&self.weak, handle.0)
    }

    pub(crate) fn add_derived(&mut self, base: RootHandle, interior: HeapAddr) -> DerivedHandle {
        self.derived.push(DerivedRoot {
            base,
            value: AtomicU64::new(encode_oop(Some(interior))),
        });
        DerivedHandle(self.derived.len() - 1)
    }

    pub(crate) fn derived(&self, handle: DerivedHandle) -> Option<HeapAddr> {
        self.derived[handle.0].value()
    }

    pub(crate) fn push_pending(&mut self, reference: HeapAddr) {
        self.pending.push(AtomicU64::new(encode_oop(Some(reference))));
    }

    pub(crate) fn pending(&self) -> Vec<HeapAddr> {
        self.pending
            .iter()
            .filter_map(|slot| decode_oop(slot.load(Ordering::Relaxed)))
            .collect()
    }

    pub(crate) fn take_pending(&mut self) -> Vec<HeapAddr> {
        let pending = self.pending();
        self.pending.clear();
        pending
    }

    /// Strong slots, scanned in chunks by the marking workers.
    pub(crate) fn strong_slots(&self) -> &[AtomicU64] {
        &self.strong
    }

    pub(crate) fn weak_slots(&self) -> &[AtomicU64] {
        &self.weak
    }

    /// Reference objects enqueued by earlier collections.
    pub(crate) fn pending_slots(&self) -> &[AtomicU64] {
        &self.pending
    }

    pub(crate) fn derived_roots(&self) -> &[DerivedRoot] {
        &self.derived
    }

    /// Number of strong roots.
    #[must_use]
    pub fn strong_len(&self) -> usize {
        self.strong.len()
    }

    /// Number of weak roots.
    #[must_use]
    pub fn weak_len(&self) -> usize {
        self.weak.len()
    }
}
