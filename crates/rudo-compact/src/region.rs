//! Heap regions and per-phase region claiming.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};

use crate::object::HeapAddr;

/// What a region currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RegionKind {
    /// Unused.
    Free = 0,
    /// Young allocation region.
    Eden = 1,
    /// Young region holding objects that survived a young collection.
    Survivor = 2,
    /// Old region.
    Old = 3,
    /// First region of a humongous object.
    StartsHumongous = 4,
    /// Any later region of a humongous object.
    ContinuesHumongous = 5,
}

impl RegionKind {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Free,
            1 => Self::Eden,
            2 => Self::Survivor,
            3 => Self::Old,
            4 => Self::StartsHumongous,
            _ => Self::ContinuesHumongous,
        }
    }

    /// Returns `true` for both humongous kinds.
    #[must_use]
    pub const fn is_humongous(self) -> bool {
        matches!(self, Self::StartsHumongous | Self::ContinuesHumongous)
    }

    /// The generation regions of this kind belong to.
    #[must_use]
    pub const fn generation(self) -> Generation {
        match self {
            Self::Eden | Self::Survivor => Generation::Young,
            _ => Generation::Old,
        }
    }
}

/// Young or old.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Generation {
    /// Eden and survivor regions.
    Young,
    /// Everything else.
    Old,
}

/// A fixed-size slice of the heap.
///
/// Metadata is atomic so workers can update the regions they own while
/// sharing the heap. Ownership is handed out per phase by a
/// [`HeapRegionClaimer`] or by the compaction queues built in phase 2.
#[derive(Debug)]
pub struct HeapRegion {
    index: usize,
    bottom: HeapAddr,
    end: HeapAddr,
    kind: AtomicU8,
    pinned: AtomicBool,
    top: AtomicUsize,
    compaction_top: AtomicUsize,
    processing_order: AtomicUsize,
    humongous_start: AtomicUsize,
}

impl HeapRegion {
    pub(crate) const fn new(index: usize, region_words: usize) -> Self {
        let bottom = index * region_words;
        Self {
            index,
            bottom,
            end: bottom + region_words,
            kind: AtomicU8::new(RegionKind::Free as u8),
            pinned: AtomicBool::new(false),
            top: AtomicUsize::new(bottom),
            compaction_top: AtomicUsize::new(bottom),
            processing_order: AtomicUsize::new(0),
            humongous_start: AtomicUsize::new(index),
        }
    }

    /// Index of this region in the heap.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// First word of the region.
    #[must_use]
    pub const fn bottom(&self) -> HeapAddr {
        self.bottom
    }

    /// One past the last word of the region.
    #[must_use]
    pub const fn end(&self) -> HeapAddr {
        self.end
    }

    /// Returns `true` if `addr` lies inside this region.
    #[must_use]
    pub const fn contains(&self, addr: HeapAddr) -> bool {
        self.bottom <= addr && addr < self.end
    }

    /// Current kind.
    #[must_use]
    pub fn kind(&self) -> RegionKind {
        RegionKind::from_u8(self.kind.load(Ordering::Relaxed))
    }

    pub(crate) fn set_kind(&self, kind: RegionKind) {
        self.kind.store(kind as u8, Ordering::Relaxed);
    }

    /// Returns `true` if the region is free.
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.kind() == RegionKind::Free
    }

    /// Returns `true` if the region is part of a humongous object.
    #[must_use]
    pub fn is_humongous(&self) -> bool {
        self.kind().is_humongous()
    }

    /// Pinned regions are never compacted; their objects never move.
    #[must_use]
    pub fn is_pinned(&self) -> bool {
        self.pinned.load(Ordering::Relaxed)
    }

    pub(crate) fn set_pinned(&self, pinned: bool) {
        self.pinned.store(pinned, Ordering::Relaxed);
    }

    /// First word past the allocated objects.
    #[must_use]
    pub fn top(&self) -> HeapAddr {
        self.top.load(Ordering::Relaxed)
    }

    pub(crate) fn set_top(&self, top: HeapAddr) {
        debug_assert!(
            self.bottom <= top && top <= self.end,
            "top {top:#x} outside region {}",
            self.index
        );
        self.top.store(top, Ordering::Relaxed);
    }

    /// Words in use.
    #[must_use]
    pub fn used(&self) -> usize {
        self.top() - self.bottom
    }

    /// Returns `true` if nothing is allocated in the region.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.top() == self.bottom
    }

    /// Planned top after compaction.
    #[must_use]
    pub fn compaction_top(&self) -> HeapAddr {
        self.compaction_top.load(Ordering::Relaxed)
    }

    pub(crate) fn set_compaction_top(&self, top: HeapAddr) {
        assert!(
            self.bottom <= top && top <= self.end,
            "compaction top {top:#x} outside region {} [{:#x}, {:#x})",
            self.index,
            self.bottom,
            self.end
        );
        self.compaction_top.store(top, Ordering::Relaxed);
    }

    /// Order in which the owning worker prepared this region in phase 2.
    #[must_use]
    pub fn processing_order(&self) -> usize {
        self.processing_order.load(Ordering::Relaxed)
    }

    pub(crate) fn set_processing_order(&self, order: usize) {
        self.processing_order.store(order, Ordering::Relaxed);
    }

    /// Index of the first region of the humongous object covering this one.
    #[must_use]
    pub fn humongous_start(&self) -> usize {
        self.humongous_start.load(Ordering::Relaxed)
    }

    pub(crate) fn set_humongous(&self, kind: RegionKind, start: usize, top: HeapAddr) {
        debug_assert!(kind.is_humongous());
        self.set_kind(kind);
        self.humongous_start.store(start, Ordering::Relaxed);
        self.set_top(top);
        self.compaction_top.store(self.bottom, Ordering::Relaxed);
    }

    /// Resets the region to free.
    pub(crate) fn set_free(&self) {
        self.set_kind(RegionKind::Free);
        self.humongous_start.store(self.index, Ordering::Relaxed);
        self.top.store(self.bottom, Ordering::Relaxed);
        self.compaction_top.store(self.bottom, Ordering::Relaxed);
    }

    /// Installs the planned top once all objects of the region have moved.
    pub(crate) fn complete_compaction(&self) {
        self.set_top(self.compaction_top());
    }
}

/// Hands out each region to exactly one worker per phase.
#[derive(Debug)]
pub struct HeapRegionClaimer {
    num_workers: usize,
    claims: Box<[AtomicBool]>,
}

impl HeapRegionClaimer {
    /// Creates a claimer over `num_regions` regions for `num_workers` workers.
    #[must_use]
    pub fn new(num_regions: usize, num_workers: usize) -> Self {
        Self {
            num_workers: num_workers.max(1),
            claims: (0..num_regions).map(|_| AtomicBool::new(false)).collect(),
        }
    }

    /// Tries to claim region `index`. Returns `true` for exactly one caller.
    pub fn claim_region(&self, index: usize) -> bool {
        self.claims[index]
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Returns `true` if region `index` has been claimed.
    #[must_use]
    pub fn is_region_claimed(&self, index: usize) -> bool {
        self.claims[index].load(Ordering::Acquire)
    }

    /// Where `worker_id` starts iterating so that workers spread out.
    #[must_use]
    pub fn offset_for_worker(&self, worker_id: usize) -> usize {
        self.claims.len() * worker_id / self.num_workers
    }

    /// Visits the regions of `order` this worker manages to claim, starting
    /// at the front for every worker.
    pub fn par_iterate_from_start(&self, order: &[usize], mut f: impl FnMut(usize)) {
        for &index in order {
            if self.claim_region(index) {
                f(index);
            }
        }
    }

    /// Visits every region this worker manages to claim, starting at a
    /// worker-specific offset and wrapping around.
    pub fn par_iterate_from_worker_offset(&self, worker_id: usize, mut f: impl FnMut(usize)) {
        let len = self.claims.len();
        let start = self.offset_for_worker(worker_id);
        for i in 0..len {
            let index = (start + i) % len;
            if self.claim_region(index) {
                f(index);
            }
        }
    }
}
