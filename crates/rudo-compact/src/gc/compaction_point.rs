//! Per-worker bump-pointer cursor over a queue of destination regions.
//!
//! Phase 2 appends each region a worker prepares to its compaction point
//! and forwards the region's live objects to the current compaction top.
//! When an object does not fit, the point saves the top into the current
//! region and moves on to the next queued region. Phase 4 then compacts
//! exactly the queued regions, in queue order.

use crate::heap::Heap;
use crate::object::HeapAddr;

/// A worker's compaction queue and cursor.
#[derive(Debug, Default)]
pub struct CompactionPoint {
    regions: Vec<usize>,
    cursor: usize,
    current: Option<usize>,
    compaction_top: HeapAddr,
    rescued_oops: Vec<HeapAddr>,
    last_rescued_oop: usize,
    rescued_values: Vec<Box<[u64]>>,
}

impl CompactionPoint {
    /// Creates an empty compaction point.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` once a current region has been set.
    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.current.is_some()
    }

    /// Makes `region` current, starting at its compaction top. `region`
    /// must be, or become, the first queued region.
    pub fn initialize(&mut self, heap: &Heap, region: usize) {
        self.current = Some(region);
        self.cursor = 0;
        self.compaction_top = heap.region_at(region).compaction_top();
    }

    /// Appends `region` to the queue.
    pub fn add(&mut self, region: usize) {
        self.regions.push(region);
    }

    /// Removes and returns the last queued region.
    pub fn remove_last(&mut self) -> Option<usize> {
        self.regions.pop()
    }

    /// Returns `true` if any region is queued.
    #[must_use]
    pub fn has_regions(&self) -> bool {
        !self.regions.is_empty()
    }

    /// The queued regions in compaction order.
    #[must_use]
    pub fn regions(&self) -> &[usize] {
        &self.regions
    }

    /// The region objects are currently forwarded into.
    #[must_use]
    pub const fn current_region(&self) -> Option<usize> {
        self.current
    }

    /// Next free address in the current region.
    #[must_use]
    pub const fn compaction_top(&self) -> HeapAddr {
        self.compaction_top
    }

    fn current_or_panic(&self) -> usize {
        match self.current {
            Some(region) => region,
            None => panic!("compaction point used before initialization"),
        }
    }

    fn object_will_fit(&self, heap: &Heap, size: usize) -> bool {
        let end = heap.region_at(self.current_or_panic()).end();
        size <= end - self.compaction_top
    }

    fn has_next_region(&self) -> bool {
        self.cursor + 1 < self.regions.len()
    }

    fn switch_region(&mut self, heap: &Heap, size: usize) {
        let current = self.current_or_panic();
        heap.region_at(current).set_compaction_top(self.compaction_top);

        self.cursor += 1;
        let Some(&next) = self.regions.get(self.cursor) else {
            panic!(
                "no compaction region left for a {size}-word object after region {current} \
                 ({} regions queued)",
                self.regions.len()
            );
        };
        self.current = Some(next);
        self.compaction_top = heap.region_at(next).compaction_top();
    }

    fn install(&mut self, heap: &Heap, obj: HeapAddr, size: usize, force: bool) {
        if obj != self.compaction_top || force {
            heap.forward_to(obj, self.compaction_top);
        } else if heap.mark_word(obj).is_forwarded() {
            // Staying put but carrying a stale forwarding record from an
            // earlier preparation.
            heap.init_mark(obj);
        }
        self.compaction_top += size;
    }

    /// Forwards `obj` of `size` words to the compaction top, switching
    /// regions until it fits. An object that stays in place is left
    /// unforwarded.
    ///
    /// # Panics
    ///
    /// Panics if the queue runs out of regions.
    pub fn forward(&mut self, heap: &Heap, obj: HeapAddr, size: usize) {
        while !self.object_will_fit(heap, size) {
            self.switch_region(heap, size);
        }
        self.install(heap, obj, size, false);
    }

    /// Returns the address a `size`-word object would be forwarded to, or
    /// `None` if no queued region has room for it.
    pub fn forward_compact_top(&mut self, heap: &Heap, size: usize) -> Option<HeapAddr> {
        while !self.object_will_fit(heap, size) {
            if !self.has_next_region() {
                return None;
            }
            self.switch_region(heap, size);
        }
        Some(self.compaction_top)
    }

    /// Forwards `obj` at the current top without switching regions. With
    /// `force`, an object that stays in place is forwarded to itself so the
    /// compaction phase still visits it.
    pub fn forward_redefining(&mut self, heap: &Heap, obj: HeapAddr, size: usize, force: bool) {
        debug_assert!(self.object_will_fit(heap, size));
        self.install(heap, obj, size, force);
    }

    /// Saves the compaction top into the current region.
    pub fn update(&self, heap: &Heap) {
        if let Some(current) = self.current {
            heap.region_at(current).set_compaction_top(self.compaction_top);
        }
    }

    /// Returns `true` if the current region is not the last queued one,
    /// i.e. at least one queued region ends up empty.
    #[must_use]
    pub fn has_free_tail(&self) -> bool {
        self.has_regions() && self.has_next_region()
    }

    /// Records an object that must be copied aside during compaction.
    pub fn push_rescued(&mut self, obj: HeapAddr) {
        self.rescued_oops.push(obj);
    }

    /// Objects routed through rescue buffers, in scan order.
    #[must_use]
    pub fn rescued_oops(&self) -> &[HeapAddr] {
        &self.rescued_oops
    }

    /// Number of rescued objects that already have a destination.
    #[must_use]
    pub const fn last_rescued_oop(&self) -> usize {
        self.last_rescued_oop
    }

    /// Returns `true` while some rescued object has no destination yet.
    #[must_use]
    pub fn has_unforwarded_rescued(&self) -> bool {
        self.last_rescued_oop < self.rescued_oops.len()
    }

    /// Forwards as many pending rescued objects as fit in the remaining
    /// queue. Rescued objects are always forwarded, even in place.
    pub fn forward_rescued(&mut self, heap: &Heap) {
        let mut i = self.last_rescued_oop;
        while let Some(&obj) = self.rescued_oops.get(i) {
            let klass = heap.klass_of(obj);
            let size = match klass.new_version() {
                Some(new_version) => heap.size_given_klass(obj, heap.klasses().get(new_version)),
                None => heap.size_given_klass(obj, klass),
            };
            if self.forward_compact_top(heap, size).is_none() {
                break;
            }
            self.forward_redefining(heap, obj, size, true);
            i += 1;
        }
        self.last_rescued_oop = i;
    }

    pub(crate) fn push_rescued_value(&mut self, value: Box<[u64]>) {
        self.rescued_values.push(value);
    }

    pub(crate) fn take_rescued_values(&mut self) -> Vec<Box<[u64]>> {
        std::mem::take(&mut self.rescued_values)
    }

    /// Number of rescue buffers currently held.
    #[must_use]
    pub fn rescued_values_len(&self) -> usize {
        self.rescued_values.len()
    }

    /// Drops the rescue bookkeeping once every buffer was replayed.
    ///
    /// # Panics
    ///
    /// Panics if a rescued object never got a destination or a buffer was
    /// never replayed.
    pub(crate) fn clear_rescued(&mut self) {
        assert!(
            !self.has_unforwarded_rescued(),
            "{} rescued objects were never forwarded",
            self.rescued_oops.len() - self.last_rescued_oop
        );
        assert_eq!(
            self.rescued_values_len(),
            0,
            "rescue buffers were never replayed"
        );
        self.rescued_oops.clear();
        self.last_rescued_oop = 0;
    }
}
