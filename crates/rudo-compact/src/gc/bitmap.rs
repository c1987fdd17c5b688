//! Mark bitmap over the whole heap.
//!
//! One bit per heap word; an object is marked by setting the bit of its
//! header word. Bits are set in parallel during marking and cleared one
//! object at a time during compaction, so a bitmap that is clear at the end
//! of a collection is clear without a bulk pass.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::object::HeapAddr;

/// A heap-wide mark bitmap.
///
/// # Example
///
/// ```
/// use rudo_compact::gc::MarkBitmap;
///
/// let bitmap = MarkBitmap::new(512);
/// assert!(bitmap.par_mark(10));
/// assert!(!bitmap.par_mark(10));
/// assert_eq!(bitmap.next_marked(0, 512), Some(10));
/// bitmap.clear(10);
/// assert!(bitmap.is_clear_range(0, 512));
/// ```
#[derive(Debug)]
pub struct MarkBitmap {
    bits: Vec<AtomicU64>,
    capacity: usize,
    marked_count: AtomicUsize,
}

impl MarkBitmap {
    /// Creates a bitmap covering `capacity` heap words.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let words = capacity.div_ceil(64);
        Self {
            bits: (0..words).map(|_| AtomicU64::new(0)).collect(),
            capacity,
            marked_count: AtomicUsize::new(0),
        }
    }

    /// Number of heap words covered.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of bits currently set.
    #[must_use]
    pub fn marked_count(&self) -> usize {
        self.marked_count.load(Ordering::Relaxed)
    }

    /// Marks `addr`. Returns `true` if this call set the bit.
    pub fn par_mark(&self, addr: HeapAddr) -> bool {
        debug_assert!(addr < self.capacity, "mark {addr:#x} out of bounds");
        let mask = 1u64 << (addr % 64);
        let prev = self.bits[addr / 64].fetch_or(mask, Ordering::Relaxed);
        let newly = prev & mask == 0;
        if newly {
            self.marked_count.fetch_add(1, Ordering::Relaxed);
        }
        newly
    }

    /// Returns `true` if `addr` is marked.
    #[must_use]
    pub fn is_marked(&self, addr: HeapAddr) -> bool {
        (self.bits[addr / 64].load(Ordering::Relaxed) >> (addr % 64)) & 1 != 0
    }

    /// Clears the bit of `addr`.
    pub fn clear(&self, addr: HeapAddr) {
        let mask = 1u64 << (addr % 64);
        let prev = self.bits[addr / 64].fetch_and(!mask, Ordering::Relaxed);
        if prev & mask != 0 {
            self.marked_count.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Returns the first marked address in `[from, limit)`.
    #[must_use]
    pub fn next_marked(&self, from: HeapAddr, limit: HeapAddr) -> Option<HeapAddr> {
        let limit = limit.min(self.capacity);
        let mut addr = from;
        while addr < limit {
            let word = self.bits[addr / 64].load(Ordering::Relaxed) >> (addr % 64);
            if word != 0 {
                let found = addr + word.trailing_zeros() as usize;
                return (found < limit).then_some(found);
            }
            addr = (addr / 64 + 1) * 64;
        }
        None
    }

    /// Returns `true` if no bit in `[start, end)` is set.
    #[must_use]
    pub fn is_clear_range(&self, start: HeapAddr, end: HeapAddr) -> bool {
        self.next_marked(start, end).is_none()
    }

    /// Number of set bits in `[start, end)`.
    #[must_use]
    pub fn count_marked_range(&self, start: HeapAddr, end: HeapAddr) -> usize {
        let mut count = 0;
        let mut cur = start;
        while let Some(addr) = self.next_marked(cur, end) {
            count += 1;
            cur = addr + 1;
        }
        count
    }

    /// Clears every bit in `[start, end)`.
    pub fn clear_range(&self, start: HeapAddr, end: HeapAddr) {
        let mut cur = start;
        while let Some(addr) = self.next_marked(cur, end) {
            self.clear(addr);
            cur = addr + 1;
        }
    }
}
