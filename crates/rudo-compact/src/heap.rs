//! The region-based heap.
//!
//! The heap is one anonymous reservation of `num_regions * region_words`
//! words, viewed as atomic words so that collection workers operating on
//! disjoint regions can share it without locks. Addresses are word indices
//! from the start of the reservation. A reference slot holds `0` for null
//! and `addr + 1` otherwise, so address 0 is a valid object address.

use std::sync::atomic::{AtomicU64, Ordering};

use sys_alloc::{Mmap, MmapOptions};

use crate::config::HeapConfig;
use crate::error::HeapError;
use crate::gc::MarkBitmap;
use crate::object::{
    decode_header, encode_header, with_mark, HeapAddr, Klass, KlassDef, KlassId, KlassKind,
    KlassTable, MarkWord, MAX_MARK_VALUE,
};
use crate::region::{HeapRegion, RegionKind};
use crate::roots::{DerivedHandle, RootHandle, RootSet, WeakHandle};

/// Encodes an optional address as a raw reference slot value.
#[must_use]
pub const fn encode_oop(target: Option<HeapAddr>) -> u64 {
    match target {
        Some(addr) => addr as u64 + 1,
        None => 0,
    }
}

/// Decodes a raw reference slot value.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn decode_oop(raw: u64) -> Option<HeapAddr> {
    match raw {
        0 => None,
        raw => Some((raw - 1) as HeapAddr),
    }
}

/// A region-based heap of klass-described objects.
pub struct Heap {
    config: HeapConfig,
    mmap: Mmap,
    heap_words: usize,
    regions: Vec<HeapRegion>,
    bitmap: MarkBitmap,
    klasses: KlassTable,
    roots: RootSet,
    eden_region: Option<usize>,
    old_region: Option<usize>,
    filler_array: KlassId,
    filler_word: KlassId,
    next_hash: AtomicU64,
    total_collections: usize,
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("config", &self.config)
            .field("used_words", &self.used_words())
            .field("klasses", &self.klasses.len())
            .field("total_collections", &self.total_collections)
            .finish_non_exhaustive()
    }
}

impl Heap {
    /// Reserves a heap with the given geometry.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::InvalidGeometry`] for a bad configuration and
    /// [`HeapError::Reserve`] if the OS refuses the reservation.
    pub fn new(config: HeapConfig) -> Result<Self, HeapError> {
        config.validate()?;
        let heap_words = config.heap_words();
        let mmap = MmapOptions::new().len(heap_words * 8).map_anon()?;

        let mut klasses = KlassTable::new();
        let filler_array = klasses.register(&KlassDef::type_array("$filler_array"), None)?;
        let filler_word = klasses.register(&KlassDef::instance("$filler_word"), None)?;

        Ok(Self {
            config,
            mmap,
            heap_words,
            regions: (0..config.num_regions)
                .map(|i| HeapRegion::new(i, config.region_words))
                .collect(),
            bitmap: MarkBitmap::new(heap_words),
            klasses,
            roots: RootSet::new(),
            eden_region: None,
            old_region: None,
            filler_array,
            filler_word,
            next_hash: AtomicU64::new(1),
            total_collections: 0,
        })
    }

    fn words(&self) -> &[AtomicU64] {
        // SAFETY: the mapping is `heap_words * 8` bytes, page aligned,
        // zero-initialized and lives as long as `self`. `AtomicU64` has the
        // layout of `u64`, and every access goes through the atomics.
        unsafe { std::slice::from_raw_parts(self.mmap.ptr().cast::<AtomicU64>(), self.heap_words) }
    }

    /// The geometry this heap was built with.
    #[must_use]
    pub const fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// Total size in words.
    #[must_use]
    pub const fn heap_words(&self) -> usize {
        self.heap_words
    }

    /// Words per region.
    #[must_use]
    pub const fn region_words(&self) -> usize {
        self.config.region_words
    }

    /// Number of regions.
    #[must_use]
    pub fn num_regions(&self) -> usize {
        self.regions.len()
    }

    /// Region `index`.
    #[must_use]
    pub fn region_at(&self, index: usize) -> &HeapRegion {
        &self.regions[index]
    }

    /// All regions in address order.
    #[must_use]
    pub fn regions(&self) -> &[HeapRegion] {
        &self.regions
    }

    /// Index of the region containing `addr`.
    #[must_use]
    pub const fn addr_to_region(&self, addr: HeapAddr) -> usize {
        addr / self.config.region_words
    }

    /// Words allocated across all regions.
    #[must_use]
    pub fn used_words(&self) -> usize {
        self.regions.iter().map(HeapRegion::used).sum()
    }

    /// Number of free regions.
    #[must_use]
    pub fn free_regions(&self) -> usize {
        self.regions.iter().filter(|r| r.is_free()).count()
    }

    /// The shared mark bitmap. Clear outside of a collection.
    #[must_use]
    pub const fn mark_bitmap(&self) -> &MarkBitmap {
        &self.bitmap
    }

    /// Registered klasses.
    #[must_use]
    pub const fn klasses(&self) -> &KlassTable {
        &self.klasses
    }

    pub(crate) fn klasses_mut(&mut self) -> &mut KlassTable {
        &mut self.klasses
    }

    /// Unlinks every klass whose holder is not marked.
    pub(crate) fn unload_dead_klasses(&mut self) -> usize {
        let bitmap = &self.bitmap;
        self.klasses.unload_dead(|holder| bitmap.is_marked(holder))
    }

    pub(crate) const fn roots(&self) -> &RootSet {
        &self.roots
    }

    pub(crate) fn roots_mut(&mut self) -> &mut RootSet {
        &mut self.roots
    }

    /// Full collections run on this heap so far.
    #[must_use]
    pub const fn total_collections(&self) -> usize {
        self.total_collections
    }

    pub(crate) const fn record_collection(&mut self) {
        self.total_collections += 1;
    }

    // ---------------------------------------------------------------------
    // Raw word access
    // ---------------------------------------------------------------------

    /// Reads the word at `addr`.
    #[must_use]
    pub fn load_word(&self, addr: HeapAddr) -> u64 {
        self.words()[addr].load(Ordering::Relaxed)
    }

    /// Writes the word at `addr`.
    pub fn store_word(&self, addr: HeapAddr, value: u64) {
        self.words()[addr].store(value, Ordering::Relaxed);
    }

    pub(crate) fn store_words(&self, dest: HeapAddr, src: &[u64]) {
        for (slot, &value) in self.words()[dest..dest + src.len()].iter().zip(src) {
            slot.store(value, Ordering::Relaxed);
        }
    }

    pub(crate) fn fill_words(&self, start: HeapAddr, len: usize, value: u64) {
        for slot in &self.words()[start..start + len] {
            slot.store(value, Ordering::Relaxed);
        }
    }

    /// Copies `len` words starting at `addr` out of the heap.
    #[must_use]
    pub fn snapshot_words(&self, addr: HeapAddr, len: usize) -> Vec<u64> {
        self.words()[addr..addr + len]
            .iter()
            .map(|w| w.load(Ordering::Relaxed))
            .collect()
    }

    /// Moves `len` words from `src` to `dest`. The ranges may overlap; the
    /// copy direction is chosen so that no source word is overwritten
    /// before it has been read.
    pub fn copy_possibly_overlapping(&self, src: HeapAddr, dest: HeapAddr, len: usize) {
        let words = self.words();
        if dest == src || len == 0 {
            return;
        }
        if dest < src {
            for i in 0..len {
                words[dest + i].store(words[src + i].load(Ordering::Relaxed), Ordering::Relaxed);
            }
        } else {
            for i in (0..len).rev() {
                words[dest + i].store(words[src + i].load(Ordering::Relaxed), Ordering::Relaxed);
            }
        }
    }

    /// Reads the reference stored in slot `slot`.
    #[must_use]
    pub fn load_oop(&self, slot: HeapAddr) -> Option<HeapAddr> {
        decode_oop(self.load_word(slot))
    }

    /// Stores a reference into slot `slot`.
    pub fn store_oop(&self, slot: HeapAddr, target: Option<HeapAddr>) {
        self.store_word(slot, encode_oop(target));
    }

    // ---------------------------------------------------------------------
    // Headers
    // ---------------------------------------------------------------------

    /// Klass id and mark of the object at `obj`.
    #[must_use]
    pub fn header(&self, obj: HeapAddr) -> (KlassId, MarkWord) {
        decode_header(self.load_word(obj))
    }

    /// The mark of the object at `obj`.
    #[must_use]
    pub fn mark_word(&self, obj: HeapAddr) -> MarkWord {
        self.header(obj).1
    }

    pub(crate) fn set_mark(&self, obj: HeapAddr, mark: MarkWord) {
        self.store_word(obj, with_mark(self.load_word(obj), mark));
    }

    pub(crate) fn forward_to(&self, obj: HeapAddr, dest: HeapAddr) {
        self.set_mark(obj, MarkWord::Forwarded(dest));
    }

    pub(crate) fn init_mark(&self, obj: HeapAddr) {
        self.set_mark(obj, MarkWord::INITIAL);
    }

    pub(crate) fn set_klass(&self, obj: HeapAddr, klass: KlassId) {
        let (_, mark) = self.header(obj);
        self.store_word(obj, encode_header(klass, mark));
    }

    /// Calls `f` with the address of every reference slot of `obj`, laid
    /// out as an instance of `klass`.
    pub(crate) fn for_each_oop_slot(&self, obj: HeapAddr, klass: &Klass, mut f: impl FnMut(HeapAddr)) {
        match klass.kind() {
            KlassKind::ObjArray => (0..self.array_length(obj)).for_each(|i| f(obj + 2 + i)),
            KlassKind::TypeArray => {}
            KlassKind::Instance | KlassKind::Reference(_) => {
                klass.oop_offsets().iter().for_each(|&offset| f(obj + offset));
            }
        }
    }

    /// Where the object at `obj` is going, if it has been forwarded.
    #[must_use]
    pub fn forwardee(&self, obj: HeapAddr) -> Option<HeapAddr> {
        self.mark_word(obj).forwardee()
    }

    /// The klass of the object at `obj`.
    #[must_use]
    pub fn klass_of(&self, obj: HeapAddr) -> &Klass {
        self.klasses.get(self.header(obj).0)
    }

    /// Length word of the array at `obj`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn array_length(&self, obj: HeapAddr) -> usize {
        self.load_word(obj + 1) as usize
    }

    /// Size in words of the object at `obj`.
    #[must_use]
    pub fn object_size(&self, obj: HeapAddr) -> usize {
        self.size_given_klass(obj, self.klass_of(obj))
    }

    /// Size the object at `obj` would have as an instance of `klass`.
    #[must_use]
    pub fn size_given_klass(&self, obj: HeapAddr, klass: &Klass) -> usize {
        if klass.kind().is_array() {
            klass.size_for(self.array_length(obj))
        } else {
            klass.size_for(0)
        }
    }

    /// Returns the identity hash of `obj`, installing one on first use.
    /// Returns `None` while the object is locked.
    ///
    /// # Panics
    ///
    /// Panics if called on a forwarded object.
    pub fn identity_hash(&self, obj: HeapAddr) -> Option<u64> {
        match self.mark_word(obj) {
            MarkWord::Default { hash: 0 } => {
                let hash = self.next_hash.fetch_add(1, Ordering::Relaxed) % MAX_MARK_VALUE + 1;
                self.set_mark(obj, MarkWord::Default { hash });
                Some(hash)
            }
            MarkWord::Default { hash } => Some(hash),
            MarkWord::Locked(_) => None,
            MarkWord::Forwarded(_) => panic!("identity_hash on forwarded object {obj:#x}"),
        }
    }

    /// Installs lock state on `obj`, replacing its current mark.
    pub fn lock(&self, obj: HeapAddr, state: u64) {
        self.set_mark(obj, MarkWord::Locked(state & MAX_MARK_VALUE));
    }

    /// Clears lock state on `obj`.
    pub fn unlock(&self, obj: HeapAddr) {
        self.init_mark(obj);
    }

    // ---------------------------------------------------------------------
    // Klasses
    // ---------------------------------------------------------------------

    /// Registers a klass. A klass with a holder is unloaded once the holder
    /// object becomes unreachable.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::InvalidKlass`] if the definition is rejected or
    /// the holder lies outside the heap.
    pub fn register_klass(&mut self, def: &KlassDef, holder: Option<HeapAddr>) -> Result<KlassId, HeapError> {
        if holder.is_some_and(|h| h >= self.heap_words) {
            return Err(HeapError::InvalidKlass(format!(
                "holder of {} lies outside the heap",
                def.name()
            )));
        }
        self.klasses.register(def, holder)
    }

    /// Registers a new version of `old`. Its instances are migrated by the
    /// next full collection.
    ///
    /// # Errors
    ///
    /// See [`KlassTable::redefine`].
    pub fn redefine_klass(&mut self, old: KlassId, def: &KlassDef) -> Result<KlassId, HeapError> {
        self.klasses.redefine(old, def)
    }

    // ---------------------------------------------------------------------
    // Allocation
    // ---------------------------------------------------------------------

    fn loaded_klass(&self, klass: KlassId) -> Result<&Klass, HeapError> {
        self.klasses
            .try_get(klass)
            .ok_or_else(|| HeapError::InvalidKlass(format!("klass {} is not loaded", klass.as_u32())))
    }

    fn init_object(&self, obj: HeapAddr, klass: &Klass, length: usize, words: usize) {
        self.store_word(obj, encode_header(klass.id(), MarkWord::INITIAL));
        let body = if klass.kind().is_array() {
            self.store_word(obj + 1, length as u64);
            2
        } else {
            1
        };
        self.fill_words(obj + body, words - body, 0);
    }

    fn first_free_run(&self, count: usize) -> Option<usize> {
        let mut run = 0;
        for (i, region) in self.regions.iter().enumerate() {
            if region.is_free() && !region.is_pinned() {
                run += 1;
                if run == count {
                    return Some(i + 1 - count);
                }
            } else {
                run = 0;
            }
        }
        None
    }

    fn bump(&self, index: usize, words: usize) -> Option<HeapAddr> {
        let region = &self.regions[index];
        let top = region.top();
        (top + words <= region.end()).then(|| {
            region.set_top(top + words);
            top
        })
    }

    fn allocate_words(&mut self, kind: RegionKind, words: usize) -> Result<HeapAddr, HeapError> {
        if words > self.config.humongous_threshold() {
            return self.allocate_humongous(None, words);
        }

        let current = if kind == RegionKind::Eden {
            self.eden_region
        } else {
            self.old_region
        };
        if let Some(addr) = current.and_then(|idx| self.bump(idx, words)) {
            return Ok(addr);
        }

        let index = self
            .first_free_run(1)
            .ok_or(HeapError::OutOfMemory {
                requested_words: words,
            })?;
        self.regions[index].set_kind(kind);
        if kind == RegionKind::Eden {
            self.eden_region = Some(index);
        } else {
            self.old_region = Some(index);
        }
        self.bump(index, words).ok_or(HeapError::OutOfMemory {
            requested_words: words,
        })
    }

    fn allocate_humongous(&self, at: Option<usize>, words: usize) -> Result<HeapAddr, HeapError> {
        let count = words.div_ceil(self.config.region_words);
        let oom = HeapError::OutOfMemory {
            requested_words: words,
        };
        let first = match at {
            Some(first) => {
                let fits = first + count <= self.regions.len()
                    && self.regions[first..first + count]
                        .iter()
                        .all(|r| r.is_free() && !r.is_pinned());
                if !fits {
                    return Err(oom);
                }
                first
            }
            None => self.first_free_run(count).ok_or(oom)?,
        };

        self.set_humongous_metadata(first, count, words);
        Ok(self.regions[first].bottom())
    }

    /// Marks regions `[first, first + count)` as holding one humongous
    /// object of `words` words starting at the bottom of `first`.
    pub(crate) fn set_humongous_metadata(&self, first: usize, count: usize, words: usize) {
        let obj_end = self.regions[first].bottom() + words;
        for (i, region) in self.regions[first..first + count].iter().enumerate() {
            let kind = if i == 0 {
                RegionKind::StartsHumongous
            } else {
                RegionKind::ContinuesHumongous
            };
            region.set_humongous(kind, first, obj_end.min(region.end()));
        }
    }

    /// Allocates a young object. Objects larger than half a region are
    /// allocated humongous. `length` is ignored for instance klasses.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::OutOfMemory`] when no region can take the
    /// object, or [`HeapError::InvalidKlass`] for an unloaded klass.
    pub fn allocate(&mut self, klass: KlassId, length: usize) -> Result<HeapAddr, HeapError> {
        self.allocate_in(RegionKind::Eden, klass, length)
    }

    /// Allocates an old object.
    ///
    /// # Errors
    ///
    /// See [`Heap::allocate`].
    pub fn allocate_old(&mut self, klass: KlassId, length: usize) -> Result<HeapAddr, HeapError> {
        self.allocate_in(RegionKind::Old, klass, length)
    }

    fn allocate_in(&mut self, kind: RegionKind, klass: KlassId, length: usize) -> Result<HeapAddr, HeapError> {
        let words = self.loaded_klass(klass)?.size_for(length);
        let obj = self.allocate_words(kind, words)?;
        self.init_object(obj, self.klasses.get(klass), length, words);
        Ok(obj)
    }

    /// Bump-allocates an object at the top of region `index`. A free
    /// region becomes an old region. Objects larger than half a region are
    /// placed humongous starting at `index`.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::OutOfMemory`] if the object does not fit there.
    pub fn allocate_in_region(&mut self, index: usize, klass: KlassId, length: usize) -> Result<HeapAddr, HeapError> {
        let words = self.loaded_klass(klass)?.size_for(length);
        let oom = HeapError::OutOfMemory {
            requested_words: words,
        };
        let region = self.regions.get(index).ok_or(HeapError::OutOfMemory {
            requested_words: words,
        })?;

        let obj = if words > self.config.humongous_threshold() {
            self.allocate_humongous(Some(index), words)?
        } else {
            if region.is_humongous() {
                return Err(oom);
            }
            if region.is_free() {
                region.set_kind(RegionKind::Old);
            }
            self.bump(index, words).ok_or(oom)?
        };
        self.init_object(obj, self.klasses.get(klass), length, words);
        Ok(obj)
    }

    /// Pins or unpins region `index`. Objects in pinned regions never move.
    pub fn set_region_pinned(&self, index: usize, pinned: bool) {
        self.regions[index].set_pinned(pinned);
    }

    /// Overwrites `[start, start + words)` with filler objects so that the
    /// range stays parseable.
    pub(crate) fn fill_with_dummy_objects(&self, start: HeapAddr, words: usize) {
        match words {
            0 => {}
            1 => self.store_word(start, encode_header(self.filler_word, MarkWord::INITIAL)),
            _ => {
                self.store_word(start, encode_header(self.filler_array, MarkWord::INITIAL));
                self.store_word(start + 1, (words - 2) as u64);
            }
        }
    }

    // ---------------------------------------------------------------------
    // Field access
    // ---------------------------------------------------------------------

    /// Slot address of the reference field `name` of `obj`.
    #[must_use]
    pub fn field_addr(&self, obj: HeapAddr, name: &str) -> Option<HeapAddr> {
        self.klass_of(obj)
            .field(name)
            .filter(|f| f.is_reference)
            .map(|f| obj + 1 + f.offset / 8)
    }

    /// Slot address of element `index` of the array at `array`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    #[must_use]
    pub fn element_addr(&self, array: HeapAddr, index: usize) -> HeapAddr {
        let len = self.array_length(array);
        assert!(index < len, "index {index} out of bounds for array of length {len}");
        array + 2 + index
    }

    fn check_payload_range(&self, obj: HeapAddr, offset: usize, len: usize) {
        let payload = (self.object_size(obj) - 1) * 8;
        assert!(
            offset + len <= payload,
            "byte range {offset}..{} outside payload of {payload} bytes",
            offset + len
        );
    }

    /// Reads `len` payload bytes of `obj` starting at byte `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the range runs past the object.
    #[must_use]
    pub fn read_bytes(&self, obj: HeapAddr, offset: usize, len: usize) -> Vec<u8> {
        self.check_payload_range(obj, offset, len);
        (offset..offset + len)
            .map(|byte| self.load_word(obj + 1 + byte / 8).to_le_bytes()[byte % 8])
            .collect()
    }

    /// Writes payload bytes of `obj` starting at byte `offset`.
    ///
    /// # Panics
    ///
    /// Panics if the range runs past the object.
    pub fn write_bytes(&self, obj: HeapAddr, offset: usize, bytes: &[u8]) {
        self.check_payload_range(obj, offset, bytes.len());
        for (i, &b) in bytes.iter().enumerate() {
            let byte = offset + i;
            let addr = obj + 1 + byte / 8;
            let mut word = self.load_word(addr).to_le_bytes();
            word[byte % 8] = b;
            self.store_word(addr, u64::from_le_bytes(word));
        }
    }

    /// Parses region `index` from bottom to top and returns the object
    /// start addresses. Continues-humongous regions have none.
    ///
    /// Only meaningful outside a collection, when every object below top
    /// has a loaded klass.
    #[must_use]
    pub fn object_starts(&self, index: usize) -> Vec<HeapAddr> {
        let region = &self.regions[index];
        match region.kind() {
            RegionKind::Free | RegionKind::ContinuesHumongous => Vec::new(),
            RegionKind::StartsHumongous => vec![region.bottom()],
            _ => {
                let mut starts = Vec::new();
                let mut cur = region.bottom();
                while cur < region.top() {
                    starts.push(cur);
                    cur += self.object_size(cur);
                }
                starts
            }
        }
    }

    // ---------------------------------------------------------------------
    // Roots
    // ---------------------------------------------------------------------

    /// Adds a strong root.
    pub fn add_root(&mut self, target: Option<HeapAddr>) -> RootHandle {
        self.roots.add_strong(target)
    }

    /// Current target of a strong root.
    #[must_use]
    pub fn root(&self, handle: RootHandle) -> Option<HeapAddr> {
        self.roots.strong(handle)
    }

    /// Retargets a strong root.
    pub fn set_root(&self, handle: RootHandle, target: Option<HeapAddr>) {
        self.roots.set_strong(handle, target);
    }

    /// Adds a weak root; it is cleared once its target dies.
    pub fn add_weak_root(&mut self, target: Option<HeapAddr>) -> WeakHandle {
        self.roots.add_weak(target)
    }

    /// Current target of a weak root.
    #[must_use]
    pub fn weak_root(&self, handle: WeakHandle) -> Option<HeapAddr> {
        self.roots.weak(handle)
    }

    /// Adds an interior pointer into the object held by `base`.
    ///
    /// # Panics
    ///
    /// Panics if `base` is null.
    pub fn add_derived_root(&mut self, base: RootHandle, interior: HeapAddr) -> DerivedHandle {
        assert!(self.root(base).is_some(), "derived root needs a non-null base");
        self.roots.add_derived(base, interior)
    }

    /// Current value of a derived root.
    #[must_use]
    pub fn derived_root(&self, handle: DerivedHandle) -> Option<HeapAddr> {
        self.roots.derived(handle)
    }

    /// Reference objects whose referent was cleared, oldest first.
    #[must_use]
    pub fn pending_references(&self) -> Vec<HeapAddr> {
        self.roots.pending()
    }

    /// Drains the pending reference list.
    pub fn take_pending_references(&mut self) -> Vec<HeapAddr> {
        self.roots.take_pending()
    }

    // ---------------------------------------------------------------------
    // Collection hooks
    // ---------------------------------------------------------------------

    /// Retires the allocation regions and snapshots which regions are in
    /// use. The snapshot is handed back to
    /// [`prepare_heap_for_mutators`](Self::prepare_heap_for_mutators).
    pub(crate) fn prepare_heap_for_full_collection(&mut self) -> Vec<bool> {
        self.eden_region = None;
        self.old_region = None;
        self.regions.iter().map(|r| !r.is_free()).collect()
    }

    /// Rebuilds region kinds after compaction. Survivors end up old, empty
    /// regions become free and have their pages discarded. Returns the
    /// number of regions freed by the collection.
    pub(crate) fn prepare_heap_for_mutators(&mut self, used_before: &[bool]) -> usize {
        let mut freed = 0;
        for (region, &was_used) in self.regions.iter().zip(used_before) {
            if !region.is_humongous() && !region.is_pinned() {
                if region.is_empty() {
                    region.set_free();
                } else {
                    region.set_kind(RegionKind::Old);
                }
            }
            region.set_compaction_top(region.bottom());

            if region.is_free() && was_used {
                freed += 1;
                self.discard_region(region);
            }
        }
        freed
    }

    fn discard_region(&self, region: &HeapRegion) {
        if let Err(_err) = self.mmap.discard(region.bottom() * 8, self.config.region_words * 8) {
            #[cfg(feature = "tracing")]
            tracing::warn!(region = region.index(), error = %_err, "discard_failed");
        }
    }
}
