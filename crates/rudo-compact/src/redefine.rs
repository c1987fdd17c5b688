//! Redefinition-aware compaction helpers.
//!
//! When a klass gets a new version, its instances are migrated during the
//! next full collection. Each migrated object is rewritten through a
//! [`CopyProgram`] computed once per klass pair, and objects whose new
//! extent would overrun bytes not yet read are rescued (copied aside and
//! replayed once compaction is done).

use crate::heap::Heap;
use crate::object::{encode_header, HeapAddr, Klass, MarkWord};
use crate::region::Generation;

/// One instruction of a [`CopyProgram`]. The destination offset is
/// implicit: segments fill the destination payload in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopySegment {
    /// Copy `len` bytes from `src_offset` in the old payload.
    Copy {
        /// Number of bytes.
        len: usize,
        /// Byte offset into the old payload.
        src_offset: usize,
    },
    /// Zero-fill `len` bytes.
    Zero {
        /// Number of bytes.
        len: usize,
    },
}

impl CopySegment {
    const fn len(self) -> usize {
        match self {
            Self::Copy { len, .. } | Self::Zero { len } => len,
        }
    }
}

/// Field remapping from an old klass layout to a new one.
///
/// Retained fields (same name, size and reference-ness) are copied,
/// everything else in the new layout is zeroed, and bytes past the last
/// segment up to the end of the destination are zero padding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyProgram {
    segments: Vec<CopySegment>,
}

impl CopyProgram {
    /// Builds a program from raw segments, merging adjacent ones.
    #[must_use]
    pub fn from_segments(segments: impl IntoIterator<Item = CopySegment>) -> Self {
        let mut merged: Vec<CopySegment> = Vec::new();
        for seg in segments {
            if seg.len() == 0 {
                continue;
            }
            match (merged.last_mut(), seg) {
                (
                    Some(CopySegment::Copy { len, src_offset }),
                    CopySegment::Copy {
                        len: next_len,
                        src_offset: next_offset,
                    },
                ) if *src_offset + *len == next_offset => *len += next_len,
                (Some(CopySegment::Zero { len }), CopySegment::Zero { len: next_len }) => {
                    *len += next_len;
                }
                _ => merged.push(seg),
            }
        }
        Self { segments: merged }
    }

    /// Computes the program migrating instances of `old` to `new`.
    ///
    /// Returns `None` when both layouts are byte-identical, in which case a
    /// raw word copy plus a klass switch is enough.
    #[must_use]
    pub fn compute(old: &Klass, new: &Klass) -> Option<Self> {
        let mut segments = Vec::with_capacity(new.fields().len() * 2);
        let mut cursor = 0;
        for field in new.fields() {
            if field.offset > cursor {
                segments.push(CopySegment::Zero {
                    len: field.offset - cursor,
                });
            }
            let retained = old.field(&field.name).filter(|prev| {
                prev.size == field.size && prev.is_reference == field.is_reference
            });
            segments.push(match retained {
                Some(prev) => CopySegment::Copy {
                    len: field.size,
                    src_offset: prev.offset,
                },
                None => CopySegment::Zero { len: field.size },
            });
            cursor = field.offset + field.size;
        }

        let program = Self::from_segments(segments);
        let identity = old.payload_bytes() == new.payload_bytes()
            && match program.segments.as_slice() {
                [] => true,
                [CopySegment::Copy { len, src_offset: 0 }] => *len == new.payload_bytes(),
                _ => false,
            };
        (!identity).then_some(program)
    }

    /// The merged segments.
    #[must_use]
    pub fn segments(&self) -> &[CopySegment] {
        &self.segments
    }

    /// Number of destination bytes the segments cover.
    #[must_use]
    pub fn covered_len(&self) -> usize {
        self.segments.iter().map(|s| s.len()).sum()
    }

    /// Replays the program from `src` into `dst`. Every byte of `dst` is
    /// written; bytes past the last segment are zeroed.
    ///
    /// # Panics
    ///
    /// Panics if a segment reads past `src` or writes past `dst`.
    pub fn apply(&self, src: &[u8], dst: &mut [u8]) {
        assert!(
            self.covered_len() <= dst.len(),
            "copy program covers {} bytes but destination has {}",
            self.covered_len(),
            dst.len()
        );
        let mut pos = 0;
        for seg in &self.segments {
            match *seg {
                CopySegment::Copy { len, src_offset } => {
                    dst[pos..pos + len].copy_from_slice(&src[src_offset..src_offset + len]);
                    pos += len;
                }
                CopySegment::Zero { len } => {
                    dst[pos..pos + len].fill(0);
                    pos += len;
                }
            }
        }
        dst[pos..].fill(0);
    }
}

fn words_to_bytes(words: &[u64]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

fn bytes_to_words(bytes: &[u8]) -> impl Iterator<Item = u64> + '_ {
    bytes.chunks_exact(8).map(|chunk| {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        u64::from_le_bytes(word)
    })
}

/// Writes the migrated form of `src` (a full copy of an old-version object,
/// header included) to `dest` as an instance of `new_klass`.
///
/// The destination header gets the new klass and an initial mark.
pub(crate) fn write_migrated(heap: &Heap, src: &[u64], dest: HeapAddr, new_klass: &Klass) {
    let header = encode_header(new_klass.id(), MarkWord::INITIAL);
    match new_klass.update_information() {
        None => {
            heap.store_words(dest, src);
            heap.store_word(dest, header);
        }
        Some(program) => {
            let new_size = new_klass.size_for(0);
            let old_payload = words_to_bytes(&src[1..]);
            let mut new_payload = vec![0u8; (new_size - 1) * 8];
            program.apply(&old_payload, &mut new_payload);

            heap.store_word(dest, header);
            for (i, word) in bytes_to_words(&new_payload).enumerate() {
                heap.store_word(dest + 1 + i, word);
            }
        }
    }
}

/// Rewrites the object at `old` into its new-version layout at `dest`.
///
/// The old object is read in full before the destination is written, so
/// `dest` may alias the old extent.
///
/// # Panics
///
/// Panics if the klass of `old` has no pending new version.
pub fn update_fields(heap: &Heap, old: HeapAddr, dest: HeapAddr) {
    let klass = heap.klass_of(old);
    let Some(new_version) = klass.new_version() else {
        panic!("update_fields on {old:#x} whose klass {} is not redefined", klass.name());
    };
    let scratch = heap.snapshot_words(old, heap.object_size(old));
    write_migrated(heap, &scratch, dest, heap.klasses().get(new_version));
}

/// Where a compaction source or destination lives: its generation and the
/// order in which its region was prepared by the owning worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactionSpace {
    /// Generation of the region before the collection.
    pub generation: Generation,
    /// Worker-local processing order of the region.
    pub order: usize,
}

/// Decides whether moving an object from `old_addr` to `new_addr` has to go
/// through a rescue buffer.
///
/// `new_size` is `None` for objects whose klass is not being redefined;
/// those never grow and never need rescuing.
#[must_use]
pub fn must_rescue(
    old_addr: HeapAddr,
    old_size: usize,
    new_addr: HeapAddr,
    new_size: Option<usize>,
    from: CompactionSpace,
    to: CompactionSpace,
) -> bool {
    let Some(new_size) = new_size else {
        return false;
    };

    if from.generation != to.generation {
        // The young generation is abandoned wholesale, so landing in the old
        // generation never clobbers anything unread.
        return from.generation == Generation::Old;
    }

    match from.order.cmp(&to.order) {
        std::cmp::Ordering::Greater => false,
        std::cmp::Ordering::Less => true,
        std::cmp::Ordering::Equal => old_addr + old_size < new_addr + new_size,
    }
}
