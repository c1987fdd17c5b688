//! Anonymous memory reservations for region-based heaps.
//!
//! A heap reserves one contiguous mapping up front and carves it into
//! fixed-size regions. Regions that end a collection empty can hand their
//! pages back to the OS with [`Mmap::discard`] without giving up the
//! address range.

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// A handle to an anonymous, zero-initialized, read-write memory mapping.
///
/// The mapping is released when this handle is dropped.
pub struct Mmap {
    inner: os::MmapInner,
}

impl Mmap {
    /// Returns a pointer to the start of the mapping.
    #[must_use]
    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Returns the length of the mapping in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the mapping is zero-sized. Never the case for a
    /// mapping created through [`MmapOptions::map_anon`].
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Tells the OS that the contents of `[offset, offset + len)` are no
    /// longer needed.
    ///
    /// The range stays mapped and accessible. Its contents are unspecified
    /// afterwards (zero on Linux). Only whole pages inside the range are
    /// released; partial pages at either end are left untouched.
    ///
    /// # Errors
    ///
    /// Returns an error if the range is out of bounds or the OS rejects
    /// the advice.
    pub fn discard(&self, offset: usize, len: usize) -> io::Result<()> {
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= self.len())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidInput, "discard range out of bounds")
            })?;

        let page = page_size();
        let start = offset.next_multiple_of(page);
        let end = end - end % page;
        if start >= end {
            return Ok(());
        }

        // SAFETY: [start, end) is page aligned and lies inside our mapping.
        unsafe { self.inner.discard(start, end - start) }
    }
}

/// Configuration for creating a mapping.
#[derive(Debug, Clone, Default)]
pub struct MmapOptions {
    len: usize,
    populate: bool,
}

impl MmapOptions {
    /// Creates options with length 0. A length must be set before mapping.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            len: 0,
            populate: false,
        }
    }

    /// Sets the length of the mapping in bytes.
    #[must_use]
    pub const fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// Pre-faults the page tables (`MAP_POPULATE` on Linux, ignored elsewhere).
    #[must_use]
    pub const fn populate(mut self, populate: bool) -> Self {
        self.populate = populate;
        self
    }

    /// Creates the anonymous mapping.
    ///
    /// # Errors
    ///
    /// Returns an error if the length is zero or the OS refuses the mapping.
    pub fn map_anon(&self) -> io::Result<Mmap> {
        if self.len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }

        // SAFETY: a fresh anonymous mapping aliases no existing memory.
        let inner = unsafe { os::MmapInner::map_anon(self.len, self.populate)? };
        Ok(Mmap { inner })
    }
}
