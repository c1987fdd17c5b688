//! Heap geometry and full collection tuning.

use std::num::NonZeroUsize;

use crate::error::HeapError;

/// Get the number of CPUs available for collection workers.
#[must_use]
pub fn available_parallelism() -> usize {
    std::thread::available_parallelism().map_or(1, NonZeroUsize::get)
}

/// Geometry of a [`Heap`](crate::Heap).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeapConfig {
    /// Words per region. Must be a power of two and at least 64.
    pub region_words: usize,
    /// Number of regions.
    pub num_regions: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            region_words: 1 << 16,
            num_regions: 64,
        }
    }
}

impl HeapConfig {
    /// Largest number of words a heap may span; forwarding addresses have
    /// to fit in a mark word.
    pub const MAX_HEAP_WORDS: usize = 1 << 36;

    /// Creates a configuration.
    #[must_use]
    pub const fn new(region_words: usize, num_regions: usize) -> Self {
        Self {
            region_words,
            num_regions,
        }
    }

    /// Total heap size in words.
    #[must_use]
    pub const fn heap_words(&self) -> usize {
        self.region_words.saturating_mul(self.num_regions)
    }

    /// Objects larger than this many words are allocated as humongous.
    #[must_use]
    pub const fn humongous_threshold(&self) -> usize {
        self.region_words / 2
    }

    /// Checks the geometry.
    ///
    /// # Errors
    ///
    /// Returns [`HeapError::InvalidGeometry`] describing the first problem.
    pub fn validate(&self) -> Result<(), HeapError> {
        if self.region_words < 64 || !self.region_words.is_power_of_two() {
            return Err(HeapError::InvalidGeometry(format!(
                "region_words must be a power of two >= 64, got {}",
                self.region_words
            )));
        }
        if self.num_regions == 0 {
            return Err(HeapError::InvalidGeometry("num_regions must be > 0".into()));
        }
        if self.heap_words() > Self::MAX_HEAP_WORDS {
            return Err(HeapError::InvalidGeometry(format!(
                "heap of {} words exceeds {} words",
                self.heap_words(),
                Self::MAX_HEAP_WORDS
            )));
        }
        Ok(())
    }
}

/// Tuning for a full collection.
#[derive(Clone, Copy, Debug)]
pub struct FullGcConfig {
    /// Upper bound on collection workers.
    pub max_workers: usize,
    /// Derive the worker count from heap state instead of using `max_workers`.
    pub use_dynamic_worker_count: bool,
    /// Share of the heap (percent) allowed to be lost to per-worker
    /// compaction tails. Each worker wastes about half a region.
    pub heap_waste_percent: usize,
    /// Used words per worker when sizing the gang from heap occupancy.
    pub heap_words_per_worker: usize,
    /// Object array elements scanned per marking step.
    pub objarray_marking_stride: usize,
    /// Unlink klasses whose holder died.
    pub class_unloading: bool,
    /// Clear softly reachable referents.
    pub clear_soft_refs: bool,
    /// The collection was requested explicitly rather than by an
    /// allocation failure. Recorded in traces only.
    pub explicit_gc: bool,
    /// Run heap verification after marking and after the collection.
    pub verify: bool,
}

impl Default for FullGcConfig {
    fn default() -> Self {
        Self {
            max_workers: available_parallelism(),
            use_dynamic_worker_count: true,
            heap_waste_percent: 5,
            heap_words_per_worker: (43 << 20) / 8,
            objarray_marking_stride: 2048,
            class_unloading: true,
            clear_soft_refs: false,
            explicit_gc: false,
            verify: cfg!(debug_assertions),
        }
    }
}

impl FullGcConfig {
    /// Create a configuration with a fixed worker count.
    #[must_use]
    pub fn with_workers(workers: usize) -> Self {
        Self {
            max_workers: workers.max(1),
            use_dynamic_worker_count: false,
            ..Default::default()
        }
    }

    /// Set the maximum number of workers.
    pub const fn set_max_workers(&mut self, workers: usize) {
        self.max_workers = if workers < 1 { 1 } else { workers };
    }

    /// Enable or disable dynamic worker sizing.
    pub const fn set_dynamic_worker_count(&mut self, enabled: bool) {
        self.use_dynamic_worker_count = enabled;
    }

    /// Enable or disable class unloading.
    pub const fn set_class_unloading(&mut self, enabled: bool) {
        self.class_unloading = enabled;
    }

    /// Enable or disable clearing of soft references.
    pub const fn set_clear_soft_refs(&mut self, enabled: bool) {
        self.clear_soft_refs = enabled;
    }

    /// Enable or disable verification.
    pub const fn set_verify(&mut self, enabled: bool) {
        self.verify = enabled;
    }

    /// Set the object array marking stride.
    pub const fn set_objarray_marking_stride(&mut self, stride: usize) {
        self.objarray_marking_stride = if stride < 1 { 1 } else { stride };
    }
}
