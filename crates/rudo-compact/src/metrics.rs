//! Full collection metrics and statistics.

use std::time::{Duration, Instant};

/// Statistics from one full collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FullGcMetrics {
    /// Wall time of the whole pause.
    pub duration: Duration,
    /// Duration of phase 1.
    pub mark_duration: Duration,
    /// Duration of phase 2.
    pub prepare_duration: Duration,
    /// Duration of phase 3.
    pub adjust_duration: Duration,
    /// Duration of phase 4.
    pub compact_duration: Duration,
    /// Workers used by the parallel phases.
    pub workers: usize,
    /// Objects found live.
    pub objects_marked: usize,
    /// Objects given a new address.
    pub objects_moved: usize,
    /// Regions in use before the collection and free after it.
    pub regions_freed: usize,
    /// Whether the serial compaction fallback ran.
    pub serial_compaction: bool,
    /// Objects routed through a rescue buffer.
    pub rescued_objects: usize,
    /// Humongous objects relocated, counting redefined ones rewritten in
    /// place.
    pub humongous_relocated: usize,
    /// Regions released because the humongous object in them died.
    pub humongous_regions_freed: usize,
    /// Referents cleared by reference processing.
    pub references_cleared: usize,
    /// Weak roots cleared.
    pub weak_roots_cleared: usize,
    /// Klasses unloaded because their holder died.
    pub classes_unloaded: usize,
    /// Superseded klass versions unlinked after migration.
    pub classes_redefined: usize,
    /// Words in use before the collection.
    pub used_words_before: usize,
    /// Words in use after the collection.
    pub used_words_after: usize,
    /// Full collections run on the heap, including this one.
    pub total_collections: usize,
}

impl Default for FullGcMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl FullGcMetrics {
    /// Create a new `FullGcMetrics` with all fields set to zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            duration: Duration::ZERO,
            mark_duration: Duration::ZERO,
            prepare_duration: Duration::ZERO,
            adjust_duration: Duration::ZERO,
            compact_duration: Duration::ZERO,
            workers: 0,
            objects_marked: 0,
            objects_moved: 0,
            regions_freed: 0,
            serial_compaction: false,
            rescued_objects: 0,
            humongous_relocated: 0,
            humongous_regions_freed: 0,
            references_cleared: 0,
            weak_roots_cleared: 0,
            classes_unloaded: 0,
            classes_redefined: 0,
            used_words_before: 0,
            used_words_after: 0,
            total_collections: 0,
        }
    }

    /// Words reclaimed by the collection.
    #[must_use]
    pub const fn words_reclaimed(&self) -> usize {
        self.used_words_before.saturating_sub(self.used_words_after)
    }
}

/// Captures the duration of each of the four phases.
///
/// # Example
///
/// ```
/// use rudo_compact::metrics::PhaseTimer;
///
/// let mut timer = PhaseTimer::new();
/// timer.start();
/// // ... marking ...
/// timer.end_mark();
///
/// timer.start();
/// // ... forwarding ...
/// timer.end_prepare();
/// ```
#[derive(Debug, Clone, Copy)]
pub struct PhaseTimer {
    /// Mark phase time.
    pub mark: Duration,
    /// Prepare phase time.
    pub prepare: Duration,
    /// Adjust phase time.
    pub adjust: Duration,
    /// Compact phase time.
    pub compact: Duration,
    current_start: Option<Instant>,
}

impl Default for PhaseTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseTimer {
    /// Create a new `PhaseTimer` with all durations set to zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            mark: Duration::ZERO,
            prepare: Duration::ZERO,
            adjust: Duration::ZERO,
            compact: Duration::ZERO,
            current_start: None,
        }
    }

    /// Start timing a phase.
    pub fn start(&mut self) {
        self.current_start = Some(Instant::now());
    }

    fn take(&mut self) -> Duration {
        self.current_start
            .take()
            .map_or(Duration::ZERO, |start| start.elapsed())
    }

    /// End the mark phase and record its duration.
    pub fn end_mark(&mut self) {
        self.mark = self.take();
    }

    /// End the prepare phase and record its duration.
    pub fn end_prepare(&mut self) {
        self.prepare = self.take();
    }

    /// End the adjust phase and record its duration.
    pub fn end_adjust(&mut self) {
        self.adjust = self.take();
    }

    /// End the compact phase and record its duration.
    pub fn end_compact(&mut self) {
        self.compact = self.take();
    }

    /// Copies the phase durations into `metrics`.
    pub const fn apply_to(&self, metrics: &mut FullGcMetrics) {
        metrics.mark_duration = self.mark;
        metrics.prepare_duration = self.prepare;
        metrics.adjust_duration = self.adjust;
        metrics.compact_duration = self.compact;
    }
}
