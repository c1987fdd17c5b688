//! Distributed termination for work-stealing marking.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::utils::Backoff;

/// Detects the point where every marking worker is idle at once.
///
/// A worker with nothing left to do offers termination. It stays in the
/// offer until either all workers have offered (marking is done) or some
/// queue becomes non-empty, in which case it withdraws and goes back to
/// stealing.
#[derive(Debug)]
pub struct TaskTerminator {
    workers: usize,
    offered: AtomicUsize,
}

impl TaskTerminator {
    /// Creates a terminator for `workers` workers.
    #[must_use]
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            offered: AtomicUsize::new(0),
        }
    }

    /// Offers termination. Returns `true` once all workers have offered and
    /// `false` if `has_work` reported work to steal first.
    pub fn offer_termination(&self, has_work: impl Fn() -> bool) -> bool {
        self.offered.fetch_add(1, Ordering::SeqCst);
        let backoff = Backoff::new();
        loop {
            if self.offered.load(Ordering::SeqCst) == self.workers {
                return true;
            }
            if has_work() {
                self.offered.fetch_sub(1, Ordering::SeqCst);
                return false;
            }
            if backoff.is_completed() {
                std::thread::yield_now();
            } else {
                backoff.snooze();
            }
        }
    }

    /// Number of workers currently offering.
    #[must_use]
    pub fn offered(&self) -> usize {
        self.offered.load(Ordering::SeqCst)
    }
}
