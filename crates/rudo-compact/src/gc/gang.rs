//! A fixed-size worker gang running one data-parallel task at a time.
//!
//! `run_task` returns only after every worker has finished the task, which
//! makes each call a barrier between collection phases.

use std::thread;

/// A unit of parallel work. `work` is called once per worker id.
pub trait GangTask: Sync {
    /// Name used in logs and thread diagnostics.
    fn name(&self) -> &'static str;

    /// Runs this worker's share of the task.
    fn work(&self, worker_id: usize);
}

/// Runs [`GangTask`]s on scoped worker threads.
#[derive(Debug, Clone, Copy)]
pub struct WorkGang {
    active_workers: usize,
}

impl WorkGang {
    /// Creates a gang of `active_workers` workers (at least one).
    #[must_use]
    pub fn new(active_workers: usize) -> Self {
        Self {
            active_workers: active_workers.max(1),
        }
    }

    /// Number of workers each task runs on.
    #[must_use]
    pub const fn active_workers(&self) -> usize {
        self.active_workers
    }

    /// Runs `task` on every worker and waits for all of them.
    ///
    /// Worker 0 runs on the calling thread. A panic in any worker is
    /// propagated once all workers have stopped.
    ///
    /// # Panics
    ///
    /// Panics if a worker thread cannot be spawned.
    pub fn run_task(&self, task: &dyn GangTask) {
        self.run_task_with(task, self.active_workers);
    }

    /// Like [`run_task`](Self::run_task) but with an explicit worker count.
    ///
    /// # Panics
    ///
    /// Panics if a worker thread cannot be spawned.
    pub fn run_task_with(&self, task: &dyn GangTask, workers: usize) {
        let workers = workers.clamp(1, self.active_workers);
        if workers == 1 {
            run_worker(task, 0);
            return;
        }

        thread::scope(|s| {
            for worker_id in 1..workers {
                let spawned = thread::Builder::new()
                    .name(format!("gc-worker-{worker_id}"))
                    .spawn_scoped(s, move || run_worker(task, worker_id));
                if let Err(err) = spawned {
                    panic!("failed to spawn gc worker {worker_id} for {}: {err}", task.name());
                }
            }
            run_worker(task, 0);
        });
    }
}

fn run_worker(task: &dyn GangTask, worker_id: usize) {
    #[cfg(feature = "tracing")]
    let start = std::time::Instant::now();

    task.work(worker_id);

    #[cfg(feature = "tracing")]
    crate::tracing::internal::log_task(task.name(), worker_id, start.elapsed());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct CountingTask {
        calls: AtomicUsize,
        ids: Mutex<Vec<usize>>,
    }

    impl GangTask for CountingTask {
        fn name(&self) -> &'static str {
            "counting task"
        }

        fn work(&self, worker_id: usize) {
            self.calls.fetch_add(1, Ordering::Relaxed);
            self.ids.lock().unwrap().push(worker_id);
        }
    }

    fn counting_task() -> CountingTask {
        CountingTask {
            calls: AtomicUsize::new(0),
            ids: Mutex::new(Vec::new()),
        }
    }

    #[test]
    fn test_every_worker_runs_once() {
        let task = counting_task();
        WorkGang::new(4).run_task(&task);

        let mut ids = task.ids.into_inner().unwrap();
        ids.sort_unstable();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        assert_eq!(task.calls.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn test_single_worker_runs_inline() {
        let task = counting_task();
        let gang = WorkGang::new(0);
        assert_eq!(gang.active_workers(), 1);
        gang.run_task(&task);
        assert_eq!(task.ids.into_inner().unwrap(), vec![0]);
    }

    #[test]
    fn test_run_task_with_clamps() {
        let task = counting_task();
        WorkGang::new(2).run_task_with(&task, 8);
        assert_eq!(task.calls.load(Ordering::Relaxed), 2);
    }

    struct PanickingTask;

    impl GangTask for PanickingTask {
        fn name(&self) -> &'static str {
            "panicking task"
        }

        fn work(&self, worker_id: usize) {
            assert_ne!(worker_id, 1, "worker 1 fails");
        }
    }

    #[test]
    #[should_panic]
    fn test_worker_panic_propagates() {
        WorkGang::new(2).run_task(&PanickingTask);
    }
}
