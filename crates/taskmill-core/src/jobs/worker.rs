//! Worker threads and their private job queues

use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use crate::jobs::{Job, JobManager};

thread_local! {
    static CURRENT_WORKER: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Resolve the calling thread to its worker index.
///
/// Non-worker threads resolve to `None` and are handed no work by
/// [`JobManager::get_job`].
pub(crate) fn current_worker() -> Option<usize> {
    CURRENT_WORKER.with(|slot| slot.get())
}

fn set_current_worker(index: usize) {
    CURRENT_WORKER.with(|slot| slot.set(Some(index)));
}

/// A worker thread's shared state: its identity, private FIFO of jobs and
/// terminate flag.
///
/// The queue is pushed to only by the [`JobManager`] and popped from by its
/// owning worker (fast path) or another worker (steal).
pub struct Worker {
    index: usize,
    queue: Mutex<VecDeque<Arc<Job>>>,
    terminated: AtomicBool,
}

impl Worker {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            queue: Mutex::new(VecDeque::new()),
            terminated: AtomicBool::new(false),
        }
    }

    /// Get worker index
    pub fn index(&self) -> usize {
        self.index
    }

    /// Number of jobs currently queued on this worker
    pub fn queue_len(&self) -> usize {
        self.lock_queue().len()
    }

    /// Signal the worker to exit at its next loop iteration
    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }

    /// Check whether termination has been signaled
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub(crate) fn push(&self, job: Arc<Job>) {
        self.lock_queue().push_back(job);
    }

    pub(crate) fn pop(&self) -> Option<Arc<Job>> {
        self.lock_queue().pop_front()
    }

    /// Steal the head of this worker's queue on behalf of another worker
    pub(crate) fn steal(&self) -> Option<Arc<Job>> {
        self.lock_queue().pop_front()
    }

    fn lock_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<Arc<Job>>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Worker thread main loop.
    ///
    /// Draws jobs exclusively through [`JobManager::get_job`] so the fast
    /// path, stealing and backoff all live in one place.
    pub(crate) fn run(manager: JobManager, index: usize) {
        set_current_worker(index);
        debug!("worker {} starting", index);

        let worker = manager.worker(index).clone();
        while !worker.is_terminated() {
            if let Some(job) = manager.get_job() {
                debug!("worker {} executing job {}", index, job.id());
                manager.execute(&job);
            }
        }

        debug!("worker {} stopped", index);
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("index", &self.index)
            .field("queue_len", &self.queue_len())
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_job() -> Arc<Job> {
        Job::new(None, Box::new(|_, _| None))
    }

    #[test]
    fn test_queue_is_fifo() {
        let worker = Worker::new(0);
        let first = noop_job();
        let second = noop_job();

        worker.push(first.clone());
        worker.push(second.clone());

        assert_eq!(worker.queue_len(), 2);
        assert_eq!(worker.pop().map(|j| j.id()), Some(first.id()));
        assert_eq!(worker.steal().map(|j| j.id()), Some(second.id()));
        assert!(worker.pop().is_none());
    }

    #[test]
    fn test_terminate_flag() {
        let worker = Worker::new(3);
        assert!(!worker.is_terminated());
        worker.terminate();
        assert!(worker.is_terminated());
    }

    #[test]
    fn test_non_worker_thread_has_no_identity() {
        assert_eq!(current_worker(), None);
    }
}
