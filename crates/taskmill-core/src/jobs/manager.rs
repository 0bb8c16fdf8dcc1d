//! Job creation, random-placement scheduling and work-stealing dequeue

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::config::ExecutorConfig;
use crate::jobs::worker::{current_worker, Worker};
use crate::jobs::{IntoJobResult, Job};

/// Owner of the worker pool.
///
/// Cheap to clone; every clone shares the same pool. Worker threads hold a
/// clone themselves, so the pool stays alive until [`JobManager::join`] has
/// been called and all handles are gone.
#[derive(Clone)]
pub struct JobManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    config: ExecutorConfig,
    workers: Vec<Arc<Worker>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl JobManager {
    /// Create a manager and spawn its worker pool
    pub fn new(config: ExecutorConfig) -> Self {
        let count = config.worker_count();
        let workers = (0..count).map(|i| Arc::new(Worker::new(i))).collect();

        let manager = Self {
            inner: Arc::new(ManagerInner {
                config,
                workers,
                handles: Mutex::new(Vec::with_capacity(count)),
            }),
        };

        manager.spawn_workers(count);
        manager
    }

    /// Create a manager with default executor configuration
    pub fn with_defaults() -> Self {
        Self::new(ExecutorConfig::default())
    }

    fn spawn_workers(&self, count: usize) {
        info!("starting {} workers", count);

        let mut handles = self.lock_handles();
        for index in 0..count {
            let manager = self.clone();
            let handle = thread::Builder::new()
                .name(format!("taskmill-worker-{}", index))
                .spawn(move || Worker::run(manager, index))
                .expect("failed to spawn worker thread");
            handles.push(handle);
        }
    }

    /// Number of workers in the pool
    pub fn worker_count(&self) -> usize {
        self.inner.workers.len()
    }

    pub(crate) fn worker(&self, index: usize) -> &Arc<Worker> {
        &self.inner.workers[index]
    }

    /// Create a root job from a closure.
    ///
    /// The closure receives the job itself and this manager in addition to
    /// whatever it captured; its return value lands in the job's result slot.
    pub fn create_job<F, R>(&self, f: F) -> Arc<Job>
    where
        F: FnOnce(&Arc<Job>, &JobManager) -> R + Send + 'static,
        R: IntoJobResult,
    {
        Job::new(
            None,
            Box::new(move |job, manager| f(job, manager).into_job_result()),
        )
    }

    /// Create a child job of `parent`.
    ///
    /// This is the only operation that grows a job's unfinished counter.
    pub fn create_child_job<F, R>(&self, parent: &Arc<Job>, f: F) -> Arc<Job>
    where
        F: FnOnce(&Arc<Job>, &JobManager) -> R + Send + 'static,
        R: IntoJobResult,
    {
        parent.register_child();
        Job::new(
            Some(parent.clone()),
            Box::new(move |job, manager| f(job, manager).into_job_result()),
        )
    }

    /// Place a job on a uniformly random worker queue
    pub fn schedule_job(&self, job: &Arc<Job>) {
        if job.is_finished() {
            warn!("job {} already finished, not scheduling", job.id());
            return;
        }

        let index = rand::thread_rng().gen_range(0..self.inner.workers.len());
        debug!("job {} scheduled on worker {}", job.id(), index);
        self.inner.workers[index].push(job.clone());
    }

    /// The scheduling primitive: resolve the calling thread to its worker,
    /// pop from its own queue, or steal the head of a random victim's queue.
    ///
    /// Sleeps for the configured steal backoff and returns `None` when the
    /// victim is the caller itself or empty. Non-worker threads always
    /// receive `None`.
    pub fn get_job(&self) -> Option<Arc<Job>> {
        let index = current_worker()?;
        let worker = &self.inner.workers[index];

        if let Some(job) = worker.pop() {
            return Some(job);
        }

        let victim = rand::thread_rng().gen_range(0..self.inner.workers.len());
        if victim == index {
            thread::sleep(self.inner.config.steal_backoff());
            return None;
        }

        let stolen = self.inner.workers[victim].steal();
        match stolen {
            Some(job) => {
                debug!("worker {} stole job {} from worker {}", index, job.id(), victim);
                Some(job)
            }
            None => {
                thread::sleep(self.inner.config.steal_backoff());
                None
            }
        }
    }

    /// Run a job body, catching panics, and balance its accounting.
    ///
    /// A panic is logged and swallowed; `finish` runs either way so counters
    /// stay exact and waiting parents are released.
    pub(crate) fn execute(&self, job: &Arc<Job>) {
        if let Some(body) = job.take_body() {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| body(job, self)));
            match outcome {
                Ok(result) => job.store_result(result),
                Err(payload) => {
                    error!("job {} panicked: {}", job.id(), panic_message(&payload));
                }
            }
        } else {
            warn!("job {} was not scheduled properly", job.id());
        }
        job.finish();
    }

    /// Block until `job` is finished, executing other work in the meantime.
    ///
    /// Worker threads drain through [`JobManager::get_job`], which keeps the
    /// pool deadlock-free when every worker is waiting on children. Non-worker
    /// threads receive no work and sleep briefly between checks.
    pub fn wait(&self, job: &Arc<Job>) {
        while !job.is_finished() {
            if let Some(other) = self.get_job() {
                self.execute(&other);
            } else if current_worker().is_none() {
                thread::sleep(self.inner.config.wait_idle());
            }
        }
    }

    /// Signal every worker to terminate and wait for the threads to exit.
    ///
    /// With a timeout, threads still running at the deadline are detached.
    pub fn join(&self, timeout: Option<Duration>) {
        info!("terminating job system");

        for worker in &self.inner.workers {
            worker.terminate();
        }

        let handles: Vec<JoinHandle<()>> = self.lock_handles().drain(..).collect();
        match timeout {
            None => {
                for handle in handles {
                    if handle.join().is_err() {
                        error!("worker thread panicked during shutdown");
                    }
                }
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                for handle in handles {
                    while !handle.is_finished() && Instant::now() < deadline {
                        thread::sleep(Duration::from_millis(5));
                    }
                    if handle.is_finished() {
                        if handle.join().is_err() {
                            error!("worker thread panicked during shutdown");
                        }
                    } else {
                        warn!("worker did not stop within timeout, detaching");
                    }
                }
            }
        }
    }

    fn lock_handles(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.inner
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl std::fmt::Debug for JobManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobManager")
            .field("workers", &self.worker_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_config(workers: usize) -> ExecutorConfig {
        ExecutorConfig {
            workers,
            steal_backoff_ms: 2,
            wait_idle_ms: 1,
        }
    }

    #[test]
    fn test_schedule_and_wait() {
        let manager = JobManager::new(test_config(2));
        let counter = Arc::new(AtomicUsize::new(0));

        let recorded = counter.clone();
        let job = manager.create_job(move |_, _| {
            recorded.fetch_add(1, Ordering::SeqCst);
        });
        manager.schedule_job(&job);
        manager.wait(&job);

        assert!(job.is_finished());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        manager.join(None);
    }

    #[test]
    fn test_single_worker_progresses() {
        // wait must drain from the worker's own queue
        let manager = JobManager::new(test_config(1));
        let counter = Arc::new(AtomicUsize::new(0));

        let recorded = counter.clone();
        let job = manager.create_job(move |job, manager| {
            for _ in 0..4 {
                let recorded = recorded.clone();
                let child = manager.create_child_job(job, move |_, _| {
                    recorded.fetch_add(1, Ordering::SeqCst);
                });
                manager.schedule_job(&child);
                manager.wait(&child);
            }
        });
        manager.schedule_job(&job);
        manager.wait(&job);

        assert_eq!(counter.load(Ordering::SeqCst), 4);
        manager.join(None);
    }

    #[test]
    fn test_panicking_job_balances_accounting() {
        let manager = JobManager::new(test_config(2));

        let job = manager.create_job::<_, ()>(|_, _| {
            panic!("deliberate test panic");
        });
        manager.schedule_job(&job);
        manager.wait(&job);

        assert!(job.is_finished());
        assert_eq!(job.unfinished_jobs(), 0);
        manager.join(None);
    }

    #[test]
    fn test_job_result_readable_after_wait() {
        let manager = JobManager::new(test_config(2));

        let job = manager.create_job(|_, _| Some(42_u32));
        manager.schedule_job(&job);
        manager.wait(&job);

        let result = job.take_result().expect("job should produce a result");
        assert_eq!(*result.downcast::<u32>().expect("u32 result"), 42);
        manager.join(None);
    }

    #[test]
    fn test_join_with_timeout_stops_workers() {
        let manager = JobManager::new(test_config(2));
        manager.join(Some(Duration::from_secs(2)));
    }
}
