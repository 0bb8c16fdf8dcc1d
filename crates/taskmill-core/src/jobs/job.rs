//! Job type with parent/child accounting

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::warn;
use uuid::Uuid;

use crate::jobs::JobManager;

/// Unique job identifier
pub type JobId = Uuid;

/// Opaque value produced by a job body, readable once the job has finished
pub type JobResult = Box<dyn Any + Send>;

/// A job body: the captured work plus the two injected references
pub type JobFn = Box<dyn FnOnce(&Arc<Job>, &JobManager) -> Option<JobResult> + Send>;

/// Conversion from a job body's return value into the job result slot.
///
/// Lets plain `()`-returning closures and result-producing closures share the
/// same `create_job` entry points.
pub trait IntoJobResult {
    fn into_job_result(self) -> Option<JobResult>;
}

impl IntoJobResult for () {
    fn into_job_result(self) -> Option<JobResult> {
        None
    }
}

impl<T: Any + Send> IntoJobResult for Option<T> {
    fn into_job_result(self) -> Option<JobResult> {
        self.map(|value| Box::new(value) as JobResult)
    }
}

/// A unit of execution scheduled on a worker.
///
/// The unfinished counter starts at 1 (counting the job itself), grows only
/// through child creation and shrinks only through [`Job::finish`]. When a
/// counter hits zero the parent is finished recursively, so a root job is
/// finished exactly when its whole tree has completed.
pub struct Job {
    id: JobId,
    parent: Option<Arc<Job>>,
    unfinished: AtomicUsize,
    body: Mutex<Option<JobFn>>,
    result: Mutex<Option<JobResult>>,
}

impl Job {
    pub(crate) fn new(parent: Option<Arc<Job>>, body: JobFn) -> Arc<Self> {
        Arc::new(Self {
            id: JobId::new_v4(),
            parent,
            unfinished: AtomicUsize::new(1),
            body: Mutex::new(Some(body)),
            result: Mutex::new(None),
        })
    }

    /// Get job ID
    pub fn id(&self) -> JobId {
        self.id
    }

    /// Get the parent job (if any)
    pub fn parent(&self) -> Option<&Arc<Job>> {
        self.parent.as_ref()
    }

    /// Number of unfinished jobs in this job's subtree, itself included
    pub fn unfinished_jobs(&self) -> usize {
        self.unfinished.load(Ordering::SeqCst)
    }

    /// Check whether this job and all of its descendants have finished
    pub fn is_finished(&self) -> bool {
        self.unfinished_jobs() == 0
    }

    /// Take the job's result, if the body produced one.
    ///
    /// Only meaningful after the job has finished; the slot is emptied by the
    /// first take.
    pub fn take_result(&self) -> Option<JobResult> {
        self.result
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Register one more unfinished descendant. Called on child creation only.
    pub(crate) fn register_child(&self) {
        self.unfinished.fetch_add(1, Ordering::SeqCst);
    }

    /// Take the body for execution; `None` when the job already ran.
    pub(crate) fn take_body(&self) -> Option<JobFn> {
        self.body
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    pub(crate) fn store_result(&self, result: Option<JobResult>) {
        *self.result.lock().unwrap_or_else(PoisonError::into_inner) = result;
    }

    /// Mark one unit of this job's subtree as finished.
    ///
    /// Decrements the unfinished counter; on reaching zero the parent is
    /// finished as well. Invoked by the executor after a job body runs,
    /// whether it succeeded or panicked.
    pub(crate) fn finish(&self) {
        let previous = self.unfinished.fetch_sub(1, Ordering::SeqCst);
        if previous == 0 {
            // Counter already balanced; put it back and complain.
            self.unfinished.fetch_add(1, Ordering::SeqCst);
            warn!("job {} finished more times than created", self.id);
            return;
        }
        if previous == 1 {
            if let Some(parent) = &self.parent {
                parent.finish();
            }
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("unfinished", &self.unfinished_jobs())
            .field("has_parent", &self.parent.is_some())
            .finish()
    }
}
