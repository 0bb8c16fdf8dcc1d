//! Type-keyed task dispatcher running on the job executor

use std::any::TypeId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, error, info, warn};

use crate::dispatch::{
    Task, TaskId, TaskMessage, TaskQueue, TaskResult, TerminateDispatcherLoop,
};
use crate::jobs::{Job, JobManager};
use crate::Result;

/// References injected into every handler invocation
pub struct HandlerContext<'a> {
    /// The handler's own child job
    pub job: &'a Arc<Job>,

    /// The job manager the handler runs on
    pub manager: &'a JobManager,

    /// The dispatcher that invoked the handler
    pub dispatcher: &'a TaskDispatcher,
}

/// A task handler bound to one or more task types.
///
/// Returning a [`TaskResult`] re-posts it through the dispatcher; returning
/// `None` ends the exchange.
pub trait TaskHandler: Send + Sync {
    fn handle(&self, task: Arc<TaskMessage>, ctx: &HandlerContext<'_>) -> Option<TaskResult>;
}

impl<F> TaskHandler for F
where
    F: for<'a> Fn(Arc<TaskMessage>, &'a HandlerContext<'a>) -> Option<TaskResult> + Send + Sync,
{
    fn handle(&self, task: Arc<TaskMessage>, ctx: &HandlerContext<'_>) -> Option<TaskResult> {
        self(task, ctx)
    }
}

/// An object exposing a set of task handlers.
///
/// `register` subscribes each handler under every task type it accepts;
/// handlers typically close over `Arc<Self>` so several task types can share
/// one bound method.
pub trait TaskHandlerSet: Send + Sync {
    fn register(self: Arc<Self>, dispatcher: &TaskDispatcher);
}

/// Routes posted tasks to the handlers registered for their type.
///
/// Cheap to clone; every clone shares the same handler registry, queue and
/// exit flag. The dispatch loop runs as a self-rescheduling root job on the
/// [`JobManager`], one tick per task.
#[derive(Clone)]
pub struct TaskDispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    handlers: DashMap<TypeId, Vec<Arc<dyn TaskHandler>>>,
    queue: Arc<dyn TaskQueue>,
    manager: JobManager,
    started: AtomicBool,
    exited: AtomicBool,
}

impl TaskDispatcher {
    /// Create a dispatcher over a task queue and job manager
    pub fn new(queue: Arc<dyn TaskQueue>, manager: JobManager) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                handlers: DashMap::new(),
                queue,
                manager,
                started: AtomicBool::new(false),
                exited: AtomicBool::new(false),
            }),
        }
    }

    /// The job manager this dispatcher schedules on
    pub fn job_manager(&self) -> &JobManager {
        &self.inner.manager
    }

    /// The task queue feeding this dispatcher
    pub fn task_queue(&self) -> &Arc<dyn TaskQueue> {
        &self.inner.queue
    }

    /// Register a handler for one task type.
    ///
    /// Registration during dispatch is allowed and takes effect on
    /// subsequent ticks.
    pub fn subscribe<T: Task>(&self, handler: Arc<dyn TaskHandler>) {
        debug!("handler registered for {}", std::any::type_name::<T>());
        self.inner
            .handlers
            .entry(TypeId::of::<T>())
            .or_default()
            .push(handler);
    }

    /// Register every handler an object exposes
    pub fn register_task_handler(&self, set: Arc<dyn TaskHandlerSet>) {
        set.register(self);
    }

    /// Number of handlers registered for a task type
    pub fn handler_count<T: Task>(&self) -> usize {
        self.inner
            .handlers
            .get(&TypeId::of::<T>())
            .map(|handlers| handlers.len())
            .unwrap_or(0)
    }

    /// Post a task, assigning a fresh id unless the task carries one.
    ///
    /// Returns the task's id for correlation with a later [`TaskResult`].
    pub fn post_task<T: Task>(&self, task: T) -> Result<TaskId> {
        self.post_message(TaskMessage::new(task))
    }

    /// Post an already-wrapped task message
    pub fn post_message(&self, message: TaskMessage) -> Result<TaskId> {
        let task_id = message.task_id();
        debug!("task posted: {:?}", message);
        self.inner.queue.put(message)?;
        Ok(task_id)
    }

    /// Schedule the first dispatch tick
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            warn!("dispatcher already started");
            return;
        }
        info!("dispatch loop starting");
        self.schedule_dispatch_job();
    }

    /// Request a cooperative stop by posting the sentinel task.
    ///
    /// Tasks still queued behind the sentinel are not drained.
    pub fn terminate(&self) -> Result<()> {
        info!("dispatch loop terminating");
        self.post_task(TerminateDispatcherLoop)?;
        Ok(())
    }

    /// Check whether the dispatch loop has stopped
    pub fn is_exited(&self) -> bool {
        self.inner.exited.load(Ordering::SeqCst)
    }

    fn schedule_dispatch_job(&self) {
        let dispatcher = self.clone();
        let job = self
            .inner
            .manager
            .create_job(move |job, manager| dispatcher.dispatch_tick(job, manager));
        self.inner.manager.schedule_job(&job);
    }

    /// One tick: fetch one task, fan it out to handlers, re-post results,
    /// reschedule.
    fn dispatch_tick(&self, job: &Arc<Job>, manager: &JobManager) {
        let guard = self.inner.queue.fetch_task();

        let Some(task) = guard.task() else {
            drop(guard);
            if !self.is_exited() && !self.inner.queue.is_closed() && self.inner.queue.reschedule_on_empty() {
                self.schedule_dispatch_job();
            } else {
                info!("dispatch loop stopped: queue drained or closed");
                self.inner.exited.store(true, Ordering::SeqCst);
            }
            return;
        };

        if task.is::<TerminateDispatcherLoop>() {
            info!("dispatcher terminated");
            self.inner.exited.store(true, Ordering::SeqCst);
            return;
        }

        debug!("dispatching task {:?}", task);
        self.dispatch_task(task, job, manager);
        self.schedule_dispatch_job();
    }

    /// Fan a task out to its handlers as child jobs of the tick and collect
    /// returned results once all of them finished.
    fn dispatch_task(&self, task: Arc<TaskMessage>, job: &Arc<Job>, manager: &JobManager) {
        let handlers: Vec<Arc<dyn TaskHandler>> = self
            .inner
            .handlers
            .get(&task.payload_type())
            .map(|entry| entry.value().clone())
            .unwrap_or_default();

        if handlers.is_empty() {
            debug!("no handler registered for task kind {}, dropping", task.kind());
            return;
        }

        let mut handler_jobs = Vec::with_capacity(handlers.len());
        for handler in handlers {
            let task = task.clone();
            let dispatcher = self.clone();
            let handler_job = manager.create_child_job(job, move |child, manager| {
                let ctx = HandlerContext {
                    job: child,
                    manager,
                    dispatcher: &dispatcher,
                };
                handler.handle(task, &ctx)
            });
            manager.schedule_job(&handler_job);
            handler_jobs.push(handler_job);
        }

        for handler_job in &handler_jobs {
            manager.wait(handler_job);
        }

        for handler_job in &handler_jobs {
            let Some(result) = handler_job.take_result() else {
                continue;
            };
            if let Ok(task_result) = result.downcast::<TaskResult>() {
                if let Err(e) = self.post_message(TaskMessage::new(*task_result)) {
                    error!("failed to re-post task result: {}", e);
                }
            }
        }
    }
}

impl std::fmt::Debug for TaskDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDispatcher")
            .field("handler_types", &self.inner.handlers.len())
            .field("exited", &self.is_exited())
            .finish()
    }
}
