//! Task queue abstraction and the in-memory implementation

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::DispatcherConfig;
use crate::dispatch::{QueueError, QueueResult, TaskMessage};

/// Abstract FIFO of tasks feeding the dispatch loop.
///
/// Implementations differ in durability only; the dispatcher treats them
/// identically apart from the empty-fetch policy reported by
/// [`TaskQueue::reschedule_on_empty`].
pub trait TaskQueue: Send + Sync {
    /// Append a task
    fn put(&self, task: TaskMessage) -> QueueResult<()>;

    /// Scoped acquisition of the next task.
    ///
    /// The task counts as consumed when the guard is dropped normally; a
    /// guard dropped during a panic returns the task to the queue via
    /// [`TaskQueue::restore`].
    fn fetch_task(&self) -> FetchGuard<'_>;

    /// Return a fetched task to the consumption end of the queue
    fn restore(&self, task: Arc<TaskMessage>);

    /// Shut the queue down; subsequent fetches yield nothing
    fn close(&self);

    /// Check whether the queue has been closed
    fn is_closed(&self) -> bool;

    /// Whether an empty fetch should keep the dispatch loop alive.
    ///
    /// In-memory queues answer `true` (an empty fetch just timed out);
    /// durable back-ends answer `false` (an empty pop ends the loop).
    fn reschedule_on_empty(&self) -> bool;
}

/// Scoped task acquisition: acknowledge on normal scope exit, give the task
/// back if the scope unwinds.
pub struct FetchGuard<'q> {
    task: Option<Arc<TaskMessage>>,
    queue: Option<&'q dyn TaskQueue>,
}

impl<'q> FetchGuard<'q> {
    /// Guard over a fetched task
    pub fn new(task: Arc<TaskMessage>, queue: &'q dyn TaskQueue) -> Self {
        Self {
            task: Some(task),
            queue: Some(queue),
        }
    }

    /// Guard representing an empty fetch
    pub fn empty() -> Self {
        Self {
            task: None,
            queue: None,
        }
    }

    /// The fetched task, if any
    pub fn task(&self) -> Option<Arc<TaskMessage>> {
        self.task.clone()
    }

    /// Check whether the fetch came back empty
    pub fn is_empty(&self) -> bool {
        self.task.is_none()
    }
}

impl Drop for FetchGuard<'_> {
    fn drop(&mut self) {
        if thread::panicking() {
            if let (Some(task), Some(queue)) = (self.task.take(), self.queue) {
                warn!(
                    "returning task {} to the queue after abnormal scope exit",
                    task.task_id()
                );
                queue.restore(task);
            }
        }
    }
}

struct QueueState {
    tasks: VecDeque<Arc<TaskMessage>>,
    closed: bool,
}

/// Thread-safe in-memory FIFO task queue.
///
/// `fetch_task` blocks up to the configured timeout; an empty guard means
/// the wait timed out or the queue was closed. Delivery is at-most-once.
pub struct InMemoryTaskQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    fetch_timeout: Duration,
}

impl InMemoryTaskQueue {
    /// Create a queue with the default fetch timeout
    pub fn new() -> Self {
        Self::from_config(&DispatcherConfig::default())
    }

    /// Create a queue with dispatcher configuration applied
    pub fn from_config(config: &DispatcherConfig) -> Self {
        Self {
            state: Mutex::new(QueueState {
                tasks: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
            fetch_timeout: config.fetch_timeout(),
        }
    }

    /// Number of queued tasks
    pub fn len(&self) -> usize {
        self.lock_state().tasks.len()
    }

    /// Check whether the queue holds no tasks
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for InMemoryTaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue for InMemoryTaskQueue {
    fn put(&self, task: TaskMessage) -> QueueResult<()> {
        let mut state = self.lock_state();
        if state.closed {
            return Err(QueueError::Closed);
        }

        debug!("task queued: {:?}", task);
        state.tasks.push_back(Arc::new(task));
        drop(state);

        self.available.notify_one();
        Ok(())
    }

    fn fetch_task(&self) -> FetchGuard<'_> {
        let deadline = Instant::now() + self.fetch_timeout;
        let mut state = self.lock_state();

        loop {
            if let Some(task) = state.tasks.pop_front() {
                return FetchGuard::new(task, self);
            }
            if state.closed {
                return FetchGuard::empty();
            }

            let now = Instant::now();
            if now >= deadline {
                return FetchGuard::empty();
            }

            let (guard, _timeout) = self
                .available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    fn restore(&self, task: Arc<TaskMessage>) {
        let mut state = self.lock_state();
        state.tasks.push_front(task);
        drop(state);
        self.available.notify_one();
    }

    fn close(&self) {
        self.lock_state().closed = true;
        self.available.notify_all();
    }

    fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    fn reschedule_on_empty(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Task;

    #[derive(Debug, Default)]
    struct ProbeTask;

    impl Task for ProbeTask {}

    fn fast_queue() -> InMemoryTaskQueue {
        InMemoryTaskQueue::from_config(&DispatcherConfig {
            fetch_timeout_ms: 20,
        })
    }

    #[test]
    fn test_put_then_fetch() {
        let queue = fast_queue();
        queue.put(TaskMessage::new(ProbeTask)).expect("put");

        let guard = queue.fetch_task();
        let task = guard.task().expect("task expected");
        assert!(task.is::<ProbeTask>());
        drop(guard);

        assert!(queue.is_empty());
    }

    #[test]
    fn test_fetch_order_is_fifo() {
        let queue = fast_queue();
        let first = TaskMessage::new(ProbeTask);
        let first_id = first.task_id();
        queue.put(first).expect("put");
        queue.put(TaskMessage::new(ProbeTask)).expect("put");

        let guard = queue.fetch_task();
        assert_eq!(guard.task().map(|t| t.task_id()), Some(first_id));
    }

    #[test]
    fn test_fetch_times_out_empty() {
        let queue = fast_queue();
        let started = Instant::now();
        let guard = queue.fetch_task();
        assert!(guard.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn test_closed_queue_rejects_put_and_unblocks_fetch() {
        let queue = fast_queue();
        queue.close();

        assert!(matches!(
            queue.put(TaskMessage::new(ProbeTask)),
            Err(QueueError::Closed)
        ));
        assert!(queue.fetch_task().is_empty());
        assert!(queue.is_closed());
    }

    #[test]
    fn test_fetch_unblocks_on_concurrent_put() {
        let queue = Arc::new(InMemoryTaskQueue::from_config(&DispatcherConfig {
            fetch_timeout_ms: 2_000,
        }));

        let producer = {
            let queue = queue.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                queue.put(TaskMessage::new(ProbeTask)).expect("put");
            })
        };

        let guard = queue.fetch_task();
        assert!(guard.task().is_some());
        producer.join().expect("producer thread");
    }

    #[test]
    fn test_panic_inside_scope_restores_task() {
        let queue = Arc::new(fast_queue());
        queue.put(TaskMessage::new(ProbeTask)).expect("put");

        let inner = queue.clone();
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = inner.fetch_task();
            panic!("deliberate test panic");
        }));
        assert!(outcome.is_err());

        // The task went back to the consumption end of the queue
        assert_eq!(queue.len(), 1);
        assert!(queue.fetch_task().task().is_some());
    }
}
