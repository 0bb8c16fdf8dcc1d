//! Task and task result types

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

/// Unique task identifier, assigned on first post if absent
pub type TaskId = Uuid;

/// A typed descriptor of work to be dispatched to handlers.
///
/// Tasks are plain value types; the dispatcher keys on their runtime type.
/// The provided methods only need overriding in special cases:
/// [`TaskResult`] surfaces its originating task's id through `task_id`, and
/// tasks crossing a durable queue may pin a stable wire name via `kind`.
pub trait Task: Send + Sync + 'static {
    /// The id this task already carries, if any.
    ///
    /// Posting assigns a fresh id when this returns `None`.
    fn task_id(&self) -> Option<TaskId> {
        None
    }

    /// Name used in logs and as the durable-queue codec key
    fn kind(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// The posted envelope around a task: its id plus the type-erased payload.
///
/// Queues hand out `Arc<TaskMessage>` so a single fetched task can be shared
/// by all handler jobs running against it concurrently.
pub struct TaskMessage {
    id: TaskId,
    type_id: TypeId,
    kind: &'static str,
    payload: Box<dyn Any + Send + Sync>,
}

impl TaskMessage {
    /// Wrap a task, assigning a fresh id unless the task carries one
    pub fn new<T: Task>(task: T) -> Self {
        let id = task.task_id().unwrap_or_else(TaskId::new_v4);
        Self::with_id(id, task)
    }

    /// Wrap a task under an explicit id
    pub fn with_id<T: Task>(id: TaskId, task: T) -> Self {
        Self {
            id,
            type_id: TypeId::of::<T>(),
            kind: task.kind(),
            payload: Box::new(task),
        }
    }

    /// Get the task id
    pub fn task_id(&self) -> TaskId {
        self.id
    }

    /// Runtime type of the payload; the dispatch key
    pub fn payload_type(&self) -> TypeId {
        self.type_id
    }

    /// The payload's kind name (logs, durable-queue codec key)
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Check the payload type
    pub fn is<T: Task>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }

    /// Borrow the payload as a concrete task type
    pub fn downcast_ref<T: Task>(&self) -> Option<&T> {
        self.payload.downcast_ref::<T>()
    }
}

impl fmt::Debug for TaskMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskMessage")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// The outcome of a prior task, re-postable through the dispatcher.
///
/// Carries the originating task and reports its id as its own, so routing by
/// task id closes the loop back to whoever emitted the task.
#[derive(Clone)]
pub struct TaskResult {
    task: Arc<TaskMessage>,
    failed: bool,
    reason: Option<String>,
}

impl TaskResult {
    /// Create a successful result for the given task
    pub fn new(task: Arc<TaskMessage>) -> Self {
        Self {
            task,
            failed: false,
            reason: None,
        }
    }

    /// Mark this result as failed with a reason
    pub fn with_failure(mut self, reason: impl Into<String>) -> Self {
        self.failed = true;
        self.reason = Some(reason.into());
        self
    }

    /// The originating task
    pub fn task(&self) -> &Arc<TaskMessage> {
        &self.task
    }

    /// The originating task's id
    pub fn result_task_id(&self) -> TaskId {
        self.task.task_id()
    }

    /// Whether the task failed
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Failure reason, if any
    pub fn failure_reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }
}

impl Task for TaskResult {
    fn task_id(&self) -> Option<TaskId> {
        Some(self.task.task_id())
    }

    fn kind(&self) -> &'static str {
        "task_result"
    }
}

impl fmt::Debug for TaskResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskResult")
            .field("task_id", &self.task.task_id())
            .field("failed", &self.failed)
            .field("reason", &self.reason)
            .finish()
    }
}

/// Sentinel task that stops the dispatch loop when dequeued.
///
/// Remaining queued tasks are not drained; they are discarded (in-memory) or
/// left for the next dispatcher (durable back-ends).
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminateDispatcherLoop;

impl Task for TerminateDispatcherLoop {
    fn kind(&self) -> &'static str {
        "terminate_dispatcher_loop"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct ProbeTask {
        tag: u32,
    }

    impl Task for ProbeTask {}

    #[test]
    fn test_message_assigns_id() {
        let message = TaskMessage::new(ProbeTask { tag: 7 });
        assert!(message.is::<ProbeTask>());
        assert_eq!(message.downcast_ref::<ProbeTask>().map(|t| t.tag), Some(7));
        assert!(!message.is::<TerminateDispatcherLoop>());
    }

    #[test]
    fn test_result_reports_originating_id() {
        let message = Arc::new(TaskMessage::new(ProbeTask::default()));
        let task_id = message.task_id();

        let result = TaskResult::new(message);
        assert_eq!(result.result_task_id(), task_id);
        assert_eq!(Task::task_id(&result), Some(task_id));
        assert!(!result.is_failed());

        // Re-wrapping the result keeps the originating id
        let reposted = TaskMessage::new(result);
        assert_eq!(reposted.task_id(), task_id);
        assert!(reposted.is::<TaskResult>());
    }

    #[test]
    fn test_failed_result_carries_reason() {
        let message = Arc::new(TaskMessage::new(ProbeTask::default()));
        let result = TaskResult::new(message).with_failure("verification failed");

        assert!(result.is_failed());
        assert_eq!(result.failure_reason(), Some("verification failed"));
    }

    #[test]
    fn test_kind_defaults_to_type_name() {
        let message = TaskMessage::new(ProbeTask::default());
        assert!(message.kind().contains("ProbeTask"));
    }
}
