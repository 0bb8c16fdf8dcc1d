//! Typed task dispatch
//!
//! This module routes typed task descriptors to registered handlers running
//! on the job executor:
//! - Tasks are plain value types; dispatch keys on their runtime type
//! - Handlers are registered per task type, several per type if needed
//! - A pluggable [`TaskQueue`] feeds the dispatch loop (in-memory or durable)
//! - Handler return values of type [`TaskResult`] are re-posted, closing the
//!   feedback loop the workflow engine is built on
//!
//! One dispatch tick handles one task: it is fetched under a scoped guard,
//! every matching handler runs as a child job of the tick, the tick waits for
//! all of them, re-posts any returned results, and reschedules itself.

pub mod dispatcher;
pub mod queue;
pub mod task;

// Re-export main types
pub use dispatcher::{HandlerContext, TaskDispatcher, TaskHandler, TaskHandlerSet};
pub use queue::{FetchGuard, InMemoryTaskQueue, TaskQueue};
pub use task::{Task, TaskId, TaskMessage, TaskResult, TerminateDispatcherLoop};

/// Queue result type alias
pub type QueueResult<T> = Result<T, QueueError>;

/// Error types for task queues
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,

    #[error("queue backend error: {0}")]
    Backend(String),

    #[error("task codec error: {0}")]
    Codec(String),
}
