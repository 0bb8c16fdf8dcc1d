pub mod config;
pub mod dispatch;
pub mod error;
pub mod jobs;
pub mod storage;
pub mod workflow;

// Re-export commonly used types
pub use config::{CoreConfig, DispatcherConfig, ExecutorConfig, WorkflowConfig};
pub use error::{Error, Result};
pub use jobs::{Job, JobId, JobManager, Worker};
pub use dispatch::{
    FetchGuard, HandlerContext, InMemoryTaskQueue, QueueError, Task, TaskDispatcher, TaskHandler,
    TaskHandlerSet, TaskId, TaskMessage, TaskQueue, TaskResult, TerminateDispatcherLoop,
};
pub use workflow::{
    lock_workflow, FlowStep, SharedWorkflow, StepAction, StepContext, StepState, Workflow,
    WorkflowBuilder, WorkflowError, WorkflowManager, WorkflowParams,
};
pub use storage::{
    BlobStore, Dao, Entity, MemoryBlobStore, RedisConfig, RedisDao, RedisPool, RedisTaskQueue,
    StorageError, TaskCodecRegistry,
};

/// Current version of taskmill
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
