//! Workflow engine
//!
//! Drives multi-step dependency graphs to completion on top of the task
//! dispatcher:
//! - Each [`FlowStep`] is a small state machine that emits one task, awaits
//!   its result and either completes, fails or times out
//! - A [`Workflow`] is a tree of steps sharing one parameter bundle; a step's
//!   children stay blocked until the step is done
//! - The [`WorkflowManager`] polls workflows on a budget and, registered as
//!   the handler for [`crate::dispatch::TaskResult`], routes results back to
//!   the matching step by task id
//!
//! Polling and result delivery are decoupled on purpose: `set_task_result`
//! only records, the next poll observes and advances the machine.

pub mod graph;
pub mod manager;
pub mod step;

use serde_json::{Map, Value};

use crate::dispatch::TaskDispatcher;

// Re-export main types
pub use graph::{lock_workflow, SharedWorkflow, Workflow, WorkflowBuilder, WorkflowNode};
pub use manager::WorkflowManager;
pub use step::{FlowStep, StepAction, StepContext, StepState};

/// Error types for workflow construction
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("no such step '{0}' to attach after")]
    NoSuchStep(String),

    #[error("step with name '{0}' already exists")]
    DuplicateStep(String),
}

/// Shared arguments passed to every step poll of a workflow.
///
/// Carries the dispatcher steps post their tasks through, plus free-form
/// named values for step-specific knobs.
#[derive(Clone, Default)]
pub struct WorkflowParams {
    dispatcher: Option<TaskDispatcher>,
    values: Map<String, Value>,
}

impl WorkflowParams {
    /// Create an empty parameter bundle
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the dispatcher steps should post tasks through
    pub fn with_dispatcher(mut self, dispatcher: TaskDispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Add a named value
    pub fn with_value(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    /// The attached dispatcher, if any
    pub fn dispatcher(&self) -> Option<&TaskDispatcher> {
        self.dispatcher.as_ref()
    }

    /// Look up a named value
    pub fn value(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }
}

impl std::fmt::Debug for WorkflowParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowParams")
            .field("has_dispatcher", &self.dispatcher.is_some())
            .field("values", &self.values)
            .finish()
    }
}
