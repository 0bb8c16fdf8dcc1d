//! Workflow ownership, polling budget and result routing

use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info};

use crate::dispatch::{
    HandlerContext, TaskDispatcher, TaskHandler, TaskHandlerSet, TaskMessage, TaskResult,
};
use crate::workflow::graph::lock_workflow;
use crate::workflow::{SharedWorkflow, StepState, Workflow, WorkflowBuilder};

/// Owns workflows and drives them on a polling budget.
///
/// Cheap to clone; every clone shares the same workflow list. Registered as a
/// handler set, it subscribes itself for [`TaskResult`] and routes each
/// result to the incomplete step whose task id matches.
///
/// Result routing scans incomplete steps linearly: the number of in-flight
/// steps is bounded by the polling budget and task ids are unique, so the
/// scan stays small.
#[derive(Clone)]
pub struct WorkflowManager {
    inner: Arc<WorkflowManagerInner>,
}

struct WorkflowManagerInner {
    workflows: Mutex<Vec<SharedWorkflow>>,
    max_concurrent_steps: usize,
}

impl WorkflowManager {
    /// Create a manager with a per-cycle step budget (0 = unlimited)
    pub fn new(max_concurrent_steps: usize) -> Self {
        Self {
            inner: Arc::new(WorkflowManagerInner {
                workflows: Mutex::new(Vec::new()),
                max_concurrent_steps,
            }),
        }
    }

    /// Create a manager from the workflow configuration section
    pub fn from_config(config: &crate::config::WorkflowConfig) -> Self {
        Self::new(config.max_concurrent_steps)
    }

    /// The per-cycle step budget
    pub fn max_concurrent_steps(&self) -> usize {
        self.inner.max_concurrent_steps
    }

    /// Allocate an empty workflow, register it and return its builder
    pub fn create(&self) -> WorkflowBuilder {
        let workflow = Arc::new(Mutex::new(Workflow::new()));
        debug!("creating workflow");
        self.lock_workflows().push(workflow.clone());
        WorkflowBuilder::new(workflow)
    }

    /// Snapshot of the registered workflows in insertion order
    pub fn workflows(&self) -> Vec<SharedWorkflow> {
        self.lock_workflows().clone()
    }

    /// Poll every workflow, spreading the step budget in insertion order.
    ///
    /// Returns the total number of steps polled this cycle.
    pub fn poll(&self) -> usize {
        let mut polled = 0;
        for workflow in self.workflows() {
            if self.inner.max_concurrent_steps > 0 {
                let remaining = self.inner.max_concurrent_steps - polled;
                if remaining == 0 {
                    break;
                }
                polled += lock_workflow(&workflow).poll(remaining);
            } else {
                polled += lock_workflow(&workflow).poll(0);
            }
        }
        polled
    }

    /// Deliver a task result to every incomplete step waiting on its id
    pub fn handle_task_result(&self, result: &TaskResult) {
        let task_id = result.result_task_id();
        for workflow in self.workflows() {
            lock_workflow(&workflow).for_each_incomplete_step_mut(|step| {
                if step.task_id() == Some(task_id) {
                    info!(
                        "task {} result returned, updating step {}",
                        task_id,
                        step.name()
                    );
                    step.set_task_result(result.clone());
                }
            });
        }
    }

    /// Recycle every timed-out step back to NEW
    pub fn reset_steps_with_timeout(&self) {
        for workflow in self.workflows() {
            lock_workflow(&workflow).for_each_step_mut(|step| {
                if step.state() == StepState::Timeout {
                    step.reset();
                }
            });
        }
    }

    /// Check whether every step of every workflow completed successfully
    pub fn all_done(&self) -> bool {
        self.workflows()
            .iter()
            .all(|workflow| lock_workflow(workflow).is_done())
    }

    /// Check whether every step of every workflow reached a terminal state
    pub fn all_finished(&self) -> bool {
        self.workflows()
            .iter()
            .all(|workflow| lock_workflow(workflow).is_finished())
    }

    fn lock_workflows(&self) -> std::sync::MutexGuard<'_, Vec<SharedWorkflow>> {
        self.inner
            .workflows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for WorkflowManager {
    fn default() -> Self {
        Self::new(0)
    }
}

impl std::fmt::Debug for WorkflowManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowManager")
            .field("workflows", &self.lock_workflows().len())
            .field("max_concurrent_steps", &self.inner.max_concurrent_steps)
            .finish()
    }
}

struct WorkflowResultHandler {
    manager: WorkflowManager,
}

impl TaskHandler for WorkflowResultHandler {
    fn handle(&self, task: Arc<TaskMessage>, _ctx: &HandlerContext<'_>) -> Option<TaskResult> {
        if let Some(result) = task.downcast_ref::<TaskResult>() {
            self.manager.handle_task_result(result);
        }
        None
    }
}

impl TaskHandlerSet for WorkflowManager {
    fn register(self: Arc<Self>, dispatcher: &TaskDispatcher) {
        dispatcher.subscribe::<TaskResult>(Arc::new(WorkflowResultHandler {
            manager: (*self).clone(),
        }));
    }
}
