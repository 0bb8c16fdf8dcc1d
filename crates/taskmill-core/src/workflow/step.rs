//! Flow step state machine

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::dispatch::{TaskId, TaskResult};
use crate::workflow::WorkflowParams;

/// States of a flow step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    /// Initial state, nothing emitted yet
    New,

    /// Task emitted, awaiting its result
    Pending,

    /// Terminal success
    Done,

    /// Terminal failure
    Error,

    /// Terminal failure by deadline
    Timeout,
}

impl StepState {
    /// Check whether the state is terminal (won't change without reset)
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepState::Done | StepState::Error | StepState::Timeout)
    }

    /// Check whether the state is a failure
    pub fn is_failed(&self) -> bool {
        matches!(self, StepState::Error | StepState::Timeout)
    }
}

impl fmt::Display for StepState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepState::New => write!(f, "new"),
            StepState::Pending => write!(f, "pending"),
            StepState::Done => write!(f, "done"),
            StepState::Error => write!(f, "error"),
            StepState::Timeout => write!(f, "timeout"),
        }
    }
}

/// Everything a step action sees during a poll
pub struct StepContext<'a> {
    /// The workflow's shared parameters
    pub params: &'a WorkflowParams,

    /// The recorded result of the step's task, once one arrived
    pub result: Option<&'a TaskResult>,
}

/// The behavior of a step, supplied by the workflow author.
///
/// `create_task` posts the step's task (usually through
/// `ctx.params.dispatcher()`) and returns its id; `verify_done` decides
/// whether the step's goal is met; `post_step` runs side effects right
/// before the step completes.
pub trait StepAction: Send {
    fn create_task(&mut self, ctx: &StepContext<'_>) -> Option<TaskId>;

    fn verify_done(&mut self, ctx: &StepContext<'_>) -> bool;

    fn post_step(&mut self, _ctx: &StepContext<'_>) {}
}

/// A stateful unit within a workflow: emits one task, consumes one result.
///
/// The machine advances only inside [`FlowStep::poll`]; result delivery via
/// [`FlowStep::set_task_result`] just records. Every state change sets the
/// dirty bit and logs the transition.
pub struct FlowStep {
    name: String,
    action: Box<dyn StepAction>,
    state: StepState,
    dirty: bool,
    task_id: Option<TaskId>,
    task_created_at: Option<DateTime<Utc>>,
    timeout: Duration,
    result: Option<TaskResult>,
    failure_reason: Option<String>,
}

impl FlowStep {
    /// Create a step with no timeout
    pub fn new(name: impl Into<String>, action: impl StepAction + 'static) -> Self {
        Self {
            name: name.into(),
            action: Box::new(action),
            state: StepState::New,
            dirty: true,
            task_id: None,
            task_created_at: None,
            timeout: Duration::ZERO,
            result: None,
            failure_reason: None,
        }
    }

    /// Set the wall-clock deadline measured from PENDING entry.
    ///
    /// A zero duration means no timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Get step name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get current state
    pub fn state(&self) -> StepState {
        self.state
    }

    /// Id of the emitted task; set once the step has been PENDING
    pub fn task_id(&self) -> Option<TaskId> {
        self.task_id
    }

    /// Failure reason, if the step failed
    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    /// Check whether the step completed successfully
    pub fn is_done(&self) -> bool {
        self.state == StepState::Done
    }

    /// Check whether the step still has work ahead (NEW or PENDING)
    pub fn is_pending(&self) -> bool {
        matches!(self.state, StepState::New | StepState::Pending)
    }

    /// Alias of [`FlowStep::is_pending`] used by traversal code
    pub fn is_incomplete(&self) -> bool {
        self.is_pending()
    }

    /// Check whether the step failed (ERROR or TIMEOUT)
    pub fn is_failed(&self) -> bool {
        self.state.is_failed()
    }

    /// Check whether the step reached any terminal state
    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }

    /// Check whether the state changed since the last `clear_dirty`
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Acknowledge an observed state change
    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    fn transition(&mut self, next: StepState, event: &str) {
        info!("step {} changed to {} by event {}", self.name, next, event);
        self.state = next;
        self.dirty = true;
    }

    /// Advance the state machine one step.
    ///
    /// NEW: verify first (a step may already be satisfied), otherwise emit
    /// the task. PENDING: check the deadline, then consume a recorded result.
    /// Terminal states never change here.
    pub fn poll(&mut self, params: &WorkflowParams) {
        match self.state {
            StepState::New => {
                let already_done = {
                    let ctx = StepContext {
                        params,
                        result: None,
                    };
                    self.action.verify_done(&ctx)
                };
                if already_done {
                    self.transition(StepState::Done, "task_done");
                    return;
                }

                let task_id = {
                    let ctx = StepContext {
                        params,
                        result: None,
                    };
                    self.action.create_task(&ctx)
                };
                match task_id {
                    Some(task_id) => {
                        self.task_id = Some(task_id);
                        self.task_created_at = Some(Utc::now());
                        self.transition(StepState::Pending, "task_created");
                    }
                    None => {
                        error!("step {} failed to create task", self.name);
                        self.failure_reason = Some("create_task returned no task".to_string());
                        self.transition(StepState::Error, "task_failed");
                    }
                }
            }
            StepState::Pending => {
                if self.deadline_exceeded() {
                    self.transition(StepState::Timeout, "timeout");
                    return;
                }

                let Some(result) = self.result.clone() else {
                    return;
                };

                if result.is_failed() {
                    self.failure_reason = Some(
                        result
                            .failure_reason()
                            .unwrap_or("task failed")
                            .to_string(),
                    );
                    self.transition(StepState::Error, "task_failed");
                    return;
                }

                let ctx = StepContext {
                    params,
                    result: Some(&result),
                };
                if self.action.verify_done(&ctx) {
                    self.action.post_step(&ctx);
                    self.transition(StepState::Done, "task_done");
                } else {
                    self.failure_reason = Some("verification failed".to_string());
                    self.transition(StepState::Error, "task_failed");
                }
            }
            StepState::Done | StepState::Error | StepState::Timeout => {}
        }
    }

    fn deadline_exceeded(&self) -> bool {
        if self.timeout.is_zero() {
            return false;
        }
        let Some(created) = self.task_created_at else {
            return false;
        };
        match chrono::Duration::from_std(self.timeout) {
            Ok(limit) => Utc::now() - created > limit,
            Err(_) => false,
        }
    }

    /// Record the result of the step's task; the next poll observes it
    pub fn set_task_result(&mut self, result: TaskResult) {
        debug!(
            "step {} received result for task {}",
            self.name,
            result.result_task_id()
        );
        self.result = Some(result);
    }

    /// Fail the step directly, e.g. when its parent failed.
    ///
    /// Terminal states are left untouched; a step only leaves a terminal
    /// state through [`FlowStep::reset`].
    pub fn fail(&mut self, reason: impl Into<String>) {
        if self.state.is_terminal() {
            warn!(
                "step {} already {}, ignoring failure",
                self.name, self.state
            );
            return;
        }
        self.failure_reason = Some(reason.into());
        self.transition(StepState::Error, "task_failed");
    }

    /// Recycle the step back to NEW from PENDING, ERROR or TIMEOUT.
    ///
    /// Clears the recorded result and timestamps so the fresh attempt cannot
    /// complete against stale state. A no-op on NEW; refused on DONE.
    pub fn reset(&mut self) {
        match self.state {
            StepState::New => {}
            StepState::Done => {
                warn!("step {} is done, refusing reset", self.name);
            }
            StepState::Pending | StepState::Error | StepState::Timeout => {
                self.result = None;
                self.failure_reason = None;
                self.task_created_at = None;
                self.transition(StepState::New, "reset");
            }
        }
    }
}

impl fmt::Debug for FlowStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowStep")
            .field("name", &self.name)
            .field("state", &self.state)
            .field("task_id", &self.task_id)
            .field("dirty", &self.dirty)
            .finish()
    }
}
