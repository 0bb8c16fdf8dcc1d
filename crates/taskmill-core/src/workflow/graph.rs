//! Workflow trees and the builder that grows them

use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use crate::workflow::{FlowStep, WorkflowError, WorkflowParams};

/// Handle to a workflow shared between its builder, the manager and result
/// delivery
pub type SharedWorkflow = Arc<Mutex<Workflow>>;

/// Lock a shared workflow, recovering from poisoning
pub fn lock_workflow(workflow: &SharedWorkflow) -> std::sync::MutexGuard<'_, Workflow> {
    workflow.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A step plus its ordered children. The workflow root carries no step.
pub struct WorkflowNode {
    step: Option<FlowStep>,
    children: Vec<WorkflowNode>,
}

impl WorkflowNode {
    fn root() -> Self {
        Self {
            step: None,
            children: Vec::new(),
        }
    }

    fn new(step: FlowStep) -> Self {
        Self {
            step: Some(step),
            children: Vec::new(),
        }
    }

    /// The node's step; `None` only for the root
    pub fn step(&self) -> Option<&FlowStep> {
        self.step.as_ref()
    }

    /// The node's children in insertion order
    pub fn children(&self) -> &[WorkflowNode] {
        &self.children
    }

    fn add_child(&mut self, node: WorkflowNode) {
        self.children.push(node);
    }

    fn find_mut(&mut self, name: &str) -> Option<&mut WorkflowNode> {
        if self.step.as_ref().is_some_and(|step| step.name() == name) {
            return Some(self);
        }
        for child in &mut self.children {
            if let Some(found) = child.find_mut(name) {
                return Some(found);
            }
        }
        None
    }

    fn find(&self, name: &str) -> Option<&WorkflowNode> {
        if self.step.as_ref().is_some_and(|step| step.name() == name) {
            return Some(self);
        }
        for child in &self.children {
            if let Some(found) = child.find(name) {
                return Some(found);
            }
        }
        None
    }

    fn for_each_node(&self, f: &mut impl FnMut(&WorkflowNode)) {
        f(self);
        for child in &self.children {
            child.for_each_node(f);
        }
    }

    fn for_each_step(&self, f: &mut impl FnMut(&FlowStep)) {
        if let Some(step) = &self.step {
            f(step);
        }
        for child in &self.children {
            child.for_each_step(f);
        }
    }

    fn for_each_step_mut(&mut self, f: &mut impl FnMut(&mut FlowStep)) {
        if let Some(step) = &mut self.step {
            f(step);
        }
        for child in &mut self.children {
            child.for_each_step_mut(f);
        }
    }

    /// The pruned traversal gating the whole engine: incomplete steps are
    /// visited without descending, done steps and stepless nodes are
    /// descended through, failed steps prune their subtree.
    fn for_each_incomplete_step_mut(&mut self, f: &mut impl FnMut(&mut FlowStep)) {
        match &mut self.step {
            Some(step) if step.is_incomplete() => f(step),
            Some(step) if step.is_done() => {
                for child in &mut self.children {
                    child.for_each_incomplete_step_mut(f);
                }
            }
            Some(_) => {}
            None => {
                for child in &mut self.children {
                    child.for_each_incomplete_step_mut(f);
                }
            }
        }
    }

    /// Mark every step below this node as failed, skipping terminal ones
    fn fail_descendants(&mut self, reason: &str) {
        for child in &mut self.children {
            if let Some(step) = &mut child.step {
                if !step.is_finished() {
                    step.fail(reason);
                }
            }
            child.fail_descendants(reason);
        }
    }

    /// Poll incomplete steps under this node, honoring the pruning rule and
    /// a poll budget. Returns `false` once the budget is exhausted.
    fn poll_incomplete(
        &mut self,
        params: &WorkflowParams,
        polled: &mut usize,
        max_count: usize,
    ) -> bool {
        match &mut self.step {
            Some(step) if step.is_incomplete() => {
                step.poll(params);
                *polled += 1;
                if step.is_failed() {
                    self.fail_descendants("Parent step failed");
                }
                if max_count > 0 && *polled >= max_count {
                    return false;
                }
            }
            Some(step) if step.is_done() => {
                for child in &mut self.children {
                    if !child.poll_incomplete(params, polled, max_count) {
                        return false;
                    }
                }
            }
            Some(_) => {}
            None => {
                for child in &mut self.children {
                    if !child.poll_incomplete(params, polled, max_count) {
                        return false;
                    }
                }
            }
        }
        true
    }
}

/// A rooted tree of steps sharing one parameter bundle
pub struct Workflow {
    root: WorkflowNode,
    params: WorkflowParams,
}

impl Workflow {
    /// Create an empty workflow
    pub fn new() -> Self {
        Self {
            root: WorkflowNode::root(),
            params: WorkflowParams::default(),
        }
    }

    /// The shared parameters passed to every step poll
    pub fn params(&self) -> &WorkflowParams {
        &self.params
    }

    pub(crate) fn set_params(&mut self, params: WorkflowParams) {
        self.params = params;
    }

    /// The root node
    pub fn root(&self) -> &WorkflowNode {
        &self.root
    }

    /// Look up a step by name
    pub fn step(&self, name: &str) -> Option<&FlowStep> {
        self.root.find(name).and_then(|node| node.step())
    }

    /// Check whether a step with this name exists
    pub fn contains_step(&self, name: &str) -> bool {
        self.root.find(name).is_some()
    }

    /// Number of steps in the tree
    pub fn step_count(&self) -> usize {
        let mut count = 0;
        self.root.for_each_step(&mut |_| count += 1);
        count
    }

    /// Visit every node, root included
    pub fn for_each_node(&self, mut f: impl FnMut(&WorkflowNode)) {
        self.root.for_each_node(&mut f);
    }

    /// Visit every step
    pub fn for_each_step(&self, mut f: impl FnMut(&FlowStep)) {
        self.root.for_each_step(&mut f);
    }

    /// Visit every step mutably
    pub fn for_each_step_mut(&mut self, mut f: impl FnMut(&mut FlowStep)) {
        self.root.for_each_step_mut(&mut f);
    }

    /// Visit incomplete steps with the blocking rule applied: a child is
    /// never visited before its parent step is done
    pub fn for_each_incomplete_step_mut(&mut self, mut f: impl FnMut(&mut FlowStep)) {
        self.root.for_each_incomplete_step_mut(&mut f);
    }

    /// Poll incomplete steps, at most `max_count` of them (0 = unlimited).
    ///
    /// A step failing during the poll marks all of its descendants as failed.
    /// Returns the number of steps polled.
    pub fn poll(&mut self, max_count: usize) -> usize {
        let params = self.params.clone();
        let mut polled = 0;
        self.root.poll_incomplete(&params, &mut polled, max_count);
        polled
    }

    /// Check whether every step completed successfully; an empty tree is done
    pub fn is_done(&self) -> bool {
        let mut done = true;
        self.for_each_step(|step| {
            if !step.is_done() {
                done = false;
            }
        });
        done
    }

    /// Check whether every step reached a terminal state
    pub fn is_finished(&self) -> bool {
        let mut finished = true;
        self.for_each_step(|step| {
            if !step.is_finished() {
                finished = false;
            }
        });
        finished
    }

    /// Check whether any step still has work ahead
    pub fn is_pending(&self) -> bool {
        let mut pending = false;
        self.for_each_step(|step| {
            if step.is_pending() {
                pending = true;
            }
        });
        pending
    }

    /// Check whether any step failed
    pub fn is_failed(&self) -> bool {
        let mut failed = false;
        self.for_each_step(|step| {
            if step.is_failed() {
                failed = true;
            }
        });
        failed
    }
}

impl Default for Workflow {
    fn default() -> Self {
        Self::new()
    }
}

/// Grows a workflow tree step by step
pub struct WorkflowBuilder {
    workflow: SharedWorkflow,
}

impl WorkflowBuilder {
    /// Build over an existing shared workflow
    pub fn new(workflow: SharedWorkflow) -> Self {
        Self { workflow }
    }

    /// Insert a step as a child of the named step, or of the root when
    /// `after` is `None`.
    pub fn then_do(self, step: FlowStep, after: Option<&str>) -> Result<Self, WorkflowError> {
        let mut workflow = lock_workflow(&self.workflow);

        if workflow.contains_step(step.name()) {
            return Err(WorkflowError::DuplicateStep(step.name().to_string()));
        }

        debug!("inserting step={} after={:?}", step.name(), after);
        let parent = match after {
            None => &mut workflow.root,
            Some(name) => workflow
                .root
                .find_mut(name)
                .ok_or_else(|| WorkflowError::NoSuchStep(name.to_string()))?,
        };
        parent.add_child(WorkflowNode::new(step));

        drop(workflow);
        Ok(self)
    }

    /// Record the shared parameters for every poll call
    pub fn with_params(self, params: WorkflowParams) -> Self {
        lock_workflow(&self.workflow).set_params(params);
        self
    }

    /// The workflow under construction
    pub fn workflow(&self) -> SharedWorkflow {
        self.workflow.clone()
    }
}
