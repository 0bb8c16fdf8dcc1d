//! End-to-end workflows over the dispatcher feedback loop

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use taskmill_core::workflow::lock_workflow;
use taskmill_core::{
    DispatcherConfig, ExecutorConfig, FlowStep, HandlerContext, InMemoryTaskQueue, JobManager,
    StepAction, StepContext, StepState, Task, TaskDispatcher, TaskHandler, TaskId, TaskMessage,
    TaskResult, WorkflowManager, WorkflowParams,
};

#[derive(Debug, Default)]
struct ProbeTask;
#[derive(Debug, Default)]
struct DoomedTask;

impl Task for ProbeTask {}
impl Task for DoomedTask {}

/// Answers every task with a successful result
struct EchoHandler;

impl TaskHandler for EchoHandler {
    fn handle(&self, task: Arc<TaskMessage>, _ctx: &HandlerContext<'_>) -> Option<TaskResult> {
        Some(TaskResult::new(task))
    }
}

/// Answers every task with a failed result
struct FailingEchoHandler;

impl TaskHandler for FailingEchoHandler {
    fn handle(&self, task: Arc<TaskMessage>, _ctx: &HandlerContext<'_>) -> Option<TaskResult> {
        Some(TaskResult::new(task).with_failure("probe exploded"))
    }
}

/// Posts a ProbeTask through the dispatcher carried in the workflow params;
/// done once its result came back.
struct PostingAction;

impl StepAction for PostingAction {
    fn create_task(&mut self, ctx: &StepContext<'_>) -> Option<TaskId> {
        ctx.params
            .dispatcher()
            .and_then(|dispatcher| dispatcher.post_task(ProbeTask).ok())
    }

    fn verify_done(&mut self, ctx: &StepContext<'_>) -> bool {
        ctx.result.is_some()
    }
}

/// Same as [`PostingAction`] but the task draws the failing echo
struct DoomedAction;

impl StepAction for DoomedAction {
    fn create_task(&mut self, ctx: &StepContext<'_>) -> Option<TaskId> {
        ctx.params
            .dispatcher()
            .and_then(|dispatcher| dispatcher.post_task(DoomedTask).ok())
    }

    fn verify_done(&mut self, ctx: &StepContext<'_>) -> bool {
        ctx.result.is_some()
    }
}

/// Records a value into the params-visible side channel when the step
/// completes; proves post_step ran exactly on success.
struct PostStepProbe {
    label: &'static str,
    observed: Arc<std::sync::Mutex<Vec<String>>>,
}

impl StepAction for PostStepProbe {
    fn create_task(&mut self, ctx: &StepContext<'_>) -> Option<TaskId> {
        ctx.params
            .dispatcher()
            .and_then(|dispatcher| dispatcher.post_task(ProbeTask).ok())
    }

    fn verify_done(&mut self, ctx: &StepContext<'_>) -> bool {
        ctx.result.is_some()
    }

    fn post_step(&mut self, ctx: &StepContext<'_>) {
        let suffix = ctx
            .params
            .value("run")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        self.observed
            .lock()
            .unwrap()
            .push(format!("{}:{}", self.label, suffix));
    }
}

struct Harness {
    dispatcher: TaskDispatcher,
    workflow_manager: WorkflowManager,
}

impl Harness {
    fn new() -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
        let manager = JobManager::new(ExecutorConfig {
            workers: 4,
            steal_backoff_ms: 2,
            wait_idle_ms: 1,
        });
        let queue = Arc::new(InMemoryTaskQueue::from_config(&DispatcherConfig {
            fetch_timeout_ms: 20,
        }));
        let dispatcher = TaskDispatcher::new(queue, manager);

        let workflow_manager = WorkflowManager::new(0);
        dispatcher.register_task_handler(Arc::new(workflow_manager.clone()));
        dispatcher.subscribe::<ProbeTask>(Arc::new(EchoHandler));
        dispatcher.subscribe::<DoomedTask>(Arc::new(FailingEchoHandler));
        dispatcher.start();

        Self {
            dispatcher,
            workflow_manager,
        }
    }

    fn params(&self) -> WorkflowParams {
        WorkflowParams::new().with_dispatcher(self.dispatcher.clone())
    }

    /// Poll until every step reached a terminal state
    fn drive_to_finish(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            self.workflow_manager.poll();
            if self.workflow_manager.all_finished() {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("workflow did not finish within {:?}", timeout);
    }

    fn shutdown(self) {
        self.dispatcher.terminate().expect("terminate dispatcher");
        let deadline = Instant::now() + Duration::from_secs(5);
        while !self.dispatcher.is_exited() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(self.dispatcher.is_exited());
        self.dispatcher.job_manager().join(None);
    }
}

#[test]
fn workflow_success() {
    let harness = Harness::new();

    let builder = harness
        .workflow_manager
        .create()
        .then_do(FlowStep::new("step1", PostingAction), None)
        .expect("step1")
        .then_do(FlowStep::new("step2", PostingAction), Some("step1"))
        .expect("step2")
        .then_do(FlowStep::new("step3", PostingAction), Some("step1"))
        .expect("step3")
        .with_params(harness.params());
    let workflow = builder.workflow();

    harness.drive_to_finish(Duration::from_secs(10));

    assert!(harness.workflow_manager.all_done());
    assert!(harness.workflow_manager.all_finished());
    lock_workflow(&workflow).for_each_step(|step| {
        assert_eq!(step.state(), StepState::Done, "step {}", step.name());
    });

    harness.shutdown();
}

#[test]
fn workflow_with_failing_step_propagates() {
    let harness = Harness::new();

    let builder = harness
        .workflow_manager
        .create()
        .then_do(FlowStep::new("step1", PostingAction), None)
        .expect("step1")
        .then_do(FlowStep::new("step2", DoomedAction), Some("step1"))
        .expect("step2")
        .then_do(FlowStep::new("step3", PostingAction), Some("step1"))
        .expect("step3")
        .then_do(FlowStep::new("step4", PostingAction), Some("step2"))
        .expect("step4")
        .with_params(harness.params());
    let workflow = builder.workflow();

    harness.drive_to_finish(Duration::from_secs(10));

    assert!(harness.workflow_manager.all_finished());
    assert!(!harness.workflow_manager.all_done());

    {
        let workflow = lock_workflow(&workflow);
        assert_eq!(workflow.step("step1").unwrap().state(), StepState::Done);
        assert_eq!(workflow.step("step3").unwrap().state(), StepState::Done);
        assert_eq!(workflow.step("step2").unwrap().state(), StepState::Error);
        assert_eq!(workflow.step("step4").unwrap().state(), StepState::Error);
        assert_eq!(
            workflow.step("step2").unwrap().failure_reason(),
            Some("probe exploded")
        );
        assert_eq!(
            workflow.step("step4").unwrap().failure_reason(),
            Some("Parent step failed")
        );

        let mut failed = 0;
        workflow.for_each_step(|step| {
            if step.is_failed() {
                failed += 1;
            }
        });
        assert_eq!(failed, 2);
    }

    harness.shutdown();
}

#[test]
fn post_step_runs_on_success_with_shared_params() {
    let harness = Harness::new();
    let observed = Arc::new(std::sync::Mutex::new(Vec::new()));

    harness
        .workflow_manager
        .create()
        .then_do(
            FlowStep::new(
                "announce",
                PostStepProbe {
                    label: "announce",
                    observed: observed.clone(),
                },
            ),
            None,
        )
        .expect("announce")
        .with_params(harness.params().with_value("run", "nightly"));

    harness.drive_to_finish(Duration::from_secs(10));

    assert!(harness.workflow_manager.all_done());
    assert_eq!(observed.lock().unwrap().as_slice(), ["announce:nightly"]);

    harness.shutdown();
}

#[test]
fn dispatch_round_trip_law() {
    // Posting a task whose handler returns TaskResult(task) delivers a result
    // with the posted task's id back to the matching step.
    let harness = Harness::new();

    let builder = harness
        .workflow_manager
        .create()
        .then_do(FlowStep::new("only", PostingAction), None)
        .expect("only")
        .with_params(harness.params());
    let workflow = builder.workflow();

    // First poll emits the task
    harness.workflow_manager.poll();
    let posted_id = lock_workflow(&workflow)
        .step("only")
        .unwrap()
        .task_id()
        .expect("task emitted");

    harness.drive_to_finish(Duration::from_secs(10));

    let workflow = lock_workflow(&workflow);
    let step = workflow.step("only").unwrap();
    assert_eq!(step.state(), StepState::Done);
    assert_eq!(step.task_id(), Some(posted_id));

    harness.shutdown();
}

#[test]
fn timed_out_step_recycles_and_completes() {
    // No handler ever answers SilentTask, so the step must time out; after a
    // reset it completes through the normal path.
    #[derive(Debug, Default)]
    struct SilentTask;
    impl Task for SilentTask {}

    struct FlakyAction {
        attempts: usize,
    }

    impl StepAction for FlakyAction {
        fn create_task(&mut self, ctx: &StepContext<'_>) -> Option<TaskId> {
            self.attempts += 1;
            let dispatcher = ctx.params.dispatcher()?;
            if self.attempts == 1 {
                dispatcher.post_task(SilentTask).ok()
            } else {
                dispatcher.post_task(ProbeTask).ok()
            }
        }

        fn verify_done(&mut self, ctx: &StepContext<'_>) -> bool {
            ctx.result.is_some()
        }
    }

    let harness = Harness::new();
    let builder = harness
        .workflow_manager
        .create()
        .then_do(
            FlowStep::new("flaky", FlakyAction { attempts: 0 })
                .with_timeout(Duration::from_millis(30)),
            None,
        )
        .expect("flaky")
        .with_params(harness.params());
    let workflow = builder.workflow();

    // Drive until the step times out
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        harness.workflow_manager.poll();
        let state = lock_workflow(&workflow).step("flaky").unwrap().state();
        if state == StepState::Timeout {
            break;
        }
        assert!(Instant::now() < deadline, "step never timed out");
        std::thread::sleep(Duration::from_millis(5));
    }

    harness.workflow_manager.reset_steps_with_timeout();
    assert_eq!(
        lock_workflow(&workflow).step("flaky").unwrap().state(),
        StepState::New
    );

    harness.drive_to_finish(Duration::from_secs(10));
    assert!(harness.workflow_manager.all_done());

    harness.shutdown();
}
