//! Durable queue round-trips against a live Redis.
//!
//! Requires a reachable server (REDIS_URL or redis://127.0.0.1:6379); run
//! with `cargo test --features integration-tests`.

#![cfg(feature = "integration-tests")]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use taskmill_core::{
    Dao, Entity, ExecutorConfig, HandlerContext, JobManager, RedisConfig, RedisDao, RedisPool,
    RedisTaskQueue, Task, TaskCodecRegistry, TaskDispatcher, TaskMessage, TaskQueue, TaskResult,
};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PingTask {
    sequence: u32,
}

impl Task for PingTask {
    fn kind(&self) -> &'static str {
        "ping_task"
    }
}

fn redis_pool() -> RedisPool {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let config = RedisConfig {
        url,
        ..Default::default()
    };
    RedisPool::new(config).expect("redis must be reachable for integration tests")
}

fn fast_executor() -> ExecutorConfig {
    ExecutorConfig {
        workers: 4,
        steal_backoff_ms: 2,
        wait_idle_ms: 1,
    }
}

fn wait_until(timeout: Duration, mut pred: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if pred() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    pred()
}

fn counting_dispatcher(
    queue: Arc<RedisTaskQueue>,
    handled: Arc<AtomicUsize>,
) -> TaskDispatcher {
    let dispatcher = TaskDispatcher::new(queue, JobManager::new(fast_executor()));
    dispatcher.subscribe::<PingTask>(Arc::new(
        move |_task: Arc<TaskMessage>, _ctx: &HandlerContext<'_>| -> Option<TaskResult> {
            handled.fetch_add(1, Ordering::SeqCst);
            None
        },
    ));
    dispatcher
}

#[test]
fn round_trip_through_durable_queue() -> anyhow::Result<()> {
    TaskCodecRegistry::global().register_as::<PingTask>("ping_task");

    let pool = redis_pool();
    let queue = Arc::new(RedisTaskQueue::new(pool.clone()));
    let queue_id = queue.queue_id();

    // Tasks are durable before any dispatcher exists
    for sequence in 0..3 {
        queue.put(TaskMessage::new(PingTask { sequence }))?;
    }
    assert_eq!(queue.len()?, 3);

    let handled = Arc::new(AtomicUsize::new(0));
    let dispatcher = counting_dispatcher(queue.clone(), handled.clone());
    dispatcher.start();

    assert!(wait_until(Duration::from_secs(30), || {
        handled.load(Ordering::SeqCst) == 3
    }));

    // An empty pop ends the durable dispatch loop
    assert!(wait_until(Duration::from_secs(30), || dispatcher.is_exited()));
    dispatcher.job_manager().join(None);

    // Restart: a fresh dispatcher over the same queue id picks up new work
    for sequence in 3..5 {
        queue.put(TaskMessage::new(PingTask { sequence }))?;
    }

    let handled_after_restart = Arc::new(AtomicUsize::new(0));
    let restarted_queue = Arc::new(RedisTaskQueue::with_queue_id(pool, queue_id));
    let dispatcher = counting_dispatcher(restarted_queue.clone(), handled_after_restart.clone());
    dispatcher.start();

    assert!(wait_until(Duration::from_secs(30), || {
        handled_after_restart.load(Ordering::SeqCst) == 2
    }));
    assert!(wait_until(Duration::from_secs(30), || dispatcher.is_exited()));
    dispatcher.job_manager().join(None);

    restarted_queue.clear()?;
    Ok(())
}

#[test]
fn durable_payloads_survive_the_wire() -> anyhow::Result<()> {
    TaskCodecRegistry::global().register_as::<PingTask>("ping_task");

    let pool = redis_pool();
    let queue = RedisTaskQueue::new(pool);

    let posted = TaskMessage::new(PingTask { sequence: 99 });
    let posted_id = posted.task_id();
    queue.put(posted)?;

    let guard = queue.fetch_task();
    let fetched = guard.task().expect("task expected");
    assert_eq!(fetched.task_id(), posted_id);
    assert_eq!(
        fetched.downcast_ref::<PingTask>().map(|t| t.sequence),
        Some(99)
    );
    drop(guard);

    assert!(queue.is_empty()?);
    queue.clear()?;
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RunRecord {
    id: Option<Uuid>,
    label: String,
}

impl Entity for RunRecord {
    fn id(&self) -> Option<Uuid> {
        self.id
    }
}

#[test]
fn entity_dao_round_trip() -> anyhow::Result<()> {
    let dao: RedisDao<RunRecord> = RedisDao::new(redis_pool(), "test_run_record");

    let id = dao.create_or_update(&RunRecord {
        id: None,
        label: "first".to_string(),
    })?;
    let loaded = dao.get(id)?.expect("stored entity");
    assert_eq!(loaded.label, "first");
    assert!(dao.keys()?.contains(&id));

    dao.delete(id)?;
    assert!(dao.get(id)?.is_none());
    Ok(())
}
