//! Durable task queue backed by a Redis list

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, error};
use uuid::Uuid;

use crate::dispatch::{FetchGuard, QueueError, QueueResult, TaskMessage, TaskQueue};
use crate::storage::{transaction, RedisPool, StorageResult, TaskCodecRegistry};

const QUEUE_KEY_PREFIX: &str = "task_queue";

/// Task queue over a named Redis list.
///
/// Payloads are encoded through a [`TaskCodecRegistry`] and pushed with an
/// atomic LPUSH; fetching is a non-blocking atomic RPOP, so an empty pop
/// ends the dispatch loop rather than rescheduling it. Tasks survive process
/// restarts; delivery is at-least-once.
pub struct RedisTaskQueue {
    pool: RedisPool,
    codec: &'static TaskCodecRegistry,
    queue_id: Uuid,
    closed: AtomicBool,
}

impl RedisTaskQueue {
    /// Create a queue under a fresh queue id, using the global codec registry
    pub fn new(pool: RedisPool) -> Self {
        Self::with_queue_id(pool, Uuid::new_v4())
    }

    /// Create a queue bound to an existing queue id, e.g. to resume
    /// consumption after a restart
    pub fn with_queue_id(pool: RedisPool, queue_id: Uuid) -> Self {
        Self {
            pool,
            codec: TaskCodecRegistry::global(),
            queue_id,
            closed: AtomicBool::new(false),
        }
    }

    /// The id naming this queue's Redis list
    pub fn queue_id(&self) -> Uuid {
        self.queue_id
    }

    /// Number of tasks currently queued
    pub fn len(&self) -> StorageResult<usize> {
        transaction(&self.pool, QUEUE_KEY_PREFIX, |ctx| {
            ctx.list_len(self.queue_id)
        })
    }

    /// Check whether the queue holds no tasks
    pub fn is_empty(&self) -> StorageResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Remove every queued task
    pub fn clear(&self) -> StorageResult<()> {
        transaction(&self.pool, QUEUE_KEY_PREFIX, |ctx| {
            ctx.delete(self.queue_id)
        })
    }
}

impl TaskQueue for RedisTaskQueue {
    fn put(&self, task: TaskMessage) -> QueueResult<()> {
        if self.is_closed() {
            return Err(QueueError::Closed);
        }

        let payload = self
            .codec
            .encode_to_string(&task)
            .map_err(|e| QueueError::Codec(e.to_string()))?;

        debug!("task {} pushed to queue {}", task.task_id(), self.queue_id);
        transaction(&self.pool, QUEUE_KEY_PREFIX, |ctx| {
            ctx.list_push(self.queue_id, &payload)
        })
        .map_err(|e| QueueError::Backend(e.to_string()))
    }

    fn fetch_task(&self) -> FetchGuard<'_> {
        if self.is_closed() {
            return FetchGuard::empty();
        }

        let popped = transaction(&self.pool, QUEUE_KEY_PREFIX, |ctx| {
            ctx.list_pop(self.queue_id)
        });

        match popped {
            Ok(Some(raw)) => match self.codec.decode_from_slice(raw.as_bytes()) {
                Ok(message) => FetchGuard::new(Arc::new(message), self),
                Err(e) => {
                    error!("dropping undecodable task payload: {}", e);
                    FetchGuard::empty()
                }
            },
            Ok(None) => FetchGuard::empty(),
            Err(e) => {
                error!("failed to pop task from queue {}: {}", self.queue_id, e);
                FetchGuard::empty()
            }
        }
    }

    fn restore(&self, task: Arc<TaskMessage>) {
        let payload = match self.codec.encode_to_string(&task) {
            Ok(payload) => payload,
            Err(e) => {
                error!("cannot restore task {}: {}", task.task_id(), e);
                return;
            }
        };

        let restored = transaction(&self.pool, QUEUE_KEY_PREFIX, |ctx| {
            ctx.list_requeue(self.queue_id, &payload)
        });
        if let Err(e) = restored {
            error!("failed to restore task {}: {}", task.task_id(), e);
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn reschedule_on_empty(&self) -> bool {
        false
    }
}

impl std::fmt::Debug for RedisTaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisTaskQueue")
            .field("queue_id", &self.queue_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
