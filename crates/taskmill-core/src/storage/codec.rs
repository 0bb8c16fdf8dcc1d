//! Task serialization for durable queues

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::dispatch::{Task, TaskId, TaskMessage, TaskResult};
use crate::storage::{StorageError, StorageResult};

/// Wire shape of a queued task: a base64-armored JSON payload under the
/// task's kind, or a result envelope nesting its originating task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskEnvelope {
    Task {
        task_id: Uuid,
        kind: String,
        payload: String,
    },
    Result {
        task: Box<TaskEnvelope>,
        failed: bool,
        reason: Option<String>,
    },
}

type EncodeFn = Box<dyn Fn(&TaskMessage) -> StorageResult<String> + Send + Sync>;
type DecodeFn = Box<dyn Fn(TaskId, &[u8]) -> StorageResult<TaskMessage> + Send + Sync>;

struct Codec {
    encode: EncodeFn,
    decode: DecodeFn,
}

/// Registry of task types allowed to cross a durable queue.
///
/// [`TaskResult`] needs no registration: result envelopes are handled
/// structurally, nesting the originating task's envelope.
#[derive(Default)]
pub struct TaskCodecRegistry {
    codecs: DashMap<String, Codec>,
}

static GLOBAL_REGISTRY: Lazy<TaskCodecRegistry> = Lazy::new(TaskCodecRegistry::new);

impl TaskCodecRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            codecs: DashMap::new(),
        }
    }

    /// The process-wide registry durable queues default to
    pub fn global() -> &'static TaskCodecRegistry {
        &GLOBAL_REGISTRY
    }

    /// Register a task type under its default kind name
    pub fn register<T: Task + Serialize + DeserializeOwned>(&self) {
        self.register_as::<T>(std::any::type_name::<T>());
    }

    /// Register a task type under an explicit kind name.
    ///
    /// Tasks overriding [`Task::kind`] must register under the same name.
    pub fn register_as<T: Task + Serialize + DeserializeOwned>(&self, kind: &'static str) {
        debug!("task codec registered for kind {}", kind);
        self.codecs.insert(
            kind.to_string(),
            Codec {
                encode: Box::new(|message| {
                    let task = message.downcast_ref::<T>().ok_or_else(|| {
                        StorageError::Codec(format!(
                            "payload of task {} does not match its registered kind",
                            message.task_id()
                        ))
                    })?;
                    let bytes = serde_json::to_vec(task)
                        .map_err(|e| StorageError::Codec(e.to_string()))?;
                    Ok(BASE64.encode(bytes))
                }),
                decode: Box::new(|task_id, bytes| {
                    let task: T = serde_json::from_slice(bytes)
                        .map_err(|e| StorageError::Codec(e.to_string()))?;
                    Ok(TaskMessage::with_id(task_id, task))
                }),
            },
        );
    }

    /// Check whether a kind has a codec
    pub fn contains(&self, kind: &str) -> bool {
        self.codecs.contains_key(kind)
    }

    /// Encode a task message into its wire envelope
    pub fn encode(&self, message: &TaskMessage) -> StorageResult<TaskEnvelope> {
        if let Some(result) = message.downcast_ref::<TaskResult>() {
            let inner = self.encode(result.task())?;
            return Ok(TaskEnvelope::Result {
                task: Box::new(inner),
                failed: result.is_failed(),
                reason: result.failure_reason().map(str::to_string),
            });
        }

        let codec = self.codecs.get(message.kind()).ok_or_else(|| {
            StorageError::Codec(format!(
                "no codec registered for task kind '{}'",
                message.kind()
            ))
        })?;
        Ok(TaskEnvelope::Task {
            task_id: message.task_id(),
            kind: message.kind().to_string(),
            payload: (codec.encode)(message)?,
        })
    }

    /// Decode a wire envelope back into a task message
    pub fn decode(&self, envelope: &TaskEnvelope) -> StorageResult<TaskMessage> {
        match envelope {
            TaskEnvelope::Task {
                task_id,
                kind,
                payload,
            } => {
                let codec = self.codecs.get(kind).ok_or_else(|| {
                    StorageError::Codec(format!("no codec registered for task kind '{}'", kind))
                })?;
                let bytes = BASE64
                    .decode(payload)
                    .map_err(|e| StorageError::Codec(e.to_string()))?;
                (codec.decode)(*task_id, &bytes)
            }
            TaskEnvelope::Result {
                task,
                failed,
                reason,
            } => {
                let inner = self.decode(task)?;
                let mut result = TaskResult::new(Arc::new(inner));
                if *failed {
                    result = result.with_failure(reason.clone().unwrap_or_default());
                }
                Ok(TaskMessage::new(result))
            }
        }
    }

    /// Encode a task message to its JSON wire string
    pub fn encode_to_string(&self, message: &TaskMessage) -> StorageResult<String> {
        let envelope = self.encode(message)?;
        serde_json::to_string(&envelope).map_err(|e| StorageError::Codec(e.to_string()))
    }

    /// Decode a JSON wire string back into a task message
    pub fn decode_from_slice(&self, data: &[u8]) -> StorageResult<TaskMessage> {
        let envelope: TaskEnvelope =
            serde_json::from_slice(data).map_err(|e| StorageError::Codec(e.to_string()))?;
        self.decode(&envelope)
    }
}
