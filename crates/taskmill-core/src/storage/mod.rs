//! Entity storage and the durable task queue
//!
//! This module carries the persistence surface the core exposes to handlers,
//! plus the Redis-backed implementations the dispatcher can run on:
//! - Key-value DAO over `prefix:uuid` keys with list/hash/set primitives
//! - Transaction boundaries with bounded retry on transient errors
//! - Blob, document and graph store interfaces for external back-ends
//! - A task codec turning typed tasks into durable queue envelopes
//! - A Redis list backed [`crate::dispatch::TaskQueue`]
//!
//! ## Reliability
//!
//! - Connection pooling over the synchronous Redis client
//! - Top-level operations retry up to the configured attempt budget on
//!   transient errors; nested contexts participate in their parent
//! - Queue payloads survive process restarts; delivery is at-least-once

pub mod codec;
pub mod context;
pub mod dao;
pub mod pool;
pub mod queue;

// Re-export main types
pub use codec::{TaskCodecRegistry, TaskEnvelope};
pub use context::{transaction, StoreContext};
pub use dao::{
    BlobStore, BlobWriter, Dao, DocumentStore, Entity, GraphStore, MemoryBlobStore, RedisDao,
};
pub use pool::{RedisConfig, RedisPool};
pub use queue::RedisTaskQueue;

/// Storage result type alias
pub type StorageResult<T> = Result<T, StorageError>;

/// Storage-specific error types
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("not found: {0}")]
    NotFound(String),
}

impl StorageError {
    /// Whether retrying the enclosing transaction may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Connection(_) => true,
            StorageError::Redis(e) => {
                e.is_io_error()
                    || e.is_connection_dropped()
                    || matches!(
                        e.kind(),
                        redis::ErrorKind::TryAgain | redis::ErrorKind::BusyLoadingError
                    )
            }
            _ => false,
        }
    }
}
