//! Key-value operation context with transactional retry

use std::fmt::Display;
use std::thread;

use redis::Commands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::storage::{RedisPool, StorageError, StorageResult};

/// Run `body` in a fresh top-level transaction context.
///
/// Transient errors are retried up to the pool's attempt budget with the
/// configured delay between attempts; the original error surfaces after the
/// final attempt. Nested work should use [`StoreContext::sub_context`]
/// instead of opening another transaction.
pub fn transaction<T, F>(pool: &RedisPool, prefix: &str, mut body: F) -> StorageResult<T>
where
    F: FnMut(&mut StoreContext<'_>) -> StorageResult<T>,
{
    let max_attempts = pool.config().max_retries.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let outcome = pool
            .get()
            .and_then(|mut conn| body(&mut StoreContext::new(&mut conn, prefix)));

        match outcome {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < max_attempts => {
                warn!(
                    "transient storage error on attempt {}: {}, retrying",
                    attempt, e
                );
                thread::sleep(pool.config().retry_delay());
            }
            Err(e) => return Err(e),
        }
    }
}

/// Operation surface over keys of the form `prefix:id`.
///
/// Values are JSON documents; list, hash and set primitives operate on the
/// raw string members. A context created by [`transaction`] owns the retry
/// boundary; sub-contexts participate in it.
pub struct StoreContext<'a> {
    conn: &'a mut redis::Connection,
    prefix: String,
    nested: bool,
}

impl<'a> StoreContext<'a> {
    pub(crate) fn new(conn: &'a mut redis::Connection, prefix: &str) -> Self {
        Self {
            conn,
            prefix: prefix.to_string(),
            nested: false,
        }
    }

    /// Derive a context for another key prefix inside the same transaction
    pub fn sub_context(&mut self, prefix: &str) -> StoreContext<'_> {
        StoreContext {
            conn: self.conn,
            prefix: prefix.to_string(),
            nested: true,
        }
    }

    /// Whether this context participates in an enclosing transaction
    pub fn is_nested(&self) -> bool {
        self.nested
    }

    /// The full key for an id under this context's prefix
    pub fn key(&self, id: impl Display) -> String {
        format!("{}:{}", self.prefix, id)
    }

    fn wildcard(&self) -> String {
        format!("{}:*", self.prefix)
    }

    /// Check whether a key exists
    pub fn exists(&mut self, id: impl Display) -> StorageResult<bool> {
        let exists: bool = self.conn.exists(self.key(id))?;
        Ok(exists)
    }

    /// Store a JSON-serialized entity, assigning an id when none is given
    pub fn create_or_update<E: Serialize>(
        &mut self,
        id: Option<Uuid>,
        entity: &E,
    ) -> StorageResult<Uuid> {
        let id = id.unwrap_or_else(Uuid::new_v4);
        let data =
            serde_json::to_vec(entity).map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.conn.set::<_, _, ()>(self.key(id), data)?;
        Ok(id)
    }

    /// Load an entity by id
    pub fn get_entity<E: DeserializeOwned>(
        &mut self,
        id: impl Display,
    ) -> StorageResult<Option<E>> {
        let data: Option<Vec<u8>> = self.conn.get(self.key(id))?;
        match data {
            Some(data) => {
                let entity = serde_json::from_slice(&data)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                Ok(Some(entity))
            }
            None => Ok(None),
        }
    }

    /// All entity ids under this prefix
    pub fn iterate_keys(&mut self) -> StorageResult<Vec<Uuid>> {
        let pattern = self.wildcard();
        let keys: Vec<String> = {
            let iter = self.conn.scan_match::<_, String>(pattern)?;
            iter.collect()
        };
        Ok(keys
            .iter()
            .filter_map(|key| key.rsplit(':').next())
            .filter_map(|tail| Uuid::parse_str(tail).ok())
            .collect())
    }

    /// All entities under this prefix
    pub fn all_entities<E: DeserializeOwned>(&mut self) -> StorageResult<Vec<E>> {
        let pattern = self.wildcard();
        let keys: Vec<String> = {
            let iter = self.conn.scan_match::<_, String>(pattern)?;
            iter.collect()
        };

        let mut entities = Vec::with_capacity(keys.len());
        for key in keys {
            let data: Option<Vec<u8>> = self.conn.get(&key)?;
            if let Some(data) = data {
                let entity = serde_json::from_slice(&data)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                entities.push(entity);
            }
        }
        Ok(entities)
    }

    /// Delete a key
    pub fn delete(&mut self, id: impl Display) -> StorageResult<()> {
        self.conn.del::<_, ()>(self.key(id))?;
        Ok(())
    }

    /// Push a value onto the producer end of a list
    pub fn list_push(&mut self, id: impl Display, value: &str) -> StorageResult<()> {
        self.conn.lpush::<_, _, ()>(self.key(id), value)?;
        Ok(())
    }

    /// Atomically pop the next value off the consumer end of a list
    pub fn list_pop(&mut self, id: impl Display) -> StorageResult<Option<String>> {
        let value: Option<String> = self.conn.rpop(self.key(id), None)?;
        Ok(value)
    }

    /// Return a popped value to the consumer end of a list
    pub fn list_requeue(&mut self, id: impl Display, value: &str) -> StorageResult<()> {
        self.conn.rpush::<_, _, ()>(self.key(id), value)?;
        Ok(())
    }

    /// Length of a list; missing keys count as empty
    pub fn list_len(&mut self, id: impl Display) -> StorageResult<usize> {
        let len: usize = self.conn.llen(self.key(id))?;
        Ok(len)
    }

    /// All members of a list, consumer end first
    pub fn list_members(&mut self, id: impl Display) -> StorageResult<Vec<String>> {
        let mut members: Vec<String> = self.conn.lrange(self.key(id), 0, -1)?;
        members.reverse();
        Ok(members)
    }

    /// Set a hash field
    pub fn hash_set(&mut self, id: impl Display, field: &str, value: &str) -> StorageResult<()> {
        self.conn.hset::<_, _, _, ()>(self.key(id), field, value)?;
        Ok(())
    }

    /// Get a hash field
    pub fn hash_get(&mut self, id: impl Display, field: &str) -> StorageResult<Option<String>> {
        let value: Option<String> = self.conn.hget(self.key(id), field)?;
        Ok(value)
    }

    /// Delete a hash field
    pub fn hash_delete(&mut self, id: impl Display, field: &str) -> StorageResult<()> {
        self.conn.hdel::<_, _, ()>(self.key(id), field)?;
        Ok(())
    }

    /// Check whether a hash field exists
    pub fn hash_exists(&mut self, id: impl Display, field: &str) -> StorageResult<bool> {
        let exists: bool = self.conn.hexists(self.key(id), field)?;
        Ok(exists)
    }

    /// All field names of a hash
    pub fn hash_keys(&mut self, id: impl Display) -> StorageResult<Vec<String>> {
        let keys: Vec<String> = self.conn.hkeys(self.key(id))?;
        Ok(keys)
    }

    /// Add a member to a set
    pub fn set_add(&mut self, id: impl Display, value: &str) -> StorageResult<()> {
        self.conn.sadd::<_, _, ()>(self.key(id), value)?;
        Ok(())
    }

    /// All members of a set
    pub fn set_members(&mut self, id: impl Display) -> StorageResult<Vec<String>> {
        let members: Vec<String> = self.conn.smembers(self.key(id))?;
        Ok(members)
    }

    /// Cardinality of a set; missing keys count as empty
    pub fn set_len(&mut self, id: impl Display) -> StorageResult<usize> {
        let len: usize = self.conn.scard(self.key(id))?;
        Ok(len)
    }

    /// Set a key's time to live
    pub fn expire(&mut self, id: impl Display, seconds: i64) -> StorageResult<()> {
        self.conn.expire::<_, ()>(self.key(id), seconds)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Live-Redis coverage for this context lives in the feature-gated
    // integration tests; key shaping is testable without a server.

    #[test]
    fn test_key_shapes() {
        // A context needs a connection; exercise the formatting helpers the
        // same way the context does.
        let prefix = "task_queue";
        let id = Uuid::nil();
        assert_eq!(format!("{}:{}", prefix, id), format!("task_queue:{}", id));
        assert!(format!("{}:*", prefix).ends_with(":*"));
    }
}
