//! Entity, blob, document and graph store interfaces

use std::io::{Cursor, Read, Write};
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::storage::{transaction, RedisPool, StorageResult};

/// A stored value with an optional identity.
///
/// Entities without an id are assigned one on first store.
pub trait Entity: Serialize + DeserializeOwned + Send + Sync {
    fn id(&self) -> Option<Uuid>;
}

/// Key-value CRUD over entities of one type
pub trait Dao<E: Entity>: Send + Sync {
    /// Store the entity, returning its (possibly fresh) id
    fn create_or_update(&self, entity: &E) -> StorageResult<Uuid>;

    /// Load an entity by id
    fn get(&self, id: Uuid) -> StorageResult<Option<E>>;

    /// Load every entity under this DAO's prefix
    fn all(&self) -> StorageResult<Vec<E>>;

    /// Every entity id under this DAO's prefix
    fn keys(&self) -> StorageResult<Vec<Uuid>>;

    /// Delete an entity by id
    fn delete(&self, id: Uuid) -> StorageResult<()>;
}

/// Redis-backed [`Dao`] storing entities as JSON under `prefix:uuid`
pub struct RedisDao<E> {
    pool: RedisPool,
    prefix: String,
    _entity: PhantomData<fn() -> E>,
}

impl<E> RedisDao<E> {
    /// Create a DAO over a pool and key prefix
    pub fn new(pool: RedisPool, prefix: impl Into<String>) -> Self {
        Self {
            pool,
            prefix: prefix.into(),
            _entity: PhantomData,
        }
    }

    /// The DAO's key prefix
    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl<E: Entity> Dao<E> for RedisDao<E> {
    fn create_or_update(&self, entity: &E) -> StorageResult<Uuid> {
        transaction(&self.pool, &self.prefix, |ctx| {
            ctx.create_or_update(entity.id(), entity)
        })
    }

    fn get(&self, id: Uuid) -> StorageResult<Option<E>> {
        transaction(&self.pool, &self.prefix, |ctx| ctx.get_entity(id))
    }

    fn all(&self) -> StorageResult<Vec<E>> {
        transaction(&self.pool, &self.prefix, |ctx| ctx.all_entities())
    }

    fn keys(&self) -> StorageResult<Vec<Uuid>> {
        transaction(&self.pool, &self.prefix, |ctx| ctx.iterate_keys())
    }

    fn delete(&self, id: Uuid) -> StorageResult<()> {
        transaction(&self.pool, &self.prefix, |ctx| ctx.delete(id))
    }
}

/// Write half of a scoped blob `open`; the blob lands on `complete`
pub trait BlobWriter: Write + Send {
    fn complete(self: Box<Self>) -> StorageResult<Uuid>;
}

/// Named binary blobs addressable by id or name
pub trait BlobStore: Send + Sync {
    /// Store a blob under a name, returning its id
    fn store(&self, name: &str, data: &[u8]) -> StorageResult<Uuid>;

    /// Load a blob by id
    fn load_by_id(&self, id: Uuid) -> StorageResult<Option<Vec<u8>>>;

    /// Load the most recent blob stored under a name
    fn load_by_name(&self, name: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Delete a blob by id
    fn delete(&self, id: Uuid) -> StorageResult<()>;

    /// Every stored name
    fn filenames(&self) -> StorageResult<Vec<String>>;

    /// Open a blob for reading
    fn open_read(&self, name: &str) -> StorageResult<Box<dyn Read + Send>>;

    /// Open a blob for writing; data dropped without `complete` is discarded
    fn open_write(&self, name: &str) -> StorageResult<Box<dyn BlobWriter>>;
}

/// Documents grouped in named collections, keyed by id.
///
/// Implementations supply their own transactional sessions with the same
/// bounded retry-on-conflict policy the key-value layer applies.
pub trait DocumentStore: Send + Sync {
    fn create_or_update(
        &self,
        collection: &str,
        id: Uuid,
        document: &Value,
    ) -> StorageResult<Uuid>;

    fn get(&self, collection: &str, id: Uuid) -> StorageResult<Option<Value>>;

    fn all(&self, collection: &str) -> StorageResult<Vec<Value>>;

    fn keys(&self, collection: &str) -> StorageResult<Vec<Uuid>>;

    fn delete(&self, collection: &str, id: Uuid) -> StorageResult<()>;
}

/// Property-graph nodes addressed by class name and id
pub trait GraphStore: Send + Sync {
    /// Insert or update a node's properties
    fn upsert_node(
        &self,
        class_name: &str,
        id: Uuid,
        properties: &Map<String, Value>,
    ) -> StorageResult<()>;

    /// Find nodes whose properties contain the given map
    fn find_nodes(
        &self,
        class_name: &str,
        properties: &Map<String, Value>,
    ) -> StorageResult<Vec<Value>>;

    /// Delete at most `limit` nodes matching the id; returns the count removed
    fn delete_nodes(&self, class_name: &str, id: Uuid, limit: usize) -> StorageResult<usize>;
}

struct BlobRecord {
    id: Uuid,
    name: String,
    data: Vec<u8>,
}

/// In-memory [`BlobStore`] for handler tests and local runs
#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<Mutex<Vec<BlobRecord>>>,
}

impl MemoryBlobStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_blobs(&self) -> std::sync::MutexGuard<'_, Vec<BlobRecord>> {
        self.blobs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BlobStore for MemoryBlobStore {
    fn store(&self, name: &str, data: &[u8]) -> StorageResult<Uuid> {
        let id = Uuid::new_v4();
        self.lock_blobs().push(BlobRecord {
            id,
            name: name.to_string(),
            data: data.to_vec(),
        });
        Ok(id)
    }

    fn load_by_id(&self, id: Uuid) -> StorageResult<Option<Vec<u8>>> {
        Ok(self
            .lock_blobs()
            .iter()
            .find(|blob| blob.id == id)
            .map(|blob| blob.data.clone()))
    }

    fn load_by_name(&self, name: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self
            .lock_blobs()
            .iter()
            .rev()
            .find(|blob| blob.name == name)
            .map(|blob| blob.data.clone()))
    }

    fn delete(&self, id: Uuid) -> StorageResult<()> {
        self.lock_blobs().retain(|blob| blob.id != id);
        Ok(())
    }

    fn filenames(&self) -> StorageResult<Vec<String>> {
        Ok(self
            .lock_blobs()
            .iter()
            .map(|blob| blob.name.clone())
            .collect())
    }

    fn open_read(&self, name: &str) -> StorageResult<Box<dyn Read + Send>> {
        let data = self
            .load_by_name(name)?
            .ok_or_else(|| crate::storage::StorageError::NotFound(name.to_string()))?;
        Ok(Box::new(Cursor::new(data)))
    }

    fn open_write(&self, name: &str) -> StorageResult<Box<dyn BlobWriter>> {
        Ok(Box::new(MemoryBlobWriter {
            store: self.clone(),
            name: name.to_string(),
            buffer: Vec::new(),
        }))
    }
}

struct MemoryBlobWriter {
    store: MemoryBlobStore,
    name: String,
    buffer: Vec<u8>,
}

impl Write for MemoryBlobWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl BlobWriter for MemoryBlobWriter {
    fn complete(self: Box<Self>) -> StorageResult<Uuid> {
        self.store.store(&self.name, &self.buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_memory_blob_store_round_trip() {
        let store = MemoryBlobStore::new();

        let id = store.store("report.bin", b"v1").expect("store");
        assert_eq!(store.load_by_id(id).expect("load"), Some(b"v1".to_vec()));

        // load_by_name returns the most recent version
        store.store("report.bin", b"v2").expect("store");
        assert_eq!(
            store.load_by_name("report.bin").expect("load"),
            Some(b"v2".to_vec())
        );
        assert_eq!(store.filenames().expect("names").len(), 2);

        store.delete(id).expect("delete");
        assert_eq!(store.load_by_id(id).expect("load"), None);
    }

    #[test]
    fn test_memory_blob_scoped_open() {
        let store = MemoryBlobStore::new();

        let mut writer = store.open_write("log.txt").expect("open write");
        writer.write_all(b"line one").expect("write");
        writer.complete().expect("complete");

        let mut reader = store.open_read("log.txt").expect("open read");
        let mut contents = String::new();
        reader.read_to_string(&mut contents).expect("read");
        assert_eq!(contents, "line one");

        // A writer dropped without complete leaves no blob behind
        let writer = store.open_write("scratch.txt").expect("open write");
        drop(writer);
        assert!(store.load_by_name("scratch.txt").expect("load").is_none());
    }

    // Minimal in-memory DocumentStore proving the seam is implementable.
    #[derive(Default)]
    struct MemoryDocumentStore {
        collections: Mutex<HashMap<String, HashMap<Uuid, Value>>>,
    }

    impl DocumentStore for MemoryDocumentStore {
        fn create_or_update(
            &self,
            collection: &str,
            id: Uuid,
            document: &Value,
        ) -> StorageResult<Uuid> {
            self.collections
                .lock()
                .unwrap()
                .entry(collection.to_string())
                .or_default()
                .insert(id, document.clone());
            Ok(id)
        }

        fn get(&self, collection: &str, id: Uuid) -> StorageResult<Option<Value>> {
            Ok(self
                .collections
                .lock()
                .unwrap()
                .get(collection)
                .and_then(|docs| docs.get(&id).cloned()))
        }

        fn all(&self, collection: &str) -> StorageResult<Vec<Value>> {
            Ok(self
                .collections
                .lock()
                .unwrap()
                .get(collection)
                .map(|docs| docs.values().cloned().collect())
                .unwrap_or_default())
        }

        fn keys(&self, collection: &str) -> StorageResult<Vec<Uuid>> {
            Ok(self
                .collections
                .lock()
                .unwrap()
                .get(collection)
                .map(|docs| docs.keys().copied().collect())
                .unwrap_or_default())
        }

        fn delete(&self, collection: &str, id: Uuid) -> StorageResult<()> {
            if let Some(docs) = self.collections.lock().unwrap().get_mut(collection) {
                docs.remove(&id);
            }
            Ok(())
        }
    }

    #[test]
    fn test_document_store_seam() {
        let store = MemoryDocumentStore::default();
        let id = Uuid::new_v4();

        store
            .create_or_update("workflows", id, &serde_json::json!({"state": "pending"}))
            .expect("create");
        assert_eq!(store.keys("workflows").expect("keys"), vec![id]);
        assert!(store.get("workflows", id).expect("get").is_some());

        store.delete("workflows", id).expect("delete");
        assert!(store.all("workflows").expect("all").is_empty());
    }
}
