use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::trace;

use crate::document::{apply_patch, Document, Fields, Query};
use crate::{StoreError, StoreResult};

const WATCH_CHANNEL_CAPACITY: usize = 64;

/// Push channel for a single document. `initial` is the value at subscription
/// time; `updates` yields every later commit (`None` on deletion) in commit
/// order.
pub struct DocumentWatch {
    pub initial: Option<Document>,
    pub updates: broadcast::Receiver<Option<Document>>,
}

/// Collection-scoped document store with per-document watches and
/// version-checked writes.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Create a document under a store-assigned id.
    async fn create(&self, collection: &str, fields: Fields) -> StoreResult<Document>;

    /// Create a document under `id`; fails with `AlreadyExists` if present.
    async fn create_with_id(&self, collection: &str, id: &str, fields: Fields)
        -> StoreResult<Document>;

    async fn get(&self, collection: &str, id: &str) -> StoreResult<Option<Document>>;

    /// Merge `patch` into an existing document.
    async fn update(&self, collection: &str, id: &str, patch: Fields) -> StoreResult<Document>;

    /// Replace the document's fields if its version still equals `expected`.
    /// `expected = None` means the document must not exist yet.
    async fn compare_and_set(
        &self,
        collection: &str,
        id: &str,
        expected: Option<u64>,
        fields: Fields,
    ) -> StoreResult<Document>;

    async fn delete(&self, collection: &str, id: &str) -> StoreResult<()>;

    async fn query(&self, query: &Query) -> StoreResult<Vec<Document>>;

    async fn watch(&self, collection: &str, id: &str) -> StoreResult<DocumentWatch>;
}

type DocKey = (String, String);

#[derive(Default)]
struct StoreInner {
    collections: HashMap<String, HashMap<String, Document>>,
    watchers: HashMap<DocKey, broadcast::Sender<Option<Document>>>,
}

impl StoreInner {
    /// Publish while the write lock is held so per-document order matches
    /// commit order.
    fn publish(&mut self, collection: &str, id: &str, value: Option<Document>) {
        let key = (collection.to_string(), id.to_string());
        let Some(sender) = self.watchers.get(&key) else {
            return;
        };
        if sender.receiver_count() == 0 {
            self.watchers.remove(&key);
            return;
        }
        let _ = sender.send(value);
    }

    fn commit(&mut self, doc: Document) -> Document {
        self.collections
            .entry(doc.collection.clone())
            .or_default()
            .insert(doc.id.clone(), doc.clone());
        self.publish(&doc.collection, &doc.id, Some(doc.clone()));
        doc
    }

    fn existing(&self, collection: &str, id: &str) -> Option<&Document> {
        self.collections.get(collection).and_then(|c| c.get(id))
    }
}

/// In-memory adapter for tests and local wiring.
#[derive(Default)]
pub struct InMemoryDocumentStore {
    inner: RwLock<StoreInner>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of live listeners attached to a document.
    pub fn listener_count(&self, collection: &str, id: &str) -> usize {
        let guard = self.inner.read();
        guard
            .watchers
            .get(&(collection.to_string(), id.to_string()))
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }

    fn insert_new(&self, collection: &str, id: &str, fields: Fields) -> StoreResult<Document> {
        let mut guard = self.inner.write();
        if guard.existing(collection, id).is_some() {
            return Err(StoreError::AlreadyExists {
                collection: collection.into(),
                id: id.into(),
            });
        }
        trace!(target = "sync", collection, id, "document created");
        Ok(guard.commit(Document {
            collection: collection.into(),
            id: id.into(),
            version: 1,
            fields,
        }))
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn create(&self, collection: &str, fields: Fields) -> StoreResult<Document> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        self.insert_new(collection, &id, fields)
    }

    async fn create_with_id(
        &self,
        collection: &str,
        id: &str,
        fields: Fields,
    ) -> StoreResult<Document> {
        self.insert_new(collection, id, fields)
    }

    async fn get(&self, collection: &str, id: &str) -> StoreResult<Option<Document>> {
        Ok(self.inner.read().existing(collection, id).cloned())
    }

    async fn update(&self, collection: &str, id: &str, patch: Fields) -> StoreResult<Document> {
        let mut guard = self.inner.write();
        let Some(current) = guard.existing(collection, id) else {
            return Err(StoreError::NotFound {
                collection: collection.into(),
                id: id.into(),
            });
        };
        let mut next = current.clone();
        apply_patch(&mut next.fields, patch);
        next.version += 1;
        Ok(guard.commit(next))
    }

    async fn compare_and_set(
        &self,
        collection: &str,
        id: &str,
        expected: Option<u64>,
        fields: Fields,
    ) -> StoreResult<Document> {
        let mut guard = self.inner.write();
        let current = guard.existing(collection, id).map(|d| d.version);
        if current != expected {
            return Err(StoreError::VersionConflict {
                collection: collection.into(),
                id: id.into(),
            });
        }
        Ok(guard.commit(Document {
            collection: collection.into(),
            id: id.into(),
            version: current.unwrap_or(0) + 1,
            fields,
        }))
    }

    async fn delete(&self, collection: &str, id: &str) -> StoreResult<()> {
        let mut guard = self.inner.write();
        let removed = guard
            .collections
            .get_mut(collection)
            .and_then(|c| c.remove(id));
        if removed.is_none() {
            return Err(StoreError::NotFound {
                collection: collection.into(),
                id: id.into(),
            });
        }
        guard.publish(collection, id, None);
        Ok(())
    }

    async fn query(&self, query: &Query) -> StoreResult<Vec<Document>> {
        let guard = self.inner.read();
        let matched = guard
            .collections
            .get(&query.collection)
            .map(|c| c.values().filter(|d| query.matches(d)).cloned().collect())
            .unwrap_or_default();
        Ok(query.finish(matched))
    }

    async fn watch(&self, collection: &str, id: &str) -> StoreResult<DocumentWatch> {
        let mut guard = self.inner.write();
        let initial = guard.existing(collection, id).cloned();
        let updates = guard
            .watchers
            .entry((collection.to_string(), id.to_string()))
            .or_insert_with(|| broadcast::channel(WATCH_CHANNEL_CAPACITY).0)
            .subscribe();
        Ok(DocumentWatch { initial, updates })
    }
}
