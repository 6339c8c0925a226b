use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::document::{Document, Fields, Query};
use crate::store::DocumentStore;
use crate::subscription::{Subscription, SubscriptionHandle};
use crate::{StoreError, StoreResult};

pub const DEFAULT_TRANSACTION_ATTEMPTS: usize = 5;
const SUBSCRIPTION_BUFFER: usize = 32;

/// Typed facade over a [`DocumentStore`], shared by every coordinator.
#[derive(Clone)]
pub struct SessionSyncClient {
    store: Arc<dyn DocumentStore>,
    max_attempts: usize,
}

impl SessionSyncClient {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            max_attempts: DEFAULT_TRANSACTION_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn store(&self) -> Arc<dyn DocumentStore> {
        Arc::clone(&self.store)
    }

    pub async fn create<E: Serialize>(&self, collection: &str, entity: &E) -> StoreResult<Document> {
        self.store.create(collection, to_fields(entity)?).await
    }

    pub async fn create_with_id<E: Serialize>(
        &self,
        collection: &str,
        id: &str,
        entity: &E,
    ) -> StoreResult<Document> {
        self.store
            .create_with_id(collection, id, to_fields(entity)?)
            .await
    }

    pub async fn get<E: DeserializeOwned>(&self, collection: &str, id: &str) -> StoreResult<Option<E>> {
        match self.store.get(collection, id).await? {
            Some(doc) => Ok(Some(doc.decode()?)),
            None => Ok(None),
        }
    }

    /// Decode every match; documents that fail to decode are skipped.
    pub async fn query<E: DeserializeOwned>(&self, query: &Query) -> StoreResult<Vec<E>> {
        let docs = self.store.query(query).await?;
        Ok(docs
            .into_iter()
            .filter_map(|doc| match doc.decode() {
                Ok(entity) => Some(entity),
                Err(err) => {
                    warn!(target = "sync", error = %err, "skipping undecodable document");
                    None
                }
            })
            .collect())
    }

    /// Partial update. `fields` must be a JSON object.
    pub async fn mutate(&self, collection: &str, id: &str, fields: Value) -> StoreResult<Document> {
        self.store.update(collection, id, object(fields)?).await
    }

    pub async fn delete(&self, collection: &str, id: &str) -> StoreResult<()> {
        self.store.delete(collection, id).await
    }

    /// Optimistic read-modify-write. `f` sees the current document (or `None`)
    /// and returns the full replacement fields; on a concurrent commit the read
    /// is retried with the newer version.
    pub async fn transact<F, E>(&self, collection: &str, id: &str, mut f: F) -> Result<Document, E>
    where
        F: FnMut(Option<&Document>) -> Result<Fields, E> + Send,
        E: From<StoreError>,
    {
        for attempt in 1..=self.max_attempts {
            let current = self.store.get(collection, id).await?;
            let next = f(current.as_ref())?;
            let expected = current.as_ref().map(|d| d.version);
            match self.store.compare_and_set(collection, id, expected, next).await {
                Ok(doc) => return Ok(doc),
                Err(StoreError::VersionConflict { .. }) => {
                    debug!(target = "sync", collection, id, attempt, "transaction retry after conflict");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(StoreError::Contention {
            collection: collection.into(),
            id: id.into(),
            attempts: self.max_attempts,
        }
        .into())
    }

    /// Add `delta` to each integer field, creating the document if missing.
    pub async fn increment(
        &self,
        collection: &str,
        id: &str,
        deltas: &[(&str, i64)],
    ) -> StoreResult<Document> {
        self.transact(collection, id, |current| {
            let mut fields = current.map(|d| d.fields.clone()).unwrap_or_default();
            for (field, delta) in deltas {
                let value = fields.get(*field).and_then(Value::as_i64).unwrap_or(0);
                fields.insert((*field).to_string(), Value::from(value + delta));
            }
            Ok::<_, StoreError>(fields)
        })
        .await
    }

    /// Open a push subscription decoding each value into `E`. Fails with
    /// `NotFound` if the document does not exist when the watch opens.
    pub async fn watch<E>(&self, collection: &str, id: &str) -> StoreResult<Subscription<E>>
    where
        E: DeserializeOwned + Send + 'static,
    {
        let mut watch = self.store.watch(collection, id).await?;
        if watch.initial.is_none() {
            return Err(StoreError::NotFound {
                collection: collection.into(),
                id: id.into(),
            });
        }
        let handle = SubscriptionHandle::new(format!("{collection}/{id}"));
        let token = handle.token();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let store = Arc::clone(&self.store);
        let collection = collection.to_string();
        let id = id.to_string();

        tokio::spawn(async move {
            if let Some(doc) = watch.initial.take() {
                if !forward(&tx, &doc).await {
                    return;
                }
            }
            loop {
                let event = tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    event = watch.updates.recv() => event,
                };
                match event {
                    Ok(Some(doc)) => {
                        if !forward(&tx, &doc).await {
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!(target = "sync", %collection, %id, "watched document deleted");
                        break;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(target = "sync", %collection, %id, skipped, "watcher lagged; refetching latest");
                        match store.get(&collection, &id).await {
                            Ok(Some(doc)) => {
                                if !forward(&tx, &doc).await {
                                    break;
                                }
                            }
                            Ok(None) => break,
                            Err(err) => {
                                warn!(target = "sync", error = %err, "refetch after lag failed");
                            }
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            // Dropping `watch` here releases the store-side listener.
        });

        Ok(Subscription::new(rx, handle))
    }
}

async fn forward<E: DeserializeOwned>(tx: &mpsc::Sender<E>, doc: &Document) -> bool {
    match doc.decode::<E>() {
        Ok(entity) => tx.send(entity).await.is_ok(),
        Err(err) => {
            warn!(target = "sync", error = %err, "dropping undecodable update");
            true
        }
    }
}

fn to_fields<E: Serialize>(entity: &E) -> StoreResult<Fields> {
    let mut fields = object(serde_json::to_value(entity)?)?;
    fields.remove("id");
    Ok(fields)
}

fn object(value: Value) -> StoreResult<Fields> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::Backend(format!(
            "expected a JSON object, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryDocumentStore;
    use serde::Deserialize;
    use serde_json::json;
    use std::time::Duration;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    struct Counter {
        #[serde(default)]
        id: String,
        value: i64,
    }

    fn client() -> (Arc<InMemoryDocumentStore>, SessionSyncClient) {
        let store = InMemoryDocumentStore::new();
        let client = SessionSyncClient::new(store.clone());
        (store, client)
    }

    #[tokio::test]
    async fn typed_create_and_get_round_trip_id() {
        let (_, client) = client();
        let doc = client
            .create("counters", &Counter { id: String::new(), value: 3 })
            .await
            .unwrap();
        let back: Counter = client.get("counters", &doc.id).await.unwrap().unwrap();
        assert_eq!(back.id, doc.id);
        assert_eq!(back.value, 3);
    }

    #[tokio::test]
    async fn concurrent_increments_do_not_lose_updates() {
        let (_, client) = client();
        let client = client.with_max_attempts(64);
        let mut tasks = Vec::new();
        for _ in 0..20 {
            let client = client.clone();
            tasks.push(tokio::spawn(async move {
                client
                    .increment("users", "u1", &[("totalRatings", 1), ("ratingSum", 4)])
                    .await
                    .unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        let doc = client.store().get("users", "u1").await.unwrap().unwrap();
        assert_eq!(doc.fields["totalRatings"], json!(20));
        assert_eq!(doc.fields["ratingSum"], json!(80));
    }

    #[tokio::test]
    async fn transact_surfaces_closure_errors() {
        let (_, client) = client();
        let result: Result<Document, StoreError> = client
            .transact("things", "t1", |_| {
                Err(StoreError::Backend("rejected by caller".into()))
            })
            .await;
        assert!(matches!(result, Err(StoreError::Backend(_))));
    }

    #[tokio::test]
    async fn watch_emits_current_then_updates() {
        let (_, client) = client();
        let doc = client
            .create("counters", &Counter { id: String::new(), value: 0 })
            .await
            .unwrap();
        let mut sub = client.watch::<Counter>("counters", &doc.id).await.unwrap();
        assert_eq!(sub.next().await.unwrap().value, 0);
        client
            .mutate("counters", &doc.id, json!({"value": 5}))
            .await
            .unwrap();
        assert_eq!(sub.next().await.unwrap().value, 5);
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_releases_listener() {
        let (store, client) = client();
        let doc = client
            .create("counters", &Counter { id: String::new(), value: 0 })
            .await
            .unwrap();
        let mut sub = client.watch::<Counter>("counters", &doc.id).await.unwrap();
        sub.next().await.unwrap();
        let external = sub.handle();
        external.cancel();
        external.cancel();
        sub.cancel();
        assert!(sub.next().await.is_none());

        // The pump task exits on cancellation and drops its receiver.
        for _ in 0..50 {
            if store.listener_count("counters", &doc.id) == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(store.listener_count("counters", &doc.id), 0);
    }

    #[tokio::test]
    async fn watching_a_missing_document_fails_fast() {
        let (store, client) = client();
        let result = tokio::time::timeout(
            Duration::from_secs(1),
            client.watch::<Counter>("counters", "absent"),
        )
        .await
        .expect("watch returned");
        assert!(matches!(result, Err(StoreError::NotFound { .. })));
        assert_eq!(store.listener_count("counters", "absent"), 0);
    }

    #[tokio::test]
    async fn subscription_ends_when_document_deleted() {
        let (_, client) = client();
        let doc = client
            .create("counters", &Counter { id: String::new(), value: 1 })
            .await
            .unwrap();
        let mut sub = client.watch::<Counter>("counters", &doc.id).await.unwrap();
        sub.next().await.unwrap();
        client.delete("counters", &doc.id).await.unwrap();
        assert!(sub.next().await.is_none());
    }
}
