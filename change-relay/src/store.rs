use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::StoreError;
use crate::event::{token_key, ResumeToken, VersionRecord};

/// Durable per-collection change feed position.
///
/// Records are keyed by `<collection>_token`, so concurrent watchers never touch
/// the same record. A missing record, or one without a blob, means "no token".
#[async_trait]
pub trait ResumeTokenStore: Send + Sync {
    async fn load(&self, collection: &str) -> Result<Option<ResumeToken>, StoreError>;
    async fn save(&self, collection: &str, token: &ResumeToken) -> Result<(), StoreError>;
    /// Forget the token, the next cursor opens at the current feed position.
    async fn clear(&self, collection: &str) -> Result<(), StoreError>;
}

/// Append-only store of version records, one history collection per watched collection.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn insert_many(
        &self,
        history_collection: &str,
        records: Vec<VersionRecord>,
    ) -> Result<(), StoreError>;
}

/// Token store kept in process memory, holding blobs exactly as a durable store would.
#[derive(Clone, Default)]
pub struct MemoryTokenStore {
    blobs: Arc<Mutex<HashMap<String, Option<String>>>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw blob stored for a collection, bypassing token decoding.
    pub fn blob(&self, collection: &str) -> Option<String> {
        self.blobs
            .lock()
            .ok()
            .and_then(|blobs| blobs.get(&token_key(collection)).cloned().flatten())
    }

    pub fn put_blob(&self, collection: &str, blob: &str) {
        if let Ok(mut blobs) = self.blobs.lock() {
            blobs.insert(token_key(collection), Some(blob.to_owned()));
        }
    }

    fn locked(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, Option<String>>>, StoreError> {
        self.blobs
            .lock()
            .map_err(|_| StoreError::Backend("poisoned token store lock".to_string()))
    }
}

#[async_trait]
impl ResumeTokenStore for MemoryTokenStore {
    async fn load(&self, collection: &str) -> Result<Option<ResumeToken>, StoreError> {
        let blob = self.locked()?.get(&token_key(collection)).cloned().flatten();
        blob.map(|blob| {
            ResumeToken::from_blob(&blob).map_err(|error| StoreError::MalformedToken {
                collection: collection.to_owned(),
                error,
            })
        })
        .transpose()
    }

    async fn save(&self, collection: &str, token: &ResumeToken) -> Result<(), StoreError> {
        self.locked()?
            .insert(token_key(collection), Some(token.to_blob()));
        Ok(())
    }

    async fn clear(&self, collection: &str) -> Result<(), StoreError> {
        self.locked()?.insert(token_key(collection), None);
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MemoryHistoryStore {
    collections: Arc<Mutex<HashMap<String, Vec<VersionRecord>>>>,
    inserts: Arc<Mutex<Vec<(String, usize)>>>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self, history_collection: &str) -> Vec<VersionRecord> {
        self.collections
            .lock()
            .ok()
            .and_then(|collections| collections.get(history_collection).cloned())
            .unwrap_or_default()
    }

    /// Every `insert_many` call as `(history collection, record count)`, in order.
    pub fn inserts(&self) -> Vec<(String, usize)> {
        self.inserts
            .lock()
            .map(|inserts| inserts.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn insert_many(
        &self,
        history_collection: &str,
        records: Vec<VersionRecord>,
    ) -> Result<(), StoreError> {
        let poisoned = || StoreError::Backend("poisoned history store lock".to_string());
        self.inserts
            .lock()
            .map_err(|_| poisoned())?
            .push((history_collection.to_owned(), records.len()));
        self.collections
            .lock()
            .map_err(|_| poisoned())?
            .entry(history_collection.to_owned())
            .or_default()
            .extend(records);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn tokens_are_scoped_per_collection() {
        let store = MemoryTokenStore::new();
        assert_eq!(store.load("sku").await.unwrap(), None);

        let token = ResumeToken(json!({"_data": "0A"}));
        store.save("sku", &token).await.unwrap();
        assert_eq!(store.load("sku").await.unwrap(), Some(token));
        assert_eq!(store.load("brand").await.unwrap(), None);

        store.clear("sku").await.unwrap();
        assert_eq!(store.load("sku").await.unwrap(), None);
        assert_eq!(store.blob("sku"), None);
    }

    #[tokio::test]
    async fn malformed_blobs_are_reported() {
        let store = MemoryTokenStore::new();
        store.put_blob("sku", "{not json");

        assert!(matches!(
            store.load("sku").await,
            Err(StoreError::MalformedToken { collection, .. }) if collection == "sku"
        ));
    }

    #[tokio::test]
    async fn history_appends() {
        let store = MemoryHistoryStore::new();
        let record = VersionRecord::inserted(json!({"_id": 1}), Default::default());

        store
            .insert_many("sku_coll", vec![record.clone()])
            .await
            .unwrap();
        store
            .insert_many("sku_coll", vec![record.clone(), record.clone()])
            .await
            .unwrap();

        assert_eq!(store.records("sku_coll").len(), 3);
        assert_eq!(
            store.inserts(),
            vec![("sku_coll".to_string(), 1), ("sku_coll".to_string(), 2)]
        );
    }
}
