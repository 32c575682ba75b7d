use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{collect_links, Entry, Filter, Record, StorageProvider, StoreError};
use crate::contract::NETWORK_LINKS_CLASS;
use crate::crypto::PublicKey;
use crate::network::NetworkLink;

/// In-memory storage provider using HashMaps
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<RwLock<MemoryStoreInner>>,
}

#[derive(Debug, Default)]
struct MemoryStoreInner {
    /// Last position handed out, shared by all classes
    position: u64,
    /// class -> position -> entry
    arrays: HashMap<String, BTreeMap<u64, Entry>>,
    /// class -> object
    objects: HashMap<String, Record>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryStoreError {
    #[error("memory store error: {0}")]
    Internal(String),
}

impl MemoryStoreInner {
    fn push(
        &mut self,
        class: &str,
        data: Record,
        expires_at: Option<DateTime<Utc>>,
    ) -> Entry {
        self.position += 1;
        let entry = Entry {
            position: self.position,
            id: Uuid::new_v4(),
            data,
            created_at: Utc::now(),
            expires_at,
        };
        self.arrays
            .entry(class.to_string())
            .or_default()
            .insert(entry.position, entry.clone());
        entry
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(MemoryStoreInner::default())),
        }
    }

    fn read(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, MemoryStoreInner>, StoreError<MemoryStoreError>>
    {
        self.inner.read().map_err(|e| {
            StoreError::Provider(MemoryStoreError::Internal(format!(
                "failed to acquire read lock: {}",
                e
            )))
        })
    }

    fn write(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, MemoryStoreInner>, StoreError<MemoryStoreError>>
    {
        self.inner.write().map_err(|e| {
            StoreError::Provider(MemoryStoreError::Internal(format!(
                "failed to acquire write lock: {}",
                e
            )))
        })
    }

    /// Change the expiry time of a stored entry.
    ///
    /// Returns false if the entry does not exist.
    pub fn set_expiry(
        &self,
        class: &str,
        id: Uuid,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError<MemoryStoreError>> {
        let mut inner = self.write()?;
        let Some(entries) = inner.arrays.get_mut(class) else {
            return Ok(false);
        };
        match entries.values_mut().find(|e| e.id == id) {
            Some(entry) => {
                entry.expires_at = expires_at;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageProvider for MemoryStore {
    type Error = MemoryStoreError;

    async fn get_object(&self, class: &str) -> Result<Option<Record>, StoreError<Self::Error>> {
        Ok(self.read()?.objects.get(class).cloned())
    }

    async fn put_object(&self, class: &str, data: Record) -> Result<(), StoreError<Self::Error>> {
        self.write()?.objects.insert(class.to_string(), data);
        Ok(())
    }

    async fn merge_object(
        &self,
        class: &str,
        patch: Record,
    ) -> Result<Record, StoreError<Self::Error>> {
        let mut inner = self.write()?;
        let object = inner.objects.entry(class.to_string()).or_default();
        object.extend(patch);
        Ok(object.clone())
    }

    async fn insert(
        &self,
        class: &str,
        data: Record,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<Entry, StoreError<Self::Error>> {
        Ok(self.write()?.push(class, data, expires_at))
    }

    async fn insert_unique(
        &self,
        class: &str,
        data: Record,
        key: &str,
        expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Entry, StoreError<Self::Error>> {
        let mut inner = self.write()?;
        let taken = match (data.get(key), inner.arrays.get(class)) {
            (Some(value), Some(entries)) => entries
                .values()
                .any(|e| e.is_live(now) && e.data.get(key) == Some(value)),
            _ => false,
        };
        if taken {
            return Err(StoreError::Conflict(class.to_string()));
        }
        Ok(inner.push(class, data, expires_at))
    }

    async fn scan(
        &self,
        class: &str,
        after: Option<u64>,
        limit: usize,
    ) -> Result<Vec<Entry>, StoreError<Self::Error>> {
        let inner = self.read()?;
        let Some(entries) = inner.arrays.get(class) else {
            return Ok(Vec::new());
        };
        let start = after.map(|p| p.saturating_add(1)).unwrap_or(0);
        Ok(entries
            .range(start..)
            .take(limit)
            .map(|(_, e)| e.clone())
            .collect())
    }

    async fn update(
        &self,
        class: &str,
        filter: &Filter,
        patch: &Record,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError<Self::Error>> {
        let mut inner = self.write()?;
        let Some(entries) = inner.arrays.get_mut(class) else {
            return Ok(0);
        };
        let mut affected = 0;
        for entry in entries
            .values_mut()
            .filter(|e| e.is_live(now) && filter.matches(&e.data))
        {
            for (field, value) in patch {
                entry.data.insert(field.clone(), value.clone());
            }
            affected += 1;
        }
        Ok(affected)
    }

    async fn delete(
        &self,
        class: &str,
        filter: &Filter,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError<Self::Error>> {
        let mut inner = self.write()?;
        let Some(entries) = inner.arrays.get_mut(class) else {
            return Ok(0);
        };
        let before = entries.len();
        entries.retain(|_, e| !(e.is_live(now) && filter.matches(&e.data)));
        Ok((before - entries.len()) as u64)
    }

    async fn purge_expired(
        &self,
        class: &str,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError<Self::Error>> {
        let mut inner = self.write()?;
        let Some(entries) = inner.arrays.get_mut(class) else {
            return Ok(0);
        };
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now));
        Ok((before - entries.len()) as u64)
    }

    async fn network_links(
        &self,
        owner: &PublicKey,
        now: DateTime<Utc>,
    ) -> Result<Vec<NetworkLink>, StoreError<Self::Error>> {
        let inner = self.read()?;
        Ok(inner
            .arrays
            .get(NETWORK_LINKS_CLASS)
            .map(|entries| collect_links(owner, entries.values(), now))
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use serde_json::json;

    use super::*;

    fn record(value: serde_json::Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_positions_are_monotonic_across_classes() {
        let store = MemoryStore::new();
        let a = store.insert("a", Record::new(), None).await.unwrap();
        let b = store.insert("b", Record::new(), None).await.unwrap();
        let c = store.insert("a", Record::new(), None).await.unwrap();
        assert!(a.position < b.position && b.position < c.position);

        let scanned = store.scan("a", None, 10).await.unwrap();
        assert_eq!(
            scanned.iter().map(|e| e.position).collect::<Vec<_>>(),
            vec![a.position, c.position]
        );
    }

    #[tokio::test]
    async fn test_scan_after_missing_position() {
        let store = MemoryStore::new();
        for n in 0..5 {
            store
                .insert("items", record(json!({ "n": n })), None)
                .await
                .unwrap();
        }
        let third = store.scan("items", None, 5).await.unwrap()[2].clone();
        store
            .delete("items", &Filter::new().eq("n", 2), Utc::now())
            .await
            .unwrap();

        let rest = store.scan("items", Some(third.position), 10).await.unwrap();
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0].data["n"], json!(3));
    }

    #[tokio::test]
    async fn test_update_and_delete_skip_expired() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .insert("items", record(json!({ "k": 1 })), Some(now - Duration::seconds(1)))
            .await
            .unwrap();
        store
            .insert("items", record(json!({ "k": 1 })), None)
            .await
            .unwrap();

        let filter = Filter::new().eq("k", 1);
        let patch = record(json!({ "seen": true }));
        assert_eq!(store.update("items", &filter, &patch, now).await.unwrap(), 1);
        assert_eq!(store.count("items", &filter, now).await.unwrap(), 1);
        assert_eq!(store.purge_expired("items", now).await.unwrap(), 1);
        assert_eq!(store.delete("items", &filter, now).await.unwrap(), 1);
        assert_eq!(store.count("items", &Filter::new(), now).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_objects() {
        let store = MemoryStore::new();
        assert!(store.get_object("profile").await.unwrap().is_none());
        store
            .put_object("profile", record(json!({ "name": "ada" })))
            .await
            .unwrap();
        assert_eq!(
            store.get_object("profile").await.unwrap().unwrap()["name"],
            json!("ada")
        );
    }

    #[tokio::test]
    async fn test_insert_unique_checks_live_entries() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .insert("likes", record(json!({ "id": "a" })), Some(now - Duration::seconds(1)))
            .await
            .unwrap();

        // an expired holder of the key does not block
        let (first, second) = tokio::join!(
            store.insert_unique("likes", record(json!({ "id": "a" })), "id", None, now),
            store.insert_unique("likes", record(json!({ "id": "a" })), "id", None, now),
        );
        assert_eq!([&first, &second].iter().filter(|r| r.is_ok()).count(), 1);
        assert!(matches!(
            first.and(second),
            Err(StoreError::Conflict(class)) if class == "likes"
        ));
        assert_eq!(store.count("likes", &Filter::new(), now).await.unwrap(), 1);

        store
            .insert_unique("likes", record(json!({ "id": "b" })), "id", None, now)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_merge_object() {
        let store = MemoryStore::new();
        let (a, b) = tokio::join!(
            store.merge_object("profile", record(json!({ "name": "ada" }))),
            store.merge_object("profile", record(json!({ "bio": "hi" }))),
        );
        a.unwrap();
        b.unwrap();
        let merged = store
            .merge_object("profile", record(json!({ "name": "grace" })))
            .await
            .unwrap();
        assert_eq!(merged, record(json!({ "name": "grace", "bio": "hi" })));
        assert_eq!(store.get_object("profile").await.unwrap(), Some(merged));
    }
}
