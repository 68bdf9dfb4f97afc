//! In-memory document store with an optional JSON snapshot file.
//!
//! Backs both the test suite and the CLI. Every mutation happens under one
//! async mutex, which is what makes the array append/trim and conditional
//! create primitives atomic. When a snapshot path is configured the whole
//! store is rewritten after each mutation so consecutive CLI invocations
//! see each other's state.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::DocumentStore;
use crate::error::StoreError;
use crate::models::now_ms;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Document {
    doc: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expire_at: Option<i64>,
}

type Collections = BTreeMap<String, BTreeMap<String, Document>>;

/// A [`DocumentStore`] held entirely in memory.
pub struct MemoryStore {
    inner: Mutex<Collections>,
    snapshot: Option<PathBuf>,
}

impl MemoryStore {
    /// An empty store with no persistence.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Collections::new()),
            snapshot: None,
        }
    }

    /// A store persisted to (and, when present, loaded from) a JSON
    /// snapshot file.
    pub fn with_snapshot(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let collections = if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .map_err(|e| StoreError::Snapshot(e.to_string()))?;
            serde_json::from_str(&raw).map_err(|e| StoreError::Snapshot(e.to_string()))?
        } else {
            Collections::new()
        };
        Ok(Self {
            inner: Mutex::new(collections),
            snapshot: Some(path),
        })
    }

    fn persist(&self, all: &Collections) -> Result<(), StoreError> {
        if let Some(path) = &self.snapshot {
            let raw = serde_json::to_string_pretty(all)
                .map_err(|e| StoreError::Snapshot(e.to_string()))?;
            std::fs::write(path, raw).map_err(|e| StoreError::Snapshot(e.to_string()))?;
        }
        Ok(())
    }

    /// Drops documents whose expiry has passed. Expiry is enforced lazily,
    /// on every access to the collection.
    fn purge_expired(collection: &mut BTreeMap<String, Document>, now: i64) {
        collection.retain(|_, doc| doc.expire_at.map_or(true, |at| at > now));
    }

    fn collection<'a>(all: &'a mut Collections, name: &str) -> &'a mut BTreeMap<String, Document> {
        let collection = all.entry(name.to_string()).or_default();
        Self::purge_expired(collection, now_ms());
        collection
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn save(&self, collection: &str, doc: Value) -> Result<String, StoreError> {
        let mut all = self.inner.lock().await;
        let id = Uuid::new_v4().to_string();
        Self::collection(&mut all, collection).insert(
            id.clone(),
            Document {
                doc,
                expire_at: None,
            },
        );
        self.persist(&all)?;
        Ok(id)
    }

    async fn put(&self, collection: &str, id: &str, doc: Value) -> Result<(), StoreError> {
        let mut all = self.inner.lock().await;
        Self::collection(&mut all, collection).insert(
            id.to_string(),
            Document {
                doc,
                expire_at: None,
            },
        );
        self.persist(&all)
    }

    async fn fetch(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
        let mut all = self.inner.lock().await;
        Ok(Self::collection(&mut all, collection)
            .get(id)
            .map(|entry| entry.doc.clone()))
    }

    async fn list(&self, collection: &str) -> Result<Vec<(String, Value)>, StoreError> {
        let mut all = self.inner.lock().await;
        Ok(Self::collection(&mut all, collection)
            .iter()
            .map(|(id, entry)| (id.clone(), entry.doc.clone()))
            .collect())
    }

    async fn search_eq(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<Vec<(String, Value)>, StoreError> {
        let mut all = self.inner.lock().await;
        Ok(Self::collection(&mut all, collection)
            .iter()
            .filter(|(_, entry)| entry.doc.get(field).and_then(Value::as_str) == Some(value))
            .map(|(id, entry)| (id.clone(), entry.doc.clone()))
            .collect())
    }

    async fn array_push(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        value: Value,
    ) -> Result<(), StoreError> {
        let mut all = self.inner.lock().await;
        let entry = Self::collection(&mut all, collection)
            .get_mut(id)
            .ok_or_else(|| StoreError::missing(collection, id))?;
        entry
            .doc
            .get_mut(field)
            .and_then(Value::as_array_mut)
            .ok_or_else(|| StoreError::corrupt(collection, format!("'{field}' is not an array")))?
            .push(value);
        self.persist(&all)
    }

    async fn array_take_front(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        count: usize,
    ) -> Result<Vec<Value>, StoreError> {
        let mut all = self.inner.lock().await;
        let entry = Self::collection(&mut all, collection)
            .get_mut(id)
            .ok_or_else(|| StoreError::missing(collection, id))?;
        let array = entry
            .doc
            .get_mut(field)
            .and_then(Value::as_array_mut)
            .ok_or_else(|| StoreError::corrupt(collection, format!("'{field}' is not an array")))?;
        if array.len() < count {
            return Ok(Vec::new());
        }
        let removed: Vec<Value> = array.drain(..count).collect();
        self.persist(&all)?;
        Ok(removed)
    }

    async fn insert_unique(
        &self,
        collection: &str,
        id: &str,
        doc: Value,
        expire_at: Option<i64>,
    ) -> Result<bool, StoreError> {
        let mut all = self.inner.lock().await;
        let docs = Self::collection(&mut all, collection);
        if docs.contains_key(id) {
            return Ok(false);
        }
        docs.insert(id.to_string(), Document { doc, expire_at });
        self.persist(&all)?;
        Ok(true)
    }

    async fn put_if_eq(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        expected: &Value,
        doc: Value,
    ) -> Result<bool, StoreError> {
        let mut all = self.inner.lock().await;
        let Some(entry) = Self::collection(&mut all, collection).get_mut(id) else {
            return Ok(false);
        };
        if entry.doc.get(field) != Some(expected) {
            return Ok(false);
        }
        entry.doc = doc;
        self.persist(&all)?;
        Ok(true)
    }

    async fn expire_at(&self, collection: &str, id: &str, at_ms: i64) -> Result<(), StoreError> {
        let mut all = self.inner.lock().await;
        Self::collection(&mut all, collection)
            .get_mut(id)
            .ok_or_else(|| StoreError::missing(collection, id))?
            .expire_at = Some(at_ms);
        self.persist(&all)
    }

    async fn delete(&self, collection: &str, ids: &[String]) -> Result<(), StoreError> {
        let mut all = self.inner.lock().await;
        let docs = Self::collection(&mut all, collection);
        for id in ids {
            docs.remove(id);
        }
        self.persist(&all)
    }
}
