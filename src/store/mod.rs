//! Durable metadata store abstraction.
//!
//! The engine owns no state of its own: every operation re-fetches what it
//! needs through [`DocumentStore`] and writes updates back. The handful of
//! atomic primitives here (`array_push`, `array_take_front`,
//! `insert_unique`, `put_if_eq`) are the only concurrency guarantees the
//! engine leans on; everything else is last-writer-wins on whole
//! documents.

mod memory;
mod results;

pub use memory::MemoryStore;
pub use results::{FheResultRecord, FheResultStore, FheResultValue};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::error::StoreError;

/// Collection names used by the engine.
pub mod collections {
    pub const ANALYSES: &str = "analyses";
    pub const KEY_SHARES: &str = "key-shares";
    pub const MPC_PARTIES: &str = "mpc-parties";
    pub const BATCHES: &str = "batches";
    pub const STREAMING: &str = "streaming";
    pub const SUBMISSIONS: &str = "submissions";
    pub const FHE_RESULTS: &str = "fhe-results";
}

/// Primitives the engine requires from its metadata store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Persists a new document under a generated id and returns the id.
    async fn save(&self, collection: &str, doc: Value) -> Result<String, StoreError>;

    /// Replaces (or creates) the document under `id`. Last writer wins.
    async fn put(&self, collection: &str, id: &str, doc: Value) -> Result<(), StoreError>;

    /// Fetches a document; `None` when it does not exist or has expired.
    async fn fetch(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError>;

    /// All live documents in the collection.
    async fn list(&self, collection: &str) -> Result<Vec<(String, Value)>, StoreError>;

    /// All documents whose top-level `field` equals the given string.
    async fn search_eq(
        &self,
        collection: &str,
        field: &str,
        value: &str,
    ) -> Result<Vec<(String, Value)>, StoreError>;

    /// Atomically appends `value` to the array at `field`. Concurrent
    /// appends to the same document must all land.
    async fn array_push(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        value: Value,
    ) -> Result<(), StoreError>;

    /// Atomically removes and returns the first `count` elements of the
    /// array at `field`; when fewer than `count` are present, removes
    /// nothing and returns empty. Two concurrent calls never return the
    /// same element.
    async fn array_take_front(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        count: usize,
    ) -> Result<Vec<Value>, StoreError>;

    /// Creates the document under `id` only if no live document is
    /// there, applying `expire_at` (epoch ms) in the same step. Returns
    /// whether the insert happened.
    async fn insert_unique(
        &self,
        collection: &str,
        id: &str,
        doc: Value,
        expire_at: Option<i64>,
    ) -> Result<bool, StoreError>;

    /// Replaces the document under `id` only while its top-level `field`
    /// currently equals `expected`; a set expiry is untouched. Returns
    /// whether the swap happened. A missing document never matches.
    async fn put_if_eq(
        &self,
        collection: &str,
        id: &str,
        field: &str,
        expected: &Value,
        doc: Value,
    ) -> Result<bool, StoreError>;

    /// Marks the document to vanish at the given epoch-millisecond time.
    async fn expire_at(&self, collection: &str, id: &str, at_ms: i64) -> Result<(), StoreError>;

    /// Removes the named documents. Missing ids are ignored.
    async fn delete(&self, collection: &str, ids: &[String]) -> Result<(), StoreError>;
}

/// Decodes a stored document back into its model.
pub fn decode<T: DeserializeOwned>(collection: &str, doc: Value) -> Result<T, StoreError> {
    serde_json::from_value(doc).map_err(|e| StoreError::corrupt(collection, e.to_string()))
}

/// Encodes a model for storage.
pub fn encode<T: Serialize>(collection: &str, value: &T) -> Result<Value, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::corrupt(collection, e.to_string()))
}
