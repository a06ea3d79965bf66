//! Document store contract.
//!
//! Stages only ever talk to this trait. The semantics every implementation
//! must provide: `upsert` is keyed by a caller-derived ID and overwrites on
//! conflict (the pipeline's idempotency depends on it), and documents are
//! opaque JSON — shape enforcement happens at the application layer via the
//! schema registry, never in the database.

pub mod pg;

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::error::ProcessingError;

/// Collection names, owned one per stage. No stage writes to another
/// stage's collection; cross-stage references go by ID lookup.
pub mod collections {
    pub const ARCHIVES: &str = "archives";
    pub const MESSAGES: &str = "messages";
    pub const CHUNKS: &str = "chunks";
    pub const EMBEDDINGS: &str = "embeddings";
    pub const SUMMARIES: &str = "summaries";
    pub const REPORTS: &str = "reports";
    pub const FAILED_EVENTS: &str = "failed_events";
    pub const SCHEMAS: &str = "schemas";
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store connection failed: {0}")]
    Connection(String),
    #[error("{command} failed: {error}")]
    Query { command: String, error: String },
    #[error("document is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<StoreError> for ProcessingError {
    fn from(error: StoreError) -> Self {
        ProcessingError::storage(error.to_string())
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert-or-replace by `(collection, id)`.
    async fn upsert(&self, collection: &str, id: &str, doc: Value) -> Result<(), StoreError>;

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError>;

    /// Equality match on top-level fields of the document. An empty filter
    /// object returns the whole collection.
    async fn find(&self, collection: &str, filter: &Value) -> Result<Vec<Value>, StoreError>;

    /// Returns whether a document was actually removed.
    async fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError>;
}

/// In-memory store for tests and local runs, the way `PrintSink` stands in
/// for the Kafka sink. BTreeMap keeps iteration deterministic.
#[derive(Default)]
pub struct MemoryDocumentStore {
    collections: RwLock<HashMap<String, BTreeMap<String, Value>>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self, collection: &str) -> usize {
        self.collections
            .read()
            .expect("poisoned memory store lock")
            .get(collection)
            .map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }
}

fn matches_filter(doc: &Value, filter: &Value) -> bool {
    let Some(filter) = filter.as_object() else {
        return false;
    };
    filter.iter().all(|(key, expected)| doc.get(key) == Some(expected))
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn upsert(&self, collection: &str, id: &str, doc: Value) -> Result<(), StoreError> {
        let mut collections = self
            .collections
            .write()
            .expect("poisoned memory store lock");
        collections
            .entry(collection.to_owned())
            .or_default()
            .insert(id.to_owned(), doc);
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
        let collections = self
            .collections
            .read()
            .expect("poisoned memory store lock");
        Ok(collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    async fn find(&self, collection: &str, filter: &Value) -> Result<Vec<Value>, StoreError> {
        let collections = self
            .collections
            .read()
            .expect("poisoned memory store lock");
        Ok(collections
            .get(collection)
            .map(|docs| {
                docs.values()
                    .filter(|doc| matches_filter(doc, filter))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError> {
        let mut collections = self
            .collections
            .write()
            .expect("poisoned memory store lock");
        Ok(collections
            .get_mut(collection)
            .is_some_and(|docs| docs.remove(id).is_some()))
    }
}
