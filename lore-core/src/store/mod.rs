//! Entry store adapter.
//!
//! The host owns the document store; this crate only sees it through the
//! [`EntryStore`] trait, which offers whole-collection reads and swaps. The
//! [`Lorebook`] adapter layers the operations the managers and the compaction
//! engine need on top, and serializes read-modify-write cycles so two writes
//! against the same store never interleave.

mod file;
mod memory;

pub use file::JsonFileStore;
pub use memory::InMemoryStore;

use crate::entry::Entry;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

/// Errors from the host store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Collection not found: {0}")]
    CollectionMissing(String),

    #[error("Write to {collection} rejected: {reason}")]
    Rejected { collection: String, reason: String },

    #[error("Version mismatch in {collection}: expected {expected}, found {found}")]
    VersionMismatch {
        collection: String,
        expected: u32,
        found: u32,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A host document store holding named collections of entries.
#[async_trait]
pub trait EntryStore: Send + Sync {
    /// Whether the collection exists.
    async fn exists(&self, collection: &str) -> Result<bool, StoreError>;

    /// Create a collection with the given entries.
    async fn create(&self, collection: &str, entries: Vec<Entry>) -> Result<(), StoreError>;

    /// The full current collection.
    async fn get(&self, collection: &str) -> Result<Vec<Entry>, StoreError>;

    /// Overwrite the collection.
    async fn replace(&self, collection: &str, entries: Vec<Entry>) -> Result<(), StoreError>;
}

/// Typed adapter over an [`EntryStore`].
pub struct Lorebook {
    store: Arc<dyn EntryStore>,
    write_gate: Mutex<()>,
}

impl Lorebook {
    /// Wrap a store.
    pub fn new(store: impl EntryStore + 'static) -> Self {
        Self::from_shared(Arc::new(store))
    }

    /// Wrap a store that is also used elsewhere.
    pub fn from_shared(store: Arc<dyn EntryStore>) -> Self {
        Self {
            store,
            write_gate: Mutex::new(()),
        }
    }

    /// Create an empty collection if absent.
    pub async fn ensure_exists(&self, collection: &str) -> Result<(), StoreError> {
        if !self.store.exists(collection).await? {
            tracing::info!(collection, "creating collection");
            self.store.create(collection, Vec::new()).await?;
        }
        Ok(())
    }

    /// The full current collection.
    pub async fn get(&self, collection: &str) -> Result<Vec<Entry>, StoreError> {
        self.store.get(collection).await
    }

    /// Overwrite the collection.
    pub async fn replace(&self, collection: &str, entries: Vec<Entry>) -> Result<(), StoreError> {
        let _gate = self.write_gate.lock().await;
        self.store.replace(collection, entries).await
    }

    /// The full collection, or nothing when it does not exist yet.
    pub async fn list(&self, collection: &str) -> Result<Vec<Entry>, StoreError> {
        if !self.store.exists(collection).await? {
            return Ok(Vec::new());
        }
        self.store.get(collection).await
    }

    /// The first entry matching `predicate`, if any.
    pub async fn find<P>(&self, collection: &str, predicate: P) -> Result<Option<Entry>, StoreError>
    where
        P: Fn(&Entry) -> bool,
    {
        let entries = self.list(collection).await?;
        Ok(entries.into_iter().find(|e| predicate(e)))
    }

    /// Read the collection, let `f` mutate it, and write it back.
    ///
    /// The collection is created if absent. Nothing is written when `f`
    /// fails or leaves the entries unchanged. Holds the write gate for the
    /// whole cycle.
    pub async fn modify<T, E, F>(&self, collection: &str, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Vec<Entry>) -> Result<T, E>,
        E: From<StoreError>,
    {
        let _gate = self.write_gate.lock().await;
        self.ensure_exists(collection).await?;

        let original = self.store.get(collection).await?;
        let mut entries = original.clone();
        let value = f(&mut entries)?;

        if entries != original {
            self.store.replace(collection, entries).await?;
        } else {
            tracing::debug!(collection, "collection unchanged, skipping write");
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{EntryKind, EntryUid};

    fn entry(uid: u64) -> Entry {
        Entry::new(EntryUid(uid), format!("e{uid}"), &EntryKind::ConquestRecords, "")
    }

    #[tokio::test]
    async fn test_ensure_exists_is_idempotent() {
        let store = Arc::new(InMemoryStore::new());
        let lorebook = Lorebook::from_shared(store.clone());

        lorebook.ensure_exists("archive").await.unwrap();
        lorebook.replace("archive", vec![entry(1)]).await.unwrap();
        lorebook.ensure_exists("archive").await.unwrap();

        assert_eq!(lorebook.get("archive").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_find_on_missing_collection() {
        let lorebook = Lorebook::new(InMemoryStore::new());
        let found = lorebook.find("nope", |_| true).await.unwrap();
        assert!(found.is_none());
        assert!(lorebook.list("nope").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_modify_skips_unchanged_writes() {
        let store = Arc::new(InMemoryStore::new().with_collection("archive", vec![entry(1)]));
        let lorebook = Lorebook::from_shared(store.clone());

        let count = lorebook
            .modify("archive", |entries| Ok::<_, StoreError>(entries.len()))
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(store.replace_count(), 0);

        lorebook
            .modify("archive", |entries| {
                entries.push(entry(2));
                Ok::<_, StoreError>(())
            })
            .await
            .unwrap();
        assert_eq!(store.replace_count(), 1);
        assert_eq!(lorebook.get("archive").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_modify_error_writes_nothing() {
        let store = Arc::new(InMemoryStore::new().with_collection("archive", vec![entry(1)]));
        let lorebook = Lorebook::from_shared(store.clone());

        let result: Result<(), StoreError> = lorebook
            .modify("archive", |entries| {
                entries.clear();
                Err(StoreError::Rejected {
                    collection: "archive".into(),
                    reason: "test".into(),
                })
            })
            .await;

        assert!(result.is_err());
        assert_eq!(store.replace_count(), 0);
        assert_eq!(lorebook.get("archive").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_store_failure_propagates() {
        let store = Arc::new(InMemoryStore::new().with_collection("archive", vec![]));
        store.fail_next_writes(1);
        let lorebook = Lorebook::from_shared(store.clone());

        let err = lorebook.replace("archive", vec![entry(1)]).await.unwrap_err();
        assert!(matches!(err, StoreError::Rejected { .. }));
        assert!(lorebook.get("archive").await.unwrap().is_empty());

        lorebook.replace("archive", vec![entry(1)]).await.unwrap();
        assert_eq!(lorebook.get("archive").await.unwrap().len(), 1);
    }
}
