//! In-process entry store.

use super::{EntryStore, StoreError};
use crate::entry::Entry;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;

/// A store that keeps collections in memory.
///
/// Useful for embedding and for tests: writes can be made to fail on demand
/// and successful replaces are counted.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    collections: RwLock<HashMap<String, Vec<Entry>>>,
    failing_writes: AtomicUsize,
    replaces: AtomicUsize,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a collection.
    pub fn with_collection(mut self, collection: impl Into<String>, entries: Vec<Entry>) -> Self {
        self.collections.get_mut().insert(collection.into(), entries);
        self
    }

    /// Make the next `count` writes fail with [`StoreError::Rejected`].
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    /// Number of successful `replace` calls so far.
    pub fn replace_count(&self) -> usize {
        self.replaces.load(Ordering::SeqCst)
    }

    fn take_failure(&self, collection: &str) -> Result<(), StoreError> {
        let remaining = self.failing_writes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_writes.store(remaining - 1, Ordering::SeqCst);
            return Err(StoreError::Rejected {
                collection: collection.to_string(),
                reason: "injected write failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl EntryStore for InMemoryStore {
    async fn exists(&self, collection: &str) -> Result<bool, StoreError> {
        Ok(self.collections.read().await.contains_key(collection))
    }

    async fn create(&self, collection: &str, entries: Vec<Entry>) -> Result<(), StoreError> {
        self.take_failure(collection)?;
        self.collections
            .write()
            .await
            .entry(collection.to_string())
            .or_insert(entries);
        Ok(())
    }

    async fn get(&self, collection: &str) -> Result<Vec<Entry>, StoreError> {
        self.collections
            .read()
            .await
            .get(collection)
            .cloned()
            .ok_or_else(|| StoreError::CollectionMissing(collection.to_string()))
    }

    async fn replace(&self, collection: &str, entries: Vec<Entry>) -> Result<(), StoreError> {
        self.take_failure(collection)?;
        let mut collections = self.collections.write().await;
        let slot = collections
            .get_mut(collection)
            .ok_or_else(|| StoreError::CollectionMissing(collection.to_string()))?;
        *slot = entries;
        self.replaces.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
