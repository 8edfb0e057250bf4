//! JSON-file entry store: one file per collection.

use super::{EntryStore, StoreError};
use crate::entry::Entry;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;

/// Current collection file version.
const COLLECTION_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct CollectionFile {
    version: u32,
    name: String,
    entries: Vec<Entry>,
}

/// A store that keeps each collection in `<dir>/<name>.json`.
///
/// Writes go to a temporary file that is then renamed over the old one, so a
/// crash mid-write leaves the previous collection intact.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// Store collections under `dir`. The directory is created on first write.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Path of the file backing a collection.
    pub fn collection_path(&self, collection: &str) -> PathBuf {
        let sanitized = collection
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '_' })
            .collect::<String>();
        self.dir.join(format!("{sanitized}.json"))
    }

    async fn write(&self, collection: &str, entries: Vec<Entry>) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.collection_path(collection);
        let tmp = path.with_extension("json.tmp");

        let file = CollectionFile {
            version: COLLECTION_VERSION,
            name: collection.to_string(),
            entries,
        };
        fs::write(&tmp, serde_json::to_string_pretty(&file)?).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl EntryStore for JsonFileStore {
    async fn exists(&self, collection: &str) -> Result<bool, StoreError> {
        Ok(fs::try_exists(self.collection_path(collection)).await?)
    }

    async fn create(&self, collection: &str, entries: Vec<Entry>) -> Result<(), StoreError> {
        if self.exists(collection).await? {
            return Ok(());
        }
        self.write(collection, entries).await
    }

    async fn get(&self, collection: &str) -> Result<Vec<Entry>, StoreError> {
        let content = match fs::read_to_string(self.collection_path(collection)).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::CollectionMissing(collection.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let file: CollectionFile = serde_json::from_str(&content)?;
        if file.version != COLLECTION_VERSION {
            return Err(StoreError::VersionMismatch {
                collection: collection.to_string(),
                expected: COLLECTION_VERSION,
                found: file.version,
            });
        }
        Ok(file.entries)
    }

    async fn replace(&self, collection: &str, entries: Vec<Entry>) -> Result<(), StoreError> {
        if !self.exists(collection).await? {
            return Err(StoreError::CollectionMissing(collection.to_string()));
        }
        self.write(collection, entries).await
    }
}
