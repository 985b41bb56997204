//! Key-value persistence for small pieces of client state.
//!
//! The streaming client persists the last event id here so a restarted
//! process can resume where it left off. Storage is best-effort: callers log
//! failures and carry on with in-memory state.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

use crate::lock;

/// Storage key for the resumption id.
pub const LAST_EVENT_ID_KEY: &str = "sse_last_event_id";

/// Storage errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Underlying I/O failed.
    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored data could not be decoded.
    #[error("corrupt storage file {path}: {source}")]
    Corrupt {
        /// File that failed to decode.
        path: PathBuf,
        /// Decoder error.
        source: serde_json::Error,
    },

    /// Backend refused the request.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// Minimal string key-value store.
pub trait KeyValueStorage: Send + Sync {
    /// Read a value.
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Write a value.
    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Delete a value (no error if absent).
    fn remove_item(&self, key: &str) -> Result<(), StorageError>;
}

/// Process-local storage.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    /// Create empty storage.
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStorage for MemoryStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(lock(&self.items).get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        lock(&self.items).insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        lock(&self.items).remove(key);
        Ok(())
    }
}

/// Storage backed by a single JSON object on disk.
///
/// Every write rewrites the file through a temporary sibling and a rename,
/// so a crash leaves either the old or the new contents.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStorage {
    /// Use `path` as the backing file. The file is created on first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<String, String>, StorageError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(e.into()),
        };
        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&content).map_err(|source| StorageError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    fn store(&self, items: &BTreeMap<String, String>) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_vec_pretty(items).map_err(|source| StorageError::Corrupt {
            path: self.path.clone(),
            source,
        })?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl KeyValueStorage for FileStorage {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.load()?.remove(key))
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let _guard = lock(&self.write_lock);
        let mut items = self.load()?;
        items.insert(key.to_string(), value.to_string());
        self.store(&items)
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        let _guard = lock(&self.write_lock);
        let mut items = self.load()?;
        if items.remove(key).is_some() {
            self.store(&items)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_storage_round_trips() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.get_item(LAST_EVENT_ID_KEY).unwrap(), None);

        storage.set_item(LAST_EVENT_ID_KEY, "42").unwrap();
        assert_eq!(
            storage.get_item(LAST_EVENT_ID_KEY).unwrap().as_deref(),
            Some("42")
        );

        storage.remove_item(LAST_EVENT_ID_KEY).unwrap();
        assert_eq!(storage.get_item(LAST_EVENT_ID_KEY).unwrap(), None);
    }

    #[test]
    fn file_storage_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        FileStorage::new(&path).set_item("a", "1").unwrap();
        FileStorage::new(&path).set_item("b", "2").unwrap();

        let reopened = FileStorage::new(&path);
        assert_eq!(reopened.get_item("a").unwrap().as_deref(), Some("1"));
        assert_eq!(reopened.get_item("b").unwrap().as_deref(), Some("2"));
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn file_storage_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("absent.json"));
        assert_eq!(storage.get_item("anything").unwrap(), None);
        storage.remove_item("anything").unwrap();
    }

    #[test]
    fn file_storage_reports_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "not json").unwrap();

        let err = FileStorage::new(&path).get_item("a").unwrap_err();
        assert!(matches!(err, StorageError::Corrupt { .. }));
    }
}
