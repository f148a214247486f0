//! Durable key-value storage for queue items and cached document snapshots.
//!
//! The sync engine never touches the filesystem directly; everything goes
//! through the [`KeyValueStore`] trait so tests can substitute an in-memory
//! store and alternative backends can be plugged in later.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::models::Document;

/// Errors that can occur in the durable store.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// I/O error reading or writing a file.
    #[error("I/O error for {0}: {1}")]
    Io(PathBuf, #[source] io::Error),
    /// Stored value could not be decoded.
    #[error("failed to decode stored value for key '{0}': {1}")]
    Decode(String, String),
    /// Key contains characters the store cannot represent.
    #[error("invalid storage key: '{0}'")]
    InvalidKey(String),
}

/// A durable, ordered key-value store.
///
/// Keys are slash-separated paths such as `queue/00000000000000000042` or
/// `documents/<id>`. `list_all` returns entries sorted by key, which the
/// offline queue relies on for FIFO ordering.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError>;
    fn delete(&self, key: &str) -> Result<(), StorageError>;
    /// Lists all entries whose key starts with `prefix`, sorted by key.
    fn list_all(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError>;
}

/// File-backed store: one file per key under a data directory.
#[derive(Clone)]
pub struct FileStore {
    data_dir: PathBuf,
}

impl FileStore {
    pub fn new(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        // Reject path traversal and empty segments before touching the fs.
        if key.is_empty()
            || key.split('/').any(|seg| {
                seg.is_empty() || seg == "." || seg == ".." || seg.contains('\\')
            })
        {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.data_dir.join(key))
    }

    fn collect(
        dir: &Path,
        base: &Path,
        out: &mut BTreeMap<String, Vec<u8>>,
    ) -> Result<(), StorageError> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(StorageError::Io(dir.to_path_buf(), e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::Io(dir.to_path_buf(), e))?;
            let path = entry.path();
            if path.is_dir() {
                Self::collect(&path, base, out)?;
            } else {
                let key = path
                    .strip_prefix(base)
                    .map(|p| p.to_string_lossy().replace('\\', "/"))
                    .unwrap_or_default();
                let bytes = fs::read(&path).map_err(|e| StorageError::Io(path.clone(), e))?;
                out.insert(key, bytes);
            }
        }
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Io(path, e)),
        }
    }

    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StorageError::Io(parent.to_path_buf(), e))?;
        }
        fs::write(&path, value).map_err(|e| StorageError::Io(path, e))
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(path, e)),
        }
    }

    fn list_all(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        let mut out = BTreeMap::new();
        Self::collect(&self.data_dir, &self.data_dir, &mut out)?;
        Ok(out
            .into_iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .collect())
    }
}

/// In-memory store for tests.
#[derive(Clone, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        self.entries.lock().unwrap().insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    fn list_all(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StorageError> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

const DOCUMENT_PREFIX: &str = "documents/";

/// Local cache of the latest known document snapshots.
///
/// The coordinator writes a snapshot back here after every successful
/// delivery or conflict resolution, so the cache always carries the most
/// recent version token.
#[derive(Clone)]
pub struct DocumentCache {
    store: Arc<dyn KeyValueStore>,
}

impl DocumentCache {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn load(&self, id: &str) -> Result<Option<Document>, StorageError> {
        match self.store.get(&format!("{DOCUMENT_PREFIX}{id}"))? {
            Some(bytes) => {
                let doc = serde_json::from_slice(&bytes)
                    .map_err(|e| StorageError::Decode(id.to_string(), e.to_string()))?;
                Ok(Some(doc))
            }
            None => Ok(None),
        }
    }

    pub fn save(&self, doc: &Document) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(doc)
            .map_err(|e| StorageError::Decode(doc.id.clone(), e.to_string()))?;
        self.store.put(&format!("{DOCUMENT_PREFIX}{}", doc.id), bytes)
    }

    pub fn remove(&self, id: &str) -> Result<(), StorageError> {
        self.store.delete(&format!("{DOCUMENT_PREFIX}{id}"))
    }

    pub fn list(&self) -> Result<Vec<Document>, StorageError> {
        let mut docs = Vec::new();
        for (key, bytes) in self.store.list_all(DOCUMENT_PREFIX)? {
            let doc = serde_json::from_slice(&bytes)
                .map_err(|e| StorageError::Decode(key, e.to_string()))?;
            docs.push(doc);
        }
        Ok(docs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn file_store() -> (FileStore, TempDir) {
        let temp = TempDir::new().unwrap();
        (FileStore::new(temp.path().to_path_buf()), temp)
    }

    #[test]
    fn test_get_missing_returns_none() {
        let (store, _temp) = file_store();
        assert!(store.get("documents/nope").unwrap().is_none());
    }

    #[test]
    fn test_put_get_delete() {
        let (store, _temp) = file_store();
        store.put("queue/0001", b"hello".to_vec()).unwrap();
        assert_eq!(store.get("queue/0001").unwrap().unwrap(), b"hello");
        store.delete("queue/0001").unwrap();
        assert!(store.get("queue/0001").unwrap().is_none());
    }

    #[test]
    fn test_delete_missing_is_ok() {
        let (store, _temp) = file_store();
        store.delete("queue/never-existed").unwrap();
    }

    #[test]
    fn test_list_all_sorted_and_filtered() {
        let (store, _temp) = file_store();
        store.put("queue/0002", b"b".to_vec()).unwrap();
        store.put("queue/0001", b"a".to_vec()).unwrap();
        store.put("documents/x", b"doc".to_vec()).unwrap();

        let entries = store.list_all("queue/").unwrap();
        let keys: Vec<_> = entries.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["queue/0001", "queue/0002"]);
    }

    #[test]
    fn test_rejects_traversal_keys() {
        let (store, _temp) = file_store();
        assert!(store.put("../escape", b"x".to_vec()).is_err());
        assert!(store.get("a//b").is_err());
    }

    #[test]
    fn test_memory_store_matches_file_store_semantics() {
        let store = MemoryStore::new();
        store.put("queue/0002", b"b".to_vec()).unwrap();
        store.put("queue/0001", b"a".to_vec()).unwrap();
        store.put("other/x", b"y".to_vec()).unwrap();

        let keys: Vec<_> = store
            .list_all("queue/")
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["queue/0001", "queue/0002"]);

        store.delete("queue/0001").unwrap();
        assert!(store.get("queue/0001").unwrap().is_none());
    }

    #[test]
    fn test_document_cache_round_trip() {
        let cache = DocumentCache::new(Arc::new(MemoryStore::new()));
        let doc = Document::new("Note", "body").with_version_token(Some("v1".into()));
        cache.save(&doc).unwrap();

        let loaded = cache.load(&doc.id).unwrap().unwrap();
        assert_eq!(loaded, doc);

        assert_eq!(cache.list().unwrap().len(), 1);
        cache.remove(&doc.id).unwrap();
        assert!(cache.load(&doc.id).unwrap().is_none());
    }
}
