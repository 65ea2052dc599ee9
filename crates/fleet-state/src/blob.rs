//! Blob stores for service source archives and build artifacts.
//!
//! Keys are relative slash-separated paths (`default/billing/source.tar.gz`).

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;

use crate::error::{StateError, StateResult};

pub trait BlobStore: Send + Sync {
    /// Store bytes under `key`, replacing any existing blob.
    fn put(&self, key: &str, bytes: &[u8]) -> StateResult<()>;

    fn contains(&self, key: &str) -> StateResult<bool>;

    /// On-disk location of a blob, for stores that keep blobs on disk.
    fn local_path(&self, key: &str) -> StateResult<Option<PathBuf>>;

    /// Delete a blob. Returns true if it existed.
    fn delete(&self, key: &str) -> StateResult<bool>;
}

/// Reject keys that could escape the store root.
fn check_key(key: &str) -> StateResult<()> {
    let path = Path::new(key);
    let escapes = key.is_empty()
        || path
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
    if escapes {
        return Err(StateError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Blob store rooted at a directory.
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn open(root: impl Into<PathBuf>) -> StateResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| StateError::Open(e.to_string()))?;
        debug!(root = ?root, "blob store opened");
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> StateResult<PathBuf> {
        check_key(key)?;
        Ok(self.root.join(key))
    }
}

impl BlobStore for FsBlobStore {
    fn put(&self, key: &str, bytes: &[u8]) -> StateResult<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StateError::Blob(e.to_string()))?;
        }
        // Write then rename so readers never observe a partial blob.
        let tmp = path.with_extension("partial");
        fs::write(&tmp, bytes).map_err(|e| StateError::Blob(e.to_string()))?;
        fs::rename(&tmp, &path).map_err(|e| StateError::Blob(e.to_string()))?;
        debug!(%key, size = bytes.len(), "blob stored");
        Ok(())
    }

    fn contains(&self, key: &str) -> StateResult<bool> {
        Ok(self.path_for(key)?.exists())
    }

    fn local_path(&self, key: &str) -> StateResult<Option<PathBuf>> {
        let path = self.path_for(key)?;
        Ok(path.exists().then_some(path))
    }

    fn delete(&self, key: &str) -> StateResult<bool> {
        let path = self.path_for(key)?;
        let result = if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        match result {
            Ok(()) => {
                debug!(%key, "blob deleted");
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StateError::Blob(e.to_string())),
        }
    }
}

/// Blob store kept in process memory.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> StateResult<std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>>> {
        self.blobs
            .lock()
            .map_err(|_| StateError::Blob("blob map poisoned".to_string()))
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(&self, key: &str, bytes: &[u8]) -> StateResult<()> {
        check_key(key)?;
        self.lock()?.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn contains(&self, key: &str) -> StateResult<bool> {
        Ok(self.lock()?.contains_key(key))
    }

    fn local_path(&self, _key: &str) -> StateResult<Option<PathBuf>> {
        Ok(None)
    }

    fn delete(&self, key: &str) -> StateResult<bool> {
        Ok(self.lock()?.remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fs_put_locate_delete() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = FsBlobStore::open(dir.path().join("blobs")).unwrap();

        blobs.put("default/billing/source.tar.gz", b"archive").unwrap();
        assert!(blobs.contains("default/billing/source.tar.gz").unwrap());

        let path = blobs.local_path("default/billing/source.tar.gz").unwrap().unwrap();
        assert_eq!(fs::read(path).unwrap(), b"archive");

        assert!(blobs.delete("default/billing/source.tar.gz").unwrap());
        assert!(!blobs.delete("default/billing/source.tar.gz").unwrap());
        assert!(blobs.local_path("default/billing/source.tar.gz").unwrap().is_none());
    }

    #[test]
    fn fs_rejects_escaping_keys() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = FsBlobStore::open(dir.path()).unwrap();

        assert!(matches!(blobs.put("../etc/passwd", b"x"), Err(StateError::InvalidKey(_))));
        assert!(matches!(blobs.delete("/abs"), Err(StateError::InvalidKey(_))));
        assert!(matches!(blobs.contains(""), Err(StateError::InvalidKey(_))));
    }

    #[test]
    fn memory_put_replaces_existing_blob() {
        let blobs = MemoryBlobStore::new();
        blobs.put("default/billing/source.tar.gz", b"v1").unwrap();
        blobs.put("default/billing/source.tar.gz", b"v2").unwrap();
        assert_eq!(blobs.len(), 1);
        assert!(matches!(blobs.put("../x", b"v"), Err(StateError::InvalidKey(_))));
    }

    #[test]
    fn memory_store_has_no_local_paths() {
        let blobs = MemoryBlobStore::new();
        blobs.put("k", b"v").unwrap();
        assert!(blobs.contains("k").unwrap());
        assert!(blobs.local_path("k").unwrap().is_none());
        assert!(blobs.delete("k").unwrap());
        assert!(blobs.is_empty());
    }
}
