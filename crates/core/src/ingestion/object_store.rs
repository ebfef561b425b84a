use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use uuid::Uuid;

use crate::errors::StoreError;

/// Durable blob storage addressed by `/`-separated keys. Writing an existing key replaces it.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;
}

/// Stores objects as files under a root directory.
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_)));
        if key.is_empty() || escapes {
            return Err(StoreError::NotFound(format!("invalid object key `{key}`")));
        }
        Ok(self.root.join(relative))
    }
}

fn io_error(error: std::io::Error) -> StoreError {
    StoreError::Unavailable(error.to_string())
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
        }
        let staging = path.with_extension(format!("{}.tmp", Uuid::new_v4().simple()));
        tokio::fs::write(&staging, bytes).await.map_err(io_error)?;
        if let Err(error) = tokio::fs::rename(&staging, &path).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(io_error(error));
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(io_error(error)),
        }
    }
}

#[derive(Clone, Default)]
pub struct InMemoryObjectStore {
    objects: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
    failing: Arc<Mutex<bool>>,
}

impl InMemoryObjectStore {
    pub fn objects(&self) -> BTreeMap<String, Vec<u8>> {
        match self.objects.lock() {
            Ok(objects) => objects.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn set_failing(&self, failing: bool) {
        match self.failing.lock() {
            Ok(mut flag) => *flag = failing,
            Err(poisoned) => *poisoned.into_inner() = failing,
        }
    }

    fn is_failing(&self) -> bool {
        match self.failing.lock() {
            Ok(flag) => *flag,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        if self.is_failing() {
            return Err(StoreError::Unavailable("object store unavailable".to_owned()));
        }
        match self.objects.lock() {
            Ok(mut objects) => objects.insert(key.to_owned(), bytes),
            Err(poisoned) => poisoned.into_inner().insert(key.to_owned(), bytes),
        };
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.objects().get(key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::{LocalObjectStore, ObjectStore};

    #[tokio::test]
    async fn local_store_writes_nested_keys_and_replaces_in_place() {
        let dir = TempDir::new().expect("temp dir");
        let store = LocalObjectStore::new(dir.path());

        store.put("a/b/c.json.zst", b"first".to_vec()).await.expect("put");
        store.put("a/b/c.json.zst", b"second".to_vec()).await.expect("overwrite");

        assert_eq!(store.get("a/b/c.json.zst").await.expect("get"), Some(b"second".to_vec()));
        assert_eq!(store.get("a/b/missing").await.expect("get"), None);
        let leftovers = std::fs::read_dir(dir.path().join("a/b")).expect("dir").count();
        assert_eq!(leftovers, 1);
    }

    #[tokio::test]
    async fn keys_cannot_escape_the_root() {
        let dir = TempDir::new().expect("temp dir");
        let store = LocalObjectStore::new(dir.path());

        assert!(store.put("../outside", b"x".to_vec()).await.is_err());
        assert!(store.put("/absolute", b"x".to_vec()).await.is_err());
    }
}
