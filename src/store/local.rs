use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use super::ObjectStore;
use crate::error::StoreError;

static TEMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// [`ObjectStore`] rooted at a local directory. Keys map to relative paths.
///
/// Writes go to a temp file next to the target and are renamed into place,
/// so readers never observe a partially written object.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        key.split('/')
            .filter(|part| !part.is_empty())
            .fold(self.root.clone(), |path, part| path.join(part))
    }

    fn temp_path(path: &Path) -> PathBuf {
        let seq = TEMP_SEQ.fetch_add(1, Ordering::Relaxed);
        let mut name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(format!(".{}-{}.tmp", std::process::id(), seq));
        path.with_file_name(name)
    }

    async fn ensure_parent(path: &Path, key: &str) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(key, e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(StoreError::io(prefix, e)),
            };

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| StoreError::io(prefix, e))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| StoreError::io(prefix, e))?;
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }

                let Ok(relative) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.ends_with(".tmp") {
                    continue;
                }
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match tokio::fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(key, e)),
        }
    }

    async fn put(&self, key: &str, body: Vec<u8>, _content_type: &str) -> Result<(), StoreError> {
        let path = self.path_for(key);
        Self::ensure_parent(&path, key).await?;

        let temp = Self::temp_path(&path);
        tokio::fs::write(&temp, &body)
            .await
            .map_err(|e| StoreError::io(key, e))?;

        if let Err(e) = tokio::fs::rename(&temp, &path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(StoreError::io(key, e));
        }
        Ok(())
    }

    async fn put_if_absent(
        &self,
        key: &str,
        body: Vec<u8>,
        _content_type: &str,
    ) -> Result<bool, StoreError> {
        let path = self.path_for(key);
        Self::ensure_parent(&path, key).await?;

        let mut file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(StoreError::io(key, e)),
        };

        file.write_all(&body)
            .await
            .map_err(|e| StoreError::io(key, e))?;
        file.flush().await.map_err(|e| StoreError::io(key, e))?;
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(key, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_roundtrip_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());

        store
            .put("daily/2024-01-01.json", b"{}".to_vec(), super::super::JSON)
            .await
            .unwrap();

        let body = store.get("daily/2024-01-01.json").await.unwrap();
        assert_eq!(body.as_deref(), Some(&b"{}"[..]));
    }

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        assert!(store.get("nope.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_filters_prefix_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        for key in [
            "snapshots/2024/01/02/000000.json.gz",
            "snapshots/2024/01/01/120000.json.gz",
            "daily/2024-01-01.json",
        ] {
            store.put(key, vec![1], super::super::JSON).await.unwrap();
        }

        let keys = store.list("snapshots/").await.unwrap();
        assert_eq!(
            keys,
            vec![
                "snapshots/2024/01/01/120000.json.gz".to_string(),
                "snapshots/2024/01/02/000000.json.gz".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_list_missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path().join("absent"));
        assert!(store.list("").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_put_if_absent_only_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());

        assert!(store.put_if_absent("locks/a", vec![1], "x").await.unwrap());
        assert!(!store.put_if_absent("locks/a", vec![2], "x").await.unwrap());
        assert_eq!(store.get("locks/a").await.unwrap(), Some(vec![1]));

        store.delete("locks/a").await.unwrap();
        store.delete("locks/a").await.unwrap();
        assert!(store.put_if_absent("locks/a", vec![3], "x").await.unwrap());
    }
}
