//! The checkpoint: one ISO-8601 timestamp of the last successful run.

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::error::{Result, RollupError};
use crate::store::{ObjectStore, TEXT};

/// Reads the checkpoint. A missing object means "never run".
///
/// Unparseable content is treated as missing, which makes the next run
/// reprocess everything instead of failing forever.
pub async fn read_checkpoint(store: &dyn ObjectStore, key: &str) -> Result<Option<DateTime<Utc>>> {
    let Some(bytes) = store
        .get(key)
        .await
        .map_err(|e| RollupError::upstream("checkpoint", e))?
    else {
        return Ok(None);
    };

    let text = String::from_utf8_lossy(&bytes);
    match DateTime::parse_from_rfc3339(text.trim()) {
        Ok(at) => Ok(Some(at.with_timezone(&Utc))),
        Err(e) => {
            warn!(key, content = %text.trim(), error = %e, "Ignoring unparseable checkpoint");
            Ok(None)
        }
    }
}

pub async fn write_checkpoint(store: &dyn ObjectStore, key: &str, at: DateTime<Utc>) -> Result<()> {
    store
        .put(key, at.to_rfc3339().into_bytes(), TEXT)
        .await
        .map_err(|e| RollupError::persistence(key, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LocalStore;

    #[tokio::test]
    async fn test_missing_checkpoint_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        assert_eq!(read_checkpoint(&store, "state/cp.txt").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        let at = DateTime::parse_from_rfc3339("2024-01-02T03:04:05.678Z")
            .unwrap()
            .with_timezone(&Utc);

        write_checkpoint(&store, "state/cp.txt", at).await.unwrap();
        assert_eq!(read_checkpoint(&store, "state/cp.txt").await.unwrap(), Some(at));
    }

    #[tokio::test]
    async fn test_python_style_offset_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        store
            .put("cp.txt", b"2024-01-01T10:00:00.123456+00:00\n".to_vec(), TEXT)
            .await
            .unwrap();
        let at = read_checkpoint(&store, "cp.txt").await.unwrap().unwrap();
        assert_eq!(at.timestamp(), 1_704_103_200);
    }

    #[tokio::test]
    async fn test_garbage_checkpoint_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalStore::new(dir.path());
        store.put("cp.txt", b"yesterday".to_vec(), TEXT).await.unwrap();
        assert_eq!(read_checkpoint(&store, "cp.txt").await.unwrap(), None);
    }
}
