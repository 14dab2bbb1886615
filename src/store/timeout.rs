use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;

use super::ObjectStore;
use crate::error::StoreError;

/// An [`ObjectStore`] wrapper that fails any call running longer than `limit`.
pub struct TimeoutStore<S> {
    pub inner: S,
    pub limit: Duration,
}

impl<S> TimeoutStore<S> {
    pub fn new(inner: S, limit: Duration) -> Self {
        Self { inner, limit }
    }

    async fn bounded<T, F>(&self, op: &'static str, key: &str, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        tokio::time::timeout(self.limit, fut)
            .await
            .unwrap_or_else(|_| {
                Err(StoreError::Timeout {
                    op,
                    key: key.to_string(),
                    after: self.limit,
                })
            })
    }
}

#[async_trait]
impl<S: ObjectStore> ObjectStore for TimeoutStore<S> {
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.bounded("list", prefix, self.inner.list(prefix)).await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.bounded("get", key, self.inner.get(key)).await
    }

    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), StoreError> {
        self.bounded("put", key, self.inner.put(key, body, content_type))
            .await
    }

    async fn put_if_absent(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<bool, StoreError> {
        self.bounded(
            "put_if_absent",
            key,
            self.inner.put_if_absent(key, body, content_type),
        )
        .await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.bounded("delete", key, self.inner.delete(key)).await
    }
}
