//! Object storage seam.
//!
//! [`ObjectStore`] is the async trait every component receives explicitly.
//! [`S3Store`] talks to an S3 bucket, [`LocalStore`] to a directory tree, and
//! [`TimeoutStore`] bounds every call of an inner store.

mod local;
mod s3;
mod timeout;

pub use local::LocalStore;
pub use s3::S3Store;
pub use timeout::TimeoutStore;

use async_trait::async_trait;

use crate::error::StoreError;

pub const JSON: &str = "application/json";
pub const CSV: &str = "text/csv";
pub const TEXT: &str = "text/plain";
pub const PARQUET: &str = "application/vnd.apache.parquet";

/// Minimal key/value object store used by the rollup job.
///
/// `put` must replace the object atomically: readers observe either the old
/// or the new body, never a partial one.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Returns every key under `prefix`, sorted ascending.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Returns the object body, or `None` if the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<(), StoreError>;

    /// Creates the object only if the key is free. Returns `false` when it already exists.
    async fn put_if_absent(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<bool, StoreError>;

    /// Deletes the object. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}
