//! The published artifact: a gzip-compressed JSON array of [`DpiRow`]s.

use std::io::Read;

use anyhow::Context;
use flate2::read::GzDecoder;
use tracing::info;

use crate::error::{Result, RollupError};
use crate::rollup::types::DpiRow;
use crate::snapshot::encode_gzip_json;
use crate::store::{JSON, ObjectStore};

/// Replaces the artifact with `rows`. Returns the compressed size.
///
/// Atomic replacement is delegated to [`ObjectStore::put`].
pub async fn publish_artifact(store: &dyn ObjectStore, key: &str, rows: &[DpiRow]) -> Result<usize> {
    let body = encode_gzip_json(&rows).map_err(|e| RollupError::encode(key, e))?;
    let size = body.len();

    store
        .put(key, body, JSON)
        .await
        .map_err(|e| RollupError::persistence(key, e))?;

    info!(key, rows = rows.len(), bytes = size, "Artifact published");
    Ok(size)
}

/// Reads and decompresses the artifact, as the serving endpoint does on every request.
pub async fn read_artifact(store: &dyn ObjectStore, key: &str) -> anyhow::Result<Option<Vec<DpiRow>>> {
    let Some(bytes) = store.get(key).await? else {
        return Ok(None);
    };

    let mut json = Vec::new();
    GzDecoder::new(bytes.as_slice())
        .read_to_end(&mut json)
        .with_context(|| format!("artifact '{key}' is not valid gzip"))?;
    let rows = serde_json::from_slice(&json)
        .with_context(|| format!("artifact '{key}' is not a DPI row array"))?;
    Ok(Some(rows))
}
