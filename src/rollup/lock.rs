//! Single-flight lock that keeps two rollups from writing at the same time.
//!
//! The lock is an object created with create-if-absent semantics. A lock
//! whose holder never released it is replaced once it is older than the TTL.
//! A long run calls [`RunLock::refresh`] between phases to restart its TTL and
//! to find out whether another run has taken over.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Result, RollupError};
use crate::store::{JSON, ObjectStore};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct LockBody {
    holder: String,
    acquired_at: DateTime<Utc>,
}

/// A held lock. Call [`RunLock::release`] when the run ends, whatever its result.
#[derive(Debug)]
pub struct RunLock {
    key: String,
    holder: String,
}

impl RunLock {
    #[tracing::instrument(skip(store))]
    pub async fn acquire(
        store: &dyn ObjectStore,
        key: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let holder = format!(
            "{}-{}",
            std::process::id(),
            now.timestamp_nanos_opt().unwrap_or_default()
        );
        let body = LockBody {
            holder: holder.clone(),
            acquired_at: now,
        };
        let bytes = serde_json::to_vec(&body).map_err(|e| RollupError::encode(key, e))?;

        if try_create(store, key, bytes.clone()).await? {
            return Ok(Self {
                key: key.to_string(),
                holder,
            });
        }

        let existing = read_body(store, key).await?;
        match existing {
            Some(current) if !is_stale(&current, ttl, now) => Err(RollupError::LockHeld {
                key: key.to_string(),
                since: current.acquired_at,
            }),
            stale => {
                warn!(key, previous = ?stale, "Replacing abandoned rollup lock");
                store
                    .delete(key)
                    .await
                    .map_err(|e| RollupError::persistence(key, e))?;
                if try_create(store, key, bytes).await? {
                    Ok(Self {
                        key: key.to_string(),
                        holder,
                    })
                } else {
                    // Someone else replaced it first
                    let since = read_body(store, key)
                        .await?
                        .map(|b| b.acquired_at)
                        .unwrap_or(now);
                    Err(RollupError::LockHeld {
                        key: key.to_string(),
                        since,
                    })
                }
            }
        }
    }

    /// Restarts the TTL from `now` if this run still holds the lock.
    ///
    /// Fails with [`RollupError::LockLost`] when the lock is gone or belongs to
    /// another holder. The check and the rewrite are two calls, so a takeover
    /// landing between them is only noticed at the next refresh or release.
    pub async fn refresh(&self, store: &dyn ObjectStore, now: DateTime<Utc>) -> Result<()> {
        match read_body(store, &self.key).await? {
            Some(body) if body.holder == self.holder => {
                let renewed = LockBody {
                    holder: self.holder.clone(),
                    acquired_at: now,
                };
                let bytes =
                    serde_json::to_vec(&renewed).map_err(|e| RollupError::encode(&self.key, e))?;
                store
                    .put(&self.key, bytes, JSON)
                    .await
                    .map_err(|e| RollupError::persistence(&self.key, e))?;
                debug!(key = %self.key, "Rollup lock refreshed");
                Ok(())
            }
            _ => Err(RollupError::LockLost {
                key: self.key.clone(),
            }),
        }
    }

    /// Deletes the lock if this run still holds it.
    pub async fn release(self, store: &dyn ObjectStore) -> Result<()> {
        match read_body(store, &self.key).await? {
            Some(body) if body.holder == self.holder => {
                store
                    .delete(&self.key)
                    .await
                    .map_err(|e| RollupError::persistence(&self.key, e))?;
                info!(key = %self.key, "Rollup lock released");
            }
            _ => warn!(key = %self.key, "Rollup lock was taken over, leaving it in place"),
        }
        Ok(())
    }
}

async fn try_create(store: &dyn ObjectStore, key: &str, body: Vec<u8>) -> Result<bool> {
    store
        .put_if_absent(key, body, JSON)
        .await
        .map_err(|e| RollupError::persistence(key, e))
}

/// `None` for a missing or unreadable lock body.
async fn read_body(store: &dyn ObjectStore, key: &str) -> Result<Option<LockBody>> {
    let bytes = store
        .get(key)
        .await
        .map_err(|e| RollupError::upstream(format!("lock '{key}'"), e))?;
    Ok(bytes.and_then(|b| serde_json::from_slice(&b).ok()))
}

fn is_stale(body: &LockBody, ttl: Duration, now: DateTime<Utc>) -> bool {
    let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
    body.acquired_at
        .checked_add_signed(ttl)
        .is_some_and(|expires| expires <= now)
}
