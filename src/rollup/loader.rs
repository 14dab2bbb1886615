//! Snapshot downloads with per-unit outcomes.

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::{Result, RollupError, StoreError};
use crate::rollup::types::UnitOutcome;
use crate::snapshot::{Snapshot, SnapshotRef, decode_snapshot};
use crate::store::ObjectStore;

/// Fetches and decodes one snapshot.
///
/// A timeout is fatal for the run. A missing object, a backend error on this
/// key, or an undecodable body only skips the snapshot.
pub async fn load_snapshot(store: &dyn ObjectStore, key: &str) -> Result<UnitOutcome<Snapshot>> {
    let bytes = match store.get(key).await {
        Ok(Some(bytes)) => bytes,
        Ok(None) => {
            return Ok(UnitOutcome::Skipped {
                key: key.to_string(),
                reason: "object disappeared after listing".to_string(),
            });
        }
        Err(e @ StoreError::Timeout { .. }) => {
            return Err(RollupError::upstream(format!("snapshot '{key}'"), e));
        }
        Err(e) => {
            return Ok(UnitOutcome::Skipped {
                key: key.to_string(),
                reason: e.to_string(),
            });
        }
    };

    match decode_snapshot(&bytes) {
        Ok(snapshot) => Ok(UnitOutcome::Loaded(snapshot)),
        Err(e) => Ok(UnitOutcome::Skipped {
            key: key.to_string(),
            reason: format!("{e:#}"),
        }),
    }
}

/// How many snapshots were folded, and the keys that were skipped with their reasons.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: usize,
    pub skipped: Vec<(String, String)>,
}

/// Downloads every snapshot in `refs`, with at most `concurrency` in flight,
/// and hands each one to `fold` as soon as it has decoded.
///
/// Snapshots are not retained; memory is bounded by the downloads in flight.
/// Returns only after every spawned download has finished. Skipped keys are
/// reported in key order.
pub async fn fold_snapshots<F>(
    store: &Arc<dyn ObjectStore>,
    refs: &[&SnapshotRef],
    concurrency: usize,
    mut fold: F,
) -> Result<LoadReport>
where
    F: FnMut(&SnapshotRef, Snapshot),
{
    let limit = concurrency.max(1);
    let mut pending = refs.iter().enumerate();
    let mut tasks: JoinSet<(usize, Result<UnitOutcome<Snapshot>>)> = JoinSet::new();
    let mut report = LoadReport::default();
    let mut fatal = None;

    loop {
        // Stop spawning after a fatal error but drain what is already running.
        while fatal.is_none() && tasks.len() < limit {
            let Some((i, r)) = pending.next() else { break };
            let store = store.clone();
            let key = r.key.clone();
            tasks.spawn(async move { (i, load_snapshot(store.as_ref(), &key).await) });
        }

        let Some(joined) = tasks.join_next().await else {
            break;
        };
        match joined {
            Ok((i, Ok(UnitOutcome::Loaded(snapshot)))) => {
                let r = refs[i];
                debug!(key = %r.key, stations = snapshot.stations.len(), "Snapshot loaded");
                report.loaded += 1;
                fold(r, snapshot);
            }
            Ok((_, Ok(UnitOutcome::Skipped { key, reason }))) => {
                warn!(key = %key, reason = %reason, "Skipping unreadable snapshot");
                report.skipped.push((key, reason));
            }
            Ok((_, Err(e))) => {
                fatal.get_or_insert(e);
            }
            Err(e) => {
                fatal.get_or_insert(RollupError::Task(e.to_string()));
            }
        }
    }

    report.skipped.sort();
    match fatal {
        Some(e) => Err(e),
        None => Ok(report),
    }
}
