//! One end-to-end rollup: lock, select mode, estimate, join, publish, checkpoint.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{Instrument, error, info, warn};

use crate::config::{RollupSettings, StoreLayout};
use crate::error::{Result, RollupError};
use crate::reference::ReferenceTables;
use crate::rollup::checkpoint::{read_checkpoint, write_checkpoint};
use crate::rollup::estimator::{
    DayGroupedEstimator, Estimate, EstimateInput, FlatWindowEstimator, PercentFullEstimator,
};
use crate::rollup::join::join_dpi;
use crate::rollup::lock::RunLock;
use crate::rollup::mode::select_mode;
use crate::rollup::publish::publish_artifact;
use crate::rollup::types::{Mode, NoDataReason, RollupOutcome, RunSummary, Strategy};
use crate::snapshot::SnapshotListing;
use crate::store::ObjectStore;

/// The rollup job bound to one store.
pub struct RollupJob {
    store: Arc<dyn ObjectStore>,
    layout: StoreLayout,
    settings: RollupSettings,
}

impl RollupJob {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        layout: StoreLayout,
        settings: RollupSettings,
    ) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            store,
            layout,
            settings,
        })
    }

    pub fn layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn settings(&self) -> &RollupSettings {
        &self.settings
    }

    /// Runs one rollup as of `now`.
    ///
    /// The artifact is replaced and the checkpoint advanced to `now` only when
    /// the run publishes. Any `Err` leaves the checkpoint where it was, so the
    /// next run reprocesses the same snapshots.
    ///
    /// The lock is timed with the wall clock, not `now`, so a run for a past
    /// instant still holds a live lock.
    pub async fn run(&self, now: DateTime<Utc>) -> Result<RollupOutcome> {
        let span = tracing::info_span!("rollup", now = %now, tz = %self.settings.timezone);
        async {
            let lock = RunLock::acquire(
                self.store.as_ref(),
                &self.layout.lock_key,
                self.settings.lock_ttl,
                Utc::now(),
            )
            .await?;

            let result = self.run_locked(now, &lock).await;

            if let Err(e) = lock.release(self.store.as_ref()).await {
                error!(error = %e, "Failed to release rollup lock");
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn run_locked(&self, now: DateTime<Utc>, lock: &RunLock) -> Result<RollupOutcome> {
        let store = self.store.as_ref();
        let checkpoint = read_checkpoint(store, &self.layout.checkpoint_key).await?;

        let keys = store
            .list(&self.layout.snapshots_prefix)
            .await
            .map_err(|e| RollupError::upstream("snapshot listing", e))?;
        let listing = SnapshotListing::from_keys(keys, self.settings.timezone);
        if listing.is_empty() {
            info!(reason = %NoDataReason::NoSnapshots, "Nothing to publish");
            return Ok(RollupOutcome::NoData(NoDataReason::NoSnapshots));
        }

        let today = now.with_timezone(&self.settings.timezone).date_naive();
        let mode = select_mode(&listing, today, self.settings.incremental_min_days);
        info!(
            ?mode,
            %today,
            snapshots = listing.len(),
            rejected = listing.rejected.len(),
            checkpoint = ?checkpoint,
            "Rollup starting"
        );

        let input = EstimateInput {
            store: &self.store,
            layout: &self.layout,
            settings: &self.settings,
            listing: &listing,
            checkpoint,
            today,
        };
        let (strategy, estimate) = match mode {
            Mode::Incremental => {
                let estimate = DayGroupedEstimator.estimate(&input).await?;
                if estimate.percent_full.is_empty() {
                    warn!("No daily aggregates in the window, recomputing from raw snapshots");
                    let fallback = FlatWindowEstimator.estimate(&input).await?;
                    (Strategy::FlatWindow, merge_counts(estimate, fallback))
                } else {
                    (Strategy::DayGrouped, estimate)
                }
            }
            Mode::Full => (Strategy::FlatWindow, FlatWindowEstimator.estimate(&input).await?),
        };

        if estimate.percent_full.is_empty() {
            info!(reason = %NoDataReason::EmptyWindow, %strategy, "Nothing to publish");
            return Ok(RollupOutcome::NoData(NoDataReason::EmptyWindow));
        }

        // Estimation is the long phase; make sure no other run took over
        // before the artifact and checkpoint are written.
        lock.refresh(store, Utc::now()).await?;

        let tables = ReferenceTables::load(store, &self.layout).await?;
        let joined = join_dpi(&estimate.percent_full, &tables);
        info!(
            rows = joined.rows.len(),
            unusable_capacity = joined.drops.unusable_capacity,
            missing_percent_full = joined.drops.missing_percent_full,
            missing_flow = joined.drops.missing_flow,
            missing_capacity = joined.drops.missing_capacity,
            "Stations joined"
        );
        if joined.rows.is_empty() {
            info!(reason = %NoDataReason::EmptyJoin, "Nothing to publish");
            return Ok(RollupOutcome::NoData(NoDataReason::EmptyJoin));
        }

        let artifact_bytes =
            publish_artifact(store, &self.layout.artifact_key, &joined.rows).await?;
        write_checkpoint(store, &self.layout.checkpoint_key, now).await?;

        let summary = RunSummary {
            mode,
            strategy,
            rows: joined.rows.len(),
            top_station: joined
                .rows
                .first()
                .map(|r| (r.station_id.clone(), r.dpi)),
            snapshots_loaded: estimate.snapshots_loaded,
            snapshots_skipped: estimate.snapshots_skipped,
            unusable_records: estimate.unusable_records,
            keys_rejected: listing.rejected.len(),
            days_written: estimate.days_written,
            join: joined.drops,
            artifact_bytes,
        };
        info!(
            ?mode,
            %strategy,
            rows = summary.rows,
            top_station = ?summary.top_station,
            snapshots_loaded = summary.snapshots_loaded,
            snapshots_skipped = summary.snapshots_skipped,
            unusable_records = summary.unusable_records,
            keys_rejected = summary.keys_rejected,
            days_written = summary.days_written,
            artifact_bytes,
            "Rollup published"
        );
        Ok(RollupOutcome::Published(summary))
    }
}

/// Keeps the fallback's estimate while counting the work of both attempts.
fn merge_counts(first: Estimate, fallback: Estimate) -> Estimate {
    Estimate {
        percent_full: fallback.percent_full,
        snapshots_loaded: first.snapshots_loaded + fallback.snapshots_loaded,
        snapshots_skipped: first.snapshots_skipped + fallback.snapshots_skipped,
        unusable_records: first.unusable_records + fallback.unusable_records,
        days_written: first.days_written.max(fallback.days_written),
    }
}
