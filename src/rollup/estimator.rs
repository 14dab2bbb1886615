//! Percent-full estimation strategies.
//!
//! Both strategies answer the same question ("how often was each station
//! completely full over the trailing window") with different weighting; see
//! [`crate::rollup::stats`]. They are kept separate on purpose because
//! switching between them changes the published numbers.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use tracing::info;

use crate::config::{RollupSettings, StoreLayout};
use crate::error::Result;
use crate::rollup::daily::write_daily;
use crate::rollup::full::{flat_window_percent_full, full_window_start};
use crate::rollup::ingest::ingest_new_snapshots;
use crate::rollup::types::{PercentFull, Strategy};
use crate::rollup::window::{window_dates, window_percent_full};
use crate::snapshot::SnapshotListing;
use crate::store::ObjectStore;

/// Everything an estimator may read for one run.
pub struct EstimateInput<'a> {
    pub store: &'a Arc<dyn ObjectStore>,
    pub layout: &'a StoreLayout,
    pub settings: &'a RollupSettings,
    pub listing: &'a SnapshotListing,
    pub checkpoint: Option<DateTime<Utc>>,
    pub today: NaiveDate,
}

#[derive(Debug, Default)]
pub struct Estimate {
    /// Empty when the window held no observations.
    pub percent_full: PercentFull,
    pub snapshots_loaded: usize,
    pub snapshots_skipped: usize,
    /// Station records with no dock count, or that did not decode.
    pub unusable_records: usize,
    pub days_written: usize,
}

#[async_trait]
pub trait PercentFullEstimator: Send + Sync {
    fn strategy(&self) -> Strategy;

    async fn estimate(&self, input: &EstimateInput<'_>) -> Result<Estimate>;
}

/// Incremental strategy: refresh daily aggregates touched since the
/// checkpoint, then average the stored days of the window.
pub struct DayGroupedEstimator;

#[async_trait]
impl PercentFullEstimator for DayGroupedEstimator {
    fn strategy(&self) -> Strategy {
        Strategy::DayGrouped
    }

    async fn estimate(&self, input: &EstimateInput<'_>) -> Result<Estimate> {
        let window = window_dates(input.today, input.settings.window_days);
        let since = window.first().copied().unwrap_or(input.today);

        let ingest = ingest_new_snapshots(
            input.store,
            input.layout,
            input.listing,
            input.checkpoint,
            since,
            input.settings.concurrency,
        )
        .await?;

        let percent_full = window_percent_full(
            input.store.as_ref(),
            input.layout,
            input.today,
            input.settings.window_days,
        )
        .await?
        .map(|w| {
            info!(
                days_loaded = w.days_loaded,
                days_skipped = w.days_skipped,
                stations = w.percent_full.len(),
                "Window aggregated"
            );
            w.percent_full
        })
        .unwrap_or_default();

        Ok(Estimate {
            percent_full,
            snapshots_loaded: ingest.snapshots_loaded,
            snapshots_skipped: ingest.snapshots_skipped,
            unusable_records: ingest.unusable_records,
            days_written: ingest.dates_written.len(),
        })
    }
}

/// Full strategy: one flat fraction over every raw snapshot in the window.
///
/// The per-date aggregates it builds along the way are stored too, so a later
/// switch to the incremental strategy finds the window already populated.
pub struct FlatWindowEstimator;

#[async_trait]
impl PercentFullEstimator for FlatWindowEstimator {
    fn strategy(&self) -> Strategy {
        Strategy::FlatWindow
    }

    async fn estimate(&self, input: &EstimateInput<'_>) -> Result<Estimate> {
        let since = full_window_start(input.today, input.settings.window_days);
        let report = flat_window_percent_full(
            input.store,
            input.listing,
            since,
            input.settings.concurrency,
        )
        .await?;

        for day in &report.days {
            write_daily(input.store.as_ref(), input.layout, day).await?;
        }

        Ok(Estimate {
            percent_full: report.percent_full,
            snapshots_loaded: report.snapshots_loaded,
            snapshots_skipped: report.snapshots_skipped,
            unusable_records: report.unusable_records,
            days_written: report.days.len(),
        })
    }
}
