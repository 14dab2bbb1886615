//! Full recomputation from raw snapshots in the trailing window.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Days, NaiveDate};
use tracing::info;

use crate::error::Result;
use crate::rollup::daily::aggregate_day;
use crate::rollup::loader::fold_snapshots;
use crate::rollup::stats::StationTallies;
use crate::rollup::types::{DailyAggregate, PercentFull};
use crate::snapshot::SnapshotListing;
use crate::store::ObjectStore;

#[derive(Debug, Default)]
pub struct FullReport {
    /// One fraction per station over every observation in the window.
    pub percent_full: PercentFull,
    /// Per-date aggregates built from the same snapshots.
    pub days: Vec<DailyAggregate>,
    pub snapshots_loaded: usize,
    pub snapshots_skipped: usize,
    pub unusable_records: usize,
}

/// First partition date included by the full path: `today - days`, inclusive.
pub fn full_window_start(today: NaiveDate, days: u32) -> NaiveDate {
    today
        .checked_sub_days(Days::new(u64::from(days)))
        .unwrap_or(NaiveDate::MIN)
}

/// Loads every snapshot dated on or after `since` and computes the flat fraction.
#[tracing::instrument(skip(store, listing))]
pub async fn flat_window_percent_full(
    store: &Arc<dyn ObjectStore>,
    listing: &SnapshotListing,
    since: NaiveDate,
    concurrency: usize,
) -> Result<FullReport> {
    let refs: Vec<_> = listing.since(since).collect();
    info!(snapshots = refs.len(), "Recomputing from raw snapshots");

    let mut window = StationTallies::default();
    let mut per_date: BTreeMap<NaiveDate, StationTallies> = BTreeMap::new();
    let loaded = fold_snapshots(store, &refs, concurrency, |r, s| {
        window.add_snapshot(&s);
        per_date.entry(r.date).or_default().add_snapshot(&s);
    })
    .await?;

    let days = per_date
        .iter()
        .map(|(date, tallies)| aggregate_day(*date, tallies))
        .collect();

    Ok(FullReport {
        percent_full: window.percent_full(),
        days,
        snapshots_loaded: loaded.loaded,
        snapshots_skipped: loaded.skipped.len(),
        unusable_records: window.unusable_records,
    })
}
