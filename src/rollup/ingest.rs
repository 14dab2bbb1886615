//! Incremental ingestion: bring daily aggregates up to date with snapshots
//! captured since the checkpoint.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use tracing::{info, warn};

use crate::config::StoreLayout;
use crate::error::Result;
use crate::rollup::daily::{aggregate_day, write_daily};
use crate::rollup::loader::fold_snapshots;
use crate::rollup::stats::StationTallies;
use crate::snapshot::SnapshotListing;
use crate::store::ObjectStore;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IngestReport {
    pub dates_written: Vec<NaiveDate>,
    /// Touched dates where no snapshot could be loaded; their previous aggregate is kept.
    pub dates_skipped: Vec<NaiveDate>,
    pub snapshots_loaded: usize,
    pub snapshots_skipped: usize,
    pub unusable_records: usize,
}

/// Dates on or after `since` that have at least one snapshot newer than `checkpoint`.
pub fn touched_dates(
    listing: &SnapshotListing,
    checkpoint: Option<DateTime<Utc>>,
    since: NaiveDate,
) -> BTreeSet<NaiveDate> {
    listing
        .newer_than(checkpoint)
        .map(|r| r.date)
        .filter(|d| *d >= since)
        .collect()
}

/// Rewrites the daily aggregate of every touched date.
///
/// Each date is rebuilt from *all* of its snapshots, not only the new ones,
/// because the write replaces the previous document. A date is written only
/// after every one of its snapshots has been attempted.
#[tracing::instrument(skip_all, fields(checkpoint = ?checkpoint, since = %since))]
pub async fn ingest_new_snapshots(
    store: &Arc<dyn ObjectStore>,
    layout: &StoreLayout,
    listing: &SnapshotListing,
    checkpoint: Option<DateTime<Utc>>,
    since: NaiveDate,
    concurrency: usize,
) -> Result<IngestReport> {
    let touched = touched_dates(listing, checkpoint, since);
    let by_date = listing.by_date();
    let mut report = IngestReport::default();

    info!(dates = touched.len(), "Ingesting dates with new snapshots");

    for date in touched {
        let refs = by_date.get(&date).map(Vec::as_slice).unwrap_or_default();
        let mut tallies = StationTallies::default();
        let loaded =
            fold_snapshots(store, refs, concurrency, |_, s| tallies.add_snapshot(&s)).await?;

        report.snapshots_loaded += loaded.loaded;
        report.snapshots_skipped += loaded.skipped.len();
        report.unusable_records += tallies.unusable_records;

        if loaded.loaded == 0 {
            warn!(date = %date, attempted = refs.len(), "No readable snapshots for date, keeping previous aggregate");
            report.dates_skipped.push(date);
            continue;
        }

        let aggregate = aggregate_day(date, &tallies);
        write_daily(store.as_ref(), layout, &aggregate).await?;
        info!(
            date = %date,
            snapshots = loaded.loaded,
            stations = aggregate.stations.len(),
            "Daily aggregate updated"
        );
        report.dates_written.push(date);
    }

    Ok(report)
}
