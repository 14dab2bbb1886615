use chrono::NaiveDate;

use crate::rollup::types::Mode;
use crate::snapshot::SnapshotListing;

/// Chooses incremental mode once the oldest snapshot is at least `min_days` old.
///
/// Unparseable keys were already dropped from the listing; an empty listing
/// selects full mode, which then reports "no data".
pub fn select_mode(listing: &SnapshotListing, today: NaiveDate, min_days: i64) -> Mode {
    match listing.earliest_date() {
        Some(earliest) if (today - earliest).num_days() >= min_days => Mode::Incremental,
        _ => Mode::Full,
    }
}
