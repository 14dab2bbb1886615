//! Daily aggregate documents: build, write (overwrite), read.

use chrono::NaiveDate;
use tracing::{debug, warn};

use crate::config::StoreLayout;
use crate::error::{Result, RollupError};
use crate::rollup::stats::StationTallies;
use crate::rollup::types::{DailyAggregate, UnitOutcome};
use crate::store::{JSON, ObjectStore};

/// Builds the aggregate for `date` from the tallies of all of that date's snapshots.
pub fn aggregate_day(date: NaiveDate, tallies: &StationTallies) -> DailyAggregate {
    DailyAggregate::from_percent_full(date, tallies.percent_full())
}

/// Replaces the stored aggregate for the document's date.
pub async fn write_daily(
    store: &dyn ObjectStore,
    layout: &StoreLayout,
    aggregate: &DailyAggregate,
) -> Result<()> {
    let key = layout.daily_key(aggregate.date);
    let body = serde_json::to_vec(aggregate).map_err(|e| RollupError::encode(&key, e))?;
    store
        .put(&key, body, JSON)
        .await
        .map_err(|e| RollupError::persistence(&key, e))?;
    debug!(key, stations = aggregate.stations.len(), "Daily aggregate written");
    Ok(())
}

/// Reads the aggregate for `date`.
///
/// `Ok(None)` when no document exists. A document that does not decode is
/// skipped; a failing store is fatal.
pub async fn read_daily(
    store: &dyn ObjectStore,
    layout: &StoreLayout,
    date: NaiveDate,
) -> Result<Option<UnitOutcome<DailyAggregate>>> {
    let key = layout.daily_key(date);
    let Some(bytes) = store
        .get(&key)
        .await
        .map_err(|e| RollupError::upstream(format!("daily aggregate '{key}'"), e))?
    else {
        return Ok(None);
    };

    match serde_json::from_slice::<DailyAggregate>(&bytes) {
        Ok(aggregate) if aggregate.date == date => Ok(Some(UnitOutcome::Loaded(aggregate))),
        Ok(aggregate) => {
            warn!(key, found = %aggregate.date, "Daily aggregate date does not match its key");
            Ok(Some(UnitOutcome::Skipped {
                key,
                reason: format!("document is for {}", aggregate.date),
            }))
        }
        Err(e) => {
            warn!(key, error = %e, "Skipping undecodable daily aggregate");
            Ok(Some(UnitOutcome::Skipped {
                key,
                reason: e.to_string(),
            }))
        }
    }
}
