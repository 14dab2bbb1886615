//! Trailing-window average over stored daily aggregates.

use chrono::{Days, NaiveDate};
use tracing::debug;

use crate::config::StoreLayout;
use crate::error::Result;
use crate::rollup::daily::read_daily;
use crate::rollup::stats::mean_of_days;
use crate::rollup::types::{DailyAggregate, PercentFull, UnitOutcome};
use crate::store::ObjectStore;

/// The `days` calendar dates ending at `today`, oldest first.
pub fn window_dates(today: NaiveDate, days: u32) -> Vec<NaiveDate> {
    (0..days)
        .rev()
        .filter_map(|back| today.checked_sub_days(Days::new(u64::from(back))))
        .collect()
}

#[derive(Debug, Default)]
pub struct WindowReport {
    pub percent_full: PercentFull,
    pub days_loaded: usize,
    pub days_skipped: usize,
}

/// Averages each station's daily fraction over the window ending `today`.
///
/// Missing dates are skipped. `None` when no aggregate exists anywhere in the
/// window.
#[tracing::instrument(skip(store, layout))]
pub async fn window_percent_full(
    store: &dyn ObjectStore,
    layout: &StoreLayout,
    today: NaiveDate,
    days: u32,
) -> Result<Option<WindowReport>> {
    let mut loaded: Vec<DailyAggregate> = Vec::new();
    let mut skipped = 0;

    for date in window_dates(today, days) {
        match read_daily(store, layout, date).await? {
            Some(UnitOutcome::Loaded(day)) => loaded.push(day),
            Some(UnitOutcome::Skipped { .. }) => skipped += 1,
            None => debug!(date = %date, "No daily aggregate for date"),
        }
    }

    if loaded.is_empty() {
        return Ok(None);
    }

    Ok(Some(WindowReport {
        percent_full: mean_of_days(&loaded),
        days_loaded: loaded.len(),
        days_skipped: skipped,
    }))
}
