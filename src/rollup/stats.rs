//! The two percent-full formulas.
//!
//! [`StationTallies::percent_full`] counts every observation equally. [`mean_of_days`]
//! averages per-day fractions, so a day with few snapshots weighs as much as
//! a day with many. The two agree only when every day has the same number of
//! observations per station.

use std::collections::BTreeMap;

use crate::rollup::types::{DailyAggregate, PercentFull};
use crate::rollup::utility::mean;
use crate::snapshot::{Snapshot, StationStatus};

/// Count of observations and of "no free dock" observations for one station.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FullnessTally {
    pub observations: u64,
    pub full: u64,
}

impl FullnessTally {
    pub fn observe(&mut self, docks_available: u32) {
        self.observations += 1;
        if docks_available == 0 {
            self.full += 1;
        }
    }

    pub fn fraction(&self) -> Option<f64> {
        if self.observations == 0 {
            None
        } else {
            Some(self.full as f64 / self.observations as f64)
        }
    }
}

/// Running per-station tallies. Snapshots are folded in as they load and
/// can be dropped right after.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct StationTallies {
    stations: BTreeMap<String, FullnessTally>,
    /// Records without a dock count, plus records dropped while decoding.
    pub unusable_records: usize,
}

impl StationTallies {
    pub fn observe(&mut self, status: &StationStatus) {
        match status.num_docks_available {
            Some(docks) => self
                .stations
                .entry(status.station_id.clone())
                .or_default()
                .observe(docks),
            None => self.unusable_records += 1,
        }
    }

    pub fn add_snapshot(&mut self, snapshot: &Snapshot) {
        for status in &snapshot.stations {
            self.observe(status);
        }
        self.unusable_records += snapshot.malformed_records;
    }

    pub fn is_empty(&self) -> bool {
        self.stations.is_empty()
    }

    /// Fraction of observations with zero available docks, per station.
    pub fn percent_full(&self) -> PercentFull {
        self.stations
            .iter()
            .filter_map(|(id, t)| t.fraction().map(|f| (id.clone(), f)))
            .collect()
    }
}

/// Arithmetic mean of each station's daily fractions across the given days.
pub fn mean_of_days(days: &[DailyAggregate]) -> PercentFull {
    let mut series: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for day in days {
        for s in &day.stations {
            series.entry(&s.station_id).or_default().push(s.pct_full);
        }
    }
    series
        .into_iter()
        .map(|(id, values)| (id.to_string(), mean(&values)))
        .collect()
}
