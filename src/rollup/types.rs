//! Data types used by the rollup pipeline.

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Fraction of observations in which each station had zero free docks, keyed by current station id.
pub type PercentFull = BTreeMap<String, f64>;

/// Result of one unit of work (one snapshot, one daily document) that is
/// allowed to fail without failing the run. Fatal problems are `Err` instead.
#[derive(Debug)]
pub enum UnitOutcome<T> {
    Loaded(T),
    Skipped { key: String, reason: String },
}

/// Per-station row of a daily aggregate document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationFullness {
    pub station_id: String,
    pub pct_full: f64,
}

/// Summary of one civil day's snapshots, stored at `daily/YYYY-MM-DD.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyAggregate {
    pub date: NaiveDate,
    pub stations: Vec<StationFullness>,
}

impl DailyAggregate {
    pub fn from_percent_full(date: NaiveDate, pct: PercentFull) -> Self {
        Self {
            date,
            stations: pct
                .into_iter()
                .map(|(station_id, pct_full)| StationFullness {
                    station_id,
                    pct_full,
                })
                .collect(),
        }
    }

    pub fn get(&self, station_id: &str) -> Option<f64> {
        self.stations
            .iter()
            .find(|s| s.station_id == station_id)
            .map(|s| s.pct_full)
    }
}

/// One ranked station in the published artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DpiRow {
    pub station_id: String,
    pub station_name: String,
    pub overflow_per_dock: f64,
    pub pct_full: f64,
    pub dpi: f64,
}

/// Aggregation mode chosen for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Update daily aggregates from new snapshots, then average the window of days.
    Incremental,
    /// Recompute directly from every raw snapshot in the window.
    Full,
}

/// Named percent-full estimation strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Mean of per-day fractions across the window.
    DayGrouped,
    /// One fraction over every observation in the window.
    FlatWindow,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::DayGrouped => f.write_str("day_grouped"),
            Strategy::FlatWindow => f.write_str("flat_window"),
        }
    }
}

/// Why a run finished without publishing anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoDataReason {
    NoSnapshots,
    EmptyWindow,
    EmptyJoin,
}

impl fmt::Display for NoDataReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NoDataReason::NoSnapshots => f.write_str("no snapshots in the store"),
            NoDataReason::EmptyWindow => f.write_str("no observations in the trailing window"),
            NoDataReason::EmptyJoin => f.write_str("no station matched all reference tables"),
        }
    }
}

/// Counters describing a successful publish.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub mode: Mode,
    pub strategy: Strategy,
    pub rows: usize,
    pub top_station: Option<(String, f64)>,
    pub snapshots_loaded: usize,
    pub snapshots_skipped: usize,
    /// Station records left out of the tallies: no dock count, or undecodable.
    pub unusable_records: usize,
    pub keys_rejected: usize,
    pub days_written: usize,
    pub join: JoinDrops,
    pub artifact_bytes: usize,
}

/// Stations dropped by the inner join, per reason.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JoinDrops {
    pub unusable_capacity: usize,
    pub missing_percent_full: usize,
    pub missing_flow: usize,
    /// Percent-full stations that have no capacity row at all.
    pub missing_capacity: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RollupOutcome {
    Published(RunSummary),
    NoData(NoDataReason),
}
