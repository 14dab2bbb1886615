//! Joins percent-full values with capacity and flow tables into ranked DPI rows.

use std::collections::HashSet;

use tracing::debug;

use crate::reference::ReferenceTables;
use crate::rollup::types::{DpiRow, JoinDrops, PercentFull};
use crate::rollup::utility::round3;

#[derive(Debug, Default)]
pub struct JoinResult {
    pub rows: Vec<DpiRow>,
    pub drops: JoinDrops,
}

/// Inner join of the three sources, walking capacity rows:
/// `capacity.current == percent_full.station_id` and
/// `capacity.legacy (or current) == flow.station_id`.
///
/// Stations with zero or blank capacity are dropped. Rows come back sorted by
/// `dpi` descending, then `station_id` ascending.
pub fn join_dpi(percent_full: &PercentFull, tables: &ReferenceTables) -> JoinResult {
    let mut result = JoinResult::default();
    let mut matched: HashSet<&str> = HashSet::new();

    for row in tables.capacity.rows() {
        let current = row.ids.current.as_str();
        if percent_full.contains_key(current) {
            matched.insert(current);
        }

        let capacity = match row.capacity {
            Some(c) if c > 0 => c,
            _ => {
                debug!(station_id = current, "Dropping station without usable capacity");
                result.drops.unusable_capacity += 1;
                continue;
            }
        };

        let Some(&pct_full) = percent_full.get(current) else {
            result.drops.missing_percent_full += 1;
            continue;
        };

        let Some(flow) = tables.flows.get(row.ids.flow_key()) else {
            debug!(station_id = current, flow_key = row.ids.flow_key(), "No flow row for station");
            result.drops.missing_flow += 1;
            continue;
        };

        let overflow_per_dock = flow.net_inflow() as f64 / f64::from(capacity);
        result.rows.push(DpiRow {
            station_id: current.to_string(),
            station_name: row.name.clone(),
            overflow_per_dock: round3(overflow_per_dock),
            pct_full: round3(pct_full),
            dpi: round3(overflow_per_dock * pct_full),
        });
    }

    result.drops.missing_capacity = percent_full
        .keys()
        .filter(|id| !matched.contains(id.as_str()))
        .count();

    result.rows.sort_by(|a, b| {
        b.dpi
            .total_cmp(&a.dpi)
            .then_with(|| a.station_id.cmp(&b.station_id))
    });
    result
}
