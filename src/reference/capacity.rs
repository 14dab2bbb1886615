//! Station capacity and metadata table (`station_id,legacy_id,name,lat,lon,capacity`).

use std::collections::HashSet;
use std::io::Read;

use csv::WriterBuilder;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, RollupError};

/// The two identifier schemes a physical station is known by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StationIds {
    /// Identifier used by the live status feed.
    pub current: String,
    /// Identifier used by historical trip data, when it differs.
    pub legacy: Option<String>,
}

impl StationIds {
    pub fn new(current: impl Into<String>, legacy: Option<String>) -> Self {
        Self {
            current: current.into(),
            legacy: legacy.filter(|l| !l.trim().is_empty()),
        }
    }

    /// Key used to look the station up in the flow table. Falls back to the
    /// current id for stations without a separate legacy id.
    pub fn flow_key(&self) -> &str {
        self.legacy.as_deref().unwrap_or(&self.current)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CapacityRow {
    pub ids: StationIds,
    pub name: String,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    /// Dock count. `None` when the source left it blank.
    pub capacity: Option<u32>,
}

/// CSV shape of a capacity row.
///
/// Older exports carry the legacy id in a `short_name` column. Both are read;
/// a non-blank `legacy_id` wins. Only `legacy_id` is written.
#[derive(Debug, Deserialize, Serialize)]
pub struct CapacityRecord {
    pub station_id: String,
    #[serde(default)]
    pub legacy_id: Option<String>,
    #[serde(default, skip_serializing)]
    pub short_name: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lon: Option<f64>,
    #[serde(default)]
    pub capacity: Option<u32>,
}

impl From<CapacityRecord> for CapacityRow {
    fn from(r: CapacityRecord) -> Self {
        let legacy = r.legacy_id.filter(|l| !l.is_empty()).or(r.short_name);
        Self {
            ids: StationIds::new(r.station_id, legacy),
            name: r.name,
            lat: r.lat,
            lon: r.lon,
            capacity: r.capacity,
        }
    }
}

impl From<&CapacityRow> for CapacityRecord {
    fn from(r: &CapacityRow) -> Self {
        Self {
            station_id: r.ids.current.clone(),
            legacy_id: r.ids.legacy.clone(),
            short_name: None,
            name: r.name.clone(),
            lat: r.lat,
            lon: r.lon,
            capacity: r.capacity,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CapacityTable {
    rows: Vec<CapacityRow>,
    /// Rows dropped while parsing (malformed or duplicate current id).
    pub skipped: usize,
}

impl CapacityTable {
    pub fn new(rows: Vec<CapacityRow>) -> Self {
        Self { rows, skipped: 0 }
    }

    /// Parses the capacity CSV. Individual malformed rows are skipped; a
    /// missing `station_id` header makes the whole table malformed.
    pub fn from_csv<R: Read>(key: &str, reader: R) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);

        let headers = rdr.headers().map_err(|e| RollupError::malformed(key, e))?;
        if !headers.iter().any(|h| h == "station_id") {
            return Err(RollupError::malformed(key, "missing column 'station_id'"));
        }

        let mut table = CapacityTable::default();
        let mut seen = HashSet::new();

        for (line, result) in rdr.deserialize::<CapacityRecord>().enumerate() {
            match result {
                Ok(record) => {
                    let row = CapacityRow::from(record);
                    if seen.insert(row.ids.current.clone()) {
                        table.rows.push(row);
                    } else {
                        warn!(key, station_id = %row.ids.current, "Duplicate capacity row, keeping the first");
                        table.skipped += 1;
                    }
                }
                Err(e) => {
                    warn!(key, row = line + 1, error = %e, "Skipping malformed capacity row");
                    table.skipped += 1;
                }
            }
        }

        Ok(table)
    }

    /// Serializes the table back into the CSV shape it is read from.
    pub fn to_csv(&self) -> anyhow::Result<Vec<u8>> {
        let mut writer = WriterBuilder::new().has_headers(true).from_writer(Vec::new());
        for row in &self.rows {
            writer.serialize(CapacityRecord::from(row))?;
        }
        writer.flush()?;
        Ok(writer.into_inner().map_err(|e| anyhow::anyhow!("{e}"))?)
    }

    pub fn rows(&self) -> &[CapacityRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_key_prefers_legacy() {
        let ids = StationIds::new("S1", Some("L1".to_string()));
        assert_eq!(ids.flow_key(), "L1");

        let ids = StationIds::new("S1", None);
        assert_eq!(ids.flow_key(), "S1");

        let ids = StationIds::new("S1", Some("  ".to_string()));
        assert_eq!(ids.flow_key(), "S1");
    }

    #[test]
    fn test_from_csv_with_legacy_column() {
        let csv = "station_id,legacy_id,name,lat,lon,capacity\n\
                   S1,L1,Clark & Lake,41.88,-87.63,10\n\
                   S2,,Wells & Huron,41.89,-87.63,\n";
        let table = CapacityTable::from_csv("cap.csv", csv.as_bytes()).unwrap();

        assert_eq!(table.len(), 2);
        let s1 = &table.rows()[0];
        assert_eq!(s1.ids.flow_key(), "L1");
        assert_eq!(s1.capacity, Some(10));
        assert_eq!(s1.name, "Clark & Lake");

        let s2 = &table.rows()[1];
        assert_eq!(s2.ids.legacy, None);
        assert_eq!(s2.capacity, None);
    }

    #[test]
    fn test_from_csv_without_legacy_column() {
        let csv = "station_id,name,lat,lon,capacity\nS1,A,1.0,2.0,7\n";
        let table = CapacityTable::from_csv("cap.csv", csv.as_bytes()).unwrap();
        assert_eq!(table.rows()[0].ids, StationIds::new("S1", None));
    }

    #[test]
    fn test_from_csv_accepts_short_name_column() {
        let csv = "station_id,short_name,name,lat,lon,capacity\nS1,13022,A,1.0,2.0,7\n";
        let table = CapacityTable::from_csv("cap.csv", csv.as_bytes()).unwrap();
        assert_eq!(table.rows()[0].ids.flow_key(), "13022");
    }

    #[test]
    fn test_from_csv_prefers_legacy_id_over_short_name() {
        let csv = "station_id,legacy_id,short_name,name,lat,lon,capacity\n\
                   S1,13022,TA1,A,1.0,2.0,7\n\
                   S2,,TA2,B,1.0,2.0,5\n\
                   S3,,,C,1.0,2.0,3\n";
        let table = CapacityTable::from_csv("cap.csv", csv.as_bytes()).unwrap();

        assert_eq!(table.skipped, 0);
        let keys: Vec<_> = table.rows().iter().map(|r| r.ids.flow_key()).collect();
        assert_eq!(keys, vec!["13022", "TA2", "S3"]);
    }

    #[test]
    fn test_from_csv_skips_bad_and_duplicate_rows() {
        let csv = "station_id,name,lat,lon,capacity\n\
                   S1,A,1.0,2.0,seven\n\
                   S2,B,1.0,2.0,5\n\
                   S2,B again,1.0,2.0,9\n";
        let table = CapacityTable::from_csv("cap.csv", csv.as_bytes()).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.skipped, 2);
        assert_eq!(table.rows()[0].capacity, Some(5));
    }

    #[test]
    fn test_from_csv_requires_station_id_header() {
        let csv = "id,name,capacity\nS1,A,3\n";
        assert!(matches!(
            CapacityTable::from_csv("cap.csv", csv.as_bytes()),
            Err(RollupError::MalformedReference { .. })
        ));
    }

    #[test]
    fn test_to_csv_roundtrips_through_reader() {
        let table = CapacityTable::new(vec![CapacityRow {
            ids: StationIds::new("S1", Some("L1".to_string())),
            name: "Clark & Lake".to_string(),
            lat: Some(41.88),
            lon: Some(-87.63),
            capacity: Some(10),
        }]);
        let bytes = table.to_csv().unwrap();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.starts_with("station_id,legacy_id,name,lat,lon,capacity"));

        let back = CapacityTable::from_csv("cap.csv", bytes.as_slice()).unwrap();
        assert_eq!(back.rows(), table.rows());
    }
}
