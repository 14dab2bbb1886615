//! Historical trip flows per station (`station_id, starts, ends`).
//!
//! The table is normally Parquet; a CSV with the same columns is accepted
//! when the key ends in `.csv`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use arrow::array::{Array, ArrayRef, AsArray, Int64Array, StringArray};
use arrow::compute::cast;
use arrow::datatypes::{DataType, Field, Int64Type, Schema};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde::Deserialize;
use tracing::warn;

use crate::error::{Result, RollupError};
use crate::snapshot::string_or_number;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FlowRow {
    #[serde(deserialize_with = "string_or_number")]
    pub station_id: String,
    pub starts: i64,
    pub ends: i64,
}

impl FlowRow {
    pub fn net_inflow(&self) -> i64 {
        self.ends - self.starts
    }
}

#[derive(Debug, Clone, Default)]
pub struct FlowTable {
    rows: HashMap<String, FlowRow>,
    /// Rows dropped while parsing (null id or counts, duplicate id).
    pub skipped: usize,
}

impl FlowTable {
    pub fn new(rows: impl IntoIterator<Item = FlowRow>) -> Self {
        let mut table = FlowTable::default();
        for row in rows {
            table.insert(row);
        }
        table
    }

    fn insert(&mut self, row: FlowRow) {
        if self.rows.contains_key(&row.station_id) {
            warn!(station_id = %row.station_id, "Duplicate flow row, keeping the first");
            self.skipped += 1;
        } else {
            self.rows.insert(row.station_id.clone(), row);
        }
    }

    /// Decodes the table, choosing the format from the key's extension.
    pub fn from_bytes(key: &str, bytes: Vec<u8>) -> Result<Self> {
        if key.ends_with(".csv") {
            Self::from_csv(key, bytes.as_slice())
        } else {
            Self::from_parquet(key, Bytes::from(bytes))
        }
    }

    pub fn from_parquet(key: &str, bytes: Bytes) -> Result<Self> {
        let reader = ParquetRecordBatchReaderBuilder::try_new(bytes)
            .and_then(|b| b.build())
            .map_err(|e| RollupError::malformed(key, e))?;

        let mut table = FlowTable::default();
        for batch in reader {
            let batch = batch.map_err(|e| RollupError::malformed(key, e))?;
            table.extend_from_batch(key, &batch)?;
        }
        Ok(table)
    }

    fn extend_from_batch(&mut self, key: &str, batch: &RecordBatch) -> Result<()> {
        let column = |name: &str, to: &DataType| -> Result<ArrayRef> {
            let col = batch
                .column_by_name(name)
                .ok_or_else(|| RollupError::malformed(key, format!("missing column '{name}'")))?;
            cast(col, to).map_err(|e| RollupError::malformed(key, e))
        };

        let ids = column("station_id", &DataType::Utf8)?;
        let starts = column("starts", &DataType::Int64)?;
        let ends = column("ends", &DataType::Int64)?;

        let ids = ids.as_string::<i32>();
        let starts = starts.as_primitive::<Int64Type>();
        let ends = ends.as_primitive::<Int64Type>();

        for i in 0..batch.num_rows() {
            if ids.is_null(i) || starts.is_null(i) || ends.is_null(i) {
                self.skipped += 1;
                continue;
            }
            self.insert(FlowRow {
                station_id: ids.value(i).to_string(),
                starts: starts.value(i),
                ends: ends.value(i),
            });
        }
        Ok(())
    }

    pub fn from_csv(key: &str, reader: &[u8]) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let mut table = FlowTable::default();

        for result in rdr.deserialize::<FlowRow>() {
            match result {
                Ok(row) => table.insert(row),
                Err(e) => {
                    warn!(key, error = %e, "Skipping malformed flow row");
                    table.skipped += 1;
                }
            }
        }
        Ok(table)
    }

    /// Encodes the table as a single-row-group Parquet file, rows ordered by station id.
    pub fn to_parquet(&self) -> anyhow::Result<Vec<u8>> {
        let schema = Arc::new(Schema::new(vec![
            Field::new("station_id", DataType::Utf8, false),
            Field::new("starts", DataType::Int64, false),
            Field::new("ends", DataType::Int64, false),
        ]));

        let mut rows: Vec<&FlowRow> = self.rows.values().collect();
        rows.sort_by(|a, b| a.station_id.cmp(&b.station_id));

        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(StringArray::from_iter_values(
                    rows.iter().map(|r| r.station_id.as_str()),
                )) as ArrayRef,
                Arc::new(Int64Array::from_iter_values(rows.iter().map(|r| r.starts))),
                Arc::new(Int64Array::from_iter_values(rows.iter().map(|r| r.ends))),
            ],
        )?;

        let mut buf = Vec::new();
        let mut writer = ArrowWriter::try_new(&mut buf, schema, None)?;
        writer.write(&batch)?;
        writer.close()?;
        Ok(buf)
    }

    pub fn get(&self, station_id: &str) -> Option<&FlowRow> {
        self.rows.get(station_id)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// One trip from a trip-history CSV. Other columns are ignored.
#[derive(Debug, Deserialize)]
pub struct TripRecord {
    #[serde(default)]
    pub start_station_id: Option<String>,
    #[serde(default)]
    pub end_station_id: Option<String>,
}

/// Counts trip starts and ends per station. A station seen only as an
/// origin gets `ends = 0`, and vice versa.
pub fn count_flows(trips: impl IntoIterator<Item = TripRecord>) -> FlowTable {
    let mut counts: BTreeMap<String, (i64, i64)> = BTreeMap::new();
    for trip in trips {
        if let Some(id) = trip.start_station_id.filter(|s| !s.is_empty()) {
            counts.entry(id).or_default().0 += 1;
        }
        if let Some(id) = trip.end_station_id.filter(|s| !s.is_empty()) {
            counts.entry(id).or_default().1 += 1;
        }
    }

    FlowTable::new(
        counts
            .into_iter()
            .map(|(station_id, (starts, ends))| FlowRow {
                station_id,
                starts,
                ends,
            }),
    )
}
