//! GBFS feed collectors: the snapshot scraper and the capacity table export.
//!
//! Both read the standard GBFS envelope, `{"data": {"stations": [...]}}`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{info, warn};

use crate::fetch::{HttpClient, fetch_bytes};
use crate::reference::{CapacityRow, CapacityTable, StationIds};
use crate::snapshot::{RawSnapshot, SnapshotRef, encode_gzip_json, string_or_number};
use crate::store::{CSV, JSON, ObjectStore};

pub const DEFAULT_STATUS_URL: &str = "https://gbfs.divvybikes.com/gbfs/en/station_status.json";
pub const DEFAULT_INFORMATION_URL: &str =
    "https://gbfs.divvybikes.com/gbfs/en/station_information.json";

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: StationList<T>,
}

#[derive(Debug, Deserialize)]
struct StationList<T> {
    stations: Vec<T>,
}

fn parse_stations<T: DeserializeOwned>(bytes: &[u8]) -> Result<Vec<T>> {
    let envelope: Envelope<T> =
        serde_json::from_slice(bytes).context("response is not a GBFS station list")?;
    Ok(envelope.data.stations)
}

/// Station objects of a `station_status.json` response, kept verbatim.
pub fn parse_station_status(bytes: &[u8]) -> Result<Vec<Value>> {
    parse_stations(bytes)
}

/// One entry of `station_information.json`.
#[derive(Debug, Deserialize)]
pub struct StationInformation {
    #[serde(deserialize_with = "string_or_number")]
    pub station_id: String,
    #[serde(default)]
    pub legacy_id: Option<Value>,
    #[serde(default)]
    pub short_name: Option<Value>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lon: Option<f64>,
    #[serde(default)]
    pub capacity: Option<u32>,
}

impl StationInformation {
    /// Historical trip data uses `legacy_id` where the feed has one, else `short_name`.
    fn legacy(&self) -> Option<String> {
        self.legacy_id
            .as_ref()
            .or(self.short_name.as_ref())
            .and_then(id_text)
    }
}

fn id_text(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Builds the capacity table from a `station_information.json` response.
pub fn capacity_from_information(bytes: &[u8]) -> Result<CapacityTable> {
    let stations: Vec<StationInformation> = parse_stations(bytes)?;
    let rows = stations
        .into_iter()
        .map(|s| {
            if s.capacity.is_none() {
                warn!(station_id = %s.station_id, "Station has no capacity");
            }
            CapacityRow {
                ids: StationIds::new(s.station_id.clone(), s.legacy()),
                name: s.name,
                lat: s.lat,
                lon: s.lon,
                capacity: s.capacity,
            }
        })
        .collect();
    Ok(CapacityTable::new(rows))
}

/// Writes one snapshot of `stations` captured at `at`. Returns its key.
pub async fn store_snapshot(
    store: &dyn ObjectStore,
    prefix: &str,
    stations: Vec<Value>,
    at: DateTime<Utc>,
    tz: Tz,
) -> Result<String> {
    let key = SnapshotRef::key_for(prefix, at, tz);
    let body = encode_gzip_json(&RawSnapshot {
        timestamp: at,
        stations,
    })?;
    store.put(&key, body, JSON).await?;
    Ok(key)
}

/// Fetches station status once and stores it as a snapshot.
#[tracing::instrument(skip(client, store))]
pub async fn scrape_station_status(
    client: &dyn HttpClient,
    store: &dyn ObjectStore,
    url: &str,
    prefix: &str,
    now: DateTime<Utc>,
    tz: Tz,
) -> Result<String> {
    let bytes = fetch_bytes(client, url).await?;
    let stations = parse_station_status(&bytes)?;
    let count = stations.len();

    let key = store_snapshot(store, prefix, stations, now, tz).await?;
    info!(key = %key, stations = count, "Snapshot saved");
    Ok(key)
}

/// Fetches station information and replaces the capacity table.
#[tracing::instrument(skip(client, store))]
pub async fn export_capacity(
    client: &dyn HttpClient,
    store: &dyn ObjectStore,
    url: &str,
    key: &str,
) -> Result<usize> {
    let bytes = fetch_bytes(client, url).await?;
    let table = capacity_from_information(&bytes)?;

    store.put(key, table.to_csv()?, CSV).await?;
    info!(key, stations = table.len(), "Capacity table exported");
    Ok(table.len())
}
