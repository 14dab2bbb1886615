//! Station-status snapshots: storage keys, listing, and gzip JSON decoding.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Deserializer, Serialize};

/// One station's status as captured in a snapshot. Other feed fields are ignored.
///
/// `num_docks_available` is absent for virtual stations, which have no docks.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct StationStatus {
    #[serde(deserialize_with = "string_or_number")]
    pub station_id: String,
    #[serde(default)]
    pub num_docks_available: Option<u32>,
}

impl StationStatus {
    pub fn is_full(&self) -> bool {
        self.num_docks_available == Some(0)
    }
}

/// A decoded snapshot document.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub timestamp: DateTime<Utc>,
    pub stations: Vec<StationStatus>,
    /// Station objects dropped because they did not decode: no id, or a dock
    /// count that is not a non-negative integer.
    pub malformed_records: usize,
}

/// A snapshot as written by the scraper: station objects are kept verbatim.
#[derive(Debug, Serialize, Deserialize)]
pub struct RawSnapshot {
    pub timestamp: DateTime<Utc>,
    pub stations: Vec<serde_json::Value>,
}

/// Accepts identifiers encoded either as JSON strings or numbers.
pub(crate) fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Int(i64),
        Float(f64),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Text(s) => s,
        Id::Int(n) => n.to_string(),
        Id::Float(f) => f.to_string(),
    })
}

/// Decodes a gzip-compressed snapshot document.
///
/// Station objects are parsed one by one; a bad one is counted in
/// [`Snapshot::malformed_records`] instead of failing the document.
pub fn decode_snapshot(bytes: &[u8]) -> Result<Snapshot> {
    let mut json = Vec::new();
    GzDecoder::new(bytes)
        .read_to_end(&mut json)
        .context("snapshot is not valid gzip")?;
    let raw: RawSnapshot =
        serde_json::from_slice(&json).context("snapshot JSON does not match the expected shape")?;

    let mut stations = Vec::with_capacity(raw.stations.len());
    let mut malformed_records = 0;
    for value in raw.stations {
        match serde_json::from_value::<StationStatus>(value) {
            Ok(status) => stations.push(status),
            Err(_) => malformed_records += 1,
        }
    }

    Ok(Snapshot {
        timestamp: raw.timestamp,
        stations,
        malformed_records,
    })
}

/// Serializes and gzip-compresses any value as JSON.
pub fn encode_gzip_json(value: &impl Serialize) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    serde_json::to_writer(&mut encoder, value)?;
    encoder.flush()?;
    Ok(encoder.finish()?)
}

/// Location of one snapshot in the store, with the capture time encoded in its key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRef {
    pub key: String,
    /// Partition date in local civil time.
    pub date: NaiveDate,
    /// Local capture time converted to UTC.
    pub captured_at: DateTime<Utc>,
}

impl SnapshotRef {
    /// Parses keys shaped `<prefix>/YYYY/MM/DD/HHMMSS.json.gz`.
    ///
    /// Ambiguous local times (DST fall-back) resolve to the earlier instant;
    /// nonexistent local times (DST spring-forward) are rejected.
    pub fn parse(key: &str, tz: Tz) -> Result<Self> {
        let parts: Vec<&str> = key.rsplitn(5, '/').collect();
        let [file, day, month, year, ..] = parts.as_slice() else {
            return Err(anyhow!("key '{key}' has too few path segments"));
        };

        let stem = file
            .strip_suffix(".json.gz")
            .ok_or_else(|| anyhow!("key '{key}' is not a .json.gz object"))?;

        let date = NaiveDate::from_ymd_opt(year.parse()?, month.parse()?, day.parse()?)
            .ok_or_else(|| anyhow!("key '{key}' encodes an invalid date"))?;
        let time = NaiveTime::parse_from_str(stem, "%H%M%S")
            .with_context(|| format!("key '{key}' encodes an invalid time"))?;

        let captured_at = tz
            .from_local_datetime(&NaiveDateTime::new(date, time))
            .earliest()
            .ok_or_else(|| anyhow!("key '{key}' encodes a nonexistent local time"))?
            .with_timezone(&Utc);

        Ok(Self {
            key: key.to_string(),
            date,
            captured_at,
        })
    }

    /// Builds the key a snapshot captured at `at` is stored under.
    pub fn key_for(prefix: &str, at: DateTime<Utc>, tz: Tz) -> String {
        let local = at.with_timezone(&tz);
        format!(
            "{}{}/{}.json.gz",
            prefix,
            local.format("%Y/%m/%d"),
            local.format("%H%M%S")
        )
    }
}

/// Every parseable snapshot key in the store, sorted by capture time.
#[derive(Debug, Clone, Default)]
pub struct SnapshotListing {
    refs: Vec<SnapshotRef>,
    /// Keys that could not be parsed and were left out.
    pub rejected: Vec<String>,
}

impl SnapshotListing {
    pub fn from_keys<I, S>(keys: I, tz: Tz) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut listing = SnapshotListing::default();
        for key in keys {
            let key = key.as_ref();
            match SnapshotRef::parse(key, tz) {
                Ok(r) => listing.refs.push(r),
                Err(e) => {
                    tracing::warn!(key, error = %e, "Skipping unparseable snapshot key");
                    listing.rejected.push(key.to_string());
                }
            }
        }
        listing
            .refs
            .sort_by(|a, b| a.captured_at.cmp(&b.captured_at).then_with(|| a.key.cmp(&b.key)));
        listing
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.refs.len()
    }

    pub fn refs(&self) -> &[SnapshotRef] {
        &self.refs
    }

    pub fn earliest_date(&self) -> Option<NaiveDate> {
        self.refs.iter().map(|r| r.date).min()
    }

    /// Snapshots captured strictly after `checkpoint`, or all when there is none.
    pub fn newer_than(&self, checkpoint: Option<DateTime<Utc>>) -> impl Iterator<Item = &SnapshotRef> {
        self.refs
            .iter()
            .filter(move |r| checkpoint.is_none_or(|c| r.captured_at > c))
    }

    /// Snapshots whose partition date is on or after `since`.
    pub fn since(&self, since: NaiveDate) -> impl Iterator<Item = &SnapshotRef> {
        self.refs.iter().filter(move |r| r.date >= since)
    }

    /// All snapshots grouped by partition date.
    pub fn by_date(&self) -> BTreeMap<NaiveDate, Vec<&SnapshotRef>> {
        let mut groups: BTreeMap<NaiveDate, Vec<&SnapshotRef>> = BTreeMap::new();
        for r in &self.refs {
            groups.entry(r.date).or_default().push(r);
        }
        groups
    }
}
