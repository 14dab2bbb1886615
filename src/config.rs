//! Runtime settings for the rollup job and the store key layout.

use std::time::Duration;

use chrono::NaiveDate;
use chrono_tz::Tz;

use crate::error::{Result, RollupError};

/// Tuning knobs for one rollup invocation.
#[derive(Debug, Clone)]
pub struct RollupSettings {
    /// Civil timezone used for partition dates and "today".
    pub timezone: Tz,
    /// Trailing window length in days.
    pub window_days: u32,
    /// Minimum age of the oldest snapshot, in days, before incremental mode is used.
    pub incremental_min_days: i64,
    /// Maximum number of snapshot downloads in flight.
    pub concurrency: usize,
    /// Upper bound for every single store call.
    pub io_timeout: Duration,
    /// Age after which an unreleased lock is treated as abandoned.
    pub lock_ttl: Duration,
}

impl Default for RollupSettings {
    fn default() -> Self {
        Self {
            timezone: chrono_tz::America::Chicago,
            window_days: 30,
            incremental_min_days: 3,
            concurrency: 8,
            io_timeout: Duration::from_secs(60),
            lock_ttl: Duration::from_secs(15 * 60),
        }
    }
}

impl RollupSettings {
    pub fn validate(&self) -> Result<()> {
        if self.window_days == 0 {
            return Err(RollupError::Config("window_days must be at least 1".into()));
        }
        if self.concurrency == 0 {
            return Err(RollupError::Config("concurrency must be at least 1".into()));
        }
        if self.incremental_min_days < 0 {
            return Err(RollupError::Config(
                "incremental_min_days cannot be negative".into(),
            ));
        }
        if self.io_timeout.is_zero() {
            return Err(RollupError::Config("io_timeout cannot be zero".into()));
        }
        // A zero TTL makes every held lock look abandoned.
        if self.lock_ttl.is_zero() {
            return Err(RollupError::Config("lock_ttl cannot be zero".into()));
        }
        Ok(())
    }

    /// Parses an IANA timezone name such as `America/Chicago`.
    pub fn parse_timezone(name: &str) -> Result<Tz> {
        name.parse::<Tz>()
            .map_err(|e| RollupError::Config(format!("unknown timezone '{name}': {e}")))
    }
}

/// Object keys used by the job. All keys are relative to the store root.
#[derive(Debug, Clone)]
pub struct StoreLayout {
    pub snapshots_prefix: String,
    pub daily_prefix: String,
    pub checkpoint_key: String,
    pub capacity_key: String,
    pub flows_key: String,
    pub artifact_key: String,
    pub lock_key: String,
}

impl Default for StoreLayout {
    fn default() -> Self {
        Self {
            snapshots_prefix: "snapshots/".into(),
            daily_prefix: "daily/".into(),
            checkpoint_key: "state/last_processed.txt".into(),
            capacity_key: "station_capacity.csv".into(),
            flows_key: "aggregated/station_flows.parquet".into(),
            artifact_key: "aggregated/live_dpi.json.gz".into(),
            lock_key: "locks/rollup.lock".into(),
        }
    }
}

impl StoreLayout {
    /// Key of the daily aggregate document for `date`.
    pub fn daily_key(&self, date: NaiveDate) -> String {
        format!("{}{}.json", self.daily_prefix, date.format("%Y-%m-%d"))
    }
}
