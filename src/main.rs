//! CLI entry point for the dock-pressure tool.
//!
//! Each subcommand is one unit of work meant to be triggered by an external
//! scheduler: scraping a snapshot, running the rollup, refreshing the
//! reference tables, or printing the published artifact.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use dock_pressure::config::{RollupSettings, StoreLayout};
use dock_pressure::error::RollupError;
use dock_pressure::fetch::BasicClient;
use dock_pressure::gbfs::{
    DEFAULT_INFORMATION_URL, DEFAULT_STATUS_URL, export_capacity, scrape_station_status,
};
use dock_pressure::reference::flows::{TripRecord, count_flows};
use dock_pressure::rollup::{RollupJob, RollupOutcome, read_artifact};
use dock_pressure::store::{LocalStore, ObjectStore, PARQUET, S3Store, TimeoutStore};
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "dock_pressure")]
#[command(about = "Ranks bike-share stations by demand pressure", long_about = None)]
struct Cli {
    #[command(flatten)]
    backend: BackendArgs,

    #[command(flatten)]
    tuning: TuningArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct BackendArgs {
    /// S3 bucket holding snapshots, reference tables and outputs
    #[arg(long, global = true, env = "DPI_BUCKET", conflicts_with = "local_root")]
    bucket: Option<String>,

    /// Local directory used instead of a bucket
    #[arg(long, global = true, env = "DPI_LOCAL_ROOT")]
    local_root: Option<PathBuf>,
}

#[derive(Args)]
struct TuningArgs {
    /// IANA timezone used for partition dates
    #[arg(long, global = true, env = "DPI_TIMEZONE", default_value = "America/Chicago")]
    timezone: String,

    /// Trailing window length in days
    #[arg(long, global = true, env = "DPI_WINDOW_DAYS", default_value_t = 30)]
    window_days: u32,

    /// Days of history required before incremental mode is used
    #[arg(long, global = true, env = "DPI_INCREMENTAL_MIN_DAYS", default_value_t = 3)]
    incremental_min_days: i64,

    /// Maximum number of concurrent snapshot downloads
    #[arg(long, global = true, env = "DPI_CONCURRENCY", default_value_t = 8)]
    concurrency: usize,

    /// Timeout for each storage and HTTP call, in seconds
    #[arg(long, global = true, env = "DPI_IO_TIMEOUT_SECS", default_value_t = 60)]
    io_timeout_secs: u64,

    /// Age in seconds after which an unreleased rollup lock is replaced
    #[arg(long, global = true, env = "DPI_LOCK_TTL_SECS", default_value_t = 900)]
    lock_ttl_secs: u64,
}

impl TuningArgs {
    fn settings(&self) -> Result<RollupSettings> {
        let settings = RollupSettings {
            timezone: RollupSettings::parse_timezone(&self.timezone)?,
            window_days: self.window_days,
            incremental_min_days: self.incremental_min_days,
            concurrency: self.concurrency,
            io_timeout: Duration::from_secs(self.io_timeout_secs),
            lock_ttl: Duration::from_secs(self.lock_ttl_secs),
        };
        settings.validate()?;
        Ok(settings)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Roll up snapshots and publish the ranked DPI artifact
    Rollup {
        /// Run as of this RFC 3339 instant instead of now
        #[arg(long)]
        as_of: Option<DateTime<Utc>>,
    },
    /// Capture one station-status snapshot
    Scrape {
        #[arg(long, env = "DPI_STATUS_URL", default_value = DEFAULT_STATUS_URL)]
        url: String,
    },
    /// Refresh the station capacity table from station information
    ExportCapacity {
        #[arg(long, env = "DPI_INFORMATION_URL", default_value = DEFAULT_INFORMATION_URL)]
        url: String,
    },
    /// Build the historical flow table from a directory of trip CSVs
    BuildFlows {
        #[arg(value_name = "TRIPS_DIR")]
        trips_dir: PathBuf,
    },
    /// Print the published artifact as JSON
    Latest,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/dock_pressure.log".to_string());
    let _log_guard = init_tracing(Path::new(&log_file_path))?;

    let cli = Cli::parse();
    let settings = cli.tuning.settings()?;
    let layout = StoreLayout::default();
    let store = open_store(&cli.backend, settings.io_timeout).await?;

    match cli.command {
        Commands::Rollup { as_of } => {
            let now = as_of.unwrap_or_else(Utc::now);
            let job = RollupJob::new(store, layout, settings)?;
            match job.run(now).await {
                Ok(RollupOutcome::Published(summary)) => {
                    info!(rows = summary.rows, "Rollup finished");
                }
                Ok(RollupOutcome::NoData(reason)) => {
                    info!(%reason, "Rollup finished without publishing");
                }
                Err(e @ RollupError::LockHeld { .. }) => {
                    warn!(error = %e, "Another rollup is running");
                    return Err(e.into());
                }
                Err(e) => {
                    error!(error = %e, timeout = e.is_timeout(), "Rollup failed");
                    return Err(e.into());
                }
            }
        }
        Commands::Scrape { url } => {
            let client = BasicClient::new(settings.io_timeout)?;
            scrape_station_status(
                &client,
                store.as_ref(),
                &url,
                &layout.snapshots_prefix,
                Utc::now(),
                settings.timezone,
            )
            .await?;
        }
        Commands::ExportCapacity { url } => {
            let client = BasicClient::new(settings.io_timeout)?;
            export_capacity(&client, store.as_ref(), &url, &layout.capacity_key).await?;
        }
        Commands::BuildFlows { trips_dir } => {
            build_flows(store.as_ref(), &trips_dir, &layout.flows_key).await?;
        }
        Commands::Latest => {
            let rows = read_artifact(store.as_ref(), &layout.artifact_key)
                .await?
                .with_context(|| format!("no artifact at '{}'", layout.artifact_key))?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
    }

    Ok(())
}

/// Colored stderr output plus a JSON log file rolled daily at `log_file_path`.
///
/// Keep the returned guard alive until exit so buffered file lines are flushed.
fn init_tracing(log_file_path: &Path) -> Result<WorkerGuard> {
    let log_dir = log_file_path.parent().unwrap_or(Path::new("logs"));
    let log_file_name = log_file_path
        .file_name()
        .unwrap_or(OsStr::new("dock_pressure.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();
    Ok(guard)
}

/// Opens the configured backend, bounded by `timeout` per call.
async fn open_store(backend: &BackendArgs, timeout: Duration) -> Result<Arc<dyn ObjectStore>> {
    let store: Arc<dyn ObjectStore> = match (&backend.bucket, &backend.local_root) {
        (Some(bucket), _) => {
            info!(bucket = %bucket, "Using S3 backend");
            Arc::new(TimeoutStore::new(S3Store::from_env(bucket.clone()).await, timeout))
        }
        (None, Some(root)) => {
            info!(root = %root.display(), "Using local backend");
            Arc::new(TimeoutStore::new(LocalStore::new(root.clone()), timeout))
        }
        (None, None) => bail!("set --bucket (DPI_BUCKET) or --local-root (DPI_LOCAL_ROOT)"),
    };
    Ok(store)
}

/// Counts starts and ends over every `*.csv` in `trips_dir` and writes the flow table.
#[tracing::instrument(skip(store))]
async fn build_flows(store: &dyn ObjectStore, trips_dir: &Path, key: &str) -> Result<()> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(trips_dir)
        .with_context(|| format!("cannot read {}", trips_dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.extension() == Some(OsStr::new("csv")))
        .collect();
    files.sort();

    if files.is_empty() {
        bail!("no CSV files found in {}", trips_dir.display());
    }

    let mut trips = Vec::new();
    for path in &files {
        let mut rdr = csv::Reader::from_path(path)
            .with_context(|| format!("cannot open {}", path.display()))?;
        let before = trips.len();
        for record in rdr.deserialize::<TripRecord>() {
            match record {
                Ok(trip) => trips.push(trip),
                Err(e) => warn!(file = %path.display(), error = %e, "Skipping malformed trip row"),
            }
        }
        info!(file = %path.display(), trips = trips.len() - before, "Trip file read");
    }

    let table = count_flows(trips);
    store.put(key, table.to_parquet()?, PARQUET).await?;
    info!(key, stations = table.len(), files = files.len(), "Flow table written");
    Ok(())
}
