//! The demand-pressure rollup.
//!
//! A run turns raw station-status snapshots into a ranked list of stations by
//! demand-pressure index (DPI):
//!
//! ```text
//! overflow_per_dock = (ends - starts) / capacity
//! dpi               = overflow_per_dock * pct_full
//! ```
//!
//! `pct_full` is estimated from the snapshots of the trailing window, either
//! through stored daily aggregates ([`Mode::Incremental`]) or straight from the
//! raw snapshots ([`Mode::Full`]). See [`job::RollupJob::run`].

pub mod checkpoint;
pub mod daily;
pub mod estimator;
pub mod full;
pub mod ingest;
pub mod job;
pub mod join;
pub mod loader;
pub mod lock;
pub mod mode;
pub mod publish;
pub mod stats;
pub mod types;
pub mod utility;
pub mod window;

pub use job::RollupJob;
pub use publish::read_artifact;
pub use types::{DpiRow, Mode, NoDataReason, RollupOutcome, RunSummary, Strategy};
