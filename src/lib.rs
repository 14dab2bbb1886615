//! Demand-pressure rollup for bike-share docking stations.
//!
//! Raw GBFS station-status snapshots are rolled up into a trailing-window
//! "percent of time full" per station, joined with capacity and historical
//! trip flows, and published as a ranked JSON artifact.

pub mod config;
pub mod error;
pub mod fetch;
pub mod gbfs;
pub mod reference;
pub mod rollup;
pub mod snapshot;
pub mod store;
