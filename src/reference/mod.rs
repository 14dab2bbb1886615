//! Read-only reference tables: station capacity and historical trip flows.
//!
//! Both tables are produced out of band. Capacity rows carry two identifier
//! schemes ([`StationIds`]); flow rows are keyed by the legacy scheme.

pub mod capacity;
pub mod flows;

pub use capacity::{CapacityRow, CapacityTable, StationIds};
pub use flows::{FlowRow, FlowTable};

use tracing::info;

use crate::config::StoreLayout;
use crate::error::{Result, RollupError};
use crate::store::ObjectStore;

/// Both reference tables, loaded together for one rollup.
#[derive(Debug, Clone, Default)]
pub struct ReferenceTables {
    pub capacity: CapacityTable,
    pub flows: FlowTable,
}

impl ReferenceTables {
    /// Fetches and parses the capacity and flow tables.
    ///
    /// A missing or unreadable table is terminal for the invocation.
    #[tracing::instrument(skip_all, fields(capacity = %layout.capacity_key, flows = %layout.flows_key))]
    pub async fn load(store: &dyn ObjectStore, layout: &StoreLayout) -> Result<Self> {
        let capacity_bytes = fetch_required(store, &layout.capacity_key).await?;
        let capacity = CapacityTable::from_csv(&layout.capacity_key, capacity_bytes.as_slice())?;

        let flow_bytes = fetch_required(store, &layout.flows_key).await?;
        let flows = FlowTable::from_bytes(&layout.flows_key, flow_bytes)?;

        info!(
            capacity_rows = capacity.len(),
            flow_rows = flows.len(),
            "Reference tables loaded"
        );
        Ok(Self { capacity, flows })
    }
}

async fn fetch_required(store: &dyn ObjectStore, key: &str) -> Result<Vec<u8>> {
    store
        .get(key)
        .await
        .map_err(|e| RollupError::upstream(format!("reference table '{key}'"), e))?
        .ok_or_else(|| RollupError::MissingReference {
            key: key.to_string(),
        })
}
