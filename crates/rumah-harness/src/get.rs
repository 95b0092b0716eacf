//! Listing retrieval by ID.
//!
//! Fetches a stored listing with its price history, lineage, and the
//! facility counts of its district. Used by the `rumah get` CLI command,
//! which prints the result as JSON.

use anyhow::{bail, Result};
use serde::Serialize;

use rumah_harness_core::models::{FacilityCounts, LineageEntry, ListingRecord};
use rumah_harness_core::store::ListingStore;

use crate::config::Config;
use crate::db;
use crate::sqlite_store::SqliteStore;

#[derive(Debug, Clone, Serialize)]
pub struct ListingResponse {
    #[serde(flatten)]
    pub record: ListingRecord,
    pub lineage: Vec<LineageEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub facilities: Option<FacilityCounts>,
}

/// Look up a listing in any store.
pub async fn get_listing(store: &dyn ListingStore, id: &str) -> Result<ListingResponse> {
    let Some(record) = store.get_listing(id).await? else {
        bail!("listing not found: {}", id);
    };
    let lineage = store.lineage(id).await?;
    let facilities = match &record.current.location.district {
        Some(district) => store.facilities(district).await?,
        None => None,
    };
    Ok(ListingResponse {
        record,
        lineage,
        facilities,
    })
}

/// CLI entry point: print the listing as pretty JSON.
pub async fn run_get(config: &Config, id: &str) -> Result<()> {
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());
    let result = get_listing(&store, id).await;
    pool.close().await;
    println!("{}", serde_json::to_string_pretty(&result?)?);
    Ok(())
}
