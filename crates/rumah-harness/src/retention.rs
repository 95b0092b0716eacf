//! Raw-document retention.
//!
//! Raw payloads are kept for lineage and debugging, then purged after
//! `retention.raw_document_days` (or `--older-than-days`). Lineage rows keep
//! the purged document's id for audit.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tracing::info;

use rumah_harness_core::store::ListingStore;

use crate::config::Config;
use crate::db;
use crate::sqlite_store::SqliteStore;

/// Cutoff for documents older than `days` before `now`.
pub fn cutoff(now: DateTime<Utc>, days: u32) -> DateTime<Utc> {
    now - Duration::days(i64::from(days))
}

/// Purge raw documents older than `days`. Returns the number deleted.
pub async fn purge(store: &dyn ListingStore, days: u32) -> Result<u64> {
    let older_than = cutoff(Utc::now(), days);
    let deleted = store.purge_raw_documents(older_than).await?;
    info!(deleted, days, "raw documents purged");
    Ok(deleted)
}

/// CLI entry point. `days` overrides the configured retention.
pub async fn run_purge(config: &Config, days: Option<u32>) -> Result<()> {
    let days = days.unwrap_or(config.retention.raw_document_days);
    let pool = db::connect(config).await?;
    let store = SqliteStore::new(pool.clone());
    let result = purge(&store, days).await;
    pool.close().await;
    println!("Purged {} raw documents older than {} days.", result?, days);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumah_harness_core::models::RawDocument;
    use rumah_harness_core::store::memory::InMemoryStore;

    fn doc(id: &str, age_days: i64) -> RawDocument {
        RawDocument {
            id: id.to_string(),
            source_id: "rumah123".to_string(),
            fetched_at: Utc::now() - Duration::days(age_days),
            url_or_query: "https://www.rumah123.com/jual/bali/rumah/?page=1".to_string(),
            content: "<html></html>".to_string(),
            http_status: 200,
        }
    }

    #[test]
    fn cutoff_subtracts_days() {
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        assert_eq!(cutoff(now, 30).timestamp(), 1_700_000_000 - 30 * 86_400);
    }

    #[tokio::test]
    async fn purges_only_old_documents() {
        let store = InMemoryStore::new();
        store.put_raw_document(&doc("old", 45)).await.unwrap();
        store.put_raw_document(&doc("fresh", 2)).await.unwrap();

        assert_eq!(purge(&store, 30).await.unwrap(), 1);
        assert_eq!(store.raw_document_count().unwrap(), 1);
    }
}
