//! Database statistics and health overview.
//!
//! Summarizes what has been ingested: listing, price-history, and
//! raw-document counts per source, plus when each source was last fetched
//! and how many districts carry facility counts.
//! Used by `rumah stats` to confirm that scheduled runs are landing.

use std::collections::BTreeMap;

use anyhow::Result;
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SourceStats {
    pub source: String,
    pub listings: i64,
    pub price_changes: i64,
    pub raw_documents: i64,
    /// Epoch milliseconds of the newest raw document.
    pub last_fetched_ms: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Stats {
    pub listings: i64,
    pub price_changes: i64,
    pub raw_documents: i64,
    /// Distinct districts among stored listings.
    pub districts: i64,
    /// Districts with stored facility counts.
    pub facility_districts: i64,
    pub by_source: Vec<SourceStats>,
}

/// Count rows per source.
///
/// `price_changes` counts history entries beyond each listing's first
/// observation.
pub async fn collect_stats(pool: &SqlitePool) -> Result<Stats> {
    let mut by_source: BTreeMap<String, SourceStats> = BTreeMap::new();

    let listing_rows = sqlx::query(
        r#"
        SELECT l.source_id AS source,
               COUNT(DISTINCT l.listing_id) AS listings,
               COUNT(h.listing_id) - COUNT(DISTINCT l.listing_id) AS price_changes
        FROM listings l
        LEFT JOIN price_history h ON h.listing_id = l.listing_id
        GROUP BY l.source_id
        "#,
    )
    .fetch_all(pool)
    .await?;
    for row in &listing_rows {
        let source: String = row.get("source");
        let entry = by_source.entry(source.clone()).or_insert_with(|| SourceStats {
            source,
            ..Default::default()
        });
        entry.listings = row.get("listings");
        entry.price_changes = row.get::<i64, _>("price_changes").max(0);
    }

    let raw_rows = sqlx::query(
        "SELECT source_id AS source, COUNT(*) AS docs, MAX(fetched_at) AS last_fetched \
         FROM raw_documents GROUP BY source_id",
    )
    .fetch_all(pool)
    .await?;
    for row in &raw_rows {
        let source: String = row.get("source");
        let entry = by_source.entry(source.clone()).or_insert_with(|| SourceStats {
            source,
            ..Default::default()
        });
        entry.raw_documents = row.get("docs");
        entry.last_fetched_ms = row.get("last_fetched");
    }

    let districts: i64 = sqlx::query_scalar("SELECT COUNT(DISTINCT district) FROM listings")
        .fetch_one(pool)
        .await?;
    let facility_districts: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM facilities")
        .fetch_one(pool)
        .await?;

    let by_source: Vec<SourceStats> = by_source.into_values().collect();
    Ok(Stats {
        listings: by_source.iter().map(|s| s.listings).sum(),
        price_changes: by_source.iter().map(|s| s.price_changes).sum(),
        raw_documents: by_source.iter().map(|s| s.raw_documents).sum(),
        districts,
        facility_districts,
        by_source,
    })
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let stats = collect_stats(&pool).await?;
    pool.close().await;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("Rumah Harness — Database Stats");
    println!("==============================");
    println!();
    println!("  Database:       {}", config.db.path.display());
    println!("  Size:           {}", format_bytes(db_size));
    println!();
    println!("  Listings:       {}", stats.listings);
    println!("  Price changes:  {}", stats.price_changes);
    println!("  Raw documents:  {}", stats.raw_documents);
    println!(
        "  Districts:      {} ({} with facility counts)",
        stats.districts, stats.facility_districts
    );

    if !stats.by_source.is_empty() {
        println!();
        println!("  By source:");
        println!(
            "  {:<20} {:>9} {:>8} {:>9}   {}",
            "SOURCE", "LISTINGS", "CHANGES", "RAW DOCS", "LAST FETCH"
        );
        println!("  {}", "-".repeat(70));
        for s in &stats.by_source {
            let last = match s.last_fetched_ms {
                Some(ms) => format_ts_relative(ms / 1000),
                None => "never".to_string(),
            };
            println!(
                "  {:<20} {:>9} {:>8} {:>9}   {}",
                s.source, s.listings, s.price_changes, s.raw_documents, last
            );
        }
    }
    println!();
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }
    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_sizes_are_human_readable() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn recent_timestamps_are_relative() {
        let now = chrono::Utc::now().timestamp();
        assert_eq!(format_ts_relative(now), "just now");
        assert_eq!(format_ts_relative(now - 7200), "2 hours ago");
        assert_eq!(format_ts_relative(now - 86400), "1 day ago");
    }
}
