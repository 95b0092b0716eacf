//! Database schema migrations.
//!
//! Every statement is `CREATE ... IF NOT EXISTS`, so running `rumah init`
//! (or any command that migrates first) repeatedly is safe.
//!
//! | Table | Contents |
//! |-------|----------|
//! | `raw_documents` | Fetched payloads, purged by the retention policy |
//! | `listings` | Current canonical state per listing |
//! | `price_history` | Price observations per listing |
//! | `lineage` | Listing ↔ raw document links |
//! | `checkpoints` | Next page per (source, query) |
//! | `facilities` | OSM facility counts per kecamatan |
//!
//! Timestamps are stored as epoch milliseconds.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS raw_documents (
        id TEXT PRIMARY KEY,
        source_id TEXT NOT NULL,
        url_or_query TEXT NOT NULL,
        fetched_at INTEGER NOT NULL,
        http_status INTEGER NOT NULL,
        content TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS listings (
        listing_id TEXT PRIMARY KEY,
        fingerprint TEXT NOT NULL,
        source_id TEXT NOT NULL,
        source_listing_id TEXT NOT NULL,
        price_idr INTEGER NOT NULL,
        area_sqm REAL,
        land_area_sqm REAL,
        bedrooms INTEGER,
        bathrooms INTEGER,
        raw_address TEXT NOT NULL,
        lat REAL,
        lon REAL,
        district TEXT,
        property_type TEXT NOT NULL,
        title TEXT,
        url TEXT,
        listed_at TEXT,
        attributes_json TEXT NOT NULL DEFAULT '{}',
        raw_document_ref TEXT NOT NULL,
        observed_at INTEGER NOT NULL,
        first_seen_at INTEGER NOT NULL,
        last_seen_at INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS price_history (
        listing_id TEXT NOT NULL,
        observed_at INTEGER NOT NULL,
        price_idr INTEGER NOT NULL,
        PRIMARY KEY (listing_id, observed_at),
        FOREIGN KEY (listing_id) REFERENCES listings(listing_id)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS lineage (
        listing_id TEXT NOT NULL,
        raw_document_ref TEXT NOT NULL,
        source_id TEXT NOT NULL,
        fetched_at INTEGER NOT NULL,
        observed_at INTEGER NOT NULL,
        PRIMARY KEY (listing_id, raw_document_ref)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS checkpoints (
        source TEXT NOT NULL,
        query TEXT NOT NULL,
        next_page INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        PRIMARY KEY (source, query)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS facilities (
        kecamatan TEXT PRIMARY KEY,
        education INTEGER NOT NULL,
        health INTEGER NOT NULL,
        shopping INTEGER NOT NULL,
        transport INTEGER NOT NULL,
        recreation INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_listings_fingerprint ON listings(fingerprint)",
    "CREATE INDEX IF NOT EXISTS idx_listings_source ON listings(source_id, source_listing_id, last_seen_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_listings_district ON listings(district)",
    "CREATE INDEX IF NOT EXISTS idx_raw_documents_fetched_at ON raw_documents(fetched_at)",
];

/// Apply the schema to an open pool.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}
