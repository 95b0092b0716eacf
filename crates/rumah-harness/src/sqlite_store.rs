//! SQLite-backed [`ListingStore`] implementation.
//!
//! Each listing write runs in one transaction and guards the row with
//! `WHERE last_seen_at = ?`, so a concurrent writer that got there first
//! turns this write into [`UpsertOutcome::Conflict`] rather than a lost
//! update. sqlx errors (busy database, I/O) surface as
//! `StorageError::Unavailable`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use rumah_harness_core::error::StorageError;
use rumah_harness_core::models::{
    Checkpoint, FacilityCounts, LineageEntry, ListingRecord, Location, NormalizedListing,
    PriceChange, PropertyType, RawDocument,
};
use rumah_harness_core::store::{new_listing_id, ListingStore, UpsertOutcome};

/// SQLite implementation of the [`ListingStore`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn history(&self, listing_id: &str) -> Result<Vec<PriceChange>, StorageError> {
        let rows = sqlx::query(
            "SELECT observed_at, price_idr FROM price_history WHERE listing_id = ? ORDER BY observed_at",
        )
        .bind(listing_id)
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::unavailable)?;

        rows.iter()
            .map(|row| {
                Ok(PriceChange {
                    observed_at: from_millis(row.get("observed_at"))?,
                    price_idr: row.get::<i64, _>("price_idr") as u64,
                })
            })
            .collect()
    }

    async fn records(&self, rows: Vec<SqliteRow>) -> Result<Vec<ListingRecord>, StorageError> {
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut record = record_from_row(row)?;
            record.history = self.history(&record.listing_id).await?;
            out.push(record);
        }
        Ok(out)
    }
}

const LISTING_COLUMNS: &str = "listing_id, fingerprint, source_id, source_listing_id, price_idr, \
     area_sqm, land_area_sqm, bedrooms, bathrooms, raw_address, lat, lon, district, property_type, \
     title, url, listed_at, attributes_json, raw_document_ref, observed_at, first_seen_at, last_seen_at";

fn from_millis(ms: i64) -> Result<DateTime<Utc>, StorageError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| StorageError::unavailable(format!("timestamp out of range: {}", ms)))
}

fn record_from_row(row: &SqliteRow) -> Result<ListingRecord, StorageError> {
    let property_type: String = row.get("property_type");
    let property_type: PropertyType = property_type
        .parse()
        .map_err(StorageError::unavailable)?;
    let attributes_json: String = row.get("attributes_json");
    let attributes: BTreeMap<String, String> =
        serde_json::from_str(&attributes_json).map_err(StorageError::unavailable)?;
    let listed_at = row
        .get::<Option<String>, _>("listed_at")
        .and_then(|s| NaiveDate::parse_from_str(&s, "%Y-%m-%d").ok());

    let current = NormalizedListing {
        price_idr: row.get::<i64, _>("price_idr") as u64,
        area_sqm: row.get("area_sqm"),
        land_area_sqm: row.get("land_area_sqm"),
        bedrooms: row.get::<Option<i64>, _>("bedrooms").map(|v| v as u32),
        bathrooms: row.get::<Option<i64>, _>("bathrooms").map(|v| v as u32),
        location: Location {
            raw_address: row.get("raw_address"),
            lat: row.get("lat"),
            lon: row.get("lon"),
            district: row.get("district"),
        },
        property_type,
        title: row.get("title"),
        url: row.get("url"),
        listed_at,
        attributes,
        source_id: row.get("source_id"),
        source_listing_id: row.get("source_listing_id"),
        observed_at: from_millis(row.get("observed_at"))?,
        raw_document_ref: row.get("raw_document_ref"),
    };

    Ok(ListingRecord {
        listing_id: row.get("listing_id"),
        fingerprint: row.get("fingerprint"),
        current,
        history: Vec::new(),
        first_seen_at: from_millis(row.get("first_seen_at"))?,
        last_seen_at: from_millis(row.get("last_seen_at"))?,
    })
}

async fn insert_lineage(
    tx: &mut Transaction<'_, Sqlite>,
    listing_id: &str,
    listing: &NormalizedListing,
) -> Result<(), StorageError> {
    sqlx::query(
        r#"
        INSERT OR IGNORE INTO lineage (listing_id, raw_document_ref, source_id, fetched_at, observed_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(listing_id)
    .bind(&listing.raw_document_ref)
    .bind(&listing.source_id)
    .bind(listing.observed_at.timestamp_millis())
    .bind(listing.observed_at.timestamp_millis())
    .execute(&mut **tx)
    .await
    .map_err(StorageError::unavailable)?;
    Ok(())
}

async fn insert_history(
    tx: &mut Transaction<'_, Sqlite>,
    listing_id: &str,
    listing: &NormalizedListing,
) -> Result<(), StorageError> {
    sqlx::query(
        "INSERT OR IGNORE INTO price_history (listing_id, observed_at, price_idr) VALUES (?, ?, ?)",
    )
    .bind(listing_id)
    .bind(listing.observed_at.timestamp_millis())
    .bind(listing.price_idr as i64)
    .execute(&mut **tx)
    .await
    .map_err(StorageError::unavailable)?;
    Ok(())
}

fn attributes_json(listing: &NormalizedListing) -> Result<String, StorageError> {
    serde_json::to_string(&listing.attributes).map_err(StorageError::unavailable)
}

fn listed_at_text(listing: &NormalizedListing) -> Option<String> {
    listing.listed_at.map(|d| d.format("%Y-%m-%d").to_string())
}

#[async_trait]
impl ListingStore for SqliteStore {
    async fn find_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Vec<ListingRecord>, StorageError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM listings WHERE fingerprint = ?",
            LISTING_COLUMNS
        ))
        .bind(fingerprint)
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::unavailable)?;
        self.records(rows).await
    }

    async fn find_by_source_listing(
        &self,
        source_id: &str,
        source_listing_id: &str,
    ) -> Result<Option<ListingRecord>, StorageError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM listings WHERE source_id = ? AND source_listing_id = ? \
             ORDER BY last_seen_at DESC LIMIT 1",
            LISTING_COLUMNS
        ))
        .bind(source_id)
        .bind(source_listing_id)
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::unavailable)?;
        Ok(self.records(rows).await?.into_iter().next())
    }

    async fn conditional_upsert(
        &self,
        listing_id: Option<&str>,
        listing: &NormalizedListing,
        fingerprint: &str,
        expected_last_seen_at: Option<DateTime<Utc>>,
    ) -> Result<UpsertOutcome, StorageError> {
        let observed = listing.observed_at.timestamp_millis();
        let mut tx = self.pool.begin().await.map_err(StorageError::unavailable)?;

        let Some(id) = listing_id else {
            let id = new_listing_id(listing);
            let inserted = sqlx::query(
                r#"
                INSERT OR IGNORE INTO listings (listing_id, fingerprint, source_id, source_listing_id,
                    price_idr, area_sqm, land_area_sqm, bedrooms, bathrooms, raw_address, lat, lon,
                    district, property_type, title, url, listed_at, attributes_json, raw_document_ref,
                    observed_at, first_seen_at, last_seen_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&id)
            .bind(fingerprint)
            .bind(&listing.source_id)
            .bind(&listing.source_listing_id)
            .bind(listing.price_idr as i64)
            .bind(listing.area_sqm)
            .bind(listing.land_area_sqm)
            .bind(listing.bedrooms.map(i64::from))
            .bind(listing.bathrooms.map(i64::from))
            .bind(&listing.location.raw_address)
            .bind(listing.location.lat)
            .bind(listing.location.lon)
            .bind(&listing.location.district)
            .bind(listing.property_type.as_str())
            .bind(&listing.title)
            .bind(&listing.url)
            .bind(listed_at_text(listing))
            .bind(attributes_json(listing)?)
            .bind(&listing.raw_document_ref)
            .bind(observed)
            .bind(observed)
            .bind(observed)
            .execute(&mut *tx)
            .await
            .map_err(StorageError::unavailable)?
            .rows_affected();

            if inserted == 1 {
                insert_history(&mut tx, &id, listing).await?;
            }
            insert_lineage(&mut tx, &id, listing).await?;
            tx.commit().await.map_err(StorageError::unavailable)?;
            return Ok(if inserted == 1 {
                UpsertOutcome::Written(id)
            } else {
                UpsertOutcome::Unchanged(id)
            });
        };

        let current = sqlx::query("SELECT price_idr, last_seen_at FROM listings WHERE listing_id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(StorageError::unavailable)?;
        let Some(current) = current else {
            return Ok(UpsertOutcome::Conflict);
        };
        let stored_price: i64 = current.get("price_idr");
        let stored_last_seen: i64 = current.get("last_seen_at");

        if observed <= stored_last_seen {
            insert_lineage(&mut tx, id, listing).await?;
            tx.commit().await.map_err(StorageError::unavailable)?;
            return Ok(UpsertOutcome::Unchanged(id.to_string()));
        }
        if expected_last_seen_at.map(|t| t.timestamp_millis()) != Some(stored_last_seen) {
            return Ok(UpsertOutcome::Conflict);
        }

        let updated = sqlx::query(
            r#"
            UPDATE listings SET
                fingerprint = ?, source_id = ?, source_listing_id = ?, price_idr = ?,
                area_sqm = ?, land_area_sqm = ?, bedrooms = ?, bathrooms = ?, raw_address = ?,
                lat = ?, lon = ?, district = ?, property_type = ?, title = ?, url = ?, listed_at = ?,
                attributes_json = ?, raw_document_ref = ?, observed_at = ?, last_seen_at = ?
            WHERE listing_id = ? AND last_seen_at = ?
            "#,
        )
        .bind(fingerprint)
        .bind(&listing.source_id)
        .bind(&listing.source_listing_id)
        .bind(listing.price_idr as i64)
        .bind(listing.area_sqm)
        .bind(listing.land_area_sqm)
        .bind(listing.bedrooms.map(i64::from))
        .bind(listing.bathrooms.map(i64::from))
        .bind(&listing.location.raw_address)
        .bind(listing.location.lat)
        .bind(listing.location.lon)
        .bind(&listing.location.district)
        .bind(listing.property_type.as_str())
        .bind(&listing.title)
        .bind(&listing.url)
        .bind(listed_at_text(listing))
        .bind(attributes_json(listing)?)
        .bind(&listing.raw_document_ref)
        .bind(observed)
        .bind(observed)
        .bind(id)
        .bind(stored_last_seen)
        .execute(&mut *tx)
        .await
        .map_err(StorageError::unavailable)?
        .rows_affected();

        if updated == 0 {
            return Ok(UpsertOutcome::Conflict);
        }
        if stored_price != listing.price_idr as i64 {
            insert_history(&mut tx, id, listing).await?;
        }
        insert_lineage(&mut tx, id, listing).await?;
        tx.commit().await.map_err(StorageError::unavailable)?;
        Ok(UpsertOutcome::Written(id.to_string()))
    }

    async fn touch(
        &self,
        listing_id: &str,
        listing: &NormalizedListing,
        expected_last_seen_at: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StorageError> {
        let observed = listing.observed_at.timestamp_millis();
        let mut tx = self.pool.begin().await.map_err(StorageError::unavailable)?;

        let stored_last_seen: Option<i64> =
            sqlx::query_scalar("SELECT last_seen_at FROM listings WHERE listing_id = ?")
                .bind(listing_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(StorageError::unavailable)?;
        let Some(stored_last_seen) = stored_last_seen else {
            return Ok(UpsertOutcome::Conflict);
        };

        let refreshed = observed > stored_last_seen;
        if refreshed {
            if stored_last_seen != expected_last_seen_at.timestamp_millis() {
                return Ok(UpsertOutcome::Conflict);
            }
            let updated = sqlx::query(
                "UPDATE listings SET last_seen_at = ? WHERE listing_id = ? AND last_seen_at = ?",
            )
            .bind(observed)
            .bind(listing_id)
            .bind(stored_last_seen)
            .execute(&mut *tx)
            .await
            .map_err(StorageError::unavailable)?
            .rows_affected();
            if updated == 0 {
                return Ok(UpsertOutcome::Conflict);
            }
        }

        insert_lineage(&mut tx, listing_id, listing).await?;
        tx.commit().await.map_err(StorageError::unavailable)?;
        Ok(if refreshed {
            UpsertOutcome::Written(listing_id.to_string())
        } else {
            UpsertOutcome::Unchanged(listing_id.to_string())
        })
    }

    async fn get_listing(&self, listing_id: &str) -> Result<Option<ListingRecord>, StorageError> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM listings WHERE listing_id = ?",
            LISTING_COLUMNS
        ))
        .bind(listing_id)
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::unavailable)?;
        Ok(self.records(rows).await?.into_iter().next())
    }

    async fn lineage(&self, listing_id: &str) -> Result<Vec<LineageEntry>, StorageError> {
        let rows = sqlx::query(
            r#"
            SELECT listing_id, raw_document_ref, source_id, fetched_at, observed_at
            FROM lineage WHERE listing_id = ?
            ORDER BY observed_at
            "#,
        )
        .bind(listing_id)
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::unavailable)?;

        rows.iter()
            .map(|row| {
                Ok(LineageEntry {
                    listing_id: row.get("listing_id"),
                    raw_document_ref: row.get("raw_document_ref"),
                    source_id: row.get("source_id"),
                    fetched_at: from_millis(row.get("fetched_at"))?,
                    observed_at: from_millis(row.get("observed_at"))?,
                })
            })
            .collect()
    }

    async fn put_raw_document(&self, doc: &RawDocument) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO raw_documents (id, source_id, url_or_query, fetched_at, http_status, content)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&doc.id)
        .bind(&doc.source_id)
        .bind(&doc.url_or_query)
        .bind(doc.fetched_at.timestamp_millis())
        .bind(doc.http_status as i64)
        .bind(&doc.content)
        .execute(&self.pool)
        .await
        .map_err(StorageError::unavailable)?;
        Ok(())
    }

    async fn purge_raw_documents(&self, older_than: DateTime<Utc>) -> Result<u64, StorageError> {
        let result = sqlx::query("DELETE FROM raw_documents WHERE fetched_at < ?")
            .bind(older_than.timestamp_millis())
            .execute(&self.pool)
            .await
            .map_err(StorageError::unavailable)?;
        Ok(result.rows_affected())
    }

    async fn checkpoint(
        &self,
        source_id: &str,
        query: &str,
    ) -> Result<Option<Checkpoint>, StorageError> {
        let row = sqlx::query(
            "SELECT next_page, updated_at FROM checkpoints WHERE source = ? AND query = ?",
        )
        .bind(source_id)
        .bind(query)
        .fetch_optional(&self.pool)
        .await
        .map_err(StorageError::unavailable)?;

        row.map(|row| {
            Ok(Checkpoint {
                source_id: source_id.to_string(),
                query: query.to_string(),
                next_page: row.get::<i64, _>("next_page") as u32,
                updated_at: from_millis(row.get("updated_at"))?,
            })
        })
        .transpose()
    }

    async fn set_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO checkpoints (source, query, next_page, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(source, query) DO UPDATE SET
                next_page = excluded.next_page,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&checkpoint.source_id)
        .bind(&checkpoint.query)
        .bind(checkpoint.next_page as i64)
        .bind(checkpoint.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(StorageError::unavailable)?;
        Ok(())
    }

    async fn districts(&self) -> Result<Vec<String>, StorageError> {
        sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT district FROM listings WHERE district IS NOT NULL ORDER BY district",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::unavailable)
    }

    async fn facilities(&self, kecamatan: &str) -> Result<Option<FacilityCounts>, StorageError> {
        let row = sqlx::query(
            r#"
            SELECT education, health, shopping, transport, recreation, updated_at
            FROM facilities WHERE kecamatan = ?
            "#,
        )
        .bind(kecamatan)
        .fetch_optional(&self.pool)
        .await
        .map_err(StorageError::unavailable)?;

        row.map(|row| {
            Ok(FacilityCounts {
                kecamatan: kecamatan.to_string(),
                education: row.get::<i64, _>("education") as u64,
                health: row.get::<i64, _>("health") as u64,
                shopping: row.get::<i64, _>("shopping") as u64,
                transport: row.get::<i64, _>("transport") as u64,
                recreation: row.get::<i64, _>("recreation") as u64,
                updated_at: from_millis(row.get("updated_at"))?,
            })
        })
        .transpose()
    }

    async fn put_facilities(&self, counts: &FacilityCounts) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO facilities (kecamatan, education, health, shopping, transport, recreation, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(kecamatan) DO UPDATE SET
                education = excluded.education,
                health = excluded.health,
                shopping = excluded.shopping,
                transport = excluded.transport,
                recreation = excluded.recreation,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&counts.kecamatan)
        .bind(counts.education as i64)
        .bind(counts.health as i64)
        .bind(counts.shopping as i64)
        .bind(counts.transport as i64)
        .bind(counts.recreation as i64)
        .bind(counts.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(StorageError::unavailable)?;
        Ok(())
    }
}
