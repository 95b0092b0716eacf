//! In-memory [`ListingStore`] implementation for tests and dry runs.
//!
//! All state sits behind one `std::sync::RwLock`, so each compare-and-set
//! is atomic. A poisoned lock surfaces as `StorageError::Unavailable`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::models::{
    Checkpoint, FacilityCounts, LineageEntry, ListingRecord, NormalizedListing, PriceChange,
    RawDocument,
};

use super::{lineage_entry, new_listing_id, ListingStore, UpsertOutcome};

#[derive(Default)]
struct State {
    listings: HashMap<String, ListingRecord>,
    by_source: HashMap<(String, String), String>,
    lineage: Vec<LineageEntry>,
    raw_documents: BTreeMap<String, RawDocument>,
    checkpoints: HashMap<(String, String), Checkpoint>,
    facilities: HashMap<String, FacilityCounts>,
}

impl State {
    fn record_lineage(&mut self, listing_id: &str, listing: &NormalizedListing) {
        let exists = self.lineage.iter().any(|e| {
            e.listing_id == listing_id && e.raw_document_ref == listing.raw_document_ref
        });
        if !exists {
            self.lineage.push(lineage_entry(listing_id, listing));
        }
    }

    fn index(&mut self, listing_id: &str, listing: &NormalizedListing) {
        self.by_source.insert(
            (listing.source_id.clone(), listing.source_listing_id.clone()),
            listing_id.to_string(),
        );
    }
}

/// In-memory store.
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, StorageError> {
        self.state.read().map_err(StorageError::unavailable)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, StorageError> {
        self.state.write().map_err(StorageError::unavailable)
    }

    pub fn listing_count(&self) -> Result<usize, StorageError> {
        Ok(self.read()?.listings.len())
    }

    pub fn raw_document_count(&self) -> Result<usize, StorageError> {
        Ok(self.read()?.raw_documents.len())
    }

    /// All stored listings, ordered by id.
    pub fn listings(&self) -> Result<Vec<ListingRecord>, StorageError> {
        let mut all: Vec<ListingRecord> = self.read()?.listings.values().cloned().collect();
        all.sort_by(|a, b| a.listing_id.cmp(&b.listing_id));
        Ok(all)
    }
}

#[async_trait]
impl ListingStore for InMemoryStore {
    async fn find_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Vec<ListingRecord>, StorageError> {
        let state = self.read()?;
        Ok(state
            .listings
            .values()
            .filter(|r| r.fingerprint == fingerprint)
            .cloned()
            .collect())
    }

    async fn find_by_source_listing(
        &self,
        source_id: &str,
        source_listing_id: &str,
    ) -> Result<Option<ListingRecord>, StorageError> {
        let state = self.read()?;
        Ok(state
            .by_source
            .get(&(source_id.to_string(), source_listing_id.to_string()))
            .and_then(|id| state.listings.get(id))
            .cloned())
    }

    async fn conditional_upsert(
        &self,
        listing_id: Option<&str>,
        listing: &NormalizedListing,
        fingerprint: &str,
        expected_last_seen_at: Option<DateTime<Utc>>,
    ) -> Result<UpsertOutcome, StorageError> {
        let mut state = self.write()?;

        let Some(id) = listing_id else {
            let id = new_listing_id(listing);
            if state.listings.contains_key(&id) {
                state.record_lineage(&id, listing);
                return Ok(UpsertOutcome::Unchanged(id));
            }
            state.listings.insert(
                id.clone(),
                ListingRecord {
                    listing_id: id.clone(),
                    fingerprint: fingerprint.to_string(),
                    current: listing.clone(),
                    history: vec![PriceChange {
                        observed_at: listing.observed_at,
                        price_idr: listing.price_idr,
                    }],
                    first_seen_at: listing.observed_at,
                    last_seen_at: listing.observed_at,
                },
            );
            state.index(&id, listing);
            state.record_lineage(&id, listing);
            return Ok(UpsertOutcome::Written(id));
        };

        let Some(record) = state.listings.get_mut(id) else {
            return Ok(UpsertOutcome::Conflict);
        };
        if listing.observed_at <= record.last_seen_at {
            state.record_lineage(id, listing);
            return Ok(UpsertOutcome::Unchanged(id.to_string()));
        }
        if expected_last_seen_at != Some(record.last_seen_at) {
            return Ok(UpsertOutcome::Conflict);
        }

        if record.current.price_idr != listing.price_idr {
            record.history.push(PriceChange {
                observed_at: listing.observed_at,
                price_idr: listing.price_idr,
            });
        }
        record.current = listing.clone();
        record.fingerprint = fingerprint.to_string();
        record.last_seen_at = listing.observed_at;

        state.index(id, listing);
        state.record_lineage(id, listing);
        Ok(UpsertOutcome::Written(id.to_string()))
    }

    async fn touch(
        &self,
        listing_id: &str,
        listing: &NormalizedListing,
        expected_last_seen_at: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StorageError> {
        let mut state = self.write()?;
        let Some(record) = state.listings.get_mut(listing_id) else {
            return Ok(UpsertOutcome::Conflict);
        };
        let outcome = if listing.observed_at > record.last_seen_at {
            if record.last_seen_at != expected_last_seen_at {
                return Ok(UpsertOutcome::Conflict);
            }
            record.last_seen_at = listing.observed_at;
            UpsertOutcome::Written(listing_id.to_string())
        } else {
            UpsertOutcome::Unchanged(listing_id.to_string())
        };
        state.record_lineage(listing_id, listing);
        Ok(outcome)
    }

    async fn get_listing(&self, listing_id: &str) -> Result<Option<ListingRecord>, StorageError> {
        Ok(self.read()?.listings.get(listing_id).cloned())
    }

    async fn lineage(&self, listing_id: &str) -> Result<Vec<LineageEntry>, StorageError> {
        let mut entries: Vec<LineageEntry> = self
            .read()?
            .lineage
            .iter()
            .filter(|e| e.listing_id == listing_id)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.observed_at);
        Ok(entries)
    }

    async fn put_raw_document(&self, doc: &RawDocument) -> Result<(), StorageError> {
        self.write()?
            .raw_documents
            .insert(doc.id.clone(), doc.clone());
        Ok(())
    }

    async fn purge_raw_documents(&self, older_than: DateTime<Utc>) -> Result<u64, StorageError> {
        let mut state = self.write()?;
        let before = state.raw_documents.len();
        state.raw_documents.retain(|_, d| d.fetched_at >= older_than);
        Ok((before - state.raw_documents.len()) as u64)
    }

    async fn checkpoint(
        &self,
        source_id: &str,
        query: &str,
    ) -> Result<Option<Checkpoint>, StorageError> {
        Ok(self
            .read()?
            .checkpoints
            .get(&(source_id.to_string(), query.to_string()))
            .cloned())
    }

    async fn set_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StorageError> {
        self.write()?.checkpoints.insert(
            (checkpoint.source_id.clone(), checkpoint.query.clone()),
            checkpoint.clone(),
        );
        Ok(())
    }

    async fn districts(&self) -> Result<Vec<String>, StorageError> {
        let districts: BTreeSet<String> = self
            .read()?
            .listings
            .values()
            .filter_map(|r| r.current.location.district.clone())
            .collect();
        Ok(districts.into_iter().collect())
    }

    async fn facilities(&self, kecamatan: &str) -> Result<Option<FacilityCounts>, StorageError> {
        Ok(self.read()?.facilities.get(kecamatan).cloned())
    }

    async fn put_facilities(&self, counts: &FacilityCounts) -> Result<(), StorageError> {
        self.write()?
            .facilities
            .insert(counts.kecamatan.clone(), counts.clone());
        Ok(())
    }
}
