//! Storage abstraction for Rumah Harness.
//!
//! The [`ListingStore`] trait is the only shared mutable resource in the
//! pipeline. Every listing mutation goes through a compare-and-set on the
//! stored `last_seen_at`, so concurrent workers and retried writes stay
//! coherent without locks held across awaits.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::StorageError;
use crate::models::{
    Checkpoint, FacilityCounts, LineageEntry, ListingRecord, NormalizedListing, RawDocument,
};

/// Result of a conditional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// The write changed the stored record.
    Written(String),
    /// Nothing to change: the insert already happened, or the observation
    /// is not newer than the stored `last_seen_at`.
    Unchanged(String),
    /// The stored record changed since it was read (or is gone).
    Conflict,
}

impl UpsertOutcome {
    pub fn listing_id(&self) -> Option<&str> {
        match self {
            UpsertOutcome::Written(id) | UpsertOutcome::Unchanged(id) => Some(id),
            UpsertOutcome::Conflict => None,
        }
    }
}

/// Abstract storage backend.
///
/// # Write semantics
///
/// | Call | Behavior |
/// |------|----------|
/// | `conditional_upsert(None, ..)` | Insert under [`new_listing_id`]; an existing row with that id is left as is |
/// | `conditional_upsert(Some(id), .., Some(t))` | Replace current content if `last_seen_at == t`; append history on price change |
/// | `touch(id, .., t)` | Refresh `last_seen_at` only, if `last_seen_at == t` |
///
/// An observation whose `observed_at` is not newer than the stored
/// `last_seen_at` is a no-op that reports `Unchanged`. Every `Written` or
/// `Unchanged` outcome records a lineage entry, at most once per
/// (listing, raw document).
#[async_trait]
pub trait ListingStore: Send + Sync {
    /// Stored listings sharing a fingerprint.
    async fn find_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Vec<ListingRecord>, StorageError>;

    /// The listing last written for a source-native id, if any.
    async fn find_by_source_listing(
        &self,
        source_id: &str,
        source_listing_id: &str,
    ) -> Result<Option<ListingRecord>, StorageError>;

    async fn conditional_upsert(
        &self,
        listing_id: Option<&str>,
        listing: &NormalizedListing,
        fingerprint: &str,
        expected_last_seen_at: Option<DateTime<Utc>>,
    ) -> Result<UpsertOutcome, StorageError>;

    async fn touch(
        &self,
        listing_id: &str,
        listing: &NormalizedListing,
        expected_last_seen_at: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StorageError>;

    async fn get_listing(&self, listing_id: &str) -> Result<Option<ListingRecord>, StorageError>;

    /// Lineage entries for a listing, oldest first.
    async fn lineage(&self, listing_id: &str) -> Result<Vec<LineageEntry>, StorageError>;

    async fn put_raw_document(&self, doc: &RawDocument) -> Result<(), StorageError>;

    /// Delete raw documents fetched before `older_than`. Returns the count.
    async fn purge_raw_documents(&self, older_than: DateTime<Utc>) -> Result<u64, StorageError>;

    async fn checkpoint(
        &self,
        source_id: &str,
        query: &str,
    ) -> Result<Option<Checkpoint>, StorageError>;

    async fn set_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StorageError>;

    /// Distinct districts of stored listings, sorted.
    async fn districts(&self) -> Result<Vec<String>, StorageError>;

    async fn facilities(&self, kecamatan: &str) -> Result<Option<FacilityCounts>, StorageError>;

    /// Insert or replace the counts for `counts.kecamatan`.
    async fn put_facilities(&self, counts: &FacilityCounts) -> Result<(), StorageError>;
}

/// Stable id for a listing first seen in `listing`.
///
/// Derived from the source identity and observation time, so re-applying
/// the same `New` decision targets the same row.
pub fn new_listing_id(listing: &NormalizedListing) -> String {
    let name = format!(
        "{}\u{1f}{}\u{1f}{}",
        listing.source_id,
        listing.source_listing_id,
        listing.observed_at.timestamp_millis()
    );
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}

/// Lineage entry linking `listing_id` to the observation in `listing`.
pub fn lineage_entry(listing_id: &str, listing: &NormalizedListing) -> LineageEntry {
    LineageEntry {
        listing_id: listing_id.to_string(),
        raw_document_ref: listing.raw_document_ref.clone(),
        source_id: listing.source_id.clone(),
        fetched_at: listing.observed_at,
        observed_at: listing.observed_at,
    }
}
