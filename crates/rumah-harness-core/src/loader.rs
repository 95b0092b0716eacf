//! Idempotent writes of reconciled listings.
//!
//! The loader turns a [`Decision`] into the matching conditional store
//! call. A lost compare-and-set comes back as `StorageError::Conflict` so
//! the caller can re-reconcile against fresh state.

use std::sync::Arc;

use tracing::debug;

use crate::error::StorageError;
use crate::fingerprint::{fingerprint, FingerprintConfig};
use crate::models::{Decision, NormalizedListing};
use crate::store::{ListingStore, UpsertOutcome};

/// What a load did to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// The decision changed the stored listing.
    Applied(String),
    /// The observation was already applied or is superseded; only lineage
    /// may have been recorded.
    Unchanged(String),
}

impl LoadOutcome {
    pub fn listing_id(&self) -> &str {
        match self {
            LoadOutcome::Applied(id) | LoadOutcome::Unchanged(id) => id,
        }
    }
}

pub struct Loader {
    store: Arc<dyn ListingStore>,
    fingerprint: FingerprintConfig,
}

impl Loader {
    pub fn new(store: Arc<dyn ListingStore>, fingerprint: FingerprintConfig) -> Self {
        Self { store, fingerprint }
    }

    /// Apply `decision` for `listing`.
    pub async fn upsert(
        &self,
        listing: &NormalizedListing,
        decision: &Decision,
    ) -> Result<LoadOutcome, StorageError> {
        let fp = fingerprint(listing, &self.fingerprint);
        let (target, outcome) = match decision {
            Decision::New => (
                None,
                self.store
                    .conditional_upsert(None, listing, &fp, None)
                    .await?,
            ),
            Decision::Update {
                listing_id,
                expected_last_seen_at,
            } => (
                Some(listing_id),
                self.store
                    .conditional_upsert(
                        Some(listing_id.as_str()),
                        listing,
                        &fp,
                        Some(*expected_last_seen_at),
                    )
                    .await?,
            ),
            Decision::Duplicate {
                listing_id,
                expected_last_seen_at,
            } => (
                Some(listing_id),
                self.store
                    .touch(listing_id, listing, *expected_last_seen_at)
                    .await?,
            ),
        };

        match outcome {
            UpsertOutcome::Written(id) => {
                debug!(listing_id = %id, decision = decision.label(), "listing written");
                Ok(LoadOutcome::Applied(id))
            }
            UpsertOutcome::Unchanged(id) => {
                debug!(listing_id = %id, decision = decision.label(), "observation already applied");
                Ok(LoadOutcome::Unchanged(id))
            }
            UpsertOutcome::Conflict => Err(StorageError::Conflict {
                listing_id: target.cloned().unwrap_or_default(),
            }),
        }
    }
}
