//! Deduplication and reconciliation against stored listings.
//!
//! A normalized listing is matched in two steps:
//!
//! 1. **Candidate lookup**: stored listings sharing its fingerprint, plus
//!    the listing last written for the same source-native id.
//! 2. **Scoring**: weighted blend of address-token Jaccard similarity,
//!    price closeness, and area closeness. The best candidate scoring above
//!    the threshold wins; ties go to the most recently seen.
//!
//! Within one source the native id is authoritative: a different id from
//! the same source is a different property, however close it scores.
//! Fuzzy matching only links listings across sources.
//!
//! A winning candidate with identical content is a `Duplicate`; otherwise
//! it is an `Update`. No winner means `New`.
//!
//! | Weight | Default |
//! |--------|---------|
//! | address | 0.50 |
//! | price (tolerance 15%) | 0.25 |
//! | area (tolerance 10%) | 0.25 |
//! | threshold (exclusive) | 0.75 |

use std::sync::Arc;

use serde::Deserialize;
use tracing::debug;

use crate::error::StorageError;
use crate::fingerprint::{address_tokens, fingerprint, FingerprintConfig};
use crate::models::{Decision, ListingRecord, NormalizedListing};
use crate::store::ListingStore;

/// Similarity weights, tolerances, and threshold.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// A candidate must score strictly above this to match.
    pub threshold: f64,
    pub address_weight: f64,
    pub price_weight: f64,
    pub area_weight: f64,
    /// Relative price difference at which price closeness reaches zero.
    pub price_tolerance: f64,
    /// Relative area difference at which area closeness reaches zero.
    pub area_tolerance: f64,
    pub fingerprint: FingerprintConfig,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            threshold: 0.75,
            address_weight: 0.5,
            price_weight: 0.25,
            area_weight: 0.25,
            price_tolerance: 0.15,
            area_tolerance: 0.10,
            fingerprint: FingerprintConfig::default(),
        }
    }
}

fn jaccard(a: &str, b: &str) -> f64 {
    let ta = address_tokens(a);
    let tb = address_tokens(b);
    let union = ta.union(&tb).count();
    if union == 0 {
        return 0.0;
    }
    ta.intersection(&tb).count() as f64 / union as f64
}

fn closeness(a: f64, b: f64, tolerance: f64) -> f64 {
    let max = a.abs().max(b.abs());
    if max == 0.0 {
        return 1.0;
    }
    let rel = (a - b).abs() / max;
    (1.0 - rel / tolerance).clamp(0.0, 1.0)
}

/// Similarity of two listings in `[0, 1]`.
///
/// The same source-native id from the same source is always 1.0, and a
/// different id from the same source is always 0.0.
pub fn similarity(a: &NormalizedListing, b: &NormalizedListing, config: &ReconcileConfig) -> f64 {
    if a.source_id == b.source_id {
        return if a.source_listing_id == b.source_listing_id {
            1.0
        } else {
            0.0
        };
    }
    let total = config.address_weight + config.price_weight + config.area_weight;
    if total <= 0.0 {
        return 0.0;
    }

    let address = jaccard(&a.location.raw_address, &b.location.raw_address);
    let price = closeness(a.price_idr as f64, b.price_idr as f64, config.price_tolerance);
    let area = match (a.area_sqm, b.area_sqm) {
        (Some(x), Some(y)) => closeness(x, y, config.area_tolerance),
        _ => 0.5,
    };

    (config.address_weight * address + config.price_weight * price + config.area_weight * area)
        / total
}

/// Pick a decision for `listing` among already-fetched candidates.
pub fn decide(
    listing: &NormalizedListing,
    candidates: &[ListingRecord],
    config: &ReconcileConfig,
) -> Decision {
    let best = candidates
        .iter()
        .map(|c| (similarity(listing, &c.current, config), c))
        .filter(|(score, _)| *score > config.threshold)
        .max_by(|(sa, a), (sb, b)| {
            sa.total_cmp(sb)
                .then_with(|| a.last_seen_at.cmp(&b.last_seen_at))
        });

    match best {
        Some((score, record)) => {
            debug!(
                listing_id = %record.listing_id,
                score,
                "matched stored listing"
            );
            if record.current.same_content(listing) {
                Decision::Duplicate {
                    listing_id: record.listing_id.clone(),
                    expected_last_seen_at: record.last_seen_at,
                }
            } else {
                Decision::Update {
                    listing_id: record.listing_id.clone(),
                    expected_last_seen_at: record.last_seen_at,
                }
            }
        }
        None => Decision::New,
    }
}

/// Decides whether a listing is new, an update, or a duplicate.
pub struct Reconciler {
    config: ReconcileConfig,
    store: Arc<dyn ListingStore>,
}

impl Reconciler {
    pub fn new(config: ReconcileConfig, store: Arc<dyn ListingStore>) -> Self {
        Self { config, store }
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    pub fn fingerprint(&self, listing: &NormalizedListing) -> String {
        fingerprint(listing, &self.config.fingerprint)
    }

    pub async fn reconcile(&self, listing: &NormalizedListing) -> Result<Decision, StorageError> {
        let fp = self.fingerprint(listing);
        let mut candidates = self.store.find_by_fingerprint(&fp).await?;
        if let Some(same_source) = self
            .store
            .find_by_source_listing(&listing.source_id, &listing.source_listing_id)
            .await?
        {
            if !candidates
                .iter()
                .any(|c| c.listing_id == same_source.listing_id)
            {
                candidates.push(same_source);
            }
        }
        Ok(decide(listing, &candidates, &self.config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Location, PropertyType};
    use chrono::{DateTime, Duration, Utc};

    fn t0() -> DateTime<Utc> {
        DateTime::from_timestamp_millis(1_700_000_000_000).unwrap()
    }

    fn listing(id: &str, address: &str, price: u64, area: Option<f64>) -> NormalizedListing {
        from_source("rumah123", id, address, price, area)
    }

    fn from_source(
        source: &str,
        id: &str,
        address: &str,
        price: u64,
        area: Option<f64>,
    ) -> NormalizedListing {
        NormalizedListing {
            price_idr: price,
            area_sqm: area,
            land_area_sqm: None,
            bedrooms: Some(3),
            bathrooms: Some(2),
            location: Location {
                raw_address: address.to_string(),
                lat: None,
                lon: None,
                district: None,
            },
            property_type: PropertyType::House,
            title: None,
            url: None,
            listed_at: None,
            attributes: Default::default(),
            source_id: source.to_string(),
            source_listing_id: id.to_string(),
            observed_at: t0(),
            raw_document_ref: "raw".to_string(),
        }
    }

    fn record(listing_id: &str, current: NormalizedListing, last_seen: DateTime<Utc>) -> ListingRecord {
        ListingRecord {
            listing_id: listing_id.to_string(),
            fingerprint: "fp".to_string(),
            current,
            history: Vec::new(),
            first_seen_at: last_seen,
            last_seen_at: last_seen,
        }
    }

    #[test]
    fn no_candidates_is_new() {
        let cfg = ReconcileConfig::default();
        let l = listing("a", "Cilandak, Jakarta Selatan", 1_000_000_000, Some(100.0));
        assert_eq!(decide(&l, &[], &cfg), Decision::New);
    }

    #[test]
    fn identical_content_from_other_source_is_duplicate() {
        let cfg = ReconcileConfig::default();
        let stored = listing("a", "Cilandak, Jakarta Selatan", 1_000_000_000, Some(100.0));
        let incoming = from_source("partner", "p-17", "Cilandak, Jakarta Selatan", 1_000_000_000, Some(100.0));
        let d = decide(&incoming, &[record("L1", stored, t0())], &cfg);
        assert_eq!(
            d,
            Decision::Duplicate {
                listing_id: "L1".to_string(),
                expected_last_seen_at: t0()
            }
        );
    }

    #[test]
    fn price_change_on_same_source_id_is_update() {
        let cfg = ReconcileConfig::default();
        let stored = listing("a", "Cilandak, Jakarta Selatan", 1_000_000_000, Some(100.0));
        let incoming = listing("a", "Cilandak, Jakarta Selatan", 700_000_000, Some(100.0));
        let d = decide(&incoming, &[record("L1", stored, t0())], &cfg);
        assert_eq!(d.label(), "update");
    }

    #[test]
    fn dissimilar_candidate_is_new() {
        let cfg = ReconcileConfig::default();
        let stored = listing("a", "Cilandak, Jakarta Selatan", 1_000_000_000, Some(100.0));
        let incoming = from_source("partner", "b", "Bekasi Utara, Bekasi", 1_000_000_000, Some(100.0));
        assert_eq!(
            decide(&incoming, &[record("L1", stored, t0())], &cfg),
            Decision::New
        );
    }

    #[test]
    fn ties_prefer_most_recently_seen() {
        let cfg = ReconcileConfig::default();
        let l = from_source("partner", "x", "Depok, Jawa Barat", 800_000_000, Some(90.0));
        let older = record("OLD", listing("p", "Depok, Jawa Barat", 800_000_000, Some(90.0)), t0());
        let newer = record(
            "NEW",
            listing("q", "Depok, Jawa Barat", 800_000_000, Some(90.0)),
            t0() + Duration::hours(5),
        );
        let d = decide(&l, &[older, newer], &cfg);
        assert_eq!(
            d,
            Decision::Duplicate {
                listing_id: "NEW".to_string(),
                expected_last_seen_at: t0() + Duration::hours(5)
            }
        );
    }

    #[test]
    fn similarity_components() {
        let cfg = ReconcileConfig::default();
        let a = listing("a", "Depok", 1_000, None);
        let b = from_source("partner", "b", "depok", 1_000, Some(50.0));
        // address 1.0, price 1.0, unknown area 0.5
        assert!((similarity(&a, &b, &cfg) - 0.875).abs() < 1e-9);
        let c = from_source("partner", "c", "Bogor", 2_000, None);
        assert!(similarity(&a, &c, &cfg) < cfg.threshold);
    }

    #[test]
    fn other_listing_from_same_source_never_matches() {
        let cfg = ReconcileConfig::default();
        // Same district, same size, prices within tolerance.
        let stored = listing("hosA", "Kebayoran Baru, Jakarta Selatan", 3_500_000_000, Some(180.0));
        let incoming = listing("hosB", "Kebayoran Baru, Jakarta Selatan", 3_400_000_000, Some(180.0));
        assert_eq!(similarity(&incoming, &stored, &cfg), 0.0);
        assert_eq!(
            decide(&incoming, &[record("L1", stored, t0())], &cfg),
            Decision::New
        );
    }

    #[test]
    fn score_equal_to_threshold_does_not_match() {
        // address 1.0 * 0.5, price 0.0 * 0.25, area 1.0 * 0.25 = 0.75 exactly.
        let cfg = ReconcileConfig::default();
        let stored = listing("a", "Cilandak", 1_000_000_000, Some(100.0));
        let incoming = from_source("partner", "b", "cilandak", 2_000_000_000, Some(100.0));
        assert!((similarity(&incoming, &stored, &cfg) - cfg.threshold).abs() < 1e-12);
        assert_eq!(
            decide(&incoming, &[record("L1", stored, t0())], &cfg),
            Decision::New
        );
    }
}
