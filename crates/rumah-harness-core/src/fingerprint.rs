//! Coarse listing fingerprints for dedup candidate lookup.
//!
//! A fingerprint hashes the parts of a listing that survive formatting
//! noise: address tokens (lowercased, sorted, deduplicated), area rounded to
//! a granularity, property type, and a logarithmic price bucket. Listings
//! that differ only in capitalization, whitespace, or small price moves
//! share a fingerprint. It narrows the search; it is not an identity.

use std::collections::BTreeSet;

use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::models::NormalizedListing;

/// Fingerprint coarseness.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct FingerprintConfig {
    /// Area rounding step in square meters.
    pub area_granularity_sqm: f64,
    /// Price buckets per factor of ten.
    pub price_buckets_per_decade: u32,
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            area_granularity_sqm: 1.0,
            price_buckets_per_decade: 4,
        }
    }
}

/// Lowercase alphanumeric address tokens, sorted and deduplicated.
pub fn address_tokens(address: &str) -> BTreeSet<String> {
    address
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// `floor(log10(price) × buckets_per_decade)`; zero for a zero price.
pub fn price_bucket(price_idr: u64, buckets_per_decade: u32) -> u64 {
    if price_idr == 0 {
        return 0;
    }
    ((price_idr as f64).log10() * buckets_per_decade as f64).floor() as u64
}

fn area_bucket(area_sqm: Option<f64>, granularity: f64) -> String {
    match area_sqm {
        Some(area) if granularity > 0.0 => {
            format!("{}", ((area / granularity).round() * granularity) as i64)
        }
        Some(area) => format!("{}", area.round() as i64),
        None => "?".to_string(),
    }
}

/// SHA-256 hex fingerprint of a listing.
pub fn fingerprint(listing: &NormalizedListing, config: &FingerprintConfig) -> String {
    let tokens: Vec<String> = address_tokens(&listing.location.raw_address)
        .into_iter()
        .collect();
    let key = format!(
        "{}|{}|{}|{}",
        tokens.join(" "),
        area_bucket(listing.area_sqm, config.area_granularity_sqm),
        listing.property_type.as_str(),
        price_bucket(listing.price_idr, config.price_buckets_per_decade),
    );
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    format!("{:x}", hasher.finalize())
}
