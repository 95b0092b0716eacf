//! Geocoding collaborator abstraction.
//!
//! Geocoding is best-effort: a miss or a failing provider leaves the
//! listing's coordinates unknown and never fails the record.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;

/// Result of a successful geocoder call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GeocodeOutcome {
    Found { lat: f64, lon: f64 },
    NotFound,
}

/// The provider could not answer (network, quota, malformed response).
#[derive(Debug, Clone, PartialEq, Error)]
#[error("geocoder unavailable: {0}")]
pub struct GeocodeError(pub String);

/// Resolves a free-form address to coordinates.
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn geocode(&self, address: &str) -> Result<GeocodeOutcome, GeocodeError>;
}

/// Geocoder used when geocoding is disabled. Always answers `NotFound`.
pub struct NoGeocoder;

#[async_trait]
impl Geocoder for NoGeocoder {
    async fn geocode(&self, _address: &str) -> Result<GeocodeOutcome, GeocodeError> {
        Ok(GeocodeOutcome::NotFound)
    }
}

/// Fixed lookup table of known places, keyed case-insensitively.
pub struct StaticGeocoder {
    places: HashMap<String, (f64, f64)>,
}

impl StaticGeocoder {
    pub fn new<I, K>(places: I) -> Self
    where
        I: IntoIterator<Item = (K, (f64, f64))>,
        K: AsRef<str>,
    {
        Self {
            places: places
                .into_iter()
                .map(|(k, v)| (normalize_key(k.as_ref()), v))
                .collect(),
        }
    }
}

fn normalize_key(address: &str) -> String {
    address
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[async_trait]
impl Geocoder for StaticGeocoder {
    async fn geocode(&self, address: &str) -> Result<GeocodeOutcome, GeocodeError> {
        Ok(match self.places.get(&normalize_key(address)) {
            Some(&(lat, lon)) => GeocodeOutcome::Found { lat, lon },
            None => GeocodeOutcome::NotFound,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_geocoder_matches_case_insensitively() {
        let g = StaticGeocoder::new([("Kebayoran Baru, Jakarta Selatan", (-6.24, 106.8))]);
        assert_eq!(
            g.geocode("kebayoran  baru, JAKARTA selatan").await.unwrap(),
            GeocodeOutcome::Found {
                lat: -6.24,
                lon: 106.8
            }
        );
        assert_eq!(
            g.geocode("Depok").await.unwrap(),
            GeocodeOutcome::NotFound
        );
    }
}
