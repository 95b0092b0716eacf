//! Geocoder backends and the per-run address cache.
//!
//! [`NominatimGeocoder`] queries an OpenStreetMap Nominatim instance,
//! throttled by its own `governor` limiter since public instances allow
//! about one request per second. [`CachedGeocoder`] wraps any geocoder so
//! concurrent lookups of the same address share one provider call.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::debug;

use rumah_harness_core::geocode::{GeocodeError, GeocodeOutcome, Geocoder, NoGeocoder};

use crate::config::{FetchConfig, GeocodingConfig};

#[derive(Debug, Deserialize)]
struct NominatimPlace {
    lat: String,
    lon: String,
}

pub struct NominatimGeocoder {
    client: reqwest::Client,
    base_url: String,
    country_codes: String,
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl NominatimGeocoder {
    pub fn new(config: &GeocodingConfig, fetch: &FetchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(fetch.timeout_secs))
            .user_agent(fetch.user_agent.clone())
            .build()?;
        let quota = Quota::with_period(Duration::from_millis(config.min_interval_ms))
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN));
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            country_codes: config.country_codes.clone(),
            limiter: RateLimiter::direct(quota),
        })
    }
}

/// First result of a Nominatim `/search` response.
fn parse_places(body: &str) -> Result<GeocodeOutcome, GeocodeError> {
    let places: Vec<NominatimPlace> =
        serde_json::from_str(body).map_err(|e| GeocodeError(format!("bad response: {}", e)))?;
    let Some(place) = places.first() else {
        return Ok(GeocodeOutcome::NotFound);
    };
    match (place.lat.parse::<f64>(), place.lon.parse::<f64>()) {
        (Ok(lat), Ok(lon)) => Ok(GeocodeOutcome::Found { lat, lon }),
        _ => Err(GeocodeError(format!(
            "unparseable coordinates {}/{}",
            place.lat, place.lon
        ))),
    }
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    async fn geocode(&self, address: &str) -> Result<GeocodeOutcome, GeocodeError> {
        self.limiter.until_ready().await;
        let resp = self
            .client
            .get(format!("{}/search", self.base_url))
            .query(&[
                ("format", "json"),
                ("q", address),
                ("countrycodes", self.country_codes.as_str()),
                ("limit", "1"),
            ])
            .send()
            .await
            .map_err(|e| GeocodeError(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(GeocodeError(format!("HTTP {}", resp.status().as_u16())));
        }
        let body = resp.text().await.map_err(|e| GeocodeError(e.to_string()))?;
        parse_places(&body)
    }
}

/// Memoizes successful lookups by normalized address.
///
/// Provider errors are not cached, so a later record retries the address.
pub struct CachedGeocoder {
    inner: Arc<dyn Geocoder>,
    cache: DashMap<String, Arc<OnceCell<GeocodeOutcome>>>,
}

impl CachedGeocoder {
    pub fn new(inner: Arc<dyn Geocoder>) -> Self {
        Self {
            inner,
            cache: DashMap::new(),
        }
    }

    pub fn cached_len(&self) -> usize {
        self.cache.iter().filter(|e| e.value().initialized()).count()
    }
}

fn cache_key(address: &str) -> String {
    address
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[async_trait]
impl Geocoder for CachedGeocoder {
    async fn geocode(&self, address: &str) -> Result<GeocodeOutcome, GeocodeError> {
        // Clone the cell out so the map shard lock is not held across await.
        let cell = self
            .cache
            .entry(cache_key(address))
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();
        if let Some(hit) = cell.get() {
            debug!(address, "geocode cache hit");
            return Ok(*hit);
        }
        cell.get_or_try_init(|| self.inner.geocode(address))
            .await
            .copied()
    }
}

/// Geocoder for the configured provider, wrapped in a cache.
pub fn from_config(config: &GeocodingConfig, fetch: &FetchConfig) -> Result<Arc<dyn Geocoder>> {
    let inner: Arc<dyn Geocoder> = if config.is_enabled() {
        Arc::new(NominatimGeocoder::new(config, fetch)?)
    } else {
        Arc::new(NoGeocoder)
    };
    Ok(Arc::new(CachedGeocoder::new(inner)))
}
