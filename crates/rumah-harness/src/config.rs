//! TOML configuration parsing and validation.
//!
//! Every section except `[db]` is optional and falls back to defaults.
//!
//! ```toml
//! [db]
//! path = "./data/rumah.sqlite"
//!
//! [fetch]
//! max_attempts = 4
//! base_delay_ms = 1000
//!
//! [sources.rumah123]
//! kind = "rumah123"
//! min_interval_ms = 2000
//! queries = ["dki-jakarta", "jawa-barat"]
//! ```
//!
//! [`load_config`] rejects values that would stall or misconfigure the
//! pipeline (zero intervals, zero attempts, tolerances outside `(0, 1]`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use rumah_harness_core::models::PropertyType;
use rumah_harness_core::normalize::{FieldMap, NormalizeRules, NumberLocale};
use rumah_harness_core::reconcile::ReconcileConfig;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub geocoding: GeocodingConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub normalize: NormalizeConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub facilities: FacilitiesConfig,
    #[serde(default)]
    pub sources: BTreeMap<String, SourceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Bounds on the pipeline's own retries of storage failures.
#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Re-reconcile attempts after a write conflict.
    #[serde(default = "default_conflict_retries")]
    pub conflict_retries: u32,
    /// Attempts against an unavailable store before the run fails.
    #[serde(default = "default_storage_attempts")]
    pub storage_attempts: u32,
    #[serde(default = "default_storage_backoff_ms")]
    pub storage_backoff_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            conflict_retries: default_conflict_retries(),
            storage_attempts: default_storage_attempts(),
            storage_backoff_ms: default_storage_backoff_ms(),
        }
    }
}

fn default_conflict_retries() -> u32 {
    3
}
fn default_storage_attempts() -> u32 {
    3
}
fn default_storage_backoff_ms() -> u64 {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct FetchConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Total attempts per request, the first try included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            user_agent: default_user_agent(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    20
}
fn default_user_agent() -> String {
    "Mozilla/5.0".to_string()
}
fn default_max_attempts() -> u32 {
    4
}
fn default_base_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    30_000
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeocodingConfig {
    /// `disabled` or `nominatim`.
    #[serde(default = "default_geocoding_provider")]
    pub provider: String,
    #[serde(default = "default_geocoding_url")]
    pub base_url: String,
    #[serde(default = "default_geocoding_interval_ms")]
    pub min_interval_ms: u64,
    #[serde(default = "default_country_codes")]
    pub country_codes: String,
}

impl Default for GeocodingConfig {
    fn default() -> Self {
        Self {
            provider: default_geocoding_provider(),
            base_url: default_geocoding_url(),
            min_interval_ms: default_geocoding_interval_ms(),
            country_codes: default_country_codes(),
        }
    }
}

impl GeocodingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_geocoding_provider() -> String {
    "disabled".to_string()
}
fn default_geocoding_url() -> String {
    "https://nominatim.openstreetmap.org".to_string()
}
fn default_geocoding_interval_ms() -> u64 {
    1_000
}
fn default_country_codes() -> String {
    "id".to_string()
}

/// Additions to the built-in unit table and property vocabulary.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct NormalizeConfig {
    #[serde(default)]
    pub units: BTreeMap<String, f64>,
    #[serde(default)]
    pub property_types: BTreeMap<String, PropertyType>,
}

impl NormalizeConfig {
    pub fn rules(&self) -> NormalizeRules {
        NormalizeRules::with_additions(&self.units, &self.property_types)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetentionConfig {
    /// Raw documents older than this are eligible for `rumah purge`.
    #[serde(default = "default_raw_document_days")]
    pub raw_document_days: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            raw_document_days: default_raw_document_days(),
        }
    }
}

fn default_raw_document_days() -> u32 {
    30
}

/// Overpass endpoint used by `rumah facilities`.
#[derive(Debug, Deserialize, Clone)]
pub struct FacilitiesConfig {
    #[serde(default = "default_overpass_url")]
    pub base_url: String,
    #[serde(default = "default_overpass_interval_ms")]
    pub min_interval_ms: u64,
    /// OSM `admin_level` of a kecamatan boundary.
    #[serde(default = "default_admin_level")]
    pub admin_level: u8,
    /// Country area the kecamatan lookup is confined to.
    #[serde(default = "default_country")]
    pub country: String,
    /// Server-side `[timeout:..]` for each query.
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,
}

impl Default for FacilitiesConfig {
    fn default() -> Self {
        Self {
            base_url: default_overpass_url(),
            min_interval_ms: default_overpass_interval_ms(),
            admin_level: default_admin_level(),
            country: default_country(),
            query_timeout_secs: default_query_timeout_secs(),
        }
    }
}

fn default_overpass_url() -> String {
    "https://overpass-api.de/api/interpreter".to_string()
}
fn default_overpass_interval_ms() -> u64 {
    2_000
}
fn default_admin_level() -> u8 {
    6
}
fn default_country() -> String {
    "Indonesia".to_string()
}
fn default_query_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Rumah123,
    JsonApi,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Rumah123 => "rumah123",
            SourceKind::JsonApi => "json_api",
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub kind: SourceKind,
    /// Site root for `rumah123`; unused by `json_api`.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Listing category path segment for `rumah123` (`rumah`, `apartemen`, `tanah`).
    #[serde(default = "default_category")]
    pub category: String,
    /// Request URL for `json_api`, with `{query}` and `{page}` placeholders.
    #[serde(default)]
    pub url_template: Option<String>,
    /// JSON pointer to the item array for `json_api`.
    #[serde(default = "default_items_pointer")]
    pub items_pointer: String,
    #[serde(default)]
    pub locale: NumberLocale,
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_pages_per_run")]
    pub pages_per_run: u32,
    /// Queries to run; `rumah123` defaults to every province.
    #[serde(default)]
    pub queries: Vec<String>,
    #[serde(default)]
    pub field_map: Option<FieldMap>,
    /// Fetch each listing's detail page and merge its attributes.
    #[serde(default)]
    pub follow_details: bool,
}

fn default_base_url() -> String {
    "https://www.rumah123.com".to_string()
}
fn default_category() -> String {
    "rumah".to_string()
}
fn default_items_pointer() -> String {
    "/items".to_string()
}
fn default_min_interval_ms() -> u64 {
    2_000
}
fn default_max_concurrency() -> usize {
    2
}
fn default_pages_per_run() -> u32 {
    1
}

/// Province slugs used in Rumah123 search URLs.
pub const RUMAH123_PROVINCES: &[&str] = &[
    "dki-jakarta",
    "jawa-barat",
    "banten",
    "jawa-timur",
    "jawa-tengah",
    "bali",
    "daerah-istimewa-yogyakarta",
    "sumatera-utara",
    "kepulauan-riau",
    "sulawesi-selatan",
    "kalimantan-timur",
    "riau",
    "lampung",
    "sumatera-selatan",
    "kalimantan-barat",
    "sulawesi-utara",
    "nusa-tenggara-barat",
    "nusa-tenggara-timur",
    "sumatera-barat",
    "kalimantan-selatan",
    "jambi",
    "kepulauan-bangka-belitung",
    "kalimantan-tengah",
    "papua",
    "aceh",
    "bengkulu",
    "papua-barat",
    "sulawesi-tengah",
    "sulawesi-tenggara",
    "gorontalo",
    "kalimantan-utara",
    "maluku-utara",
    "sulawesi-barat",
    "maluku",
];

impl SourceConfig {
    /// Configured queries, or the kind's defaults when none are set.
    ///
    /// A `json_api` source without queries runs one unfiltered query.
    pub fn effective_queries(&self) -> Vec<String> {
        if !self.queries.is_empty() {
            return self.queries.clone();
        }
        match self.kind {
            SourceKind::Rumah123 => RUMAH123_PROVINCES.iter().map(|p| p.to_string()).collect(),
            SourceKind::JsonApi => vec![String::new()],
        }
    }

    /// Configured field map, or the kind's built-in one.
    pub fn effective_field_map(&self) -> FieldMap {
        match (&self.field_map, self.kind) {
            (Some(map), _) => map.clone(),
            (None, SourceKind::Rumah123) => FieldMap::rumah123(),
            (None, SourceKind::JsonApi) => FieldMap::default(),
        }
    }
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

fn validate(config: &Config) -> Result<()> {
    // Fetch
    if config.fetch.max_attempts == 0 {
        bail!("fetch.max_attempts must be >= 1");
    }
    if config.fetch.base_delay_ms == 0 {
        bail!("fetch.base_delay_ms must be > 0");
    }
    if config.fetch.max_delay_ms < config.fetch.base_delay_ms {
        bail!("fetch.max_delay_ms must be >= fetch.base_delay_ms");
    }
    if config.fetch.timeout_secs == 0 {
        bail!("fetch.timeout_secs must be > 0");
    }

    // Pipeline
    if config.pipeline.storage_attempts == 0 {
        bail!("pipeline.storage_attempts must be >= 1");
    }

    // Reconcile
    let r = &config.reconcile;
    if !(r.threshold > 0.0 && r.threshold <= 1.0) {
        bail!("reconcile.threshold must be in (0.0, 1.0]");
    }
    for (name, tol) in [
        ("price_tolerance", r.price_tolerance),
        ("area_tolerance", r.area_tolerance),
    ] {
        if !(tol > 0.0 && tol <= 1.0) {
            bail!("reconcile.{} must be in (0.0, 1.0]", name);
        }
    }
    if [r.address_weight, r.price_weight, r.area_weight]
        .iter()
        .any(|w| *w < 0.0)
        || r.address_weight + r.price_weight + r.area_weight <= 0.0
    {
        bail!("reconcile weights must be non-negative and sum to > 0");
    }
    if r.fingerprint.area_granularity_sqm <= 0.0 {
        bail!("reconcile.fingerprint.area_granularity_sqm must be > 0");
    }
    if r.fingerprint.price_buckets_per_decade == 0 {
        bail!("reconcile.fingerprint.price_buckets_per_decade must be >= 1");
    }

    // Normalize
    for (unit, factor) in &config.normalize.units {
        if !factor.is_finite() || *factor <= 0.0 {
            bail!("normalize.units.{} must be a positive factor", unit);
        }
    }

    // Geocoding
    match config.geocoding.provider.as_str() {
        "disabled" | "nominatim" => {}
        other => bail!(
            "Unknown geocoding provider: '{}'. Must be disabled or nominatim.",
            other
        ),
    }
    if config.geocoding.is_enabled() && config.geocoding.min_interval_ms == 0 {
        bail!("geocoding.min_interval_ms must be > 0");
    }

    // Facilities
    let f = &config.facilities;
    if f.min_interval_ms == 0 {
        bail!("facilities.min_interval_ms must be > 0");
    }
    if f.query_timeout_secs == 0 {
        bail!("facilities.query_timeout_secs must be > 0");
    }
    if url::Url::parse(&f.base_url).is_err() {
        bail!("facilities.base_url is not a valid URL: '{}'", f.base_url);
    }

    // Sources
    for (name, source) in &config.sources {
        if source.min_interval_ms == 0 {
            bail!("sources.{}.min_interval_ms must be > 0", name);
        }
        if source.max_concurrency == 0 {
            bail!("sources.{}.max_concurrency must be >= 1", name);
        }
        if source.pages_per_run == 0 {
            bail!("sources.{}.pages_per_run must be >= 1", name);
        }
        if source.kind == SourceKind::JsonApi {
            match &source.url_template {
                Some(t) if t.contains("{page}") => {}
                Some(_) => bail!("sources.{}.url_template must contain {{page}}", name),
                None => bail!("sources.{}.url_template is required for kind json_api", name),
            }
            if !source.items_pointer.is_empty() && !source.items_pointer.starts_with('/') {
                bail!("sources.{}.items_pointer must be a JSON pointer", name);
            }
        }
    }

    Ok(())
}
