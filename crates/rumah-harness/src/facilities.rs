//! OpenStreetMap facility counts per kecamatan.
//!
//! Every district found among stored listings gets one Overpass `out count`
//! query per [`FacilityCategory`], confined to the district's boundary
//! (`admin_level` 6 inside Indonesia by default). Requests go through a
//! [`Fetcher`], so Overpass sees the same throttling, retries, and
//! raw-document archiving as listing sources.
//!
//! | Category | OSM filters |
//! |----------|-------------|
//! | education | `amenity` school, university, college, kindergarten |
//! | health | `amenity` hospital, clinic, doctors, dentist, pharmacy |
//! | shopping | `shop` supermarket, mall, department_store, convenience; `amenity` marketplace, shopping_mall |
//! | transport | `amenity` bus_station, taxi, ferry_terminal; `aeroway` aerodrome, terminal; `railway` station, halt |
//! | recreation | `leisure` park, sports_centre, fitness_centre, swimming_pool; `amenity` park, theatre, cinema |
//!
//! Districts that already have counts are skipped unless a refresh is
//! requested. A district whose queries fail is reported in the summary and
//! left without counts; the next run tries it again.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use rumah_harness_core::error::{FetchError, StorageError};
use rumah_harness_core::models::{now_millis, FacilityCounts, RecordError};
use rumah_harness_core::store::ListingStore;

use crate::config::{Config, FacilitiesConfig, FetchConfig};
use crate::fetch::{Fetcher, HttpTransport, ReqwestTransport};
use crate::progress::format_number;
use crate::retry::RetryPolicy;
use crate::sqlite_store::SqliteStore;
use crate::{db, migrate};

/// Source id under which Overpass responses are archived.
pub const OVERPASS_SOURCE: &str = "overpass";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FacilityCategory {
    Education,
    Health,
    Shopping,
    Transport,
    Recreation,
}

impl FacilityCategory {
    pub const ALL: [FacilityCategory; 5] = [
        FacilityCategory::Education,
        FacilityCategory::Health,
        FacilityCategory::Shopping,
        FacilityCategory::Transport,
        FacilityCategory::Recreation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FacilityCategory::Education => "education",
            FacilityCategory::Health => "health",
            FacilityCategory::Shopping => "shopping",
            FacilityCategory::Transport => "transport",
            FacilityCategory::Recreation => "recreation",
        }
    }

    /// Overpass tag filters; a feature matching any of them counts once.
    pub fn filters(&self) -> &'static [&'static str] {
        match self {
            FacilityCategory::Education => {
                &[r#"amenity~"^(school|university|college|kindergarten)$""#]
            }
            FacilityCategory::Health => {
                &[r#"amenity~"^(hospital|clinic|doctors|dentist|pharmacy)$""#]
            }
            FacilityCategory::Shopping => &[
                r#"shop~"^(supermarket|mall|department_store|convenience)$""#,
                r#"amenity~"^(marketplace|shopping_mall)$""#,
            ],
            FacilityCategory::Transport => &[
                r#"amenity~"^(bus_station|taxi|ferry_terminal)$""#,
                r#"aeroway~"^(aerodrome|terminal)$""#,
                r#"railway~"^(station|halt)$""#,
            ],
            FacilityCategory::Recreation => &[
                r#"leisure~"^(park|sports_centre|fitness_centre|swimming_pool)$""#,
                r#"amenity~"^(park|theatre|cinema)$""#,
            ],
        }
    }
}

#[derive(Debug, Error)]
pub enum FacilityError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("unexpected Overpass response: {0}")]
    BadResponse(String),
}

impl FacilityError {
    pub fn kind(&self) -> &'static str {
        match self {
            FacilityError::Fetch(e) => e.kind(),
            FacilityError::BadResponse(_) => "bad_response",
        }
    }
}

/// Escape a value for use inside an Overpass QL string literal.
fn quote(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Overpass QL counting every feature of `category` inside `kecamatan`.
pub fn overpass_query(
    config: &FacilitiesConfig,
    kecamatan: &str,
    category: FacilityCategory,
) -> String {
    let selectors: String = category
        .filters()
        .iter()
        .map(|f| format!("nwr[{}](area.searchArea);", f))
        .collect();
    format!(
        "[out:json][timeout:{timeout}];\
         area[\"name\"=\"{country}\"][\"admin_level\"=\"2\"]->.country;\
         area[\"admin_level\"=\"{level}\"][\"name\"=\"{name}\"](area.country)->.searchArea;\
         ({selectors});out count;",
        timeout = config.query_timeout_secs,
        country = quote(&config.country),
        level = config.admin_level,
        name = quote(kecamatan),
        selectors = selectors,
    )
}

/// GET form of an interpreter request: the query travels as `data`.
pub fn query_url(base_url: &str, query: &str) -> Result<String, FacilityError> {
    url::Url::parse_with_params(base_url, &[("data", query)])
        .map(String::from)
        .map_err(|e| {
            FacilityError::BadResponse(format!("bad interpreter URL {}: {}", base_url, e))
        })
}

#[derive(Debug, Deserialize)]
struct OverpassResponse {
    #[serde(default)]
    elements: Vec<OverpassElement>,
    remark: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OverpassElement {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    tags: HashMap<String, String>,
}

/// Feature count from an Overpass JSON response.
///
/// `out count` yields one `count` element whose `total` tag holds the
/// answer. A `remark` without it means the server gave up on the query.
pub fn parse_count(body: &str) -> Result<u64, FacilityError> {
    let resp: OverpassResponse = serde_json::from_str(body)
        .map_err(|e| FacilityError::BadResponse(format!("not JSON: {}", e)))?;

    if let Some(count) = resp.elements.iter().find(|e| e.kind == "count") {
        let total = count
            .tags
            .get("total")
            .ok_or_else(|| FacilityError::BadResponse("count element without total".into()))?;
        return total
            .parse()
            .map_err(|_| FacilityError::BadResponse(format!("non-numeric total '{}'", total)));
    }
    if let Some(remark) = resp.remark {
        return Err(FacilityError::BadResponse(remark));
    }
    Ok(resp.elements.len() as u64)
}

/// Outcome of one enrichment pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FacilitySummary {
    pub districts: u64,
    pub enriched: u64,
    /// Districts that already had counts.
    pub skipped: u64,
    pub errors: Vec<RecordError>,
}

pub struct FacilityEnricher {
    config: FacilitiesConfig,
    fetcher: Fetcher,
    store: Arc<dyn ListingStore>,
    cancel: CancellationToken,
}

impl FacilityEnricher {
    pub fn new(
        config: FacilitiesConfig,
        fetch: &FetchConfig,
        transport: Arc<dyn HttpTransport>,
        store: Arc<dyn ListingStore>,
    ) -> Self {
        let fetcher = Fetcher::new(
            OVERPASS_SOURCE,
            transport,
            store.clone(),
            RetryPolicy::new(
                fetch.max_attempts,
                Duration::from_millis(fetch.base_delay_ms),
                Duration::from_millis(fetch.max_delay_ms),
            ),
            Duration::from_millis(config.min_interval_ms),
        );
        Self {
            config,
            fetcher,
            store,
            cancel: CancellationToken::new(),
        }
    }

    /// Production wiring: a reqwest transport whose client timeout outlasts
    /// the server-side query timeout.
    pub fn from_config(config: &Config, store: Arc<dyn ListingStore>) -> Result<Self> {
        let mut fetch = config.fetch.clone();
        fetch.timeout_secs = fetch
            .timeout_secs
            .max(config.facilities.query_timeout_secs + 10);
        let transport: Arc<dyn HttpTransport> = Arc::new(ReqwestTransport::new(&fetch)?);
        Ok(Self::new(
            config.facilities.clone(),
            &config.fetch,
            transport,
            store,
        ))
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Count every category for one kecamatan.
    pub async fn counts_for(&self, kecamatan: &str) -> Result<FacilityCounts, FacilityError> {
        let mut counts = FacilityCounts {
            kecamatan: kecamatan.to_string(),
            education: 0,
            health: 0,
            shopping: 0,
            transport: 0,
            recreation: 0,
            updated_at: now_millis(),
        };
        for category in FacilityCategory::ALL {
            let query = overpass_query(&self.config, kecamatan, category);
            let url = query_url(&self.config.base_url, &query)?;
            let doc = self.fetcher.fetch(&url).await?;
            let n = parse_count(&doc.content)?;
            debug!(kecamatan, category = category.as_str(), count = n, "facility count");
            match category {
                FacilityCategory::Education => counts.education = n,
                FacilityCategory::Health => counts.health = n,
                FacilityCategory::Shopping => counts.shopping = n,
                FacilityCategory::Transport => counts.transport = n,
                FacilityCategory::Recreation => counts.recreation = n,
            }
        }
        counts.updated_at = now_millis();
        Ok(counts)
    }

    /// Fetch and store counts for `districts`, or for every district of
    /// stored listings when the slice is empty.
    ///
    /// Only a failing store aborts the pass.
    pub async fn run(
        &self,
        districts: &[String],
        refresh: bool,
    ) -> Result<FacilitySummary, StorageError> {
        let districts = if districts.is_empty() {
            self.store.districts().await?
        } else {
            districts.to_vec()
        };
        let mut summary = FacilitySummary {
            districts: districts.len() as u64,
            ..Default::default()
        };

        for kecamatan in &districts {
            if self.cancel.is_cancelled() {
                info!("facility enrichment cancelled");
                break;
            }
            if !refresh && self.store.facilities(kecamatan).await?.is_some() {
                debug!(kecamatan = %kecamatan, "facility counts already stored");
                summary.skipped += 1;
                continue;
            }
            match self.counts_for(kecamatan).await {
                Ok(counts) => {
                    self.store.put_facilities(&counts).await?;
                    info!(kecamatan = %kecamatan, "facility counts stored");
                    summary.enriched += 1;
                }
                Err(FacilityError::Fetch(FetchError::Archive(e))) => return Err(e),
                Err(e) => {
                    warn!(kecamatan = %kecamatan, error = %e, "facility counts unavailable");
                    summary.errors.push(RecordError {
                        kind: e.kind().to_string(),
                        context: format!("{}: {}", kecamatan, e),
                    });
                }
            }
        }
        Ok(summary)
    }
}

/// CLI entry point for `rumah facilities`.
pub async fn run_facilities(
    config: &Config,
    districts: &[String],
    refresh: bool,
    json: bool,
) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::migrate_pool(&pool).await?;
    let store: Arc<dyn ListingStore> = Arc::new(SqliteStore::new(pool.clone()));
    let enricher = FacilityEnricher::from_config(config, store)?;

    let token = enricher.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current district");
            token.cancel();
        }
    });

    let summary = enricher.run(districts, refresh).await;
    pool.close().await;
    let summary = summary?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("Facilities summary");
        println!("  districts:   {}", format_number(summary.districts));
        println!("  enriched:    {}", format_number(summary.enriched));
        println!("  skipped:     {}", format_number(summary.skipped));
        println!("  errors:      {}", summary.errors.len());
        for e in &summary.errors {
            println!("    [{}] {}", e.kind, e.context);
        }
    }
    Ok(())
}
