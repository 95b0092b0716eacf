//! Core data models used throughout Rumah Harness.
//!
//! These types represent the raw documents, candidate records, canonical
//! listings, and stored listing records that flow through the ingestion
//! pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Current time truncated to millisecond precision.
///
/// Timestamps are persisted as epoch milliseconds, so every timestamp the
/// pipeline creates is truncated up front to compare equal after a
/// storage round-trip.
pub fn now_millis() -> DateTime<Utc> {
    truncate_millis(Utc::now())
}

/// Truncate a timestamp to millisecond precision.
pub fn truncate_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ts.timestamp_millis()).unwrap_or(ts)
}

/// A raw payload retrieved by the fetcher, kept for lineage and debugging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawDocument {
    pub id: String,
    pub source_id: String,
    pub fetched_at: DateTime<Utc>,
    pub url_or_query: String,
    pub content: String,
    pub http_status: u16,
}

/// One listing as found in a raw document, keyed by source-native field names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub source_id: String,
    pub fields: BTreeMap<String, String>,
    pub raw_document_ref: String,
    pub fetched_at: DateTime<Utc>,
}

impl CandidateRecord {
    pub fn new(doc: &RawDocument) -> Self {
        Self {
            source_id: doc.source_id.clone(),
            fields: BTreeMap::new(),
            raw_document_ref: doc.id.clone(),
            fetched_at: doc.fetched_at,
        }
    }

    /// Set a native field, ignoring blank values.
    pub fn set(&mut self, key: impl Into<String>, value: impl AsRef<str>) {
        let value = value.as_ref().trim();
        if !value.is_empty() {
            self.fields.insert(key.into(), value.to_string());
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }
}

/// Canonical property categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyType {
    House,
    Apartment,
    Land,
    Other,
}

impl PropertyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PropertyType::House => "house",
            PropertyType::Apartment => "apartment",
            PropertyType::Land => "land",
            PropertyType::Other => "other",
        }
    }
}

impl fmt::Display for PropertyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PropertyType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "house" => Ok(PropertyType::House),
            "apartment" => Ok(PropertyType::Apartment),
            "land" => Ok(PropertyType::Land),
            "other" => Ok(PropertyType::Other),
            other => Err(format!("unknown property type: '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub raw_address: String,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    /// Kecamatan the listing sits in, when the source names one.
    #[serde(default)]
    pub district: Option<String>,
}

/// A listing mapped onto the canonical schema.
///
/// Unknown numeric values are `None`; they are never coerced to zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedListing {
    pub price_idr: u64,
    pub area_sqm: Option<f64>,
    pub land_area_sqm: Option<f64>,
    pub bedrooms: Option<u32>,
    pub bathrooms: Option<u32>,
    pub location: Location,
    pub property_type: PropertyType,
    pub title: Option<String>,
    pub url: Option<String>,
    pub listed_at: Option<NaiveDate>,
    pub attributes: BTreeMap<String, String>,
    pub source_id: String,
    pub source_listing_id: String,
    pub observed_at: DateTime<Utc>,
    pub raw_document_ref: String,
}

impl NormalizedListing {
    /// Whether two listings carry identical canonical content.
    ///
    /// Observation time and lineage are not content.
    pub fn same_content(&self, other: &NormalizedListing) -> bool {
        self.price_idr == other.price_idr
            && self.area_sqm == other.area_sqm
            && self.land_area_sqm == other.land_area_sqm
            && self.bedrooms == other.bedrooms
            && self.bathrooms == other.bathrooms
            && self.location == other.location
            && self.property_type == other.property_type
            && self.title == other.title
            && self.url == other.url
            && self.listed_at == other.listed_at
            && self.attributes == other.attributes
    }
}

/// A price observation in a listing's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceChange {
    pub observed_at: DateTime<Utc>,
    pub price_idr: u64,
}

/// A listing as held by storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListingRecord {
    pub listing_id: String,
    pub fingerprint: String,
    pub current: NormalizedListing,
    pub history: Vec<PriceChange>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Link from a stored listing back to a raw document it was built from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineageEntry {
    pub listing_id: String,
    pub raw_document_ref: String,
    pub source_id: String,
    pub fetched_at: DateTime<Utc>,
    pub observed_at: DateTime<Utc>,
}

/// Outcome of reconciling a listing against storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "lowercase")]
pub enum Decision {
    New,
    Update {
        listing_id: String,
        expected_last_seen_at: DateTime<Utc>,
    },
    Duplicate {
        listing_id: String,
        expected_last_seen_at: DateTime<Utc>,
    },
}

impl Decision {
    pub fn label(&self) -> &'static str {
        match self {
            Decision::New => "new",
            Decision::Update { .. } => "update",
            Decision::Duplicate { .. } => "duplicate",
        }
    }
}

/// OpenStreetMap facility counts for one kecamatan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacilityCounts {
    pub kecamatan: String,
    pub education: u64,
    pub health: u64,
    pub shopping: u64,
    pub transport: u64,
    pub recreation: u64,
    pub updated_at: DateTime<Utc>,
}

/// Pagination cursor for one (source, query) pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Checkpoint {
    pub source_id: String,
    pub query: String,
    pub next_page: u32,
    pub updated_at: DateTime<Utc>,
}

/// A failure reported in a run summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordError {
    pub kind: String,
    pub context: String,
}

/// Per-run outcome counts handed back to the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub source_id: String,
    pub records_seen: u64,
    pub new: u64,
    pub updated: u64,
    pub duplicates: u64,
    pub skipped: u64,
    pub errors: Vec<RecordError>,
}

impl RunSummary {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            ..Default::default()
        }
    }

    pub fn record_decision(&mut self, decision: &Decision) {
        match decision {
            Decision::New => self.new += 1,
            Decision::Update { .. } => self.updated += 1,
            Decision::Duplicate { .. } => self.duplicates += 1,
        }
    }

    pub fn record_error(&mut self, kind: impl Into<String>, context: impl Into<String>) {
        self.errors.push(RecordError {
            kind: kind.into(),
            context: context.into(),
        });
    }

    /// Fold another summary's counts into this one.
    pub fn merge(&mut self, other: RunSummary) {
        self.records_seen += other.records_seen;
        self.new += other.new;
        self.updated += other.updated;
        self.duplicates += other.duplicates;
        self.skipped += other.skipped;
        self.errors.extend(other.errors);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn property_type_round_trips_through_str() {
        for pt in [
            PropertyType::House,
            PropertyType::Apartment,
            PropertyType::Land,
            PropertyType::Other,
        ] {
            assert_eq!(pt.as_str().parse::<PropertyType>().unwrap(), pt);
        }
        assert!("villa".parse::<PropertyType>().is_err());
    }

    #[test]
    fn candidate_set_ignores_blank_values() {
        let doc = RawDocument {
            id: "doc-1".to_string(),
            source_id: "rumah123".to_string(),
            fetched_at: now_millis(),
            url_or_query: "https://example.test".to_string(),
            content: String::new(),
            http_status: 200,
        };
        let mut rec = CandidateRecord::new(&doc);
        rec.set("harga", "  Rp 1 M ");
        rec.set("luas_tanah", "   ");
        assert_eq!(rec.get("harga"), Some("Rp 1 M"));
        assert_eq!(rec.get("luas_tanah"), None);
        assert_eq!(rec.raw_document_ref, "doc-1");
    }

    #[test]
    fn summary_merge_adds_counts() {
        let mut a = RunSummary::new("s");
        a.records_seen = 2;
        a.record_decision(&Decision::New);
        let mut b = RunSummary::new("s");
        b.records_seen = 3;
        b.record_error("invalid_value", "area_sqm");
        a.merge(b);
        assert_eq!(a.records_seen, 5);
        assert_eq!(a.new, 1);
        assert_eq!(a.errors.len(), 1);
    }

    #[test]
    fn now_millis_has_no_sub_millisecond_part() {
        let ts = now_millis();
        assert_eq!(ts.timestamp_subsec_nanos() % 1_000_000, 0);
    }
}
