//! Candidate-to-canonical normalization.
//!
//! Maps source-native [`CandidateRecord`] fields onto a
//! [`NormalizedListing`]:
//!
//! | Canonical field | Rule |
//! |-----------------|------|
//! | `price_idr` | Currency text → integer rupiah, locale-aware, with Indonesian magnitude words |
//! | `area_sqm` | Area text → square meters through the unit table |
//! | `bedrooms`, `bathrooms` | Leading integer |
//! | `location` | Address parts joined, then geocoded (best-effort) |
//! | `property_type` | Canonical vocabulary, unmapped → `other` |
//!
//! Everything except the geocoder call is a pure function of the
//! candidate and the rules, so the same candidate always produces the same
//! listing.
//!
//! # Example
//!
//! ```rust
//! use rumah_harness_core::normalize::{parse_area_sqm, parse_price_idr, NormalizeRules, NumberLocale};
//!
//! assert_eq!(parse_price_idr("Rp 1.250.000.000", NumberLocale::Indonesian), Some(1_250_000_000));
//! assert_eq!(parse_price_idr("Rp 1,25 Miliar", NumberLocale::Indonesian), Some(1_250_000_000));
//! let rules = NormalizeRules::default();
//! assert_eq!(parse_area_sqm("1.5 are", &rules, NumberLocale::Indonesian), Some(150.0));
//! assert_eq!(parse_area_sqm("36.375 m2", &rules, NumberLocale::English), Some(36.375));
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::NormalizeError;
use crate::geocode::{GeocodeOutcome, Geocoder};
use crate::models::{CandidateRecord, Location, NormalizedListing, PropertyType};

/// Digit grouping convention used by a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum NumberLocale {
    /// `1.250.000,50`
    #[default]
    #[serde(rename = "id")]
    Indonesian,
    /// `1,250,000.50`
    #[serde(rename = "en")]
    English,
}

impl NumberLocale {
    /// `(thousands, decimal)` separators.
    fn separators(&self) -> (char, char) {
        match self {
            NumberLocale::Indonesian => ('.', ','),
            NumberLocale::English => (',', '.'),
        }
    }
}

/// Unit table and property-type vocabulary.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizeRules {
    /// Unit name (lowercase, no whitespace) → square meters per unit.
    pub units: BTreeMap<String, f64>,
    /// Lowercase source term → canonical type.
    pub property_types: BTreeMap<String, PropertyType>,
    /// Unit assumed when an area value carries none.
    pub default_area_unit: String,
}

impl Default for NormalizeRules {
    fn default() -> Self {
        let units = [
            ("m", 1.0),
            ("m2", 1.0),
            ("m²", 1.0),
            ("sqm", 1.0),
            ("meter", 1.0),
            ("meterpersegi", 1.0),
            ("are", 100.0),
            ("ha", 10_000.0),
            ("hektar", 10_000.0),
            ("hektare", 10_000.0),
            ("km2", 1_000_000.0),
            ("km²", 1_000_000.0),
            // Traditional Javanese/Sundanese land units.
            ("tumbak", 14.0),
            ("bata", 14.0),
            ("sqft", 0.092_903),
            ("ft2", 0.092_903),
        ];
        let property_types = [
            ("rumah", PropertyType::House),
            ("house", PropertyType::House),
            ("rumah tinggal", PropertyType::House),
            ("villa", PropertyType::House),
            ("townhouse", PropertyType::House),
            ("apartemen", PropertyType::Apartment),
            ("apartement", PropertyType::Apartment),
            ("apartment", PropertyType::Apartment),
            ("kondominium", PropertyType::Apartment),
            ("condominium", PropertyType::Apartment),
            ("tanah", PropertyType::Land),
            ("kavling", PropertyType::Land),
            ("lahan", PropertyType::Land),
            ("land", PropertyType::Land),
        ];
        Self {
            units: units
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            property_types: property_types
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
            default_area_unit: "m2".to_string(),
        }
    }
}

impl NormalizeRules {
    /// Defaults extended (or overridden) by configured entries.
    pub fn with_additions(
        units: &BTreeMap<String, f64>,
        property_types: &BTreeMap<String, PropertyType>,
    ) -> Self {
        let mut rules = Self::default();
        for (unit, factor) in units {
            rules.units.insert(unit_key(unit), *factor);
        }
        for (term, pt) in property_types {
            rules.property_types.insert(vocab_key(term), *pt);
        }
        rules
    }

    pub fn unit_factor(&self, unit: &str) -> Option<f64> {
        self.units.get(&unit_key(unit)).copied()
    }

    /// Map a source term onto the vocabulary; unknown terms become `other`.
    pub fn property_type(&self, raw: &str) -> PropertyType {
        self.property_types
            .get(&vocab_key(raw))
            .copied()
            .unwrap_or(PropertyType::Other)
    }
}

fn unit_key(unit: &str) -> String {
    unit.chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .trim_end_matches('.')
        .to_lowercase()
}

fn vocab_key(term: &str) -> String {
    term.replace(['-', '_'], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Canonical field → ordered native keys; the first present key wins.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct FieldMap {
    pub listing_id: Vec<String>,
    pub price: Vec<String>,
    pub area: Vec<String>,
    pub land_area: Vec<String>,
    pub bedrooms: Vec<String>,
    pub bathrooms: Vec<String>,
    /// All present parts are joined with `", "`.
    pub address: Vec<String>,
    /// Kecamatan key, used to join facility counts.
    pub district: Vec<String>,
    pub property_type: Vec<String>,
    pub title: Vec<String>,
    pub url: Vec<String>,
    pub listed_at: Vec<String>,
    /// Passed through verbatim into `attributes`.
    pub attributes: Vec<String>,
}

fn keys(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

impl Default for FieldMap {
    fn default() -> Self {
        Self {
            listing_id: keys(&["id"]),
            price: keys(&["price"]),
            area: keys(&["building_area", "area"]),
            land_area: keys(&["land_area"]),
            bedrooms: keys(&["bedrooms"]),
            bathrooms: keys(&["bathrooms"]),
            address: keys(&["address", "district", "city", "province"]),
            district: keys(&["district"]),
            property_type: keys(&["property_type", "type"]),
            title: keys(&["title"]),
            url: keys(&["url"]),
            listed_at: keys(&["updated_at", "listed_at"]),
            attributes: Vec::new(),
        }
    }
}

impl FieldMap {
    /// Native keys produced by the Rumah123 extractor.
    pub fn rumah123() -> Self {
        Self {
            listing_id: keys(&["listing_id"]),
            price: keys(&["harga"]),
            area: keys(&["luas_bangunan"]),
            land_area: keys(&["luas_tanah"]),
            bedrooms: keys(&["kamar_tidur"]),
            bathrooms: keys(&["kamar_mandi"]),
            address: keys(&["kecamatan", "kabupaten_kota", "provinsi"]),
            district: keys(&["kecamatan"]),
            property_type: keys(&["tipe_properti"]),
            title: keys(&["judul_iklan"]),
            url: keys(&["link_rumah123"]),
            listed_at: keys(&["terakhir_diperbarui"]),
            attributes: keys(&[
                "agen",
                "sertifikat",
                "daya_listrik",
                "carport",
                "garasi",
                "jumlah_lantai",
                "kondisi_perabotan",
                "kondisi_properti",
                "material_bangunan",
                "material_lantai",
                "sumber_air",
                "lebar_jalan",
                "tahun_dibangun",
                "tahun_direnovasi",
                "hook",
            ]),
        }
    }
}

fn first<'a>(rec: &'a CandidateRecord, keys: &[String]) -> Option<&'a str> {
    keys.iter().find_map(|k| rec.get(k))
}

/// Maps candidates from one source onto the canonical schema.
pub struct Normalizer {
    rules: NormalizeRules,
    field_map: FieldMap,
    locale: NumberLocale,
    geocoder: Arc<dyn Geocoder>,
}

impl Normalizer {
    pub fn new(
        rules: NormalizeRules,
        field_map: FieldMap,
        locale: NumberLocale,
        geocoder: Arc<dyn Geocoder>,
    ) -> Self {
        Self {
            rules,
            field_map,
            locale,
            geocoder,
        }
    }

    /// Normalize a candidate, then resolve its coordinates.
    ///
    /// A geocoder miss or failure leaves `lat`/`lon` unknown.
    pub async fn normalize(
        &self,
        rec: &CandidateRecord,
    ) -> Result<NormalizedListing, NormalizeError> {
        let mut listing = self.normalize_fields(rec)?;
        let address = listing.location.raw_address.clone();
        if address.is_empty() {
            return Ok(listing);
        }
        match self.geocoder.geocode(&address).await {
            Ok(GeocodeOutcome::Found { lat, lon }) => {
                listing.location.lat = Some(lat);
                listing.location.lon = Some(lon);
            }
            Ok(GeocodeOutcome::NotFound) => {
                debug!(address = %address, "address not found by geocoder");
            }
            Err(e) => {
                warn!(address = %address, error = %e, "geocoding failed, coordinates left unknown");
            }
        }
        Ok(listing)
    }

    /// Field mapping without geocoding. Coordinates are left unknown.
    pub fn normalize_fields(
        &self,
        rec: &CandidateRecord,
    ) -> Result<NormalizedListing, NormalizeError> {
        let fm = &self.field_map;

        let source_listing_id = first(rec, &fm.listing_id)
            .ok_or_else(|| NormalizeError::invalid("source_listing_id", ""))?;

        let price_raw =
            first(rec, &fm.price).ok_or_else(|| NormalizeError::invalid("price_idr", ""))?;
        let price_idr = parse_price_idr(price_raw, self.locale)
            .ok_or_else(|| NormalizeError::invalid("price_idr", price_raw))?;

        let area_sqm = self.optional_area(rec, &fm.area, "area_sqm")?;
        let land_area_sqm = self.optional_area(rec, &fm.land_area, "land_area_sqm")?;

        let bedrooms = optional_rooms(rec, &fm.bedrooms, "bedrooms")?;
        let bathrooms = optional_rooms(rec, &fm.bathrooms, "bathrooms")?;

        let mut parts: Vec<&str> = Vec::new();
        for key in &fm.address {
            if let Some(part) = rec.get(key) {
                if parts.last() != Some(&part) {
                    parts.push(part);
                }
            }
        }

        let property_type = first(rec, &fm.property_type)
            .map(|raw| self.rules.property_type(raw))
            .unwrap_or(PropertyType::Other);

        let attributes = fm
            .attributes
            .iter()
            .filter_map(|k| rec.get(k).map(|v| (k.clone(), v.to_string())))
            .collect();

        Ok(NormalizedListing {
            price_idr,
            // Land listings have no building; their plot is the area.
            area_sqm: area_sqm.or(land_area_sqm),
            land_area_sqm,
            bedrooms,
            bathrooms,
            location: Location {
                raw_address: parts.join(", "),
                lat: None,
                lon: None,
                district: first(rec, &fm.district).map(str::to_string),
            },
            property_type,
            title: first(rec, &fm.title).map(str::to_string),
            url: first(rec, &fm.url).map(str::to_string),
            listed_at: first(rec, &fm.listed_at).and_then(parse_listed_at),
            attributes,
            source_id: rec.source_id.clone(),
            source_listing_id: source_listing_id.to_string(),
            observed_at: rec.fetched_at,
            raw_document_ref: rec.raw_document_ref.clone(),
        })
    }

    fn optional_area(
        &self,
        rec: &CandidateRecord,
        keys: &[String],
        field: &str,
    ) -> Result<Option<f64>, NormalizeError> {
        match first(rec, keys) {
            Some(raw) => parse_area_sqm(raw, &self.rules, self.locale)
                .map(Some)
                .ok_or_else(|| NormalizeError::invalid(field, raw)),
            None => Ok(None),
        }
    }
}

fn optional_rooms(
    rec: &CandidateRecord,
    keys: &[String],
    field: &str,
) -> Result<Option<u32>, NormalizeError> {
    match first(rec, keys) {
        Some(raw) => parse_rooms(raw)
            .map(Some)
            .ok_or_else(|| NormalizeError::invalid(field, raw)),
        None => Ok(None),
    }
}

/// Parse a currency string into whole rupiah.
///
/// Plain numbers follow the source locale strictly. Numbers with a
/// magnitude word (`rb`, `jt`, `M`, `T` and their long forms) accept
/// either decimal separator.
pub fn parse_price_idr(raw: &str, locale: NumberLocale) -> Option<u64> {
    let lower = raw.trim().to_lowercase();
    let mut s = lower.as_str();
    for prefix in ["idr", "rp.", "rp"] {
        if let Some(rest) = s.strip_prefix(prefix) {
            s = rest;
            break;
        }
    }
    let s = s.trim();

    let end = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == ','))
        .unwrap_or(s.len());
    let (num, suffix) = s.split_at(end);
    if !num.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }

    let multiplier = magnitude(suffix.trim().trim_end_matches('.'))?;
    let (int, frac) = if multiplier == 1 {
        split_strict(num, locale)?
    } else {
        split_lenient(num)?
    };
    u64::try_from(scaled(&int, &frac, multiplier)?).ok()
}

fn magnitude(word: &str) -> Option<u128> {
    match word {
        "" => Some(1),
        "rb" | "ribu" | "k" => Some(1_000),
        "jt" | "juta" => Some(1_000_000),
        "m" | "miliar" | "milyar" | "b" | "bn" => Some(1_000_000_000),
        "t" | "triliun" => Some(1_000_000_000_000),
        _ => None,
    }
}

fn all_digits(s: &str) -> bool {
    s.chars().all(|c| c.is_ascii_digit())
}

/// Split on the locale's decimal separator, dropping thousands separators.
fn split_strict(num: &str, locale: NumberLocale) -> Option<(String, String)> {
    let (thousands, decimal) = locale.separators();
    let mut parts = num.split(decimal);
    let int_part = parts.next()?;
    let frac_part = parts.next().unwrap_or("");
    if parts.next().is_some() {
        return None;
    }
    let int_digits: String = int_part.chars().filter(|c| *c != thousands).collect();
    if !all_digits(&int_digits) || !all_digits(frac_part) {
        return None;
    }
    if int_digits.is_empty() && frac_part.is_empty() {
        return None;
    }
    Some((int_digits, frac_part.to_string()))
}

/// Split a number whose separator convention is unknown.
///
/// With both separators present the last one is the decimal point. A
/// single separator followed by exactly three digits groups thousands
/// (unless the integer part is zero); otherwise it is the decimal point.
fn split_lenient(num: &str) -> Option<(String, String)> {
    let has_dot = num.contains('.');
    let has_comma = num.contains(',');

    let decimal = if has_dot && has_comma {
        num.rfind(|c| c == '.' || c == ',')
            .and_then(|i| num[i..].chars().next())
    } else if has_dot || has_comma {
        let sep = if has_dot { '.' } else { ',' };
        if num.matches(sep).count() > 1 {
            None
        } else {
            let (int_part, frac) = num.split_once(sep)?;
            let grouping =
                frac.len() == 3 && !int_part.is_empty() && int_part.trim_start_matches('0') != "";
            if grouping {
                None
            } else {
                Some(sep)
            }
        }
    } else {
        None
    };

    let (int_part, frac) = match decimal {
        Some(d) => num.rsplit_once(d)?,
        None => (num, ""),
    };
    let int_digits: String = int_part
        .chars()
        .filter(|c| *c != '.' && *c != ',')
        .collect();
    if decimal.is_some_and(|d| int_part.contains(d)) {
        return None;
    }
    if !all_digits(&int_digits) || !all_digits(frac) {
        return None;
    }
    if int_digits.is_empty() && frac.is_empty() {
        return None;
    }
    Some((int_digits, frac.to_string()))
}

/// `(int + 0.frac) × multiplier`, truncated, in exact integer arithmetic.
fn scaled(int: &str, frac: &str, multiplier: u128) -> Option<u128> {
    let int_val: u128 = if int.is_empty() { 0 } else { int.parse().ok()? };
    let frac = &frac[..frac.len().min(18)];
    let frac_val: u128 = if frac.is_empty() { 0 } else { frac.parse().ok()? };
    let denom = 10u128.pow(frac.len() as u32);
    int_val
        .checked_mul(multiplier)?
        .checked_add(frac_val.checked_mul(multiplier)? / denom)
}

/// Parse an area string into square meters.
///
/// A leading `label:` is ignored. A value without a unit is in the
/// rules' default unit. Unknown units, missing digits, and non-positive
/// results yield `None`.
///
/// `en` sources (and JSON numbers, which always use `.`) parse strictly.
/// Indonesian listing text mixes conventions (`1.5 are`, `1.200 m²`), so the
/// `id` locale guesses the separator from its position.
pub fn parse_area_sqm(raw: &str, rules: &NormalizeRules, locale: NumberLocale) -> Option<f64> {
    let lower = raw.trim().to_lowercase();
    let s = match lower.rsplit_once(':') {
        Some((_, value)) => value.trim(),
        None => lower.trim(),
    };

    let start = s.find(|c: char| c.is_ascii_digit())?;
    if s[..start].chars().any(|c| c.is_alphanumeric()) {
        return None;
    }
    let rest = &s[start..];
    let end = rest
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == ','))
        .unwrap_or(rest.len());
    let (num, unit) = rest.split_at(end);

    let unit = unit_key(unit);
    let factor = if unit.is_empty() {
        rules.unit_factor(&rules.default_area_unit)?
    } else {
        rules.unit_factor(&unit)?
    };

    let (int, frac) = match locale {
        NumberLocale::English => split_strict(num, locale)?,
        NumberLocale::Indonesian => split_lenient(num)?,
    };
    let value: f64 = format!(
        "{}.{}",
        if int.is_empty() { "0" } else { &int },
        if frac.is_empty() { "0" } else { &frac }
    )
    .parse()
    .ok()?;

    let sqm = (value * factor * 10_000.0).round() / 10_000.0;
    (sqm.is_finite() && sqm > 0.0).then_some(sqm)
}

/// Leading integer of a room count (`"3"`, `"3 KT"`, `"3+1"` → 3).
pub fn parse_rooms(raw: &str) -> Option<u32> {
    let digits: String = raw
        .trim()
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Parse a source-reported listing date.
///
/// Accepts ISO dates, `dd/mm/yyyy`, `dd-mm-yyyy`, and Indonesian or
/// English month names (`12 Okt 2024`, `3 Agustus 2023`).
pub fn parse_listed_at(raw: &str) -> Option<NaiveDate> {
    let s = raw.trim();
    for fmt in ["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y"] {
        if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
            return Some(d);
        }
    }

    let parts: Vec<&str> = s.split_whitespace().collect();
    if parts.len() != 3 {
        return None;
    }
    let day: u32 = parts[0].parse().ok()?;
    let month_prefix: String = parts[1].to_lowercase().chars().take(3).collect();
    let month = match month_prefix.as_str() {
        "jan" => 1,
        "feb" => 2,
        "mar" => 3,
        "apr" => 4,
        "mei" | "may" => 5,
        "jun" => 6,
        "jul" => 7,
        "agu" | "agt" | "ags" | "aug" => 8,
        "sep" => 9,
        "okt" | "oct" => 10,
        "nov" => 11,
        "des" | "dec" => 12,
        _ => return None,
    };
    let year: i32 = parts[2].parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}
