//! Rumah123 HTML extraction.
//!
//! Search-result pages list one card per listing
//! (`div.ui-organism-intersection__element`). Each card yields a candidate
//! with the site's own vocabulary:
//!
//! | Native key | Card source |
//! |------------|-------------|
//! | `listing_id` | Last path segment of the `/properti/...` link |
//! | `judul_iklan` | Link heading |
//! | `link_rumah123` | Absolute link |
//! | `harga` | Price element |
//! | `kecamatan`, `kabupaten_kota` | First and last part of the location line |
//! | `provinsi` | Province slug from the search URL |
//! | `luas_tanah`, `luas_bangunan`, `kamar_tidur`, `kamar_mandi` | `LT`/`LB`/`KT`/`KM` badges |
//!
//! Detail pages carry a label/value specification list (`<p>Label</p><p>Value</p>`)
//! plus price, location, and an "updated ... oleh <agent>" line; see
//! [`Rumah123Extractor::merge_detail`].

use anyhow::{anyhow, Result};
use scraper::{ElementRef, Html, Selector};
use tracing::debug;
use url::Url;

use rumah_harness_core::error::ExtractError;
use rumah_harness_core::models::{CandidateRecord, RawDocument};

const CARD: &str = "div.ui-organism-intersection__element";
const LINK: &str = "a[href^='/properti/']";
const TITLE: &str = "a[href^='/properti/'] h2";
const CARD_PRICE: &str = "[class*='price']";
const CARD_LOCATION: &str = "[class*='location']";
const CARD_ATTRIBUTE: &str = "[class*='attribute-info']";
const EMPTY_STATE: &str = "[class*='empty-state']";

const DETAIL_TITLE: &str = "h1";
const DETAIL_PRICE: &str = "span.text-primary.font-bold";
const DETAIL_LOCATION: &str = "p.text-xs.text-gray-500.mb-2";
const DETAIL_UPDATED: &str = "p.text-3xs.text-gray-400.mb-4";
const DETAIL_LABEL: &str = "p";

/// Detail-page specification labels and their native keys.
const DETAIL_LABELS: &[(&str, &str)] = &[
    ("kamar tidur", "kamar_tidur"),
    ("kamar mandi", "kamar_mandi"),
    ("luas tanah", "luas_tanah"),
    ("luas bangunan", "luas_bangunan"),
    ("tipe properti", "tipe_properti"),
    ("carport", "carport"),
    ("sertifikat", "sertifikat"),
    ("daya listrik", "daya_listrik"),
    ("kamar tidur pembantu", "kamar_tidur_pembantu"),
    ("kamar mandi pembantu", "kamar_mandi_pembantu"),
    ("dapur", "dapur"),
    ("ruang makan", "ruang_makan"),
    ("ruang tamu", "ruang_tamu"),
    ("kondisi perabotan", "kondisi_perabotan"),
    ("material bangunan", "material_bangunan"),
    ("material lantai", "material_lantai"),
    ("garasi", "garasi"),
    ("jumlah lantai", "jumlah_lantai"),
    ("konsep dan gaya rumah", "konsep_dan_gaya_rumah"),
    ("pemandangan", "pemandangan"),
    ("terjangkau internet", "terjangkau_internet"),
    ("lebar jalan", "lebar_jalan"),
    ("tahun dibangun", "tahun_dibangun"),
    ("tahun direnovasi", "tahun_direnovasi"),
    ("sumber air", "sumber_air"),
    ("hook", "hook"),
    ("kondisi properti", "kondisi_properti"),
];

/// Card badge abbreviations.
const CARD_BADGES: &[(&str, &str)] = &[
    ("lt", "luas_tanah"),
    ("lb", "luas_bangunan"),
    ("kt", "kamar_tidur"),
    ("km", "kamar_mandi"),
];

struct Selectors {
    card: Selector,
    link: Selector,
    title: Selector,
    card_price: Selector,
    card_location: Selector,
    card_attribute: Selector,
    empty_state: Selector,
    detail_title: Selector,
    detail_price: Selector,
    detail_location: Selector,
    detail_updated: Selector,
    detail_label: Selector,
}

fn parse(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| anyhow!("invalid selector {}: {}", css, e))
}

impl Selectors {
    fn new() -> Result<Self> {
        Ok(Self {
            card: parse(CARD)?,
            link: parse(LINK)?,
            title: parse(TITLE)?,
            card_price: parse(CARD_PRICE)?,
            card_location: parse(CARD_LOCATION)?,
            card_attribute: parse(CARD_ATTRIBUTE)?,
            empty_state: parse(EMPTY_STATE)?,
            detail_title: parse(DETAIL_TITLE)?,
            detail_price: parse(DETAIL_PRICE)?,
            detail_location: parse(DETAIL_LOCATION)?,
            detail_updated: parse(DETAIL_UPDATED)?,
            detail_label: parse(DETAIL_LABEL)?,
        })
    }
}

pub struct Rumah123Extractor {
    source_id: String,
    base_url: String,
    category: String,
    selectors: Selectors,
}

fn text_of(el: ElementRef<'_>) -> String {
    el.text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn first_text(root: ElementRef<'_>, selector: &Selector) -> Option<String> {
    root.select(selector)
        .map(text_of)
        .find(|t| !t.is_empty())
}

/// Split "Kebayoran Baru, Jakarta Selatan" into district and city.
fn set_location(rec: &mut CandidateRecord, location: &str) {
    let parts: Vec<&str> = location.split(',').map(str::trim).collect();
    if let Some(first) = parts.first() {
        rec.set("kecamatan", first);
    }
    if parts.len() > 1 {
        if let Some(last) = parts.last() {
            rec.set("kabupaten_kota", last);
        }
    }
}

fn listing_id_from_href(href: &str) -> Option<&str> {
    href.split(['?', '#'])
        .next()?
        .split('/')
        .rfind(|s| !s.is_empty())
}

impl Rumah123Extractor {
    pub fn new(source_id: &str, base_url: &str, category: &str) -> Result<Self> {
        Ok(Self {
            source_id: source_id.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            category: category.to_string(),
            selectors: Selectors::new()?,
        })
    }

    /// `{base}/jual/{province}/{category}/?page={page}`
    pub fn page_url(&self, query: &str, page: u32) -> String {
        format!(
            "{}/jual/{}/{}/?page={}",
            self.base_url, query, self.category, page
        )
    }

    /// Province slug from a search URL (`/jual/<province>/...`).
    fn province_of(url: &str) -> Option<String> {
        let url = Url::parse(url).ok()?;
        let mut segments = url.path_segments()?;
        segments.find(|s| *s == "jual")?;
        segments
            .next()
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }

    pub fn extract(&self, doc: &RawDocument) -> Result<Vec<CandidateRecord>, ExtractError> {
        let html = Html::parse_document(&doc.content);
        let root = html.root_element();
        let cards: Vec<ElementRef<'_>> = root.select(&self.selectors.card).collect();

        if cards.is_empty() {
            if root.select(&self.selectors.empty_state).next().is_some() {
                debug!(url = %doc.url_or_query, "empty result page");
                return Ok(Vec::new());
            }
            return Err(ExtractError::schema_drift(&self.source_id, CARD, &doc.content));
        }

        let province = Self::province_of(&doc.url_or_query);
        let mut out = Vec::with_capacity(cards.len());
        for card in &cards {
            let Some(href) = card
                .select(&self.selectors.link)
                .find_map(|a| a.value().attr("href"))
            else {
                debug!(url = %doc.url_or_query, "card without listing link skipped");
                continue;
            };
            let Some(listing_id) = listing_id_from_href(href) else {
                continue;
            };

            let mut rec = CandidateRecord::new(doc);
            rec.set("listing_id", listing_id);
            rec.set("link_rumah123", format!("{}{}", self.base_url, href));
            rec.set("tipe_properti", &self.category);
            if let Some(title) = first_text(*card, &self.selectors.title) {
                rec.set("judul_iklan", title);
            }
            if let Some(price) = first_text(*card, &self.selectors.card_price) {
                rec.set("harga", price);
            }
            if let Some(location) = first_text(*card, &self.selectors.card_location) {
                set_location(&mut rec, &location);
            }
            if let Some(province) = &province {
                rec.set("provinsi", province);
            }
            for badge in card.select(&self.selectors.card_attribute) {
                self.apply_badge(&mut rec, &text_of(badge));
            }
            out.push(rec);
        }

        if out.is_empty() {
            return Err(ExtractError::schema_drift(&self.source_id, LINK, &doc.content));
        }
        Ok(out)
    }

    /// `"LT : 150 m²"`, `"KT 3"` → native key and value.
    fn apply_badge(&self, rec: &mut CandidateRecord, text: &str) {
        let (label, value) = match text.split_once(':') {
            Some((l, v)) => (l.trim(), v.trim()),
            None => match text.split_once(' ') {
                Some((l, v)) => (l.trim(), v.trim()),
                None => return,
            },
        };
        let label = label.to_lowercase();
        if let Some((_, key)) = CARD_BADGES.iter().find(|(abbr, _)| *abbr == label) {
            rec.set(*key, value);
        }
    }

    /// The detail-page URL recorded on a candidate, if any.
    pub fn detail_url(candidate: &CandidateRecord) -> Option<&str> {
        candidate.get("link_rumah123")
    }

    /// Merge a listing detail page into its card-level candidate.
    ///
    /// Detail values override card values. The candidate keeps its
    /// original raw document reference.
    pub fn merge_detail(
        &self,
        candidate: &mut CandidateRecord,
        detail: &RawDocument,
    ) -> Result<(), ExtractError> {
        let html = Html::parse_document(&detail.content);
        let root = html.root_element();
        let s = &self.selectors;

        let title = first_text(root, &s.detail_title);
        let price = first_text(root, &s.detail_price);
        if title.is_none() && price.is_none() {
            return Err(ExtractError::schema_drift(
                &self.source_id,
                DETAIL_PRICE,
                &detail.content,
            ));
        }
        if let Some(title) = title {
            candidate.set("judul_iklan", title);
        }
        if let Some(price) = price {
            candidate.set("harga", price);
        }
        if let Some(location) = first_text(root, &s.detail_location) {
            set_location(candidate, &location);
        }
        if let Some(updated) = first_text(root, &s.detail_updated) {
            let (when, agent) = match updated.split_once("oleh") {
                Some((w, a)) => (w, Some(a.trim())),
                None => (updated.as_str(), None),
            };
            // Drop the leading verb ("Diperbarui", "Tayang sejak").
            let date = when
                .trim()
                .split_once(' ')
                .map(|(_, rest)| rest.trim())
                .unwrap_or("");
            candidate.set("terakhir_diperbarui", date);
            if let Some(agent) = agent {
                candidate.set("agen", agent);
            }
        }

        for label in root.select(&s.detail_label) {
            let name = text_of(label).to_lowercase();
            let Some((_, key)) = DETAIL_LABELS.iter().find(|(l, _)| *l == name) else {
                continue;
            };
            let value = label
                .next_siblings()
                .find_map(ElementRef::wrap)
                .filter(|sib| sib.value().name() == "p")
                .map(text_of);
            if let Some(value) = value {
                candidate.set(*key, value);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumah_harness_core::models::now_millis;

    const SEARCH_PAGE: &str = r#"
    <html><body>
      <div class="ui-organism-intersection__element">
        <a href="/properti/jakarta-selatan/hos12345678/"><h2>Rumah Asri di Kebayoran Baru</h2></a>
        <div class="card-featured__middle-section__price"><strong>Rp 3,5 Miliar</strong></div>
        <p class="card-featured__middle-section__location">Kebayoran Baru, Jakarta Selatan</p>
        <span class="attribute-info">KT 4</span>
        <span class="attribute-info">KM 3</span>
        <span class="attribute-info">LT : 200 m²</span>
        <span class="attribute-info">LB : 180 m²</span>
      </div>
      <div class="ui-organism-intersection__element">
        <div class="ad-banner">Iklan</div>
      </div>
      <div class="ui-organism-intersection__element">
        <a href="/properti/depok/hos87654321/"><h2>Rumah Minimalis Depok</h2></a>
        <div class="card-featured__middle-section__price"><strong>Rp 850 Juta</strong></div>
        <p class="card-featured__middle-section__location">Cimanggis, Depok</p>
        <span class="attribute-info">LT : 1.5 are</span>
      </div>
    </body></html>
    "#;

    const DETAIL_PAGE: &str = r#"
    <html><body>
      <h1>Rumah Asri di Kebayoran Baru, Siap Huni</h1>
      <span class="text-primary font-bold">Rp 3,45 Miliar</span>
      <p class="text-xs text-gray-500 mb-2">Kebayoran Baru, Jakarta Selatan</p>
      <p class="text-3xs text-gray-400 mb-4">Diperbarui 12 Okt 2024 oleh Budi Santoso</p>
      <div>
        <p>Kamar Tidur</p><p>4</p>
        <p>Kamar Tidur Pembantu</p><p>1</p>
        <p>Sertifikat</p><p>SHM - Sertifikat Hak Milik</p>
        <p>Daya Listrik</p><p>5500 Watt</p>
      </div>
    </body></html>
    "#;

    fn doc(url: &str, content: &str) -> RawDocument {
        RawDocument {
            id: "raw-1".to_string(),
            source_id: "rumah123".to_string(),
            fetched_at: now_millis(),
            url_or_query: url.to_string(),
            content: content.to_string(),
            http_status: 200,
        }
    }

    fn extractor() -> Rumah123Extractor {
        Rumah123Extractor::new("rumah123", "https://www.rumah123.com/", "rumah").unwrap()
    }

    #[test]
    fn page_url_follows_site_layout() {
        assert_eq!(
            extractor().page_url("dki-jakarta", 2),
            "https://www.rumah123.com/jual/dki-jakarta/rumah/?page=2"
        );
    }

    #[test]
    fn extracts_cards_in_document_order() {
        let d = doc(
            "https://www.rumah123.com/jual/dki-jakarta/rumah/?page=1",
            SEARCH_PAGE,
        );
        let recs = extractor().extract(&d).unwrap();
        assert_eq!(recs.len(), 2);

        let first = &recs[0];
        assert_eq!(first.get("listing_id"), Some("hos12345678"));
        assert_eq!(first.get("judul_iklan"), Some("Rumah Asri di Kebayoran Baru"));
        assert_eq!(first.get("harga"), Some("Rp 3,5 Miliar"));
        assert_eq!(first.get("kecamatan"), Some("Kebayoran Baru"));
        assert_eq!(first.get("kabupaten_kota"), Some("Jakarta Selatan"));
        assert_eq!(first.get("provinsi"), Some("dki-jakarta"));
        assert_eq!(first.get("kamar_tidur"), Some("4"));
        assert_eq!(first.get("luas_bangunan"), Some("180 m²"));
        assert_eq!(
            first.get("link_rumah123"),
            Some("https://www.rumah123.com/properti/jakarta-selatan/hos12345678/")
        );
        assert_eq!(first.raw_document_ref, "raw-1");

        assert_eq!(recs[1].get("listing_id"), Some("hos87654321"));
        assert_eq!(recs[1].get("luas_tanah"), Some("1.5 are"));
    }

    #[test]
    fn missing_cards_is_schema_drift() {
        let d = doc(
            "https://www.rumah123.com/jual/bali/rumah/?page=1",
            "<html><body><div class='new-layout'>listings</div></body></html>",
        );
        let err = extractor().extract(&d).unwrap_err();
        match err {
            ExtractError::SchemaDrift {
                anchor, snippet, ..
            } => {
                assert_eq!(anchor, CARD);
                assert!(snippet.contains("new-layout"));
            }
        }
    }

    #[test]
    fn empty_result_page_has_no_candidates() {
        let d = doc(
            "https://www.rumah123.com/jual/maluku/rumah/?page=9",
            "<html><body><div class='ui-empty-state'>Properti tidak ditemukan</div></body></html>",
        );
        assert!(extractor().extract(&d).unwrap().is_empty());
    }

    #[test]
    fn detail_page_overrides_card_values() {
        let e = extractor();
        let search = doc(
            "https://www.rumah123.com/jual/dki-jakarta/rumah/?page=1",
            SEARCH_PAGE,
        );
        let mut rec = e.extract(&search).unwrap().remove(0);
        let detail = doc(
            "https://www.rumah123.com/properti/jakarta-selatan/hos12345678/",
            DETAIL_PAGE,
        );
        e.merge_detail(&mut rec, &detail).unwrap();

        assert_eq!(rec.get("harga"), Some("Rp 3,45 Miliar"));
        assert_eq!(
            rec.get("judul_iklan"),
            Some("Rumah Asri di Kebayoran Baru, Siap Huni")
        );
        assert_eq!(rec.get("terakhir_diperbarui"), Some("12 Okt 2024"));
        assert_eq!(rec.get("agen"), Some("Budi Santoso"));
        assert_eq!(rec.get("sertifikat"), Some("SHM - Sertifikat Hak Milik"));
        assert_eq!(rec.get("daya_listrik"), Some("5500 Watt"));
        assert_eq!(rec.get("kamar_tidur"), Some("4"));
        assert_eq!(rec.get("kamar_tidur_pembantu"), Some("1"));
        assert_eq!(rec.raw_document_ref, "raw-1");
    }

    #[test]
    fn unrecognizable_detail_page_is_drift() {
        let e = extractor();
        let mut rec = CandidateRecord::new(&doc("u", ""));
        let detail = doc("u", "<html><body><div>captcha</div></body></html>");
        assert_eq!(
            e.merge_detail(&mut rec, &detail).unwrap_err().kind(),
            "schema_drift"
        );
    }
}
