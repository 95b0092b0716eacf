//! End-to-end pipeline runs against a scripted HTTP transport and the
//! in-memory store.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use rumah_harness::config::parse_config;
use rumah_harness::facilities::{overpass_query, query_url, FacilityCategory, FacilityEnricher};
use rumah_harness::fetch::{HttpResponse, HttpTransport, TransportError};
use rumah_harness::get::get_listing;
use rumah_harness::ingest::{Pipeline, PipelineError};
use rumah_harness_core::error::StorageError;
use rumah_harness_core::geocode::{Geocoder, NoGeocoder, StaticGeocoder};
use rumah_harness_core::models::{
    Checkpoint, FacilityCounts, LineageEntry, ListingRecord, NormalizedListing, RawDocument,
};
use rumah_harness_core::store::memory::InMemoryStore;
use rumah_harness_core::store::{ListingStore, UpsertOutcome};

const PAGE_1: &str = "https://www.rumah123.com/jual/dki-jakarta/rumah/?page=1";
const PAGE_2: &str = "https://www.rumah123.com/jual/dki-jakarta/rumah/?page=2";

const RUMAH123_CONFIG: &str = r#"
[db]
path = "unused.sqlite"

[pipeline]
conflict_retries = 2
storage_attempts = 2
storage_backoff_ms = 1

[fetch]
max_attempts = 3
base_delay_ms = 1
max_delay_ms = 5

[sources.rumah123]
kind = "rumah123"
queries = ["dki-jakarta"]
min_interval_ms = 1
pages_per_run = 2
"#;

// ============ Fixtures ============

#[derive(Default)]
struct ScriptedTransport {
    routes: Mutex<HashMap<String, VecDeque<HttpResponse>>>,
    requests: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    /// Queue a response; the last queued response repeats.
    fn push(&self, url: &str, status: u16, body: &str) {
        self.routes
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(HttpResponse {
                status,
                body: body.to_string(),
                retry_after: None,
            });
    }

    fn set(&self, url: &str, body: &str) {
        self.routes.lock().unwrap().remove(url);
        self.push(url, 200, body);
    }

    fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn get(&self, url: &str) -> Result<HttpResponse, TransportError> {
        self.requests.lock().unwrap().push(url.to_string());
        let mut routes = self.routes.lock().unwrap();
        let resp = match routes.get_mut(url) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        };
        Ok(resp.unwrap_or(HttpResponse {
            status: 404,
            body: String::new(),
            retry_after: None,
        }))
    }
}

/// Store wrapper that injects write conflicts or outages.
struct FaultyStore {
    inner: InMemoryStore,
    conflicts_left: AtomicU32,
    down: AtomicBool,
    upsert_calls: AtomicU32,
}

impl FaultyStore {
    fn new() -> Self {
        Self {
            inner: InMemoryStore::new(),
            conflicts_left: AtomicU32::new(0),
            down: AtomicBool::new(false),
            upsert_calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl ListingStore for FaultyStore {
    async fn find_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Vec<ListingRecord>, StorageError> {
        self.inner.find_by_fingerprint(fingerprint).await
    }

    async fn find_by_source_listing(
        &self,
        source_id: &str,
        source_listing_id: &str,
    ) -> Result<Option<ListingRecord>, StorageError> {
        self.inner
            .find_by_source_listing(source_id, source_listing_id)
            .await
    }

    async fn conditional_upsert(
        &self,
        listing_id: Option<&str>,
        listing: &NormalizedListing,
        fingerprint: &str,
        expected_last_seen_at: Option<DateTime<Utc>>,
    ) -> Result<UpsertOutcome, StorageError> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("database is locked".into()));
        }
        if self
            .conflicts_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Ok(UpsertOutcome::Conflict);
        }
        self.inner
            .conditional_upsert(listing_id, listing, fingerprint, expected_last_seen_at)
            .await
    }

    async fn touch(
        &self,
        listing_id: &str,
        listing: &NormalizedListing,
        expected_last_seen_at: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StorageError> {
        self.inner
            .touch(listing_id, listing, expected_last_seen_at)
            .await
    }

    async fn get_listing(&self, listing_id: &str) -> Result<Option<ListingRecord>, StorageError> {
        self.inner.get_listing(listing_id).await
    }

    async fn lineage(&self, listing_id: &str) -> Result<Vec<LineageEntry>, StorageError> {
        self.inner.lineage(listing_id).await
    }

    async fn put_raw_document(&self, doc: &RawDocument) -> Result<(), StorageError> {
        self.inner.put_raw_document(doc).await
    }

    async fn purge_raw_documents(&self, older_than: DateTime<Utc>) -> Result<u64, StorageError> {
        self.inner.purge_raw_documents(older_than).await
    }

    async fn checkpoint(
        &self,
        source_id: &str,
        query: &str,
    ) -> Result<Option<Checkpoint>, StorageError> {
        self.inner.checkpoint(source_id, query).await
    }

    async fn set_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StorageError> {
        self.inner.set_checkpoint(checkpoint).await
    }

    async fn districts(&self) -> Result<Vec<String>, StorageError> {
        self.inner.districts().await
    }

    async fn facilities(&self, kecamatan: &str) -> Result<Option<FacilityCounts>, StorageError> {
        self.inner.facilities(kecamatan).await
    }

    async fn put_facilities(&self, counts: &FacilityCounts) -> Result<(), StorageError> {
        self.inner.put_facilities(counts).await
    }
}

struct Card<'a> {
    id: &'a str,
    price: &'a str,
    location: &'a str,
    lt: &'a str,
    lb: &'a str,
}

fn card(c: &Card<'_>) -> String {
    format!(
        r#"<div class="ui-organism-intersection__element">
          <a href="/properti/jakarta/{id}/"><h2>Rumah {id}</h2></a>
          <div class="card-featured__middle-section__price"><strong>{price}</strong></div>
          <p class="card-featured__middle-section__location">{location}</p>
          <span class="attribute-info">KT 3</span>
          <span class="attribute-info">KM 2</span>
          <span class="attribute-info">LT : {lt}</span>
          <span class="attribute-info">LB : {lb}</span>
        </div>"#,
        id = c.id,
        price = c.price,
        location = c.location,
        lt = c.lt,
        lb = c.lb,
    )
}

fn page(cards: &[Card<'_>]) -> String {
    let body: String = cards.iter().map(card).collect();
    format!("<html><body>{}</body></html>", body)
}

const EMPTY_PAGE: &str =
    "<html><body><div class='ui-empty-state'>Properti tidak ditemukan</div></body></html>";

fn kebayoran(price: &'static str) -> Card<'static> {
    Card {
        id: "hos1",
        price,
        location: "Kebayoran Baru, Jakarta Selatan",
        lt: "200 m²",
        lb: "180 m²",
    }
}

fn pipeline_with(
    toml: &str,
    store: Arc<dyn ListingStore>,
    transport: Arc<ScriptedTransport>,
    geocoder: Arc<dyn Geocoder>,
) -> Pipeline {
    Pipeline::new(parse_config(toml).unwrap(), store, transport, geocoder)
}

fn pipeline(
    store: Arc<dyn ListingStore>,
    transport: Arc<ScriptedTransport>,
) -> Pipeline {
    pipeline_with(RUMAH123_CONFIG, store, transport, Arc::new(NoGeocoder))
}

// ============ Scenarios ============

#[tokio::test]
async fn repeated_card_on_a_page_is_one_new_and_one_duplicate() {
    let store = Arc::new(InMemoryStore::new());
    let transport = Arc::new(ScriptedTransport::default());
    transport.set(
        PAGE_1,
        &page(&[kebayoran("Rp 3,5 Miliar"), kebayoran("Rp 3,5 Miliar")]),
    );
    transport.set(PAGE_2, EMPTY_PAGE);

    let summary = pipeline(store.clone(), transport.clone())
        .run_pipeline("rumah123", &[], None)
        .await
        .unwrap();

    assert_eq!(summary.records_seen, 2);
    assert_eq!(summary.new, 1);
    assert_eq!(summary.updated, 0);
    assert_eq!(summary.duplicates, 1);
    assert!(summary.errors.is_empty(), "{:?}", summary.errors);

    let listings = store.listings().unwrap();
    assert_eq!(listings.len(), 1);
    let l = &listings[0].current;
    assert_eq!(l.price_idr, 3_500_000_000);
    assert_eq!(l.area_sqm, Some(180.0));
    assert_eq!(l.land_area_sqm, Some(200.0));
    assert_eq!(l.bedrooms, Some(3));
    assert_eq!(
        l.location.raw_address,
        "Kebayoran Baru, Jakarta Selatan, dki-jakarta"
    );

    // Page 2 was empty, so the query starts over next run.
    let cp = store.checkpoint("rumah123", "dki-jakarta").await.unwrap();
    assert_eq!(cp.map(|c| c.next_page), Some(1));
    assert_eq!(store.raw_document_count().unwrap(), 2);
    assert_eq!(transport.requests(), vec![PAGE_1, PAGE_2]);
}

#[tokio::test]
async fn known_listing_beside_a_new_one_is_a_duplicate() {
    let store = Arc::new(InMemoryStore::new());
    let transport = Arc::new(ScriptedTransport::default());
    transport.set(PAGE_1, &page(&[kebayoran("Rp 3,5 Miliar")]));
    transport.set(PAGE_2, EMPTY_PAGE);
    let p = pipeline(store.clone(), transport.clone());
    p.run_pipeline("rumah123", &[], None).await.unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let cilandak = Card {
        id: "hos8",
        price: "Rp 2,1 Miliar",
        location: "Cilandak, Jakarta Selatan",
        lt: "120 m²",
        lb: "150 m²",
    };
    transport.set(PAGE_1, &page(&[cilandak, kebayoran("Rp 3,5 Miliar")]));
    let summary = p.run_pipeline("rumah123", &[], None).await.unwrap();

    assert_eq!(summary.records_seen, 2);
    assert_eq!(summary.new, 1);
    assert_eq!(summary.updated, 0);
    assert_eq!(summary.duplicates, 1);
    assert!(summary.errors.is_empty(), "{:?}", summary.errors);
    assert_eq!(store.listing_count().unwrap(), 2);
}

#[tokio::test]
async fn neighbouring_listings_from_one_source_stay_separate() {
    let store = Arc::new(InMemoryStore::new());
    let transport = Arc::new(ScriptedTransport::default());
    let twin = Card {
        id: "hos2",
        price: "Rp 3,4 Miliar",
        location: "Kebayoran Baru, Jakarta Selatan",
        lt: "200 m²",
        lb: "180 m²",
    };
    transport.set(PAGE_1, &page(&[kebayoran("Rp 3,5 Miliar"), twin]));
    transport.set(PAGE_2, EMPTY_PAGE);
    let p = pipeline(store.clone(), transport);

    let first = p.run_pipeline("rumah123", &[], None).await.unwrap();
    assert_eq!(first.new, 2);
    assert_eq!(first.updated, 0);

    for _ in 0..2 {
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let again = p.run_pipeline("rumah123", &[], None).await.unwrap();
        assert_eq!(again.new, 0);
        assert_eq!(again.updated, 0);
        assert_eq!(again.duplicates, 2);
    }

    let listings = store.listings().unwrap();
    assert_eq!(listings.len(), 2);
    assert!(listings.iter().all(|l| l.history.len() == 1));
    for (id, price) in [("hos1", 3_500_000_000), ("hos2", 3_400_000_000)] {
        let rec = store
            .find_by_source_listing("rumah123", id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rec.current.price_idr, price);
    }
}

#[tokio::test]
async fn malformed_area_only_fails_its_own_record() {
    let store = Arc::new(InMemoryStore::new());
    let transport = Arc::new(ScriptedTransport::default());
    transport.set(
        PAGE_1,
        &page(&[
            kebayoran("Rp 3,5 Miliar"),
            Card {
                id: "hos2",
                price: "Rp 900 Juta",
                location: "Cilandak, Jakarta Selatan",
                lt: "90 m²",
                lb: "N/A",
            },
            Card {
                id: "hos3",
                price: "Rp 1,25 Miliar",
                location: "Cimanggis, Depok",
                lt: "1.5 are",
                lb: "100 m²",
            },
        ]),
    );
    transport.set(PAGE_2, EMPTY_PAGE);

    let summary = pipeline(store.clone(), transport)
        .run_pipeline("rumah123", &[], None)
        .await
        .unwrap();

    assert_eq!(summary.records_seen, 3);
    assert_eq!(summary.new, 2);
    assert_eq!(summary.errors.len(), 1);
    assert_eq!(summary.errors[0].kind, "invalid_value");
    assert!(summary.errors[0].context.contains("hos2"));

    let depok = store
        .find_by_source_listing("rumah123", "hos3")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(depok.current.land_area_sqm, Some(150.0));
    assert_eq!(depok.current.price_idr, 1_250_000_000);
}

#[tokio::test]
async fn price_change_appends_one_history_entry() {
    let store = Arc::new(InMemoryStore::new());
    let transport = Arc::new(ScriptedTransport::default());
    transport.set(PAGE_1, &page(&[kebayoran("Rp 3,5 Miliar")]));
    transport.set(PAGE_2, EMPTY_PAGE);
    let p = pipeline(store.clone(), transport.clone());

    p.run_pipeline("rumah123", &[], None).await.unwrap();
    let before = store.listings().unwrap().remove(0);

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    transport.set(PAGE_1, &page(&[kebayoran("Rp 3,2 Miliar")]));
    let summary = p.run_pipeline("rumah123", &[], None).await.unwrap();
    assert_eq!(summary.updated, 1);
    assert_eq!(summary.new, 0);

    let after = store.get_listing(&before.listing_id).await.unwrap().unwrap();
    assert_eq!(after.history.len(), 2);
    assert_eq!(after.history[1].price_idr, 3_200_000_000);
    assert!(after.last_seen_at > before.last_seen_at);
    assert_eq!(after.first_seen_at, before.first_seen_at);
    assert_eq!(store.lineage(&after.listing_id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn rerun_with_same_content_changes_nothing_but_last_seen() {
    let store = Arc::new(InMemoryStore::new());
    let transport = Arc::new(ScriptedTransport::default());
    transport.set(PAGE_1, &page(&[kebayoran("Rp 3,5 Miliar")]));
    transport.set(PAGE_2, EMPTY_PAGE);
    let p = pipeline(store.clone(), transport);

    p.run_pipeline("rumah123", &[], None).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let summary = p.run_pipeline("rumah123", &[], None).await.unwrap();

    assert_eq!(summary.new, 0);
    assert_eq!(summary.duplicates, 1);
    let listings = store.listings().unwrap();
    assert_eq!(listings.len(), 1);
    assert_eq!(listings[0].history.len(), 1);
}

#[tokio::test]
async fn lost_compare_and_set_is_retried() {
    let store = Arc::new(FaultyStore::new());
    store.conflicts_left.store(1, Ordering::SeqCst);
    let transport = Arc::new(ScriptedTransport::default());
    transport.set(PAGE_1, &page(&[kebayoran("Rp 3,5 Miliar")]));
    transport.set(PAGE_2, EMPTY_PAGE);

    let summary = pipeline(store.clone(), transport)
        .run_pipeline("rumah123", &[], None)
        .await
        .unwrap();

    assert_eq!(summary.new, 1);
    assert!(summary.errors.is_empty());
    assert_eq!(store.upsert_calls.load(Ordering::SeqCst), 2);
    assert_eq!(store.inner.listing_count().unwrap(), 1);
}

#[tokio::test]
async fn persistent_conflicts_are_reported_per_record() {
    let store = Arc::new(FaultyStore::new());
    store.conflicts_left.store(100, Ordering::SeqCst);
    let transport = Arc::new(ScriptedTransport::default());
    transport.set(PAGE_1, &page(&[kebayoran("Rp 3,5 Miliar")]));
    transport.set(PAGE_2, EMPTY_PAGE);

    let summary = pipeline(store.clone(), transport)
        .run_pipeline("rumah123", &[], None)
        .await
        .unwrap();

    assert_eq!(summary.new, 0);
    assert_eq!(summary.errors.len(), 1);
    assert_eq!(summary.errors[0].kind, "conflict");
    // One attempt plus two conflict retries.
    assert_eq!(store.upsert_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn unavailable_storage_fails_the_run() {
    let store = Arc::new(FaultyStore::new());
    store.down.store(true, Ordering::SeqCst);
    let transport = Arc::new(ScriptedTransport::default());
    transport.set(PAGE_1, &page(&[kebayoran("Rp 3,5 Miliar")]));

    let err = pipeline(store.clone(), transport)
        .run_pipeline("rumah123", &[], None)
        .await
        .unwrap_err();

    match err {
        PipelineError::StorageUnavailable {
            source_id,
            attempts,
            ..
        } => {
            assert_eq!(source_id, "rumah123");
            assert_eq!(attempts, 2);
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(store.upsert_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn schema_drift_is_reported_and_not_checkpointed() {
    let store = Arc::new(InMemoryStore::new());
    let transport = Arc::new(ScriptedTransport::default());
    transport.set(
        PAGE_1,
        "<html><body><section class='listing-v2'>redesigned</section></body></html>",
    );

    let summary = pipeline(store.clone(), transport.clone())
        .run_pipeline("rumah123", &[], None)
        .await
        .unwrap();

    assert_eq!(summary.records_seen, 0);
    assert_eq!(summary.errors.len(), 1);
    assert_eq!(summary.errors[0].kind, "schema_drift");
    assert!(store
        .checkpoint("rumah123", "dki-jakarta")
        .await
        .unwrap()
        .is_none());
    // The query stops at the drifted page.
    assert_eq!(transport.requests(), vec![PAGE_1]);
}

#[tokio::test]
async fn blocked_source_is_reported_without_retry() {
    let store = Arc::new(InMemoryStore::new());
    let transport = Arc::new(ScriptedTransport::default());
    transport.push(PAGE_1, 403, "Access denied");

    let summary = pipeline(store.clone(), transport.clone())
        .run_pipeline("rumah123", &[], None)
        .await
        .unwrap();

    assert_eq!(summary.errors.len(), 1);
    assert_eq!(summary.errors[0].kind, "blocked");
    assert_eq!(transport.requests().len(), 1);
}

#[tokio::test]
async fn checkpoint_resumes_at_next_page() {
    let store = Arc::new(InMemoryStore::new());
    let transport = Arc::new(ScriptedTransport::default());
    let toml = RUMAH123_CONFIG.replace("pages_per_run = 2", "pages_per_run = 1");
    transport.set(PAGE_1, &page(&[kebayoran("Rp 3,5 Miliar")]));
    transport.set(PAGE_2, EMPTY_PAGE);
    let p = pipeline_with(&toml, store.clone(), transport.clone(), Arc::new(NoGeocoder));

    p.run_pipeline("rumah123", &[], None).await.unwrap();
    let cp = store.checkpoint("rumah123", "dki-jakarta").await.unwrap();
    assert_eq!(cp.map(|c| c.next_page), Some(2));

    p.run_pipeline("rumah123", &[], None).await.unwrap();
    assert_eq!(transport.requests(), vec![PAGE_1, PAGE_2]);
    let cp = store.checkpoint("rumah123", "dki-jakarta").await.unwrap();
    assert_eq!(cp.map(|c| c.next_page), Some(1));
}

#[tokio::test]
async fn geocoded_coordinates_are_stored() {
    let store = Arc::new(InMemoryStore::new());
    let transport = Arc::new(ScriptedTransport::default());
    transport.set(PAGE_1, &page(&[kebayoran("Rp 3,5 Miliar")]));
    transport.set(PAGE_2, EMPTY_PAGE);
    let geocoder = Arc::new(StaticGeocoder::new([(
        "kebayoran baru, jakarta selatan, dki-jakarta",
        (-6.2446, 106.8005),
    )]));

    pipeline_with(RUMAH123_CONFIG, store.clone(), transport, geocoder)
        .run_pipeline("rumah123", &[], None)
        .await
        .unwrap();

    let l = &store.listings().unwrap()[0].current;
    assert_eq!(l.location.lat, Some(-6.2446));
    assert_eq!(l.location.lon, Some(106.8005));
}

#[tokio::test]
async fn detail_pages_enrich_cards() {
    let store = Arc::new(InMemoryStore::new());
    let transport = Arc::new(ScriptedTransport::default());
    let toml = RUMAH123_CONFIG.replace(
        "pages_per_run = 2",
        "pages_per_run = 2\nfollow_details = true",
    );
    transport.set(
        PAGE_1,
        &page(&[
            kebayoran("Rp 3,5 Miliar"),
            Card {
                id: "hos9",
                price: "Rp 2 Miliar",
                location: "Menteng, Jakarta Pusat",
                lt: "150 m²",
                lb: "120 m²",
            },
        ]),
    );
    transport.set(PAGE_2, EMPTY_PAGE);
    transport.set(
        "https://www.rumah123.com/properti/jakarta/hos1/",
        r#"<html><body>
          <h1>Rumah Asri Kebayoran</h1>
          <span class="text-primary font-bold">Rp 3,45 Miliar</span>
          <p class="text-3xs text-gray-400 mb-4">Diperbarui 12 Okt 2024 oleh Budi</p>
          <p>Sertifikat</p><p>SHM - Sertifikat Hak Milik</p>
          <p>Daya Listrik</p><p>4400 Watt</p>
        </body></html>"#,
    );
    // hos9's detail page is missing (404): its card fields are kept.

    let summary = pipeline_with(&toml, store.clone(), transport, Arc::new(NoGeocoder))
        .run_pipeline("rumah123", &[], None)
        .await
        .unwrap();
    assert_eq!(summary.new, 2);
    assert!(summary.errors.is_empty(), "{:?}", summary.errors);

    let hos1 = store
        .find_by_source_listing("rumah123", "hos1")
        .await
        .unwrap()
        .unwrap()
        .current;
    assert_eq!(hos1.price_idr, 3_450_000_000);
    assert_eq!(hos1.listed_at, NaiveDate::from_ymd_opt(2024, 10, 12));
    assert_eq!(hos1.attributes.get("agen").map(String::as_str), Some("Budi"));
    assert_eq!(
        hos1.attributes.get("sertifikat").map(String::as_str),
        Some("SHM - Sertifikat Hak Milik")
    );

    let hos9 = store
        .find_by_source_listing("rumah123", "hos9")
        .await
        .unwrap()
        .unwrap()
        .current;
    assert_eq!(hos9.price_idr, 2_000_000_000);
}

const PARTNER_SOURCE: &str = r#"
[sources.partner]
kind = "json_api"
url_template = "https://api.example.test/listings?q={query}&page={page}"
items_pointer = "/data"
locale = "en"
min_interval_ms = 1
pages_per_run = 1

[sources.partner.field_map]
listing_id = ["id"]
price = ["price"]
area = ["floor_area"]
address = ["location.district", "location.city"]
property_type = ["type"]
listed_at = ["updated_at"]
"#;

fn json_config() -> String {
    format!(
        "[db]\npath = \"unused.sqlite\"\n\n[fetch]\nmax_attempts = 2\nbase_delay_ms = 1\nmax_delay_ms = 5\n{}",
        PARTNER_SOURCE
    )
}

#[tokio::test]
async fn json_source_with_since_filter() {
    let store = Arc::new(InMemoryStore::new());
    let transport = Arc::new(ScriptedTransport::default());
    transport.set(
        "https://api.example.test/listings?q=&page=1",
        r#"{"data": [
            {"id": 101, "price": "IDR 1,250,000,000", "floor_area": "1,200 sqft",
             "location": {"district": "Ubud", "city": "Gianyar"}, "type": "villa",
             "updated_at": "2024-10-15"},
            {"id": 102, "price": "IDR 800,000,000", "floor_area": "90",
             "location": {"district": "Sleman", "city": "Yogyakarta"}, "type": "apartment",
             "updated_at": "2024-09-01"}
        ]}"#,
    );
    let since = NaiveDate::from_ymd_opt(2024, 10, 1);

    let summary = pipeline_with(&json_config(), store.clone(), transport, Arc::new(NoGeocoder))
        .run_pipeline("partner", &[], since)
        .await
        .unwrap();

    assert_eq!(summary.records_seen, 2);
    assert_eq!(summary.new, 1);
    assert_eq!(summary.skipped, 1);

    let ubud = store
        .find_by_source_listing("partner", "101")
        .await
        .unwrap()
        .unwrap()
        .current;
    assert_eq!(ubud.price_idr, 1_250_000_000);
    assert_eq!(ubud.location.raw_address, "Ubud, Gianyar");
    assert_eq!(ubud.property_type.as_str(), "house");
    let area = ubud.area_sqm.unwrap();
    assert!((area - 111.4836).abs() < 0.01, "area was {}", area);
}

#[tokio::test]
async fn json_numbers_keep_their_decimal_point() {
    let store = Arc::new(InMemoryStore::new());
    let transport = Arc::new(ScriptedTransport::default());
    transport.set(
        "https://api.example.test/listings?q=&page=1",
        r#"{"data": [
            {"id": 201, "price": 950000000, "floor_area": 36.375,
             "location": {"district": "Tebet", "city": "Jakarta Selatan"}, "type": "apartment"}
        ]}"#,
    );

    let summary = pipeline_with(&json_config(), store.clone(), transport, Arc::new(NoGeocoder))
        .run_pipeline("partner", &[], None)
        .await
        .unwrap();
    assert_eq!(summary.new, 1, "{:?}", summary.errors);

    let tebet = store
        .find_by_source_listing("partner", "201")
        .await
        .unwrap()
        .unwrap()
        .current;
    assert_eq!(tebet.area_sqm, Some(36.375));
    assert_eq!(tebet.price_idr, 950_000_000);
}

#[tokio::test]
async fn run_all_covers_every_source() {
    let store = Arc::new(InMemoryStore::new());
    let transport = Arc::new(ScriptedTransport::default());
    let toml = format!("{}{}", RUMAH123_CONFIG, PARTNER_SOURCE);
    transport.set(PAGE_1, &page(&[kebayoran("Rp 3,5 Miliar")]));
    transport.set(PAGE_2, EMPTY_PAGE);
    transport.set("https://api.example.test/listings?q=&page=1", r#"{"data": []}"#);

    let results = pipeline_with(&toml, store.clone(), transport, Arc::new(NoGeocoder))
        .run_all(None)
        .await;

    let names: Vec<&str> = results.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, vec!["partner", "rumah123"]);
    assert!(results.iter().all(|(_, r)| r.is_ok()));
    assert_eq!(store.listing_count().unwrap(), 1);
}

#[tokio::test]
async fn cancelled_run_fetches_nothing() {
    let store = Arc::new(InMemoryStore::new());
    let transport = Arc::new(ScriptedTransport::default());
    transport.set(PAGE_1, &page(&[kebayoran("Rp 3,5 Miliar")]));
    let p = pipeline(store.clone(), transport.clone());
    p.cancellation_token().cancel();

    let summary = p.run_pipeline("rumah123", &[], None).await.unwrap();
    assert_eq!(summary.records_seen, 0);
    assert!(transport.requests().is_empty());
    assert_eq!(store.listing_count().unwrap(), 0);
}

#[tokio::test]
async fn unknown_source_is_rejected() {
    let store = Arc::new(InMemoryStore::new());
    let transport = Arc::new(ScriptedTransport::default());
    let err = pipeline(store, transport)
        .run_pipeline("olx", &[], None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "unknown_source");
}

#[tokio::test]
async fn ingested_district_gets_facility_counts() {
    let store = Arc::new(InMemoryStore::new());
    let transport = Arc::new(ScriptedTransport::default());
    transport.set(PAGE_1, &page(&[kebayoran("Rp 3,5 Miliar")]));
    transport.set(PAGE_2, EMPTY_PAGE);
    pipeline(store.clone(), transport.clone())
        .run_pipeline("rumah123", &[], None)
        .await
        .unwrap();

    let config = parse_config(
        r#"
        [db]
        path = "unused.sqlite"

        [fetch]
        max_attempts = 1
        base_delay_ms = 1
        max_delay_ms = 1

        [facilities]
        base_url = "https://overpass.test/api/interpreter"
        min_interval_ms = 1
        "#,
    )
    .unwrap();
    for (category, total) in FacilityCategory::ALL.into_iter().zip([41, 23, 17, 5, 9]) {
        let query = overpass_query(&config.facilities, "Kebayoran Baru", category);
        let url = query_url(&config.facilities.base_url, &query).unwrap();
        transport.set(
            &url,
            &format!(
                r#"{{"elements":[{{"type":"count","id":0,"tags":{{"total":"{}"}}}}]}}"#,
                total
            ),
        );
    }

    let enricher = FacilityEnricher::new(
        config.facilities.clone(),
        &config.fetch,
        transport.clone(),
        store.clone(),
    );
    let summary = enricher.run(&[], false).await.unwrap();
    assert_eq!((summary.districts, summary.enriched), (1, 1));
    assert!(summary.errors.is_empty(), "{:?}", summary.errors);

    let id = store.listings().unwrap()[0].listing_id.clone();
    let resp = get_listing(store.as_ref(), &id).await.unwrap();
    let counts = resp.facilities.unwrap();
    assert_eq!(counts.kecamatan, "Kebayoran Baru");
    assert_eq!(
        (counts.education, counts.health, counts.shopping, counts.transport, counts.recreation),
        (41, 23, 17, 5, 9)
    );
}
