//! # Rumah Harness
//!
//! **Ingestion and normalization pipeline for Indonesian housing listings.**
//!
//! Rumah Harness fetches listing pages from property portals and partner
//! APIs, maps them onto one canonical schema (IDR prices, square-meter
//! areas, coordinates), reconciles repeat sightings of the same property,
//! and writes idempotent upserts with price history and lineage into
//! SQLite.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────┐   ┌───────────┐   ┌────────────┐   ┌────────────┐   ┌────────┐
//! │ Fetcher │──▶│ Extractor │──▶│ Normalizer │──▶│ Reconciler │──▶│ Loader │
//! │ (HTTP)  │   │ HTML/JSON │   │ + geocoder │   │            │   │        │
//! └────┬────┘   └───────────┘   └────────────┘   └─────┬──────┘   └───┬────┘
//!      │ raw documents                                  │              │
//!      ▼                                                ▼              ▼
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                        ListingStore (SQLite)                          │
//! └───────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The pure stages (normalizer, reconciler, loader, store contract) live in
//! `rumah-harness-core`; this crate holds the I/O around them.
//!
//! ## Quick Start
//!
//! ```bash
//! rumah init                         # create database
//! rumah sources                      # check configured sources
//! rumah run rumah123 --query bali    # one source, one province
//! rumah run all                      # every source, concurrently
//! rumah facilities                   # OSM facility counts per district
//! rumah stats
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`db`] | SQLite connection pool |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | `ListingStore` over SQLite |
//! | [`retry`] | Bounded exponential backoff |
//! | [`fetch`] | Throttled, retrying fetcher and HTTP transport |
//! | [`extract`] | Source extractors ([`extract_rumah123`], [`extract_json`]) |
//! | [`geocode`] | Nominatim geocoder and shared address cache |
//! | [`facilities`] | Overpass facility counts per kecamatan |
//! | [`ingest`] | Pipeline runner: worker pool, checkpoints, cancellation |
//! | [`progress`] | Run progress on stderr |
//! | [`run_cmd`] | `rumah run` wiring and summary output |
//! | [`sources`] | Source listing and health |
//! | [`stats`] | Per-source counts |
//! | [`get`] | Listing retrieval |
//! | [`retention`] | Raw-document purge |

pub mod config;
pub mod db;
pub mod extract;
pub mod extract_json;
pub mod extract_rumah123;
pub mod facilities;
pub mod fetch;
pub mod geocode;
pub mod get;
pub mod ingest;
pub mod migrate;
pub mod progress;
pub mod retention;
pub mod retry;
pub mod run_cmd;
pub mod sources;
pub mod sqlite_store;
pub mod stats;
