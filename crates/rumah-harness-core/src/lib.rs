//! # Rumah Harness Core
//!
//! Pure pipeline logic for Rumah Harness: data models, error taxonomy,
//! normalization, fingerprinting, reconciliation, loading, and the storage
//! and geocoding abstractions.
//!
//! This crate contains no tokio runtime, sqlx, or network dependencies.
//! The application crate supplies the fetcher, extractors, SQLite store,
//! and orchestration.

pub mod error;
pub mod fingerprint;
pub mod geocode;
pub mod loader;
pub mod models;
pub mod normalize;
pub mod reconcile;
pub mod store;
