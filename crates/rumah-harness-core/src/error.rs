//! Typed errors for the pipeline stages.
//!
//! Each stage has its own error type so callers can decide per kind
//! whether to retry, skip the record, or abort the run. [`kind`] accessors
//! return the stable snake_case names reported in run summaries.
//!
//! [`kind`]: FetchError::kind

use thiserror::Error;

/// Errors raised while retrieving a raw document.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("timeout fetching {url}")]
    Timeout { url: String },

    #[error("HTTP {status} for {url}")]
    HttpError { url: String, status: u16 },

    /// The source refused the request (anti-scraping defenses).
    #[error("blocked by source (HTTP {status}) for {url}")]
    Blocked { url: String, status: u16 },

    #[error("network error fetching {url}: {message}")]
    Network { url: String, message: String },

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: Box<FetchError>,
    },

    /// The payload was fetched but could not be persisted.
    #[error("failed to archive raw document: {0}")]
    Archive(#[from] StorageError),
}

impl FetchError {
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::Timeout { .. } => "timeout",
            FetchError::HttpError { .. } => "http_error",
            FetchError::Blocked { .. } => "blocked",
            FetchError::Network { .. } => "network",
            FetchError::Exhausted { .. } => "exhausted",
            FetchError::Archive(e) => e.kind(),
        }
    }
}

/// Errors raised while parsing a raw document.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// Expected structural anchors are absent; the page layout changed.
    #[error("schema drift in {source_id}: missing {anchor} (snippet: {snippet:?})")]
    SchemaDrift {
        source_id: String,
        anchor: String,
        snippet: String,
    },
}

impl ExtractError {
    pub fn kind(&self) -> &'static str {
        match self {
            ExtractError::SchemaDrift { .. } => "schema_drift",
        }
    }

    pub fn schema_drift(source_id: &str, anchor: &str, content: &str) -> Self {
        ExtractError::SchemaDrift {
            source_id: source_id.to_string(),
            anchor: anchor.to_string(),
            snippet: snippet(content, 160),
        }
    }
}

/// Errors raised while mapping a candidate onto the canonical schema.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NormalizeError {
    #[error("invalid value for {field}: {value:?}")]
    InvalidValue { field: String, value: String },
}

impl NormalizeError {
    pub fn kind(&self) -> &'static str {
        match self {
            NormalizeError::InvalidValue { .. } => "invalid_value",
        }
    }

    pub fn invalid(field: &str, value: &str) -> Self {
        NormalizeError::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
        }
    }

    pub fn field(&self) -> &str {
        match self {
            NormalizeError::InvalidValue { field, .. } => field,
        }
    }
}

/// Errors raised by a storage backend.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StorageError {
    /// The stored record changed since it was read.
    #[error("write conflict on listing {listing_id}")]
    Conflict { listing_id: String },

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl StorageError {
    pub fn kind(&self) -> &'static str {
        match self {
            StorageError::Conflict { .. } => "conflict",
            StorageError::Unavailable(_) => "unavailable",
        }
    }

    pub fn unavailable(err: impl std::fmt::Display) -> Self {
        StorageError::Unavailable(err.to_string())
    }
}

/// First `max_chars` characters of `content`, whitespace collapsed.
pub fn snippet(content: &str, max_chars: usize) -> String {
    content
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(max_chars)
        .collect()
}
