//! Source listing and health.
//!
//! Reports which sources are configured and whether they look runnable.
//! Used by the `rumah sources` CLI command.
//!
//! # Health Checks
//!
//! | Kind | Healthy When |
//! |------|--------------|
//! | `rumah123` | `base_url` parses and the extractor builds |
//! | `json_api` | The first page URL built from `url_template` parses |
//!
//! No request is sent; reachability is checked at run time.

use serde::Serialize;
use url::Url;

use crate::config::{Config, SourceConfig};
use crate::extract::Extractor;

#[derive(Debug, Clone, Serialize)]
pub struct SourceStatus {
    pub name: String,
    pub kind: String,
    /// Queries a run covers when none are given.
    pub queries: usize,
    pub pages_per_run: u32,
    pub healthy: bool,
    pub notes: Option<String>,
}

fn check(name: &str, source: &SourceConfig) -> (bool, Option<String>) {
    let extractor = match Extractor::for_source(name, source) {
        Ok(e) => e,
        Err(e) => return (false, Some(e.to_string())),
    };
    let sample = source
        .effective_queries()
        .into_iter()
        .next()
        .unwrap_or_default();
    let url = extractor.page_url(&sample, 1);
    match Url::parse(&url) {
        Ok(u) => (true, Some(format!("host: {}", u.host_str().unwrap_or("-")))),
        Err(e) => (false, Some(format!("invalid page url '{}': {}", url, e))),
    }
}

/// Configuration and health of every configured source, by name.
pub fn get_sources(config: &Config) -> Vec<SourceStatus> {
    config
        .sources
        .iter()
        .map(|(name, source)| {
            let (healthy, notes) = check(name, source);
            SourceStatus {
                name: name.clone(),
                kind: source.kind.as_str().to_string(),
                queries: source.effective_queries().len(),
                pages_per_run: source.pages_per_run,
                healthy,
                notes,
            }
        })
        .collect()
}

/// CLI entry point: print a table of sources.
pub fn print_sources(config: &Config) {
    let sources = get_sources(config);
    if sources.is_empty() {
        println!("No sources configured.");
        return;
    }
    println!(
        "{:<20} {:<10} {:>7} {:>6}   {:<8} NOTES",
        "SOURCE", "KIND", "QUERIES", "PAGES", "STATUS"
    );
    for s in &sources {
        println!(
            "{:<20} {:<10} {:>7} {:>6}   {:<8} {}",
            s.name,
            s.kind,
            s.queries,
            s.pages_per_run,
            if s.healthy { "OK" } else { "ERROR" },
            s.notes.as_deref().unwrap_or("")
        );
    }
}
