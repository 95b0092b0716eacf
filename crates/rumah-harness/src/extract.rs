//! Source-specific extraction.
//!
//! An [`Extractor`] turns a raw document into candidate records keyed by
//! the source's native field names. It also knows how the source paginates,
//! so the pipeline can ask for the URL of `(query, page)` without caring
//! which site it talks to.
//!
//! | Kind | Implementation |
//! |------|----------------|
//! | `rumah123` | [`Rumah123Extractor`]: HTML cards plus optional detail pages |
//! | `json_api` | [`JsonApiExtractor`]: array at a JSON pointer |

use anyhow::{bail, Result};

use rumah_harness_core::error::ExtractError;
use rumah_harness_core::models::{CandidateRecord, RawDocument};

use crate::config::{SourceConfig, SourceKind};
use crate::extract_json::JsonApiExtractor;
use crate::extract_rumah123::Rumah123Extractor;

pub enum Extractor {
    Rumah123(Rumah123Extractor),
    JsonApi(JsonApiExtractor),
}

impl Extractor {
    pub fn for_source(source_id: &str, source: &SourceConfig) -> Result<Self> {
        match source.kind {
            SourceKind::Rumah123 => Ok(Extractor::Rumah123(Rumah123Extractor::new(
                source_id,
                &source.base_url,
                &source.category,
            )?)),
            SourceKind::JsonApi => {
                let Some(template) = &source.url_template else {
                    bail!("source '{}' has no url_template", source_id);
                };
                Ok(Extractor::JsonApi(JsonApiExtractor::new(
                    source_id,
                    template,
                    &source.items_pointer,
                )))
            }
        }
    }

    pub fn page_url(&self, query: &str, page: u32) -> String {
        match self {
            Extractor::Rumah123(e) => e.page_url(query, page),
            Extractor::JsonApi(e) => e.page_url(query, page),
        }
    }

    pub fn extract(&self, doc: &RawDocument) -> Result<Vec<CandidateRecord>, ExtractError> {
        match self {
            Extractor::Rumah123(e) => e.extract(doc),
            Extractor::JsonApi(e) => e.extract(doc),
        }
    }

    /// Detail page to fetch for a candidate, when the source has one.
    pub fn detail_url<'a>(&self, candidate: &'a CandidateRecord) -> Option<&'a str> {
        match self {
            Extractor::Rumah123(_) => Rumah123Extractor::detail_url(candidate),
            Extractor::JsonApi(_) => None,
        }
    }

    pub fn merge_detail(
        &self,
        candidate: &mut CandidateRecord,
        detail: &RawDocument,
    ) -> Result<(), ExtractError> {
        match self {
            Extractor::Rumah123(e) => e.merge_detail(candidate, detail),
            Extractor::JsonApi(_) => Ok(()),
        }
    }
}
