//! JSON API extraction.
//!
//! The response body must contain an array at the configured JSON pointer.
//! Each object in that array becomes one candidate; nested objects are
//! flattened into dotted keys (`location.city`) and arrays are indexed
//! (`photos.0`). Nulls are dropped so they read as absent.

use serde_json::Value;
use url::form_urlencoded;

use rumah_harness_core::error::ExtractError;
use rumah_harness_core::models::{CandidateRecord, RawDocument};

pub struct JsonApiExtractor {
    source_id: String,
    url_template: String,
    items_pointer: String,
}

impl JsonApiExtractor {
    pub fn new(source_id: &str, url_template: &str, items_pointer: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            url_template: url_template.to_string(),
            items_pointer: items_pointer.to_string(),
        }
    }

    pub fn page_url(&self, query: &str, page: u32) -> String {
        let encoded: String = form_urlencoded::byte_serialize(query.as_bytes()).collect();
        self.url_template
            .replace("{query}", &encoded)
            .replace("{page}", &page.to_string())
    }

    pub fn extract(&self, doc: &RawDocument) -> Result<Vec<CandidateRecord>, ExtractError> {
        let anchor = if self.items_pointer.is_empty() {
            "/"
        } else {
            self.items_pointer.as_str()
        };
        let body: Value = serde_json::from_str(&doc.content)
            .map_err(|_| ExtractError::schema_drift(&self.source_id, anchor, &doc.content))?;
        let items = body
            .pointer(&self.items_pointer)
            .and_then(Value::as_array)
            .ok_or_else(|| ExtractError::schema_drift(&self.source_id, anchor, &doc.content))?;

        Ok(items
            .iter()
            .filter_map(Value::as_object)
            .map(|obj| {
                let mut rec = CandidateRecord::new(doc);
                for (key, value) in obj {
                    flatten(&mut rec, key, value);
                }
                rec
            })
            .collect())
    }
}

fn flatten(rec: &mut CandidateRecord, prefix: &str, value: &Value) {
    match value {
        Value::Null => {}
        Value::String(s) => rec.set(prefix, s),
        Value::Bool(b) => rec.set(prefix, b.to_string()),
        Value::Number(n) => rec.set(prefix, n.to_string()),
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                flatten(rec, &format!("{}.{}", prefix, i), item);
            }
        }
        Value::Object(map) => {
            for (key, item) in map {
                flatten(rec, &format!("{}.{}", prefix, key), item);
            }
        }
    }
}
