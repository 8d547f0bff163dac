//! Footprint estimation for memoized values.
//!
//! Estimates walk the value once and sum payload lengths plus a fixed per-record
//! overhead; nothing is serialized. The numbers only drive eviction, so they
//! favour speed over precision.

use artifact_cache_types::TagManifestRecord;

use super::entry::{ArtifactBody, CacheEntry};

/// Bookkeeping overhead charged to every record.
pub const RECORD_OVERHEAD: usize = 64;
/// Charge for a memoized "known miss".
pub const MISS_SIZE: usize = 25;
/// Charge for a lookup that has not resolved yet.
pub const IN_FLIGHT_SIZE: usize = 64;

pub fn estimate_entry(entry: &CacheEntry) -> usize {
    let headers: usize = entry
        .headers()
        .iter()
        .map(|(name, value)| name.len() + value.len())
        .sum();
    let tags: usize = entry.tags().iter().map(String::len).sum();

    let body = match entry.body() {
        ArtifactBody::Route { body, .. } => body.len(),
        ArtifactBody::Page {
            html, page_data, ..
        } => html.len() + estimate_json(page_data),
        ArtifactBody::AppPage { html, rsc_data, .. } => html.len() + rsc_data.len(),
        ArtifactBody::Fetch { body, url, .. } => body.len() + url.len(),
    };

    RECORD_OVERHEAD + entry.key().len() + headers + tags + body
}

pub fn estimate_manifest(record: &TagManifestRecord) -> usize {
    RECORD_OVERHEAD + record.tag.len() + std::mem::size_of::<i64>()
}

/// Approximate in-memory size of a JSON value.
pub fn estimate_json(value: &serde_json::Value) -> usize {
    use serde_json::Value;

    match value {
        Value::Null => 4,
        Value::Bool(_) => 4,
        Value::Number(_) => 8,
        Value::String(text) => text.len() + 2,
        Value::Array(items) => 2 + items.iter().map(|item| estimate_json(item) + 1).sum::<usize>(),
        Value::Object(fields) => {
            2 + fields
                .iter()
                .map(|(name, item)| name.len() + 4 + estimate_json(item))
                .sum::<usize>()
        }
    }
}
