//! Conversion between [`CacheEntry`] values and the stored wire records.

use artifact_cache_types::{
    LAST_MODIFIED_STALE, StoredAppPage, StoredFetch, StoredPage, StoredRecord, StoredRoute,
    StoredValue, TagManifestRecord, is_known_kind,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;

use super::entry::{Artifact, ArtifactBody, CacheEntry};
use super::error::CacheError;

/// Build the stored form of an entry; binary bodies become base64.
pub fn encode_entry(entry: &CacheEntry) -> StoredRecord {
    let headers = entry.headers().clone();
    let value = match entry.body() {
        ArtifactBody::Route { body, status } => StoredValue::Route(StoredRoute {
            body: STANDARD.encode(body),
            headers,
            status: *status,
        }),
        ArtifactBody::Page {
            html,
            page_data,
            status,
        } => StoredValue::Page(StoredPage {
            html: html.clone(),
            page_data: page_data.clone(),
            headers,
            status: *status,
        }),
        ArtifactBody::AppPage {
            html,
            rsc_data,
            status,
        } => StoredValue::AppPage(StoredAppPage {
            html: html.clone(),
            rsc_data: STANDARD.encode(rsc_data),
            headers,
            status: *status,
        }),
        ArtifactBody::Fetch { body, status, url } => StoredValue::Fetch(StoredFetch {
            body: STANDARD.encode(body),
            headers,
            status: *status,
            url: url.clone(),
        }),
    };

    StoredRecord {
        last_modified: entry.last_modified(),
        revalidate: entry.revalidate(),
        tags: entry.tags().iter().cloned().collect(),
        value,
    }
}

pub fn entry_to_bytes(entry: &CacheEntry) -> Result<Bytes, CacheError> {
    serde_json::to_vec(&encode_entry(entry))
        .map(Bytes::from)
        .map_err(|err| CacheError::serialization(entry.key(), err))
}

/// Decode a stored record read for `key`.
///
/// A kind tag this version does not know is reported as
/// [`CacheError::UnknownKind`], separately from malformed records.
pub fn decode_entry(key: &str, data: &[u8]) -> Result<CacheEntry, CacheError> {
    let raw: serde_json::Value =
        serde_json::from_slice(data).map_err(|err| CacheError::serialization(key, err))?;

    let kind = raw
        .pointer("/value/kind")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| CacheError::serialization(key, "record has no value kind"))?;
    if !is_known_kind(kind) {
        return Err(CacheError::unknown_kind(key, kind));
    }

    let record: StoredRecord =
        serde_json::from_value(raw).map_err(|err| CacheError::serialization(key, err))?;
    record_to_entry(key, record)
}

fn record_to_entry(key: &str, record: StoredRecord) -> Result<CacheEntry, CacheError> {
    if record.last_modified < LAST_MODIFIED_STALE {
        return Err(CacheError::serialization(
            key,
            format!("invalid lastModified {}", record.last_modified),
        ));
    }

    let decode = |encoded: &str| -> Result<Bytes, CacheError> {
        STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(|err| CacheError::serialization(key, err))
    };

    let (body, headers) = match record.value {
        StoredValue::Route(route) => (
            ArtifactBody::Route {
                body: decode(&route.body)?,
                status: route.status,
            },
            route.headers,
        ),
        StoredValue::Page(page) => (
            ArtifactBody::Page {
                html: page.html,
                page_data: page.page_data,
                status: page.status,
            },
            page.headers,
        ),
        StoredValue::AppPage(page) => (
            ArtifactBody::AppPage {
                html: page.html,
                rsc_data: decode(&page.rsc_data)?,
                status: page.status,
            },
            page.headers,
        ),
        StoredValue::Fetch(fetch) => (
            ArtifactBody::Fetch {
                body: decode(&fetch.body)?,
                status: fetch.status,
                url: fetch.url,
            },
            fetch.headers,
        ),
    };

    let artifact = Artifact {
        body,
        headers,
        revalidate: record.revalidate,
    };
    Ok(CacheEntry::new(key, artifact, record.last_modified, record.tags))
}

pub fn manifest_to_bytes(record: &TagManifestRecord) -> Result<Bytes, CacheError> {
    serde_json::to_vec(record)
        .map(Bytes::from)
        .map_err(|err| CacheError::serialization(&record.tag, err))
}

pub fn decode_manifest(tag: &str, data: &[u8]) -> Result<TagManifestRecord, CacheError> {
    serde_json::from_slice(data).map_err(|err| CacheError::serialization(tag, err))
}
