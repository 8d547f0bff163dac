//! Durable store client.
//!
//! [`BlobStore`] is the seam to the external key-value blob service. The
//! [`StoreClient`] wrapper only encodes keys, converts records and applies the
//! request timeout; every cache decision lives in the handler.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use artifact_cache_types::TagManifestRecord;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use metrics::counter;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::codec;
use super::entry::CacheEntry;
use super::error::{CacheError, StoreError};
use super::keys;

const METRIC_STORE_READ: &str = "artifact_cache_store_read_total";
const METRIC_STORE_WRITE: &str = "artifact_cache_store_write_total";

/// Raw outcome of a (conditional) blob read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobRead {
    Found { data: Bytes, version: String },
    /// The supplied version still matches.
    Unchanged,
    NotFound,
}

/// External durable key-value blob service.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    /// Read `key`, answering [`BlobRead::Unchanged`] when `if_none_match`
    /// equals the current version.
    async fn get_with_metadata(
        &self,
        key: &str,
        if_none_match: Option<&str>,
    ) -> Result<BlobRead, StoreError>;

    /// Write `data` under `key` and return the new version tag.
    async fn set(&self, key: &str, data: Bytes) -> Result<String, StoreError>;
}

/// Process-local [`BlobStore`] versioning blobs by SHA-256 of their content.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: DashMap<String, (Bytes, String)>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    /// Raw stored bytes, bypassing conditional semantics.
    pub fn raw(&self, key: &str) -> Option<Bytes> {
        self.blobs.get(key).map(|blob| blob.value().0.clone())
    }
}

/// Version tag of a blob: hex SHA-256 of its bytes.
pub fn content_version(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get_with_metadata(
        &self,
        key: &str,
        if_none_match: Option<&str>,
    ) -> Result<BlobRead, StoreError> {
        let Some(blob) = self.blobs.get(key) else {
            return Ok(BlobRead::NotFound);
        };
        let (data, version) = blob.value();
        if if_none_match == Some(version.as_str()) {
            return Ok(BlobRead::Unchanged);
        }
        Ok(BlobRead::Found {
            data: data.clone(),
            version: version.clone(),
        })
    }

    async fn set(&self, key: &str, data: Bytes) -> Result<String, StoreError> {
        let version = content_version(&data);
        self.blobs.insert(key.to_string(), (data, version.clone()));
        Ok(version)
    }
}

/// Decoded outcome of a conditional read.
#[derive(Debug, Clone, PartialEq)]
pub enum Fetched<T> {
    Found { value: T, version: String },
    Unchanged,
    Missing,
}

/// Cache-facing wrapper around a [`BlobStore`].
#[derive(Clone)]
pub struct StoreClient {
    backend: Arc<dyn BlobStore>,
    namespace: Option<String>,
    timeout: Option<Duration>,
}

impl std::fmt::Debug for StoreClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreClient")
            .field("backend", &self.backend.name())
            .field("namespace", &self.namespace)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl StoreClient {
    pub fn new(backend: Arc<dyn BlobStore>) -> Self {
        Self {
            backend,
            namespace: None,
            timeout: None,
        }
    }

    /// Scope every key under `namespace` (e.g. a build id).
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Fail store calls that take longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn entry_key(&self, key: &str) -> String {
        keys::entry_store_key(self.namespace.as_deref(), key)
    }

    pub fn tag_key(&self, tag: &str) -> String {
        keys::tag_store_key(self.namespace.as_deref(), tag)
    }

    /// Unconditional read of the entry stored for `key`.
    pub async fn get(&self, key: &str) -> Result<Option<(CacheEntry, String)>, CacheError> {
        match self.get_conditional(key, None).await? {
            Fetched::Found { value, version } => Ok(Some((value, version))),
            Fetched::Unchanged | Fetched::Missing => Ok(None),
        }
    }

    /// Read the entry for `key`, skipping the body when `version` still matches.
    pub async fn get_conditional(
        &self,
        key: &str,
        version: Option<&str>,
    ) -> Result<Fetched<CacheEntry>, CacheError> {
        let store_key = self.entry_key(key);
        match self.read(&store_key, version).await? {
            BlobRead::Found { data, version } => Ok(Fetched::Found {
                value: codec::decode_entry(key, &data)?,
                version,
            }),
            BlobRead::Unchanged => Ok(Fetched::Unchanged),
            BlobRead::NotFound => Ok(Fetched::Missing),
        }
    }

    /// Write `entry` and return its new version tag.
    pub async fn set(&self, entry: &CacheEntry) -> Result<String, CacheError> {
        let data = codec::entry_to_bytes(entry)?;
        self.write(&self.entry_key(entry.key()), data).await
    }

    pub async fn get_tag_manifest(
        &self,
        tag: &str,
    ) -> Result<Option<(TagManifestRecord, String)>, CacheError> {
        match self.read(&self.tag_key(tag), None).await? {
            BlobRead::Found { data, version } => {
                Ok(Some((codec::decode_manifest(tag, &data)?, version)))
            }
            BlobRead::Unchanged | BlobRead::NotFound => Ok(None),
        }
    }

    pub async fn set_tag_manifest(&self, record: &TagManifestRecord) -> Result<String, CacheError> {
        let data = codec::manifest_to_bytes(record)?;
        self.write(&self.tag_key(&record.tag), data).await
    }

    async fn read(&self, store_key: &str, version: Option<&str>) -> Result<BlobRead, CacheError> {
        let result = self
            .bounded(self.backend.get_with_metadata(store_key, version))
            .await;

        let outcome = match &result {
            Ok(BlobRead::Found { .. }) => "hit",
            Ok(BlobRead::Unchanged) => "unchanged",
            Ok(BlobRead::NotFound) => "miss",
            Err(_) => "error",
        };
        counter!(METRIC_STORE_READ, "outcome" => outcome).increment(1);
        debug!(
            cache = "store",
            backend = self.backend.name(),
            key = store_key,
            outcome,
            "store read"
        );

        result.map_err(CacheError::from)
    }

    async fn write(&self, store_key: &str, data: Bytes) -> Result<String, CacheError> {
        let result = self.bounded(self.backend.set(store_key, data)).await;

        let outcome = if result.is_ok() { "ok" } else { "error" };
        counter!(METRIC_STORE_WRITE, "outcome" => outcome).increment(1);
        debug!(
            cache = "store",
            backend = self.backend.name(),
            key = store_key,
            outcome,
            "store write"
        );

        result.map_err(CacheError::from)
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| StoreError::Timeout)?,
            None => call.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::Artifact;

    fn client() -> (Arc<MemoryBlobStore>, StoreClient) {
        let backend = Arc::new(MemoryBlobStore::new());
        (backend.clone(), StoreClient::new(backend))
    }

    #[tokio::test]
    async fn memory_store_answers_unchanged_for_current_version() {
        let store = MemoryBlobStore::new();
        let version = store.set("k", Bytes::from_static(b"v1")).await.expect("set");
        assert_eq!(version, content_version(b"v1"));

        let read = store.get_with_metadata("k", Some(&version)).await.expect("get");
        assert_eq!(read, BlobRead::Unchanged);

        let read = store.get_with_metadata("k", Some("other")).await.expect("get");
        assert!(matches!(read, BlobRead::Found { .. }));

        let read = store.get_with_metadata("missing", None).await.expect("get");
        assert_eq!(read, BlobRead::NotFound);
    }

    #[tokio::test]
    async fn entries_roundtrip_through_encoded_keys() {
        let (backend, client) = client();
        let entry = CacheEntry::new("/blog/post-1", Artifact::route("hello", 200), 5, Vec::new());

        let version = client.set(&entry).await.expect("set");
        assert!(backend.raw(&client.entry_key("/blog/post-1")).is_some());

        let (read, read_version) = client.get("/blog/post-1").await.expect("get").expect("found");
        assert_eq!(read, entry);
        assert_eq!(read_version, version);

        let unchanged = client
            .get_conditional("/blog/post-1", Some(&version))
            .await
            .expect("conditional");
        assert_eq!(unchanged, Fetched::Unchanged);
    }

    #[tokio::test]
    async fn namespaces_do_not_share_entries() {
        let backend = Arc::new(MemoryBlobStore::new());
        let first = StoreClient::new(backend.clone()).with_namespace("build-1");
        let second = StoreClient::new(backend).with_namespace("build-2");

        let entry = CacheEntry::new("/a", Artifact::route("a", 200), 1, Vec::new());
        first.set(&entry).await.expect("set");

        assert!(first.get("/a").await.expect("get").is_some());
        assert!(second.get("/a").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn tag_manifests_live_apart_from_entries() {
        let (_, client) = client();
        let record = TagManifestRecord {
            tag: "/a".to_string(),
            revalidated_at: 10,
        };
        client.set_tag_manifest(&record).await.expect("set");

        assert!(client.get("/a").await.expect("get").is_none());
        let (read, _) = client
            .get_tag_manifest("/a")
            .await
            .expect("get")
            .expect("found");
        assert_eq!(read, record);
    }

    struct Slow;

    #[async_trait]
    impl BlobStore for Slow {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn get_with_metadata(
            &self,
            _key: &str,
            _if_none_match: Option<&str>,
        ) -> Result<BlobRead, StoreError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(BlobRead::NotFound)
        }

        async fn set(&self, _key: &str, _data: Bytes) -> Result<String, StoreError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(String::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_backends_time_out() {
        let client = StoreClient::new(Arc::new(Slow)).with_timeout(Duration::from_millis(100));
        let error = client.get("/a").await.expect_err("timeout");
        assert_eq!(error.kind(), "store_timeout");
    }
}
