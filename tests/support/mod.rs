#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use artifact_cache::cache::{
    BlobRead, BlobStore, CacheConfig, CacheError, CacheHandler, CdnPurger, MemoryBlobStore,
    NoopPurger, StoreClient, StoreError,
};
use async_trait::async_trait;
use bytes::Bytes;

/// Store that is never reachable.
pub struct Unreachable;

#[async_trait]
impl BlobStore for Unreachable {
    fn name(&self) -> &'static str {
        "unreachable"
    }

    async fn get_with_metadata(
        &self,
        _key: &str,
        _if_none_match: Option<&str>,
    ) -> Result<BlobRead, StoreError> {
        Err(StoreError::transient("connection refused"))
    }

    async fn set(&self, _key: &str, _data: Bytes) -> Result<String, StoreError> {
        Err(StoreError::transient("connection refused"))
    }
}

/// In-memory store with per-key read delays and read counters.
#[derive(Default)]
pub struct Scripted {
    inner: MemoryBlobStore,
    delays: Mutex<HashMap<String, Duration>>,
    reads: Mutex<HashMap<String, usize>>,
    total_reads: AtomicUsize,
}

impl Scripted {
    pub fn delay(&self, key: &str, delay: Duration) {
        self.delays
            .lock()
            .expect("delays lock")
            .insert(key.to_string(), delay);
    }

    pub fn reads(&self, key: &str) -> usize {
        self.reads
            .lock()
            .expect("reads lock")
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_reads(&self) -> usize {
        self.total_reads.load(Ordering::SeqCst)
    }

    pub fn raw(&self, key: &str) -> Option<Bytes> {
        self.inner.raw(key)
    }
}

#[async_trait]
impl BlobStore for Scripted {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn get_with_metadata(
        &self,
        key: &str,
        if_none_match: Option<&str>,
    ) -> Result<BlobRead, StoreError> {
        self.total_reads.fetch_add(1, Ordering::SeqCst);
        *self
            .reads
            .lock()
            .expect("reads lock")
            .entry(key.to_string())
            .or_default() += 1;

        let delay = self.delays.lock().expect("delays lock").get(key).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.get_with_metadata(key, if_none_match).await
    }

    async fn set(&self, key: &str, data: Bytes) -> Result<String, StoreError> {
        self.inner.set(key, data).await
    }
}

/// Purger recording every call, optionally failing each one.
#[derive(Default)]
pub struct RecordingPurger {
    calls: Mutex<Vec<Vec<String>>>,
    fail: bool,
}

impl RecordingPurger {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Recorded calls in a stable order.
    pub fn calls(&self) -> Vec<Vec<String>> {
        let mut calls = self.calls.lock().expect("calls lock").clone();
        calls.sort();
        calls
    }
}

#[async_trait]
impl CdnPurger for RecordingPurger {
    async fn purge(&self, tags: &[String]) -> Result<(), CacheError> {
        self.calls.lock().expect("calls lock").push(tags.to_vec());
        if self.fail {
            return Err(CacheError::purge(tags, "edge rejected purge"));
        }
        Ok(())
    }
}

pub fn handler_with_purger(
    backend: Arc<dyn BlobStore>,
    purger: Arc<dyn CdnPurger>,
) -> CacheHandler {
    CacheHandler::new(StoreClient::new(backend), &CacheConfig::default(), purger)
}

pub fn handler_with(backend: Arc<dyn BlobStore>, config: &CacheConfig) -> CacheHandler {
    CacheHandler::new(StoreClient::new(backend), config, Arc::new(NoopPurger))
}

pub fn memory_handler() -> (Arc<Scripted>, CacheHandler) {
    let backend = Arc::new(Scripted::default());
    let handler = handler_with(backend.clone(), &CacheConfig::default());
    (backend, handler)
}
