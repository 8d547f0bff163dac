//! Request-scoped memoization tiers.
//!
//! - **Per-request tier**: LRU keyed by `(request id, store key)`, bounded by
//!   record count and by the aggregate estimated size of its values. Two
//!   requests never observe or replace each other's records.
//! - **Global tier**: `store key -> Weak<Versioned>`. It never owns a value;
//!   handles stay alive only while some per-request record holds the same
//!   `Arc`. A live handle is advisory and only used to issue a conditional
//!   read against the durable store.
//!
//! Requests run on a multi-threaded runtime: the LRU sits behind a mutex and
//! the global tier is a sharded concurrent map. No lock is held across an
//! `.await`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use artifact_cache_types::TagManifestRecord;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use lru::LruCache;
use metrics::counter;
use tracing::debug;
use uuid::Uuid;

use super::config::CacheConfig;
use super::entry::CacheEntry;
use super::lock::lock;
use super::size;

const SOURCE: &str = "cache::memo";

const METRIC_MEMO_HIT: &str = "artifact_cache_memo_hit_total";
const METRIC_MEMO_MISS: &str = "artifact_cache_memo_miss_total";
const METRIC_MEMO_EVICT: &str = "artifact_cache_memo_evict_total";

/// Identifies one in-flight request.
pub type RequestId = Uuid;

/// A value read from, or written to, the durable store.
#[derive(Debug, Clone)]
pub enum Memoized {
    Entry(Arc<CacheEntry>),
    Manifest(TagManifestRecord),
}

/// A memoized value and the store version it was observed at, if known.
#[derive(Debug)]
pub struct Versioned {
    pub value: Memoized,
    pub version: Option<String>,
}

impl Versioned {
    pub fn new(value: Memoized, version: Option<String>) -> Arc<Self> {
        Arc::new(Self { value, version })
    }

    pub fn entry(&self) -> Option<&Arc<CacheEntry>> {
        match &self.value {
            Memoized::Entry(entry) => Some(entry),
            Memoized::Manifest(_) => None,
        }
    }

    pub fn manifest(&self) -> Option<&TagManifestRecord> {
        match &self.value {
            Memoized::Manifest(record) => Some(record),
            Memoized::Entry(_) => None,
        }
    }

    fn estimated_size(&self) -> usize {
        let value = match &self.value {
            Memoized::Entry(entry) => size::estimate_entry(entry),
            Memoized::Manifest(record) => size::estimate_manifest(record),
        };
        value + self.version.as_ref().map_or(0, String::len)
    }
}

/// Resolved lookup: `None` is a known miss.
pub type Lookup = Option<Arc<Versioned>>;

/// Lookup shared by every caller in the same request while it is unresolved.
pub type PendingLookup = Shared<BoxFuture<'static, Lookup>>;

enum Slot {
    Ready(Lookup),
    InFlight(PendingLookup),
}

impl Slot {
    fn estimated_size(&self) -> usize {
        match self {
            Self::Ready(Some(value)) => value.estimated_size(),
            Self::Ready(None) => size::MISS_SIZE,
            Self::InFlight(_) => size::IN_FLIGHT_SIZE,
        }
    }
}

type MemoKey = (RequestId, String);

struct RequestTier {
    records: LruCache<MemoKey, (Slot, usize)>,
    bytes: usize,
}

impl RequestTier {
    /// Insert `slot`, then evict least-recently-used records until the byte
    /// budget holds. Values larger than the whole budget are not kept.
    fn insert(&mut self, key: MemoKey, slot: Slot, budget: usize) -> bool {
        let size = slot.estimated_size();
        if size > budget {
            if let Some((_, old_size)) = self.records.pop(&key) {
                self.bytes = self.bytes.saturating_sub(old_size);
            }
            debug!(cache = "memo", size, budget, "value exceeds memo budget; not memoized");
            return false;
        }

        if let Some((old_key, (_, old_size))) = self.records.push(key.clone(), (slot, size)) {
            self.bytes = self.bytes.saturating_sub(old_size);
            if old_key != key {
                counter!(METRIC_MEMO_EVICT).increment(1);
            }
        }
        self.bytes += size;

        while self.bytes > budget {
            match self.records.pop_lru() {
                Some((_, (_, evicted))) => {
                    self.bytes = self.bytes.saturating_sub(evicted);
                    counter!(METRIC_MEMO_EVICT).increment(1);
                }
                None => break,
            }
        }
        true
    }
}

enum Claim {
    Ready(Lookup),
    Wait(PendingLookup),
    Owner(PendingLookup),
}

/// Two-tier memoization shared by all requests of one process.
pub struct MemoCache {
    budget: usize,
    sweep_interval: usize,
    requests: Option<Mutex<RequestTier>>,
    global: DashMap<String, Weak<Versioned>>,
    global_inserts: AtomicUsize,
}

impl MemoCache {
    pub fn new(config: &CacheConfig) -> Self {
        let requests = config.is_memo_enabled().then(|| {
            Mutex::new(RequestTier {
                records: LruCache::new(config.max_memo_records_non_zero()),
                bytes: 0,
            })
        });

        Self {
            budget: config.memory_budget_bytes,
            sweep_interval: config.global_sweep_interval_non_zero(),
            requests,
            global: DashMap::new(),
            global_inserts: AtomicUsize::new(0),
        }
    }

    /// False when the budget is zero: every lookup goes to the store.
    pub fn is_enabled(&self) -> bool {
        self.requests.is_some()
    }

    /// Resolved per-request value, if any. In-flight lookups report `None`.
    pub fn get(&self, request: RequestId, key: &str) -> Option<Lookup> {
        let tier = self.requests.as_ref()?;
        let mut tier = lock(tier, SOURCE, "get");
        match tier.records.get(&(request, key.to_string())) {
            Some((Slot::Ready(value), _)) => Some(value.clone()),
            _ => None,
        }
    }

    /// Record a resolved value for `request`, replacing whatever was there.
    pub fn put(&self, request: RequestId, key: &str, value: Lookup) {
        let Some(tier) = self.requests.as_ref() else {
            return;
        };

        let inserted = lock(tier, SOURCE, "put").insert(
            (request, key.to_string()),
            Slot::Ready(value.clone()),
            self.budget,
        );
        if inserted && let Some(value) = value.as_ref() {
            self.remember_global(key, value);
        }
    }

    /// Return the request's memoized value for `key`, or run `fetch` once and
    /// memoize its outcome. Concurrent callers in the same request share the
    /// same in-flight lookup.
    pub async fn get_or_fetch<F>(&self, request: RequestId, key: &str, fetch: F) -> Lookup
    where
        F: FnOnce() -> BoxFuture<'static, Lookup>,
    {
        let Some(tier) = self.requests.as_ref() else {
            return fetch().await;
        };

        let claim = {
            let mut tier = lock(tier, SOURCE, "claim");
            let memo_key = (request, key.to_string());
            let existing = match tier.records.get(&memo_key) {
                Some((Slot::Ready(value), _)) => Some(Claim::Ready(value.clone())),
                Some((Slot::InFlight(pending), _)) => Some(Claim::Wait(pending.clone())),
                None => None,
            };
            match existing {
                Some(claim) => claim,
                None => {
                    let pending = fetch().shared();
                    tier.insert(memo_key, Slot::InFlight(pending.clone()), self.budget);
                    Claim::Owner(pending)
                }
            }
        };

        match claim {
            Claim::Ready(value) => {
                counter!(METRIC_MEMO_HIT).increment(1);
                value
            }
            Claim::Wait(pending) => {
                counter!(METRIC_MEMO_HIT).increment(1);
                let value = pending.clone().await;
                self.resolve(request, key, &pending, value.clone());
                value
            }
            Claim::Owner(pending) => {
                counter!(METRIC_MEMO_MISS).increment(1);
                let value = pending.clone().await;
                self.resolve(request, key, &pending, value.clone());
                value
            }
        }
    }

    /// Replace an in-flight slot with its outcome, unless something newer
    /// (e.g. a write from the same request) replaced it meanwhile.
    fn resolve(&self, request: RequestId, key: &str, pending: &PendingLookup, value: Lookup) {
        let Some(tier) = self.requests.as_ref() else {
            return;
        };

        let inserted = {
            let mut tier = lock(tier, SOURCE, "resolve");
            let memo_key = (request, key.to_string());
            let replaceable = match tier.records.peek(&memo_key) {
                Some((Slot::InFlight(current), _)) => current.ptr_eq(pending),
                Some((Slot::Ready(_), _)) => false,
                None => true,
            };
            replaceable && tier.insert(memo_key, Slot::Ready(value.clone()), self.budget)
        };

        if inserted && let Some(value) = value.as_ref() {
            self.remember_global(key, value);
        }
    }

    /// Attach the store version to a value this request wrote, provided the
    /// request still holds exactly that value.
    pub fn promote(
        &self,
        request: RequestId,
        key: &str,
        entry: &Arc<CacheEntry>,
        version: String,
    ) -> bool {
        let Some(tier) = self.requests.as_ref() else {
            return false;
        };

        let versioned = Versioned::new(Memoized::Entry(Arc::clone(entry)), Some(version));
        {
            let mut tier = lock(tier, SOURCE, "promote");
            let memo_key = (request, key.to_string());
            let holds_entry = match tier.records.peek(&memo_key) {
                Some((Slot::Ready(Some(current)), _)) => current
                    .entry()
                    .is_some_and(|held| Arc::ptr_eq(held, entry)),
                _ => false,
            };
            if !holds_entry
                || !tier.insert(memo_key, Slot::Ready(Some(Arc::clone(&versioned))), self.budget)
            {
                return false;
            }
        }

        self.remember_global(key, &versioned);
        true
    }

    /// Live cross-request value for `key`, if its handle has not been reclaimed.
    pub fn global(&self, key: &str) -> Option<Arc<Versioned>> {
        let handle = self.global.get(key).map(|slot| slot.value().clone())?;
        match handle.upgrade() {
            Some(value) => Some(value),
            None => {
                self.global
                    .remove_if(key, |_, current| current.strong_count() == 0);
                None
            }
        }
    }

    fn remember_global(&self, key: &str, value: &Arc<Versioned>) {
        if value.version.is_none() {
            return;
        }
        self.global.insert(key.to_string(), Arc::downgrade(value));

        let inserts = self.global_inserts.fetch_add(1, Ordering::Relaxed) + 1;
        if inserts % self.sweep_interval == 0 {
            self.sweep();
        }
    }

    /// Drop global handles whose values have been reclaimed. Returns how many.
    pub fn sweep(&self) -> usize {
        let before = self.global.len();
        self.global.retain(|_, handle| handle.strong_count() > 0);
        let removed = before.saturating_sub(self.global.len());
        if removed > 0 {
            debug!(cache = "memo", removed, "swept reclaimed global handles");
        }
        removed
    }

    /// Aggregate estimated size of the per-request tier.
    pub fn bytes(&self) -> usize {
        self.requests
            .as_ref()
            .map_or(0, |tier| lock(tier, SOURCE, "bytes").bytes)
    }

    /// Number of per-request records.
    pub fn len(&self) -> usize {
        self.requests
            .as_ref()
            .map_or(0, |tier| lock(tier, SOURCE, "len").records.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of global handles, live or not yet swept.
    pub fn global_len(&self) -> usize {
        self.global.len()
    }
}
