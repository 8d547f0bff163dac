//! Cache handler: `get`, `set` and `revalidate_tag` over the memo tiers, the
//! durable store and the tag resolver.
//!
//! Reads never fail: store and decode errors become misses. Writes are applied
//! to the request's memo tier at once and to the store as tracked background
//! work, so the caller continues rendering while they land.

use std::collections::BTreeSet;
use std::sync::Arc;

use artifact_cache_types::TagManifestRecord;
use futures::FutureExt;
use tracing::{debug, instrument, warn};

use super::config::CacheConfig;
use super::entry::{Artifact, CacheEntry, CacheHit, EntryKind, Freshness, now_millis};
use super::keys;
use super::memo::{Lookup, MemoCache, Memoized, RequestId, Versioned};
use super::purge::CdnPurger;
use super::scope::RequestContext;
use super::store::{Fetched, StoreClient};
use super::tags::TagResolver;

/// Caller-supplied context of a read.
#[derive(Debug, Clone, Default)]
pub struct GetContext {
    /// Explicit tags the caller depends on.
    pub tags: Vec<String>,
    /// Implicit tags, usually [`keys::derived_tags`] of the request path.
    pub soft_tags: Vec<String>,
    /// Return tag-invalidated entries as [`Freshness::Stale`] instead of `None`.
    pub allow_stale: bool,
}

/// Caller-supplied context of a write.
#[derive(Debug, Clone, Default)]
pub struct SetContext {
    pub tags: Vec<String>,
    /// The write is an explicit on-demand revalidation; purge the resource's
    /// default tag at the edge.
    pub on_demand: bool,
}

struct HandlerInner {
    store: StoreClient,
    memo: Arc<MemoCache>,
    tags: TagResolver,
    purger: Arc<dyn CdnPurger>,
}

#[derive(Clone)]
pub struct CacheHandler {
    inner: Arc<HandlerInner>,
}

impl CacheHandler {
    pub fn new(store: StoreClient, config: &CacheConfig, purger: Arc<dyn CdnPurger>) -> Self {
        let memo = Arc::new(MemoCache::new(config));
        let tags = TagResolver::new(store.clone(), Arc::clone(&memo));
        Self {
            inner: Arc::new(HandlerInner {
                store,
                memo,
                tags,
                purger,
            }),
        }
    }

    pub fn memo(&self) -> &Arc<MemoCache> {
        &self.inner.memo
    }

    pub fn store(&self) -> &StoreClient {
        &self.inner.store
    }

    pub fn tags(&self) -> &TagResolver {
        &self.inner.tags
    }

    /// Look up `key` for `request`.
    ///
    /// `None` means the caller must render and [`set`](Self::set).
    #[instrument(skip_all, fields(key = %key, request_id = %request.id()))]
    pub async fn get(
        &self,
        request: &RequestContext,
        key: &str,
        context: &GetContext,
    ) -> Option<CacheHit> {
        let entry = self.load(request.id(), key).await?;

        let mut tags: BTreeSet<String> = entry.tags().clone();
        tags.extend(context.tags.iter().cloned());
        if entry.kind() != EntryKind::Fetch {
            tags.extend(context.soft_tags.iter().cloned());
        }

        let last_modified = (!entry.is_marked_stale()).then(|| entry.last_modified());
        if self.inner.tags.is_stale(request, &tags, last_modified).await {
            if !context.allow_stale {
                debug!(cache = "handler", outcome = "tag_stale", "entry invalidated by tag");
                return None;
            }
            return Some(CacheHit {
                entry,
                freshness: Freshness::Stale,
            });
        }

        let freshness = if entry.is_marked_stale() || entry.is_expired(now_millis()) {
            Freshness::Stale
        } else {
            Freshness::Fresh
        };
        debug!(cache = "handler", outcome = "hit", ?freshness, "serving cached entry");
        Some(CacheHit { entry, freshness })
    }

    /// Store a freshly rendered artifact for `key`.
    ///
    /// The write is visible to this request immediately; the durable write and
    /// any purge are tracked on the request's background work.
    #[instrument(skip_all, fields(key = %key, request_id = %request.id()))]
    pub fn set(
        &self,
        request: &RequestContext,
        key: &str,
        artifact: Artifact,
        context: &SetContext,
    ) -> Arc<CacheEntry> {
        let entry = Arc::new(CacheEntry::new(
            key,
            artifact,
            now_millis(),
            context.tags.iter().cloned(),
        ));
        let memo_key = self.inner.store.entry_key(key);
        self.inner.memo.put(
            request.id(),
            &memo_key,
            Some(Versioned::new(Memoized::Entry(Arc::clone(&entry)), None)),
        );

        let inner = Arc::clone(&self.inner);
        let written = Arc::clone(&entry);
        let request_id = request.id();
        request.background().track("store_write", async move {
            let version = inner.store.set(&written).await?;
            inner.memo.promote(request_id, &memo_key, &written, version);
            Ok(())
        });

        if context.on_demand {
            self.track_purge(request, vec![keys::default_tag(key)]);
        }

        debug!(cache = "handler", kind = %entry.kind(), tags = entry.tags().len(), "entry written");
        entry
    }

    /// Invalidate every entry carrying any of `tags`.
    #[instrument(skip_all, fields(request_id = %request.id()))]
    pub fn revalidate_tag<I, S>(&self, request: &RequestContext, tags: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let revalidated_at = now_millis();
        let unique: BTreeSet<String> = tags
            .into_iter()
            .map(Into::into)
            .filter(|tag| !tag.is_empty())
            .collect();

        for tag in unique {
            request.mark_revalidated(&tag);

            let record = TagManifestRecord {
                tag: tag.clone(),
                revalidated_at,
            };
            self.inner.memo.put(
                request.id(),
                &self.inner.store.tag_key(&tag),
                Some(Versioned::new(Memoized::Manifest(record.clone()), None)),
            );

            let inner = Arc::clone(&self.inner);
            request.background().track("tag_manifest_write", async move {
                inner.store.set_tag_manifest(&record).await.map(|_| ())
            });

            debug!(cache = "handler", tag = %tag, revalidated_at, "tag revalidated");
            self.track_purge(request, vec![tag]);
        }
    }

    fn track_purge(&self, request: &RequestContext, tags: Vec<String>) {
        let purger = Arc::clone(&self.inner.purger);
        request
            .background()
            .track("purge", async move { purger.purge(&tags).await });
    }

    async fn load(&self, request: RequestId, key: &str) -> Option<Arc<CacheEntry>> {
        let memo_key = self.inner.store.entry_key(key);
        let inner = Arc::clone(&self.inner);
        let owned_key = key.to_string();

        let lookup = self
            .inner
            .memo
            .get_or_fetch(request, &memo_key, move || {
                async move { inner.fetch_entry(&owned_key).await }.boxed()
            })
            .await;

        lookup.and_then(|value| value.entry().cloned())
    }
}

impl HandlerInner {
    /// Read `key` from the store, conditionally on the version another request
    /// already holds in the global tier.
    async fn fetch_entry(&self, key: &str) -> Lookup {
        let known = self.memo.global(&self.store.entry_key(key));
        let known_version = known.as_ref().and_then(|value| value.version.as_deref());

        match self.store.get_conditional(key, known_version).await {
            Ok(Fetched::Found { value, version }) => Some(Versioned::new(
                Memoized::Entry(Arc::new(value)),
                Some(version),
            )),
            Ok(Fetched::Unchanged) => {
                debug!(cache = "handler", key, outcome = "unchanged", "reusing entry held by another request");
                known
            }
            Ok(Fetched::Missing) => None,
            Err(error) => {
                warn!(
                    cache = "handler",
                    key,
                    error_kind = error.kind(),
                    error = %error,
                    "cache read failed; treating as miss"
                );
                None
            }
        }
    }
}
