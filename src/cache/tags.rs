//! Tag staleness resolver.
//!
//! An entry is stale once any of its tags has a manifest whose
//! `revalidated_at` is not older than the entry's write time. Per-tag manifest
//! reads run concurrently; the first positive answer wins, while a negative
//! answer has to wait for every tag.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::FutureExt;
use futures::stream::{FuturesUnordered, StreamExt};
use metrics::counter;
use tracing::{debug, warn};

use super::entry::now_millis;
use super::memo::{MemoCache, Memoized, RequestId, Versioned};
use super::scope::RequestContext;
use super::store::StoreClient;

const METRIC_TAG_STALE: &str = "artifact_cache_tag_stale_total";

#[derive(Clone)]
pub struct TagResolver {
    store: StoreClient,
    memo: Arc<MemoCache>,
}

impl TagResolver {
    pub fn new(store: StoreClient, memo: Arc<MemoCache>) -> Self {
        Self { store, memo }
    }

    /// Whether an entry written at `last_modified` is invalidated by `tags`.
    ///
    /// An unknown write time is compared as "now": only revalidations from
    /// this instant on apply.
    pub async fn is_stale(
        &self,
        request: &RequestContext,
        tags: &BTreeSet<String>,
        last_modified: Option<i64>,
    ) -> bool {
        if tags.is_empty() {
            return false;
        }

        if request.any_revalidated(tags) {
            counter!(METRIC_TAG_STALE, "source" => "request").increment(1);
            debug!(cache = "tags", outcome = "stale", source = "request", "tag revalidated in this request");
            return true;
        }

        let since = last_modified.unwrap_or_else(now_millis);
        let mut checks: FuturesUnordered<_> = tags
            .iter()
            .map(|tag| self.revalidated_since(request.id(), tag, since))
            .collect();

        while let Some(stale) = checks.next().await {
            if stale {
                counter!(METRIC_TAG_STALE, "source" => "manifest").increment(1);
                return true;
            }
        }
        false
    }

    async fn revalidated_since(&self, request: RequestId, tag: &str, since: i64) -> bool {
        let revalidated_at = self.revalidated_at(request, tag).await;
        let stale = revalidated_at.is_some_and(|at| at >= since);
        if stale {
            debug!(cache = "tags", tag, since, ?revalidated_at, outcome = "stale", "tag manifest is newer than entry");
        }
        stale
    }

    /// Last revalidation time of `tag`, memoized for the request.
    pub async fn revalidated_at(&self, request: RequestId, tag: &str) -> Option<i64> {
        let store = self.store.clone();
        let owned_tag = tag.to_string();

        let lookup = self
            .memo
            .get_or_fetch(request, &self.store.tag_key(tag), move || {
                async move {
                    match store.get_tag_manifest(&owned_tag).await {
                        Ok(Some((record, _))) => {
                            Some(Versioned::new(Memoized::Manifest(record), None))
                        }
                        Ok(None) => None,
                        Err(error) => {
                            warn!(
                                cache = "tags",
                                tag = %owned_tag,
                                error_kind = error.kind(),
                                error = %error,
                                "tag manifest read failed; treating tag as not revalidated"
                            );
                            None
                        }
                    }
                }
                .boxed()
            })
            .await;

        lookup.and_then(|value| value.manifest().map(|record| record.revalidated_at))
    }
}
