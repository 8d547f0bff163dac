//! Request scope propagation.
//!
//! The middleware binds a [`RequestContext`] to the serving task with
//! `tokio::task_local!`, so render code further down can reach the same
//! per-request memo records and background tracker via [`current`].
//! Spawned tasks do not inherit the scope; they must capture what they need.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use super::background::BackgroundWork;
use super::lock::lock;
use super::memo::RequestId;

const SOURCE: &str = "cache::scope";

tokio::task_local! {
    static REQUEST: Arc<RequestContext>;
}

/// State owned by one request.
pub struct RequestContext {
    id: RequestId,
    revalidated_tags: Mutex<HashSet<String>>,
    background: Arc<BackgroundWork>,
}

impl RequestContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            revalidated_tags: Mutex::new(HashSet::new()),
            background: Arc::new(BackgroundWork::new()),
        })
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn background(&self) -> &Arc<BackgroundWork> {
        &self.background
    }

    /// Remember that `tag` was revalidated during this request.
    pub fn mark_revalidated(&self, tag: &str) {
        lock(&self.revalidated_tags, SOURCE, "mark_revalidated").insert(tag.to_string());
    }

    /// True if any of `tags` was revalidated during this request.
    pub fn any_revalidated<'a, I>(&self, tags: I) -> bool
    where
        I: IntoIterator<Item = &'a String>,
    {
        let revalidated = lock(&self.revalidated_tags, SOURCE, "any_revalidated");
        if revalidated.is_empty() {
            return false;
        }
        tags.into_iter().any(|tag| revalidated.contains(tag))
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("id", &self.id)
            .field("pending", &self.background.pending())
            .finish()
    }
}

/// Request bound to the current task, if any.
pub fn current() -> Option<Arc<RequestContext>> {
    REQUEST.try_with(Arc::clone).ok()
}

/// Run `future` with `context` bound as the current request.
pub async fn with_request_scope<F>(context: Arc<RequestContext>, future: F) -> F::Output
where
    F: Future,
{
    REQUEST.scope(context, future).await
}
