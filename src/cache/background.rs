//! Background work tracker.
//!
//! Cache writes, tag manifest writes and CDN purges never block response
//! delivery. They are spawned immediately and registered here, and the request
//! is only considered finished once [`BackgroundWork::drain_all`] has observed
//! an empty pending set.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::future::{BoxFuture, FutureExt, join_all};
use metrics::{counter, histogram};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::error::CacheError;
use super::lock::lock;

const SOURCE: &str = "cache::background";

const METRIC_BACKGROUND_FAILED: &str = "artifact_cache_background_failed_total";
const METRIC_DRAIN_MS: &str = "artifact_cache_drain_ms";

struct TrackedTask {
    label: &'static str,
    handle: JoinHandle<Result<(), CacheError>>,
}

/// Summary of one [`BackgroundWork::drain_all`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub completed: usize,
    pub failed: usize,
}

impl DrainReport {
    pub fn total(&self) -> usize {
        self.completed + self.failed
    }
}

/// Registry of in-flight work belonging to one request.
#[derive(Default)]
pub struct BackgroundWork {
    pending: Mutex<Vec<TrackedTask>>,
}

impl BackgroundWork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `task` and register it. Failures are logged and counted here;
    /// they never surface to the caller that registered the task.
    pub fn track<F>(&self, label: &'static str, task: F)
    where
        F: Future<Output = Result<(), CacheError>> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let result = task.await;
            if let Err(error) = &result {
                counter!(METRIC_BACKGROUND_FAILED, "task" => label).increment(1);
                warn!(
                    cache = "background",
                    task = label,
                    error_kind = error.kind(),
                    error = %error,
                    "background cache task failed"
                );
            }
            result
        });

        lock(&self.pending, SOURCE, "track").push(TrackedTask { label, handle });
    }

    /// Number of registered tasks not yet collected by a drain.
    pub fn pending(&self) -> usize {
        lock(&self.pending, SOURCE, "pending").len()
    }

    /// Wait until every registered task has finished, including tasks
    /// registered while the drain is running.
    pub async fn drain_all(&self) -> DrainReport {
        let started = Instant::now();
        let mut report = DrainReport::default();

        loop {
            let batch = std::mem::take(&mut *lock(&self.pending, SOURCE, "drain"));
            if batch.is_empty() {
                break;
            }

            let labels: Vec<&'static str> = batch.iter().map(|task| task.label).collect();
            let results = join_all(batch.into_iter().map(|task| task.handle)).await;
            for (label, result) in labels.into_iter().zip(results) {
                match result {
                    Ok(Ok(())) => report.completed += 1,
                    Ok(Err(_)) => report.failed += 1,
                    Err(join_error) => {
                        counter!(METRIC_BACKGROUND_FAILED, "task" => label).increment(1);
                        warn!(
                            cache = "background",
                            task = label,
                            error = %join_error,
                            "background cache task aborted"
                        );
                        report.failed += 1;
                    }
                }
            }
        }

        histogram!(METRIC_DRAIN_MS).record(started.elapsed().as_secs_f64() * 1000.0);
        debug!(
            cache = "background",
            completed = report.completed,
            failed = report.failed,
            "background work drained"
        );
        report
    }

    /// Decide how the request's remaining work gets drained.
    ///
    /// A platform [`AfterResponse`] primitive is preferred; without one the
    /// caller receives the drain future and must hold the response open on it.
    pub fn settle(self: &Arc<Self>, after_response: Option<&dyn AfterResponse>) -> Settlement {
        if self.pending() == 0 {
            return Settlement::Idle;
        }

        let work = Arc::clone(self);
        match after_response {
            Some(platform) => {
                platform.after_response(
                    async move {
                        work.drain_all().await;
                    }
                    .boxed(),
                );
                Settlement::Deferred
            }
            None => Settlement::HoldOpen(async move { work.drain_all().await }.boxed()),
        }
    }
}

/// How outstanding background work will be awaited.
pub enum Settlement {
    /// Nothing was pending.
    Idle,
    /// Handed to the platform's after-response primitive.
    Deferred,
    /// The caller must keep the response open until this completes.
    HoldOpen(BoxFuture<'static, DrainReport>),
}

/// Platform primitive running work after the response has been delivered.
pub trait AfterResponse: Send + Sync {
    fn after_response(&self, work: BoxFuture<'static, ()>);
}

/// Runs after-response work as a detached task on the current runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioAfterResponse;

impl AfterResponse for TokioAfterResponse {
    fn after_response(&self, work: BoxFuture<'static, ()>) {
        tokio::spawn(work);
    }
}
