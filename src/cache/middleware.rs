//! Response caching layer.
//!
//! Serves GET requests from ROUTE entries keyed by path and query, stores
//! cacheable 200 responses, and makes sure every request's background work is
//! drained: through the configured [`AfterResponse`] primitive when present,
//! otherwise by holding the response body open until the drain completes.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    body::{Body, HttpBody},
    extract::State,
    http::{
        HeaderMap, HeaderValue, Method, Request, StatusCode,
        header::{AGE, CACHE_CONTROL, CONTENT_LENGTH},
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use bytes::{Bytes, BytesMut};
use futures::future::{self, BoxFuture};
use futures::{StreamExt, stream};
use tracing::{debug, instrument, warn};

use super::background::{AfterResponse, DrainReport, Settlement};
use super::entry::{Artifact, ArtifactBody, CacheHit, EntryKind, Revalidate, now_millis};
use super::handler::{CacheHandler, GetContext, SetContext};
use super::keys;
use super::scope::{self, RequestContext};

/// Response header reporting how the cache answered.
pub const X_CACHE: &str = "x-cache";

const MAX_CACHEABLE_BODY: usize = 1024 * 1024;

/// Shared state of [`artifact_cache_layer`].
#[derive(Clone)]
pub struct CacheState {
    pub handler: CacheHandler,
    pub after_response: Option<Arc<dyn AfterResponse>>,
}

impl CacheState {
    pub fn new(handler: CacheHandler) -> Self {
        Self {
            handler,
            after_response: None,
        }
    }

    pub fn with_after_response(mut self, after_response: Arc<dyn AfterResponse>) -> Self {
        self.after_response = Some(after_response);
        self
    }
}

/// Middleware binding a request scope and caching ROUTE responses.
#[instrument(skip_all, fields(path = %request.uri().path()))]
pub async fn artifact_cache_layer(
    State(cache): State<CacheState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let context = RequestContext::new();
    let response = scope::with_request_scope(
        Arc::clone(&context),
        serve(&cache.handler, &context, request, next),
    )
    .await;

    match context.background().settle(cache.after_response.as_deref()) {
        Settlement::Idle | Settlement::Deferred => response,
        Settlement::HoldOpen(drain) => hold_open(response, drain),
    }
}

async fn serve(
    handler: &CacheHandler,
    context: &RequestContext,
    request: Request<Body>,
    next: Next,
) -> Response {
    if request.method() != Method::GET {
        return next.run(request).await;
    }

    let path = request.uri().path().to_string();
    let key = match request.uri().query() {
        Some(query) => format!("{path}?{query}"),
        None => path.clone(),
    };
    let lookup = GetContext {
        soft_tags: keys::derived_tags(&path),
        ..Default::default()
    };

    let label = match handler.get(context, &key, &lookup).await {
        Some(hit) if hit.entry.kind() == EntryKind::Route => {
            if !hit.is_stale() {
                debug!(cache = "response", outcome = "hit", "serving cached response");
                return cached_response(&hit);
            }
            "STALE"
        }
        _ => "MISS",
    };
    debug!(cache = "response", outcome = label, "rendering response");

    let response = next.run(request).await;
    if response.status() != StatusCode::OK {
        return response;
    }
    let Some(max_age) = shared_max_age(response.headers()) else {
        return with_cache_label(response, label);
    };

    let (parts, body) = response.into_parts();
    let bytes = match buffer_body(body, MAX_CACHEABLE_BODY).await {
        Buffered::Complete(bytes) => bytes,
        Buffered::Passthrough(body) => {
            return with_cache_label(Response::from_parts(parts, body), label);
        }
    };

    let artifact = Artifact {
        body: ArtifactBody::Route {
            body: bytes.clone(),
            status: parts.status.as_u16(),
        },
        headers: storable_headers(&parts.headers),
        revalidate: Some(Revalidate::After(max_age)),
    };
    handler.set(context, &key, artifact, &SetContext::default());

    with_cache_label(Response::from_parts(parts, Body::from(bytes)), label)
}

enum Buffered {
    Complete(Bytes),
    /// Body that is not cached; already-read chunks are replayed first.
    Passthrough(Body),
}

/// Collect `body` when it fits in `limit` bytes.
async fn buffer_body(body: Body, limit: usize) -> Buffered {
    if body.size_hint().lower() > limit as u64 {
        debug!(cache = "response", "response body too large to cache");
        return Buffered::Passthrough(body);
    }

    let mut chunks = body.into_data_stream();
    let mut read = Vec::new();
    let mut total = 0_usize;
    while let Some(chunk) = chunks.next().await {
        match chunk {
            Ok(chunk) => {
                total += chunk.len();
                read.push(chunk);
                if total > limit {
                    debug!(cache = "response", "response body too large to cache");
                    let head = stream::iter(read.into_iter().map(Ok::<Bytes, axum::Error>));
                    return Buffered::Passthrough(Body::from_stream(head.chain(chunks)));
                }
            }
            Err(error) => {
                warn!(cache = "response", error = %error, "failed to buffer response body");
                let head = stream::iter(read.into_iter().map(Ok::<Bytes, axum::Error>));
                let tail = stream::once(future::ready(Err(error)));
                return Buffered::Passthrough(Body::from_stream(head.chain(tail)));
            }
        }
    }

    let mut bytes = BytesMut::with_capacity(total);
    for chunk in read {
        bytes.extend_from_slice(&chunk);
    }
    Buffered::Complete(bytes.freeze())
}

/// `s-maxage` of a shareable response, if it has one.
fn shared_max_age(headers: &HeaderMap) -> Option<u32> {
    let value = headers.get(CACHE_CONTROL)?.to_str().ok()?;
    let mut max_age = None;
    for directive in value.split(',').map(str::trim) {
        let directive = directive.to_ascii_lowercase();
        if directive == "no-store" || directive == "private" {
            return None;
        }
        if let Some(seconds) = directive.strip_prefix("s-maxage=") {
            max_age = seconds.trim_matches('"').parse().ok();
        }
    }
    max_age
}

fn storable_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter(|(name, _)| **name != CONTENT_LENGTH && **name != AGE && name.as_str() != X_CACHE)
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

fn with_cache_label(mut response: Response, label: &'static str) -> Response {
    response
        .headers_mut()
        .insert(X_CACHE, HeaderValue::from_static(label));
    response
}

fn cached_response(hit: &CacheHit) -> Response {
    let ArtifactBody::Route { body, status } = hit.entry.body() else {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };

    let mut builder = Response::builder().status(*status);
    for (name, value) in hit.entry.headers() {
        if let Ok(header_value) = HeaderValue::from_str(value) {
            builder = builder.header(name.as_str(), header_value);
        }
    }
    builder = builder.header(X_CACHE, "HIT");
    if let Some(age) = hit.age(now_millis()) {
        builder = builder.header(AGE, age.as_secs());
    }

    builder
        .body(Body::from(body.clone()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Keep the body stream open until `drain` finishes.
fn hold_open(response: Response, drain: BoxFuture<'static, DrainReport>) -> Response {
    let (parts, body) = response.into_parts();
    let body = async_stream::stream! {
        let mut chunks = body.into_data_stream();
        while let Some(chunk) = chunks.next().await {
            yield chunk;
        }
        let report = drain.await;
        debug!(
            cache = "response",
            completed = report.completed,
            failed = report.failed,
            "background work drained before closing response"
        );
    };
    Response::from_parts(parts, Body::from_stream(body))
}
