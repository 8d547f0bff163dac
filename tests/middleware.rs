mod support;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use artifact_cache::cache::{
    AfterResponse, CacheHandler, CacheState, RequestContext, StoreClient, X_CACHE,
    artifact_cache_layer, keys, scope,
};
use axum::{
    Router,
    body::Body,
    http::{
        HeaderName, Request, StatusCode,
        header::{AGE, CACHE_CONTROL},
    },
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream;
use support::memory_handler;
use tower::ServiceExt;

const LARGE_BODY: usize = 2 * 1024 * 1024;

fn app(state: CacheState, renders: Arc<AtomicUsize>) -> Router {
    Router::new()
        .route(
            "/posts",
            get(move || {
                let renders = Arc::clone(&renders);
                async move {
                    renders.fetch_add(1, Ordering::SeqCst);
                    (
                        [
                            (CACHE_CONTROL, "public, s-maxage=60"),
                            (HeaderName::from_static(keys::CACHE_TAGS_HEADER), "posts"),
                        ],
                        "[\"hello\"]",
                    )
                }
            }),
        )
        .route("/private", get(|| async { ([(CACHE_CONTROL, "private")], "secret") }))
        .route(
            "/whoami",
            get(|| async {
                match scope::current() {
                    Some(context) => context.id().to_string().into_response(),
                    None => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
                }
            }),
        )
        .route(
            "/large",
            get(|| async {
                (
                    [(CACHE_CONTROL, "public, s-maxage=60")],
                    vec![b'x'; LARGE_BODY],
                )
            }),
        )
        .route(
            "/streamed",
            get(|| async {
                let chunks = stream::iter(
                    (0..3).map(|_| Ok::<_, std::io::Error>(Bytes::from(vec![b'y'; 512 * 1024]))),
                );
                ([(CACHE_CONTROL, "public, s-maxage=60")], Body::from_stream(chunks))
            }),
        )
        .route("/submit", post(|| async { StatusCode::CREATED }))
        .layer(middleware::from_fn_with_state(state, artifact_cache_layer))
}

async fn send(app: &Router, method: &str, uri: &str) -> (Response, Vec<u8>) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("response");
    let (parts, body) = response.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .expect("body")
        .to_vec();
    (Response::from_parts(parts, Body::empty()), bytes)
}

fn cache_label(response: &Response) -> Option<&str> {
    response
        .headers()
        .get(X_CACHE)
        .and_then(|value| value.to_str().ok())
}

async fn revalidate(handler: &CacheHandler, tag: &str) {
    let request = RequestContext::new();
    handler.revalidate_tag(&request, [tag]);
    request.background().drain_all().await;
}

#[tokio::test]
async fn second_request_is_served_from_cache() {
    let (_, handler) = memory_handler();
    let renders = Arc::new(AtomicUsize::new(0));
    let app = app(CacheState::new(handler), Arc::clone(&renders));

    let (first, body) = send(&app, "GET", "/posts").await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(cache_label(&first), Some("MISS"));
    assert_eq!(body, b"[\"hello\"]");

    let (second, body) = send(&app, "GET", "/posts").await;
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(cache_label(&second), Some("HIT"));
    assert!(second.headers().contains_key(AGE));
    assert_eq!(
        second.headers().get(CACHE_CONTROL).and_then(|v| v.to_str().ok()),
        Some("public, s-maxage=60")
    );
    assert_eq!(body, b"[\"hello\"]");
    assert_eq!(renders.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn response_tags_drive_revalidation() {
    let (_, handler) = memory_handler();
    let renders = Arc::new(AtomicUsize::new(0));
    let app = app(CacheState::new(handler.clone()), Arc::clone(&renders));

    send(&app, "GET", "/posts").await;
    let (cached, _) = send(&app, "GET", "/posts").await;
    assert_eq!(cache_label(&cached), Some("HIT"));

    revalidate(&handler, "posts").await;

    let (rendered, _) = send(&app, "GET", "/posts").await;
    assert_eq!(cache_label(&rendered), Some("MISS"));
    assert_eq!(renders.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn query_strings_are_part_of_the_key() {
    let (_, handler) = memory_handler();
    let renders = Arc::new(AtomicUsize::new(0));
    let app = app(CacheState::new(handler), Arc::clone(&renders));

    send(&app, "GET", "/posts?page=1").await;
    let (other, _) = send(&app, "GET", "/posts?page=2").await;
    assert_eq!(cache_label(&other), Some("MISS"));

    let (same, _) = send(&app, "GET", "/posts?page=1").await;
    assert_eq!(cache_label(&same), Some("HIT"));
    assert_eq!(renders.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn uncacheable_responses_are_not_stored() {
    let (backend, handler) = memory_handler();
    let app = app(CacheState::new(handler), Arc::new(AtomicUsize::new(0)));

    let (first, _) = send(&app, "GET", "/private").await;
    assert_eq!(cache_label(&first), Some("MISS"));
    let (second, body) = send(&app, "GET", "/private").await;
    assert_eq!(cache_label(&second), Some("MISS"));
    assert_eq!(body, b"secret");
    let key = StoreClient::new(backend.clone()).entry_key("/private");
    assert!(backend.raw(&key).is_none());
}

#[tokio::test]
async fn oversized_responses_pass_through_uncached() {
    let (backend, handler) = memory_handler();
    let app = app(CacheState::new(handler), Arc::new(AtomicUsize::new(0)));

    for _ in 0..2 {
        let (response, body) = send(&app, "GET", "/large").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(cache_label(&response), Some("MISS"));
        assert_eq!(body.len(), LARGE_BODY);
    }
    let key = StoreClient::new(backend.clone()).entry_key("/large");
    assert!(backend.raw(&key).is_none());
}

#[tokio::test]
async fn streamed_bodies_over_the_limit_are_replayed_intact() {
    let (backend, handler) = memory_handler();
    let app = app(CacheState::new(handler), Arc::new(AtomicUsize::new(0)));

    let (response, body) = send(&app, "GET", "/streamed").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(cache_label(&response), Some("MISS"));
    assert_eq!(body.len(), 3 * 512 * 1024);
    assert!(body.iter().all(|byte| *byte == b'y'));

    let key = StoreClient::new(backend.clone()).entry_key("/streamed");
    assert!(backend.raw(&key).is_none());
}

#[tokio::test]
async fn non_get_requests_pass_through() {
    let (_, handler) = memory_handler();
    let app = app(CacheState::new(handler), Arc::new(AtomicUsize::new(0)));

    let (response, _) = send(&app, "POST", "/submit").await;
    assert_eq!(response.status(), StatusCode::CREATED);
    assert!(response.headers().get(X_CACHE).is_none());
}

#[tokio::test]
async fn handlers_see_the_request_scope() {
    let (_, handler) = memory_handler();
    let app = app(CacheState::new(handler), Arc::new(AtomicUsize::new(0)));

    let (first, first_id) = send(&app, "GET", "/whoami").await;
    let (_, second_id) = send(&app, "GET", "/whoami").await;
    assert_eq!(first.status(), StatusCode::OK);
    assert!(!first_id.is_empty());
    assert_ne!(first_id, second_id);
}

#[derive(Default)]
struct RecordingAfterResponse {
    calls: AtomicUsize,
}

impl AfterResponse for RecordingAfterResponse {
    fn after_response(&self, work: BoxFuture<'static, ()>) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(work);
    }
}

#[tokio::test]
async fn platform_primitive_receives_pending_work() {
    let (_, handler) = memory_handler();
    let platform = Arc::new(RecordingAfterResponse::default());
    let state = CacheState::new(handler).with_after_response(platform.clone());
    let app = app(state, Arc::new(AtomicUsize::new(0)));

    send(&app, "GET", "/posts").await;
    assert_eq!(platform.calls.load(Ordering::SeqCst), 1);

    send(&app, "POST", "/submit").await;
    assert_eq!(platform.calls.load(Ordering::SeqCst), 1);
}
