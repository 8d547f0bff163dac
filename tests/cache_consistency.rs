mod support;

use std::sync::Arc;

use artifact_cache::cache::{
    Artifact, BlobStore, CacheConfig, CacheEntry, Freshness, GetContext, RequestContext, Revalidate,
    SetContext, StoreClient, keys, now_millis, size,
};
use serde_json::json;
use support::{Scripted, Unreachable, handler_with, memory_handler};

#[tokio::test]
async fn reads_observe_own_writes_with_unreachable_store() {
    let handler = handler_with(Arc::new(Unreachable), &CacheConfig::default());
    let request = RequestContext::new();

    assert!(handler.get(&request, "/a", &GetContext::default()).await.is_none());

    let written = handler.set(&request, "/a", Artifact::route("v", 200), &SetContext::default());
    let hit = handler
        .get(&request, "/a", &GetContext::default())
        .await
        .expect("own write is visible");
    assert!(Arc::ptr_eq(&hit.entry, &written));
    assert_eq!(hit.freshness, Freshness::Fresh);

    let report = request.background().drain_all().await;
    assert_eq!(report.failed, 1);

    let other = RequestContext::new();
    assert!(handler.get(&other, "/a", &GetContext::default()).await.is_none());
}

#[tokio::test]
async fn repeated_revalidation_is_idempotent() {
    let (_, handler) = memory_handler();
    let tagged = SetContext {
        tags: vec!["posts".to_string()],
        ..Default::default()
    };

    let writer = RequestContext::new();
    handler.set(&writer, "/posts", Artifact::route("[]", 200), &tagged);
    writer.background().drain_all().await;

    let once = RequestContext::new();
    handler.revalidate_tag(&once, ["posts"]);
    once.background().drain_all().await;

    let twice = RequestContext::new();
    handler.revalidate_tag(&twice, ["posts"]);
    twice.background().drain_all().await;

    let reader = RequestContext::new();
    assert!(handler.get(&reader, "/posts", &GetContext::default()).await.is_none());

    let stale = handler
        .get(
            &reader,
            "/posts",
            &GetContext {
                allow_stale: true,
                ..Default::default()
            },
        )
        .await
        .expect("stale entry");
    assert!(stale.is_stale());
    assert!(stale.age(now_millis()).is_none());
}

#[tokio::test]
async fn evicted_entries_are_fetched_again() {
    let sample = CacheEntry::new("/a", Artifact::route(vec![0_u8; 1_000], 200), 0, Vec::new());
    let config = CacheConfig {
        memory_budget_bytes: size::estimate_entry(&sample) * 2 + 200,
        ..Default::default()
    };
    let backend = Arc::new(Scripted::default());
    let handler = handler_with(backend.clone(), &config);
    let store = StoreClient::new(backend.clone());

    for key in ["/a", "/b", "/c"] {
        let entry = CacheEntry::new(key, Artifact::route(vec![0_u8; 1_000], 200), 1, Vec::new());
        store.set(&entry).await.expect("seed");
    }

    let request = RequestContext::new();
    for key in ["/a", "/b", "/a", "/b"] {
        assert!(handler.get(&request, key, &GetContext::default()).await.is_some());
    }
    assert_eq!(backend.reads(&store.entry_key("/a")), 1);

    assert!(handler.get(&request, "/c", &GetContext::default()).await.is_some());
    assert!(handler.memo().bytes() <= config.memory_budget_bytes);

    assert!(handler.get(&request, "/a", &GetContext::default()).await.is_some());
    assert_eq!(backend.reads(&store.entry_key("/a")), 2);
}

#[tokio::test]
async fn zero_budget_always_goes_to_the_store() {
    let backend = Arc::new(Scripted::default());
    let config = CacheConfig {
        memory_budget_bytes: 0,
        ..Default::default()
    };
    let handler = handler_with(backend.clone(), &config);
    let store = StoreClient::new(backend.clone());
    store
        .set(&CacheEntry::new("/a", Artifact::route("a", 200), 1, Vec::new()))
        .await
        .expect("seed");

    let request = RequestContext::new();
    for _ in 0..3 {
        assert!(handler.get(&request, "/a", &GetContext::default()).await.is_some());
    }
    assert_eq!(backend.reads(&store.entry_key("/a")), 3);
    assert!(handler.memo().is_empty());
}

#[tokio::test]
async fn far_future_write_times_are_served_stale() {
    let (backend, handler) = memory_handler();
    let store = StoreClient::new(backend.clone());
    let record = json!({
        "lastModified": i64::MAX,
        "revalidate": 60,
        "value": {"kind": "ROUTE", "body": "", "status": 200}
    });
    backend
        .set(&store.entry_key("/a"), record.to_string().into())
        .await
        .expect("seed");

    let request = RequestContext::new();
    let hit = handler
        .get(&request, "/a", &GetContext::default())
        .await
        .expect("entry is returned");
    assert_eq!(hit.freshness, Freshness::Stale);
}

#[tokio::test]
async fn concurrent_requests_keep_their_own_writes() {
    let (backend, handler) = memory_handler();
    let first = RequestContext::new();
    let second = RequestContext::new();

    handler.set(&first, "/k", Artifact::route("v1", 200), &SetContext::default());
    handler.set(&second, "/k", Artifact::route("v2", 200), &SetContext::default());

    let get_ctx = GetContext::default();
    let (seen_first, seen_second) = tokio::join!(
        handler.get(&first, "/k", &get_ctx),
        handler.get(&second, "/k", &get_ctx),
    );
    assert_eq!(body_of(&seen_first.expect("first")), b"v1");
    assert_eq!(body_of(&seen_second.expect("second")), b"v2");

    first.background().drain_all().await;
    second.background().drain_all().await;

    let stored = backend
        .raw(&StoreClient::new(backend.clone()).entry_key("/k"))
        .expect("stored record");
    let record: serde_json::Value = serde_json::from_slice(&stored).expect("json");
    let body = record["value"]["body"].as_str().expect("body");
    assert!(body == "djE=" || body == "djI=");

    assert_eq!(
        body_of(&handler.get(&first, "/k", &GetContext::default()).await.expect("first")),
        b"v1"
    );
}

#[tokio::test]
async fn concurrent_gets_in_one_request_share_a_store_read() {
    let (backend, handler) = memory_handler();
    let store = StoreClient::new(backend.clone());
    store
        .set(&CacheEntry::new("/a", Artifact::route("a", 200), 1, Vec::new()))
        .await
        .expect("seed");

    let request = RequestContext::new();
    let context = GetContext::default();
    let (one, two, three) = tokio::join!(
        handler.get(&request, "/a", &context),
        handler.get(&request, "/a", &context),
        handler.get(&request, "/a", &context),
    );
    assert!(one.is_some() && two.is_some() && three.is_some());
    assert_eq!(backend.reads(&store.entry_key("/a")), 1);
}

#[tokio::test]
async fn blog_post_lifecycle() {
    let (backend, handler) = memory_handler();
    let key = "/blog/post-1";
    let soft_tags = GetContext {
        soft_tags: keys::derived_tags(key),
        ..Default::default()
    };

    let render = RequestContext::new();
    assert!(handler.get(&render, key, &soft_tags).await.is_none());

    let page = Artifact::page("<html>post 1</html>", json!({"title": "Post 1"}))
        .with_revalidate(Revalidate::After(60));
    handler.set(&render, key, page, &SetContext::default());
    let hit = handler.get(&render, key, &soft_tags).await.expect("own write");
    assert_eq!(hit.freshness, Freshness::Fresh);
    render.background().drain_all().await;

    // Re-store the record as if it had been written 61 seconds ago.
    let store = StoreClient::new(backend);
    let aged = CacheEntry::new(
        key,
        Artifact::page("<html>post 1</html>", json!({"title": "Post 1"}))
            .with_revalidate(Revalidate::After(60)),
        now_millis() - 61_000,
        Vec::new(),
    );
    store.set(&aged).await.expect("aged record");

    let later = RequestContext::new();
    let hit = handler.get(&later, key, &soft_tags).await.expect("aged entry");
    assert_eq!(hit.freshness, Freshness::Stale);

    let revalidate = RequestContext::new();
    handler.revalidate_tag(&revalidate, [keys::default_tag(key)]);
    revalidate.background().drain_all().await;

    let next = RequestContext::new();
    assert!(handler.get(&next, key, &soft_tags).await.is_none());
}

fn body_of(hit: &artifact_cache::cache::CacheHit) -> Vec<u8> {
    match hit.entry.body() {
        artifact_cache::cache::ArtifactBody::Route { body, .. } => body.to_vec(),
        _ => Vec::new(),
    }
}
