mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use signkit::prelude::CacheConfig;

use common::{MockResponse, MockServer};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn not_modified_serves_cached_body() {
    let server = MockServer::start(|request| {
        if request.header("if-none-match") == Some("\"v1\"") {
            return MockResponse::empty(304).header("ETag", "\"v1\"");
        }
        MockResponse::json(200, json!({ "id": "doc_1", "name": "contract.pdf" }))
            .header("ETag", "\"v1\"")
            .header("Last-Modified", "Wed, 21 Oct 2015 07:28:00 GMT")
            .header("Cache-Control", "private, max-age=60")
    });
    let client = server.client().try_build().expect("client should build");

    let first = client
        .get("/documents/doc_1")
        .send()
        .await
        .expect("first request should succeed");
    let tag = first.cache_tag().expect("first response should be tagged");
    assert!(!tag.from_cache);
    assert_eq!(tag.etag.as_deref(), Some("\"v1\""));
    assert_eq!(
        tag.last_modified.as_deref(),
        Some("Wed, 21 Oct 2015 07:28:00 GMT")
    );

    let second = client
        .get("/documents/doc_1")
        .send()
        .await
        .expect("304 should be served from cache");
    assert!(second.from_cache());
    assert_eq!(second.status(), 200);
    assert_eq!(second.body(), first.body());
    let body: Value = second.json().expect("cached body should be json");
    assert_eq!(body["name"], "contract.pdf");

    let requests = server.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].header("if-none-match"), None);
    assert_eq!(requests[1].header("if-none-match"), Some("\"v1\""));

    let metrics = client.metrics_snapshot();
    assert_eq!(metrics.cache_stores, 1);
    assert_eq!(metrics.cache_hits, 1);
    assert_eq!(metrics.requests_succeeded, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn not_modified_without_cached_entry_surfaces_error() {
    let server = MockServer::scripted(vec![MockResponse::empty(304)]);
    let client = server.client().try_build().expect("client should build");

    let error = client
        .get("/documents/doc_1")
        .send()
        .await
        .expect_err("304 without a cached entry should fail");
    assert_eq!(error.status(), 304);
    assert!(!error.is_retryable());
    assert_eq!(server.served_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn post_invalidates_cached_collection() {
    let version = Arc::new(AtomicUsize::new(1));
    let server_version = Arc::clone(&version);
    let server = MockServer::start(move |request| match request.method.as_str() {
        "POST" => {
            server_version.fetch_add(1, Ordering::SeqCst);
            MockResponse::json(201, json!({ "id": "doc_2", "name": "new.pdf" }))
        }
        _ => {
            let current = server_version.load(Ordering::SeqCst);
            let etag = format!("\"v{current}\"");
            if request.header("if-none-match") == Some(etag.as_str()) {
                return MockResponse::empty(304);
            }
            MockResponse::json(200, json!({ "version": current })).header("ETag", etag)
        }
    });
    let client = server.client().try_build().expect("client should build");

    let before: Value = client
        .get("/documents")
        .send_json()
        .await
        .expect("initial list should succeed");
    assert_eq!(before["version"], 1);
    assert!(client.cache().get("/documents").is_some());

    client
        .post("/documents")
        .json(&json!({ "name": "new.pdf" }))
        .expect("json body should serialize")
        .send()
        .await
        .expect("create should succeed");
    assert!(client.cache().get("/documents").is_none());

    let after = client
        .get("/documents")
        .send()
        .await
        .expect("list after create should succeed");
    assert!(!after.from_cache());
    let after: Value = after.json().expect("list should be json");
    assert_eq!(after["version"], 2);

    let gets = server.requests_to("GET", "/documents");
    assert_eq!(gets.len(), 2);
    assert_eq!(gets[1].header("if-none-match"), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mutation_invalidates_exact_path_and_parent() {
    let server = MockServer::start(|request| match request.method.as_str() {
        "GET" => MockResponse::json(200, json!({ "path": request.route() }))
            .header("ETag", "\"same\""),
        _ => MockResponse::json(200, json!({ "id": "env_1", "title": "renamed", "status": "draft" })),
    });
    let client = server.client().try_build().expect("client should build");

    for path in ["/envelopes", "/envelopes?page=2", "/envelopes/env_1", "/templates"] {
        client.get(path).send().await.expect("get should succeed");
    }
    assert_eq!(client.cache().stats().size, 4);

    client
        .patch("/envelopes/env_1")
        .json(&json!({ "title": "renamed" }))
        .expect("json body should serialize")
        .send()
        .await
        .expect("patch should succeed");

    assert!(client.cache().get("/envelopes/env_1").is_none());
    assert!(client.cache().get("/envelopes").is_none());
    assert!(client.cache().get("/envelopes?page=2").is_none());
    assert!(client.cache().get("/templates").is_some());
    assert_eq!(client.cache().stats().size, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn distinct_query_strings_are_distinct_entries() {
    let server = MockServer::start(|request| {
        MockResponse::json(200, json!({ "path": request.path })).header("ETag", "\"q\"")
    });
    let client = server.client().try_build().expect("client should build");

    client
        .get("/envelopes")
        .query_pair("status", "sent")
        .query_pair("page", "1")
        .send()
        .await
        .expect("first query should succeed");
    client
        .get("/envelopes?page=2&status=sent")
        .send()
        .await
        .expect("second query should succeed");
    client
        .get("/envelopes?status=sent&page=1")
        .send()
        .await
        .expect("reordered query should succeed");

    assert!(client.cache().get("/envelopes?page=1&status=sent").is_some());
    assert!(client.cache().get("/envelopes?page=2&status=sent").is_some());
    assert_eq!(client.cache().stats().size, 2);

    let requests = server.requests();
    assert_eq!(requests[0].header("if-none-match"), None);
    assert_eq!(requests[1].header("if-none-match"), None);
    assert_eq!(requests[2].header("if-none-match"), Some("\"q\""));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn zero_max_age_is_never_revalidated() {
    let server = MockServer::start(|_| {
        MockResponse::json(200, json!({ "ok": true }))
            .header("ETag", "\"v1\"")
            .header("Cache-Control", "max-age=0")
    });
    let client = server.client().try_build().expect("client should build");

    client.get("/auth/me").send().await.expect("first get");
    client.get("/auth/me").send().await.expect("second get");

    let requests = server.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests.iter().all(|request| request.header("if-none-match").is_none()));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn disabled_cache_sends_plain_requests() {
    let server = MockServer::start(|_| {
        MockResponse::json(200, json!({ "ok": true })).header("ETag", "\"v1\"")
    });
    let client = server
        .client()
        .cache(CacheConfig::disabled())
        .request_timeout(Duration::from_secs(2))
        .try_build()
        .expect("client should build");

    let first = client.get("/templates").send().await.expect("first get");
    client.get("/templates").send().await.expect("second get");

    assert!(first.cache_tag().is_none());
    assert_eq!(client.cache().stats().size, 0);
    assert!(
        server
            .requests()
            .iter()
            .all(|request| request.header("if-none-match").is_none())
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn oversized_max_age_is_clamped() {
    let server = MockServer::start(|request| {
        if request.header("if-none-match") == Some("\"v1\"") {
            return MockResponse::empty(304);
        }
        MockResponse::json(200, json!({ "id": "doc_1" }))
            .header("ETag", "\"v1\"")
            .header("Cache-Control", "max-age=18446744073709551615")
    });
    let client = server.client().try_build().expect("client should build");

    let first = client
        .get("/documents/doc_1")
        .send()
        .await
        .expect("huge max-age should not break the request");
    assert!(!first.from_cache());

    let entry = client
        .cache()
        .get("/documents/doc_1")
        .expect("entry should be cached");
    let lifetime = entry
        .expires_at
        .duration_since(std::time::SystemTime::now())
        .expect("entry should expire in the future");
    assert!(lifetime <= signkit::MAX_CACHE_TTL);

    let second = client
        .get("/documents/doc_1")
        .send()
        .await
        .expect("revalidation should succeed");
    assert!(second.from_cache());
}
