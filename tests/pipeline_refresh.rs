mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};
use signkit::prelude::{Error, TokenPair, TokenRefreshListener};
use signkit::RefreshState;

use common::{CapturedRequest, MockResponse, MockServer};

const REFRESH_DELAY: Duration = Duration::from_millis(300);

/// Resources accept only `new-access`; the refresh endpoint is slow so
/// concurrent `401`s overlap with it.
fn rotating_server(refresh_response: MockResponse) -> MockServer {
    MockServer::start(move |request: &CapturedRequest| {
        if request.route() == "/auth/refresh" {
            return refresh_response.clone().delayed(REFRESH_DELAY);
        }
        if request.bearer() == Some("new-access") {
            return MockResponse::json(200, json!({ "route": request.route() }));
        }
        MockResponse::json(401, json!({ "message": "token expired" }))
    })
}

fn refreshed_tokens() -> MockResponse {
    MockResponse::json(
        200,
        json!({ "accessToken": "new-access", "refreshToken": "new-refresh", "expiresIn": 3600 }),
    )
}

#[derive(Default)]
struct RecordingListener {
    refreshed: Mutex<Vec<TokenPair>>,
    failed: Mutex<Vec<u16>>,
}

struct SharedListener(Arc<RecordingListener>);

impl TokenRefreshListener for SharedListener {
    fn on_tokens_refreshed(&self, tokens: &TokenPair) {
        self.0
            .refreshed
            .lock()
            .expect("lock refreshed tokens")
            .push(tokens.clone());
    }

    fn on_refresh_failed(&self, error: &Error) {
        self.0
            .failed
            .lock()
            .expect("lock failures")
            .push(error.status());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_unauthorized_requests_share_one_refresh() {
    let server = rotating_server(refreshed_tokens());
    let listener = Arc::new(RecordingListener::default());
    let client = server
        .client()
        .access_token("old-access")
        .refresh_token("old-refresh")
        .refresh_listener(SharedListener(Arc::clone(&listener)))
        .try_build()
        .expect("client should build");

    let (first, second, third) = tokio::join!(
        client.get("/envelopes/env_1").send_json::<Value>(),
        client.get("/envelopes/env_2").send_json::<Value>(),
        client.get("/envelopes/env_3").send_json::<Value>(),
    );
    for (result, route) in [
        (first, "/envelopes/env_1"),
        (second, "/envelopes/env_2"),
        (third, "/envelopes/env_3"),
    ] {
        let body = result.expect("request should succeed after refresh");
        assert_eq!(body["route"], route);

        let attempts = server.requests_to("GET", route);
        assert_eq!(attempts.len(), 2, "{route}");
        assert_eq!(attempts[0].bearer(), Some("old-access"));
        assert_eq!(attempts[1].bearer(), Some("new-access"));
    }

    let refreshes = server.requests_to("POST", "/auth/refresh");
    assert_eq!(refreshes.len(), 1);
    let refresh_body: Value =
        serde_json::from_slice(&refreshes[0].body).expect("refresh body should be json");
    assert_eq!(refresh_body, json!({ "refreshToken": "old-refresh" }));
    assert_eq!(refreshes[0].header("authorization"), None);
    assert!(refreshes[0].header("x-request-id").is_some());

    assert_eq!(client.access_token().as_deref(), Some("new-access"));
    assert_eq!(client.refresh_token().as_deref(), Some("new-refresh"));
    assert_eq!(client.refresh_state(), RefreshState::Idle);
    assert_eq!(client.queued_refresh_waiters(), 0);
    assert_eq!(client.metrics_snapshot().token_refreshes, 1);

    let refreshed = listener.refreshed.lock().expect("lock refreshed tokens");
    assert_eq!(refreshed.len(), 1);
    assert_eq!(refreshed[0].access_token, "new-access");
    assert_eq!(refreshed[0].expires_in, Some(3600));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_refresh_rejects_every_waiting_request() {
    let server = rotating_server(MockResponse::json(
        401,
        json!({ "message": "refresh token revoked", "code": "TOKEN_REVOKED" }),
    ));
    let listener = Arc::new(RecordingListener::default());
    let client = server
        .client()
        .access_token("old-access")
        .refresh_token("old-refresh")
        .refresh_listener(SharedListener(Arc::clone(&listener)))
        .try_build()
        .expect("client should build");

    let (first, second, third) = tokio::join!(
        client.get("/envelopes/env_1").send(),
        client.get("/templates").send(),
        client.post("/envelopes/env_1/send").send(),
    );
    let errors = [first, second, third].map(|result| match result {
        Ok(_) => panic!("request should fail when refresh fails"),
        Err(error) => error,
    });
    for error in &errors {
        assert_eq!(error.status(), 401);
        assert!(error.is_authentication_error());
        assert_eq!(error.message(), "refresh token revoked");
        assert_eq!(error.code(), Some("TOKEN_REVOKED"));
        assert!(
            error
                .uri()
                .is_some_and(|uri| uri.ends_with("/auth/refresh")),
            "{:?}",
            error.uri()
        );
    }

    assert_eq!(server.requests_to("POST", "/auth/refresh").len(), 1);
    assert_eq!(client.refresh_token(), None);
    assert_eq!(client.access_token().as_deref(), Some("old-access"));
    assert_eq!(client.refresh_state(), RefreshState::Idle);

    let metrics = client.metrics_snapshot();
    assert_eq!(metrics.token_refresh_failures, 1);
    assert_eq!(metrics.requests_failed, 3);
    assert_eq!(
        listener.failed.lock().expect("lock failures").as_slice(),
        [401]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unauthorized_without_refresh_token_surfaces() {
    let server = rotating_server(refreshed_tokens());
    let client = server
        .client()
        .access_token("old-access")
        .try_build()
        .expect("client should build");

    let error = client
        .get("/auth/me")
        .send()
        .await
        .expect_err("401 should surface without a refresh token");
    assert_eq!(error.status(), 401);
    assert_eq!(error.message(), "token expired");
    assert!(server.requests_to("POST", "/auth/refresh").is_empty());
    assert_eq!(server.served_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn replayed_request_is_not_refreshed_again() {
    let server = MockServer::start(|request| {
        if request.route() == "/auth/refresh" {
            return MockResponse::json(200, json!({ "accessToken": "still-rejected" }));
        }
        MockResponse::json(401, json!({ "message": "token expired" }))
    });
    let client = server
        .client()
        .access_token("old-access")
        .refresh_token("old-refresh")
        .try_build()
        .expect("client should build");

    let error = client
        .get("/envelopes")
        .send()
        .await
        .expect_err("replay 401 should surface");
    assert_eq!(error.status(), 401);
    assert_eq!(server.requests_to("POST", "/auth/refresh").len(), 1);

    let attempts = server.requests_to("GET", "/envelopes");
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[1].bearer(), Some("still-rejected"));
    // A refresh response without a refresh token keeps the old one.
    assert_eq!(client.refresh_token().as_deref(), Some("old-refresh"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retryable_failure_then_unauthorized_still_refreshes() {
    let server = MockServer::start({
        let served = Arc::new(Mutex::new(0_usize));
        move |request| {
            if request.route() == "/auth/refresh" {
                return refreshed_tokens();
            }
            let mut served = served.lock().expect("lock served count");
            *served += 1;
            match *served {
                1 => MockResponse::new(503, "busy"),
                _ if request.bearer() == Some("new-access") => {
                    MockResponse::json(200, json!({ "ok": true }))
                }
                _ => MockResponse::json(401, json!({ "message": "token expired" })),
            }
        }
    });
    let client = server
        .client()
        .access_token("old-access")
        .refresh_token("old-refresh")
        .try_build()
        .expect("client should build");

    let body: Value = client
        .get("/auth/me")
        .send_json()
        .await
        .expect("request should recover through retry and refresh");
    assert_eq!(body["ok"], true);
    assert_eq!(server.requests_to("GET", "/auth/me").len(), 3);
    assert_eq!(server.requests_to("POST", "/auth/refresh").len(), 1);
    assert_eq!(client.metrics_snapshot().retries, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn custom_refresh_path_is_used() {
    let server = MockServer::start(|request| {
        if request.route() == "/oauth/token/refresh" {
            return refreshed_tokens();
        }
        if request.bearer() == Some("new-access") {
            return MockResponse::json(200, json!({ "ok": true }));
        }
        MockResponse::empty(401)
    });
    let client = server
        .client()
        .access_token("old-access")
        .refresh_token("old-refresh")
        .refresh_path("/oauth/token/refresh")
        .try_build()
        .expect("client should build");

    client
        .get("/webhooks")
        .send()
        .await
        .expect("request should succeed after refresh");
    assert_eq!(
        server.requests_to("POST", "/oauth/token/refresh").len(),
        1
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refresh_call_uses_client_timeout_not_per_call_timeout() {
    let server = rotating_server(refreshed_tokens());
    let client = server
        .client()
        .access_token("old-access")
        .refresh_token("old-refresh")
        .try_build()
        .expect("client should build");

    let body: Value = client
        .get("/envelopes/env_1")
        .timeout(Duration::from_millis(150))
        .send_json()
        .await
        .expect("slow refresh should outlive the per-call timeout");
    assert_eq!(body["route"], "/envelopes/env_1");
    assert_eq!(server.requests_to("POST", "/auth/refresh").len(), 1);
}
