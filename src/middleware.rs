//! The request pipeline as an explicit, ordered middleware chain.
//!
//! Layers run outermost first:
//!
//! 1. [`RequestIdLayer`] tags the request with `x-request-id`.
//! 2. [`InterceptorLayer`] runs user observer hooks once per logical request.
//! 3. [`RefreshLayer`] turns a `401` into one coordinated refresh and a replay.
//! 4. [`RetryLayer`] retries transient failures with Fibonacci backoff.
//! 5. [`CacheLayer`] does conditional `GET`s and invalidation after mutations.
//! 6. [`AuthLayer`] attaches the current credentials.
//!
//! The terminal step is the transport. Because retry sits inside refresh, a
//! retryable failure never reaches the refresh logic, and every retry runs the
//! cache and auth layers again.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::header::{
    ACCEPT, AUTHORIZATION, CONTENT_TYPE, ETAG, HeaderMap, HeaderName, HeaderValue, IF_NONE_MATCH,
    LAST_MODIFIED,
};
use http::{Method, Request, StatusCode, Uri};
use http_body_util::Full;
use serde::Serialize;
use tracing::{debug, warn};

use crate::Result;
use crate::cache::{CacheEntry, ConditionalCache, cache_key, key_path, parent_path};
use crate::error::Error;
use crate::metrics::ClientMetrics;
use crate::policy::{HttpInterceptor, RequestInfo};
use crate::refresh::{
    Credentials, RefreshRole, TokenPair, TokenRefreshCoordinator, wait_for_refresh,
};
use crate::response::{CacheTag, Response};
use crate::retry::{RetryPolicy, RetryState};
use crate::transport::{ReqBody, Transport};
use crate::util::{
    generate_request_id, header_text, parse_header_value, parse_max_age, redact_uri_for_logs,
    resolve_uri,
};

pub(crate) const REQUEST_ID_HEADER: &str = "x-request-id";
pub(crate) const API_KEY_HEADER: &str = "x-api-key";

/// Per-request state carried through the chain.
#[derive(Clone, Debug, Default)]
pub(crate) struct RequestContext {
    attempt: usize,
    replay: bool,
    cached: Option<CacheEntry>,
}

impl RequestContext {
    /// Retries already performed for this logical request.
    pub(crate) fn attempt(&self) -> usize {
        self.attempt
    }

    /// `true` once the request was resubmitted after a token refresh.
    pub(crate) fn is_replay(&self) -> bool {
        self.replay
    }

    pub(crate) fn cached(&self) -> Option<&CacheEntry> {
        self.cached.as_ref()
    }
}

/// A fully resolved request as it travels through the middleware chain.
#[derive(Clone, Debug)]
pub(crate) struct PipelineRequest {
    method: Method,
    uri: Uri,
    log_uri: String,
    cache_key: String,
    headers: HeaderMap,
    body: Bytes,
    timeout: Option<Duration>,
    context: RequestContext,
}

impl PipelineRequest {
    pub(crate) fn new(
        method: Method,
        base_url: &str,
        target: &str,
        headers: HeaderMap,
        body: Bytes,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let (uri_text, uri) = resolve_uri(base_url, target)?;
        Ok(Self {
            log_uri: redact_uri_for_logs(&uri_text),
            cache_key: cache_key(base_url, &uri_text),
            method,
            uri,
            headers,
            body,
            timeout,
            context: RequestContext::default(),
        })
    }

    pub(crate) fn method(&self) -> &Method {
        &self.method
    }

    pub(crate) fn path(&self) -> &str {
        self.uri.path()
    }

    pub(crate) fn log_uri(&self) -> &str {
        &self.log_uri
    }

    pub(crate) fn cache_key(&self) -> &str {
        &self.cache_key
    }

    pub(crate) fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub(crate) fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub(crate) fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub(crate) fn context(&self) -> &RequestContext {
        &self.context
    }

    pub(crate) fn request_id(&self) -> Option<String> {
        header_text(&self.headers, REQUEST_ID_HEADER)
    }

    fn set_bearer(&mut self, access_token: &str) -> Result<()> {
        let mut value = parse_header_value(
            AUTHORIZATION.as_str(),
            &format!("Bearer {access_token}"),
        )?;
        value.set_sensitive(true);
        self.headers.insert(AUTHORIZATION, value);
        Ok(())
    }

    pub(crate) fn into_http_request(self) -> Result<Request<ReqBody>> {
        let mut request = Request::builder()
            .method(self.method)
            .uri(self.uri)
            .body(Full::new(self.body))
            .map_err(Error::request_build)?;
        *request.headers_mut() = self.headers;
        Ok(request)
    }
}

/// One step of the pipeline.
pub(crate) trait Middleware: Send + Sync {
    fn name(&self) -> &'static str;

    fn handle<'a>(
        &'a self,
        request: PipelineRequest,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<Response>>;
}

/// The remainder of the chain after the current layer.
#[derive(Clone, Copy)]
pub(crate) struct Next<'a> {
    layers: &'a [Box<dyn Middleware>],
    transport: &'a Transport,
}

impl<'a> Next<'a> {
    pub(crate) fn run(self, request: PipelineRequest) -> BoxFuture<'a, Result<Response>> {
        match self.layers.split_first() {
            Some((layer, rest)) => layer.handle(
                request,
                Next {
                    layers: rest,
                    transport: self.transport,
                },
            ),
            None => Box::pin(self.transport.send(request)),
        }
    }
}

pub(crate) struct Pipeline {
    layers: Vec<Box<dyn Middleware>>,
    transport: Transport,
}

impl Pipeline {
    pub(crate) fn new(layers: Vec<Box<dyn Middleware>>, transport: Transport) -> Self {
        Self { layers, transport }
    }

    pub(crate) fn run(&self, request: PipelineRequest) -> BoxFuture<'_, Result<Response>> {
        Next {
            layers: &self.layers,
            transport: &self.transport,
        }
        .run(request)
    }

    pub(crate) fn layer_names(&self) -> Vec<&'static str> {
        self.layers.iter().map(|layer| layer.name()).collect()
    }
}

pub(crate) struct RequestIdLayer;

impl Middleware for RequestIdLayer {
    fn name(&self) -> &'static str {
        "request_id"
    }

    fn handle<'a>(
        &'a self,
        mut request: PipelineRequest,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<Response>> {
        Box::pin(async move {
            if !request.headers().contains_key(REQUEST_ID_HEADER) {
                let value = parse_header_value(REQUEST_ID_HEADER, &generate_request_id())?;
                request
                    .headers_mut()
                    .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
            }
            next.run(request).await
        })
    }
}

pub(crate) struct InterceptorLayer {
    interceptors: Vec<Arc<dyn HttpInterceptor>>,
}

impl InterceptorLayer {
    pub(crate) fn new(interceptors: Vec<Arc<dyn HttpInterceptor>>) -> Self {
        Self { interceptors }
    }
}

impl Middleware for InterceptorLayer {
    fn name(&self) -> &'static str {
        "interceptor"
    }

    fn handle<'a>(
        &'a self,
        mut request: PipelineRequest,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<Response>> {
        Box::pin(async move {
            if self.interceptors.is_empty() {
                return next.run(request).await;
            }

            let info = RequestInfo::new(
                request.method().clone(),
                request.path().to_owned(),
                request.request_id(),
            );
            for interceptor in &self.interceptors {
                interceptor.on_request(&info, request.headers_mut());
            }

            let result = next.run(request).await;
            for interceptor in &self.interceptors {
                match &result {
                    Ok(response) => {
                        interceptor.on_response(&info, response.status(), response.headers())
                    }
                    Err(error) => interceptor.on_error(&info, error),
                }
            }
            result
        })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    refresh_token: &'a str,
}

/// Handles `401` responses through the single-flight refresh coordinator.
pub(crate) struct RefreshLayer {
    coordinator: TokenRefreshCoordinator,
    transport: Transport,
    base_url: String,
    refresh_path: String,
    default_headers: HeaderMap,
    metrics: ClientMetrics,
}

impl RefreshLayer {
    pub(crate) fn new(
        coordinator: TokenRefreshCoordinator,
        transport: Transport,
        base_url: String,
        refresh_path: String,
        default_headers: HeaderMap,
        metrics: ClientMetrics,
    ) -> Self {
        Self {
            coordinator,
            transport,
            base_url,
            refresh_path,
            default_headers,
            metrics,
        }
    }

    /// Calls the refresh endpoint directly on the transport, skipping the
    /// retry, cache and auth layers.
    ///
    /// Always uses the client's request timeout; a per-call timeout on the
    /// request that hit the `401` does not carry over to the refresh call.
    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair> {
        let body = serde_json::to_vec(&RefreshRequest { refresh_token }).map_err(Error::serialize)?;
        let mut headers = self.default_headers.clone();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            HeaderName::from_static(REQUEST_ID_HEADER),
            parse_header_value(REQUEST_ID_HEADER, &generate_request_id())?,
        );

        let request = PipelineRequest::new(
            Method::POST,
            &self.base_url,
            &self.refresh_path,
            headers,
            Bytes::from(body),
            None,
        )?;
        self.transport.send(request).await?.json()
    }
}

impl Middleware for RefreshLayer {
    fn name(&self) -> &'static str {
        "refresh"
    }

    fn handle<'a>(
        &'a self,
        request: PipelineRequest,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<Response>> {
        Box::pin(async move {
            let mut replay = request.clone();
            let unauthorized = match next.run(request).await {
                Err(error) if error.is_authentication_error() && !replay.context.replay => error,
                other => return other,
            };

            let access_token = match self.coordinator.begin() {
                RefreshRole::Unavailable => return Err(unauthorized),
                RefreshRole::Leader {
                    refresh_token,
                    guard,
                } => {
                    let outcome = self.refresh(&refresh_token).await;
                    self.metrics.record_token_refresh(outcome.is_ok());
                    guard.settle(outcome)?
                }
                RefreshRole::Waiter(receiver) => wait_for_refresh(receiver).await?,
            };

            debug!(uri = %replay.log_uri(), "replaying request with refreshed token");
            replay.context.replay = true;
            replay.set_bearer(&access_token)?;
            next.run(replay).await
        })
    }
}

pub(crate) struct RetryLayer {
    policy: RetryPolicy,
    metrics: ClientMetrics,
}

impl RetryLayer {
    pub(crate) fn new(policy: RetryPolicy, metrics: ClientMetrics) -> Self {
        Self { policy, metrics }
    }
}

impl Middleware for RetryLayer {
    fn name(&self) -> &'static str {
        "retry"
    }

    fn handle<'a>(
        &'a self,
        request: PipelineRequest,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<Response>> {
        Box::pin(async move {
            let mut state = RetryState::new(self.policy.configured_max_attempts());
            loop {
                let mut attempt = request.clone();
                attempt.context.attempt = state.attempt();
                let error = match next.run(attempt).await {
                    Ok(response) => return Ok(response),
                    Err(error) => error,
                };

                let decision =
                    self.policy
                        .should_retry(&error, state.attempt(), request.context.replay);
                if !decision.retry {
                    return Err(error);
                }

                state.record_retry(&error);
                self.metrics.record_retry();
                warn!(
                    uri = %request.log_uri(),
                    attempt = state.attempt(),
                    max_attempts = state.max_attempts(),
                    delay_ms = decision.delay.as_millis() as u64,
                    status = error.status(),
                    error = %error,
                    "retrying request"
                );
                tokio::time::sleep(decision.delay).await;
            }
        })
    }
}

fn is_mutating(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

/// Conditional `GET` handling and invalidation after mutations.
pub(crate) struct CacheLayer {
    cache: ConditionalCache,
    enabled: bool,
    metrics: ClientMetrics,
}

impl CacheLayer {
    pub(crate) fn new(cache: ConditionalCache, enabled: bool, metrics: ClientMetrics) -> Self {
        Self {
            cache,
            enabled,
            metrics,
        }
    }

    fn store(&self, key: String, response: Response) -> Response {
        let Some(etag) = header_text(response.headers(), ETAG.as_str()) else {
            return response;
        };
        let last_modified = header_text(response.headers(), LAST_MODIFIED.as_str());
        let max_age = parse_max_age(response.headers()).map(Duration::from_secs);
        self.cache.set(
            key,
            etag.clone(),
            response.body().clone(),
            max_age,
            last_modified.clone(),
        );
        self.metrics.record_cache_store();
        response.with_cache_tag(CacheTag {
            from_cache: false,
            etag: Some(etag),
            last_modified,
        })
    }

    fn invalidate_after_mutation(&self, key: &str) {
        let path = key_path(key);
        self.cache.invalidate_path(path);
        if let Some(parent) = parent_path(path) {
            self.cache.invalidate_path(parent);
        }
        debug!(path, "invalidated cached entries after mutation");
    }
}

impl Middleware for CacheLayer {
    fn name(&self) -> &'static str {
        "cache"
    }

    fn handle<'a>(
        &'a self,
        mut request: PipelineRequest,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<Response>> {
        Box::pin(async move {
            if !self.enabled {
                return next.run(request).await;
            }

            let method = request.method().clone();
            let key = request.cache_key().to_owned();
            if method == Method::GET
                && let Some(entry) = self.cache.get(&key)
                && let Ok(validator) = HeaderValue::from_str(&entry.etag)
            {
                request.headers_mut().insert(IF_NONE_MATCH, validator);
                request.context.cached = Some(entry);
            }
            let cached = request.context().cached().cloned();

            match next.run(request).await {
                Ok(response) if method == Method::GET => Ok(self.store(key, response)),
                Ok(response) => {
                    if is_mutating(&method) {
                        self.invalidate_after_mutation(&key);
                    }
                    Ok(response)
                }
                Err(error) if error.status() == StatusCode::NOT_MODIFIED.as_u16() => {
                    let Some(entry) = cached else {
                        return Err(error);
                    };
                    self.metrics.record_cache_hit();
                    debug!(key = %key, "serving cached body after 304");
                    let response = Response::new(StatusCode::OK, error.headers().clone(), entry.body);
                    Ok(response.with_cache_tag(CacheTag {
                        from_cache: true,
                        etag: Some(entry.etag),
                        last_modified: entry.last_modified,
                    }))
                }
                Err(error) => Err(error),
            }
        })
    }
}

pub(crate) struct AuthLayer {
    credentials: Arc<Credentials>,
}

impl AuthLayer {
    pub(crate) fn new(credentials: Arc<Credentials>) -> Self {
        Self { credentials }
    }
}

impl Middleware for AuthLayer {
    fn name(&self) -> &'static str {
        "auth"
    }

    fn handle<'a>(
        &'a self,
        mut request: PipelineRequest,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<Response>> {
        Box::pin(async move {
            if !request.headers().contains_key(AUTHORIZATION)
                && let Some(access_token) = self.credentials.access_token()
            {
                request.set_bearer(&access_token)?;
            }
            if !request.headers().contains_key(API_KEY_HEADER)
                && let Some(api_key) = self.credentials.api_key()
            {
                let mut value = parse_header_value(API_KEY_HEADER, api_key)?;
                value.set_sensitive(true);
                request
                    .headers_mut()
                    .insert(HeaderName::from_static(API_KEY_HEADER), value);
            }
            next.run(request).await
        })
    }
}
