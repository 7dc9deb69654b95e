use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::header::{ACCEPT, HeaderName, HeaderValue, USER_AGENT};
use http::{HeaderMap, Method};
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::Result;
use crate::cache::{CacheConfig, ConditionalCache};
use crate::error::{Error, ErrorOrigin};
use crate::metrics::{ClientMetrics, MetricsSnapshot};
use crate::middleware::{
    AuthLayer, CacheLayer, InterceptorLayer, Middleware, Pipeline, PipelineRequest,
    RefreshLayer, RequestIdLayer, RetryLayer,
};
use crate::policy::HttpInterceptor;
use crate::refresh::{
    Credentials, RefreshState, TokenPair, TokenRefreshCoordinator, TokenRefreshListener,
};
use crate::request::RequestBuilder;
use crate::response::Response;
use crate::retry::RetryPolicy;
use crate::transport::{TlsBackend, Transport, default_tls_backend};
use crate::util::{
    merge_headers, parse_header_name, parse_header_value, redact_uri_for_logs, validate_base_url,
};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_CLIENT_NAME: &str = concat!("signkit/", env!("CARGO_PKG_VERSION"));
const DEFAULT_MAX_RESPONSE_BODY_BYTES: usize = 8 * 1024 * 1024;
const DEFAULT_REFRESH_PATH: &str = "/auth/refresh";

pub struct ClientBuilder {
    base_url: String,
    access_token: Option<String>,
    refresh_token: Option<String>,
    api_key: Option<String>,
    client_name: String,
    default_headers: HeaderMap,
    request_timeout: Duration,
    max_response_body_bytes: usize,
    retry_policy: RetryPolicy,
    cache: CacheConfig,
    refresh_path: String,
    interceptors: Vec<Arc<dyn HttpInterceptor>>,
    refresh_listener: Option<Arc<dyn TokenRefreshListener>>,
    tls_backend: TlsBackend,
}

impl ClientBuilder {
    pub(crate) fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            access_token: None,
            refresh_token: None,
            api_key: None,
            client_name: DEFAULT_CLIENT_NAME.to_owned(),
            default_headers: HeaderMap::new(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_response_body_bytes: DEFAULT_MAX_RESPONSE_BODY_BYTES,
            retry_policy: RetryPolicy::standard(),
            cache: CacheConfig::default(),
            refresh_path: DEFAULT_REFRESH_PATH.to_owned(),
            interceptors: Vec::new(),
            refresh_listener: None,
            tls_backend: default_tls_backend(),
        }
    }

    pub fn access_token(mut self, access_token: impl Into<String>) -> Self {
        self.access_token = Some(access_token.into());
        self
    }

    pub fn refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    /// Legacy `x-api-key` credential, sent alongside any bearer token.
    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Sent as `User-Agent` and recorded on every request span.
    pub fn client_name(mut self, client_name: impl Into<String>) -> Self {
        self.client_name = client_name.into();
        self
    }

    pub fn default_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.default_headers.insert(name, value);
        self
    }

    pub fn try_default_header(self, name: &str, value: &str) -> Result<Self> {
        let name = parse_header_name(name)?;
        let value = parse_header_value(name.as_str(), value)?;
        Ok(self.default_header(name, value))
    }

    pub fn request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout.max(Duration::from_millis(1));
        self
    }

    pub fn max_response_body_bytes(mut self, max_response_body_bytes: usize) -> Self {
        self.max_response_body_bytes = max_response_body_bytes.max(1);
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Path (relative to the base URL) of the token refresh endpoint.
    pub fn refresh_path(mut self, refresh_path: impl Into<String>) -> Self {
        self.refresh_path = refresh_path.into();
        self
    }

    pub fn interceptor_arc(mut self, interceptor: Arc<dyn HttpInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn interceptor<I>(self, interceptor: I) -> Self
    where
        I: HttpInterceptor + 'static,
    {
        self.interceptor_arc(Arc::new(interceptor))
    }

    pub fn refresh_listener<L>(mut self, listener: L) -> Self
    where
        L: TokenRefreshListener + 'static,
    {
        self.refresh_listener = Some(Arc::new(listener));
        self
    }

    pub fn tls_backend(mut self, tls_backend: TlsBackend) -> Self {
        self.tls_backend = tls_backend;
        self
    }

    pub fn try_build(self) -> Result<Client> {
        validate_base_url(&self.base_url)?;
        let base_url = self.base_url.trim_end_matches('/').to_owned();

        let mut default_headers = self.default_headers;
        if !default_headers.contains_key(USER_AGENT) {
            let user_agent = parse_header_value(USER_AGENT.as_str(), &self.client_name)?;
            default_headers.insert(USER_AGENT, user_agent);
        }
        if !default_headers.contains_key(ACCEPT) {
            default_headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        }

        let transport = Transport::new(
            self.tls_backend,
            self.client_name.clone(),
            self.request_timeout,
            self.max_response_body_bytes,
        )?;
        let credentials = Arc::new(Credentials::new(
            self.access_token,
            self.refresh_token,
            self.api_key,
        ));
        let coordinator =
            TokenRefreshCoordinator::new(Arc::clone(&credentials), self.refresh_listener);
        let cache = ConditionalCache::from_config(&self.cache);
        let metrics = ClientMetrics::default();

        let layers: Vec<Box<dyn Middleware>> = vec![
            Box::new(RequestIdLayer),
            Box::new(InterceptorLayer::new(self.interceptors)),
            Box::new(RefreshLayer::new(
                coordinator.clone(),
                transport.clone(),
                base_url.clone(),
                self.refresh_path,
                default_headers.clone(),
                metrics.clone(),
            )),
            Box::new(RetryLayer::new(self.retry_policy, metrics.clone())),
            Box::new(CacheLayer::new(
                cache.clone(),
                self.cache.enabled,
                metrics.clone(),
            )),
            Box::new(AuthLayer::new(Arc::clone(&credentials))),
        ];

        Ok(Client {
            inner: Arc::new(ClientInner {
                base_url,
                default_headers,
                client_name: self.client_name,
                tls_backend: self.tls_backend,
                credentials,
                coordinator,
                cache,
                metrics,
                pipeline: Pipeline::new(layers, transport),
            }),
        })
    }

    #[track_caller]
    pub fn build(self) -> Client {
        self.try_build().unwrap_or_else(|error| {
            panic!("failed to build signkit client: {error}; use try_build() to handle configuration errors")
        })
    }
}

struct ClientInner {
    base_url: String,
    default_headers: HeaderMap,
    client_name: String,
    tls_backend: TlsBackend,
    credentials: Arc<Credentials>,
    coordinator: TokenRefreshCoordinator,
    cache: ConditionalCache,
    metrics: ClientMetrics,
    pipeline: Pipeline,
}

/// Client bound to one base URL and one set of credentials.
///
/// Clones share the pipeline, so they also share the conditional cache and
/// the token refresh session.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn builder(base_url: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(base_url)
    }

    pub fn request(&self, method: Method, path: impl Into<String>) -> RequestBuilder<'_> {
        RequestBuilder::new(self, method, path.into())
    }

    pub fn get(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::GET, path)
    }

    pub fn post(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::POST, path)
    }

    pub fn put(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::PUT, path)
    }

    pub fn patch(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::PATCH, path)
    }

    pub fn delete(&self, path: impl Into<String>) -> RequestBuilder<'_> {
        self.request(Method::DELETE, path)
    }

    pub fn base_url(&self) -> &str {
        &self.inner.base_url
    }

    pub fn client_name(&self) -> &str {
        &self.inner.client_name
    }

    pub fn tls_backend(&self) -> TlsBackend {
        self.inner.tls_backend
    }

    pub fn access_token(&self) -> Option<String> {
        self.inner.credentials.access_token()
    }

    pub fn set_access_token(&self, access_token: impl Into<String>) {
        self.inner
            .credentials
            .set_access_token(Some(access_token.into()));
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.inner.credentials.refresh_token()
    }

    pub fn set_refresh_token(&self, refresh_token: impl Into<String>) {
        self.inner
            .credentials
            .set_refresh_token(Some(refresh_token.into()));
    }

    pub(crate) fn install_tokens(&self, tokens: &TokenPair) {
        self.inner.credentials.install(tokens);
    }

    /// Drops both tokens; requests go out unauthenticated until new ones are set.
    pub fn clear_tokens(&self) {
        self.inner.credentials.set_access_token(None);
        self.inner.credentials.set_refresh_token(None);
    }

    pub fn refresh_state(&self) -> RefreshState {
        self.inner.coordinator.state()
    }

    /// Requests currently parked behind an in-flight token refresh.
    pub fn queued_refresh_waiters(&self) -> usize {
        self.inner.coordinator.queued()
    }

    /// The conditional cache used by the pipeline, for manual control.
    pub fn cache(&self) -> &ConditionalCache {
        &self.inner.cache
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Middleware names in execution order, outermost first.
    pub fn pipeline_layers(&self) -> Vec<&'static str> {
        self.inner.pipeline.layer_names()
    }

    pub(crate) async fn execute(
        &self,
        method: Method,
        path: String,
        headers: HeaderMap,
        body: Bytes,
        timeout: Option<Duration>,
    ) -> Result<Response> {
        self.execute_with(method, path, headers, body, timeout, Ok)
            .await
    }

    /// Like [`execute`](Self::execute), but a body that fails to decode is
    /// logged and counted as a failed request.
    pub(crate) async fn execute_json<T>(
        &self,
        method: Method,
        path: String,
        headers: HeaderMap,
        body: Bytes,
        timeout: Option<Duration>,
    ) -> Result<T>
    where
        T: DeserializeOwned,
    {
        self.execute_with(method, path, headers, body, timeout, |response| {
            response.json()
        })
        .await
    }

    async fn execute_with<T, F>(
        &self,
        method: Method,
        path: String,
        headers: HeaderMap,
        body: Bytes,
        timeout: Option<Duration>,
        decode: F,
    ) -> Result<T>
    where
        F: FnOnce(Response) -> Result<T>,
    {
        let metrics = &self.inner.metrics;
        metrics.record_request_started();
        let _in_flight = metrics.enter_in_flight();
        let started = Instant::now();

        let headers = merge_headers(&self.inner.default_headers, &headers);
        let response = match PipelineRequest::new(
            method.clone(),
            &self.inner.base_url,
            &path,
            headers,
            body,
            timeout,
        ) {
            Ok(request) => self.inner.pipeline.run(request).await,
            Err(error) => Err(error),
        };
        let result = response.and_then(|response| {
            let status = response.status().as_u16();
            decode(response).map(|value| (status, value))
        });

        metrics.record_request_completed(
            result.as_ref().map(|(status, _)| *status),
            started.elapsed(),
        );
        if let Err(error) = &result {
            log_surfaced_error(&method, &path, error);
        }
        result.map(|(_, value)| value)
    }
}

fn log_surfaced_error(method: &Method, path: &str, error: &Error) {
    let uri = match error.uri() {
        Some(uri) => uri.to_owned(),
        None => redact_uri_for_logs(path),
    };
    match error.origin() {
        ErrorOrigin::Response => warn!(
            method = %method,
            uri = %uri,
            status = error.status(),
            code = error.code().unwrap_or_default(),
            body = %error.log_detail(),
            "request failed"
        ),
        ErrorOrigin::Network | ErrorOrigin::Client => warn!(
            method = %method,
            uri = %uri,
            code = error.code().unwrap_or_default(),
            message = %error.log_detail(),
            "request failed"
        ),
    }
}
