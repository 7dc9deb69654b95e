use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{Request, Response as HttpResponse};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tokio::time::timeout;
use tracing::{Instrument, debug, info_span};

#[cfg(feature = "tls-rustls-ring")]
use hyper_rustls::HttpsConnectorBuilder;

use crate::error::{BoxError, Error, TransportErrorKind};
use crate::middleware::PipelineRequest;
use crate::response::Response;

pub(crate) type ReqBody = Full<Bytes>;

const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const POOL_MAX_IDLE_PER_HOST: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlsBackend {
    RustlsRing,
    NativeTls,
}

impl TlsBackend {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RustlsRing => "tls-rustls-ring",
            Self::NativeTls => "tls-native",
        }
    }
}

pub(crate) const fn default_tls_backend() -> TlsBackend {
    #[cfg(feature = "tls-rustls-ring")]
    {
        return TlsBackend::RustlsRing;
    }
    #[allow(unreachable_code)]
    TlsBackend::NativeTls
}

#[derive(Clone)]
enum TransportClient {
    #[cfg(feature = "tls-rustls-ring")]
    Rustls(Client<hyper_rustls::HttpsConnector<HttpConnector>, ReqBody>),
    #[cfg(feature = "tls-native")]
    Native(Client<hyper_tls::HttpsConnector<HttpConnector>, ReqBody>),
}

impl TransportClient {
    async fn request(
        &self,
        request: Request<ReqBody>,
    ) -> Result<HttpResponse<Incoming>, hyper_util::client::legacy::Error> {
        #[cfg(not(any(feature = "tls-native", feature = "tls-rustls-ring")))]
        let _ = &request;

        match self {
            #[cfg(feature = "tls-rustls-ring")]
            Self::Rustls(client) => client.request(request).await,
            #[cfg(feature = "tls-native")]
            Self::Native(client) => client.request(request).await,
            #[cfg(not(any(feature = "tls-native", feature = "tls-rustls-ring")))]
            _ => unreachable!("no TLS transport backend is compiled"),
        }
    }
}

fn http_connector() -> HttpConnector {
    let mut connector = HttpConnector::new();
    connector.enforce_http(false);
    connector
}

#[cfg(feature = "tls-rustls-ring")]
fn build_rustls_ring_transport() -> Result<TransportClient, Error> {
    let https = HttpsConnectorBuilder::new()
        .with_provider_and_webpki_roots(rustls::crypto::ring::default_provider())
        .map_err(|source| Error::tls_backend(TlsBackend::RustlsRing.as_str(), source.to_string()))?
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .wrap_connector(http_connector());
    let transport = Client::builder(TokioExecutor::new())
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .build(https);
    Ok(TransportClient::Rustls(transport))
}

#[cfg(not(feature = "tls-rustls-ring"))]
fn build_rustls_ring_transport() -> Result<TransportClient, Error> {
    Err(Error::tls_backend(
        TlsBackend::RustlsRing.as_str(),
        "feature not enabled in this build".to_owned(),
    ))
}

#[cfg(feature = "tls-native")]
fn build_native_tls_transport() -> Result<TransportClient, Error> {
    let https = hyper_tls::HttpsConnector::new_with_connector(http_connector());
    let transport = Client::builder(TokioExecutor::new())
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .build(https);
    Ok(TransportClient::Native(transport))
}

#[cfg(not(feature = "tls-native"))]
fn build_native_tls_transport() -> Result<TransportClient, Error> {
    Err(Error::tls_backend(
        TlsBackend::NativeTls.as_str(),
        "feature not enabled in this build".to_owned(),
    ))
}

enum ReadBodyError {
    Read(hyper::Error),
    TooLarge { actual_bytes: usize },
}

async fn read_all_body_limited(mut body: Incoming, max_bytes: usize) -> Result<Bytes, ReadBodyError> {
    let mut collected = Vec::new();
    let mut total_len = 0_usize;

    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(ReadBodyError::Read)?;
        if let Some(data) = frame.data_ref() {
            total_len = total_len.saturating_add(data.len());
            if total_len > max_bytes {
                return Err(ReadBodyError::TooLarge {
                    actual_bytes: total_len,
                });
            }
            collected.extend_from_slice(data);
        }
    }

    Ok(Bytes::from(collected))
}

pub(crate) fn classify_transport_error(
    error: &hyper_util::client::legacy::Error,
) -> TransportErrorKind {
    let text = format!("{error:?}").to_ascii_lowercase();
    if error.is_connect() {
        if text.contains("dns")
            || text.contains("name or service not known")
            || text.contains("failed to lookup address")
        {
            return TransportErrorKind::Dns;
        }
        if text.contains("tls") || text.contains("certificate") || text.contains("handshake") {
            return TransportErrorKind::Tls;
        }
        return TransportErrorKind::Connect;
    }

    if text.contains("read")
        || text.contains("connection reset")
        || text.contains("broken pipe")
        || text.contains("unexpected eof")
        || text.contains("incomplete")
    {
        return TransportErrorKind::Read;
    }

    TransportErrorKind::Other
}

/// One HTTP exchange with a fixed timeout; the terminal step of the pipeline.
///
/// Every outcome other than a `2xx` is normalized here, so layers above only
/// ever see [`Error`].
#[derive(Clone)]
pub(crate) struct Transport {
    client: TransportClient,
    client_name: String,
    request_timeout: Duration,
    max_response_body_bytes: usize,
}

impl Transport {
    pub(crate) fn new(
        tls_backend: TlsBackend,
        client_name: String,
        request_timeout: Duration,
        max_response_body_bytes: usize,
    ) -> Result<Self, Error> {
        let client = match tls_backend {
            TlsBackend::RustlsRing => build_rustls_ring_transport()?,
            TlsBackend::NativeTls => build_native_tls_transport()?,
        };
        Ok(Self {
            client,
            client_name,
            request_timeout,
            max_response_body_bytes,
        })
    }

    pub(crate) async fn send(&self, request: PipelineRequest) -> Result<Response, Error> {
        let span = info_span!(
            "signkit.request",
            client = %self.client_name,
            method = %request.method(),
            uri = %request.log_uri(),
            attempt = request.context().attempt() + 1,
            replay = request.context().is_replay()
        );
        self.exchange(request).instrument(span).await
    }

    async fn exchange(&self, request: PipelineRequest) -> Result<Response, Error> {
        let method = request.method().clone();
        let uri = request.log_uri().to_owned();
        let transport_timeout = request.timeout().unwrap_or(self.request_timeout);
        let started = Instant::now();
        let http_request = request.into_http_request()?;
        debug!("sending request");

        let exchange = async {
            let response = self.client.request(http_request).await.map_err(|source| {
                let kind = classify_transport_error(&source);
                Error::from_transport(&method, &uri, kind, Some(Box::new(source) as BoxError))
            })?;
            let (parts, body) = response.into_parts();
            let body = read_all_body_limited(body, self.max_response_body_bytes)
                .await
                .map_err(|error| match error {
                    ReadBodyError::Read(source) => Error::from_transport(
                        &method,
                        &uri,
                        TransportErrorKind::Read,
                        Some(Box::new(source) as BoxError),
                    ),
                    ReadBodyError::TooLarge { actual_bytes } => {
                        Error::body_too_large(self.max_response_body_bytes, actual_bytes)
                            .with_request(&method, &uri)
                    }
                })?;
            Ok::<_, Error>((parts, body))
        };

        let (parts, body) = match timeout(transport_timeout, exchange).await {
            Ok(result) => result?,
            Err(_) => {
                debug!(
                    timeout_ms = transport_timeout.as_millis() as u64,
                    "request timed out"
                );
                return Err(Error::from_transport(
                    &method,
                    &uri,
                    TransportErrorKind::Timeout,
                    None,
                ));
            }
        };

        debug!(
            status = parts.status.as_u16(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "request completed"
        );

        if parts.status.is_success() {
            return Ok(Response::new(parts.status, parts.headers, body));
        }
        Err(Error::from_response(
            &method,
            &uri,
            parts.status,
            parts.headers,
            &body,
        ))
    }
}
