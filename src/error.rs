use std::error::Error as StdError;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::util::{parse_header_u64, parse_retry_after, truncate_body};

pub(crate) type BoxError = Box<dyn StdError + Send + Sync>;
type SharedError = Arc<dyn StdError + Send + Sync>;

pub const NETWORK_ERROR_STATUS_TEXT: &str = "Network Error";
const NETWORK_ERROR_MESSAGE: &str = "network error: the request was sent but no response was received";

const RATE_LIMIT_LIMIT_HEADER: &str = "x-ratelimit-limit";
const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";
const RATE_LIMIT_RESET_HEADER: &str = "x-ratelimit-reset";

const CONNECTION_ABORTED_CODE: &str = "ECONNABORTED";
const DNS_FAILURE_CODE: &str = "ENOTFOUND";

const DOCUMENT_VALIDATION_PREFIXES: [&str; 4] = ["IMAGE_", "FACE_", "DOCUMENT_", "DOC_"];

/// Where a failure was first observed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorOrigin {
    /// The server answered with a non-success status.
    Response,
    /// The request left the process but no response came back.
    Network,
    /// The request could not be built, or its response could not be decoded.
    Client,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TransportErrorKind {
    Dns,
    Connect,
    Tls,
    Read,
    Timeout,
    Other,
}

impl TransportErrorKind {
    /// Machine code carried by errors of this kind.
    pub const fn code(self) -> &'static str {
        match self {
            Self::Dns => DNS_FAILURE_CODE,
            Self::Connect => "ECONNREFUSED",
            Self::Tls => "ERR_TLS",
            Self::Read => "ECONNRESET",
            Self::Timeout => CONNECTION_ABORTED_CODE,
            Self::Other => "ERR_NETWORK",
        }
    }
}

impl std::fmt::Display for TransportErrorKind {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Dns => "dns",
            Self::Connect => "connect",
            Self::Tls => "tls",
            Self::Read => "read",
            Self::Timeout => "timeout",
            Self::Other => "other",
        };
        formatter.write_str(text)
    }
}

/// Coarse classification of an [`Error`]; the first matching predicate wins.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Authentication,
    Authorization,
    NotFound,
    Validation,
    RateLimit,
    Server,
    Network,
    Other,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RateLimitInfo {
    pub limit: Option<u64>,
    pub remaining: Option<u64>,
    pub reset: Option<u64>,
}

impl RateLimitInfo {
    fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let info = Self {
            limit: parse_header_u64(headers, RATE_LIMIT_LIMIT_HEADER),
            remaining: parse_header_u64(headers, RATE_LIMIT_REMAINING_HEADER),
            reset: parse_header_u64(headers, RATE_LIMIT_RESET_HEADER),
        };
        (info != Self::default()).then_some(info)
    }
}

/// Structured payload for rejected document or biometric uploads.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentValidationError {
    pub code: String,
    pub message: String,
    pub human_tip: String,
    #[serde(default)]
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ValidationMetadata>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_file_size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The single error type surfaced by this crate.
///
/// Every transport failure, non-success response, and local request/response
/// codec failure is normalized into this shape exactly once, at the point it
/// is first observed. Classification is a pure function of `status`, `code`
/// and `origin`.
#[derive(Clone, Debug, Error)]
#[error("{status_text} ({status}): {message}")]
pub struct Error {
    status: u16,
    status_text: String,
    code: Option<String>,
    message: String,
    validation_messages: Vec<String>,
    rate_limit: Option<RateLimitInfo>,
    retry_after: Option<Duration>,
    body: Option<Value>,
    raw_body: Option<String>,
    headers: HeaderMap,
    method: Option<Method>,
    uri: Option<String>,
    timestamp: SystemTime,
    origin: ErrorOrigin,
    #[source]
    source: Option<SharedError>,
}

impl Error {
    fn base(origin: ErrorOrigin, status: u16, status_text: String, message: String) -> Self {
        Self {
            status,
            status_text,
            code: None,
            message,
            validation_messages: Vec::new(),
            rate_limit: None,
            retry_after: None,
            body: None,
            raw_body: None,
            headers: HeaderMap::new(),
            method: None,
            uri: None,
            timestamp: SystemTime::now(),
            origin,
            source: None,
        }
    }

    /// Normalizes a received non-success response.
    pub(crate) fn from_response(
        method: &Method,
        uri: &str,
        status: StatusCode,
        headers: HeaderMap,
        body: &Bytes,
    ) -> Self {
        let parsed: Option<Value> = serde_json::from_slice(body).ok();
        let raw_text = (!body.is_empty()).then(|| truncate_body(body));
        let fallback = format!("request failed with status code {}", status.as_u16());
        let message = response_message(parsed.as_ref(), raw_text.as_deref()).unwrap_or(fallback);

        let mut error = Self::base(
            ErrorOrigin::Response,
            status.as_u16(),
            status.canonical_reason().unwrap_or_default().to_owned(),
            message,
        );
        error.code = parsed.as_ref().and_then(extract_code);
        error.validation_messages = parsed
            .as_ref()
            .map(extract_validation_messages)
            .unwrap_or_default();
        error.rate_limit = RateLimitInfo::from_headers(&headers);
        error.retry_after = parse_retry_after(&headers, SystemTime::now());
        error.body = parsed;
        error.raw_body = raw_text;
        error.headers = headers;
        error.method = Some(method.clone());
        error.uri = Some(uri.to_owned());
        error
    }

    /// Normalizes a failure where the request was sent but nothing came back.
    pub(crate) fn from_transport(
        method: &Method,
        uri: &str,
        kind: TransportErrorKind,
        source: Option<BoxError>,
    ) -> Self {
        let mut error = Self::base(
            ErrorOrigin::Network,
            0,
            NETWORK_ERROR_STATUS_TEXT.to_owned(),
            NETWORK_ERROR_MESSAGE.to_owned(),
        );
        error.code = Some(kind.code().to_owned());
        error.method = Some(method.clone());
        error.uri = Some(uri.to_owned());
        error.source = source.map(SharedError::from);
        error
    }

    fn client(code: &str, message: String, source: Option<BoxError>) -> Self {
        let mut error = Self::base(ErrorOrigin::Client, 0, String::new(), message);
        error.code = Some(code.to_owned());
        error.source = source.map(SharedError::from);
        error
    }

    pub(crate) fn invalid_uri(uri: String) -> Self {
        Self::client("ERR_INVALID_URL", format!("invalid request uri: {uri}"), None)
    }

    pub(crate) fn invalid_header(name: &str, source: BoxError) -> Self {
        Self::client(
            "ERR_INVALID_HEADER",
            format!("invalid header {name}: {source}"),
            Some(source),
        )
    }

    pub(crate) fn serialize(source: serde_json::Error) -> Self {
        Self::client(
            "ERR_SERIALIZE",
            format!("failed to serialize request body: {source}"),
            Some(Box::new(source)),
        )
    }

    pub(crate) fn serialize_query(source: serde_urlencoded::ser::Error) -> Self {
        Self::client(
            "ERR_SERIALIZE",
            format!("failed to serialize request query: {source}"),
            Some(Box::new(source)),
        )
    }

    pub(crate) fn deserialize(source: serde_json::Error, body: &[u8]) -> Self {
        let mut error = Self::client(
            "ERR_DESERIALIZE",
            format!("failed to decode response json: {source}"),
            Some(Box::new(source)),
        );
        error.raw_body = Some(truncate_body(body));
        error
    }

    pub(crate) fn request_build(source: http::Error) -> Self {
        Self::client(
            "ERR_REQUEST_BUILD",
            format!("failed to build http request: {source}"),
            Some(Box::new(source)),
        )
    }

    pub(crate) fn tls_backend(backend: &'static str, message: String) -> Self {
        Self::client(
            "ERR_TLS_BACKEND",
            format!("tls backend {backend} unavailable: {message}"),
            None,
        )
    }

    pub(crate) fn body_too_large(limit_bytes: usize, actual_bytes: usize) -> Self {
        Self::client(
            "ERR_BODY_TOO_LARGE",
            format!("response body exceeded {limit_bytes} bytes (read {actual_bytes})"),
            None,
        )
    }

    pub(crate) fn refresh_cancelled() -> Self {
        Self::client(
            "ERR_REFRESH_CANCELLED",
            "token refresh was cancelled before it completed".to_owned(),
            None,
        )
    }

    pub(crate) fn with_request(mut self, method: &Method, uri: &str) -> Self {
        if self.method.is_none() {
            self.method = Some(method.clone());
        }
        if self.uri.is_none() {
            self.uri = Some(uri.to_owned());
        }
        self
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn status_text(&self) -> &str {
        &self.status_text
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn validation_messages(&self) -> &[String] {
        &self.validation_messages
    }

    pub fn rate_limit(&self) -> Option<RateLimitInfo> {
        self.rate_limit
    }

    /// Parsed `Retry-After` of the response, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    /// Response body, when it was valid JSON.
    pub fn body(&self) -> Option<&Value> {
        self.body.as_ref()
    }

    /// Response body as (truncated) text.
    pub fn raw_body(&self) -> Option<&str> {
        self.raw_body.as_deref()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn method(&self) -> Option<&Method> {
        self.method.as_ref()
    }

    pub fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }

    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    pub fn origin(&self) -> ErrorOrigin {
        self.origin
    }

    pub fn is_authentication_error(&self) -> bool {
        self.status == 401
    }

    pub fn is_authorization_error(&self) -> bool {
        self.status == 403
    }

    pub fn is_not_found_error(&self) -> bool {
        self.status == 404
    }

    pub fn is_validation_error(&self) -> bool {
        matches!(self.status, 400 | 422)
    }

    pub fn is_rate_limit_error(&self) -> bool {
        self.status == 429
    }

    pub fn is_server_error(&self) -> bool {
        (500..600).contains(&self.status)
    }

    pub fn is_network_error(&self) -> bool {
        if self.origin == ErrorOrigin::Client {
            return false;
        }
        self.status == 0
            || matches!(
                self.code.as_deref(),
                Some(CONNECTION_ABORTED_CODE | DNS_FAILURE_CODE)
            )
    }

    pub fn is_retryable(&self) -> bool {
        self.is_network_error()
            || self.is_rate_limit_error()
            || matches!(self.status, 502..=504)
    }

    pub fn is_document_validation_error(&self) -> bool {
        self.status == 400
            && self.code.as_deref().is_some_and(|code| {
                DOCUMENT_VALIDATION_PREFIXES
                    .iter()
                    .any(|prefix| code.starts_with(prefix))
            })
    }

    pub fn kind(&self) -> ErrorKind {
        if self.is_authentication_error() {
            ErrorKind::Authentication
        } else if self.is_authorization_error() {
            ErrorKind::Authorization
        } else if self.is_not_found_error() {
            ErrorKind::NotFound
        } else if self.is_validation_error() {
            ErrorKind::Validation
        } else if self.is_rate_limit_error() {
            ErrorKind::RateLimit
        } else if self.is_server_error() {
            ErrorKind::Server
        } else if self.is_network_error() {
            ErrorKind::Network
        } else {
            ErrorKind::Other
        }
    }

    /// Structured rejection details; `None` unless
    /// [`is_document_validation_error`](Self::is_document_validation_error).
    pub fn validation_error(&self) -> Option<DocumentValidationError> {
        if !self.is_document_validation_error() {
            return None;
        }
        let code = self.code.clone()?;
        let candidates = self.body_candidates();

        for candidate in &candidates {
            if let Ok(parsed) =
                serde_json::from_value::<DocumentValidationError>((*candidate).clone())
                && parsed.code == code
                && !parsed.human_tip.trim().is_empty()
            {
                return Some(parsed);
            }
        }

        let field = |name: &str| candidates.iter().find_map(|candidate| candidate.get(name));
        let retryable = field("retryable")
            .and_then(Value::as_bool)
            .unwrap_or_else(|| default_retryable(&code));
        let human_tip = field("humanTip")
            .or_else(|| field("human_tip"))
            .and_then(Value::as_str)
            .filter(|tip| !tip.trim().is_empty())
            .map(ToOwned::to_owned)
            .unwrap_or_else(|| human_tip_for(&code).to_owned());
        let metadata = field("metadata")
            .or_else(|| field("details"))
            .filter(|value| value.is_object())
            .and_then(|value| serde_json::from_value::<ValidationMetadata>(value.clone()).ok());

        Some(DocumentValidationError {
            code,
            message: self.message.clone(),
            human_tip,
            retryable,
            metadata,
        })
    }

    fn body_candidates(&self) -> Vec<&Value> {
        let Some(body) = self.body.as_ref().filter(|body| body.is_object()) else {
            return Vec::new();
        };
        let mut candidates = vec![body];
        if let Some(nested) = body.get("error").filter(|nested| nested.is_object()) {
            candidates.insert(0, nested);
        }
        candidates
    }

    /// One-line summary for the observability channel.
    pub(crate) fn log_detail(&self) -> String {
        match self.origin {
            ErrorOrigin::Response => self
                .raw_body
                .clone()
                .unwrap_or_else(|| self.message.clone()),
            ErrorOrigin::Network | ErrorOrigin::Client => match &self.source {
                Some(source) => format!("{}: {source}", self.message),
                None => self.message.clone(),
            },
        }
    }
}

fn string_field(object: &Map<String, Value>, name: &str) -> Option<String> {
    object
        .get(name)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(ToOwned::to_owned)
}

fn response_message(parsed: Option<&Value>, raw_text: Option<&str>) -> Option<String> {
    match parsed {
        Some(Value::Object(object)) => string_field(object, "message")
            .or_else(|| string_field(object, "error"))
            .or_else(|| {
                object
                    .get("error")
                    .and_then(Value::as_object)
                    .and_then(|nested| string_field(nested, "message"))
            })
            .or_else(|| string_field(object, "detail"))
            .or_else(|| string_field(object, "errorDescription")),
        Some(Value::String(text)) if !text.trim().is_empty() => Some(text.trim().to_owned()),
        Some(_) => None,
        None => raw_text
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(ToOwned::to_owned),
    }
}

fn extract_code(body: &Value) -> Option<String> {
    let object = body.as_object()?;
    let from = |object: &Map<String, Value>| {
        string_field(object, "code")
            .or_else(|| string_field(object, "errorCode"))
            .or_else(|| string_field(object, "error_code"))
    };
    from(object).or_else(|| object.get("error").and_then(Value::as_object).and_then(from))
}

fn extract_validation_messages(body: &Value) -> Vec<String> {
    let Some(object) = body.as_object() else {
        return Vec::new();
    };
    let source = object.get("errors").or_else(|| object.get("messages"));
    match source {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(text) => Some(text.clone()),
                Value::Object(entry) => string_field(entry, "message"),
                _ => None,
            })
            .collect(),
        Some(Value::Object(fields)) => fields
            .iter()
            .flat_map(|(field, messages)| {
                let messages = match messages {
                    Value::Array(items) => items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(ToOwned::to_owned)
                        .collect(),
                    Value::String(text) => vec![text.clone()],
                    _ => Vec::new(),
                };
                messages
                    .into_iter()
                    .map(move |message| format!("{field}: {message}"))
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn default_retryable(code: &str) -> bool {
    code.starts_with("IMAGE_") || code.starts_with("FACE_")
}

fn human_tip_for(code: &str) -> &'static str {
    match code {
        "IMAGE_TOO_SMALL" => "Upload a larger image; photos should be at least 600x600 pixels.",
        "IMAGE_TOO_LARGE" => "Reduce the image size or resolution and upload it again.",
        "IMAGE_BLURRY" => "Hold the camera steady in good light and retake the photo.",
        "IMAGE_TOO_DARK" => "Retake the photo in a brighter place without shadows.",
        "IMAGE_FORMAT_UNSUPPORTED" => "Upload the image as JPEG or PNG.",
        "FACE_NOT_DETECTED" => "Make sure your whole face is visible and centred in the frame.",
        "FACE_MULTIPLE" => "Make sure only one person is visible in the photo.",
        "FACE_MISMATCH" => "Use a photo of the same person shown on the identity document.",
        "DOCUMENT_EXPIRED" => "Use an identity document that has not expired.",
        "DOCUMENT_UNREADABLE" => "Scan the whole document flat, in focus and without glare.",
        "DOCUMENT_TYPE_UNSUPPORTED" => "Upload a passport, national ID card or driving licence.",
        _ if code.starts_with("IMAGE_") => "Check the image quality and upload it again.",
        _ if code.starts_with("FACE_") => "Retake the photo with your face clearly visible.",
        _ => "Check the document and upload it again.",
    }
}
