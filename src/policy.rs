use http::{HeaderMap, Method, StatusCode};

use crate::error::Error;

/// What an [`HttpInterceptor`] can see about a logical request.
#[derive(Clone, Debug)]
pub struct RequestInfo {
    method: Method,
    path: String,
    request_id: Option<String>,
}

impl RequestInfo {
    pub(crate) fn new(method: Method, path: String, request_id: Option<String>) -> Self {
        Self {
            method,
            path,
            request_id,
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }
}

/// Observer hooks around each logical request.
///
/// Hooks run once per call, outside retries and token-refresh replays.
pub trait HttpInterceptor: Send + Sync {
    fn on_request(&self, _request: &RequestInfo, _headers: &mut HeaderMap) {}

    fn on_response(&self, _request: &RequestInfo, _status: StatusCode, _headers: &HeaderMap) {}

    fn on_error(&self, _request: &RequestInfo, _error: &Error) {}
}
