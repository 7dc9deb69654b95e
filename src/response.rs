use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use serde::de::DeserializeOwned;

use crate::Result;
use crate::error::Error;

/// Conditional-cache bookkeeping attached to `GET` responses.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheTag {
    /// `true` when the body was served from the cache after a `304`.
    pub from_cache: bool,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
    cache_tag: Option<CacheTag>,
}

impl Response {
    pub(crate) fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
            cache_tag: None,
        }
    }

    pub(crate) fn with_cache_tag(mut self, cache_tag: CacheTag) -> Self {
        self.cache_tag = Some(cache_tag);
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn into_body(self) -> Bytes {
        self.body
    }

    pub fn cache_tag(&self) -> Option<&CacheTag> {
        self.cache_tag.as_ref()
    }

    pub fn from_cache(&self) -> bool {
        self.cache_tag.as_ref().is_some_and(|tag| tag.from_cache)
    }

    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T>(&self) -> Result<T>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(&self.body).map_err(|source| Error::deserialize(source, &self.body))
    }
}
