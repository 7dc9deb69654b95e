//! In-memory conditional cache for `GET` responses keyed by request path.
//!
//! Entries carry the server validator (`ETag`) so the pipeline can send
//! `If-None-Match` and serve the stored body when the server answers `304`.

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use indexmap::IndexMap;
use regex::Regex;

use crate::util::{is_absolute_http_url, lock_unpoisoned};

const DEFAULT_MAX_SIZE: usize = 100;
const DEFAULT_TTL: Duration = Duration::from_secs(300);
/// Upper bound on any entry lifetime; larger `max-age` values are clamped.
pub const MAX_CACHE_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_size: usize,
    pub default_ttl: Duration,
}

impl CacheConfig {
    pub const fn disabled() -> Self {
        Self {
            enabled: false,
            max_size: DEFAULT_MAX_SIZE,
            default_ttl: DEFAULT_TTL,
        }
    }

    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size.max(1);
        self
    }

    pub fn default_ttl(mut self, default_ttl: Duration) -> Self {
        self.default_ttl = default_ttl;
        self
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: DEFAULT_MAX_SIZE,
            default_ttl: DEFAULT_TTL,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: String,
    pub etag: String,
    pub body: Bytes,
    pub expires_at: SystemTime,
    pub last_modified: Option<String>,
}

impl CacheEntry {
    pub fn is_fresh_at(&self, now: SystemTime) -> bool {
        now < self.expires_at
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
}

/// Selects entries for [`ConditionalCache::invalidate_pattern`].
#[derive(Clone, Debug)]
pub enum InvalidationPattern {
    Exact(String),
    Regex(Regex),
}

impl InvalidationPattern {
    pub fn regex(pattern: &str) -> Result<Self, regex::Error> {
        Regex::new(pattern).map(Self::Regex)
    }

    fn matches(&self, key: &str) -> bool {
        match self {
            Self::Exact(exact) => exact == key,
            Self::Regex(regex) => regex.is_match(key),
        }
    }
}

impl From<&str> for InvalidationPattern {
    fn from(exact: &str) -> Self {
        Self::Exact(exact.to_owned())
    }
}

impl From<String> for InvalidationPattern {
    fn from(exact: String) -> Self {
        Self::Exact(exact)
    }
}

impl From<Regex> for InvalidationPattern {
    fn from(regex: Regex) -> Self {
        Self::Regex(regex)
    }
}

/// Shared handle to one cache table; clones see the same entries.
#[derive(Clone, Debug)]
pub struct ConditionalCache {
    inner: Arc<Mutex<IndexMap<String, CacheEntry>>>,
    max_size: usize,
    default_ttl: Duration,
}

impl ConditionalCache {
    pub fn new(max_size: usize, default_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(IndexMap::new())),
            max_size: max_size.max(1),
            default_ttl,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.max_size, config.default_ttl)
    }

    /// Returns the entry for `key` unless it is missing or expired.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        self.get_at(key, SystemTime::now())
    }

    pub(crate) fn get_at(&self, key: &str, now: SystemTime) -> Option<CacheEntry> {
        let mut entries = lock_unpoisoned(&self.inner);
        let fresh = entries.get(key)?.is_fresh_at(now);
        if !fresh {
            entries.shift_remove(key);
            return None;
        }
        entries.get(key).cloned()
    }

    /// Inserts or overwrites `key`; `max_age` falls back to the default TTL.
    pub fn set(
        &self,
        key: impl Into<String>,
        etag: impl Into<String>,
        body: Bytes,
        max_age: Option<Duration>,
        last_modified: Option<String>,
    ) {
        self.set_at(key, etag, body, max_age, last_modified, SystemTime::now());
    }

    pub(crate) fn set_at(
        &self,
        key: impl Into<String>,
        etag: impl Into<String>,
        body: Bytes,
        max_age: Option<Duration>,
        last_modified: Option<String>,
        now: SystemTime,
    ) {
        let key = key.into();
        let entry = CacheEntry {
            key: key.clone(),
            etag: etag.into(),
            body,
            expires_at: expiry_after(now, max_age.unwrap_or(self.default_ttl)),
            last_modified,
        };

        let mut entries = lock_unpoisoned(&self.inner);
        // Overwrites move the key to the newest position.
        if entries.shift_remove(&key).is_none() {
            while entries.len() >= self.max_size {
                if entries.shift_remove_index(0).is_none() {
                    break;
                }
            }
        }
        entries.insert(key, entry);
    }

    pub fn invalidate(&self, key: &str) {
        lock_unpoisoned(&self.inner).shift_remove(key);
    }

    /// Removes every entry whose key matches; returns how many were removed.
    pub fn invalidate_pattern(&self, pattern: impl Into<InvalidationPattern>) -> usize {
        let pattern = pattern.into();
        let mut entries = lock_unpoisoned(&self.inner);
        let before = entries.len();
        entries.retain(|key, _| !pattern.matches(key));
        before - entries.len()
    }

    /// Removes `path` and every query variant of it (`path?...`).
    pub(crate) fn invalidate_path(&self, path: &str) {
        let query_prefix = format!("{path}?");
        lock_unpoisoned(&self.inner)
            .retain(|key, _| key != path && !key.starts_with(&query_prefix));
    }

    pub fn clear(&self) {
        lock_unpoisoned(&self.inner).clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: lock_unpoisoned(&self.inner).len(),
            max_size: self.max_size,
        }
    }
}

/// Cache key for a request target: the base URL is stripped and the query
/// string is kept with its pairs sorted, so equivalent queries share a key.
pub(crate) fn cache_key(base_url: &str, target: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let target = target.split('#').next().unwrap_or(target);
    let stripped = target
        .strip_prefix(base)
        .filter(|rest| !base.is_empty() && (rest.is_empty() || rest.starts_with(['/', '?'])));
    let relative = match stripped {
        Some(rest) => rest,
        None if is_absolute_http_url(target) => return target.to_owned(),
        None => target,
    };
    let (path, query) = match relative.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (relative, None),
    };
    let path = normalize_path(path);

    let mut pairs: Vec<(String, String)> = query
        .map(|query| {
            url::form_urlencoded::parse(query.as_bytes())
                .map(|(name, value)| (name.into_owned(), value.into_owned()))
                .collect()
        })
        .unwrap_or_default();
    if pairs.is_empty() {
        return path;
    }
    pairs.sort();
    let query = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish();
    format!("{path}?{query}")
}

/// Query-less path a cache key was derived from.
pub(crate) fn key_path(key: &str) -> &str {
    key.split('?').next().unwrap_or(key)
}

/// `path` with its trailing `/segment` removed; `None` at the root.
pub(crate) fn parent_path(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    let (parent, _) = trimmed.rsplit_once('/')?;
    if parent.is_empty() {
        return None;
    }
    Some(parent)
}

fn normalize_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_owned()
    } else {
        format!("/{path}")
    }
}

fn expiry_after(now: SystemTime, ttl: Duration) -> SystemTime {
    let ttl = ttl.min(MAX_CACHE_TTL);
    now.checked_add(ttl).unwrap_or(now)
}
