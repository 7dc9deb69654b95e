//! `signkit` is the HTTP pipeline behind an e-signature API SDK.
//!
//! Every call runs through one middleware chain that tags requests with an id,
//! serves unchanged `GET`s from an ETag cache, retries transient failures with
//! Fibonacci backoff, and refreshes an expired access token at most once no
//! matter how many requests observe the `401` concurrently. Every failure that
//! reaches a caller is a single [`Error`] with classification predicates.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use signkit::prelude::{CacheConfig, Client, RetryPolicy};
//! use signkit::services::types::{CreateEnvelope, ListEnvelopes};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder("https://api.example.com/v1")
//!         .access_token("access-token")
//!         .refresh_token("refresh-token")
//!         .request_timeout(Duration::from_secs(10))
//!         .retry_policy(RetryPolicy::standard().max_attempts(3))
//!         .cache(CacheConfig::default().max_size(200))
//!         .try_build()?;
//!
//!     let envelope = client
//!         .envelopes()
//!         .create(&CreateEnvelope {
//!             title: "NDA".to_owned(),
//!             ..CreateEnvelope::default()
//!         })
//!         .await?;
//!     let drafts = client.envelopes().list(&ListEnvelopes::default()).await?;
//!     println!("created {} ({} envelopes)", envelope.id, drafts.data.len());
//!
//!     match client.documents().get("doc_missing").await {
//!         Err(error) if error.is_not_found_error() => println!("no such document"),
//!         other => println!("{other:?}"),
//!     }
//!     Ok(())
//! }
//! ```

#[cfg(all(not(feature = "tls-rustls-ring"), not(feature = "tls-native")))]
compile_error!("signkit requires one TLS backend feature: enable `tls-rustls-ring` or `tls-native`");

mod cache;
mod client;
mod error;
mod metrics;
mod middleware;
mod policy;
mod refresh;
mod request;
mod response;
mod retry;
mod transport;
mod util;

pub mod services;

pub use crate::cache::{
    CacheConfig, CacheEntry, CacheStats, ConditionalCache, InvalidationPattern, MAX_CACHE_TTL,
};
pub use crate::client::{Client, ClientBuilder};
pub use crate::error::{
    DocumentValidationError, Error, ErrorKind, ErrorOrigin, NETWORK_ERROR_STATUS_TEXT,
    RateLimitInfo, TransportErrorKind, ValidationMetadata,
};
pub use crate::metrics::MetricsSnapshot;
pub use crate::policy::{HttpInterceptor, RequestInfo};
pub use crate::refresh::{RefreshState, TokenPair, TokenRefreshListener};
pub use crate::request::RequestBuilder;
pub use crate::response::{CacheTag, Response};
pub use crate::retry::{RetryDecision, RetryPolicy, RetryState};
pub use crate::transport::TlsBackend;

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use crate::{
        CacheConfig, CacheTag, Client, ClientBuilder, ConditionalCache, DocumentValidationError,
        Error, ErrorKind, HttpInterceptor, MetricsSnapshot, Response, Result, RetryPolicy,
        TlsBackend, TokenPair, TokenRefreshListener,
    };
}
