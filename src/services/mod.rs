//! Thin resource wrappers over [`Client`], one per API family.
//!
//! Every call goes through the same pipeline as `Client::get` and friends, so
//! caching, retries and token refresh apply uniformly.

mod auth;
mod documents;
mod envelopes;
mod signers;
mod templates;
mod webhooks;
pub mod types;

pub use auth::Auth;
pub use documents::Documents;
pub use envelopes::Envelopes;
pub use signers::Signers;
pub use templates::Templates;
pub use webhooks::Webhooks;

use crate::client::Client;

impl Client {
    pub fn auth(&self) -> Auth<'_> {
        Auth::new(self)
    }

    pub fn envelopes(&self) -> Envelopes<'_> {
        Envelopes::new(self)
    }

    pub fn documents(&self) -> Documents<'_> {
        Documents::new(self)
    }

    pub fn signers(&self) -> Signers<'_> {
        Signers::new(self)
    }

    pub fn templates(&self) -> Templates<'_> {
        Templates::new(self)
    }

    pub fn webhooks(&self) -> Webhooks<'_> {
        Webhooks::new(self)
    }
}

/// Percent-encodes one path segment.
pub(crate) fn segment(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}
