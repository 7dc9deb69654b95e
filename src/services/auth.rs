use crate::Result;
use crate::client::Client;
use crate::refresh::TokenPair;

use super::types::{LoginRequest, User};

pub struct Auth<'a> {
    client: &'a Client,
}

impl<'a> Auth<'a> {
    pub(crate) fn new(client: &'a Client) -> Self {
        Self { client }
    }

    /// Exchanges credentials for a token pair and installs it on the client.
    pub async fn login(&self, email: &str, password: &str) -> Result<TokenPair> {
        let tokens: TokenPair = self
            .client
            .post("/auth/login")
            .json(&LoginRequest {
                email: email.to_owned(),
                password: password.to_owned(),
            })?
            .send_json()
            .await?;
        self.client.install_tokens(&tokens);
        Ok(tokens)
    }

    /// Revokes the session server-side; local tokens are cleared either way.
    pub async fn logout(&self) -> Result<()> {
        let result = self.client.post("/auth/logout").send().await;
        self.client.clear_tokens();
        result.map(|_| ())
    }

    pub async fn me(&self) -> Result<User> {
        self.client.get("/auth/me").send_json().await
    }
}
