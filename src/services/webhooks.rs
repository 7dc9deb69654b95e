use crate::Result;
use crate::client::Client;

use super::segment;
use super::types::{CreateWebhook, Webhook};

pub struct Webhooks<'a> {
    client: &'a Client,
}

impl<'a> Webhooks<'a> {
    pub(crate) fn new(client: &'a Client) -> Self {
        Self { client }
    }

    pub async fn list(&self) -> Result<Vec<Webhook>> {
        self.client.get("/webhooks").send_json().await
    }

    pub async fn create(&self, webhook: &CreateWebhook) -> Result<Webhook> {
        self.client
            .post("/webhooks")
            .json(webhook)?
            .send_json()
            .await
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        self.client
            .delete(format!("/webhooks/{}", segment(id)))
            .send()
            .await?;
        Ok(())
    }
}
