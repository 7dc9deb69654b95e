use crate::Result;
use crate::client::Client;

use super::segment;
use super::types::{CreateTemplate, Envelope, InstantiateTemplate, Page, Template};

pub struct Templates<'a> {
    client: &'a Client,
}

impl<'a> Templates<'a> {
    pub(crate) fn new(client: &'a Client) -> Self {
        Self { client }
    }

    pub async fn list(&self) -> Result<Page<Template>> {
        self.client.get("/templates").send_json().await
    }

    pub async fn get(&self, id: &str) -> Result<Template> {
        self.client
            .get(format!("/templates/{}", segment(id)))
            .send_json()
            .await
    }

    pub async fn create(&self, template: &CreateTemplate) -> Result<Template> {
        self.client
            .post("/templates")
            .json(template)?
            .send_json()
            .await
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        self.client
            .delete(format!("/templates/{}", segment(id)))
            .send()
            .await?;
        Ok(())
    }

    /// Creates a draft envelope from the template.
    pub async fn instantiate(&self, id: &str, request: &InstantiateTemplate) -> Result<Envelope> {
        self.client
            .post(format!("/templates/{}/envelopes", segment(id)))
            .json(request)?
            .send_json()
            .await
    }
}
