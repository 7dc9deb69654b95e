use bytes::Bytes;

use crate::Result;
use crate::client::Client;

use super::segment;
use super::types::Document;

pub struct Documents<'a> {
    client: &'a Client,
}

impl<'a> Documents<'a> {
    pub(crate) fn new(client: &'a Client) -> Self {
        Self { client }
    }

    pub async fn list(&self, envelope_id: &str) -> Result<Vec<Document>> {
        self.client
            .get(format!("/envelopes/{}/documents", segment(envelope_id)))
            .send_json()
            .await
    }

    /// Uploads raw file bytes; `name` travels as a query parameter.
    pub async fn upload(
        &self,
        envelope_id: &str,
        name: &str,
        content_type: &str,
        body: impl Into<Bytes>,
    ) -> Result<Document> {
        self.client
            .post(format!("/envelopes/{}/documents", segment(envelope_id)))
            .query_pair("name", name)
            .try_header("content-type", content_type)?
            .body_bytes(body)
            .send_json()
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Document> {
        self.client
            .get(format!("/documents/{}", segment(id)))
            .send_json()
            .await
    }

    pub async fn download(&self, id: &str) -> Result<Bytes> {
        let response = self
            .client
            .get(format!("/documents/{}/download", segment(id)))
            .try_header("accept", "*/*")?
            .send()
            .await?;
        Ok(response.into_body())
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        self.client
            .delete(format!("/documents/{}", segment(id)))
            .send()
            .await?;
        Ok(())
    }
}
