use crate::Result;
use crate::client::Client;

use super::segment;
use super::types::{CreateEnvelope, Envelope, ListEnvelopes, Page, UpdateEnvelope, VoidEnvelope};

pub struct Envelopes<'a> {
    client: &'a Client,
}

impl<'a> Envelopes<'a> {
    pub(crate) fn new(client: &'a Client) -> Self {
        Self { client }
    }

    pub async fn list(&self, params: &ListEnvelopes) -> Result<Page<Envelope>> {
        self.client
            .get("/envelopes")
            .query(params)?
            .send_json()
            .await
    }

    pub async fn create(&self, envelope: &CreateEnvelope) -> Result<Envelope> {
        self.client
            .post("/envelopes")
            .json(envelope)?
            .send_json()
            .await
    }

    pub async fn get(&self, id: &str) -> Result<Envelope> {
        self.client
            .get(format!("/envelopes/{}", segment(id)))
            .send_json()
            .await
    }

    pub async fn update(&self, id: &str, changes: &UpdateEnvelope) -> Result<Envelope> {
        self.client
            .patch(format!("/envelopes/{}", segment(id)))
            .json(changes)?
            .send_json()
            .await
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        self.client
            .delete(format!("/envelopes/{}", segment(id)))
            .send()
            .await?;
        Ok(())
    }

    /// Sends the envelope to its signers.
    pub async fn send(&self, id: &str) -> Result<Envelope> {
        self.client
            .post(format!("/envelopes/{}/send", segment(id)))
            .send_json()
            .await
    }

    pub async fn void(&self, id: &str, reason: &str) -> Result<Envelope> {
        self.client
            .post(format!("/envelopes/{}/void", segment(id)))
            .json(&VoidEnvelope {
                reason: reason.to_owned(),
            })?
            .send_json()
            .await
    }
}
