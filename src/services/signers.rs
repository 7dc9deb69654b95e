use crate::Result;
use crate::client::Client;

use super::segment;
use super::types::{AddSigner, Signer, UpdateSigner};

pub struct Signers<'a> {
    client: &'a Client,
}

impl<'a> Signers<'a> {
    pub(crate) fn new(client: &'a Client) -> Self {
        Self { client }
    }

    fn collection(envelope_id: &str) -> String {
        format!("/envelopes/{}/signers", segment(envelope_id))
    }

    fn member(envelope_id: &str, signer_id: &str) -> String {
        format!("{}/{}", Self::collection(envelope_id), segment(signer_id))
    }

    pub async fn list(&self, envelope_id: &str) -> Result<Vec<Signer>> {
        self.client
            .get(Self::collection(envelope_id))
            .send_json()
            .await
    }

    pub async fn add(&self, envelope_id: &str, signer: &AddSigner) -> Result<Signer> {
        self.client
            .post(Self::collection(envelope_id))
            .json(signer)?
            .send_json()
            .await
    }

    pub async fn update(
        &self,
        envelope_id: &str,
        signer_id: &str,
        changes: &UpdateSigner,
    ) -> Result<Signer> {
        self.client
            .patch(Self::member(envelope_id, signer_id))
            .json(changes)?
            .send_json()
            .await
    }

    pub async fn remove(&self, envelope_id: &str, signer_id: &str) -> Result<()> {
        self.client
            .delete(Self::member(envelope_id, signer_id))
            .send()
            .await?;
        Ok(())
    }

    /// Re-sends the signing invitation.
    pub async fn remind(&self, envelope_id: &str, signer_id: &str) -> Result<()> {
        self.client
            .post(format!("{}/remind", Self::member(envelope_id, signer_id)))
            .send()
            .await?;
        Ok(())
    }
}
