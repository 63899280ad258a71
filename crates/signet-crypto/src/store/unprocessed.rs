//! Durable queue of envelopes not yet fully processed. Not cached, so it
//! works before hydration.

use tracing::debug;

use super::ProtocolStore;
use crate::error::StoreError;
use crate::gateway::{UnprocessedEnvelope, UnprocessedUpdate};

impl ProtocolStore {
    pub async fn unprocessed_count(&self) -> Result<usize, StoreError> {
        self.gateway
            .get_unprocessed_count()
            .await
            .map_err(StoreError::Persistence)
    }

    /// Every queued envelope, oldest first.
    pub async fn all_unprocessed(&self) -> Result<Vec<UnprocessedEnvelope>, StoreError> {
        let mut envelopes = self
            .gateway
            .get_all_unprocessed()
            .await
            .map_err(StoreError::Persistence)?;
        envelopes.sort_by_key(|envelope| envelope.timestamp);
        Ok(envelopes)
    }

    pub async fn unprocessed_by_id(
        &self,
        id: &str,
    ) -> Result<Option<UnprocessedEnvelope>, StoreError> {
        self.gateway
            .get_unprocessed_by_id(id)
            .await
            .map_err(StoreError::Persistence)
    }

    pub async fn add_unprocessed(&self, envelope: &UnprocessedEnvelope) -> Result<(), StoreError> {
        debug!(envelope_id = %envelope.id, "queueing unprocessed envelope");
        self.gateway
            .save_unprocessed(envelope)
            .await
            .map_err(StoreError::Persistence)
    }

    pub async fn add_multiple_unprocessed(
        &self,
        envelopes: &[UnprocessedEnvelope],
    ) -> Result<(), StoreError> {
        debug!(count = envelopes.len(), "queueing unprocessed envelopes");
        self.gateway
            .save_unprocesseds(envelopes)
            .await
            .map_err(StoreError::Persistence)
    }

    pub async fn update_unprocessed_attempts(
        &self,
        id: &str,
        attempts: u32,
    ) -> Result<(), StoreError> {
        self.gateway
            .update_unprocessed_attempts(id, attempts)
            .await
            .map_err(StoreError::Persistence)
    }

    pub async fn update_unprocessed_with_data(
        &self,
        id: &str,
        update: &UnprocessedUpdate,
    ) -> Result<(), StoreError> {
        self.gateway
            .update_unprocessed_with_data(id, update)
            .await
            .map_err(StoreError::Persistence)
    }

    pub async fn remove_unprocessed(&self, id: &str) -> Result<(), StoreError> {
        debug!(envelope_id = id, "removing unprocessed envelope");
        self.gateway
            .remove_unprocessed(id)
            .await
            .map_err(StoreError::Persistence)
    }

    pub async fn remove_all_unprocessed(&self) -> Result<(), StoreError> {
        self.gateway
            .remove_all_unprocessed()
            .await
            .map_err(StoreError::Persistence)
    }
}
