use crate::error::CheckpointError;
use crate::processor::Checkpointer;
use crate::store::{CheckpointStore, SHARD_END};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, trace};

/// Persists one fixed shard position to a [`CheckpointStore`]
pub struct StoreCheckpointer<S: CheckpointStore> {
    store: Arc<S>,
    shard_id: String,
    position: Option<String>,
}

impl<S: CheckpointStore> StoreCheckpointer<S> {
    /// Checkpoints `sequence_number`, or nothing when there is none yet
    pub fn new(store: Arc<S>, shard_id: impl Into<String>, sequence_number: Option<String>) -> Self {
        Self {
            store,
            shard_id: shard_id.into(),
            position: sequence_number,
        }
    }

    /// Checkpoints the end of a closed shard
    pub fn shard_end(store: Arc<S>, shard_id: impl Into<String>) -> Self {
        Self::new(store, shard_id, Some(SHARD_END.to_string()))
    }

    pub fn position(&self) -> Option<&str> {
        self.position.as_deref()
    }
}

#[async_trait]
impl<S: CheckpointStore + 'static> Checkpointer for StoreCheckpointer<S> {
    async fn checkpoint(&self) -> anyhow::Result<()> {
        let Some(position) = &self.position else {
            trace!(shard_id = %self.shard_id, "Nothing read yet, no checkpoint to store");
            return Ok(());
        };

        self.store
            .save_checkpoint(&self.shard_id, position)
            .await
            .map_err(|e| CheckpointError::SaveFailed(format!("{:#}", e)))?;
        debug!(shard_id = %self.shard_id, position = %position, "Stored checkpoint");
        Ok(())
    }
}
