use crate::retry::{RetryConfig, RetryHandle};
use crate::store::CheckpointStore;
use anyhow::Context;
use async_trait::async_trait;
use aws_sdk_dynamodb::{types::AttributeValue, Client as DynamoClient};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace};

const KEY_ATTRIBUTE: &str = "shard_id";
const CHECKPOINT_ATTRIBUTE: &str = "sequence_number";

/// Checkpoints kept in a DynamoDB table keyed by `shard_id`
///
/// Keys are prefixed so several applications can share one table.
#[derive(Debug, Clone)]
pub struct DynamoDbCheckpointStore {
    client: DynamoClient,
    table_name: String,
    key_prefix: String,
    retry_config: RetryConfig,
    cancel: CancellationToken,
}

impl DynamoDbCheckpointStore {
    pub fn builder() -> DynamoDbCheckpointStoreBuilder {
        DynamoDbCheckpointStoreBuilder::default()
    }

    pub fn new(client: DynamoClient, table_name: impl Into<String>, key_prefix: impl Into<String>) -> Self {
        Self {
            client,
            table_name: table_name.into(),
            key_prefix: key_prefix.into(),
            retry_config: RetryConfig::default(),
            cancel: CancellationToken::new(),
        }
    }

    fn prefixed_key(&self, shard_id: &str) -> String {
        format!("{}{}", self.key_prefix, shard_id)
    }
}

#[async_trait]
impl CheckpointStore for DynamoDbCheckpointStore {
    #[instrument(skip(self), fields(table = %self.table_name))]
    async fn get_checkpoint(&self, shard_id: &str) -> anyhow::Result<Option<String>> {
        let key = self.prefixed_key(shard_id);
        let mut retry = RetryHandle::from_config(self.retry_config.clone());

        let checkpoint = retry
            .retry(
                || async {
                    let response = self
                        .client
                        .get_item()
                        .table_name(&self.table_name)
                        .key(KEY_ATTRIBUTE, AttributeValue::S(key.clone()))
                        .consistent_read(true)
                        .send()
                        .await
                        .context("Failed to get checkpoint from DynamoDB")?;

                    Ok::<_, anyhow::Error>(
                        response
                            .item
                            .and_then(|item| item.get(CHECKPOINT_ATTRIBUTE).cloned())
                            .and_then(|attr| attr.as_s().ok().cloned()),
                    )
                },
                &self.cancel,
            )
            .await?;

        debug!(shard_id = %shard_id, key = %key, checkpoint = ?checkpoint, "Retrieved checkpoint from DynamoDB");
        Ok(checkpoint)
    }

    #[instrument(skip(self), fields(table = %self.table_name))]
    async fn save_checkpoint(&self, shard_id: &str, sequence_number: &str) -> anyhow::Result<()> {
        let key = self.prefixed_key(shard_id);
        let mut retry = RetryHandle::from_config(self.retry_config.clone());

        retry
            .retry(
                || async {
                    self.client
                        .put_item()
                        .table_name(&self.table_name)
                        .item(KEY_ATTRIBUTE, AttributeValue::S(key.clone()))
                        .item(CHECKPOINT_ATTRIBUTE, AttributeValue::S(sequence_number.to_string()))
                        .send()
                        .await
                        .context("Failed to save checkpoint to DynamoDB")?;
                    trace!(key = %key, "put_item succeeded");
                    Ok::<_, anyhow::Error>(())
                },
                &self.cancel,
            )
            .await?;

        debug!(shard_id = %shard_id, sequence_number = %sequence_number, "Saved checkpoint to DynamoDB");
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct DynamoDbCheckpointStoreBuilder {
    client: Option<DynamoClient>,
    table_name: Option<String>,
    key_prefix: Option<String>,
    retry_config: Option<RetryConfig>,
    cancel: Option<CancellationToken>,
}

impl DynamoDbCheckpointStoreBuilder {
    pub fn with_client(mut self, client: DynamoClient) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_table_name(mut self, table_name: impl Into<String>) -> Self {
        self.table_name = Some(table_name.into());
        self
    }

    pub fn with_key_prefix(mut self, key_prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(key_prefix.into());
        self
    }

    pub fn with_retry_config(mut self, config: RetryConfig) -> Self {
        self.retry_config = Some(config);
        self
    }

    /// Abandons in-progress retries once `cancel` fires
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn build(self) -> anyhow::Result<DynamoDbCheckpointStore> {
        let table_name = self
            .table_name
            .filter(|name| !name.is_empty())
            .ok_or_else(|| anyhow::anyhow!("Table name is required"))?;

        Ok(DynamoDbCheckpointStore {
            client: self
                .client
                .ok_or_else(|| anyhow::anyhow!("DynamoDB client is required"))?,
            table_name,
            key_prefix: self.key_prefix.unwrap_or_default(),
            retry_config: self.retry_config.unwrap_or_default(),
            cancel: self.cancel.unwrap_or_default(),
        })
    }
}
