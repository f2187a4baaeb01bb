//! Durable shard positions used by the Kinesis shard reader

use async_trait::async_trait;

#[cfg(feature = "dynamodb-store")]
pub mod dynamodb;
pub mod memory;

#[cfg(feature = "dynamodb-store")]
pub use dynamodb::DynamoDbCheckpointStore;
pub use memory::InMemoryCheckpointStore;

/// Checkpoint stored once a closed shard has been fully processed
pub const SHARD_END: &str = "SHARD_END";

/// Storage for the last processed sequence number of each shard
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get_checkpoint(&self, shard_id: &str) -> anyhow::Result<Option<String>>;

    async fn save_checkpoint(&self, shard_id: &str, sequence_number: &str) -> anyhow::Result<()>;
}
