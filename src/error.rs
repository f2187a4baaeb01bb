//! Error types for the ack-gated consumer

use std::time::Duration;
use thiserror::Error;
use tokio::sync::AcquireError;
use tokio::task::JoinError;

use crate::event::EventId;

/// Main error type for consumer operations
#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Worker is already running")]
    AlreadyStarted,

    #[error("Usage error: {0}")]
    Usage(String),

    #[error("Checkpoint failed for shard {shard_id}: {message}")]
    CheckpointFailed { shard_id: String, message: String },

    #[error("No ack received for event {event_id} within {timeout:?}")]
    AckTimeout { event_id: EventId, timeout: Duration },

    #[error("Shard {shard_id} ended with unacknowledged batches")]
    ShardNotDrained { shard_id: String },

    #[error("Shard {0} stopped after a fatal error")]
    ShardFailed(String),

    #[error("Event bus is closed")]
    BusClosed,

    #[error("Downstream records stream was dropped")]
    DownstreamClosed,

    #[error("Failed to get iterator: {0}")]
    GetIteratorFailed(String),

    #[error("Iterator expired for shard {0}")]
    IteratorExpired(String),

    #[error("Failed to get records: {0}")]
    GetRecordsFailed(String),

    #[error("Failed to list shards: {0}")]
    ListShardsFailed(String),

    #[error("Checkpoint store error: {0}")]
    CheckpointStoreError(String),

    #[error("Maximum retry attempts reached: {0}")]
    MaxRetriesExceeded(String),

    #[error("Shutdown requested")]
    Shutdown,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type for consumer operations
pub type Result<T> = std::result::Result<T, ConsumerError>;

/// Error type for checkpoint store operations
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Failed to save checkpoint: {0}")]
    SaveFailed(String),

    #[error("Failed to retrieve checkpoint: {0}")]
    RetrieveFailed(String),
}

impl From<CheckpointError> for ConsumerError {
    fn from(err: CheckpointError) -> Self {
        ConsumerError::CheckpointStoreError(err.to_string())
    }
}

impl From<crate::retry::RetryError> for ConsumerError {
    fn from(err: crate::retry::RetryError) -> Self {
        use crate::retry::RetryError;
        match err {
            RetryError::MaxRetriesExceeded(attempts, msg) => {
                ConsumerError::MaxRetriesExceeded(format!("After {} attempts: {}", attempts, msg))
            }
            RetryError::Interrupted => ConsumerError::Shutdown,
        }
    }
}

impl From<AcquireError> for ConsumerError {
    fn from(err: AcquireError) -> Self {
        ConsumerError::Other(err.into())
    }
}

impl From<JoinError> for ConsumerError {
    fn from(err: JoinError) -> Self {
        ConsumerError::Other(err.into())
    }
}

impl ConsumerError {
    /// Whether the error only means the caller is shutting down
    pub fn is_shutdown(&self) -> bool {
        matches!(self, ConsumerError::Shutdown | ConsumerError::BusClosed)
    }
}

/// A fatal error scoped to one shard, reported upward to the consumer
#[derive(Debug)]
pub struct ShardError {
    pub shard_id: String,
    pub error: ConsumerError,
}

impl std::fmt::Display for ShardError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "shard {}: {}", self.shard_id, self.error)
    }
}
