//! Reading Kinesis shards and driving record processors
//!
//! [`KinesisShardReader`] is the stock [`ShardReader`](crate::worker::ShardReader):
//! one task per shard, resuming from the [`CheckpointStore`](crate::store::CheckpointStore)
//! and handing every non-empty page of records to the shard's processor.

mod checkpointer;
mod kinesis;

pub use checkpointer::StoreCheckpointer;
pub use kinesis::KinesisShardReader;

use crate::error::{ConsumerError, Result};
use crate::retry::RetryConfig;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Largest page GetRecords accepts
const MAX_BATCH_SIZE: i32 = 10_000;

/// Where to start reading a shard that has no stored checkpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitialPosition {
    /// Oldest available record
    TrimHorizon,
    /// Only records written after the iterator is created
    Latest,
    AtSequenceNumber(String),
    AtTimestamp(DateTime<Utc>),
}

/// Configuration for [`KinesisShardReader`]
#[derive(Debug, Clone)]
pub struct KinesisReaderConfig {
    pub stream_name: String,
    /// Maximum records requested per GetRecords call
    pub batch_size: i32,
    pub initial_position: InitialPosition,
    /// Pause after a poll that returned no records
    pub idle_time_between_reads: Duration,
    /// Cap on shards read at once (None reads every shard concurrently)
    pub max_concurrent_shards: Option<u32>,
    /// Retry policy for Kinesis calls
    pub retry: RetryConfig,
}

impl Default for KinesisReaderConfig {
    fn default() -> Self {
        Self {
            stream_name: String::new(),
            batch_size: 100,
            initial_position: InitialPosition::TrimHorizon,
            idle_time_between_reads: Duration::from_secs(1),
            max_concurrent_shards: None,
            retry: RetryConfig::default(),
        }
    }
}

impl KinesisReaderConfig {
    pub fn validate(&self) -> Result<()> {
        if self.stream_name.trim().is_empty() {
            return Err(ConsumerError::ConfigError(
                "stream_name must not be empty".to_string(),
            ));
        }
        if !(1..=MAX_BATCH_SIZE).contains(&self.batch_size) {
            return Err(ConsumerError::ConfigError(format!(
                "batch_size must be between 1 and {}",
                MAX_BATCH_SIZE
            )));
        }
        if self.max_concurrent_shards == Some(0) {
            return Err(ConsumerError::ConfigError(
                "max_concurrent_shards must be greater than zero when set".to_string(),
            ));
        }
        match &self.initial_position {
            InitialPosition::AtSequenceNumber(seq) if seq.is_empty() => Err(ConsumerError::ConfigError(
                "initial sequence number must not be empty".to_string(),
            )),
            InitialPosition::AtTimestamp(ts) if *ts > Utc::now() => Err(ConsumerError::ConfigError(
                "initial timestamp must not be in the future".to_string(),
            )),
            _ => Ok(()),
        }
    }
}
