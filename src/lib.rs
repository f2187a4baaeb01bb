//! Kinesis Ack Consumer - ack-gated checkpointing for AWS Kinesis streams
//!
//! Records read from a stream are published on an in-process event bus, and a
//! shard's position is checkpointed only after the downstream consumer acks
//! the batch. A crash between delivery and ack therefore redelivers the batch
//! instead of losing it.

pub mod bus;
pub mod client;
pub mod consumer;
pub mod error;
pub mod event;
pub mod factory;
pub mod monitoring;
pub mod processor;
pub mod reader;
pub mod retry;
pub mod store;
pub mod worker;

// Make test utilities available for integration tests
#[cfg(any(test, feature = "test-utils"))]
pub mod test;

pub use bus::{AckOutcome, AckSubscription, BusEvent, EventBus, Subscription, Topic};
pub use client::{KinesisClientError, KinesisClientTrait};
pub use consumer::{AckSink, Consumer, ConsumerConfig, RecordsStream};
pub use error::{ConsumerError, Result, ShardError};
pub use event::{AckEvent, Action, Batch, EventId, NewRecordsEvent, Record};
pub use factory::ProcessorFactory;
pub use monitoring::{ConsumerEvent, MonitoringConfig};
pub use processor::{AckGatedProcessor, Checkpointer, ProcessorConfig, RecordProcessor, ShutdownReason};
pub use reader::{InitialPosition, KinesisReaderConfig, KinesisShardReader};
pub use retry::RetryConfig;
pub use store::CheckpointStore;
pub use worker::{ShardReader, StopOutcome, Worker, WorkerConfig, WorkerState};

#[cfg(feature = "dynamodb-store")]
pub use store::DynamoDbCheckpointStore;
pub use store::InMemoryCheckpointStore;
