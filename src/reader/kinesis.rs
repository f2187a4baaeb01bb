use super::{InitialPosition, KinesisReaderConfig, StoreCheckpointer};
use crate::client::{KinesisClientError, KinesisClientTrait};
use crate::error::{CheckpointError, ConsumerError, Result, ShardError};
use crate::event::{Batch, Record};
use crate::factory::ProcessorFactory;
use crate::monitoring::{ConsumerEvent, IteratorEventType, Monitor};
use crate::processor::{AckGatedProcessor, RecordProcessor, ShutdownReason};
use crate::retry::{RetryError, RetryHandle};
use crate::store::{CheckpointStore, SHARD_END};
use crate::worker::ShardReader;
use async_trait::async_trait;
use aws_sdk_kinesis::types::{Record as KinesisRecord, ShardIteratorType};
use aws_smithy_types_convert::date_time::DateTimeExt;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// One GetRecords result, with expiry kept apart from retryable failures
enum Fetch {
    Page(Vec<KinesisRecord>, Option<String>),
    Expired,
}

/// How a shard's read loop ended
enum ShardExit {
    /// The shard is closed and every record was delivered
    End,
    /// The run was cancelled
    Cancelled,
}

fn convert_record(record: KinesisRecord) -> Record {
    let approximate_arrival = record
        .approximate_arrival_timestamp
        .and_then(|ts| ts.to_chrono_utc().ok());
    Record {
        sequence_number: record.sequence_number,
        partition_key: record.partition_key.unwrap_or_default(),
        data: Bytes::from(record.data.into_inner()),
        approximate_arrival,
    }
}

/// [`ShardReader`] over a Kinesis stream with checkpoints in a [`CheckpointStore`]
pub struct KinesisShardReader<C, S>
where
    C: KinesisClientTrait,
    S: CheckpointStore + 'static,
{
    config: KinesisReaderConfig,
    client: Arc<C>,
    store: Arc<S>,
}

impl<C, S> Clone for KinesisShardReader<C, S>
where
    C: KinesisClientTrait,
    S: CheckpointStore + 'static,
{
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            client: self.client.clone(),
            store: self.store.clone(),
        }
    }
}

impl<C, S> KinesisShardReader<C, S>
where
    C: KinesisClientTrait,
    S: CheckpointStore + 'static,
{
    pub fn new(config: KinesisReaderConfig, client: C, store: S) -> Self {
        Self {
            config,
            client: Arc::new(client),
            store: Arc::new(store),
        }
    }

    /// Iterator type and starting point, resuming after `after` when known
    fn start_position(
        &self,
        after: Option<&str>,
    ) -> (ShardIteratorType, Option<String>, Option<DateTime<Utc>>) {
        if let Some(sequence) = after {
            return (
                ShardIteratorType::AfterSequenceNumber,
                Some(sequence.to_string()),
                None,
            );
        }
        match &self.config.initial_position {
            InitialPosition::TrimHorizon => (ShardIteratorType::TrimHorizon, None, None),
            InitialPosition::Latest => (ShardIteratorType::Latest, None, None),
            InitialPosition::AtSequenceNumber(seq) => {
                (ShardIteratorType::AtSequenceNumber, Some(seq.clone()), None)
            }
            InitialPosition::AtTimestamp(ts) => (ShardIteratorType::AtTimestamp, None, Some(*ts)),
        }
    }

    async fn get_iterator(
        &self,
        shard_id: &str,
        after: Option<&str>,
        shutdown: &CancellationToken,
    ) -> std::result::Result<String, RetryError> {
        let (iterator_type, sequence, timestamp) = self.start_position(after);
        debug!(
            shard_id = %shard_id,
            iterator_type = ?iterator_type,
            sequence = ?sequence,
            "Requesting shard iterator"
        );

        RetryHandle::from_config(self.config.retry.clone())
            .retry(
                || {
                    self.client.get_shard_iterator(
                        &self.config.stream_name,
                        shard_id,
                        iterator_type.clone(),
                        sequence.as_deref(),
                        timestamp.as_ref(),
                    )
                },
                shutdown,
            )
            .await
    }

    async fn fetch(
        &self,
        iterator: &str,
        shutdown: &CancellationToken,
    ) -> std::result::Result<Fetch, RetryError> {
        RetryHandle::from_config(self.config.retry.clone())
            .retry(
                || async {
                    match self.client.get_records(iterator, self.config.batch_size).await {
                        Ok((records, next)) => Ok(Fetch::Page(records, next)),
                        Err(e) if KinesisClientError::is_expired_iterator(&e) => Ok(Fetch::Expired),
                        Err(e) => Err(e),
                    }
                },
                shutdown,
            )
            .await
    }

    /// Reads one shard until it ends, the run is cancelled, or it fails
    #[instrument(skip(self, factory, shutdown), fields(stream = %self.config.stream_name))]
    async fn process_shard(
        &self,
        shard_id: &str,
        factory: &ProcessorFactory,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let checkpoint = self
            .store
            .get_checkpoint(shard_id)
            .await
            .map_err(|e| CheckpointError::RetrieveFailed(format!("{:#}", e)))?;

        if checkpoint.as_deref() == Some(SHARD_END) {
            info!(shard_id = %shard_id, "Shard already fully processed, skipping");
            return Ok(());
        }
        if shutdown.is_cancelled() {
            return Ok(());
        }

        let monitor = factory.monitor();
        let processor = factory.create_processor();
        processor.initialize(shard_id).await?;

        let iterator = match self.get_iterator(shard_id, checkpoint.as_deref(), shutdown).await {
            Ok(iterator) => iterator,
            Err(RetryError::Interrupted) => {
                self.shutdown_processor(&processor, shard_id, checkpoint, ShutdownReason::Requested)
                    .await;
                return Ok(());
            }
            Err(e) => {
                monitor.emit(ConsumerEvent::iterator(
                    shard_id,
                    IteratorEventType::Failed,
                    Some(e.to_string()),
                ));
                self.shutdown_processor(&processor, shard_id, checkpoint, ShutdownReason::Requested)
                    .await;
                return Err(ConsumerError::GetIteratorFailed(e.to_string()));
            }
        };
        monitor.emit(ConsumerEvent::iterator(shard_id, IteratorEventType::Initial, None));
        info!(shard_id = %shard_id, resume_after = ?checkpoint, "Reading shard");

        let mut last_sequence = checkpoint;
        let exit = self
            .read_loop(shard_id, &processor, monitor, iterator, &mut last_sequence, shutdown)
            .await;

        match exit {
            Ok(ShardExit::End) => {
                info!(shard_id = %shard_id, "Reached end of shard");
                processor
                    .shutdown(
                        Arc::new(StoreCheckpointer::shard_end(self.store.clone(), shard_id)),
                        ShutdownReason::Terminate,
                    )
                    .await
            }
            Ok(ShardExit::Cancelled) => {
                self.shutdown_processor(&processor, shard_id, last_sequence, ShutdownReason::Requested)
                    .await;
                Ok(())
            }
            Err(e) => {
                if !processor.is_failed() {
                    monitor.emit(ConsumerEvent::shard_error(shard_id, e.to_string()));
                }
                self.shutdown_processor(&processor, shard_id, last_sequence, ShutdownReason::Requested)
                    .await;
                Err(e)
            }
        }
    }

    async fn read_loop(
        &self,
        shard_id: &str,
        processor: &AckGatedProcessor,
        monitor: &Monitor,
        mut iterator: String,
        last_sequence: &mut Option<String>,
        shutdown: &CancellationToken,
    ) -> Result<ShardExit> {
        loop {
            if shutdown.is_cancelled() {
                return Ok(ShardExit::Cancelled);
            }
            if processor.is_failed() {
                return Err(ConsumerError::ShardFailed(shard_id.to_string()));
            }

            let (records, next) = match self.fetch(&iterator, shutdown).await {
                Ok(Fetch::Page(records, next)) => (records, next),
                Ok(Fetch::Expired) => {
                    warn!(shard_id = %shard_id, after = ?last_sequence, "Iterator expired, renewing");
                    monitor.emit(ConsumerEvent::iterator(shard_id, IteratorEventType::Expired, None));
                    iterator = match self.get_iterator(shard_id, last_sequence.as_deref(), shutdown).await {
                        Ok(iterator) => iterator,
                        Err(RetryError::Interrupted) => return Ok(ShardExit::Cancelled),
                        Err(e) => {
                            monitor.emit(ConsumerEvent::iterator(
                                shard_id,
                                IteratorEventType::Failed,
                                Some(e.to_string()),
                            ));
                            return Err(ConsumerError::IteratorExpired(shard_id.to_string()));
                        }
                    };
                    monitor.emit(ConsumerEvent::iterator(shard_id, IteratorEventType::Renewed, None));
                    continue;
                }
                Err(RetryError::Interrupted) => return Ok(ShardExit::Cancelled),
                Err(e) => return Err(ConsumerError::GetRecordsFailed(e.to_string())),
            };

            let got_records = !records.is_empty();
            if got_records {
                let batch = Batch::new(shard_id, records.into_iter().map(convert_record).collect());
                let sequence = batch.last_sequence_number().map(String::from);
                let checkpointer = StoreCheckpointer::new(self.store.clone(), shard_id, sequence.clone());

                match processor.process_records(batch, Arc::new(checkpointer)).await {
                    Ok(()) => {}
                    Err(e) if e.is_shutdown() => return Ok(ShardExit::Cancelled),
                    Err(e) => return Err(e),
                }
                *last_sequence = sequence;
            }

            match next {
                Some(next) => iterator = next,
                None => return Ok(ShardExit::End),
            }

            if !got_records {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => return Ok(ShardExit::Cancelled),
                    _ = tokio::time::sleep(self.config.idle_time_between_reads) => {}
                }
            }
        }
    }

    fn checkpointer(&self, shard_id: &str, position: Option<String>) -> Arc<StoreCheckpointer<S>> {
        Arc::new(StoreCheckpointer::new(self.store.clone(), shard_id, position))
    }

    /// Shuts a processor down for a reason that never checkpoints
    async fn shutdown_processor(
        &self,
        processor: &AckGatedProcessor,
        shard_id: &str,
        position: Option<String>,
        reason: ShutdownReason,
    ) {
        if let Err(e) = processor
            .shutdown(self.checkpointer(shard_id, position), reason)
            .await
        {
            warn!(shard_id = %shard_id, error = %e, "Processor shutdown failed");
        }
    }
}

#[async_trait]
impl<C, S> ShardReader for KinesisShardReader<C, S>
where
    C: KinesisClientTrait,
    S: CheckpointStore + 'static,
{
    fn stream_name(&self) -> Option<&str> {
        Some(&self.config.stream_name)
    }

    async fn run(&self, factory: ProcessorFactory, shutdown: CancellationToken) -> Result<()> {
        self.config.validate()?;

        let shards = match RetryHandle::from_config(self.config.retry.clone())
            .retry(|| self.client.list_shards(&self.config.stream_name), &shutdown)
            .await
        {
            Ok(shards) => shards,
            Err(RetryError::Interrupted) => return Ok(()),
            Err(e) => return Err(ConsumerError::ListShardsFailed(e.to_string())),
        };
        info!(stream = %self.config.stream_name, shards = shards.len(), "Listed shards");

        let semaphore = self
            .config
            .max_concurrent_shards
            .map(|limit| Arc::new(Semaphore::new(limit as usize)));

        let mut handles = Vec::with_capacity(shards.len());
        for shard in shards {
            let shard_id = shard.shard_id().to_string();
            let reader = self.clone();
            let factory = factory.clone();
            let shutdown = shutdown.clone();
            let semaphore = semaphore.clone();
            let task_shard_id = shard_id.clone();

            let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
                let _permit = match semaphore {
                    Some(semaphore) => tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => return Ok(()),
                        permit = semaphore.acquire_owned() => Some(permit?),
                    },
                    None => None,
                };
                reader.process_shard(&task_shard_id, &factory, &shutdown).await
            });
            handles.push((shard_id, handle));
        }

        for (shard_id, handle) in handles {
            let error = match handle.await {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e,
                Err(join_err) => join_err.into(),
            };
            error!(shard_id = %shard_id, error = %error, "Shard stopped with error");
            // Processors report their own failures
            if !matches!(error, ConsumerError::ShardFailed(_) | ConsumerError::CheckpointFailed { .. }) {
                factory.report(ShardError { shard_id, error });
            }
        }

        info!(stream = %self.config.stream_name, "Shard reader finished");
        Ok(())
    }
}
