use crate::client::{KinesisClientError, KinesisClientTrait};
use crate::error::{ConsumerError, Result as ConsumerResult};
use crate::factory::ProcessorFactory;
use crate::processor::{Checkpointer, RecordProcessor, ShutdownReason};
use crate::store::{CheckpointStore, InMemoryCheckpointStore};
use crate::test::TestUtils;
use crate::worker::ShardReader;
use anyhow::Result;
use async_trait::async_trait;
use aws_sdk_kinesis::types::{Record, Shard, ShardIteratorType};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

async fn wait_until<F>(mut check: F, timeout: Duration, what: &str) -> Result<()>
where
    F: FnMut() -> bool,
{
    let start = std::time::Instant::now();
    while !check() {
        if start.elapsed() > timeout {
            anyhow::bail!("Timeout waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    Ok(())
}

/// Checkpointer that counts calls and can be told to fail
#[derive(Debug, Clone)]
pub struct MockCheckpointer {
    name: String,
    attempts: Arc<AtomicUsize>,
    successes: Arc<AtomicUsize>,
    fail: Arc<AtomicBool>,
    log: Arc<Mutex<Vec<String>>>,
}

impl Default for MockCheckpointer {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCheckpointer {
    pub fn new() -> Self {
        Self::with_log("checkpointer", Self::shared_log())
    }

    pub fn failing() -> Self {
        let checkpointer = Self::new();
        checkpointer.set_fail(true);
        checkpointer
    }

    /// A log several checkpointers append their names to, in call order
    pub fn shared_log() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    pub fn with_log(name: &str, log: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            name: name.to_string(),
            attempts: Arc::new(AtomicUsize::new(0)),
            successes: Arc::new(AtomicUsize::new(0)),
            fail: Arc::new(AtomicBool::new(false)),
            log,
        }
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn handle(&self) -> Arc<dyn Checkpointer> {
        Arc::new(self.clone())
    }

    /// Successful checkpoints so far
    pub fn count(&self) -> usize {
        self.successes.load(Ordering::SeqCst)
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub async fn wait_for(&self, count: usize, timeout: Duration) -> Result<()> {
        wait_until(|| self.count() >= count, timeout, "checkpoints").await
    }
}

#[async_trait]
impl Checkpointer for MockCheckpointer {
    async fn checkpoint(&self) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("simulated checkpoint failure");
        }
        self.log.lock().push(self.name.clone());
        self.successes.fetch_add(1, Ordering::SeqCst);
        debug!(checkpointer = %self.name, "Mock checkpoint");
        Ok(())
    }
}

/// What a [`MockShardReader`] does when run
#[derive(Debug, Clone)]
pub enum ReaderBehavior {
    /// Idle until cancelled
    WaitForShutdown,
    /// Never return, even when cancelled
    IgnoreShutdown,
    /// Return an error immediately
    Fail(String),
    /// Deliver batches of the given sizes per shard, then idle until cancelled
    Deliver(Vec<(String, Vec<usize>)>),
}

impl ReaderBehavior {
    pub fn deliver(shard_id: &str, batch_sizes: Vec<usize>) -> Self {
        ReaderBehavior::Deliver(vec![(shard_id.to_string(), batch_sizes)])
    }
}

/// Scripted shard reader for worker and consumer tests
#[derive(Debug, Clone)]
pub struct MockShardReader {
    behavior: ReaderBehavior,
    runs: Arc<AtomicUsize>,
    checkpointer: MockCheckpointer,
    shutdown_reasons: Arc<Mutex<Vec<ShutdownReason>>>,
}

impl MockShardReader {
    pub fn new(behavior: ReaderBehavior) -> Self {
        Self {
            behavior,
            runs: Arc::new(AtomicUsize::new(0)),
            checkpointer: MockCheckpointer::new(),
            shutdown_reasons: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// The checkpointer handed out with every batch and shutdown
    pub fn checkpointer(&self) -> MockCheckpointer {
        self.checkpointer.clone()
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn shutdown_reasons(&self) -> Vec<ShutdownReason> {
        self.shutdown_reasons.lock().clone()
    }

    pub async fn wait_for_runs(&self, runs: usize, timeout: Duration) -> Result<()> {
        wait_until(|| self.runs() >= runs, timeout, "reader runs").await
    }
}

#[async_trait]
impl ShardReader for MockShardReader {
    async fn run(&self, factory: ProcessorFactory, shutdown: CancellationToken) -> ConsumerResult<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);

        match &self.behavior {
            ReaderBehavior::WaitForShutdown => {
                shutdown.cancelled().await;
                Ok(())
            }
            ReaderBehavior::IgnoreShutdown => std::future::pending::<ConsumerResult<()>>().await,
            ReaderBehavior::Fail(message) => Err(ConsumerError::ListShardsFailed(message.clone())),
            ReaderBehavior::Deliver(shards) => {
                let mut processors = Vec::new();
                for (shard_id, batch_sizes) in shards {
                    let processor = factory.create_processor();
                    processor.initialize(shard_id).await?;
                    for size in batch_sizes {
                        processor
                            .process_records(
                                TestUtils::create_test_batch(shard_id, *size),
                                self.checkpointer.handle(),
                            )
                            .await?;
                    }
                    processors.push(processor);
                }

                shutdown.cancelled().await;
                for processor in processors {
                    processor
                        .shutdown(self.checkpointer.handle(), ShutdownReason::Requested)
                        .await?;
                    self.shutdown_reasons.lock().push(ShutdownReason::Requested);
                }
                Ok(())
            }
        }
    }
}

/// Mock Kinesis client with per-shard iterators and per-iterator responses
///
/// An iterator with no queued responses returns an empty batch and itself as
/// the next iterator, like an open shard with no new data.
#[derive(Debug, Default, Clone)]
pub struct MockKinesisClient {
    shards: Arc<Mutex<Vec<Shard>>>,
    list_shards_errors: Arc<Mutex<VecDeque<KinesisClientError>>>,
    iterators: Arc<Mutex<HashMap<String, String>>>,
    #[allow(clippy::type_complexity)]
    records: Arc<Mutex<HashMap<String, VecDeque<std::result::Result<(Vec<Record>, Option<String>), KinesisClientError>>>>>,
    #[allow(clippy::type_complexity)]
    iterator_requests: Arc<Mutex<Vec<(String, ShardIteratorType, Option<String>)>>>,
}

impl MockKinesisClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mock_shards(&self, shard_ids: &[&str]) {
        *self.shards.lock() = shard_ids
            .iter()
            .map(|id| TestUtils::create_test_shard(id))
            .collect();
    }

    /// Queues an error for the next `list_shards` call
    pub fn mock_list_shards_error(&self, error: KinesisClientError) {
        self.list_shards_errors.lock().push_back(error);
    }

    /// Iterator handed out for `shard_id`; defaults to `"{shard_id}-iterator"`
    pub fn mock_iterator(&self, shard_id: &str, iterator: &str) {
        self.iterators
            .lock()
            .insert(shard_id.to_string(), iterator.to_string());
    }

    pub fn mock_get_records(
        &self,
        iterator: &str,
        response: std::result::Result<(Vec<Record>, Option<String>), KinesisClientError>,
    ) {
        self.records
            .lock()
            .entry(iterator.to_string())
            .or_default()
            .push_back(response);
    }

    /// `(shard_id, iterator type, starting sequence)` of every iterator request
    pub fn iterator_requests(&self) -> Vec<(String, ShardIteratorType, Option<String>)> {
        self.iterator_requests.lock().clone()
    }
}

#[async_trait]
impl KinesisClientTrait for MockKinesisClient {
    async fn list_shards(&self, _stream_name: &str) -> Result<Vec<Shard>> {
        if let Some(error) = self.list_shards_errors.lock().pop_front() {
            return Err(error.into());
        }
        Ok(self.shards.lock().clone())
    }

    async fn get_shard_iterator(
        &self,
        _stream_name: &str,
        shard_id: &str,
        iterator_type: ShardIteratorType,
        sequence_number: Option<&str>,
        _timestamp: Option<&DateTime<Utc>>,
    ) -> Result<String> {
        self.iterator_requests.lock().push((
            shard_id.to_string(),
            iterator_type,
            sequence_number.map(String::from),
        ));
        Ok(self
            .iterators
            .lock()
            .get(shard_id)
            .cloned()
            .unwrap_or_else(|| format!("{}-iterator", shard_id)))
    }

    async fn get_records(&self, iterator: &str, _limit: i32) -> Result<(Vec<Record>, Option<String>)> {
        let next = self
            .records
            .lock()
            .get_mut(iterator)
            .and_then(|queue| queue.pop_front());

        match next {
            Some(Ok(response)) => Ok(response),
            Some(Err(e)) => Err(e.into()),
            None => Ok((vec![], Some(iterator.to_string()))),
        }
    }
}

/// Checkpoint store that can be told to fail saves
#[derive(Debug, Default, Clone)]
pub struct MockCheckpointStore {
    inner: InMemoryCheckpointStore,
    fail_saves: Arc<AtomicBool>,
    save_count: Arc<AtomicUsize>,
}

impl MockCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    pub fn save_count(&self) -> usize {
        self.save_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CheckpointStore for MockCheckpointStore {
    async fn get_checkpoint(&self, shard_id: &str) -> Result<Option<String>> {
        self.inner.get_checkpoint(shard_id).await
    }

    async fn save_checkpoint(&self, shard_id: &str, sequence_number: &str) -> Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            anyhow::bail!("simulated store failure");
        }
        self.save_count.fetch_add(1, Ordering::SeqCst);
        self.inner.save_checkpoint(shard_id, sequence_number).await
    }
}
