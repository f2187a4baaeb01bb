// tests/common/mod.rs
#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use aws_sdk_kinesis::types::{Record, Shard, ShardIteratorType};
use chrono::{DateTime, Utc};
use kinesis_ack_consumer::{
    Consumer, ConsumerConfig, InMemoryCheckpointStore, KinesisClientTrait, KinesisReaderConfig,
    KinesisShardReader, ProcessorConfig, RetryConfig,
};
use std::sync::{Arc, Once};
use std::time::Duration;

static INIT: Once = Once::new();

pub fn init_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("kinesis_ack_consumer=debug".parse().expect("directive")),
            )
            .with_test_writer()
            .init();
    });
}

pub fn sequence(shard_id: &str, page: usize, index: usize) -> String {
    format!("{}-{}-{}", shard_id, page, index)
}

#[derive(Debug, Clone)]
pub struct ScriptedShard {
    pub id: String,
    pub pages: Vec<Vec<Record>>,
    /// Closed shards end after their last page; open ones poll empty forever
    pub closed: bool,
}

impl ScriptedShard {
    pub fn new(id: &str, page_sizes: &[usize], closed: bool) -> Self {
        let pages = page_sizes
            .iter()
            .enumerate()
            .map(|(page, size)| {
                (0..*size)
                    .map(|i| {
                        Record::builder()
                            .sequence_number(sequence(id, page, i))
                            .partition_key("pk")
                            .data(aws_smithy_types::Blob::new(format!("{}:{}", page, i)))
                            .build()
                            .expect("record")
                    })
                    .collect()
            })
            .collect();
        Self {
            id: id.to_string(),
            pages,
            closed,
        }
    }
}

/// Stateless Kinesis stand-in: iterators encode `shard/page`, so every run
/// of a reader sees the same data from the same start position.
#[derive(Debug, Clone, Default)]
pub struct ScriptedKinesis {
    shards: Arc<Vec<ScriptedShard>>,
}

impl ScriptedKinesis {
    pub fn new(shards: Vec<ScriptedShard>) -> Self {
        Self {
            shards: Arc::new(shards),
        }
    }

    fn shard(&self, shard_id: &str) -> Result<&ScriptedShard> {
        self.shards
            .iter()
            .find(|s| s.id == shard_id)
            .ok_or_else(|| anyhow::anyhow!("unknown shard {}", shard_id))
    }
}

#[async_trait]
impl KinesisClientTrait for ScriptedKinesis {
    async fn list_shards(&self, _stream_name: &str) -> Result<Vec<Shard>> {
        Ok(self
            .shards
            .iter()
            .map(|s| Shard::builder().shard_id(&s.id).build().expect("shard"))
            .collect())
    }

    async fn get_shard_iterator(
        &self,
        _stream_name: &str,
        shard_id: &str,
        iterator_type: ShardIteratorType,
        sequence_number: Option<&str>,
        _timestamp: Option<&DateTime<Utc>>,
    ) -> Result<String> {
        let shard = self.shard(shard_id)?;
        let page = match (iterator_type, sequence_number) {
            (ShardIteratorType::AfterSequenceNumber, Some(seq)) => shard
                .pages
                .iter()
                .position(|page| page.iter().any(|r| r.sequence_number() == seq))
                .map_or(0, |p| p + 1),
            (ShardIteratorType::Latest, _) => shard.pages.len(),
            _ => 0,
        };
        Ok(format!("{}/{}", shard_id, page))
    }

    async fn get_records(&self, iterator: &str, _limit: i32) -> Result<(Vec<Record>, Option<String>)> {
        let (shard_id, page) = iterator
            .split_once('/')
            .ok_or_else(|| anyhow::anyhow!("bad iterator {}", iterator))?;
        let page: usize = page.parse()?;
        let shard = self.shard(shard_id)?;

        match shard.pages.get(page) {
            Some(records) => Ok((records.clone(), Some(format!("{}/{}", shard_id, page + 1)))),
            None if shard.closed => Ok((vec![], None)),
            None => Ok((vec![], Some(iterator.to_string()))),
        }
    }
}

pub type TestReader = KinesisShardReader<ScriptedKinesis, InMemoryCheckpointStore>;

pub fn reader(client: ScriptedKinesis, store: InMemoryCheckpointStore) -> TestReader {
    KinesisShardReader::new(
        KinesisReaderConfig {
            stream_name: "test-stream".to_string(),
            idle_time_between_reads: Duration::from_millis(10),
            retry: RetryConfig {
                max_retries: Some(2),
                initial_backoff: Duration::from_millis(5),
                max_backoff: Duration::from_millis(20),
                jitter_factor: 0.0,
            },
            ..Default::default()
        },
        client,
        store,
    )
}

pub fn consumer_config(processor: ProcessorConfig) -> ConsumerConfig {
    ConsumerConfig {
        application_name: "test-app".to_string(),
        stream_name: "test-stream".to_string(),
        processor,
        ..Default::default()
    }
}

pub fn consumer(
    shards: Vec<ScriptedShard>,
    store: &InMemoryCheckpointStore,
    processor: ProcessorConfig,
) -> Result<Consumer<TestReader>> {
    Ok(Consumer::new(
        consumer_config(processor),
        reader(ScriptedKinesis::new(shards), store.clone()),
    )?)
}

pub async fn wait_for_checkpoint(
    store: &InMemoryCheckpointStore,
    shard_id: &str,
    expected: &str,
) -> Result<()> {
    use kinesis_ack_consumer::CheckpointStore;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let current = store.get_checkpoint(shard_id).await?;
        if current.as_deref() == Some(expected) {
            return Ok(());
        }
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("checkpoint for {} is {:?}, expected {}", shard_id, current, expected);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
