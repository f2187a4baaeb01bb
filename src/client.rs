//! The subset of the Kinesis API the shard reader uses

use anyhow::Result;
use async_trait::async_trait;
use aws_sdk_kinesis::{
    types::{Record, Shard, ShardIteratorType},
    Client,
};
use chrono::{DateTime, Utc};
use std::time::SystemTime;
use thiserror::Error;

/// Kinesis failures the shard reader reacts to specifically
#[derive(Debug, Error)]
pub enum KinesisClientError {
    #[error("Shard iterator expired")]
    ExpiredIterator,

    #[error("Provisioned throughput exceeded")]
    ThroughputExceeded,

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),
}

impl KinesisClientError {
    /// Whether `err` carries an expired-iterator failure
    pub fn is_expired_iterator(err: &anyhow::Error) -> bool {
        matches!(
            err.downcast_ref::<KinesisClientError>(),
            Some(KinesisClientError::ExpiredIterator)
        )
    }
}

#[async_trait]
pub trait KinesisClientTrait: Send + Sync + 'static {
    async fn list_shards(&self, stream_name: &str) -> Result<Vec<Shard>>;

    async fn get_shard_iterator(
        &self,
        stream_name: &str,
        shard_id: &str,
        iterator_type: ShardIteratorType,
        sequence_number: Option<&str>,
        timestamp: Option<&DateTime<Utc>>,
    ) -> Result<String>;

    /// One page of records and the next iterator, `None` once a closed shard is exhausted
    async fn get_records(&self, iterator: &str, limit: i32) -> Result<(Vec<Record>, Option<String>)>;
}

#[async_trait]
impl KinesisClientTrait for Client {
    async fn list_shards(&self, stream_name: &str) -> Result<Vec<Shard>> {
        let mut shards = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            // The stream name must be omitted when paging with a token
            let request = match &next_token {
                Some(token) => self.list_shards().next_token(token),
                None => self.list_shards().stream_name(stream_name),
            };

            let response = request.send().await.map_err(|e| {
                let service = e.into_service_error();
                if service.is_resource_not_found_exception() {
                    anyhow::Error::new(KinesisClientError::ResourceNotFound(stream_name.to_string()))
                } else {
                    anyhow::Error::new(service)
                }
            })?;

            shards.extend(response.shards.unwrap_or_default());
            match response.next_token {
                Some(token) => next_token = Some(token),
                None => return Ok(shards),
            }
        }
    }

    async fn get_shard_iterator(
        &self,
        stream_name: &str,
        shard_id: &str,
        iterator_type: ShardIteratorType,
        sequence_number: Option<&str>,
        timestamp: Option<&DateTime<Utc>>,
    ) -> Result<String> {
        let mut req = self
            .get_shard_iterator()
            .stream_name(stream_name)
            .shard_id(shard_id)
            .shard_iterator_type(iterator_type);

        if let Some(seq) = sequence_number {
            req = req.starting_sequence_number(seq);
        }

        if let Some(ts) = timestamp {
            let system_time: SystemTime = (*ts).into();
            req = req.timestamp(aws_smithy_types::DateTime::from(system_time));
        }

        let response = req.send().await?;
        response
            .shard_iterator
            .ok_or_else(|| anyhow::anyhow!("No shard iterator returned for {}", shard_id))
    }

    async fn get_records(&self, iterator: &str, limit: i32) -> Result<(Vec<Record>, Option<String>)> {
        let response = self
            .get_records()
            .shard_iterator(iterator)
            .limit(limit)
            .send()
            .await
            .map_err(|e| {
                let service = e.into_service_error();
                if service.is_expired_iterator_exception() {
                    anyhow::Error::new(KinesisClientError::ExpiredIterator)
                } else if service.is_provisioned_throughput_exceeded_exception() {
                    anyhow::Error::new(KinesisClientError::ThroughputExceeded)
                } else {
                    anyhow::Error::new(service)
                }
            })?;

        Ok((
            response.records().to_vec(),
            response.next_shard_iterator().map(String::from),
        ))
    }
}
