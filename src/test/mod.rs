//! Test utilities and mock implementations

pub mod mocks;

use crate::event::{Batch, Record};
use aws_sdk_kinesis::types::{Record as KinesisRecord, Shard};

/// Helper functions for creating test data
pub struct TestUtils;

impl TestUtils {
    /// Create a Kinesis record with given sequence number and data
    pub fn create_test_record(sequence_number: &str, data: &[u8]) -> KinesisRecord {
        KinesisRecord::builder()
            .sequence_number(sequence_number)
            .data(aws_smithy_types::Blob::new(data.to_vec()))
            .partition_key("test-partition-key")
            .build()
            .expect("Failed to build test record")
    }

    /// Create a test shard with given ID
    pub fn create_test_shard(shard_id: &str) -> Shard {
        Shard::builder()
            .shard_id(shard_id)
            .build()
            .expect("Failed to build test shard")
    }

    /// Create Kinesis records `sequence-{start}..sequence-{start + count}`
    pub fn create_test_records(start: usize, count: usize) -> Vec<KinesisRecord> {
        (start..start + count)
            .map(|i| {
                Self::create_test_record(&format!("sequence-{}", i), format!("data-{}", i).as_bytes())
            })
            .collect()
    }

    /// Create a batch of `count` records for `shard_id`
    pub fn create_test_batch(shard_id: &str, count: usize) -> Batch {
        let records = (0..count)
            .map(|i| {
                Record::new(
                    format!("{}-sequence-{}", shard_id, i),
                    "test-partition-key",
                    format!("data-{}", i).into_bytes(),
                )
            })
            .collect();
        Batch::new(shard_id, records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_test_records() {
        let records = TestUtils::create_test_records(5, 3);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].sequence_number(), "sequence-5");
        assert_eq!(records[2].sequence_number(), "sequence-7");
        assert_eq!(records[0].data().as_ref(), b"data-5");
        assert_eq!(records[0].partition_key.as_deref(), Some("test-partition-key"));
    }

    #[test]
    fn test_create_test_batch() {
        let batch = TestUtils::create_test_batch("shard-1", 2);
        assert_eq!(batch.shard_id, "shard-1");
        assert_eq!(batch.last_sequence_number(), Some("shard-1-sequence-1"));
    }
}
