//! Records, batches and the two event kinds exchanged over the bus

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier pairing a published batch with its acknowledgment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Generates a fresh random identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl From<Uuid> for EventId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// A single opaque record as delivered by the shard reader
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub sequence_number: String,
    pub partition_key: String,
    pub data: Bytes,
    pub approximate_arrival: Option<DateTime<Utc>>,
}

impl Record {
    pub fn new(
        sequence_number: impl Into<String>,
        partition_key: impl Into<String>,
        data: impl Into<Bytes>,
    ) -> Self {
        Self {
            sequence_number: sequence_number.into(),
            partition_key: partition_key.into(),
            data: data.into(),
            approximate_arrival: None,
        }
    }
}

/// Records delivered together for one shard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    pub shard_id: String,
    pub records: Vec<Record>,
}

impl Batch {
    pub fn new(shard_id: impl Into<String>, records: Vec<Record>) -> Self {
        Self {
            shard_id: shard_id.into(),
            records,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Sequence number of the last record, the position a checkpoint would store
    pub fn last_sequence_number(&self) -> Option<&str> {
        self.records.last().map(|r| r.sequence_number.as_str())
    }
}

/// Wire tag carried by every bus event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    NewRecords,
    Ack,
}

/// Published once per delivered batch, consumed by the downstream processor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRecordsEvent {
    pub id: EventId,
    pub action: Action,
    pub data: Batch,
}

impl NewRecordsEvent {
    pub fn new(data: Batch) -> Self {
        Self {
            id: EventId::new(),
            action: Action::NewRecords,
            data,
        }
    }

    /// The ack that retires this event
    pub fn ack(&self) -> AckEvent {
        AckEvent::new(self.id)
    }
}

/// Emitted by the downstream processor once a batch is durably processed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckEvent {
    pub id: EventId,
    pub action: Action,
}

impl AckEvent {
    pub fn new(id: EventId) -> Self {
        Self {
            id,
            action: Action::Ack,
        }
    }
}
