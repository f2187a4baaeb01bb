use crate::event::EventId;
use crate::processor::ShutdownReason;
use std::time::{Duration, SystemTime};

/// Configuration for the monitoring system
#[derive(Debug, Clone)]
pub struct MonitoringConfig {
    /// Whether monitoring is enabled
    pub enabled: bool,
    /// Size of the monitoring channel buffer
    pub channel_size: usize,
    /// How often the aggregator logs per-shard metrics
    pub metrics_interval: Duration,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            channel_size: 1000,
            metrics_interval: Duration::from_secs(60),
        }
    }
}

/// A monitoring event emitted by processors and readers
#[derive(Debug, Clone)]
pub struct ConsumerEvent {
    /// When the event occurred
    pub timestamp: SystemTime,
    /// ID of the shard this event relates to
    pub shard_id: String,
    /// The type of event and its details
    pub event_type: ConsumerEventType,
}

#[derive(Debug, Clone)]
pub enum ConsumerEventType {
    ShardInitialized,
    BatchPublished {
        event_id: EventId,
        record_count: usize,
    },
    AckReceived {
        event_id: EventId,
        waited: Duration,
    },
    AckWaitEnded {
        event_id: EventId,
        reason: WaitEndReason,
    },
    Checkpoint {
        /// `None` for the final checkpoint taken at shutdown
        event_id: Option<EventId>,
        success: bool,
        error: Option<String>,
    },
    ShardShutdown {
        reason: ShutdownReason,
    },
    ShardError {
        details: String,
    },
    Iterator {
        event_type: IteratorEventType,
        error: Option<String>,
    },
}

/// Why a per-batch wait ended without a checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitEndReason {
    Cancelled,
    TimedOut,
    /// Acked, but an earlier batch of the shard never checkpointed
    Abandoned,
}

/// Types of iterator events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IteratorEventType {
    Initial,
    Expired,
    Renewed,
    Failed,
}

impl ConsumerEvent {
    fn now(shard_id: impl Into<String>, event_type: ConsumerEventType) -> Self {
        Self {
            timestamp: SystemTime::now(),
            shard_id: shard_id.into(),
            event_type,
        }
    }

    pub fn shard_initialized(shard_id: impl Into<String>) -> Self {
        Self::now(shard_id, ConsumerEventType::ShardInitialized)
    }

    pub fn batch_published(shard_id: impl Into<String>, event_id: EventId, record_count: usize) -> Self {
        Self::now(
            shard_id,
            ConsumerEventType::BatchPublished {
                event_id,
                record_count,
            },
        )
    }

    pub fn ack_received(shard_id: impl Into<String>, event_id: EventId, waited: Duration) -> Self {
        Self::now(shard_id, ConsumerEventType::AckReceived { event_id, waited })
    }

    pub fn ack_wait_ended(shard_id: impl Into<String>, event_id: EventId, reason: WaitEndReason) -> Self {
        Self::now(shard_id, ConsumerEventType::AckWaitEnded { event_id, reason })
    }

    pub fn checkpoint(
        shard_id: impl Into<String>,
        event_id: Option<EventId>,
        success: bool,
        error: Option<String>,
    ) -> Self {
        Self::now(
            shard_id,
            ConsumerEventType::Checkpoint {
                event_id,
                success,
                error,
            },
        )
    }

    pub fn shard_shutdown(shard_id: impl Into<String>, reason: ShutdownReason) -> Self {
        Self::now(shard_id, ConsumerEventType::ShardShutdown { reason })
    }

    pub fn shard_error(shard_id: impl Into<String>, details: impl Into<String>) -> Self {
        Self::now(
            shard_id,
            ConsumerEventType::ShardError {
                details: details.into(),
            },
        )
    }

    pub fn iterator(
        shard_id: impl Into<String>,
        event_type: IteratorEventType,
        error: Option<String>,
    ) -> Self {
        Self::now(shard_id, ConsumerEventType::Iterator { event_type, error })
    }
}
