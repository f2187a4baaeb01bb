//! Monitoring for the ack protocol
//!
//! Processors and readers push [`ConsumerEvent`]s into a bounded channel; the
//! [`MetricsAggregator`] folds them into per-shard metrics.

mod metrics;
mod types;

pub use metrics::{MetricsAggregator, ShardMetrics};
pub use types::{
    ConsumerEvent, ConsumerEventType, IteratorEventType, MonitoringConfig, WaitEndReason,
};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{trace, warn};

/// Cloneable sending side of the monitoring channel
///
/// A disabled monitor drops every event.
#[derive(Debug, Clone, Default)]
pub struct Monitor {
    tx: Option<mpsc::Sender<ConsumerEvent>>,
}

impl Monitor {
    /// Creates the monitor and, when enabled, its receiver
    pub fn new(config: &MonitoringConfig) -> (Self, Option<mpsc::Receiver<ConsumerEvent>>) {
        if config.enabled {
            let (tx, rx) = mpsc::channel(config.channel_size.max(1));
            (Self { tx: Some(tx) }, Some(rx))
        } else {
            (Self::disabled(), None)
        }
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Sends without waiting; a full channel drops the event
    pub fn emit(&self, event: ConsumerEvent) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => trace!("Sent monitoring event"),
            Err(TrySendError::Full(event)) => {
                warn!(shard_id = %event.shard_id, "Monitoring channel full, dropping event");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}
