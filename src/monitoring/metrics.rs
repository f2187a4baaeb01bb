use super::types::{ConsumerEvent, ConsumerEventType, IteratorEventType, MonitoringConfig, WaitEndReason};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Aggregated metrics for a single shard
#[derive(Debug, Clone)]
pub struct ShardMetrics {
    pub batches_published: u64,
    pub records_published: u64,
    pub acks_received: u64,
    pub checkpoints_succeeded: u64,
    pub checkpoints_failed: u64,
    pub waits_cancelled: u64,
    pub waits_timed_out: u64,
    pub waits_abandoned: u64,
    pub iterator_renewals: u64,
    pub iterator_failures: u64,
    pub shard_errors: u64,

    // Batches published but not yet checkpointed or given up on. Nothing
    // bounds this; a slow downstream shows up here first.
    pub in_flight: u64,
    pub max_in_flight: u64,

    pub total_ack_wait: Duration,
    pub avg_ack_wait: Duration,
    pub max_ack_wait: Duration,

    pub last_updated: Instant,
}

impl Default for ShardMetrics {
    fn default() -> Self {
        Self {
            batches_published: 0,
            records_published: 0,
            acks_received: 0,
            checkpoints_succeeded: 0,
            checkpoints_failed: 0,
            waits_cancelled: 0,
            waits_timed_out: 0,
            waits_abandoned: 0,
            iterator_renewals: 0,
            iterator_failures: 0,
            shard_errors: 0,
            in_flight: 0,
            max_in_flight: 0,
            total_ack_wait: Duration::default(),
            avg_ack_wait: Duration::default(),
            max_ack_wait: Duration::default(),
            last_updated: Instant::now(),
        }
    }
}

impl ShardMetrics {
    fn batch_retired(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }
}

/// Folds monitoring events into per-shard metrics and logs them periodically
pub struct MetricsAggregator {
    metrics: Arc<RwLock<HashMap<String, ShardMetrics>>>,
    window_duration: Duration,
    monitoring_rx: mpsc::Receiver<ConsumerEvent>,
}

impl MetricsAggregator {
    pub fn new(window_duration: Duration, monitoring_rx: mpsc::Receiver<ConsumerEvent>) -> Self {
        Self {
            metrics: Arc::new(RwLock::new(HashMap::new())),
            window_duration,
            monitoring_rx,
        }
    }

    /// Aggregator logging every `config.metrics_interval`
    pub fn from_config(config: &MonitoringConfig, monitoring_rx: mpsc::Receiver<ConsumerEvent>) -> Self {
        Self::new(config.metrics_interval, monitoring_rx)
    }

    pub fn window_duration(&self) -> Duration {
        self.window_duration
    }

    /// Shared view of the metrics, usable while [`run`](Self::run) owns the aggregator
    pub fn metrics_handle(&self) -> Arc<RwLock<HashMap<String, ShardMetrics>>> {
        self.metrics.clone()
    }

    /// Processes events until the channel closes or `shutdown` is cancelled
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut ticker = interval(self.window_duration);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = self.monitoring_rx.recv() => match event {
                    Some(event) => self.process_event(event).await,
                    None => break,
                },
                _ = ticker.tick() => self.emit_metrics().await,
            }
        }

        self.emit_metrics().await;
        debug!("Metrics aggregator stopped");
    }

    pub async fn process_event(&self, event: ConsumerEvent) {
        let mut metrics = self.metrics.write().await;
        let shard = metrics.entry(event.shard_id.clone()).or_default();

        match event.event_type {
            ConsumerEventType::ShardInitialized => {
                debug!(shard_id = %event.shard_id, "Shard initialized");
            }
            ConsumerEventType::BatchPublished { record_count, .. } => {
                shard.batches_published += 1;
                shard.records_published += record_count as u64;
                shard.in_flight += 1;
                shard.max_in_flight = shard.max_in_flight.max(shard.in_flight);
            }
            ConsumerEventType::AckReceived { waited, .. } => {
                shard.acks_received += 1;
                shard.total_ack_wait += waited;
                shard.avg_ack_wait = shard.total_ack_wait.div_f64(shard.acks_received as f64);
                shard.max_ack_wait = shard.max_ack_wait.max(waited);
            }
            ConsumerEventType::AckWaitEnded { event_id, reason } => {
                shard.batch_retired();
                match reason {
                    WaitEndReason::Cancelled => shard.waits_cancelled += 1,
                    WaitEndReason::TimedOut => shard.waits_timed_out += 1,
                    WaitEndReason::Abandoned => shard.waits_abandoned += 1,
                }
                trace!(shard_id = %event.shard_id, event_id = %event_id, reason = ?reason, "Ack wait ended");
            }
            ConsumerEventType::Checkpoint {
                event_id,
                success,
                error,
            } => {
                if event_id.is_some() {
                    shard.batch_retired();
                }
                if success {
                    shard.checkpoints_succeeded += 1;
                } else {
                    shard.checkpoints_failed += 1;
                    warn!(shard_id = %event.shard_id, error = ?error, "Checkpoint failed");
                }
            }
            ConsumerEventType::ShardShutdown { reason } => {
                info!(shard_id = %event.shard_id, reason = ?reason, "Shard shut down");
            }
            ConsumerEventType::ShardError { details } => {
                shard.shard_errors += 1;
                warn!(shard_id = %event.shard_id, details = %details, "Shard error");
            }
            ConsumerEventType::Iterator { event_type, error } => match event_type {
                IteratorEventType::Initial => {}
                IteratorEventType::Renewed | IteratorEventType::Expired => {
                    shard.iterator_renewals += 1;
                }
                IteratorEventType::Failed => {
                    shard.iterator_failures += 1;
                    warn!(shard_id = %event.shard_id, error = ?error, "Iterator operation failed");
                }
            },
        }

        shard.last_updated = Instant::now();
    }

    async fn emit_metrics(&self) {
        let metrics = self.metrics.read().await;

        for (shard_id, m) in metrics.iter() {
            info!(
                shard_id = %shard_id,
                batches_published = m.batches_published,
                records_published = m.records_published,
                acks_received = m.acks_received,
                checkpoints_succeeded = m.checkpoints_succeeded,
                checkpoints_failed = m.checkpoints_failed,
                in_flight = m.in_flight,
                max_in_flight = m.max_in_flight,
                avg_ack_wait_ms = %m.avg_ack_wait.as_millis(),
                max_ack_wait_ms = %m.max_ack_wait.as_millis(),
                "Metrics for window"
            );

            if m.checkpoints_failed > 0 {
                warn!(
                    shard_id = %shard_id,
                    failures = m.checkpoints_failed,
                    "Checkpoint failures detected"
                );
            }
            if m.waits_timed_out > 0 {
                warn!(
                    shard_id = %shard_id,
                    timed_out = m.waits_timed_out,
                    "Ack waits timed out"
                );
            }
        }
    }

    pub async fn get_metrics(&self) -> HashMap<String, ShardMetrics> {
        self.metrics.read().await.clone()
    }

    pub async fn get_shard_metrics(&self, shard_id: &str) -> Option<ShardMetrics> {
        self.metrics.read().await.get(shard_id).cloned()
    }
}
