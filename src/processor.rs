//! Ack-gated record processing
//!
//! The shard reader hands each batch to a [`RecordProcessor`]. The
//! [`AckGatedProcessor`] publishes the batch on the event bus and returns
//! immediately; a spawned task waits for the downstream ack and only then
//! calls the batch's [`Checkpointer`]. This handles:
//!
//! - Subscribe-before-publish registration of the per-batch ack waiter
//! - Checkpointing in delivery order within a shard, whatever the ack order
//! - Cancellation of pending waits on shutdown or worker stop
//! - Shard-fatal reporting of checkpoint failures

use crate::bus::{AckOutcome, EventBus};
use crate::error::{ConsumerError, Result, ShardError};
use crate::event::{Batch, EventId, NewRecordsEvent};
use crate::monitoring::{ConsumerEvent, Monitor, WaitEndReason};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Handle back into the shard reader that persists a read position
///
/// Each handle is bound to the position it was created for, so calling it
/// records that position as processed.
#[async_trait]
pub trait Checkpointer: Send + Sync {
    async fn checkpoint(&self) -> anyhow::Result<()>;
}

/// Why the shard reader is shutting a processor down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// The shard is closed and fully drained
    Terminate,
    /// The lease was lost; another worker resumes from the last checkpoint
    ZombieLeaseLost,
    /// The worker is stopping
    Requested,
}

/// Callbacks the shard reader drives, one processor per shard lease
///
/// Calls for one shard are sequential; calls for different shards are
/// concurrent.
#[async_trait]
pub trait RecordProcessor: Send + Sync {
    async fn initialize(&self, shard_id: &str) -> Result<()>;

    async fn process_records(&self, batch: Batch, checkpointer: Arc<dyn Checkpointer>) -> Result<()>;

    async fn shutdown(&self, checkpointer: Arc<dyn Checkpointer>, reason: ShutdownReason) -> Result<()>;
}

/// Per-processor settings for the ack protocol
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Give up on a batch when no ack arrives in time. `None` waits forever
    /// and leaves redelivery to the lease timeout.
    pub ack_timeout: Option<Duration>,
    /// How long a terminating shard waits for in-flight batches before its
    /// final checkpoint. `None` waits until every batch is resolved or the
    /// worker stops. A shard that is not fully checkpointed when the wait
    /// ends is never marked finished.
    pub terminate_drain_timeout: Option<Duration>,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            ack_timeout: None,
            terminate_drain_timeout: None,
        }
    }
}

/// Upper bound on waiting for cancelled batch tasks to wind down
const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Terminal state of one batch, passed to the next batch of the same shard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchOutcome {
    Checkpointed,
    NotCheckpointed,
}

/// Everything a spawned wait task shares with its processor
struct ShardState {
    shard_id: RwLock<String>,
    bus: EventBus,
    config: ProcessorConfig,
    monitor: Monitor,
    errors: mpsc::UnboundedSender<ShardError>,
    shutdown: CancellationToken,
    failed: AtomicBool,
    in_flight: AtomicUsize,
    /// Notified when `in_flight` drops to zero
    idle: Notify,
}

impl ShardState {
    fn shard_id(&self) -> String {
        self.shard_id.read().clone()
    }

    /// Marks the shard failed, cancels its other waits and reports upward
    fn fail(&self, error: ConsumerError) {
        let shard_id = self.shard_id();
        if self.failed.swap(true, Ordering::SeqCst) {
            return;
        }

        error!(shard_id = %shard_id, error = %error, "Shard processing failed");
        self.shutdown.cancel();
        self.monitor
            .emit(ConsumerEvent::shard_error(shard_id.clone(), error.to_string()));
        if self.errors.send(ShardError { shard_id, error }).is_err() {
            debug!("Shard error receiver dropped");
        }
    }
}

/// [`RecordProcessor`] that checkpoints a batch only after its ack arrives
pub struct AckGatedProcessor {
    state: Arc<ShardState>,
    /// Outcome of the most recently delivered batch
    tail: Mutex<Option<oneshot::Receiver<BatchOutcome>>>,
    stopped: AtomicBool,
}

impl std::fmt::Debug for AckGatedProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckGatedProcessor")
            .field("shard_id", &self.state.shard_id())
            .field("in_flight", &self.in_flight())
            .field("failed", &self.is_failed())
            .finish()
    }
}

impl AckGatedProcessor {
    pub fn new(
        bus: EventBus,
        config: ProcessorConfig,
        monitor: Monitor,
        errors: mpsc::UnboundedSender<ShardError>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            state: Arc::new(ShardState {
                shard_id: RwLock::new(String::new()),
                bus,
                config,
                monitor,
                errors,
                shutdown,
                failed: AtomicBool::new(false),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
            tail: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn shard_id(&self) -> String {
        self.state.shard_id()
    }

    /// Batches published but not yet checkpointed or given up on
    pub fn in_flight(&self) -> usize {
        self.state.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_failed(&self) -> bool {
        self.state.failed.load(Ordering::SeqCst)
    }

    /// Waits until the latest batch has reached a terminal state
    ///
    /// Returns true only when every batch delivered to this processor was
    /// checkpointed. A batch checkpoints only after its predecessor did, so
    /// the latest outcome covers all of them.
    async fn drain(&self, timeout: Option<Duration>) -> bool {
        let tail = self.tail.lock().take();
        let Some(tail) = tail else {
            return true;
        };

        let outcome = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, tail).await {
                Ok(outcome) => outcome.ok(),
                Err(_) => {
                    warn!(
                        shard_id = %self.shard_id(),
                        in_flight = self.in_flight(),
                        timeout = ?timeout,
                        "In-flight batches not acked before terminate"
                    );
                    None
                }
            },
            None => tail.await.ok(),
        };
        outcome == Some(BatchOutcome::Checkpointed)
    }

    /// Waits for every batch task to finish after the shard token is cancelled
    ///
    /// No batch checkpoint can land after this returns, so a final
    /// checkpoint is never overwritten by an older position.
    async fn settle(&self) {
        let settled = async {
            loop {
                let notified = self.state.idle.notified();
                if self.in_flight() == 0 {
                    return;
                }
                notified.await;
            }
        };
        if tokio::time::timeout(SETTLE_TIMEOUT, settled).await.is_err() {
            warn!(
                shard_id = %self.shard_id(),
                in_flight = self.in_flight(),
                "Batch tasks still running after shutdown"
            );
        }
    }
}

/// Waits for one batch's ack, then its predecessor, then checkpoints
async fn await_ack_and_checkpoint(
    state: Arc<ShardState>,
    mut subscription: crate::bus::AckSubscription,
    checkpointer: Arc<dyn Checkpointer>,
    previous: Option<oneshot::Receiver<BatchOutcome>>,
    done: oneshot::Sender<BatchOutcome>,
) {
    let event_id = subscription.id();
    let started = Instant::now();

    let outcome = subscription.wait(&state.shutdown, state.config.ack_timeout).await;
    subscription.unsubscribe();

    let result = match outcome {
        AckOutcome::Acked(_) => {
            state.monitor.emit(ConsumerEvent::ack_received(
                state.shard_id(),
                event_id,
                started.elapsed(),
            ));
            debug!(shard_id = %state.shard_id(), event_id = %event_id, "Ack received");
            checkpoint_in_order(&state, event_id, checkpointer, previous).await
        }
        AckOutcome::Cancelled => {
            debug!(shard_id = %state.shard_id(), event_id = %event_id, "Ack wait cancelled");
            state.monitor.emit(ConsumerEvent::ack_wait_ended(
                state.shard_id(),
                event_id,
                WaitEndReason::Cancelled,
            ));
            BatchOutcome::NotCheckpointed
        }
        AckOutcome::TimedOut => {
            let timeout = state.config.ack_timeout.unwrap_or_default();
            state.monitor.emit(ConsumerEvent::ack_wait_ended(
                state.shard_id(),
                event_id,
                WaitEndReason::TimedOut,
            ));
            state.fail(ConsumerError::AckTimeout { event_id, timeout });
            BatchOutcome::NotCheckpointed
        }
    };

    if state.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
        state.idle.notify_waiters();
    }
    // The next batch may already have given up waiting on us
    let _ = done.send(result);
}

async fn checkpoint_in_order(
    state: &ShardState,
    event_id: EventId,
    checkpointer: Arc<dyn Checkpointer>,
    previous: Option<oneshot::Receiver<BatchOutcome>>,
) -> BatchOutcome {
    if let Some(previous) = previous {
        let previous = tokio::select! {
            biased;
            _ = state.shutdown.cancelled() => None,
            outcome = previous => outcome.ok(),
        };
        if previous != Some(BatchOutcome::Checkpointed) {
            // Checkpointing past a batch that never completed would skip it
            debug!(
                shard_id = %state.shard_id(),
                event_id = %event_id,
                "Earlier batch did not checkpoint, not checkpointing"
            );
            state.monitor.emit(ConsumerEvent::ack_wait_ended(
                state.shard_id(),
                event_id,
                WaitEndReason::Abandoned,
            ));
            return BatchOutcome::NotCheckpointed;
        }
    }

    if state.shutdown.is_cancelled() {
        state.monitor.emit(ConsumerEvent::ack_wait_ended(
            state.shard_id(),
            event_id,
            WaitEndReason::Cancelled,
        ));
        return BatchOutcome::NotCheckpointed;
    }

    match checkpointer.checkpoint().await {
        Ok(()) => {
            debug!(shard_id = %state.shard_id(), event_id = %event_id, "Checkpointed batch");
            state
                .monitor
                .emit(ConsumerEvent::checkpoint(state.shard_id(), Some(event_id), true, None));
            BatchOutcome::Checkpointed
        }
        Err(e) => {
            state.monitor.emit(ConsumerEvent::checkpoint(
                state.shard_id(),
                Some(event_id),
                false,
                Some(e.to_string()),
            ));
            state.fail(ConsumerError::CheckpointFailed {
                shard_id: state.shard_id(),
                message: format!("{:#}", e),
            });
            BatchOutcome::NotCheckpointed
        }
    }
}

#[async_trait]
impl RecordProcessor for AckGatedProcessor {
    async fn initialize(&self, shard_id: &str) -> Result<()> {
        *self.state.shard_id.write() = shard_id.to_string();
        info!(shard_id = %shard_id, "Initializing record processor");
        self.state
            .monitor
            .emit(ConsumerEvent::shard_initialized(shard_id));
        Ok(())
    }

    async fn process_records(&self, batch: Batch, checkpointer: Arc<dyn Checkpointer>) -> Result<()> {
        if self.is_failed() {
            return Err(ConsumerError::ShardFailed(self.shard_id()));
        }
        if self.stopped.load(Ordering::SeqCst) || self.state.shutdown.is_cancelled() {
            return Err(ConsumerError::Shutdown);
        }

        let record_count = batch.len();
        let event = NewRecordsEvent::new(batch);
        let event_id = event.id;

        // Register before publishing so an immediate ack cannot be missed
        let subscription = self.state.bus.subscribe_ack(event_id);
        self.state.bus.publish_records(event)?;

        self.state.in_flight.fetch_add(1, Ordering::SeqCst);
        self.state.monitor.emit(ConsumerEvent::batch_published(
            self.shard_id(),
            event_id,
            record_count,
        ));
        debug!(
            shard_id = %self.shard_id(),
            event_id = %event_id,
            records = record_count,
            in_flight = self.in_flight(),
            "Published batch, awaiting ack"
        );

        let (done_tx, done_rx) = oneshot::channel();
        let previous = self.tail.lock().replace(done_rx);

        tokio::spawn(await_ack_and_checkpoint(
            self.state.clone(),
            subscription,
            checkpointer,
            previous,
            done_tx,
        ));

        Ok(())
    }

    async fn shutdown(&self, checkpointer: Arc<dyn Checkpointer>, reason: ShutdownReason) -> Result<()> {
        let shard_id = self.shard_id();
        self.stopped.store(true, Ordering::SeqCst);
        info!(
            shard_id = %shard_id,
            reason = ?reason,
            in_flight = self.in_flight(),
            "Shutting down record processor"
        );
        self.state
            .monitor
            .emit(ConsumerEvent::shard_shutdown(shard_id.clone(), reason));

        if reason != ShutdownReason::Terminate {
            // Another owner resumes from the last durable checkpoint
            self.state.shutdown.cancel();
            self.settle().await;
            return Ok(());
        }

        let drained = self.drain(self.state.config.terminate_drain_timeout).await;
        let interrupted = self.state.shutdown.is_cancelled();
        self.state.shutdown.cancel();
        self.settle().await;

        if !drained {
            // Unacked records must stay readable after the shard is released
            if self.is_failed() {
                return Err(ConsumerError::ShardFailed(shard_id));
            }
            if interrupted {
                info!(shard_id = %shard_id, "Stopped before shard drained, not marking it finished");
                return Ok(());
            }
            self.state.fail(ConsumerError::ShardNotDrained {
                shard_id: shard_id.clone(),
            });
            return Err(ConsumerError::ShardFailed(shard_id));
        }

        match checkpointer.checkpoint().await {
            Ok(()) => {
                info!(shard_id = %shard_id, "Final checkpoint saved");
                self.state
                    .monitor
                    .emit(ConsumerEvent::checkpoint(shard_id, None, true, None));
                Ok(())
            }
            Err(e) => {
                let message = format!("{:#}", e);
                self.state.monitor.emit(ConsumerEvent::checkpoint(
                    shard_id.clone(),
                    None,
                    false,
                    Some(message.clone()),
                ));
                self.state.fail(ConsumerError::CheckpointFailed {
                    shard_id: shard_id.clone(),
                    message: message.clone(),
                });
                Err(ConsumerError::CheckpointFailed { shard_id, message })
            }
        }
    }
}
