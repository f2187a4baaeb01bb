//! Lifecycle of the shard reader's run loop

use crate::error::{ConsumerError, Result};
use crate::factory::ProcessorFactory;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// The collaborator that fetches records and drives record processors
///
/// `run` obtains a processor from `factory` for every shard it leases, calls
/// its callbacks, and returns once `shutdown` is cancelled.
#[async_trait]
pub trait ShardReader: Send + Sync + 'static {
    async fn run(&self, factory: ProcessorFactory, shutdown: CancellationToken) -> Result<()>;

    /// Stream this reader consumes, when it is bound to one
    fn stream_name(&self) -> Option<&str> {
        None
    }
}

/// Configuration for the worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How long `stop` waits for the run loop before aborting it
    pub shutdown_grace_period: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            shutdown_grace_period: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    NotStarted,
    Running,
    Stopped,
}

/// How a call to [`Worker::stop`] ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The run loop returned within the grace period
    Clean,
    /// The grace period elapsed and the run loop was aborted
    ForceTerminated,
    /// The worker was not running
    NotRunning,
}

struct RunHandle {
    shutdown: CancellationToken,
    task: JoinHandle<Result<()>>,
}

/// Owns the shard reader's run loop on a background task
pub struct Worker<R: ShardReader> {
    reader: Arc<R>,
    factory: ProcessorFactory,
    config: WorkerConfig,
    state: WorkerState,
    run: Option<RunHandle>,
}

impl<R: ShardReader> Worker<R> {
    pub fn new(reader: R, factory: ProcessorFactory, config: WorkerConfig) -> Self {
        Self {
            reader: Arc::new(reader),
            factory,
            config,
            state: WorkerState::NotStarted,
            run: None,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Whether the run loop has returned on its own while still Running
    pub fn is_finished(&self) -> bool {
        self.run.as_ref().map_or(false, |run| run.task.is_finished())
    }

    /// Launches the run loop and returns without waiting for it
    pub fn start(&mut self) -> Result<()> {
        if self.state == WorkerState::Running {
            return Err(ConsumerError::AlreadyStarted);
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| ConsumerError::Usage("worker must be started inside a tokio runtime".to_string()))?;

        let shutdown = CancellationToken::new();
        let factory = self.factory.with_shutdown(shutdown.clone());
        let reader = self.reader.clone();
        let token = shutdown.clone();

        let task = runtime.spawn(async move {
            let result = reader.run(factory, token).await;
            if let Err(e) = &result {
                error!(error = %e, "Shard reader run loop failed");
            }
            result
        });

        self.run = Some(RunHandle { shutdown, task });
        self.state = WorkerState::Running;
        info!("Worker started");
        Ok(())
    }

    /// Cancels the run loop and waits up to the grace period for it to end
    ///
    /// Every processor created during the run, and every pending ack wait it
    /// owns, is cancelled along with the loop.
    pub async fn stop(&mut self) -> Result<StopOutcome> {
        let Some(RunHandle { shutdown, mut task }) = self.run.take() else {
            debug!(state = ?self.state, "Stop called on a worker that is not running");
            return Ok(StopOutcome::NotRunning);
        };

        info!("Stopping worker");
        shutdown.cancel();
        self.state = WorkerState::Stopped;

        match tokio::time::timeout(self.config.shutdown_grace_period, &mut task).await {
            Ok(Ok(Ok(()))) => {
                info!("Worker stopped cleanly");
                Ok(StopOutcome::Clean)
            }
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(join_err)) => Err(join_err.into()),
            Err(_) => {
                warn!(
                    grace_period = ?self.config.shutdown_grace_period,
                    "Run loop did not stop in time, aborting"
                );
                task.abort();
                Ok(StopOutcome::ForceTerminated)
            }
        }
    }
}

impl<R: ShardReader> Drop for Worker<R> {
    fn drop(&mut self) {
        if let Some(run) = self.run.take() {
            run.shutdown.cancel();
        }
    }
}
