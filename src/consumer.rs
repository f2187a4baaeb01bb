//! Top-level consumer assembling bus, processor factory and worker
//!
//! The downstream side sees two ends:
//!
//! - [`RecordsStream`]: every published [`NewRecordsEvent`]
//! - [`AckSink`]: where it reports batches as durably processed
//!
//! # Examples
//!
//! ```rust,no_run
//! use kinesis_ack_consumer::{Consumer, ConsumerConfig, KinesisReaderConfig, KinesisShardReader};
//! use kinesis_ack_consumer::store::InMemoryCheckpointStore;
//!
//! async fn run(client: aws_sdk_kinesis::Client) -> kinesis_ack_consumer::Result<()> {
//!     let reader = KinesisShardReader::new(
//!         KinesisReaderConfig {
//!             stream_name: "orders".to_string(),
//!             ..Default::default()
//!         },
//!         client,
//!         InMemoryCheckpointStore::new(),
//!     );
//!     let mut consumer = Consumer::new(
//!         ConsumerConfig {
//!             application_name: "order-sink".to_string(),
//!             stream_name: "orders".to_string(),
//!             ..Default::default()
//!         },
//!         reader,
//!     )?;
//!
//!     let mut records = consumer.records().expect("records stream taken once");
//!     let acks = consumer.ack_sink();
//!     consumer.start()?;
//!
//!     while let Some(event) = records.recv().await {
//!         // store event.data durably, then:
//!         acks.ack(event.id)?;
//!     }
//!
//!     consumer.shutdown().await?;
//!     Ok(())
//! }
//! ```

use crate::bus::EventBus;
use crate::error::{ConsumerError, Result, ShardError};
use crate::event::{AckEvent, EventId, NewRecordsEvent};
use crate::factory::ProcessorFactory;
use crate::monitoring::{ConsumerEvent, MetricsAggregator, Monitor, MonitoringConfig};
use crate::processor::ProcessorConfig;
use crate::worker::{ShardReader, StopOutcome, Worker, WorkerConfig, WorkerState};
use futures::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Configuration for the consumer
#[derive(Debug, Clone, Default)]
pub struct ConsumerConfig {
    /// Name identifying this consumer application
    pub application_name: String,
    /// Name of the stream being consumed
    pub stream_name: String,
    /// Ack protocol settings for every record processor
    pub processor: ProcessorConfig,
    /// Worker lifecycle settings
    pub worker: WorkerConfig,
    /// Monitoring configuration
    pub monitoring: MonitoringConfig,
}

impl ConsumerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.application_name.trim().is_empty() {
            return Err(ConsumerError::ConfigError(
                "application_name must not be empty".to_string(),
            ));
        }
        if self.stream_name.trim().is_empty() {
            return Err(ConsumerError::ConfigError(
                "stream_name must not be empty".to_string(),
            ));
        }
        if self.worker.shutdown_grace_period.is_zero() {
            return Err(ConsumerError::ConfigError(
                "worker.shutdown_grace_period must be greater than zero".to_string(),
            ));
        }
        if self.processor.ack_timeout.is_some_and(|t| t.is_zero()) {
            return Err(ConsumerError::ConfigError(
                "processor.ack_timeout must be greater than zero when set".to_string(),
            ));
        }
        if self.monitoring.enabled && self.monitoring.channel_size == 0 {
            return Err(ConsumerError::ConfigError(
                "monitoring.channel_size must be greater than zero".to_string(),
            ));
        }
        if self.monitoring.enabled && self.monitoring.metrics_interval.is_zero() {
            return Err(ConsumerError::ConfigError(
                "monitoring.metrics_interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Stream of new-records events for the downstream processor
#[derive(Debug)]
pub struct RecordsStream {
    rx: mpsc::UnboundedReceiver<NewRecordsEvent>,
}

impl RecordsStream {
    pub async fn recv(&mut self) -> Option<NewRecordsEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<NewRecordsEvent> {
        self.rx.try_recv().ok()
    }
}

impl Stream for RecordsStream {
    type Item = NewRecordsEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Where the downstream processor reports batches as processed
#[derive(Debug, Clone)]
pub struct AckSink {
    bus: EventBus,
}

impl AckSink {
    /// Acknowledges the batch published under `id`
    pub fn ack(&self, id: EventId) -> Result<()> {
        self.send(AckEvent::new(id))
    }

    /// Publishes an ack; duplicates and unknown ids are ignored
    pub fn send(&self, ack: AckEvent) -> Result<()> {
        self.bus.publish(ack)
    }
}

/// Ack-gated consumer for one stream
pub struct Consumer<R: ShardReader> {
    config: ConsumerConfig,
    bus: EventBus,
    worker: Worker<R>,
    records: Option<RecordsStream>,
    shard_errors: Option<mpsc::UnboundedReceiver<ShardError>>,
    monitoring_rx: Option<mpsc::Receiver<ConsumerEvent>>,
}

impl<R: ShardReader> Consumer<R> {
    /// Validates `config` and wires bus, factory and worker together
    pub fn new(config: ConsumerConfig, reader: R) -> Result<Self> {
        config.validate()?;
        if let Some(reader_stream) = reader.stream_name() {
            if reader_stream != config.stream_name {
                return Err(ConsumerError::ConfigError(format!(
                    "stream_name {} does not match the reader's stream {}",
                    config.stream_name, reader_stream
                )));
            }
        }

        let (bus, records_rx) = EventBus::new();
        let (monitor, monitoring_rx) = Monitor::new(&config.monitoring);
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let monitoring = monitor.is_enabled();
        let factory = ProcessorFactory::new(bus.clone(), config.processor.clone(), monitor, errors_tx);
        let worker = Worker::new(reader, factory, config.worker.clone());

        info!(
            application = %config.application_name,
            stream = %config.stream_name,
            monitoring,
            "Consumer created"
        );

        Ok(Self {
            config,
            bus,
            worker,
            records: Some(RecordsStream { rx: records_rx }),
            shard_errors: Some(errors_rx),
            monitoring_rx,
        })
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn state(&self) -> WorkerState {
        self.worker.state()
    }

    /// Takes the inbound records stream; `None` after the first call
    pub fn records(&mut self) -> Option<RecordsStream> {
        self.records.take()
    }

    pub fn ack_sink(&self) -> AckSink {
        AckSink {
            bus: self.bus.clone(),
        }
    }

    /// Takes the receiver of shard-fatal errors; `None` after the first call
    pub fn shard_errors(&mut self) -> Option<mpsc::UnboundedReceiver<ShardError>> {
        self.shard_errors.take()
    }

    /// Takes the monitoring receiver; `None` when disabled or already taken
    pub fn monitoring(&mut self) -> Option<mpsc::Receiver<ConsumerEvent>> {
        self.monitoring_rx.take()
    }

    /// Takes the monitoring receiver wrapped in an aggregator that logs every
    /// `monitoring.metrics_interval`; `None` when disabled or already taken
    pub fn metrics_aggregator(&mut self) -> Option<MetricsAggregator> {
        self.monitoring()
            .map(|rx| MetricsAggregator::from_config(&self.config.monitoring, rx))
    }

    pub fn start(&mut self) -> Result<()> {
        info!(stream = %self.config.stream_name, "Starting consumer");
        self.worker.start()
    }

    pub async fn stop(&mut self) -> Result<StopOutcome> {
        info!(stream = %self.config.stream_name, "Stopping consumer");
        self.worker.stop().await
    }

    /// Stops the worker and closes the bus, closing the bus even if stopping fails
    pub async fn shutdown(mut self) -> Result<StopOutcome> {
        let result = self.worker.stop().await;
        self.bus.close();
        if let Err(e) = &result {
            warn!(error = %e, "Consumer shut down with error");
        } else {
            info!(stream = %self.config.stream_name, "Consumer shut down");
        }
        result
    }
}

impl<R: ShardReader> Drop for Consumer<R> {
    fn drop(&mut self) {
        self.bus.close();
    }
}
