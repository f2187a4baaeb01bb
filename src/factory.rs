//! Construction of record processors for shard leases

use crate::bus::EventBus;
use crate::error::ShardError;
use crate::monitoring::Monitor;
use crate::processor::{AckGatedProcessor, ProcessorConfig};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Builds one [`AckGatedProcessor`] per shard lease, all bound to the same bus
///
/// Cheap to clone and safe to call from many shard tasks at once.
#[derive(Debug, Clone)]
pub struct ProcessorFactory {
    bus: EventBus,
    config: ProcessorConfig,
    monitor: Monitor,
    errors: mpsc::UnboundedSender<ShardError>,
    shutdown: CancellationToken,
}

impl ProcessorFactory {
    pub fn new(
        bus: EventBus,
        config: ProcessorConfig,
        monitor: Monitor,
        errors: mpsc::UnboundedSender<ShardError>,
    ) -> Self {
        Self {
            bus,
            config,
            monitor,
            errors,
            shutdown: CancellationToken::new(),
        }
    }

    /// Same factory, with processors cancelled when `shutdown` is
    pub fn with_shutdown(&self, shutdown: CancellationToken) -> Self {
        Self {
            shutdown,
            ..self.clone()
        }
    }

    pub fn create_processor(&self) -> Arc<AckGatedProcessor> {
        trace!("Creating record processor");
        Arc::new(AckGatedProcessor::new(
            self.bus.clone(),
            self.config.clone(),
            self.monitor.clone(),
            self.errors.clone(),
            self.shutdown.child_token(),
        ))
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    /// Reports a shard-fatal error raised outside a processor
    pub fn report(&self, error: ShardError) {
        if self.errors.send(error).is_err() {
            debug!("Shard error receiver dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Batch;
    use crate::processor::{RecordProcessor, ShutdownReason};
    use crate::test::mocks::MockCheckpointer;

    #[tokio::test]
    async fn test_processors_share_bus_and_parent_token() -> anyhow::Result<()> {
        let (bus, mut records) = EventBus::new();
        let (errors, _errors_rx) = mpsc::unbounded_channel();
        let run = CancellationToken::new();
        let factory = ProcessorFactory::new(bus.clone(), ProcessorConfig::default(), Monitor::disabled(), errors)
            .with_shutdown(run.clone());

        let a = factory.create_processor();
        let b = factory.create_processor();
        a.initialize("shard-a").await?;
        b.initialize("shard-b").await?;

        let checkpointer = MockCheckpointer::new();
        a.process_records(Batch::new("shard-a", vec![]), checkpointer.handle()).await?;
        b.process_records(Batch::new("shard-b", vec![]), checkpointer.handle()).await?;
        assert!(records.recv().await.is_some());
        assert!(records.recv().await.is_some());
        assert_eq!(bus.pending_acks(), 2);

        // Shutting one shard down leaves the other waiting
        a.shutdown(checkpointer.handle(), ShutdownReason::ZombieLeaseLost).await?;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(bus.pending_acks(), 1);

        run.cancel();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(bus.pending_acks(), 0);
        assert_eq!(checkpointer.count(), 0);
        Ok(())
    }
}
