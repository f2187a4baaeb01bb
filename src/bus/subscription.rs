use super::{BusEvent, BusInner, Topic};
use crate::event::{AckEvent, EventId};
use std::sync::Weak;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// How a per-batch ack wait ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckOutcome {
    /// The matching ack arrived
    Acked(AckEvent),
    /// The wait was cancelled, unsubscribed, or the bus closed
    Cancelled,
    /// No ack arrived within the configured timeout
    TimedOut,
}

/// One-shot subscription for the ack of a single batch
///
/// Dropping the subscription unregisters it from the bus.
pub struct AckSubscription {
    id: EventId,
    rx: Option<oneshot::Receiver<AckEvent>>,
    bus: Weak<BusInner>,
}

impl AckSubscription {
    pub(super) fn new(id: EventId, rx: oneshot::Receiver<AckEvent>, bus: Weak<BusInner>) -> Self {
        Self {
            id,
            rx: Some(rx),
            bus,
        }
    }

    pub fn id(&self) -> EventId {
        self.id
    }

    /// Waits for the matching ack, cancellation, or `timeout`
    pub async fn wait(&mut self, cancel: &CancellationToken, timeout: Option<Duration>) -> AckOutcome {
        let Some(rx) = self.rx.as_mut() else {
            return AckOutcome::Cancelled;
        };

        let deadline = async {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending::<()>().await,
            }
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => AckOutcome::Cancelled,
            received = rx => match received {
                Ok(ack) => AckOutcome::Acked(ack),
                // Sender dropped: unsubscribed elsewhere or the bus closed
                Err(_) => AckOutcome::Cancelled,
            },
            _ = deadline => AckOutcome::TimedOut,
        };

        if !matches!(outcome, AckOutcome::TimedOut) {
            self.rx = None;
        }
        outcome
    }

    /// Removes the waiter from the bus; safe to call repeatedly
    pub fn unsubscribe(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.remove_ack_waiter(&self.id);
        }
        self.rx = None;
    }
}

impl Drop for AckSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for AckSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AckSubscription")
            .field("id", &self.id)
            .field("active", &self.rx.is_some())
            .finish()
    }
}

/// Filtered listener on one topic
///
/// Dropping the subscription unregisters it from the bus.
pub struct Subscription {
    listener_id: u64,
    topic: Topic,
    rx: mpsc::UnboundedReceiver<BusEvent>,
    bus: Weak<BusInner>,
    active: bool,
}

impl Subscription {
    pub(super) fn new(
        listener_id: u64,
        topic: Topic,
        rx: mpsc::UnboundedReceiver<BusEvent>,
        bus: Weak<BusInner>,
    ) -> Self {
        Self {
            listener_id,
            topic,
            rx,
            bus,
            active: true,
        }
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Next matching event; `None` once unsubscribed or the bus closed
    pub async fn recv(&mut self) -> Option<BusEvent> {
        self.rx.recv().await
    }

    /// Next already-delivered event, if any
    pub fn try_recv(&mut self) -> Option<BusEvent> {
        self.rx.try_recv().ok()
    }

    /// Removes the filter from the bus; safe to call repeatedly
    pub fn unsubscribe(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(bus) = self.bus.upgrade() {
            bus.remove_listener(self.listener_id);
        }
        self.rx.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("listener_id", &self.listener_id)
            .field("topic", &self.topic)
            .field("active", &self.active)
            .finish()
    }
}
