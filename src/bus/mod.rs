//! Publish/subscribe bus shared by record processors and the downstream side
//!
//! Two topics are carried:
//!
//! - [`Topic::Records`]: new-records events, fed to the downstream records
//!   stream and to any generic subscribers.
//! - [`Topic::Ack`]: acknowledgments. Every ack is broadcast; the per-batch
//!   waiters registered through [`EventBus::subscribe_ack`] are one-shot
//!   channels keyed by event id, so matching is a map lookup rather than a
//!   filter over every listener.

mod subscription;

pub use subscription::{AckOutcome, AckSubscription, Subscription};

use crate::error::{ConsumerError, Result};
use crate::event::{AckEvent, EventId, NewRecordsEvent};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

/// Logical topic an event is published on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Records,
    Ack,
}

/// Any event carried by the bus
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    NewRecords(NewRecordsEvent),
    Ack(AckEvent),
}

impl BusEvent {
    pub fn topic(&self) -> Topic {
        match self {
            BusEvent::NewRecords(_) => Topic::Records,
            BusEvent::Ack(_) => Topic::Ack,
        }
    }

    pub fn id(&self) -> EventId {
        match self {
            BusEvent::NewRecords(event) => event.id,
            BusEvent::Ack(event) => event.id,
        }
    }
}

impl From<NewRecordsEvent> for BusEvent {
    fn from(event: NewRecordsEvent) -> Self {
        BusEvent::NewRecords(event)
    }
}

impl From<AckEvent> for BusEvent {
    fn from(event: AckEvent) -> Self {
        BusEvent::Ack(event)
    }
}

type Filter = Box<dyn Fn(&BusEvent) -> bool + Send + Sync>;

struct Listener {
    topic: Topic,
    filter: Filter,
    tx: mpsc::UnboundedSender<BusEvent>,
}

pub(crate) struct BusInner {
    closed: AtomicBool,
    records_tx: mpsc::UnboundedSender<NewRecordsEvent>,
    /// Guarded together with `closed` so a waiter can never be registered
    /// after `close` drained the map.
    pending_acks: Mutex<HashMap<EventId, oneshot::Sender<AckEvent>>>,
    /// Checked against `closed` under its own lock, for the same reason
    listeners: Mutex<HashMap<u64, Listener>>,
    next_listener_id: AtomicU64,
}

impl BusInner {
    pub(crate) fn remove_ack_waiter(&self, id: &EventId) {
        if self.pending_acks.lock().remove(id).is_some() {
            trace!(event_id = %id, "Released ack subscription");
        }
    }

    pub(crate) fn remove_listener(&self, listener_id: u64) {
        self.listeners.lock().remove(&listener_id);
    }

    fn fan_out(&self, event: &BusEvent) {
        let topic = event.topic();
        let mut listeners = self.listeners.lock();
        listeners.retain(|_, listener| {
            if listener.topic != topic || !(listener.filter)(event) {
                return true;
            }
            // A closed receiver means the subscription handle is gone
            listener.tx.send(event.clone()).is_ok()
        });
    }
}

/// Shared handle to the event bus; clones refer to the same bus
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("closed", &self.is_closed())
            .field("pending_acks", &self.pending_acks())
            .finish()
    }
}

impl EventBus {
    /// Creates a bus together with the downstream records receiver
    pub fn new() -> (Self, mpsc::UnboundedReceiver<NewRecordsEvent>) {
        let (records_tx, records_rx) = mpsc::unbounded_channel();
        let bus = Self {
            inner: Arc::new(BusInner {
                closed: AtomicBool::new(false),
                records_tx,
                pending_acks: Mutex::new(HashMap::new()),
                listeners: Mutex::new(HashMap::new()),
                next_listener_id: AtomicU64::new(0),
            }),
        };
        (bus, records_rx)
    }

    /// Publishes an event on the topic matching its kind
    ///
    /// Never blocks. Records events fail with [`ConsumerError::BusClosed`]
    /// once the bus is closed; acks on a closed bus are dropped silently.
    pub fn publish(&self, event: impl Into<BusEvent>) -> Result<()> {
        match event.into() {
            BusEvent::NewRecords(event) => self.publish_records(event),
            BusEvent::Ack(event) => {
                self.publish_ack(event);
                Ok(())
            }
        }
    }

    /// Publishes a new-records event to the downstream stream and subscribers
    pub fn publish_records(&self, event: NewRecordsEvent) -> Result<()> {
        if self.is_closed() {
            return Err(ConsumerError::BusClosed);
        }

        trace!(event_id = %event.id, records = event.data.len(), "Publishing new records");
        self.inner.fan_out(&BusEvent::NewRecords(event.clone()));
        self.inner
            .records_tx
            .send(event)
            .map_err(|_| ConsumerError::DownstreamClosed)
    }

    /// Resolves the waiter for `ack.id`, if any, and broadcasts the ack
    ///
    /// Returns whether a pending waiter was resolved. Duplicate or unknown
    /// acks resolve nothing.
    pub fn publish_ack(&self, ack: AckEvent) -> bool {
        if self.is_closed() {
            debug!(event_id = %ack.id, "Dropping ack published on closed bus");
            return false;
        }

        let waiter = self.inner.pending_acks.lock().remove(&ack.id);
        let resolved = match waiter {
            Some(tx) => tx.send(ack).is_ok(),
            None => {
                trace!(event_id = %ack.id, "Ack matched no pending subscription");
                false
            }
        };

        self.inner.fan_out(&BusEvent::Ack(ack));
        resolved
    }

    /// Registers a one-shot waiter for the ack matching `id`
    ///
    /// On a closed bus the returned subscription is already terminated and
    /// resolves as cancelled.
    pub fn subscribe_ack(&self, id: EventId) -> AckSubscription {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending_acks.lock();
            if self.is_closed() {
                drop(tx);
            } else {
                pending.insert(id, tx);
            }
        }
        trace!(event_id = %id, "Registered ack subscription");
        AckSubscription::new(id, rx, Arc::downgrade(&self.inner))
    }

    /// Registers a filtered listener on `topic`
    pub fn subscribe<F>(&self, topic: Topic, predicate: F) -> Subscription
    where
        F: Fn(&BusEvent) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener_id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);

        {
            // `close` clears the map under this lock after setting `closed`
            let mut listeners = self.inner.listeners.lock();
            if !self.is_closed() {
                listeners.insert(
                    listener_id,
                    Listener {
                        topic,
                        filter: Box::new(predicate),
                        tx,
                    },
                );
            }
        }

        Subscription::new(listener_id, topic, rx, Arc::downgrade(&self.inner))
    }

    /// Closes the bus; every pending ack subscription resolves as cancelled
    pub fn close(&self) {
        let drained = {
            let mut pending = self.inner.pending_acks.lock();
            if self.inner.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            pending.drain().count()
        };
        self.inner.listeners.lock().clear();
        debug!(cancelled_waiters = drained, "Event bus closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Number of ack subscriptions still waiting
    pub fn pending_acks(&self) -> usize {
        self.inner.pending_acks.lock().len()
    }

    /// Number of generic listeners currently registered
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }
}
