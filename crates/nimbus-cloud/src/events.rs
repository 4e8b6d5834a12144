//! Publish/subscribe channel for cloud lifecycle events.

use std::collections::{HashMap, VecDeque};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;
use nimbus_core::CloudEvent;
use tokio::sync::mpsc;
use tracing::trace;
use uuid::Uuid;

pub const EVENT_INSTANCE_REQUESTED: &str = "instance.requested";
pub const EVENT_INSTANCE_PROVISIONING: &str = "instance.provisioning";
pub const EVENT_INSTANCE_RUNNING: &str = "instance.running";
pub const EVENT_INSTANCE_STOPPED: &str = "instance.stopped";
pub const EVENT_INSTANCE_TERMINATED: &str = "instance.terminated";
pub const EVENT_INSTANCE_FAILED: &str = "instance.failed";
pub const EVENT_INSTANCE_CONNECTED: &str = "instance.connected";
pub const EVENT_HOST_ALLOCATED: &str = "host.allocated";
pub const EVENT_HOST_RELEASED: &str = "host.released";

/// Per-subscriber channel capacity. Slow subscribers that fall this far
/// behind start losing events.
const SUBSCRIBER_BUFFER: usize = 32;

struct Inner {
    subscribers: HashMap<String, mpsc::Sender<CloudEvent>>,
    buffer: VecDeque<CloudEvent>,
}

/// Bounded ring-buffered pub/sub for [`CloudEvent`]s.
///
/// Publishing never blocks: the subscriber snapshot is taken under the lock
/// and sends happen outside it, dropping events for any subscriber whose
/// channel is full.
pub struct EventBus {
    inner: RwLock<Inner>,
    buffer_size: usize,
}

impl EventBus {
    pub fn new(buffer_size: usize) -> Self {
        let buffer_size = if buffer_size == 0 { 100 } else { buffer_size };
        Self {
            inner: RwLock::new(Inner {
                subscribers: HashMap::new(),
                buffer: VecDeque::with_capacity(buffer_size),
            }),
            buffer_size,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish an event to the ring buffer and all subscribers.
    pub fn publish(&self, mut event: CloudEvent) {
        if event.id.is_empty() {
            event.id = Uuid::new_v4().to_string();
        }
        if event.timestamp.timestamp() == 0 {
            event.timestamp = Utc::now();
        }

        let senders: Vec<mpsc::Sender<CloudEvent>> = {
            let mut inner = self.write();
            if inner.buffer.len() >= self.buffer_size {
                inner.buffer.pop_front();
            }
            inner.buffer.push_back(event.clone());
            inner.subscribers.values().cloned().collect()
        };

        for sender in senders {
            if sender.try_send(event.clone()).is_err() {
                // Subscriber is slow or gone; the event is dropped for it.
                trace!(event = %event.event_type, "dropped event for slow subscriber");
            }
        }
    }

    /// Register a subscriber; returns its id and the receiving end.
    pub fn subscribe(&self) -> (String, mpsc::Receiver<CloudEvent>) {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.write().subscribers.insert(id.clone(), tx);
        (id, rx)
    }

    /// Remove a subscriber; its channel closes once the sender is dropped.
    pub fn unsubscribe(&self, id: &str) {
        self.write().subscribers.remove(id);
    }

    /// The last `limit` events in chronological order.
    pub fn recent(&self, limit: usize) -> Vec<CloudEvent> {
        let inner = self.read();
        let len = inner.buffer.len();
        let limit = if limit == 0 || limit > len { len } else { limit };
        inner.buffer.iter().skip(len - limit).cloned().collect()
    }

    /// Convenience publisher for lifecycle events with an optional payload.
    pub fn emit(&self, event_type: &str, instance_id: &str, data: Option<serde_json::Value>) {
        self.publish(CloudEvent {
            id: String::new(),
            event_type: event_type.to_string(),
            instance_id: instance_id.to_string(),
            timestamp: Utc::now(),
            data,
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(200)
    }
}
