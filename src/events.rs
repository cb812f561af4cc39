//! In-process publish/subscribe for live content notifications.
//!
//! Every subscription owns a bounded channel. `publish` hands the event to each
//! subscriber of the topic in registration order with a non-blocking send, so a
//! slow consumer can only lose events, never stall the publisher. Subscribers
//! whose receiving side is gone are pruned during the same pass.
//!
//! Dropping an `EventStream` cancels it: the registry slot is released at once
//! and nothing more is delivered.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::Stream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Topic carrying every newly created post.
pub const NEW_POST: &str = "NEW_POST";

pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub topic: String,
    pub payload: serde_json::Value,
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Event>,
}

type Registry = HashMap<String, Vec<Subscriber>>;

pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
    next_id: AtomicU64,
    buffer: usize,
    published: AtomicU64,
    dropped: AtomicU64,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("buffer", &self.buffer)
            .field("published", &self.published.load(Ordering::Relaxed))
            .field("dropped", &self.dropped.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self { Self::new(DEFAULT_SUBSCRIBER_BUFFER) }
}

impl EventBus {
    /// `buffer` bounds how many undelivered events each subscriber may hold.
    pub fn new(buffer: usize) -> Self {
        Self {
            registry: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Deliver `payload` to every current subscriber of `topic`. Returns how many
    /// subscribers accepted it; zero subscribers is not an error.
    pub fn publish(&self, topic: &str, payload: serde_json::Value) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);
        let event = Event { topic: topic.to_string(), payload };
        let mut reg = self.registry.lock();
        let Some(subs) = reg.get_mut(topic) else {
            debug!(topic, "event dropped (no subscribers)");
            return 0;
        };
        let mut delivered = 0usize;
        subs.retain(|sub| match sub.tx.try_send(event.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(topic, subscriber = sub.id, "subscriber buffer full, event skipped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(topic, subscriber = sub.id, "pruning closed subscriber");
                false
            }
        });
        if subs.is_empty() {
            reg.remove(topic);
        }
        debug!(topic, receivers = delivered, "event published");
        delivered
    }

    /// Lazy stream of every event published on `topic` from now on. It never
    /// ends by itself; drop it to cancel.
    pub fn subscribe(&self, topic: &str) -> EventStream {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry.lock().entry(topic.to_string()).or_default().push(Subscriber { id, tx });
        debug!(topic, subscriber = id, "subscription opened");
        EventStream { id, topic: topic.to_string(), rx, registry: Arc::clone(&self.registry) }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.registry.lock().get(topic).map_or(0, |s| s.len())
    }

    pub fn events_published(&self) -> u64 { self.published.load(Ordering::Relaxed) }

    /// Deliveries skipped because a subscriber's buffer was full.
    pub fn events_dropped(&self) -> u64 { self.dropped.load(Ordering::Relaxed) }
}

pub struct EventStream {
    id: u64,
    topic: String,
    rx: mpsc::Receiver<Event>,
    registry: Arc<Mutex<Registry>>,
}

impl EventStream {
    pub fn topic(&self) -> &str { &self.topic }

    pub async fn recv(&mut self) -> Option<Event> { self.rx.recv().await }

    /// Next already-buffered event, without waiting.
    pub fn try_recv(&mut self) -> Option<Event> { self.rx.try_recv().ok() }
}

impl Stream for EventStream {
    type Item = Event;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Event>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.rx.close();
        let mut reg = self.registry.lock();
        if let Some(subs) = reg.get_mut(&self.topic) {
            subs.retain(|s| s.id != self.id);
            if subs.is_empty() {
                reg.remove(&self.topic);
            }
        }
        debug!(topic = %self.topic, subscriber = self.id, "subscription closed");
    }
}
