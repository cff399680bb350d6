use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use dashmap::DashMap;
use futures::Stream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use inbox_core::ids::SubscriberId;
use inbox_core::PushEvent;

pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 64;

struct Registry {
    subscribers: DashMap<SubscriberId, mpsc::Sender<Arc<PushEvent>>>,
    buffer: usize,
}

/// Fan-out of push events to live subscribers. No backlog: a subscriber
/// only sees events published while it is registered.
#[derive(Clone)]
pub struct EventBroadcaster {
    registry: Arc<Registry>,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_BUFFER)
    }
}

impl EventBroadcaster {
    /// `buffer` bounds each subscriber's queue; a subscriber that falls
    /// that far behind is disconnected.
    pub fn new(buffer: usize) -> Self {
        Self {
            registry: Arc::new(Registry {
                subscribers: DashMap::new(),
                buffer: buffer.max(1),
            }),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let id = SubscriberId::new();
        let (tx, rx) = mpsc::channel(self.registry.buffer);
        let _ = self.registry.subscribers.insert(id.clone(), tx);
        info!(subscriber_id = %id, total = self.subscriber_count(), "subscriber connected");
        Subscription {
            id,
            rx,
            registry: Arc::downgrade(&self.registry),
        }
    }

    pub fn unsubscribe(&self, id: &SubscriberId) -> bool {
        let removed = self.registry.subscribers.remove(id).is_some();
        if removed {
            info!(subscriber_id = %id, "subscriber disconnected");
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry.subscribers.len()
    }

    /// Deliver `event` to every subscriber without waiting. Full or closed
    /// subscribers are dropped. Returns the number of deliveries.
    pub fn publish(&self, event: PushEvent) -> usize {
        let event = Arc::new(event);
        let mut delivered = 0;
        let mut dead = Vec::new();

        for entry in self.registry.subscribers.iter() {
            match entry.value().try_send(Arc::clone(&event)) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(subscriber_id = %entry.key(), "subscriber queue full, disconnecting");
                    dead.push(entry.key().clone());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(entry.key().clone()),
            }
        }
        // Removal happens after iteration; DashMap shards are locked while iterating.
        for id in dead {
            let _ = self.unsubscribe(&id);
        }

        debug!(event_type = event.event_type(), delivered, "event published");
        delivered
    }
}

/// Receiving end of one subscriber. Unregisters itself on drop.
pub struct Subscription {
    id: SubscriberId,
    rx: mpsc::Receiver<Arc<PushEvent>>,
    registry: Weak<Registry>,
}

impl Subscription {
    pub fn id(&self) -> &SubscriberId {
        &self.id
    }

    /// Next event, or `None` once the broadcaster dropped this subscriber.
    pub async fn recv(&mut self) -> Option<Arc<PushEvent>> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Arc<PushEvent>> {
        self.rx.try_recv().ok()
    }
}

impl Stream for Subscription {
    type Item = Arc<PushEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            if registry.subscribers.remove(&self.id).is_some() {
                debug!(subscriber_id = %self.id, "subscription dropped");
            }
        }
    }
}
