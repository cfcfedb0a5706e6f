//! # Message Publisher
//!
//! Defines the publishing side of the bridge and the in-memory bus used by
//! tests and single-process deployments.

use crate::queue::{delivery_queue, DeliverySender, PushOutcome};
use crate::subscriber::{MessageSubscriber, Subscription, UnsubscribeHandle};
use crate::DEFAULT_QUEUE_CAPACITY;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use shared_types::{BridgeError, BridgeMessage, ChannelId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Trait for publishing messages onto the bus.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    /// Publish a message to every subscriber of its channel.
    ///
    /// # Arguments
    ///
    /// * `message` - The envelope to publish
    async fn publish(&self, message: BridgeMessage) -> Result<(), BridgeError>;
}

/// Both halves of the bridge contract.
pub trait MessageBridge: MessagePublisher + MessageSubscriber {}

impl<T: MessagePublisher + MessageSubscriber> MessageBridge for T {}

#[derive(Default)]
struct Routes {
    by_channel: HashMap<ChannelId, Vec<(u64, DeliverySender)>>,
}

/// In-memory implementation of the bridge.
///
/// Fans every published message out to the delivery queues of the channel's
/// live subscriptions. Publishes and subscribe/unsubscribe calls are
/// recorded so tests can assert on them.
pub struct InMemoryBridge {
    routes: Arc<RwLock<Routes>>,
    next_id: AtomicU64,
    capacity: usize,
    published: Mutex<Vec<BridgeMessage>>,
    subscribe_calls: Mutex<Vec<ChannelId>>,
    unsubscribe_calls: Arc<Mutex<Vec<ChannelId>>>,
    fail_publishes: AtomicBool,
    messages_published: AtomicU64,
}

impl InMemoryBridge {
    /// Create an in-memory bridge with the default queue capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Create an in-memory bridge whose subscriptions hold `capacity` messages.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            routes: Arc::new(RwLock::new(Routes::default())),
            next_id: AtomicU64::new(1),
            capacity,
            published: Mutex::new(Vec::new()),
            subscribe_calls: Mutex::new(Vec::new()),
            unsubscribe_calls: Arc::new(Mutex::new(Vec::new())),
            fail_publishes: AtomicBool::new(false),
            messages_published: AtomicU64::new(0),
        }
    }

    /// Make subsequent publishes fail with a transport error.
    pub fn set_fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }

    /// Every message accepted by `publish`, in order.
    #[must_use]
    pub fn published(&self) -> Vec<BridgeMessage> {
        self.published.lock().clone()
    }

    /// Channels passed to `subscribe`, in call order.
    #[must_use]
    pub fn subscribe_calls(&self) -> Vec<ChannelId> {
        self.subscribe_calls.lock().clone()
    }

    /// Channels whose subscriptions were released, in release order.
    #[must_use]
    pub fn unsubscribe_calls(&self) -> Vec<ChannelId> {
        self.unsubscribe_calls.lock().clone()
    }

    /// Number of live subscriptions on `channel`.
    #[must_use]
    pub fn subscriber_count(&self, channel: ChannelId) -> usize {
        self.routes
            .read()
            .by_channel
            .get(&channel)
            .map_or(0, Vec::len)
    }

    /// Total messages accepted by `publish`.
    #[must_use]
    pub fn messages_published(&self) -> u64 {
        self.messages_published.load(Ordering::Relaxed)
    }

    /// Deliver a message to local subscribers without recording a publish.
    ///
    /// Stands in for traffic produced by another service on the bus.
    pub fn inject(&self, message: BridgeMessage) -> usize {
        self.fan_out(&message)
    }

    fn fan_out(&self, message: &BridgeMessage) -> usize {
        let routes = self.routes.read();
        let Some(senders) = routes.by_channel.get(&message.channel) else {
            return 0;
        };
        let mut delivered = 0;
        for (id, sender) in senders {
            match sender.push(message.clone()) {
                PushOutcome::Queued => delivered += 1,
                PushOutcome::DroppedOldest => {
                    delivered += 1;
                    warn!(channel = %message.channel, subscription = id, "Delivery queue full, dropped oldest message");
                }
                PushOutcome::Closed => {}
            }
        }
        delivered
    }
}

impl Default for InMemoryBridge {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessagePublisher for InMemoryBridge {
    async fn publish(&self, message: BridgeMessage) -> Result<(), BridgeError> {
        if self.fail_publishes.load(Ordering::SeqCst) {
            return Err(BridgeError::Transport("publish rejected".into()));
        }
        self.published.lock().push(message.clone());
        self.messages_published.fetch_add(1, Ordering::Relaxed);
        let receivers = self.fan_out(&message);
        debug!(channel = %message.channel, protocol = %message.protocol, receivers, "Message published");
        Ok(())
    }
}

#[async_trait]
impl MessageSubscriber for InMemoryBridge {
    async fn subscribe(&self, channel: ChannelId) -> Result<Subscription, BridgeError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = delivery_queue(self.capacity);

        self.routes
            .write()
            .by_channel
            .entry(channel)
            .or_default()
            .push((id, sender.clone()));
        self.subscribe_calls.lock().push(channel);
        debug!(%channel, subscription = id, "New subscription created");

        let routes = Arc::clone(&self.routes);
        let unsubscribe_calls = Arc::clone(&self.unsubscribe_calls);
        let handle = UnsubscribeHandle::new(channel, move || {
            let mut routes = routes.write();
            if let Some(senders) = routes.by_channel.get_mut(&channel) {
                senders.retain(|(sid, _)| *sid != id);
                if senders.is_empty() {
                    routes.by_channel.remove(&channel);
                }
            }
            sender.close();
            unsubscribe_calls.lock().push(channel);
        });

        Ok(Subscription::new(channel, receiver, handle))
    }
}
