//! # Message Subscriber
//!
//! Defines the subscription side of the bridge.
//!
//! A subscription is two halves with separate owners: the bounded delivery
//! queue, drained by the consumer's delivery loop, and the unsubscribe
//! handle, kept by whoever decides when the subscription ends.

use crate::queue::DeliveryReceiver;
use async_trait::async_trait;
use shared_types::{BridgeError, BridgeMessage, ChannelId};
use std::fmt;
use tracing::debug;

/// Trait for opening per-channel delivery subscriptions on the bus.
#[async_trait]
pub trait MessageSubscriber: Send + Sync {
    /// Subscribe to every message published on `channel`.
    ///
    /// # Returns
    ///
    /// A `Subscription` whose queue receives the channel's messages until
    /// the subscription is released.
    async fn subscribe(&self, channel: ChannelId) -> Result<Subscription, BridgeError>;
}

type ReleaseFn = Box<dyn FnOnce() + Send + Sync>;

/// Releases one bus subscription.
///
/// Releasing is idempotent: the first call runs the release action, later
/// calls do nothing. Dropping an unreleased handle releases it.
pub struct UnsubscribeHandle {
    channel: ChannelId,
    release: Option<ReleaseFn>,
}

impl UnsubscribeHandle {
    /// Create a handle that runs `release` exactly once.
    pub fn new(channel: ChannelId, release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            channel,
            release: Some(Box::new(release)),
        }
    }

    /// Release the subscription.
    ///
    /// Returns `true` if this call released it, `false` if it was already
    /// released.
    pub fn release(&mut self) -> bool {
        match self.release.take() {
            Some(release) => {
                release();
                debug!(channel = %self.channel, "Bus subscription released");
                true
            }
            None => false,
        }
    }

    /// True once the subscription has been released.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.release.is_none()
    }

    /// Channel this handle belongs to.
    #[must_use]
    pub fn channel(&self) -> ChannelId {
        self.channel
    }
}

impl Drop for UnsubscribeHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for UnsubscribeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnsubscribeHandle")
            .field("channel", &self.channel)
            .field("released", &self.is_released())
            .finish()
    }
}

/// An open bus subscription for one channel.
pub struct Subscription {
    channel: ChannelId,
    receiver: DeliveryReceiver,
    handle: UnsubscribeHandle,
}

impl Subscription {
    /// Assemble a subscription from its queue and release handle.
    #[must_use]
    pub fn new(channel: ChannelId, receiver: DeliveryReceiver, handle: UnsubscribeHandle) -> Self {
        Self {
            channel,
            receiver,
            handle,
        }
    }

    /// Receive the next delivered message.
    ///
    /// # Returns
    ///
    /// - `Some(message)` - The next message, in publish order
    /// - `None` - The subscription was released or the bus closed
    pub async fn recv(&mut self) -> Option<BridgeMessage> {
        self.receiver.recv().await
    }

    /// Take the next message if one is queued.
    pub fn try_recv(&mut self) -> Option<BridgeMessage> {
        self.receiver.try_recv()
    }

    /// Release the subscription. See [`UnsubscribeHandle::release`].
    pub fn unsubscribe(&mut self) -> bool {
        self.handle.release()
    }

    /// Messages discarded because the consumer fell behind.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.receiver.dropped()
    }

    /// Channel this subscription delivers.
    #[must_use]
    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    /// Split into the delivery queue and the release handle.
    #[must_use]
    pub fn into_parts(self) -> (DeliveryReceiver, UnsubscribeHandle) {
        (self.receiver, self.handle)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .field("queued", &self.receiver.len())
            .field("released", &self.handle.is_released())
            .finish()
    }
}
