//! # Delivery Queue
//!
//! Bounded, ordered queue between the bus and one subscription's consumer.
//!
//! ## Backpressure Policy: Drop-Oldest
//!
//! The producer side never blocks. When the queue is full the oldest queued
//! message is discarded and the queue's drop counter is incremented, so a
//! slow consumer can never stall the bus that feeds it.

use parking_lot::Mutex;
use shared_types::BridgeMessage;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Result of pushing a message into a delivery queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// The message was queued.
    Queued,
    /// The message was queued after evicting the oldest one.
    DroppedOldest,
    /// The queue is closed; the message was discarded.
    Closed,
}

struct QueueState {
    items: VecDeque<BridgeMessage>,
    closed: bool,
}

struct Shared {
    state: Mutex<QueueState>,
    notify: Notify,
    dropped: AtomicU64,
    capacity: usize,
}

impl Shared {
    fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_one();
    }
}

/// Create a delivery queue holding at most `capacity` messages.
///
/// A capacity of zero is raised to one.
#[must_use]
pub fn delivery_queue(capacity: usize) -> (DeliverySender, DeliveryReceiver) {
    let capacity = capacity.max(1);
    let shared = Arc::new(Shared {
        state: Mutex::new(QueueState {
            items: VecDeque::with_capacity(capacity),
            closed: false,
        }),
        notify: Notify::new(),
        dropped: AtomicU64::new(0),
        capacity,
    });
    (
        DeliverySender {
            shared: Arc::clone(&shared),
        },
        DeliveryReceiver { shared },
    )
}

/// Producer side of a delivery queue, held by the bus.
#[derive(Clone)]
pub struct DeliverySender {
    shared: Arc<Shared>,
}

impl DeliverySender {
    /// Push a message without blocking.
    pub fn push(&self, message: BridgeMessage) -> PushOutcome {
        let outcome = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return PushOutcome::Closed;
            }
            let outcome = if state.items.len() >= self.shared.capacity {
                state.items.pop_front();
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                PushOutcome::DroppedOldest
            } else {
                PushOutcome::Queued
            };
            state.items.push_back(message);
            outcome
        };
        self.shared.notify.notify_one();
        outcome
    }

    /// Close the queue. The consumer drains what is queued, then sees `None`.
    pub fn close(&self) {
        self.shared.close();
    }

    /// True once either side closed the queue.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }
}

/// Consumer side of a delivery queue, held by one delivery loop.
pub struct DeliveryReceiver {
    shared: Arc<Shared>,
}

impl DeliveryReceiver {
    /// Wait for the next message.
    ///
    /// Returns `None` once the queue is closed and drained.
    pub async fn recv(&mut self) -> Option<BridgeMessage> {
        loop {
            {
                let mut state = self.shared.state.lock();
                if let Some(message) = state.items.pop_front() {
                    return Some(message);
                }
                if state.closed {
                    return None;
                }
            }
            self.shared.notify.notified().await;
        }
    }

    /// Take the next message if one is queued.
    pub fn try_recv(&mut self) -> Option<BridgeMessage> {
        self.shared.state.lock().items.pop_front()
    }

    /// Number of messages discarded by the drop-oldest policy so far.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Number of queued messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.state.lock().items.len()
    }

    /// True if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}

impl Drop for DeliveryReceiver {
    fn drop(&mut self) {
        self.shared.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_types::{ChannelId, ThingId};
    use std::time::Duration;
    use tokio::time::timeout;

    fn msg(n: u8) -> BridgeMessage {
        BridgeMessage::new(ChannelId(1), "http", vec![n], ThingId::new("t"))
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let (tx, mut rx) = delivery_queue(4);
        tx.push(msg(1));
        tx.push(msg(2));
        assert_eq!(rx.recv().await.unwrap().payload, vec![1]);
        assert_eq!(rx.recv().await.unwrap().payload, vec![2]);
    }

    #[tokio::test]
    async fn test_drop_oldest_when_full() {
        let (tx, mut rx) = delivery_queue(2);
        assert_eq!(tx.push(msg(1)), PushOutcome::Queued);
        assert_eq!(tx.push(msg(2)), PushOutcome::Queued);
        assert_eq!(tx.push(msg(3)), PushOutcome::DroppedOldest);
        assert_eq!(tx.push(msg(4)), PushOutcome::DroppedOldest);

        assert_eq!(rx.dropped(), 2);
        assert_eq!(rx.len(), 2);
        assert_eq!(rx.recv().await.unwrap().payload, vec![3]);
        assert_eq!(rx.recv().await.unwrap().payload, vec![4]);
    }

    #[tokio::test]
    async fn test_recv_wakes_on_push() {
        let (tx, mut rx) = delivery_queue(8);
        let handle = tokio::spawn(async move { rx.recv().await });
        tokio::task::yield_now().await;
        tx.push(msg(9));
        let received = timeout(Duration::from_millis(200), handle)
            .await
            .expect("timeout")
            .expect("join");
        assert_eq!(received.unwrap().payload, vec![9]);
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let (tx, mut rx) = delivery_queue(8);
        tx.push(msg(1));
        tx.close();
        assert_eq!(tx.push(msg(2)), PushOutcome::Closed);
        assert_eq!(rx.recv().await.unwrap().payload, vec![1]);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_close_unblocks_waiting_consumer() {
        let (tx, mut rx) = delivery_queue(8);
        let handle = tokio::spawn(async move { rx.recv().await });
        tokio::task::yield_now().await;
        tx.close();
        let received = timeout(Duration::from_millis(200), handle)
            .await
            .expect("timeout")
            .expect("join");
        assert!(received.is_none());
    }

    #[test]
    fn test_dropping_receiver_closes_sender() {
        let (tx, rx) = delivery_queue(1);
        drop(rx);
        assert!(tx.is_closed());
        assert_eq!(tx.push(msg(1)), PushOutcome::Closed);
    }

    #[test]
    fn test_zero_capacity_is_raised() {
        let (_tx, rx) = delivery_queue(0);
        assert_eq!(rx.capacity(), 1);
    }
}
