//! # Shared Bus - Bridge to the Internal Message Bus
//!
//! The capability the proxy uses to mirror device publishes onto the
//! internal bus and to receive other services' messages for its clients.
//!
//! ## Contract
//!
//! ```text
//! ┌──────────────┐   publish(msg)    ┌──────────────┐
//! │   Session    │ ────────────────► │     Bus      │
//! │              │                   │              │
//! │  delivery    │ ◄──────────────── │  channel.N   │
//! │    loop      │   DeliveryQueue   │              │
//! └──────────────┘                   └──────────────┘
//!        │ release()
//!        └────────► UnsubscribeHandle (runs once, also on drop)
//! ```
//!
//! ## Implementations
//!
//! - [`InMemoryBridge`]: in-process fan-out, records every call.
//! - [`NatsBridge`]: NATS via the `async-nats` client, with reconnects.
//!
//! ## Backpressure
//!
//! Every subscription owns a bounded [`DeliveryReceiver`]. When it is full
//! the oldest message is dropped and counted; publishers never wait on a
//! slow consumer.

// Nursery lints that are too strict
#![allow(clippy::missing_const_for_fn)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod nats;
pub mod publisher;
pub mod queue;
pub mod subscriber;

// Re-export main types
pub use nats::{subject_for, NatsBridge};
pub use publisher::{InMemoryBridge, MessageBridge, MessagePublisher};
pub use queue::{delivery_queue, DeliveryReceiver, DeliverySender, PushOutcome};
pub use subscriber::{MessageSubscriber, Subscription, UnsubscribeHandle};

/// Messages buffered per subscription before the oldest is dropped.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;
