//! Ports Layer - trait definitions for the engine's external dependencies.

pub mod outbound;

pub use outbound::{
    DeliveryLauncher, IdentityProvider, MessageBridge, MessagePublisher, MessageSubscriber,
};
