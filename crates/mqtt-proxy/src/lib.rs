//! # MQTT Channel Proxy
//!
//! A transparent MQTT proxy that sits between IoT clients and a backend
//! broker. Each client gets its own broker connection; frames are relayed
//! verbatim except where authorization says otherwise.
//!
//! - **CONNECT** is authenticated against the identity service before it is
//!   forwarded. Refusals get a CONNACK and the connection is closed.
//! - **SUBSCRIBE** to `channels.<id>` needs read access. Authorized
//!   subscriptions also open a bus subscription whose messages are written
//!   back to the client.
//! - **PUBLISH** to `channels.<id>` needs write access. Authorized publishes
//!   are forwarded and mirrored to the bus; denied ones are dropped.
//!
//! ## Architecture
//!
//! The crate follows Hexagonal Architecture with:
//! - **Domain Layer:** Packet codec, channel topic grammar, session state
//! - **Ports Layer:** Identity and delivery traits, bus contract re-exports
//! - **Service Layer:** Per-session engine returning a verdict per frame
//! - **Adapters Layer:** Identity providers, session relay, TCP listener
//!
//! ## Example
//!
//! ```rust,no_run
//! use mqtt_proxy::{InMemoryIdentityProvider, Listener, ProxyConfig};
//! use shared_bus::InMemoryBridge;
//! use std::sync::Arc;
//! use tokio::sync::watch;
//!
//! # async fn run() -> std::io::Result<()> {
//! let identity = InMemoryIdentityProvider::new().with_thing("thing-key", "thing-1");
//! let listener = Listener::bind(
//!     ProxyConfig::default(),
//!     Arc::new(identity),
//!     Arc::new(InMemoryBridge::new()),
//! )
//! .await?;
//!
//! let (_shutdown, rx) = watch::channel(false);
//! listener.run(rx).await;
//! # Ok(())
//! # }
//! ```

#![allow(clippy::module_name_repetitions)]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod adapters;
pub mod config;
pub mod domain;
pub mod ports;
pub mod service;

// Domain
pub use domain::{
    delivery_topic, parse_channel_topic, read_frame, CodecError, Frame, Packet, PacketType,
    ProxyError, Session, SessionId, SessionState, CHANNEL_TOPIC_PREFIX, DELIVERY_TOPIC_PREFIX,
    DEFAULT_MAX_FRAME_SIZE,
};

// Ports
pub use ports::{DeliveryLauncher, IdentityProvider, MessageBridge};

// Service
pub use service::{SessionService, Verdict, DEFAULT_AUTH_TIMEOUT};

// Adapters
#[cfg(feature = "http")]
pub use adapters::HttpIdentityProvider;
pub use adapters::{
    run_session, InMemoryIdentityProvider, Listener, SessionContext, SessionReport, Teardown,
};

// Configuration
pub use config::{ConfigError, ProxyConfig};
