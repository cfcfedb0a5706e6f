//! # Session Service
//!
//! Per-connection engine that inspects each client frame and returns a
//! [`Verdict`] for the relay.
//!
//! - CONNECT is checked against the identity service before it reaches the
//!   broker
//! - SUBSCRIBE and PUBLISH are authorized per channel
//! - Authorized publishes are mirrored to the bus
//! - Authorized subscriptions open a bus subscription whose deliveries are
//!   written back to the client by a launched delivery loop
//!
//! Identity calls are bounded by the authorization timeout and fail closed.

mod core;

pub use core::{SessionService, Verdict, DEFAULT_AUTH_TIMEOUT};
