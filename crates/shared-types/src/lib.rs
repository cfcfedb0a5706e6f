//! # Shared Types Crate
//!
//! This crate contains the identifiers, the bus envelope and the shared error
//! types used by the proxy core and the bridge.
//!
//! ## Design Principles
//!
//! - **Single Source of Truth**: All cross-crate types are defined here.
//! - **Opaque Payloads**: `BridgeMessage::payload` is never interpreted.
//! - **Redacted Secrets**: `Credential` never prints its value.

pub mod entities;
pub mod envelope;
pub mod errors;

pub use entities::*;
pub use envelope::*;
pub use errors::*;
