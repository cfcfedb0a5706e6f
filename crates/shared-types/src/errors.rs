//! # Error Types
//!
//! Defines error types shared between the proxy core and the bridge.

use thiserror::Error;

/// Errors returned by the identity/authorization contract.
///
/// The proxy treats every variant as a refusal (fail-closed); the variants
/// only differ in how they are logged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// The credential or channel access was explicitly refused.
    #[error("access denied")]
    Denied,

    /// The identity service could not be reached or answered garbage.
    #[error("identity service unavailable: {0}")]
    Unavailable(String),

    /// The identity service did not answer within the configured timeout.
    #[error("identity service timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
}

/// Errors returned by the bridge contract.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// The bus connection is closed.
    #[error("bus connection closed")]
    Closed,

    /// The bus rejected or failed the operation.
    #[error("bus transport error: {0}")]
    Transport(String),

    /// The envelope could not be encoded or decoded.
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

/// Errors encoding or decoding the bus envelope.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvelopeError {
    /// Serialization failed.
    #[error("failed to encode bridge message: {0}")]
    Encode(String),

    /// Deserialization failed.
    #[error("failed to decode bridge message: {0}")]
    Decode(String),
}
