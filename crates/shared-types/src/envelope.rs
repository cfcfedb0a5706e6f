//! # Bridge Message Envelope
//!
//! The envelope every message carries on the internal bus.
//!
//! ## Echo Suppression
//!
//! The `protocol` tag records which adapter produced the message. A consumer
//! drops messages carrying its own tag so a device never receives what it
//! just published.

use crate::entities::{ChannelId, ThingId};
use crate::errors::EnvelopeError;
use serde::{Deserialize, Serialize};

/// Protocol tag written by the MQTT proxy.
pub const PROTOCOL_MQTT: &str = "mqtt";

/// Protocol tag written by the HTTP adapter.
pub const PROTOCOL_HTTP: &str = "http";

/// Protocol tag written by the LoRa adapter.
pub const PROTOCOL_LORA: &str = "lora";

/// A message published to, or delivered from, the internal bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeMessage {
    /// Channel the message belongs to.
    pub channel: ChannelId,
    /// Adapter that produced the message.
    pub protocol: String,
    /// Opaque payload, never interpreted by the proxy.
    pub payload: Vec<u8>,
    /// Identity of the publishing thing.
    pub publisher: ThingId,
}

impl BridgeMessage {
    /// Create a new envelope.
    pub fn new(
        channel: ChannelId,
        protocol: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        publisher: ThingId,
    ) -> Self {
        Self {
            channel,
            protocol: protocol.into(),
            payload: payload.into(),
            publisher,
        }
    }

    /// True if this message was produced by the given protocol adapter.
    #[must_use]
    pub fn is_from(&self, protocol: &str) -> bool {
        self.protocol == protocol
    }

    /// Encode for transmission on a network bus.
    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        bincode::serialize(self).map_err(|e| EnvelopeError::Encode(e.to_string()))
    }

    /// Decode a message received from a network bus.
    pub fn from_bytes(data: &[u8]) -> Result<Self, EnvelopeError> {
        bincode::deserialize(data).map_err(|e| EnvelopeError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_bytes_preserve_payload() {
        let msg = BridgeMessage::new(ChannelId(42), PROTOCOL_HTTP, vec![0, 1, 2, 255], ThingId::new("7"));
        let decoded = BridgeMessage::from_bytes(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_garbage_is_rejected() {
        let err = BridgeMessage::from_bytes(&[0xff]).unwrap_err();
        assert!(matches!(err, EnvelopeError::Decode(_)));
    }

    #[test]
    fn test_is_from() {
        let msg = BridgeMessage::new(ChannelId(1), PROTOCOL_MQTT, Vec::new(), ThingId::default());
        assert!(msg.is_from(PROTOCOL_MQTT));
        assert!(!msg.is_from(PROTOCOL_HTTP));
    }
}
