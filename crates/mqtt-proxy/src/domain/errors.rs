//! Domain Errors for the MQTT proxy
//!
//! `CodecError` describes why a frame could not be read or decoded.
//! `ProxyError` is the per-session error kind that drives refusals and
//! teardown.

use shared_types::{AuthError, ChannelId};
use thiserror::Error;

/// Errors reading or decoding a frame.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The peer closed the connection cleanly between frames.
    #[error("connection closed")]
    ConnectionClosed,

    /// The underlying socket failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Packet type 0 or 15 in the fixed header.
    #[error("invalid packet type {0}")]
    InvalidPacketType(u8),

    /// Remaining length used more than four bytes.
    #[error("malformed remaining length")]
    MalformedRemainingLength,

    /// Frame larger than the configured limit.
    #[error("frame of {size} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    /// The stream ended inside a frame.
    #[error("truncated frame")]
    Truncated,

    /// Fixed-header flags not allowed for this packet type.
    #[error("invalid flags {flags:#06b} for {packet}")]
    InvalidFlags { packet: &'static str, flags: u8 },

    /// PUBLISH with QoS 3.
    #[error("invalid QoS {0}")]
    InvalidQos(u8),

    /// CONNECT with an unknown protocol name or level.
    #[error("unsupported protocol {name} level {level}")]
    UnsupportedProtocol { name: String, level: u8 },

    /// The packet body does not match its type's layout.
    #[error("malformed packet: {0}")]
    Malformed(String),

    /// A string or binary field longer than its 16-bit length prefix allows.
    #[error("field of {0} bytes exceeds the 65535 byte limit")]
    FieldTooLong(usize),
}

/// Errors that can occur while handling one session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProxyError {
    /// Unparseable frame or topic.
    #[error("malformed data: {0}")]
    MalformedData(String),

    /// Bad credential or refused channel access.
    #[error("unauthorized")]
    Unauthorized,

    /// Unsubscribe of a channel without an active subscription.
    #[error("no subscription for channel {0}")]
    NotFound(ChannelId),

    /// Socket read or write failure on either side.
    #[error("transport error: {0}")]
    Transport(String),

    /// The identity service or the bus could not answer in time.
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// CONNECT refused because of its protocol name or level.
    #[error("unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    /// Packet not allowed in the session's current state.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The proxy is shutting down.
    #[error("proxy shutting down")]
    Shutdown,
}

impl ProxyError {
    /// True for outcomes that count as an authorization refusal.
    ///
    /// Indeterminate answers are refusals too.
    #[must_use]
    pub fn is_refusal(&self) -> bool {
        matches!(self, Self::Unauthorized | Self::UpstreamUnavailable(_))
    }
}

impl From<CodecError> for ProxyError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::ConnectionClosed => Self::Transport("connection closed by peer".into()),
            CodecError::Io(e) => Self::Transport(e.to_string()),
            CodecError::UnsupportedProtocol { name, level } => {
                Self::UnsupportedProtocol(format!("{name} level {level}"))
            }
            other => Self::MalformedData(other.to_string()),
        }
    }
}

impl From<AuthError> for ProxyError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Denied => Self::Unauthorized,
            AuthError::Unavailable(reason) => Self::UpstreamUnavailable(reason),
            AuthError::Timeout { timeout_ms } => {
                Self::UpstreamUnavailable(format!("identity service timed out after {timeout_ms}ms"))
            }
        }
    }
}
