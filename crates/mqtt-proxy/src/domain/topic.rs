//! Channel topic grammar.
//!
//! A channel topic is `<prefix><decimal u64>`, e.g. `channels.42`. Nothing
//! else resolves to a channel: no wildcards, no sign, no trailing segments.

use crate::domain::errors::ProxyError;
use shared_types::ChannelId;

/// Prefix of topics clients subscribe and publish on.
pub const CHANNEL_TOPIC_PREFIX: &str = "channels.";

/// Prefix of topics bus deliveries are written to.
///
/// Identical to [`CHANNEL_TOPIC_PREFIX`] so a client's own subscription
/// matches the delivered publish.
pub const DELIVERY_TOPIC_PREFIX: &str = "channels.";

/// Resolve a client topic to its channel.
pub fn parse_channel_topic(topic: &str) -> Result<ChannelId, ProxyError> {
    let malformed = || ProxyError::MalformedData(format!("invalid channel topic {topic:?}"));

    let id = topic.strip_prefix(CHANNEL_TOPIC_PREFIX).ok_or_else(malformed)?;
    if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }
    id.parse::<ChannelId>().map_err(|_| malformed())
}

/// Topic a bus delivery for `channel` is published on.
#[must_use]
pub fn delivery_topic(channel: ChannelId) -> String {
    format!("{DELIVERY_TOPIC_PREFIX}{channel}")
}
