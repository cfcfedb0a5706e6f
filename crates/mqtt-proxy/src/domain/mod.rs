//! # Domain Layer
//!
//! Pure proxy logic: the packet codec, the channel topic grammar, session
//! lifecycle state and error kinds. No sockets, no identity service, no bus.

pub mod codec;
pub mod errors;
pub mod session;
pub mod topic;

pub use codec::{
    encode_connack, encode_connect, encode_disconnect, encode_pingreq, encode_publish,
    encode_suback, encode_subscribe, encode_unsubscribe, read_frame, ConnackCode, ConnectPacket,
    Frame, Packet, PacketType, PublishPacket, SubscribePacket, UnsubscribePacket,
    DEFAULT_MAX_FRAME_SIZE, MAX_REMAINING_LENGTH, SUBACK_FAILURE,
};
pub use errors::{CodecError, ProxyError};
pub use session::{Session, SessionId, SessionState};
pub use topic::{
    delivery_topic, parse_channel_topic, CHANNEL_TOPIC_PREFIX, DELIVERY_TOPIC_PREFIX,
};
