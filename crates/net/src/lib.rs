#![warn(missing_docs)]
//! Spatial state-sync layer: wire codec, topic routing, dual-channel delivery,
//! latency probing and traffic accounting over already-established channels.

mod channel;
pub mod codec;
mod connection;
mod error;
mod ping;
mod stats;
mod subscription;

#[cfg(test)]
mod testing;

pub use channel::{ChannelKind, ChannelMessage, Channels};
pub use codec::{
    check_subscription_topic, decode_chat, decode_data_envelope, decode_data_header,
    decode_header, decode_payload, decode_ping, decode_position, decode_profile,
    decode_scene_message, decode_subscription, decode_topic_envelope, encode_data_envelope,
    encode_header, encode_payload, encode_ping, encode_subscription, encode_topic_envelope,
    Category, ChatData, DataFrame, DataHeader, Header, MessageKind, Payload, PositionData,
    ProfileData, TopicFrame,
};
pub use connection::{Connection, ConnectionConfig, Dispatch, Handler};
pub use error::{CommsError, FrameLayer};
pub use ping::{emit_probe, spawn_probe, LatencyProbe};
pub use stats::{BucketTotals, TrafficBucket, TrafficCounters, TrafficSnapshot, TrafficStats};
pub use subscription::{SubscriptionManager, SubscriptionSink, SubscriptionState};
