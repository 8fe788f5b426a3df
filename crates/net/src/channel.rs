//! Boundary to the transport that owns the actual delivery channels.
//!
//! A transport exposes up to two independent delivery qualities: an ordered,
//! guaranteed channel and a best-effort, unordered one. How they are negotiated
//! (peer-to-peer, relay, QUIC streams vs datagrams) is the transport's business.

use crate::CommsError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Delivery quality of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ChannelKind {
    /// Ordered, lossless delivery.
    Reliable = 0,
    /// Unordered, best-effort delivery optimised for recency.
    Unreliable = 1,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Reliable => f.write_str("reliable"),
            ChannelKind::Unreliable => f.write_str("unreliable"),
        }
    }
}

/// Raw bytes delivered by a transport, tagged with the channel they arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    /// Channel the frame arrived on.
    pub channel: ChannelKind,
    /// Frame bytes.
    pub data: Vec<u8>,
}

impl ChannelMessage {
    /// Frame received on the reliable channel.
    pub fn reliable(data: Vec<u8>) -> Self {
        Self {
            channel: ChannelKind::Reliable,
            data,
        }
    }

    /// Frame received on the unreliable channel.
    pub fn unreliable(data: Vec<u8>) -> Self {
        Self {
            channel: ChannelKind::Unreliable,
            data,
        }
    }
}

/// An already-established pair of (optional) delivery channels.
///
/// Sends must not block: implementations queue the bytes and return. Inbound
/// frames are delivered separately as [`ChannelMessage`]s.
pub trait Channels: Send + Sync {
    /// Whether the ordered channel exists.
    fn has_reliable_channel(&self) -> bool;

    /// Whether the best-effort channel exists.
    fn has_unreliable_channel(&self) -> bool;

    /// Queue bytes on the ordered channel.
    fn send_reliable(&self, data: &[u8]) -> Result<(), CommsError>;

    /// Queue bytes on the best-effort channel.
    fn send_unreliable(&self, data: &[u8]) -> Result<(), CommsError>;

    /// Tear both channels down. Must tolerate repeated calls.
    fn close(&self);

    /// Whether a channel of `kind` exists.
    fn has_channel(&self, kind: ChannelKind) -> bool {
        match kind {
            ChannelKind::Reliable => self.has_reliable_channel(),
            ChannelKind::Unreliable => self.has_unreliable_channel(),
        }
    }

    /// Send on the channel of `kind`, failing with
    /// [`CommsError::ChannelUnavailable`] before touching the transport when it is absent.
    fn send(&self, kind: ChannelKind, data: &[u8]) -> Result<(), CommsError> {
        if !self.has_channel(kind) {
            return Err(CommsError::ChannelUnavailable(kind));
        }
        match kind {
            ChannelKind::Reliable => self.send_reliable(data),
            ChannelKind::Unreliable => self.send_unreliable(data),
        }
    }
}
