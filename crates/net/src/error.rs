//! Error taxonomy for the sync layer.

use crate::channel::ChannelKind;
use thiserror::Error;

/// Envelope layer a decode failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameLayer {
    /// Connection-level header.
    Header,
    /// Latency probe frame.
    Ping,
    /// Topic envelope.
    Topic,
    /// Data envelope.
    Data,
    /// Topic subscription frame.
    Subscription,
    /// Category payload.
    Payload,
}

impl FrameLayer {
    /// Short lowercase name for log lines.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Header => "header",
            Self::Ping => "ping",
            Self::Topic => "topic",
            Self::Data => "data",
            Self::Subscription => "subscription",
            Self::Payload => "payload",
        }
    }
}

impl std::fmt::Display for FrameLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by the codec and the connection.
#[derive(Debug, Error)]
pub enum CommsError {
    /// Bytes could not be decoded at the given layer. The frame is dropped.
    #[error("malformed {layer} frame: {reason}")]
    MalformedFrame {
        /// Layer that failed.
        layer: FrameLayer,
        /// What was wrong with the bytes.
        reason: String,
    },

    /// A send targeted a channel kind the connection does not have.
    #[error("no {0} channel available")]
    ChannelUnavailable(ChannelKind),

    /// The channel exists but refused the bytes (peer gone, link torn down).
    #[error("{0} channel closed")]
    ChannelClosed(ChannelKind),

    /// The connection was closed locally.
    #[error("connection closed")]
    Closed,

    /// A record could not be serialized.
    #[error("failed to encode payload: {0}")]
    Encode(#[from] postcard::Error),
}

impl CommsError {
    /// Shorthand for a [`CommsError::MalformedFrame`].
    pub fn malformed(layer: FrameLayer, reason: impl Into<String>) -> Self {
        Self::MalformedFrame {
            layer,
            reason: reason.into(),
        }
    }

    /// True for decode failures, which are dropped rather than surfaced.
    pub fn is_malformed(&self) -> bool {
        matches!(self, Self::MalformedFrame { .. })
    }
}
