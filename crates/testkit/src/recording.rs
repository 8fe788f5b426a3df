//! Channel double that records every write.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use worldcomms_net::{ChannelKind, ChannelMessage, Channels, CommsError};

/// Channels that accept writes on the configured kinds and keep them for inspection.
pub struct RecordingChannels {
    reliable: bool,
    unreliable: bool,
    closed: AtomicBool,
    writes: Mutex<Vec<ChannelMessage>>,
}

impl RecordingChannels {
    /// Channels with the given kinds present.
    pub fn new(reliable: bool, unreliable: bool) -> Self {
        Self {
            reliable,
            unreliable,
            closed: AtomicBool::new(false),
            writes: Mutex::new(Vec::new()),
        }
    }

    /// Every frame written so far, in order.
    pub fn writes(&self) -> Vec<ChannelMessage> {
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Frames written on `kind`.
    pub fn writes_on(&self, kind: ChannelKind) -> Vec<Vec<u8>> {
        self.writes()
            .into_iter()
            .filter(|message| message.channel == kind)
            .map(|message| message.data)
            .collect()
    }

    /// Whether [`Channels::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn record(&self, channel: ChannelKind, present: bool, data: &[u8]) -> Result<(), CommsError> {
        if !present {
            return Err(CommsError::ChannelUnavailable(channel));
        }
        if self.is_closed() {
            return Err(CommsError::ChannelClosed(channel));
        }
        self.writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ChannelMessage {
                channel,
                data: data.to_vec(),
            });
        Ok(())
    }
}

impl Channels for RecordingChannels {
    fn has_reliable_channel(&self) -> bool {
        self.reliable
    }

    fn has_unreliable_channel(&self) -> bool {
        self.unreliable
    }

    fn send_reliable(&self, data: &[u8]) -> Result<(), CommsError> {
        self.record(ChannelKind::Reliable, self.reliable, data)
    }

    fn send_unreliable(&self, data: &[u8]) -> Result<(), CommsError> {
        self.record(ChannelKind::Unreliable, self.unreliable, data)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
