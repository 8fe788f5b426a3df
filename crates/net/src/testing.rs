//! In-crate channel double for unit tests.

use crate::channel::{ChannelKind, Channels};
use crate::CommsError;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

pub(crate) struct MockChannels {
    reliable: bool,
    unreliable: bool,
    reliable_writes: Mutex<Vec<Vec<u8>>>,
    unreliable_writes: Mutex<Vec<Vec<u8>>>,
    pub(crate) closes: AtomicUsize,
    pub(crate) fail_sends: AtomicBool,
}

impl MockChannels {
    pub(crate) fn new(reliable: bool, unreliable: bool) -> Self {
        Self {
            reliable,
            unreliable,
            reliable_writes: Mutex::new(Vec::new()),
            unreliable_writes: Mutex::new(Vec::new()),
            closes: AtomicUsize::new(0),
            fail_sends: AtomicBool::new(false),
        }
    }

    pub(crate) fn both() -> Self {
        Self::new(true, true)
    }

    pub(crate) fn reliable_only() -> Self {
        Self::new(true, false)
    }

    pub(crate) fn unreliable_only() -> Self {
        Self::new(false, true)
    }

    pub(crate) fn reliable_writes(&self) -> Vec<Vec<u8>> {
        self.reliable_writes.lock().unwrap().clone()
    }

    pub(crate) fn unreliable_writes(&self) -> Vec<Vec<u8>> {
        self.unreliable_writes.lock().unwrap().clone()
    }

    fn record(&self, kind: ChannelKind, data: &[u8]) -> Result<(), CommsError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(CommsError::ChannelClosed(kind));
        }
        let log = match kind {
            ChannelKind::Reliable => &self.reliable_writes,
            ChannelKind::Unreliable => &self.unreliable_writes,
        };
        log.lock().unwrap().push(data.to_vec());
        Ok(())
    }
}

impl Channels for MockChannels {
    fn has_reliable_channel(&self) -> bool {
        self.reliable
    }

    fn has_unreliable_channel(&self) -> bool {
        self.unreliable
    }

    fn send_reliable(&self, data: &[u8]) -> Result<(), CommsError> {
        self.record(ChannelKind::Reliable, data)
    }

    fn send_unreliable(&self, data: &[u8]) -> Result<(), CommsError> {
        self.record(ChannelKind::Unreliable, data)
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}
