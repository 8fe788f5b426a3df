//! Loopback message broker.
//!
//! Stands in for the remote relay: it hands out aliases, echoes latency probes, keeps
//! each peer's topic subscriptions and fans topic messages out to subscribers as data
//! frames. Delivery is synchronous, so a frame sent by one peer is already queued for
//! the others when the send returns.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, trace, warn};
use worldcomms_net::{
    decode_header, decode_subscription, decode_topic_envelope, encode_data_envelope,
    ChannelKind, ChannelMessage, Channels, CommsError, MessageKind,
};

struct Peer {
    reliable: bool,
    unreliable: bool,
    topics: BTreeSet<String>,
    inbound: UnboundedSender<ChannelMessage>,
}

impl Peer {
    fn accepts(&self, kind: ChannelKind) -> bool {
        match kind {
            ChannelKind::Reliable => self.reliable,
            ChannelKind::Unreliable => self.unreliable,
        }
    }
}

#[derive(Default)]
struct BrokerState {
    next_alias: u64,
    peers: BTreeMap<String, Peer>,
    routed: u64,
}

/// Shared handle to an in-process relay. Clones refer to the same broker.
#[derive(Clone, Default)]
pub struct LocalBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl LocalBroker {
    /// Empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer with the given channel set.
    ///
    /// Returns the peer's channels, the queue its inbound frames arrive on and the
    /// alias other peers see it under.
    pub fn connect(
        &self,
        reliable: bool,
        unreliable: bool,
    ) -> (Arc<LoopbackChannels>, UnboundedReceiver<ChannelMessage>, String) {
        let (tx, rx) = unbounded_channel();
        let mut state = self.lock();
        state.next_alias += 1;
        let alias = state.next_alias.to_string();
        state.peers.insert(
            alias.clone(),
            Peer {
                reliable,
                unreliable,
                topics: BTreeSet::new(),
                inbound: tx,
            },
        );
        drop(state);
        debug!(%alias, reliable, unreliable, "peer connected to broker");

        let channels = Arc::new(LoopbackChannels {
            alias: alias.clone(),
            reliable,
            unreliable,
            closed: AtomicBool::new(false),
            broker: self.clone(),
        });
        (channels, rx, alias)
    }

    /// Number of connected peers.
    pub fn peer_count(&self) -> usize {
        self.lock().peers.len()
    }

    /// Topics `alias` is currently subscribed to.
    pub fn subscriptions(&self, alias: &str) -> Option<BTreeSet<String>> {
        self.lock().peers.get(alias).map(|peer| peer.topics.clone())
    }

    /// Data frames delivered to subscribers so far.
    pub fn routed_frames(&self) -> u64 {
        self.lock().routed
    }

    fn disconnect(&self, alias: &str) {
        if self.lock().peers.remove(alias).is_some() {
            debug!(%alias, "peer left broker");
        }
    }

    fn route(&self, from: &str, kind: ChannelKind, data: &[u8]) {
        let header = match decode_header(data) {
            Ok(header) => header,
            Err(err) => {
                warn!(%from, "Broker dropping frame: {err}");
                return;
            }
        };
        let mut state = self.lock();
        match header.kind() {
            Some(MessageKind::Ping) => {
                if let Some(peer) = state.peers.get(from) {
                    deliver(peer, kind, data.to_vec());
                }
            }
            Some(MessageKind::TopicSubscription) => match decode_subscription(data) {
                Ok(topics) => {
                    if let Some(peer) = state.peers.get_mut(from) {
                        trace!(%from, topics = topics.len(), "subscriptions replaced");
                        peer.topics = topics.into_iter().collect();
                    }
                }
                Err(err) => warn!(%from, "Broker dropping subscription: {err}"),
            },
            Some(MessageKind::Topic) => {
                let frame = match decode_topic_envelope(data) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!(%from, "Broker dropping topic message: {err}");
                        return;
                    }
                };
                let relayed = encode_data_envelope(from, frame.body);
                let mut routed = 0;
                for (alias, peer) in &state.peers {
                    if alias == from || !peer.topics.contains(frame.topic) {
                        continue;
                    }
                    if !peer.accepts(kind) {
                        trace!(%alias, %kind, "subscriber lacks channel; skipping");
                        continue;
                    }
                    if deliver(peer, kind, relayed.clone()) {
                        routed += 1;
                    }
                }
                state.routed += routed;
            }
            _ => debug!(%from, tag = header.tag, "Broker ignoring message kind"),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn deliver(peer: &Peer, kind: ChannelKind, data: Vec<u8>) -> bool {
    peer.inbound
        .send(ChannelMessage {
            channel: kind,
            data,
        })
        .is_ok()
}

/// One peer's end of the broker.
pub struct LoopbackChannels {
    alias: String,
    reliable: bool,
    unreliable: bool,
    closed: AtomicBool,
    broker: LocalBroker,
}

impl LoopbackChannels {
    /// Alias assigned by the broker.
    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Whether [`Channels::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn write(&self, kind: ChannelKind, data: &[u8]) -> Result<(), CommsError> {
        if self.is_closed() {
            return Err(CommsError::ChannelClosed(kind));
        }
        self.broker.route(&self.alias, kind, data);
        Ok(())
    }
}

impl Channels for LoopbackChannels {
    fn has_reliable_channel(&self) -> bool {
        self.reliable && !self.is_closed()
    }

    fn has_unreliable_channel(&self) -> bool {
        self.unreliable && !self.is_closed()
    }

    fn send_reliable(&self, data: &[u8]) -> Result<(), CommsError> {
        if !self.reliable {
            return Err(CommsError::ChannelUnavailable(ChannelKind::Reliable));
        }
        self.write(ChannelKind::Reliable, data)
    }

    fn send_unreliable(&self, data: &[u8]) -> Result<(), CommsError> {
        if !self.unreliable {
            return Err(CommsError::ChannelUnavailable(ChannelKind::Unreliable));
        }
        self.write(ChannelKind::Unreliable, data)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.broker.disconnect(&self.alias);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use worldcomms_net::{decode_data_envelope, encode_ping, encode_subscription};
    use worldcomms_net::encode_topic_envelope;

    #[test]
    fn aliases_are_unique() {
        let broker = LocalBroker::new();
        let (_, _, a) = broker.connect(true, true);
        let (_, _, b) = broker.connect(true, false);
        assert_ne!(a, b);
        assert_eq!(broker.peer_count(), 2);
    }

    #[test]
    fn ping_echoes_on_arrival_channel() {
        let broker = LocalBroker::new();
        let (channels, mut rx, _) = broker.connect(true, true);
        let frame = encode_ping(42);
        channels.send_unreliable(&frame).unwrap();
        let echoed = rx.try_recv().unwrap();
        assert_eq!(echoed.channel, ChannelKind::Unreliable);
        assert_eq!(echoed.data, frame);
    }

    #[test]
    fn topic_reaches_only_subscribers() {
        let broker = LocalBroker::new();
        let (sender, mut sender_rx, sender_alias) = broker.connect(true, true);
        let (listener, mut listener_rx, listener_alias) = broker.connect(true, true);
        let (_, mut idle_rx, _) = broker.connect(true, true);

        listener
            .send_reliable(&encode_subscription(["37:37"]))
            .unwrap();
        sender
            .send_reliable(&encode_subscription(["37:37"]))
            .unwrap();
        assert_eq!(
            broker.subscriptions(&listener_alias).unwrap(),
            BTreeSet::from(["37:37".to_owned()])
        );

        sender
            .send_reliable(&encode_topic_envelope(MessageKind::Topic, "37:37", b"body"))
            .unwrap();

        let message = listener_rx.try_recv().unwrap();
        assert_eq!(message.channel, ChannelKind::Reliable);
        let frame = decode_data_envelope(&message.data).unwrap();
        assert_eq!(frame.from_alias, sender_alias);
        assert_eq!(frame.body, b"body");
        assert!(sender_rx.try_recv().is_err());
        assert!(idle_rx.try_recv().is_err());
        assert_eq!(broker.routed_frames(), 1);
    }

    #[test]
    fn unreliable_topic_skips_reliable_only_subscribers() {
        let broker = LocalBroker::new();
        let (sender, _sender_rx, _) = broker.connect(true, true);
        let (listener, mut listener_rx, _) = broker.connect(true, false);
        listener
            .send_reliable(&encode_subscription(["1:1"]))
            .unwrap();
        sender
            .send_unreliable(&encode_topic_envelope(MessageKind::Topic, "1:1", b"x"))
            .unwrap();
        assert!(listener_rx.try_recv().is_err());
    }

    #[test]
    fn closed_channels_refuse_writes_and_leave_broker() {
        let broker = LocalBroker::new();
        let (channels, _rx, _) = broker.connect(true, true);
        channels.close();
        channels.close();
        assert_eq!(broker.peer_count(), 0);
        assert!(!channels.has_reliable_channel());
        assert!(matches!(
            channels.send_reliable(b"\x01"),
            Err(CommsError::ChannelClosed(ChannelKind::Reliable))
        ));
    }

    #[test]
    fn missing_channel_reports_unavailable() {
        let broker = LocalBroker::new();
        let (channels, _rx, _) = broker.connect(true, false);
        assert!(matches!(
            channels.send_unreliable(&encode_ping(1)),
            Err(CommsError::ChannelUnavailable(ChannelKind::Unreliable))
        ));
    }
}
