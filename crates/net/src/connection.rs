//! High-level connection: typed sends, layered inbound decode, handler dispatch.
//!
//! A [`Connection`] is bound to one already-established [`Channels`] instance. It
//! owns the latency probe task for its lifetime and releases both the task and the
//! channels on [`Connection::close`] (or drop).

use crate::channel::{ChannelKind, ChannelMessage, Channels};
use crate::codec::{
    check_subscription_topic, decode_data_envelope, decode_data_header, decode_header,
    decode_payload, decode_ping, decode_topic_envelope, encode_payload, encode_subscription,
    encode_topic_envelope, Category, ChatData, MessageKind, Payload, PositionData, ProfileData,
};
use crate::ping::{spawn_probe, LatencyProbe};
use crate::stats::{TrafficBucket, TrafficStats};
use crate::subscription::SubscriptionSink;
use crate::CommsError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use worldcomms_core::{now_millis, topic_for, GridConfig, Position, Topic, UserProfile};

/// Callback for one payload category, invoked with the sender alias.
///
/// Returning an error only logs it; later frames are still dispatched.
pub type Handler<T> = Box<dyn FnMut(&str, T) -> anyhow::Result<()> + Send>;

/// Connection tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Period between latency probes, in milliseconds.
    pub ping_interval_ms: u64,
    /// Grid geometry used to derive position topics.
    pub grid: GridConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: 10_000,
            grid: GridConfig::default(),
        }
    }
}

impl ConnectionConfig {
    /// Probe period as a duration.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }
}

/// What happened to one inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Latency probe echo; the estimate was updated.
    Ping,
    /// Payload decoded and handed to the registered handler.
    Delivered(Category),
    /// Payload decoded but no handler is registered for it.
    Unhandled(Category),
    /// Unknown kind or category; counted as other traffic.
    Ignored,
    /// Malformed, or received after close.
    Dropped,
}

/// Sync-layer connection over a pair of delivery channels.
pub struct Connection {
    channels: Arc<dyn Channels>,
    config: ConnectionConfig,
    stats: Option<Arc<dyn TrafficStats>>,
    latency: Arc<LatencyProbe>,
    probe_task: Option<JoinHandle<()>>,
    closed: bool,
    position_handler: Option<Handler<PositionData>>,
    profile_handler: Option<Handler<ProfileData>>,
    chat_handler: Option<Handler<ChatData>>,
    scene_message_handler: Option<Handler<ChatData>>,
}

impl Connection {
    /// Bind a connection to `channels` and start latency probing.
    ///
    /// Probing runs on the ambient tokio runtime; without one the connection still
    /// works but never measures latency.
    pub fn new(
        channels: Arc<dyn Channels>,
        config: ConnectionConfig,
        stats: Option<Arc<dyn TrafficStats>>,
    ) -> Self {
        let latency = Arc::new(LatencyProbe::new());
        let probe_task = match tokio::runtime::Handle::try_current() {
            Ok(_) => Some(spawn_probe(
                channels.clone(),
                latency.clone(),
                stats.clone(),
                config.ping_interval(),
            )),
            Err(_) => {
                warn!("No tokio runtime; latency probing disabled");
                None
            }
        };
        debug!(
            reliable = channels.has_reliable_channel(),
            unreliable = channels.has_unreliable_channel(),
            "Connection created"
        );
        Self {
            channels,
            config,
            stats,
            latency,
            probe_task,
            closed: false,
            position_handler: None,
            profile_handler: None,
            chat_handler: None,
            scene_message_handler: None,
        }
    }

    /// Configuration this connection was created with.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Latest round-trip estimate, `None` when unknown.
    pub fn latency(&self) -> Option<Duration> {
        self.latency.current()
    }

    /// Whether [`Connection::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Register (or clear with `None`) the position handler.
    pub fn set_position_handler(&mut self, handler: Option<Handler<PositionData>>) {
        self.position_handler = handler;
    }

    /// Register (or clear with `None`) the profile handler.
    pub fn set_profile_handler(&mut self, handler: Option<Handler<ProfileData>>) {
        self.profile_handler = handler;
    }

    /// Register (or clear with `None`) the chat handler.
    pub fn set_chat_handler(&mut self, handler: Option<Handler<ChatData>>) {
        self.chat_handler = handler;
    }

    /// Register (or clear with `None`) the scene message handler.
    pub fn set_scene_message_handler(&mut self, handler: Option<Handler<ChatData>>) {
        self.scene_message_handler = handler;
    }

    /// Broadcast a pose sample on the unreliable channel.
    ///
    /// Returns the size of the frame handed to the channel.
    pub fn send_position(&self, position: &Position) -> Result<usize, CommsError> {
        let topic = topic_for(position, &self.config.grid);
        let payload = Payload::Position(PositionData {
            time_millis: now_millis(),
            position: *position,
        });
        self.send_topic_message(ChannelKind::Unreliable, &topic, &payload)
    }

    /// Announce the local profile to peers near `position` on the reliable channel.
    pub fn send_profile(
        &self,
        position: &Position,
        profile: &UserProfile,
    ) -> Result<usize, CommsError> {
        let topic = topic_for(position, &self.config.grid);
        let payload = Payload::Profile(ProfileData {
            time_millis: now_millis(),
            avatar_type: profile.avatar_type.clone(),
            display_name: profile.display_name.clone(),
            public_key: profile.public_key.clone(),
        });
        self.send_topic_message(ChannelKind::Reliable, &topic, &payload)
    }

    /// Send a chat line to peers near `position` on the reliable channel.
    pub fn send_chat(
        &self,
        position: &Position,
        message_id: &str,
        text: &str,
    ) -> Result<usize, CommsError> {
        let topic = topic_for(position, &self.config.grid);
        let payload = Payload::Chat(ChatData {
            time_millis: now_millis(),
            message_id: message_id.to_owned(),
            text: text.to_owned(),
        });
        self.send_topic_message(ChannelKind::Reliable, &topic, &payload)
    }

    /// Send a scene message on the reliable channel. The scene id is the topic.
    pub fn send_scene_message(&self, scene_id: &str, text: &str) -> Result<usize, CommsError> {
        let payload = Payload::SceneMessage(ChatData {
            time_millis: now_millis(),
            message_id: scene_id.to_owned(),
            text: text.to_owned(),
        });
        self.send_topic_message(ChannelKind::Reliable, &Topic::from(scene_id), &payload)
    }

    /// Encode `payload` in a TOPIC envelope and hand it to the `kind` channel.
    ///
    /// Fails with [`CommsError::ChannelUnavailable`] before encoding anything when
    /// the channel is absent.
    pub fn send_topic_message(
        &self,
        kind: ChannelKind,
        topic: &Topic,
        payload: &Payload,
    ) -> Result<usize, CommsError> {
        self.ensure_sendable(kind)?;
        let body = encode_payload(payload)?;
        let frame = encode_topic_envelope(MessageKind::Topic, topic.as_str(), &body);
        self.channels.send(kind, &frame)?;
        trace!(%topic, %kind, bytes = frame.len(), "sent topic message");
        self.account_sent(payload.category(), frame.len());
        Ok(frame.len())
    }

    /// Announce the full set of topics this peer wants to receive.
    pub fn update_subscriptions(&self, topics: &BTreeSet<Topic>) -> Result<(), CommsError> {
        self.ensure_sendable(ChannelKind::Reliable)?;
        for topic in topics {
            check_subscription_topic(topic.as_str())?;
        }
        let frame = encode_subscription(topics.iter().map(Topic::as_str));
        self.channels.send(ChannelKind::Reliable, &frame)?;
        debug!(topics = topics.len(), "updated topic subscriptions");
        Ok(())
    }

    /// Stop probing and close the channels. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Some(task) = self.probe_task.take() {
            task.abort();
        }
        self.channels.close();
        info!("Connection closed");
    }

    /// Decode and dispatch one inbound frame.
    ///
    /// Never fails: malformed frames are logged and dropped, unknown kinds and
    /// categories are counted as other traffic, handler failures are logged.
    pub fn handle_message(&mut self, message: &ChannelMessage) -> Dispatch {
        if self.closed {
            trace!(channel = %message.channel, "dropping frame received after close");
            return Dispatch::Dropped;
        }
        let size = message.data.len();
        let header = match decode_header(&message.data) {
            Ok(header) => header,
            Err(err) => {
                warn!(channel = %message.channel, size, "Cannot decode frame header: {err}");
                return Dispatch::Dropped;
            }
        };

        match header.kind() {
            Some(MessageKind::Ping) => self.handle_ping(message),
            Some(MessageKind::Data) => {
                let dispatch = match decode_data_envelope(&message.data) {
                    Ok(frame) => self.dispatch_payload(frame.from_alias, frame.body, message),
                    Err(err) => drop_frame(message, &err),
                };
                self.account_recv_payload(dispatch, size);
                dispatch
            }
            Some(MessageKind::Topic) => {
                let dispatch = match decode_topic_envelope(&message.data)
                    .and_then(|topic| decode_data_envelope(topic.body))
                {
                    Ok(frame) => self.dispatch_payload(frame.from_alias, frame.body, message),
                    Err(err) => drop_frame(message, &err),
                };
                self.account_recv_payload(dispatch, size);
                dispatch
            }
            Some(MessageKind::Unknown | MessageKind::TopicSubscription) | None => {
                self.account_recv(TrafficBucket::Others, size);
                debug!(tag = header.tag, channel = %message.channel, "Ignoring message kind");
                Dispatch::Ignored
            }
        }
    }

    /// Dispatch up to `max` queued frames without waiting. Returns how many were handled.
    pub fn drain_inbound(
        &mut self,
        inbound: &mut UnboundedReceiver<ChannelMessage>,
        max: usize,
    ) -> usize {
        let mut handled = 0;
        while handled < max {
            match inbound.try_recv() {
                Ok(message) => {
                    self.handle_message(&message);
                    handled += 1;
                }
                Err(_) => break,
            }
        }
        handled
    }

    fn handle_ping(&mut self, message: &ChannelMessage) -> Dispatch {
        let sent_at = match decode_ping(&message.data) {
            Ok(sent_at) => sent_at,
            Err(err) => return drop_frame(message, &err),
        };
        self.account_recv(TrafficBucket::Ping, message.data.len());
        let rtt = self.latency.record(sent_at, now_millis());
        trace!(rtt_ms = rtt, "latency probe returned");
        Dispatch::Ping
    }

    fn dispatch_payload(&mut self, alias: &str, body: &[u8], message: &ChannelMessage) -> Dispatch {
        let header = match decode_data_header(body) {
            Ok(header) => header,
            Err(err) => return drop_frame(message, &err),
        };
        let category = match header.category() {
            Some(category) if category != Category::Unknown => category,
            _ => {
                debug!(tag = header.tag, from = alias, "Ignoring payload category");
                return Dispatch::Ignored;
            }
        };
        let payload = match decode_payload(category, body) {
            Ok(payload) => payload,
            Err(err) => return drop_frame(message, &err),
        };

        match payload {
            Payload::Position(data) => invoke(&mut self.position_handler, alias, data, category),
            Payload::Profile(data) => invoke(&mut self.profile_handler, alias, data, category),
            Payload::Chat(data) => invoke(&mut self.chat_handler, alias, data, category),
            Payload::SceneMessage(data) => {
                invoke(&mut self.scene_message_handler, alias, data, category)
            }
        }
    }

    fn ensure_sendable(&self, kind: ChannelKind) -> Result<(), CommsError> {
        if self.closed {
            return Err(CommsError::Closed);
        }
        if !self.channels.has_channel(kind) {
            return Err(CommsError::ChannelUnavailable(kind));
        }
        Ok(())
    }

    fn account_sent(&self, category: Category, bytes: usize) {
        if let Some(stats) = &self.stats {
            stats.increment_sent(TrafficBucket::Topic, 1, bytes);
            stats.increment_sent(TrafficBucket::for_category(category), 1, bytes);
        }
    }

    /// Single accounting point for TOPIC and DATA frames: the topic bucket, plus the
    /// bucket the dispatch outcome maps to. Dropped frames only count as topic traffic.
    fn account_recv_payload(&self, dispatch: Dispatch, bytes: usize) {
        let bucket = match dispatch {
            Dispatch::Delivered(category) | Dispatch::Unhandled(category) => {
                Some(TrafficBucket::for_category(category))
            }
            Dispatch::Ignored => Some(TrafficBucket::Others),
            Dispatch::Ping | Dispatch::Dropped => None,
        };
        self.account_recv(TrafficBucket::Topic, bytes);
        if let Some(bucket) = bucket {
            self.account_recv(bucket, bytes);
        }
    }

    fn account_recv(&self, bucket: TrafficBucket, bytes: usize) {
        if let Some(stats) = &self.stats {
            stats.increment_recv(bucket, bytes);
        }
    }
}

impl SubscriptionSink for Connection {
    fn update_subscriptions(&self, topics: &BTreeSet<Topic>) -> Result<(), CommsError> {
        Connection::update_subscriptions(self, topics)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

fn drop_frame(message: &ChannelMessage, err: &CommsError) -> Dispatch {
    warn!(
        channel = %message.channel,
        size = message.data.len(),
        "Dropping frame: {err}"
    );
    Dispatch::Dropped
}

fn invoke<T>(
    handler: &mut Option<Handler<T>>,
    alias: &str,
    data: T,
    category: Category,
) -> Dispatch {
    let Some(handler) = handler.as_mut() else {
        trace!(?category, from = alias, "no handler registered");
        return Dispatch::Unhandled(category);
    };
    match catch_unwind(AssertUnwindSafe(|| handler(alias, data))) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(?category, from = alias, "Handler failed: {err:#}"),
        Err(_) => warn!(?category, from = alias, "Handler panicked"),
    }
    Dispatch::Delivered(category)
}
