//! Layered binary wire format.
//!
//! Every frame starts with a one-byte message kind that can be read without
//! touching the rest of the frame. Envelopes nest as
//! `header -> topic -> data -> category payload`:
//!
//! ```text
//! ping          [kind=1][send_time_millis: u64]
//! topic         [kind=2][topic: str][body: bytes]
//! data          [kind=3][from_alias: str][body: bytes]
//! subscription  [kind=4][format: u8][topics: bytes]
//! payload       [category: u8][record: postcard]
//! ```
//!
//! Integers are big-endian; `str`/`bytes` fields carry a `u32` big-endian length
//! prefix. Unknown kind and category tags decode successfully and are surfaced as
//! raw tags so the caller can ignore them; only truncated or inconsistent bytes
//! produce [`CommsError::MalformedFrame`].

use crate::{CommsError, FrameLayer};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use worldcomms_core::Position;

/// Smallest decodable frame: the kind tag alone.
pub const MIN_HEADER_LEN: usize = 1;

/// Connection-level message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// Explicitly unknown kind; counted and ignored.
    Unknown = 0,
    /// Latency probe.
    Ping = 1,
    /// Topic-addressed data.
    Topic = 2,
    /// Alias-tagged data on a subscribed topic.
    Data = 3,
    /// Bulk subscribe announcement.
    TopicSubscription = 4,
}

impl MessageKind {
    /// Stable wire tag.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Map a wire tag back to a kind, `None` for tags this build does not know.
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Unknown),
            1 => Some(Self::Ping),
            2 => Some(Self::Topic),
            3 => Some(Self::Data),
            4 => Some(Self::TopicSubscription),
            _ => None,
        }
    }
}

/// Payload schema carried inside a data envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Category {
    /// Explicitly unknown category.
    Unknown = 0,
    /// Avatar pose.
    Position = 1,
    /// User profile announcement.
    Profile = 2,
    /// Chat line.
    Chat = 3,
    /// Scene-to-scene message.
    SceneMessage = 4,
}

impl Category {
    /// Stable wire tag.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Map a wire tag back to a category, `None` for unrecognised tags.
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Unknown),
            1 => Some(Self::Position),
            2 => Some(Self::Profile),
            3 => Some(Self::Chat),
            4 => Some(Self::SceneMessage),
            _ => None,
        }
    }
}

/// Format of a topic subscription list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SubscriptionFormat {
    /// Space-separated UTF-8 topic names.
    Plain = 0,
}

/// Decoded connection header: the raw kind tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Raw tag as read from the wire.
    pub tag: u8,
}

impl Header {
    /// Known kind for this tag, if any.
    pub fn kind(&self) -> Option<MessageKind> {
        MessageKind::from_u8(self.tag)
    }
}

/// Decoded category header: the raw category tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    /// Raw tag as read from the wire.
    pub tag: u8,
}

impl DataHeader {
    /// Known category for this tag, if any.
    pub fn category(&self) -> Option<Category> {
        Category::from_u8(self.tag)
    }
}

/// Borrowed view of a decoded topic envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopicFrame<'a> {
    /// Routing topic.
    pub topic: &'a str,
    /// Opaque body.
    pub body: &'a [u8],
}

/// Borrowed view of a decoded data envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataFrame<'a> {
    /// Alias of the sending peer.
    pub from_alias: &'a str,
    /// Category payload.
    pub body: &'a [u8],
}

/// Position sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PositionData {
    /// Sender wall-clock time in milliseconds.
    pub time_millis: u64,
    /// Avatar pose.
    pub position: Position,
}

/// Profile announcement. Absent fields were not set by the sender.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileData {
    /// Sender wall-clock time in milliseconds.
    pub time_millis: u64,
    /// Avatar type identifier.
    pub avatar_type: Option<String>,
    /// Human-readable name.
    pub display_name: Option<String>,
    /// Public key of the user identity.
    pub public_key: Option<String>,
}

/// Chat line or scene message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatData {
    /// Sender wall-clock time in milliseconds.
    pub time_millis: u64,
    /// Message identifier (scene id for scene messages).
    pub message_id: String,
    /// Message body.
    pub text: String,
}

/// A typed category payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Avatar pose.
    Position(PositionData),
    /// Profile announcement.
    Profile(ProfileData),
    /// Chat line.
    Chat(ChatData),
    /// Scene-to-scene message.
    SceneMessage(ChatData),
}

impl Payload {
    /// Category tag written in front of this payload.
    pub fn category(&self) -> Category {
        match self {
            Payload::Position(_) => Category::Position,
            Payload::Profile(_) => Category::Profile,
            Payload::Chat(_) => Category::Chat,
            Payload::SceneMessage(_) => Category::SceneMessage,
        }
    }
}

/// Encode a bare header.
pub fn encode_header(kind: MessageKind) -> Vec<u8> {
    vec![kind.as_u8()]
}

/// Read the kind tag of any frame.
pub fn decode_header(data: &[u8]) -> Result<Header, CommsError> {
    match data.first() {
        Some(&tag) => Ok(Header { tag }),
        None => Err(CommsError::malformed(
            FrameLayer::Header,
            format!("frame too short: 0 bytes (minimum {MIN_HEADER_LEN})"),
        )),
    }
}

/// Encode a latency probe carrying the sender's clock.
pub fn encode_ping(send_time_millis: u64) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + 8);
    frame.push(MessageKind::Ping.as_u8());
    frame.extend_from_slice(&send_time_millis.to_be_bytes());
    frame
}

/// Decode a latency probe, returning the embedded send time.
pub fn decode_ping(data: &[u8]) -> Result<u64, CommsError> {
    let mut reader = Reader::new(data, FrameLayer::Ping);
    reader.expect_tag(MessageKind::Ping.as_u8())?;
    let time = reader.u64()?;
    reader.finish()?;
    Ok(time)
}

/// Wrap `body` in a topic envelope tagged with `kind`.
pub fn encode_topic_envelope(kind: MessageKind, topic: &str, body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + 4 + topic.len() + 4 + body.len());
    frame.push(kind.as_u8());
    put_bytes(&mut frame, topic.as_bytes());
    put_bytes(&mut frame, body);
    frame
}

/// Decode a topic envelope. The kind tag is skipped; callers branch on it via
/// [`decode_header`] first.
pub fn decode_topic_envelope(data: &[u8]) -> Result<TopicFrame<'_>, CommsError> {
    let mut reader = Reader::new(data, FrameLayer::Topic);
    reader.u8()?;
    let topic = reader.str()?;
    let body = reader.bytes()?;
    reader.finish()?;
    Ok(TopicFrame { topic, body })
}

/// Wrap `body` in a data envelope from `from_alias`.
pub fn encode_data_envelope(from_alias: &str, body: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(1 + 4 + from_alias.len() + 4 + body.len());
    frame.push(MessageKind::Data.as_u8());
    put_bytes(&mut frame, from_alias.as_bytes());
    put_bytes(&mut frame, body);
    frame
}

/// Decode a data envelope.
pub fn decode_data_envelope(data: &[u8]) -> Result<DataFrame<'_>, CommsError> {
    let mut reader = Reader::new(data, FrameLayer::Data);
    reader.expect_tag(MessageKind::Data.as_u8())?;
    let from_alias = reader.str()?;
    let body = reader.bytes()?;
    reader.finish()?;
    Ok(DataFrame { from_alias, body })
}

/// Reject topics the plain list format cannot carry: empty ones, or ones containing
/// whitespace (the list separator).
pub fn check_subscription_topic(topic: &str) -> Result<(), CommsError> {
    if topic.is_empty() {
        return Err(CommsError::malformed(FrameLayer::Subscription, "empty topic"));
    }
    if topic.chars().any(char::is_whitespace) {
        return Err(CommsError::malformed(
            FrameLayer::Subscription,
            format!("topic {topic:?} contains whitespace"),
        ));
    }
    Ok(())
}

/// Encode a plain-format topic subscription frame.
///
/// Topics are not checked here; see [`check_subscription_topic`].
pub fn encode_subscription<'a, I>(topics: I) -> Vec<u8>
where
    I: IntoIterator<Item = &'a str>,
{
    let joined = topics.into_iter().collect::<Vec<_>>().join(" ");
    let mut frame = Vec::with_capacity(1 + 1 + 4 + joined.len());
    frame.push(MessageKind::TopicSubscription.as_u8());
    frame.push(SubscriptionFormat::Plain as u8);
    put_bytes(&mut frame, joined.as_bytes());
    frame
}

/// Decode a topic subscription frame into its topic list.
pub fn decode_subscription(data: &[u8]) -> Result<Vec<String>, CommsError> {
    let mut reader = Reader::new(data, FrameLayer::Subscription);
    reader.expect_tag(MessageKind::TopicSubscription.as_u8())?;
    let format = reader.u8()?;
    if format != SubscriptionFormat::Plain as u8 {
        return Err(CommsError::malformed(
            FrameLayer::Subscription,
            format!("unsupported topic list format {format}"),
        ));
    }
    let topics = reader.str()?;
    reader.finish()?;
    Ok(topics.split_whitespace().map(str::to_owned).collect())
}

/// Read the category tag of a payload.
pub fn decode_data_header(body: &[u8]) -> Result<DataHeader, CommsError> {
    match body.first() {
        Some(&tag) => Ok(DataHeader { tag }),
        None => Err(CommsError::malformed(FrameLayer::Payload, "empty payload")),
    }
}

/// Encode a typed payload with its category tag.
pub fn encode_payload(payload: &Payload) -> Result<Vec<u8>, CommsError> {
    let category = payload.category();
    match payload {
        Payload::Position(data) => encode_record(category, data),
        Payload::Profile(data) => encode_record(category, data),
        Payload::Chat(data) | Payload::SceneMessage(data) => encode_record(category, data),
    }
}

/// Decode a payload as `category`. Fails if the bytes carry any other category.
pub fn decode_payload(category: Category, body: &[u8]) -> Result<Payload, CommsError> {
    match category {
        Category::Position => decode_position(body).map(Payload::Position),
        Category::Profile => decode_profile(body).map(Payload::Profile),
        Category::Chat => decode_chat(body).map(Payload::Chat),
        Category::SceneMessage => decode_scene_message(body).map(Payload::SceneMessage),
        Category::Unknown => Err(CommsError::malformed(
            FrameLayer::Payload,
            "unknown category has no schema",
        )),
    }
}

/// Decode a position payload.
pub fn decode_position(body: &[u8]) -> Result<PositionData, CommsError> {
    decode_record(Category::Position, body)
}

/// Decode a profile payload.
pub fn decode_profile(body: &[u8]) -> Result<ProfileData, CommsError> {
    decode_record(Category::Profile, body)
}

/// Decode a chat payload.
pub fn decode_chat(body: &[u8]) -> Result<ChatData, CommsError> {
    decode_record(Category::Chat, body)
}

/// Decode a scene message payload.
pub fn decode_scene_message(body: &[u8]) -> Result<ChatData, CommsError> {
    decode_record(Category::SceneMessage, body)
}

fn encode_record<T: Serialize>(category: Category, record: &T) -> Result<Vec<u8>, CommsError> {
    let encoded = postcard::to_allocvec(record)?;
    let mut body = Vec::with_capacity(1 + encoded.len());
    body.push(category.as_u8());
    body.extend_from_slice(&encoded);
    Ok(body)
}

fn decode_record<T: DeserializeOwned>(category: Category, body: &[u8]) -> Result<T, CommsError> {
    let header = decode_data_header(body)?;
    if header.tag != category.as_u8() {
        return Err(CommsError::malformed(
            FrameLayer::Payload,
            format!("expected {category:?} payload, found category tag {}", header.tag),
        ));
    }
    let (record, rest) = postcard::take_from_bytes::<T>(&body[1..]).map_err(|err| {
        CommsError::malformed(FrameLayer::Payload, format!("{category:?} record: {err}"))
    })?;
    if !rest.is_empty() {
        return Err(CommsError::malformed(
            FrameLayer::Payload,
            format!("{} trailing bytes after {category:?} record", rest.len()),
        ));
    }
    Ok(record)
}

fn put_bytes(frame: &mut Vec<u8>, bytes: &[u8]) {
    debug_assert!(bytes.len() <= u32::MAX as usize);
    frame.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    frame.extend_from_slice(bytes);
}

/// Bounds-checked cursor over a frame.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    layer: FrameLayer,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8], layer: FrameLayer) -> Self {
        Self {
            data,
            pos: 0,
            layer,
        }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], CommsError> {
        let remaining = self.data.len() - self.pos;
        if len > remaining {
            return Err(CommsError::malformed(
                self.layer,
                format!(
                    "truncated at byte {}: need {len}, have {remaining}",
                    self.pos
                ),
            ));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, CommsError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, CommsError> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4)?);
        Ok(u32::from_be_bytes(buf))
    }

    fn u64(&mut self) -> Result<u64, CommsError> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(buf))
    }

    fn bytes(&mut self) -> Result<&'a [u8], CommsError> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    fn str(&mut self) -> Result<&'a str, CommsError> {
        let bytes = self.bytes()?;
        std::str::from_utf8(bytes)
            .map_err(|err| CommsError::malformed(self.layer, format!("invalid utf-8: {err}")))
    }

    fn expect_tag(&mut self, expected: u8) -> Result<(), CommsError> {
        let tag = self.u8()?;
        if tag != expected {
            return Err(CommsError::malformed(
                self.layer,
                format!("unexpected message kind {tag} (wanted {expected})"),
            ));
        }
        Ok(())
    }

    fn finish(&self) -> Result<(), CommsError> {
        if self.pos != self.data.len() {
            return Err(CommsError::malformed(
                self.layer,
                format!("{} trailing bytes", self.data.len() - self.pos),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat(text: &str) -> ChatData {
        ChatData {
            time_millis: 1_700_000_000_000,
            message_id: "m1".into(),
            text: text.into(),
        }
    }

    #[test]
    fn header_reads_only_first_byte() {
        let frame = encode_topic_envelope(MessageKind::Topic, "37:37", b"payload");
        assert_eq!(decode_header(&frame).unwrap().kind(), Some(MessageKind::Topic));
        assert_eq!(decode_header(&[3]).unwrap().kind(), Some(MessageKind::Data));
    }

    #[test]
    fn empty_frame_is_malformed() {
        let err = decode_header(&[]).unwrap_err();
        assert!(err.is_malformed());
    }

    #[test]
    fn unknown_tags_are_not_errors() {
        let header = decode_header(&[200, 1, 2]).expect("decodes");
        assert_eq!(header.tag, 200);
        assert_eq!(header.kind(), None);

        let data_header = decode_data_header(&[99]).expect("decodes");
        assert_eq!(data_header.category(), None);
    }

    #[test]
    fn ping_roundtrip() {
        assert_eq!(decode_ping(&encode_ping(0)).unwrap(), 0);
        assert_eq!(decode_ping(&encode_ping(u64::MAX)).unwrap(), u64::MAX);
        assert!(decode_ping(&encode_ping(5)[..5]).is_err());
    }

    #[test]
    fn topic_envelope_roundtrip() {
        let frame = encode_topic_envelope(MessageKind::Topic, "scene-1", &[1, 2, 3]);
        let decoded = decode_topic_envelope(&frame).unwrap();
        assert_eq!(decoded.topic, "scene-1");
        assert_eq!(decoded.body, &[1, 2, 3]);

        let empty = encode_topic_envelope(MessageKind::Topic, "", &[]);
        let decoded = decode_topic_envelope(&empty).unwrap();
        assert_eq!(decoded.topic, "");
        assert!(decoded.body.is_empty());
    }

    #[test]
    fn data_envelope_roundtrip() {
        let frame = encode_data_envelope("42", b"body");
        let decoded = decode_data_envelope(&frame).unwrap();
        assert_eq!(decoded.from_alias, "42");
        assert_eq!(decoded.body, b"body");
    }

    #[test]
    fn data_envelope_rejects_other_kinds() {
        let frame = encode_topic_envelope(MessageKind::Topic, "42", b"body");
        assert!(decode_data_envelope(&frame).is_err());
    }

    #[test]
    fn envelope_length_overrun_is_malformed() {
        let mut frame = encode_data_envelope("alias", b"body");
        frame.truncate(frame.len() - 1);
        let err = decode_data_envelope(&frame).unwrap_err();
        assert!(matches!(
            err,
            CommsError::MalformedFrame {
                layer: FrameLayer::Data,
                ..
            }
        ));
    }

    #[test]
    fn envelope_rejects_invalid_utf8_topic() {
        let mut frame = vec![MessageKind::Topic.as_u8()];
        frame.extend_from_slice(&2u32.to_be_bytes());
        frame.extend_from_slice(&[0xff, 0xfe]);
        frame.extend_from_slice(&0u32.to_be_bytes());
        assert!(decode_topic_envelope(&frame).is_err());
    }

    #[test]
    fn subscription_roundtrip() {
        let frame = encode_subscription(["37:37", "37:38", "scene-1"]);
        assert_eq!(
            decode_header(&frame).unwrap().kind(),
            Some(MessageKind::TopicSubscription)
        );
        assert_eq!(
            decode_subscription(&frame).unwrap(),
            vec!["37:37", "37:38", "scene-1"]
        );
        assert!(decode_subscription(&encode_subscription([])).unwrap().is_empty());
    }

    #[test]
    fn unlistable_topics_are_rejected() {
        assert!(check_subscription_topic("37:37").is_ok());
        assert!(check_subscription_topic("scene-1").is_ok());
        for bad in ["", "my scene", " lead", "new\nline"] {
            let err = check_subscription_topic(bad).unwrap_err();
            assert!(err.is_malformed(), "{bad:?} accepted");
        }
    }

    #[test]
    fn subscription_rejects_unknown_format() {
        let mut frame = encode_subscription(["a"]);
        frame[1] = 7;
        assert!(decode_subscription(&frame).is_err());
    }

    #[test]
    fn payload_roundtrip_boundary_values() {
        let payloads = vec![
            Payload::Position(PositionData {
                time_millis: 0,
                position: Position::at(f32::MAX, f32::MIN, -f32::MAX)
                    .with_rotation(0.0, 0.0, 0.0, 1.0),
            }),
            Payload::Profile(ProfileData::default()),
            Payload::Profile(ProfileData {
                time_millis: u64::MAX,
                avatar_type: Some("fox".into()),
                display_name: Some("Ünïcödé".into()),
                public_key: Some("0xabc".into()),
            }),
            Payload::Chat(chat("")),
            Payload::Chat(chat("hi")),
            Payload::SceneMessage(chat("door opened")),
        ];
        for payload in payloads {
            let body = encode_payload(&payload).unwrap();
            let header = decode_data_header(&body).unwrap();
            assert_eq!(header.category(), Some(payload.category()));
            let decoded = decode_payload(payload.category(), &body).unwrap();
            assert_eq!(decoded, payload);
        }
    }

    #[test]
    fn cross_category_decode_fails() {
        let chat_body = encode_payload(&Payload::Chat(chat("hi"))).unwrap();
        assert!(decode_scene_message(&chat_body).unwrap_err().is_malformed());
        assert!(decode_position(&chat_body).is_err());
        assert!(decode_profile(&chat_body).is_err());

        let position_body = encode_payload(&Payload::Position(PositionData {
            time_millis: 1,
            position: Position::at(1.0, 2.0, 3.0),
        }))
        .unwrap();
        assert!(decode_chat(&position_body).is_err());
    }

    #[test]
    fn truncated_payload_is_malformed() {
        let body = encode_payload(&Payload::Chat(chat("hello there"))).unwrap();
        for len in 0..body.len() {
            assert!(decode_chat(&body[..len]).is_err(), "prefix of {len} bytes decoded");
        }
    }

    #[test]
    fn trailing_payload_bytes_are_malformed() {
        let mut body = encode_payload(&Payload::Chat(chat("hi"))).unwrap();
        body.push(0);
        assert!(decode_chat(&body).is_err());
    }

    #[test]
    fn unknown_category_has_no_schema() {
        assert!(decode_payload(Category::Unknown, &[0]).is_err());
    }
}
