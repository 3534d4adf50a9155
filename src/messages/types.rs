use crate::error::BridgeError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Closed set of message types exchanged on the bridge
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    UserInput,
    AiResponse,
    SystemStatus,
    ThinkingStart,
    ThinkingChunk,
    ThinkingEnd,
    ResponseStart,
    ResponseChunk,
    ResponseEnd,
    Error,
}

impl MessageType {
    const NAMES: [(&'static str, MessageType); 10] = [
        ("UserInput", MessageType::UserInput),
        ("AiResponse", MessageType::AiResponse),
        ("SystemStatus", MessageType::SystemStatus),
        ("ThinkingStart", MessageType::ThinkingStart),
        ("ThinkingChunk", MessageType::ThinkingChunk),
        ("ThinkingEnd", MessageType::ThinkingEnd),
        ("ResponseStart", MessageType::ResponseStart),
        ("ResponseChunk", MessageType::ResponseChunk),
        ("ResponseEnd", MessageType::ResponseEnd),
        ("Error", MessageType::Error),
    ];

    /// Wire name of the type
    pub fn as_str(&self) -> &'static str {
        Self::NAMES
            .iter()
            .find(|(_, t)| t == self)
            .map(|(name, _)| *name)
            .unwrap_or("Error")
    }

    /// Parse a wire name; unknown names are rejected
    pub fn parse(name: &str) -> Option<Self> {
        Self::NAMES
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, t)| *t)
    }

    /// Stream channel for Thinking*/Response* types
    pub fn stream_channel(&self) -> Option<StreamChannel> {
        match self {
            MessageType::ThinkingStart | MessageType::ThinkingChunk | MessageType::ThinkingEnd => {
                Some(StreamChannel::Thinking)
            }
            MessageType::ResponseStart | MessageType::ResponseChunk | MessageType::ResponseEnd => {
                Some(StreamChannel::Response)
            }
            _ => None,
        }
    }

    /// Whether this type belongs to a streamed answer
    pub fn is_stream(&self) -> bool {
        self.stream_channel().is_some()
    }

    /// Start/End markers carry no text
    pub fn is_marker(&self) -> bool {
        matches!(
            self,
            MessageType::ThinkingStart
                | MessageType::ThinkingEnd
                | MessageType::ResponseStart
                | MessageType::ResponseEnd
        )
    }

    /// End markers close their channel
    pub fn is_end(&self) -> bool {
        matches!(self, MessageType::ThinkingEnd | MessageType::ResponseEnd)
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a message originated; decides display vs. re-processing
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageSource {
    /// Typed into the chat surface
    TypedInput,
    /// Spoken on the voice surface and transcribed here
    VoiceSurfaceSpeech,
    /// Hotword flow; already answered upstream
    Hotword,
    /// Generated by the system
    System,
}

impl MessageSource {
    const NAMES: [(&'static str, MessageSource); 4] = [
        ("TypedInput", MessageSource::TypedInput),
        ("VoiceSurfaceSpeech", MessageSource::VoiceSurfaceSpeech),
        ("Hotword", MessageSource::Hotword),
        ("System", MessageSource::System),
    ];

    pub fn as_str(&self) -> &'static str {
        Self::NAMES
            .iter()
            .find(|(_, s)| s == self)
            .map(|(name, _)| *name)
            .unwrap_or("System")
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::NAMES
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, s)| *s)
    }
}

/// Channel of a streamed answer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamChannel {
    Thinking,
    Response,
}

/// Opaque identifier of one streamed AI turn
///
/// The wire may carry it as a string or a number; both normalize to text.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random identifier
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<u64> for MessageId {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

impl From<uuid::Uuid> for MessageId {
    fn from(id: uuid::Uuid) -> Self {
        Self(id.to_string())
    }
}

/// Stream metadata attached to Thinking*/Response* messages
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamInfo {
    pub id: MessageId,
    pub is_complete: bool,
}

/// Unit exchanged on the message bridge
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub message_type: MessageType,
    /// Text content; empty for Start/End markers
    pub payload: String,
    /// Origin; `None` only when the wire carried `null`
    pub source: Option<MessageSource>,
    /// Present exactly for streamed types
    pub stream: Option<StreamInfo>,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    fn new(message_type: MessageType, payload: impl Into<String>) -> Self {
        Self {
            message_type,
            payload: payload.into(),
            source: None,
            stream: None,
            timestamp: Utc::now(),
        }
    }

    fn streamed(
        message_type: MessageType,
        id: MessageId,
        payload: impl Into<String>,
        is_complete: bool,
    ) -> Self {
        let mut message = Self::new(message_type, payload);
        message.source = Some(MessageSource::System);
        message.stream = Some(StreamInfo { id, is_complete });
        message
    }

    pub fn user_input(text: impl Into<String>, source: MessageSource) -> Self {
        Self::new(MessageType::UserInput, text).with_source(source)
    }

    pub fn ai_response(text: impl Into<String>) -> Self {
        Self::new(MessageType::AiResponse, text).with_source(MessageSource::System)
    }

    pub fn system_status(text: impl Into<String>) -> Self {
        Self::new(MessageType::SystemStatus, text).with_source(MessageSource::System)
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::new(MessageType::Error, text).with_source(MessageSource::System)
    }

    pub fn thinking_start(id: MessageId) -> Self {
        Self::streamed(MessageType::ThinkingStart, id, "", false)
    }

    pub fn thinking_chunk(id: MessageId, text: impl Into<String>) -> Self {
        Self::streamed(MessageType::ThinkingChunk, id, text, false)
    }

    pub fn thinking_end(id: MessageId) -> Self {
        Self::streamed(MessageType::ThinkingEnd, id, "", true)
    }

    pub fn response_start(id: MessageId) -> Self {
        Self::streamed(MessageType::ResponseStart, id, "", false)
    }

    pub fn response_chunk(id: MessageId, text: impl Into<String>, is_complete: bool) -> Self {
        Self::streamed(MessageType::ResponseChunk, id, text, is_complete)
    }

    pub fn response_end(id: MessageId) -> Self {
        Self::streamed(MessageType::ResponseEnd, id, "", true)
    }

    /// Chunk on the given channel
    pub fn chunk(channel: StreamChannel, id: MessageId, text: impl Into<String>, is_complete: bool) -> Self {
        let message_type = match channel {
            StreamChannel::Thinking => MessageType::ThinkingChunk,
            StreamChannel::Response => MessageType::ResponseChunk,
        };
        Self::streamed(message_type, id, text, is_complete)
    }

    pub fn with_source(mut self, source: MessageSource) -> Self {
        self.source = Some(source);
        self
    }

    /// Decode the JSON wire shape, validating required fields
    pub fn from_json(json: &str) -> Result<Self, BridgeError> {
        let wire: WireMessage = serde_json::from_str(json)
            .map_err(|e| BridgeError::MalformedMessage(format!("invalid JSON: {}", e)))?;
        Self::try_from(wire)
    }

    /// Encode to the JSON wire shape
    pub fn to_json(&self) -> String {
        let wire = WireMessage::from(self);
        // WireMessage contains only strings, bools and options; encoding cannot fail
        serde_json::to_string(&wire).unwrap_or_default()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum WireId {
    Text(String),
    Number(u64),
}

/// Wire shape: `{ type, message, source, messageId?, isComplete? }`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    #[serde(rename = "type")]
    message_type: Option<String>,
    message: Option<String>,
    source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message_id: Option<WireId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    is_complete: Option<bool>,
}

impl TryFrom<WireMessage> for Message {
    type Error = BridgeError;

    fn try_from(wire: WireMessage) -> Result<Self, Self::Error> {
        let type_name = wire
            .message_type
            .ok_or_else(|| BridgeError::MalformedMessage("missing type".into()))?;
        let message_type = MessageType::parse(&type_name)
            .ok_or_else(|| BridgeError::MalformedMessage(format!("unknown type {:?}", type_name)))?;

        let source = match wire.source {
            Some(name) => Some(MessageSource::parse(&name).ok_or_else(|| {
                BridgeError::MalformedMessage(format!("unknown source {:?}", name))
            })?),
            None => None,
        };

        let payload = match (wire.message, message_type.is_marker()) {
            (Some(text), _) => text,
            (None, true) => String::new(),
            (None, false) => {
                return Err(BridgeError::MalformedMessage(format!(
                    "{} without message",
                    message_type
                )))
            }
        };

        let stream = if message_type.is_stream() {
            let id = match wire.message_id {
                Some(WireId::Text(s)) if !s.is_empty() => MessageId::new(s),
                Some(WireId::Number(n)) => MessageId::from(n),
                _ => {
                    return Err(BridgeError::MalformedMessage(format!(
                        "{} without messageId",
                        message_type
                    )))
                }
            };
            let is_complete = wire.is_complete.unwrap_or(false) || message_type.is_end();
            Some(StreamInfo { id, is_complete })
        } else {
            None
        };

        Ok(Message {
            message_type,
            payload,
            source,
            stream,
            timestamp: Utc::now(),
        })
    }
}

impl From<&Message> for WireMessage {
    fn from(message: &Message) -> Self {
        WireMessage {
            message_type: Some(message.message_type.as_str().to_string()),
            message: Some(message.payload.clone()),
            source: message.source.map(|s| s.as_str().to_string()),
            message_id: message
                .stream
                .as_ref()
                .map(|s| WireId::Text(s.id.as_str().to_string())),
            is_complete: message.stream.as_ref().map(|s| s.is_complete),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_user_input() {
        let msg =
            Message::from_json(r#"{"type":"UserInput","message":"hello","source":"TypedInput"}"#)
                .unwrap();
        assert_eq!(msg.message_type, MessageType::UserInput);
        assert_eq!(msg.payload, "hello");
        assert_eq!(msg.source, Some(MessageSource::TypedInput));
        assert!(msg.stream.is_none());
    }

    #[test]
    fn test_decode_null_source() {
        let msg =
            Message::from_json(r#"{"type":"SystemStatus","message":"ready","source":null}"#).unwrap();
        assert_eq!(msg.source, None);
    }

    #[test]
    fn test_missing_type_is_malformed() {
        let err = Message::from_json(r#"{"message":"hello","source":"TypedInput"}"#).unwrap_err();
        assert_eq!(err, BridgeError::MalformedMessage("missing type".into()));
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let err = Message::from_json(r#"{"type":"Shout","message":"hi"}"#).unwrap_err();
        assert!(matches!(err, BridgeError::MalformedMessage(m) if m.contains("Shout")));
    }

    #[test]
    fn test_unknown_source_is_rejected() {
        assert!(Message::from_json(r#"{"type":"UserInput","message":"x","source":"Fax"}"#).is_err());
    }

    #[test]
    fn test_chunk_requires_message_id() {
        assert!(Message::from_json(r#"{"type":"ResponseChunk","message":"x"}"#).is_err());
        assert!(Message::from_json(r#"{"type":"ResponseChunk","message":"x","messageId":""}"#).is_err());
    }

    #[test]
    fn test_numeric_message_id() {
        let msg =
            Message::from_json(r#"{"type":"ThinkingChunk","message":"analyzing","messageId":42}"#)
                .unwrap();
        let stream = msg.stream.unwrap();
        assert_eq!(stream.id, MessageId::from(42));
        assert!(!stream.is_complete);
    }

    #[test]
    fn test_markers_need_no_message() {
        let start = Message::from_json(r#"{"type":"ResponseStart","messageId":"a"}"#).unwrap();
        assert_eq!(start.payload, "");
        let end = Message::from_json(r#"{"type":"ResponseEnd","messageId":"a"}"#).unwrap();
        assert!(end.stream.unwrap().is_complete);
    }

    #[test]
    fn test_text_types_need_message() {
        assert!(Message::from_json(r#"{"type":"AiResponse"}"#).is_err());
    }

    #[test]
    fn test_encode_matches_wire_shape() {
        let json = Message::response_chunk(MessageId::new("7"), "sunny", true).to_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "ResponseChunk");
        assert_eq!(value["message"], "sunny");
        assert_eq!(value["messageId"], "7");
        assert_eq!(value["isComplete"], true);

        let plain = Message::user_input("hi", MessageSource::Hotword).to_json();
        let value: serde_json::Value = serde_json::from_str(&plain).unwrap();
        assert_eq!(value["source"], "Hotword");
        assert!(value.get("messageId").is_none());
    }

    #[test]
    fn test_type_channel_mapping() {
        assert_eq!(MessageType::ThinkingEnd.stream_channel(), Some(StreamChannel::Thinking));
        assert_eq!(MessageType::ResponseStart.stream_channel(), Some(StreamChannel::Response));
        assert_eq!(MessageType::AiResponse.stream_channel(), None);
        assert!(MessageType::ResponseEnd.is_end());
        assert!(!MessageType::ResponseChunk.is_marker());
    }

    #[test]
    fn test_type_names_round_trip() {
        for (name, ty) in MessageType::NAMES {
            assert_eq!(ty.as_str(), name);
            assert_eq!(MessageType::parse(name), Some(ty));
        }
    }
}
